//! Expiry convergence strategy
//!
//! Windows with a dominant side late in their life resolve that way far more
//! often than not; time decay grinds the laggard side to zero. Buy the
//! dominant side when the model agrees, inside a late-window band that still
//! clears the engine's entry-time floor.

use serde_json::json;

use super::{Signal, SignalAction, Strategy, StrategyContext};
use crate::models::{Direction, Tick};
use crate::position::Position;

#[derive(Debug, Clone)]
pub struct ExpiryConvergenceConfig {
    /// Only act inside this many seconds before resolution
    pub max_time_remaining_sec: f64,
    /// Dominance floor for the leading side's probability
    pub min_dominant_prob: f64,
    /// Model must agree at least this strongly with the dominant side
    pub min_model_agreement: f64,
    pub size_scale: f64,
}

impl Default for ExpiryConvergenceConfig {
    fn default() -> Self {
        Self {
            max_time_remaining_sec: 240.0,
            min_dominant_prob: 0.70,
            min_model_agreement: 0.65,
            size_scale: 0.5,
        }
    }
}

/// Late-window dominant-side taker
pub struct ExpiryConvergence {
    config: ExpiryConvergenceConfig,
}

impl ExpiryConvergence {
    pub fn new(config: ExpiryConvergenceConfig) -> Self {
        Self { config }
    }
}

impl Strategy for ExpiryConvergence {
    fn name(&self) -> &'static str {
        "expiry_convergence"
    }

    fn on_tick(
        &mut self,
        tick: &Tick,
        open_position: Option<&Position>,
        ctx: &StrategyContext<'_>,
    ) -> Signal {
        if open_position.is_some() {
            return Signal::hold("position already open");
        }
        if tick.time_remaining_sec > self.config.max_time_remaining_sec {
            return Signal::hold(format!(
                "{:.0}s remaining, outside the late-window band",
                tick.time_remaining_sec
            ));
        }

        // which side dominates the book?
        let (direction, dominant_prob, model_prob) = if tick.up_mid >= 0.5 {
            (Direction::Up, tick.up_mid, ctx.fair_prob)
        } else {
            (Direction::Down, 1.0 - tick.up_mid, 1.0 - ctx.fair_prob)
        };

        if dominant_prob < self.config.min_dominant_prob {
            return Signal::hold(format!(
                "dominant side at {dominant_prob:.2}, below floor"
            ));
        }
        if model_prob < self.config.min_model_agreement {
            return Signal::hold(format!(
                "model only gives the dominant side {model_prob:.2}"
            ));
        }
        if ctx.regime.size_multiplier <= 0.0 {
            return Signal::hold(format!(
                "regime {} vetoes entries",
                ctx.regime.combined.as_str()
            ));
        }

        let size = ctx.default_size * self.config.size_scale * ctx.regime.size_multiplier;
        let confidence = (dominant_prob * model_prob).clamp(0.1, 0.98);
        Signal::buy(
            direction,
            size,
            confidence,
            format!(
                "dominant {} at {:.2} with model {:.2}, {:.0}s to resolution",
                direction.as_str(),
                dominant_prob,
                model_prob,
                tick.time_remaining_sec
            ),
        )
        .with_diagnostics(json!({
            "dominant_prob": dominant_prob,
            "model_prob": model_prob,
            "time_remaining_sec": tick.time_remaining_sec,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::testkit::{neutral_ctx, tick};

    fn strategy() -> ExpiryConvergence {
        ExpiryConvergence::new(ExpiryConvergenceConfig::default())
    }

    #[test]
    fn buys_dominant_up_side_late() {
        let mut s = strategy();
        let t = tick("btc-15m-2026-01-31-10:00", 0.78, 180.0);
        let sig = s.on_tick(&t, None, &neutral_ctx(0.80));
        assert_eq!(sig.action, SignalAction::Buy);
        assert_eq!(sig.side, Some(Direction::Up));
    }

    #[test]
    fn buys_dominant_down_side() {
        let mut s = strategy();
        let t = tick("btc-15m-2026-01-31-10:00", 0.20, 180.0);
        // fair prob of UP is 0.15, so the model gives DOWN 0.85
        let sig = s.on_tick(&t, None, &neutral_ctx(0.15));
        assert_eq!(sig.action, SignalAction::Buy);
        assert_eq!(sig.side, Some(Direction::Down));
    }

    #[test]
    fn early_window_is_ignored() {
        let mut s = strategy();
        let t = tick("btc-15m-2026-01-31-10:00", 0.80, 700.0);
        let sig = s.on_tick(&t, None, &neutral_ctx(0.85));
        assert_eq!(sig.action, SignalAction::Hold);
    }

    #[test]
    fn weak_dominance_or_model_disagreement_holds() {
        let mut s = strategy();
        // book barely leans up
        let t = tick("btc-15m-2026-01-31-10:00", 0.60, 180.0);
        let sig = s.on_tick(&t, None, &neutral_ctx(0.80));
        assert_eq!(sig.action, SignalAction::Hold);

        // book dominant but the model calls it a coin flip
        let t = tick("btc-15m-2026-01-31-10:00", 0.75, 180.0);
        let sig = s.on_tick(&t, None, &neutral_ctx(0.50));
        assert_eq!(sig.action, SignalAction::Hold);
    }
}
