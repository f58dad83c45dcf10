//! Fair-value edge strategy
//!
//! Buys the side the model says the market underprices, once the gap has
//! persisted for a few consecutive ticks. Holding a position, it watches for
//! the edge flipping against the book and asks for an exit.

use serde_json::json;

use super::{Signal, SignalAction, Strategy, StrategyContext};
use crate::models::{Direction, Side, Tick};
use crate::position::Position;
use crate::quant::classify_edge;

#[derive(Debug, Clone)]
pub struct FairValueEdgeConfig {
    /// Consecutive ticks the edge must persist before entering
    pub min_persistence_ticks: u32,
    /// Extra edge required beyond the engine-wide threshold
    pub edge_margin: f64,
    /// Reversed edge that requests an exit while holding
    pub exit_edge: f64,
    pub size_scale: f64,
}

impl Default for FairValueEdgeConfig {
    fn default() -> Self {
        Self {
            min_persistence_ticks: 2,
            edge_margin: 0.0,
            exit_edge: 0.05,
            size_scale: 1.0,
        }
    }
}

/// Model-vs-market edge taker
pub struct FairValueEdge {
    config: FairValueEdgeConfig,
    streak_direction: Option<Direction>,
    streak_len: u32,
}

impl FairValueEdge {
    pub fn new(config: FairValueEdgeConfig) -> Self {
        Self {
            config,
            streak_direction: None,
            streak_len: 0,
        }
    }

    fn track_streak(&mut self, direction: Option<Direction>) -> u32 {
        match (direction, self.streak_direction) {
            (Some(d), Some(prev)) if d == prev => self.streak_len += 1,
            (Some(d), _) => {
                self.streak_direction = Some(d);
                self.streak_len = 1;
            }
            (None, _) => {
                self.streak_direction = None;
                self.streak_len = 0;
            }
        }
        self.streak_len
    }
}

impl Strategy for FairValueEdge {
    fn name(&self) -> &'static str {
        "fair_value_edge"
    }

    fn on_tick(
        &mut self,
        tick: &Tick,
        open_position: Option<&Position>,
        ctx: &StrategyContext<'_>,
    ) -> Signal {
        let threshold = ctx.edge_threshold + self.config.edge_margin;
        let call = classify_edge(ctx.fair_prob, tick.up_mid, threshold);

        if let Some(position) = open_position {
            // exit request when the model now prices the held side as rich
            let adverse = match position.side {
                Side::Long => tick.up_mid - ctx.fair_prob,
                Side::Short => ctx.fair_prob - tick.up_mid,
            };
            if adverse >= self.config.exit_edge {
                return Signal::sell(
                    position.size,
                    (adverse / self.config.exit_edge).clamp(0.0, 1.0),
                    format!("edge reversed {:.3} against held side", adverse),
                )
                .with_diagnostics(json!({
                    "fair_prob": ctx.fair_prob,
                    "market_prob": tick.up_mid,
                }));
            }
            return Signal::hold("position already open");
        }

        let Some(call) = call else {
            self.track_streak(None);
            return Signal::hold(format!(
                "edge below threshold {:.3}",
                threshold
            ));
        };

        let streak = self.track_streak(Some(call.direction));
        if streak < self.config.min_persistence_ticks {
            return Signal::hold(format!(
                "edge persisting {streak}/{} ticks",
                self.config.min_persistence_ticks
            ));
        }

        if ctx.regime.size_multiplier <= 0.0 {
            return Signal::hold(format!(
                "regime {} vetoes entries",
                ctx.regime.combined.as_str()
            ));
        }

        let size = ctx.default_size * self.config.size_scale * ctx.regime.size_multiplier;
        let confidence = (call.edge / (threshold * 2.0)).clamp(0.1, 0.95);
        Signal::buy(
            call.direction,
            size,
            confidence,
            format!(
                "fair {:.3} vs market {:.3}, edge {:.3}",
                ctx.fair_prob, tick.up_mid, call.edge
            ),
        )
        .with_diagnostics(json!({
            "edge": call.edge,
            "streak": streak,
            "regime": ctx.regime.combined.as_str(),
            "size_multiplier": ctx.regime.size_multiplier,
        }))
    }

    fn on_window_start(&mut self, _window_id: &str) {
        self.streak_direction = None;
        self.streak_len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PositionStatus, TradeMode};
    use crate::position::LifecycleState;
    use crate::strategy::testkit::{neutral_ctx, tick};

    fn strategy() -> FairValueEdge {
        FairValueEdge::new(FairValueEdgeConfig::default())
    }

    #[test]
    fn needs_persistent_edge_before_buying() {
        let mut s = strategy();
        let t = tick("btc-15m-2026-01-31-10:00", 0.50, 600.0);
        let ctx = neutral_ctx(0.60);

        let first = s.on_tick(&t, None, &ctx);
        assert_eq!(first.action, SignalAction::Hold);

        let second = s.on_tick(&t, None, &ctx);
        assert_eq!(second.action, SignalAction::Buy);
        assert_eq!(second.side, Some(Direction::Up));
        assert!(second.size > 0.0);
        assert!(second.confidence > 0.0);
    }

    #[test]
    fn flipping_edge_resets_the_streak() {
        let mut s = strategy();
        let t = tick("btc-15m-2026-01-31-10:00", 0.50, 600.0);
        s.on_tick(&t, None, &neutral_ctx(0.60));
        // edge flips down; the up streak must not carry over
        let sig = s.on_tick(&t, None, &neutral_ctx(0.40));
        assert_eq!(sig.action, SignalAction::Hold);
        let sig = s.on_tick(&t, None, &neutral_ctx(0.40));
        assert_eq!(sig.action, SignalAction::Buy);
        assert_eq!(sig.side, Some(Direction::Down));
    }

    #[test]
    fn no_edge_means_hold() {
        let mut s = strategy();
        let t = tick("btc-15m-2026-01-31-10:00", 0.50, 600.0);
        for _ in 0..5 {
            let sig = s.on_tick(&t, None, &neutral_ctx(0.51));
            assert_eq!(sig.action, SignalAction::Hold);
        }
    }

    #[test]
    fn window_start_resets_state() {
        let mut s = strategy();
        let t = tick("btc-15m-2026-01-31-10:00", 0.50, 600.0);
        s.on_tick(&t, None, &neutral_ctx(0.60));
        s.on_window_start("btc-15m-2026-01-31-10:15");
        let sig = s.on_tick(&t, None, &neutral_ctx(0.60));
        assert_eq!(sig.action, SignalAction::Hold, "streak must restart");
    }

    #[test]
    fn reversed_edge_requests_exit_while_holding() {
        let mut s = strategy();
        let t = tick("btc-15m-2026-01-31-10:00", 0.60, 600.0);
        let position = Position {
            id: 1,
            window_id: t.window_id.clone(),
            market_id: "m-1".into(),
            token_id: "t-up".into(),
            side: Side::Long,
            size: 10.0,
            entry_price: 0.55,
            current_price: Some(0.60),
            status: PositionStatus::Open,
            strategy_id: Some("fair_value_edge".into()),
            opened_at: 0,
            closed_at: None,
            close_price: None,
            pnl: None,
            exchange_verified_at: None,
            mode: TradeMode::Paper,
            lifecycle_state: Some(LifecycleState::Monitoring),
            high_water_mark: None,
        };

        // model now says 0.50 while market sits at 0.60: held LONG is rich
        let sig = s.on_tick(&t, Some(&position), &neutral_ctx(0.50));
        assert_eq!(sig.action, SignalAction::Sell);
        assert_eq!(sig.size, 10.0);

        // small reversal stays held
        let sig = s.on_tick(&t, Some(&position), &neutral_ctx(0.58));
        assert_eq!(sig.action, SignalAction::Hold);
    }
}
