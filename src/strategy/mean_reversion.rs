//! Mean-reversion strategy
//!
//! In quiet ranging regimes the binary mid oscillates around a slow-moving
//! anchor; stretched prints tend to come back. Fades deviations from the
//! rolling mean, and only when the regime detector calls the tape
//! mean-reversion friendly.

use std::collections::VecDeque;

use serde_json::json;

use super::{Signal, SignalAction, Strategy, StrategyContext};
use crate::models::{Direction, Tick};
use crate::position::Position;
use crate::quant::CombinedRegime;

#[derive(Debug, Clone)]
pub struct MeanReversionConfig {
    /// Rolling window over the market mid
    pub lookback: usize,
    /// Deviation from the rolling mean that triggers a fade
    pub entry_deviation: f64,
    /// Regimes other than MEAN_REVERSION_FAVORABLE are skipped unless this
    /// is set
    pub trade_any_regime: bool,
    pub size_scale: f64,
}

impl Default for MeanReversionConfig {
    fn default() -> Self {
        Self {
            lookback: 20,
            entry_deviation: 0.08,
            trade_any_regime: false,
            size_scale: 0.75,
        }
    }
}

/// Fades stretched mids in quiet regimes
pub struct MeanReversion {
    config: MeanReversionConfig,
    mids: VecDeque<f64>,
}

impl MeanReversion {
    pub fn new(config: MeanReversionConfig) -> Self {
        Self {
            mids: VecDeque::with_capacity(config.lookback + 1),
            config,
        }
    }

    fn rolling_mean(&self) -> Option<f64> {
        if self.mids.len() < self.config.lookback {
            return None;
        }
        Some(self.mids.iter().sum::<f64>() / self.mids.len() as f64)
    }
}

impl Strategy for MeanReversion {
    fn name(&self) -> &'static str {
        "mean_reversion"
    }

    fn on_tick(
        &mut self,
        tick: &Tick,
        open_position: Option<&Position>,
        ctx: &StrategyContext<'_>,
    ) -> Signal {
        let mean = self.rolling_mean();
        self.mids.push_back(tick.up_mid);
        while self.mids.len() > self.config.lookback {
            self.mids.pop_front();
        }

        if open_position.is_some() {
            return Signal::hold("position already open");
        }
        if !self.config.trade_any_regime
            && ctx.regime.combined != CombinedRegime::MeanReversionFavorable
        {
            return Signal::hold(format!(
                "regime {} is not mean-reversion friendly",
                ctx.regime.combined.as_str()
            ));
        }
        let Some(mean) = mean else {
            return Signal::hold(format!(
                "warming up {}/{}",
                self.mids.len(),
                self.config.lookback
            ));
        };

        let deviation = tick.up_mid - mean;
        if deviation.abs() < self.config.entry_deviation {
            return Signal::hold(format!("deviation {deviation:.3} inside band"));
        }

        // stretched up -> fade down, and vice versa
        let direction = if deviation > 0.0 {
            Direction::Down
        } else {
            Direction::Up
        };
        let size = ctx.default_size * self.config.size_scale * ctx.regime.size_multiplier;
        let confidence = (deviation.abs() / (self.config.entry_deviation * 2.0)).clamp(0.1, 0.9);
        Signal::buy(
            direction,
            size,
            confidence,
            format!(
                "mid {:.3} stretched {:.3} from mean {:.3}",
                tick.up_mid, deviation, mean
            ),
        )
        .with_diagnostics(json!({
            "rolling_mean": mean,
            "deviation": deviation,
            "lookback": self.config.lookback,
        }))
    }

    fn on_window_start(&mut self, _window_id: &str) {
        self.mids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::{RegimeConfig, RegimeDetector};
    use crate::strategy::testkit::{neutral_ctx, tick};

    fn favorable_ctx() -> StrategyContext<'static> {
        // low vol + no trend data + thick book = MEAN_REVERSION_FAVORABLE
        let mut det = RegimeDetector::new(RegimeConfig::default());
        for _ in 0..5 {
            det.record("btc", 100.0, Some(20.0));
        }
        let mut ctx = neutral_ctx(0.5);
        ctx.regime = det.assess("btc", 0.1);
        assert_eq!(ctx.regime.combined, CombinedRegime::MeanReversionFavorable);
        ctx
    }

    fn warmed_up(s: &mut MeanReversion, ctx: &StrategyContext<'_>, mid: f64, n: usize) {
        for _ in 0..n {
            let t = tick("btc-15m-2026-01-31-10:00", mid, 600.0);
            s.on_tick(&t, None, ctx);
        }
    }

    #[test]
    fn fades_a_stretched_print() {
        let ctx = favorable_ctx();
        let mut s = MeanReversion::new(MeanReversionConfig::default());
        warmed_up(&mut s, &ctx, 0.50, 20);

        let t = tick("btc-15m-2026-01-31-10:00", 0.62, 600.0);
        let sig = s.on_tick(&t, None, &ctx);
        assert_eq!(sig.action, SignalAction::Buy);
        assert_eq!(sig.side, Some(Direction::Down));

        let mut s = MeanReversion::new(MeanReversionConfig::default());
        warmed_up(&mut s, &ctx, 0.50, 20);
        let t = tick("btc-15m-2026-01-31-10:00", 0.38, 600.0);
        let sig = s.on_tick(&t, None, &ctx);
        assert_eq!(sig.action, SignalAction::Buy);
        assert_eq!(sig.side, Some(Direction::Up));
    }

    #[test]
    fn holds_inside_the_band_and_while_warming() {
        let ctx = favorable_ctx();
        let mut s = MeanReversion::new(MeanReversionConfig::default());
        let t = tick("btc-15m-2026-01-31-10:00", 0.50, 600.0);
        assert_eq!(s.on_tick(&t, None, &ctx).action, SignalAction::Hold);

        warmed_up(&mut s, &ctx, 0.50, 20);
        let t = tick("btc-15m-2026-01-31-10:00", 0.55, 600.0);
        assert_eq!(s.on_tick(&t, None, &ctx).action, SignalAction::Hold);
    }

    #[test]
    fn wrong_regime_is_skipped() {
        let ctx = neutral_ctx(0.5); // NEUTRAL regime
        let mut s = MeanReversion::new(MeanReversionConfig::default());
        warmed_up(&mut s, &ctx, 0.50, 20);
        let t = tick("btc-15m-2026-01-31-10:00", 0.70, 600.0);
        assert_eq!(s.on_tick(&t, None, &ctx).action, SignalAction::Hold);
    }

    #[test]
    fn window_change_clears_history() {
        let ctx = favorable_ctx();
        let mut s = MeanReversion::new(MeanReversionConfig::default());
        warmed_up(&mut s, &ctx, 0.50, 20);
        s.on_window_start("btc-15m-2026-01-31-10:15");
        let t = tick("btc-15m-2026-01-31-10:15", 0.70, 600.0);
        assert_eq!(s.on_tick(&t, None, &ctx).action, SignalAction::Hold);
    }
}
