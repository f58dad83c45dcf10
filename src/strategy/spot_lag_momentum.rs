//! Spot-lag momentum strategy
//!
//! When spot has just jumped and the market has not yet repriced, buy the
//! side of the jump and let the catch-up do the work. Entries are only taken
//! while the event is fresh and the captured fraction is still low.

use serde_json::json;

use super::{Signal, SignalAction, Strategy, StrategyContext};
use crate::models::Tick;
use crate::position::Position;

#[derive(Debug, Clone)]
pub struct SpotLagMomentumConfig {
    /// Only chase events younger than this, ms
    pub max_event_age_ms: i64,
    /// Only enter while the market captured less than this fraction
    pub max_captured_frac: f64,
    /// Minimum expected repricing (in probability points) to bother
    pub min_expected_change: f64,
    pub size_scale: f64,
}

impl Default for SpotLagMomentumConfig {
    fn default() -> Self {
        Self {
            max_event_age_ms: 10_000,
            max_captured_frac: 0.5,
            min_expected_change: 0.02,
            size_scale: 1.0,
        }
    }
}

/// Rides detected market underreaction to spot moves
pub struct SpotLagMomentum {
    config: SpotLagMomentumConfig,
    /// t0 of events already acted on; one entry per event
    acted_events: Vec<i64>,
}

impl SpotLagMomentum {
    pub fn new(config: SpotLagMomentumConfig) -> Self {
        Self {
            config,
            acted_events: Vec::new(),
        }
    }
}

impl Strategy for SpotLagMomentum {
    fn name(&self) -> &'static str {
        "spot_lag_momentum"
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
        let Some(event) = ctx.lag_event else {
            return Signal::hold("no live spot move");
        };
        if self.acted_events.contains(&event.t0_ms) {
            return Signal::hold("already acted on this move");
        }

        let age_ms = tick.timestamp - event.t0_ms;
        if age_ms > self.config.max_event_age_ms {
            return Signal::hold(format!("move is {age_ms}ms old, too late to chase"));
        }

        let expected_change = (event.expected_fair_prob - event.market_prob_before).abs();
        if expected_change < self.config.min_expected_change {
            return Signal::hold(format!(
                "expected repricing {expected_change:.3} too small"
            ));
        }

        let captured = event
            .snapshots
            .last()
            .map(|s| s.captured_frac)
            .unwrap_or(0.0);
        if captured >= self.config.max_captured_frac {
            return Signal::hold(format!(
                "market already captured {:.0}% of the move",
                captured * 100.0
            ));
        }

        if ctx.regime.size_multiplier <= 0.0 {
            return Signal::hold(format!(
                "regime {} vetoes entries",
                ctx.regime.combined.as_str()
            ));
        }

        self.acted_events.push(event.t0_ms);
        if self.acted_events.len() > 64 {
            self.acted_events.remove(0);
        }

        let size = ctx.default_size * self.config.size_scale * ctx.regime.size_multiplier;
        let confidence = ((1.0 - captured) * (expected_change / 0.10)).clamp(0.1, 0.9);
        Signal::buy(
            event.direction,
            size,
            confidence,
            format!(
                "spot moved {}, market captured {:.0}% of expected {:.3}",
                event.direction.as_str(),
                captured * 100.0,
                expected_change
            ),
        )
        .with_diagnostics(json!({
            "event_t0_ms": event.t0_ms,
            "age_ms": age_ms,
            "captured_frac": captured,
            "expected_change": expected_change,
        }))
    }
}
