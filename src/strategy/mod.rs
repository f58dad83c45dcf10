//! Strategy contract
//!
//! Every strategy sees the same per-tick inputs: the tick itself, its own
//! open position on that window (if any), and the shared quant context the
//! orchestrator computed once for the tick. Strategies own their rolling
//! state and nothing else; they never see another strategy's signal and
//! never mutate their inputs.

pub mod expiry_convergence;
pub mod fair_value_edge;
pub mod mean_reversion;
pub mod spot_lag_momentum;

pub use expiry_convergence::{ExpiryConvergence, ExpiryConvergenceConfig};
pub use fair_value_edge::{FairValueEdge, FairValueEdgeConfig};
pub use mean_reversion::{MeanReversion, MeanReversionConfig};
pub use spot_lag_momentum::{SpotLagMomentum, SpotLagMomentumConfig};

use serde_json::Value;

use crate::models::{Direction, Tick};
use crate::position::Position;
use crate::quant::{RegimeAssessment, SpotMoveEvent, VolEstimate};

/// What a strategy wants done with the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "buy",
            SignalAction::Sell => "sell",
            SignalAction::Hold => "hold",
        }
    }
}

/// One strategy verdict for one tick
#[derive(Debug, Clone)]
pub struct Signal {
    pub action: SignalAction,
    pub side: Option<Direction>,
    /// Desired size in shares; 0 for hold
    pub size: f64,
    pub reason: String,
    /// Model confidence in (0,1)
    pub confidence: f64,
    pub diagnostics: Value,
}

impl Signal {
    pub fn hold(reason: impl Into<String>) -> Self {
        Self {
            action: SignalAction::Hold,
            side: None,
            size: 0.0,
            reason: reason.into(),
            confidence: 0.0,
            diagnostics: Value::Null,
        }
    }

    pub fn buy(side: Direction, size: f64, confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            action: SignalAction::Buy,
            side: Some(side),
            size,
            reason: reason.into(),
            confidence,
            diagnostics: Value::Null,
        }
    }

    pub fn sell(size: f64, confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            action: SignalAction::Sell,
            side: None,
            size,
            reason: reason.into(),
            confidence,
            diagnostics: Value::Null,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Value) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn is_actionable(&self) -> bool {
        !matches!(self.action, SignalAction::Hold)
    }
}

/// Shared read-only quant state for one tick
#[derive(Debug, Clone)]
pub struct StrategyContext<'a> {
    /// Model fair probability of UP for this window
    pub fair_prob: f64,
    /// Market-implied volatility backed out from the mid, when solvable
    pub implied_vol: Option<f64>,
    pub vol: VolEstimate,
    pub regime: RegimeAssessment,
    /// Most recent spot move still under lag tracking for this asset
    pub lag_event: Option<&'a SpotMoveEvent>,
    /// Engine-wide tradable-edge floor
    pub edge_threshold: f64,
    /// Base order size before strategy and regime scaling
    pub default_size: f64,
}

/// The uniform tick contract
pub trait Strategy: Send {
    fn name(&self) -> &'static str;

    fn on_tick(
        &mut self,
        tick: &Tick,
        open_position: Option<&Position>,
        ctx: &StrategyContext<'_>,
    ) -> Signal;

    /// Called when the engine first sees a window for this asset
    fn on_window_start(&mut self, _window_id: &str) {}

    /// Called when a window the engine was tracking resolves
    fn on_window_end(&mut self, _window_id: &str) {}
}
