//! Position tracking
//!
//! The `positions` table is the authoritative record of every trade. The
//! manager is its only writer; the lifecycle machine validates state moves;
//! the exit evaluator produces at most one trigger per tick per position.

pub mod exit;
pub mod intent;
pub mod lifecycle;
pub mod manager;

pub use exit::{ExitEvaluator, ExitPolicy, ExitTrigger, ExitTriggerKind};
pub use intent::{IntentRecord, IntentState, IntentStore, IntentType};
pub use lifecycle::{LifecycleMachine, LifecycleState};
pub use manager::{
    CloseOptions, Divergence, DivergenceKind, NewPositionParams, PositionManager, ReconcileReport,
    RiskLimits,
};

use crate::models::{PositionStatus, Side, TradeMode};

/// One persisted position row
#[derive(Debug, Clone)]
pub struct Position {
    pub id: i64,
    pub window_id: String,
    pub market_id: String,
    pub token_id: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub current_price: Option<f64>,
    pub status: PositionStatus,
    pub strategy_id: Option<String>,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
    pub close_price: Option<f64>,
    pub pnl: Option<f64>,
    pub exchange_verified_at: Option<i64>,
    pub mode: TradeMode,
    pub lifecycle_state: Option<LifecycleState>,
    pub high_water_mark: Option<f64>,
}

impl Position {
    /// Mark-to-market P&L against the latest price, when one is known
    pub fn unrealized_pnl(&self) -> Option<f64> {
        let current = self.current_price?;
        Some(match self.side {
            Side::Long => (current - self.entry_price) * self.size,
            Side::Short => (self.entry_price - current) * self.size,
        })
    }

    /// Lifecycle state with the persisted-null default applied
    pub fn lifecycle(&self) -> LifecycleState {
        self.lifecycle_state.unwrap_or(LifecycleState::Monitoring)
    }
}
