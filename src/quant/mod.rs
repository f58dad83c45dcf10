//! Quant core
//!
//! Stateless pricing math plus the per-asset stateful estimators that feed
//! the strategies: volatility, fair-value probability, spot-lag tracking and
//! regime classification.

pub mod fair_value;
pub mod regime;
pub mod spot_lag;
pub mod vol;

pub use fair_value::{classify_edge, fair_probability_up, implied_vol, EdgeCall};
pub use regime::{
    CombinedRegime, LiquidityRegime, RegimeAssessment, RegimeConfig, RegimeDetector, TrendClass,
    VolRegime,
};
pub use spot_lag::{CompletedMove, DirectionStats, SpotLagAnalyzer, SpotLagConfig, SpotMoveEvent};
pub use vol::{VolConfig, VolEstimate, VolatilityEstimator};

/// Seconds in the annualization year used across the quant core
pub const SECONDS_PER_YEAR: f64 = 365.0 * 24.0 * 3600.0;
