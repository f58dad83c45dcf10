//! updown-bot core library
//!
//! Automated trading runtime for short-duration binary options on crypto
//! price direction. Exposes every subsystem for the binary and for tests:
//! persistence, window codec and expiry evaluation, the quant core, the
//! strategy library, the entry safeguard, position tracking and the
//! orchestrator.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod models;
pub mod position;
pub mod quant;
pub mod safeguard;
pub mod strategy;
pub mod window;

pub use config::Config;
pub use db::Db;
pub use engine::{EngineMetrics, MetricsSummary, Orchestrator};
pub use error::{EngineError, Result};
pub use models::{now_ms, Direction, PositionStatus, Side, Tick, TradeMode};
