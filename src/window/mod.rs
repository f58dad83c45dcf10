//! Window identifiers and expiry evaluation
//!
//! A window is one fixed-length binary market on an underlying asset. Its id
//! is the wire-stable string `{asset}-{duration}-YYYY-MM-DD-HH:MM` (UTC);
//! everything timing-related in the engine derives from parsing that id.

pub mod codec;
pub mod expiry;

pub use codec::{format_window_id, parse_window_id, WindowId, WindowIdError};
pub use expiry::{
    EntryGate, ExpiryEvaluatorConfig, Settlement, SettlementOutcome, WindowExpiryEvaluator,
    WindowExpiryStatus,
};
