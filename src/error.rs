//! Error types for the trading core

use thiserror::Error;

/// Result type alias for the trading core
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error type for the trading engine
///
/// Every variant maps to a stable machine-readable code (see [`EngineError::code`])
/// so operators and callers can branch on kind without string-matching messages.
#[derive(Error, Debug)]
pub enum EngineError {
    // Boundary validation
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("position {0} not found")]
    NotFound(i64),

    // Persistence
    #[error("duplicate position for window={window_id} market={market_id} token={token_id}")]
    DuplicatePosition {
        window_id: String,
        market_id: String,
        token_id: String,
    },

    #[error("database error: {0}")]
    Database(String),

    // Lifecycle
    #[error("invalid lifecycle transition {from} -> {to} for position {position_id}")]
    InvalidStatusTransition {
        position_id: i64,
        from: String,
        to: String,
    },

    // Risk / concurrency caps
    #[error("position limit exceeded ({check}): {detail}, limit={limit}")]
    PositionLimitExceeded {
        check: String,
        detail: String,
        limit: f64,
    },

    // Close path
    #[error("close failed for position {position_id}: {reason}")]
    CloseFailed { position_id: i64, reason: String },

    // Exchange
    #[error("exchange api error: {0}")]
    Api(String),

    #[error("exchange divergence on position {position_id}: {kind}")]
    ExchangeDivergence { position_id: i64, kind: String },
}

impl EngineError {
    /// Stable error code for logging and caller dispatch
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_FAILED",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::DuplicatePosition { .. } => "DUPLICATE_POSITION",
            EngineError::Database(_) => "DATABASE_ERROR",
            EngineError::InvalidStatusTransition { .. } => "INVALID_STATUS_TRANSITION",
            EngineError::PositionLimitExceeded { .. } => "POSITION_LIMIT_EXCEEDED",
            EngineError::CloseFailed { .. } => "CLOSE_FAILED",
            EngineError::Api(_) => "API_ERROR",
            EngineError::ExchangeDivergence { .. } => "EXCHANGE_DIVERGENCE",
        }
    }

    /// Whether the underlying sqlite error is a UNIQUE constraint collision
    pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
        matches!(
            err,
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            EngineError::Validation("x".into()).code(),
            "VALIDATION_FAILED"
        );
        assert_eq!(EngineError::NotFound(7).code(), "NOT_FOUND");
        assert_eq!(
            EngineError::PositionLimitExceeded {
                check: "max_position_size".into(),
                detail: "size 100 > 50".into(),
                limit: 50.0,
            }
            .code(),
            "POSITION_LIMIT_EXCEEDED"
        );
    }

    #[test]
    fn display_carries_context() {
        let err = EngineError::InvalidStatusTransition {
            position_id: 3,
            from: "CLOSED".into(),
            to: "MONITORING".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("CLOSED"));
        assert!(msg.contains("MONITORING"));
        assert!(msg.contains('3'));
    }
}
