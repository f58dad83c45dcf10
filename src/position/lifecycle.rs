//! Position lifecycle state machine
//!
//! Guarded transitions over the persisted `lifecycle_state` column. Locked
//! states accept nothing but the move to CLOSED; everything off the table
//! is a programmer error surfaced as INVALID_STATUS_TRANSITION.

use rusqlite::params;
use tracing::info;

use crate::db::Db;
use crate::error::{EngineError, Result};

/// Discrete stage of a position between entry and close
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Entry,
    Monitoring,
    StopTriggered,
    TpTriggered,
    Expiry,
    ExitPending,
    Settlement,
    Closed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Entry => "ENTRY",
            LifecycleState::Monitoring => "MONITORING",
            LifecycleState::StopTriggered => "STOP_TRIGGERED",
            LifecycleState::TpTriggered => "TP_TRIGGERED",
            LifecycleState::Expiry => "EXPIRY",
            LifecycleState::ExitPending => "EXIT_PENDING",
            LifecycleState::Settlement => "SETTLEMENT",
            LifecycleState::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ENTRY" => Some(LifecycleState::Entry),
            "MONITORING" => Some(LifecycleState::Monitoring),
            "STOP_TRIGGERED" => Some(LifecycleState::StopTriggered),
            "TP_TRIGGERED" => Some(LifecycleState::TpTriggered),
            "EXPIRY" => Some(LifecycleState::Expiry),
            "EXIT_PENDING" => Some(LifecycleState::ExitPending),
            "SETTLEMENT" => Some(LifecycleState::Settlement),
            "CLOSED" => Some(LifecycleState::Closed),
            _ => None,
        }
    }

    /// Locked states accept no mutation other than the move to CLOSED
    pub fn is_locked(&self) -> bool {
        matches!(
            self,
            LifecycleState::ExitPending | LifecycleState::Settlement | LifecycleState::Closed
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Closed)
    }

    /// The transition table
    pub fn can_transition_to(&self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, to),
            (Entry, Monitoring)
                | (Monitoring, StopTriggered)
                | (Monitoring, TpTriggered)
                | (Monitoring, Expiry)
                | (StopTriggered, ExitPending)
                | (TpTriggered, ExitPending)
                | (Expiry, Settlement)
                | (ExitPending, Closed)
                | (Settlement, Closed)
        )
    }
}

/// Applies guarded transitions against the positions table
#[derive(Clone)]
pub struct LifecycleMachine {
    db: Db,
}

impl LifecycleMachine {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Move `position_id` to `to`, validating against the current row
    ///
    /// A NULL persisted state reads as MONITORING. The UPDATE re-checks the
    /// from-state so a concurrent writer cannot slip a second transition in
    /// between the read and the write.
    pub async fn transition(&self, position_id: i64, to: LifecycleState) -> Result<LifecycleState> {
        let current: Option<Option<String>> = self
            .db
            .with_conn(move |conn| {
                let mut stmt =
                    conn.prepare_cached("SELECT lifecycle_state FROM positions WHERE id = ?1")?;
                let mut rows = stmt.query(params![position_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get(0)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(EngineError::from)?;

        let Some(raw) = current else {
            return Err(EngineError::NotFound(position_id));
        };
        let from = raw
            .as_deref()
            .and_then(LifecycleState::parse)
            .unwrap_or(LifecycleState::Monitoring);

        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidStatusTransition {
                position_id,
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        let from_str = raw;
        let changes = self
            .db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE positions SET lifecycle_state = ?1
                     WHERE id = ?2
                       AND (lifecycle_state = ?3 OR (?3 IS NULL AND lifecycle_state IS NULL))",
                    params![to.as_str(), position_id, from_str],
                )
            })
            .await
            .map_err(EngineError::from)?;

        if changes != 1 {
            return Err(EngineError::Database(format!(
                "lifecycle update matched {changes} rows for position {position_id}"
            )));
        }

        info!(
            position_id,
            from = from.as_str(),
            to = to.as_str(),
            "lifecycle transition"
        );
        Ok(to)
    }
}
