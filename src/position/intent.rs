//! Intent write-ahead log
//!
//! Every position open/close logs an intent before touching the positions
//! table. After a crash the log tells recovery exactly which operations were
//! in flight: `logged` never started executing, `executing` may have partial
//! effects, `completed`/`failed` are settled history.

use rusqlite::params;
use serde_json::Value;
use tracing::debug;

use crate::db::Db;
use crate::error::{EngineError, Result};
use crate::models::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentType {
    OpenPosition,
    ClosePosition,
}

impl IntentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentType::OpenPosition => "OPEN_POSITION",
            IntentType::ClosePosition => "CLOSE_POSITION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN_POSITION" => Some(IntentType::OpenPosition),
            "CLOSE_POSITION" => Some(IntentType::ClosePosition),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentState {
    Logged,
    Executing,
    Completed,
    Failed,
}

impl IntentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentState::Logged => "logged",
            IntentState::Executing => "executing",
            IntentState::Completed => "completed",
            IntentState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "logged" => Some(IntentState::Logged),
            "executing" => Some(IntentState::Executing),
            "completed" => Some(IntentState::Completed),
            "failed" => Some(IntentState::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IntentRecord {
    pub id: i64,
    pub intent_type: IntentType,
    pub correlation_key: Option<String>,
    pub state: IntentState,
    pub payload: Option<Value>,
    pub result: Option<Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Append-only store over the `intents` table
#[derive(Clone)]
pub struct IntentStore {
    db: Db,
}

impl IntentStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Log a new intent in state `logged`, returning its id
    pub async fn log(
        &self,
        intent_type: IntentType,
        correlation_key: &str,
        payload: Value,
    ) -> Result<i64> {
        let now = now_ms();
        let key = correlation_key.to_string();
        let payload_str = payload.to_string();
        let id = self
            .db
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO intents (type, correlation_key, state, payload, created_at, updated_at)
                     VALUES (?1, ?2, 'logged', ?3, ?4, ?4)",
                    params![intent_type.as_str(), key, payload_str, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(EngineError::from)?;
        debug!(intent_id = id, kind = intent_type.as_str(), "intent logged");
        Ok(id)
    }

    pub async fn mark_executing(&self, id: i64) -> Result<()> {
        self.advance(id, IntentState::Executing, None).await
    }

    pub async fn mark_completed(&self, id: i64, result: Value) -> Result<()> {
        self.advance(id, IntentState::Completed, Some(result)).await
    }

    pub async fn mark_failed(&self, id: i64, result: Value) -> Result<()> {
        self.advance(id, IntentState::Failed, Some(result)).await
    }

    /// Idempotent state move; re-marking a settled intent is a no-op
    async fn advance(&self, id: i64, state: IntentState, result: Option<Value>) -> Result<()> {
        let now = now_ms();
        let result_str = result.map(|r| r.to_string());
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE intents
                     SET state = ?1, result = COALESCE(?2, result), updated_at = ?3
                     WHERE id = ?4 AND state NOT IN ('completed', 'failed')",
                    params![state.as_str(), result_str, now, id],
                )
            })
            .await
            .map_err(EngineError::from)?;
        Ok(())
    }

    /// Intents a crash may have left unfinished, oldest first
    pub async fn unfinished(&self) -> Result<Vec<IntentRecord>> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, type, correlation_key, state, payload, result, created_at, updated_at
                     FROM intents WHERE state IN ('logged', 'executing') ORDER BY id ASC",
                )?;
                let rows = stmt.query_map([], row_to_record)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await
            .map_err(EngineError::from)
    }

    pub async fn get(&self, id: i64) -> Result<Option<IntentRecord>> {
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, type, correlation_key, state, payload, result, created_at, updated_at
                     FROM intents WHERE id = ?1",
                )?;
                let mut rows = stmt.query_map(params![id], row_to_record)?;
                rows.next().transpose()
            })
            .await
            .map_err(EngineError::from)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<IntentRecord> {
    let type_raw: String = row.get(1)?;
    let state_raw: String = row.get(3)?;
    let payload_raw: Option<String> = row.get(4)?;
    let result_raw: Option<String> = row.get(5)?;
    Ok(IntentRecord {
        id: row.get(0)?,
        intent_type: IntentType::parse(&type_raw).unwrap_or(IntentType::OpenPosition),
        correlation_key: row.get(2)?,
        state: IntentState::parse(&state_raw).unwrap_or(IntentState::Failed),
        payload: payload_raw.and_then(|p| serde_json::from_str(&p).ok()),
        result: result_raw.and_then(|r| serde_json::from_str(&r).ok()),
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}
