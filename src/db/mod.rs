//! Persistence layer
//!
//! Thin handle over a single sqlite connection. The database is the source of
//! truth for positions, window-entry reservations and the intent write-ahead
//! log; uniqueness constraints here are the engine's only cross-process
//! coordination primitive, so the schema (not in-process locks) carries the
//! atomicity guarantees.

use anyhow::{Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ToSql, Transaction};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Outcome of a write statement
#[derive(Debug, Clone, Copy)]
pub struct RunResult {
    pub changes: usize,
    pub last_insert_rowid: i64,
}

/// Shared database handle
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (or create) the database at `path` and apply migrations
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("open db {path}"))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        Self::migrate(&conn)?;
        info!(path, "database ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory db")?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Schema migrations, idempotent
    ///
    /// The UNIQUE indexes are load-bearing: positions dedupe on
    /// (window_id, market_id, token_id) and reservations on
    /// (window_id, strategy_id).
    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                window_id TEXT NOT NULL,
                market_id TEXT NOT NULL,
                token_id TEXT NOT NULL,
                side TEXT NOT NULL,
                size REAL NOT NULL,
                entry_price REAL NOT NULL,
                current_price REAL,
                status TEXT NOT NULL DEFAULT 'open',
                strategy_id TEXT,
                opened_at INTEGER NOT NULL,
                closed_at INTEGER,
                close_price REAL,
                pnl REAL,
                exchange_verified_at INTEGER,
                mode TEXT NOT NULL DEFAULT 'PAPER',
                lifecycle_state TEXT,
                high_water_mark REAL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_window_market_token
                ON positions(window_id, market_id, token_id);
            CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status);

            CREATE TABLE IF NOT EXISTS window_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                window_id TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'reserved',
                symbol TEXT,
                reserved_at INTEGER NOT NULL,
                confirmed_at INTEGER
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_window_entries_window_strategy
                ON window_entries(window_id, strategy_id);
            CREATE INDEX IF NOT EXISTS idx_window_entries_symbol_confirmed
                ON window_entries(symbol, confirmed_at DESC);

            CREATE TABLE IF NOT EXISTS intents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type TEXT NOT NULL,
                correlation_key TEXT,
                state TEXT NOT NULL DEFAULT 'logged',
                payload TEXT,
                result TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_intents_state ON intents(state);",
        )
        .context("apply schema migrations")?;
        Ok(())
    }

    /// Fetch the first row of a query as a JSON object, if any
    pub async fn get(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(sql)?;
        let cols: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.query(params)?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_json(row, &cols)?)),
            None => Ok(None),
        }
    }

    /// Fetch all rows of a query as JSON objects
    pub async fn all(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<serde_json::Value>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(sql)?;
        let cols: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_json(row, &cols)?);
        }
        Ok(out)
    }

    /// Execute a write statement
    pub async fn run(&self, sql: &str, params: &[&dyn ToSql]) -> Result<RunResult> {
        let conn = self.conn.lock().await;
        let changes = conn.execute(sql, params)?;
        Ok(RunResult {
            changes,
            last_insert_rowid: conn.last_insert_rowid(),
        })
    }

    /// Execute an INSERT and return the new rowid alongside the change count
    pub async fn run_returning_id(&self, sql: &str, params: &[&dyn ToSql]) -> Result<RunResult> {
        self.run(sql, params).await
    }

    /// Run `f` inside a sqlite transaction; commit on Ok, roll back on Err
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> rusqlite::Result<T>,
    {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Borrow the raw connection for one synchronous block
    ///
    /// Domain stores (positions, safeguard, intents) use this to keep their
    /// SQL colocated with their types instead of widening this handle.
    pub async fn with_conn<T, F>(&self, f: F) -> rusqlite::Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock().await;
        f(&conn)
    }
}

fn row_to_json(row: &rusqlite::Row<'_>, cols: &[String]) -> Result<serde_json::Value> {
    let mut obj = serde_json::Map::with_capacity(cols.len());
    for (i, name) in cols.iter().enumerate() {
        let v = match row.get_ref(i)? {
            ValueRef::Null => serde_json::Value::Null,
            ValueRef::Integer(n) => serde_json::Value::from(n),
            ValueRef::Real(f) => serde_json::Value::from(f),
            ValueRef::Text(t) => serde_json::Value::from(String::from_utf8_lossy(t).to_string()),
            ValueRef::Blob(b) => serde_json::Value::from(
                b.iter().map(|x| format!("{x:02x}")).collect::<String>(),
            ),
        };
        obj.insert(name.clone(), v);
    }
    Ok(serde_json::Value::Object(obj))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    #[tokio::test]
    async fn migrations_create_unique_indexes() {
        let db = Db::open_in_memory().unwrap();

        let now = 1_700_000_000_000_i64;
        db.run(
            "INSERT INTO window_entries (window_id, strategy_id, status, reserved_at)
             VALUES (?1, ?2, 'reserved', ?3)",
            &[&"w-1", &"s-a", &now],
        )
        .await
        .unwrap();

        let dup = db
            .run(
                "INSERT INTO window_entries (window_id, strategy_id, status, reserved_at)
                 VALUES (?1, ?2, 'reserved', ?3)",
                &[&"w-1", &"s-a", &now],
            )
            .await;
        assert!(dup.is_err(), "unique index must reject the duplicate");
    }

    #[tokio::test]
    async fn generic_surface_round_trips_rows() {
        let db = Db::open_in_memory().unwrap();
        let res = db
            .run_returning_id(
                "INSERT INTO intents (type, correlation_key, state, created_at, updated_at)
                 VALUES ('OPEN_POSITION', 'w-1', 'logged', 1, 1)",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(res.changes, 1);
        assert!(res.last_insert_rowid > 0);

        let row = db
            .get(
                "SELECT id, type, state FROM intents WHERE id = ?1",
                &[&res.last_insert_rowid],
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["type"], "OPEN_POSITION");
        assert_eq!(row["state"], "logged");

        let all = db.all("SELECT id FROM intents", &[]).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_error() {
        let db = Db::open_in_memory().unwrap();
        let res: Result<()> = db
            .transaction(|tx| {
                tx.execute(
                    "INSERT INTO intents (type, state, created_at, updated_at)
                     VALUES ('OPEN_POSITION', 'logged', 1, 1)",
                    params![],
                )?;
                Err(rusqlite::Error::InvalidQuery)
            })
            .await;
        assert!(res.is_err());
        let rows = db.all("SELECT id FROM intents", &[]).await.unwrap();
        assert!(rows.is_empty(), "insert must have been rolled back");
    }
}
