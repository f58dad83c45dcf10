//! Entry safeguard
//!
//! Pre-trade gate for every signal: duplicate-window prevention, per-symbol
//! rate limiting, the concurrent-position cap and the per-tick cap. The
//! (window_id, strategy_id) UNIQUE index on `window_entries` is the only
//! atomicity primitive for reservations. An in-process lock would not
//! survive a second process pointed at the same database, so none is used.

use rusqlite::params;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};

use crate::db::Db;
use crate::error::{EngineError, Result};
use crate::models::now_ms;
use crate::position::Position;
use crate::window::parse_window_id;

pub const DEFAULT_STRATEGY_ID: &str = "default";

/// Safeguard policies
#[derive(Debug, Clone)]
pub struct SafeguardPolicy {
    pub max_concurrent_positions: usize,
    /// Per-symbol cool-down; 0 disables
    pub min_entry_interval_ms: i64,
    pub max_entries_per_tick: u32,
    pub duplicate_window_prevention: bool,
    pub reservation_timeout_ms: i64,
}

impl Default for SafeguardPolicy {
    fn default() -> Self {
        Self {
            max_concurrent_positions: 8,
            min_entry_interval_ms: 5_000,
            max_entries_per_tick: 2,
            duplicate_window_prevention: true,
            reservation_timeout_ms: 30_000,
        }
    }
}

impl From<&crate::config::SafeguardConfig> for SafeguardPolicy {
    fn from(c: &crate::config::SafeguardConfig) -> Self {
        Self {
            max_concurrent_positions: c.max_concurrent_positions,
            min_entry_interval_ms: c.min_entry_interval_ms,
            max_entries_per_tick: c.max_entries_per_tick,
            duplicate_window_prevention: c.duplicate_window_prevention,
            reservation_timeout_ms: c.reservation_timeout_ms,
        }
    }
}

/// Why an entry was blocked, in reporting priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    DuplicateWindowEntry,
    RateLimitExceeded,
    MaxConcurrentPositionsReached,
    MaxEntriesPerTickReached,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::DuplicateWindowEntry => "duplicate_window_entry",
            BlockReason::RateLimitExceeded => "rate_limit_exceeded",
            BlockReason::MaxConcurrentPositionsReached => "max_concurrent_positions_reached",
            BlockReason::MaxEntriesPerTickReached => "max_entries_per_tick_reached",
        }
    }
}

/// Entry request as seen by the safeguard
#[derive(Debug, Clone)]
pub struct EntrySignal {
    pub window_id: String,
    pub symbol: Option<String>,
    pub strategy_id: Option<String>,
}

impl EntrySignal {
    fn strategy(&self) -> &str {
        self.strategy_id.as_deref().unwrap_or(DEFAULT_STRATEGY_ID)
    }

    fn normalized_symbol(&self) -> Option<String> {
        self.symbol
            .as_deref()
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
    }
}

/// Verdict with the first violated reason only
#[derive(Debug, Clone)]
pub struct EntryDecision {
    pub allowed: bool,
    pub reason: Option<BlockReason>,
    pub details: serde_json::Value,
}

impl EntryDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            details: json!({}),
        }
    }

    fn block(reason: BlockReason, details: serde_json::Value) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            details,
        }
    }
}

/// Durable reserve/confirm/release layer plus the in-process per-tick counter
pub struct EntrySafeguard {
    db: Db,
    policy: SafeguardPolicy,
    tick_entries: AtomicU32,
}

impl EntrySafeguard {
    pub fn new(db: Db, policy: SafeguardPolicy) -> Self {
        Self {
            db,
            policy,
            tick_entries: AtomicU32::new(0),
        }
    }

    pub fn policy(&self) -> &SafeguardPolicy {
        &self.policy
    }

    /// Entries confirmed in the current tick cycle
    pub fn tick_entries(&self) -> u32 {
        self.tick_entries.load(Ordering::Relaxed)
    }

    /// Called by the orchestrator at every tick-cycle boundary
    pub fn reset_tick_entries(&self) {
        self.tick_entries.store(0, Ordering::Relaxed);
    }

    /// Try-reserve a (window, strategy) slot; true iff this caller won
    pub async fn reserve_entry(&self, window_id: &str, strategy_id: Option<&str>) -> Result<bool> {
        self.reserve_entry_at(window_id, strategy_id, now_ms()).await
    }

    pub async fn reserve_entry_at(
        &self,
        window_id: &str,
        strategy_id: Option<&str>,
        now_ms: i64,
    ) -> Result<bool> {
        self.sweep_stale_at(now_ms).await?;
        let strategy = strategy_id.unwrap_or(DEFAULT_STRATEGY_ID);
        let res = self
            .db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO window_entries (window_id, strategy_id, status, reserved_at)
                     VALUES (?1, ?2, 'reserved', ?3)
                     ON CONFLICT(window_id, strategy_id) DO NOTHING",
                    params![window_id, strategy, now_ms],
                )
            })
            .await
            .map_err(EngineError::from)?;
        let won = res == 1;
        debug!(window_id, strategy, won, "reserve entry");
        Ok(won)
    }

    /// Promote a reservation to confirmed and count it against the tick cap
    pub async fn confirm_entry(
        &self,
        window_id: &str,
        strategy_id: Option<&str>,
        symbol: Option<&str>,
    ) -> Result<bool> {
        self.confirm_entry_at(window_id, strategy_id, symbol, now_ms())
            .await
    }

    pub async fn confirm_entry_at(
        &self,
        window_id: &str,
        strategy_id: Option<&str>,
        symbol: Option<&str>,
        now_ms: i64,
    ) -> Result<bool> {
        let strategy = strategy_id.unwrap_or(DEFAULT_STRATEGY_ID);
        let symbol = symbol
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty());
        let changes = self
            .db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE window_entries
                     SET status = 'confirmed', symbol = ?1, confirmed_at = ?2
                     WHERE window_id = ?3 AND strategy_id = ?4 AND status = 'reserved'",
                    params![symbol, now_ms, window_id, strategy],
                )
            })
            .await
            .map_err(EngineError::from)?;
        if changes == 1 {
            self.tick_entries.fetch_add(1, Ordering::Relaxed);
            info!(window_id, strategy, "entry confirmed");
            Ok(true)
        } else {
            warn!(window_id, strategy, "confirm matched no reservation");
            Ok(false)
        }
    }

    /// Delete an entry after order failure; the slot becomes claimable again
    pub async fn release_entry(&self, window_id: &str, strategy_id: Option<&str>) -> Result<bool> {
        let strategy = strategy_id.unwrap_or(DEFAULT_STRATEGY_ID);
        let changes = self
            .db
            .with_conn(|conn| {
                conn.execute(
                    "DELETE FROM window_entries WHERE window_id = ?1 AND strategy_id = ?2",
                    params![window_id, strategy],
                )
            })
            .await
            .map_err(EngineError::from)?;
        debug!(window_id, strategy, released = changes > 0, "release entry");
        Ok(changes > 0)
    }

    /// Delete an entry on position close, re-opening the window for re-entry
    pub async fn remove_entry(&self, window_id: &str, strategy_id: Option<&str>) -> Result<bool> {
        self.release_entry(window_id, strategy_id).await
    }

    /// Drop reservations older than the timeout
    pub async fn sweep_stale_at(&self, now_ms: i64) -> Result<usize> {
        let cutoff = now_ms - self.policy.reservation_timeout_ms;
        let swept = self
            .db
            .with_conn(|conn| {
                conn.execute(
                    "DELETE FROM window_entries WHERE status = 'reserved' AND reserved_at < ?1",
                    params![cutoff],
                )
            })
            .await
            .map_err(EngineError::from)?;
        if swept > 0 {
            warn!(swept, "stale reservations swept");
        }
        Ok(swept)
    }

    pub async fn sweep_stale(&self) -> Result<usize> {
        self.sweep_stale_at(now_ms()).await
    }

    /// Run all entry checks in priority order; first violation wins
    pub async fn can_enter_position(
        &self,
        signal: &EntrySignal,
        open_position_count: usize,
    ) -> Result<EntryDecision> {
        self.can_enter_position_at(signal, open_position_count, now_ms())
            .await
    }

    pub async fn can_enter_position_at(
        &self,
        signal: &EntrySignal,
        open_position_count: usize,
        now_ms: i64,
    ) -> Result<EntryDecision> {
        self.sweep_stale_at(now_ms).await?;

        // (i) duplicate (window, strategy) entry
        if self.policy.duplicate_window_prevention {
            let strategy = signal.strategy().to_string();
            let window_id = signal.window_id.clone();
            let exists = self
                .db
                .with_conn(move |conn| {
                    let mut stmt = conn.prepare_cached(
                        "SELECT 1 FROM window_entries WHERE window_id = ?1 AND strategy_id = ?2",
                    )?;
                    stmt.exists(params![window_id, strategy])
                })
                .await
                .map_err(EngineError::from)?;
            if exists {
                return Ok(EntryDecision::block(
                    BlockReason::DuplicateWindowEntry,
                    json!({
                        "window_id": signal.window_id,
                        "strategy_id": signal.strategy(),
                    }),
                ));
            }
        }

        // (ii) per-symbol rate limit
        if self.policy.min_entry_interval_ms > 0 {
            if let Some(symbol) = signal.normalized_symbol() {
                let sym = symbol.clone();
                let last: Option<i64> = self
                    .db
                    .with_conn(move |conn| {
                        let mut stmt = conn.prepare_cached(
                            "SELECT MAX(confirmed_at) FROM window_entries
                             WHERE symbol = ?1 AND status = 'confirmed'",
                        )?;
                        stmt.query_row(params![sym], |row| row.get(0))
                    })
                    .await
                    .map_err(EngineError::from)?;
                if let Some(last) = last {
                    let elapsed = now_ms - last;
                    if elapsed < self.policy.min_entry_interval_ms {
                        return Ok(EntryDecision::block(
                            BlockReason::RateLimitExceeded,
                            json!({
                                "symbol": symbol,
                                "elapsed_ms": elapsed,
                                "min_interval_ms": self.policy.min_entry_interval_ms,
                            }),
                        ));
                    }
                }
            }
        }

        // (iii) concurrent-position cap
        if open_position_count >= self.policy.max_concurrent_positions {
            return Ok(EntryDecision::block(
                BlockReason::MaxConcurrentPositionsReached,
                json!({
                    "open_positions": open_position_count,
                    "max_concurrent_positions": self.policy.max_concurrent_positions,
                }),
            ));
        }

        // (iv) per-tick cap
        let used = self.tick_entries();
        if used >= self.policy.max_entries_per_tick {
            return Ok(EntryDecision::block(
                BlockReason::MaxEntriesPerTickReached,
                json!({
                    "entries_this_tick": used,
                    "max_entries_per_tick": self.policy.max_entries_per_tick,
                }),
            ));
        }

        Ok(EntryDecision::allow())
    }

    /// Boot-time restore: one confirmed entry per open position
    pub async fn initialize_from_positions(&self, positions: &[Position]) -> Result<usize> {
        let now = now_ms();
        let mut restored = 0usize;
        for pos in positions {
            if pos.window_id.trim().is_empty() {
                continue;
            }
            let symbol = parse_window_id(&pos.window_id)
                .ok()
                .map(|w| w.asset.to_ascii_uppercase());
            let window_id = pos.window_id.clone();
            let strategy = pos
                .strategy_id
                .clone()
                .unwrap_or_else(|| DEFAULT_STRATEGY_ID.to_string());
            let changes = self
                .db
                .with_conn(move |conn| {
                    conn.execute(
                        "INSERT INTO window_entries
                             (window_id, strategy_id, status, symbol, reserved_at, confirmed_at)
                         VALUES (?1, ?2, 'confirmed', ?3, ?4, ?4)
                         ON CONFLICT(window_id, strategy_id) DO NOTHING",
                        params![window_id, strategy, symbol, now],
                    )
                })
                .await
                .map_err(EngineError::from)?;
            restored += changes;
        }
        info!(restored, total = positions.len(), "safeguard state restored");
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn safeguard(policy: SafeguardPolicy) -> EntrySafeguard {
        EntrySafeguard::new(Db::open_in_memory().unwrap(), policy)
    }

    fn signal(window_id: &str, symbol: &str, strategy: &str) -> EntrySignal {
        EntrySignal {
            window_id: window_id.to_string(),
            symbol: Some(symbol.to_string()),
            strategy_id: Some(strategy.to_string()),
        }
    }

    #[tokio::test]
    async fn entry_happy_path_then_duplicate_block() {
        let sg = safeguard(SafeguardPolicy {
            min_entry_interval_ms: 0,
            ..Default::default()
        });
        let sig = signal("w-1", "BTC", "s-a");

        let d = sg.can_enter_position(&sig, 0).await.unwrap();
        assert!(d.allowed);

        assert!(sg.reserve_entry("w-1", Some("s-a")).await.unwrap());
        assert!(!sg.reserve_entry("w-1", Some("s-a")).await.unwrap());

        assert!(sg
            .confirm_entry("w-1", Some("s-a"), Some("BTC"))
            .await
            .unwrap());

        let d = sg.can_enter_position(&sig, 1).await.unwrap();
        assert!(!d.allowed);
        assert_eq!(d.reason, Some(BlockReason::DuplicateWindowEntry));
    }

    #[tokio::test]
    async fn different_strategies_share_a_window() {
        let sg = safeguard(SafeguardPolicy {
            min_entry_interval_ms: 0,
            ..Default::default()
        });
        assert!(sg.reserve_entry("w-1", Some("s-a")).await.unwrap());
        assert!(sg.reserve_entry("w-1", Some("s-b")).await.unwrap());
        // absent strategy uses the literal default and is its own slot
        assert!(sg.reserve_entry("w-1", None).await.unwrap());
        assert!(!sg.reserve_entry("w-1", None).await.unwrap());
    }

    #[tokio::test]
    async fn rate_limit_blocks_same_symbol_only() {
        let sg = safeguard(SafeguardPolicy {
            min_entry_interval_ms: 5_000,
            ..Default::default()
        });
        let t0 = 1_700_000_000_000_i64;
        assert!(sg.reserve_entry_at("w-1", Some("s"), t0).await.unwrap());
        assert!(sg
            .confirm_entry_at("w-1", Some("s"), Some("BTC"), t0)
            .await
            .unwrap());

        // 100ms later, same symbol blocked
        let d = sg
            .can_enter_position_at(&signal("w-2", "BTC", "s"), 1, t0 + 100)
            .await
            .unwrap();
        assert_eq!(d.reason, Some(BlockReason::RateLimitExceeded));

        // other symbol fine
        let d = sg
            .can_enter_position_at(&signal("w-2", "ETH", "s"), 1, t0 + 100)
            .await
            .unwrap();
        assert!(d.allowed);

        // exactly the interval elapsed admits
        let d = sg
            .can_enter_position_at(&signal("w-2", "BTC", "s"), 1, t0 + 5_000)
            .await
            .unwrap();
        assert!(d.allowed);

        // symbol casing is normalized
        let d = sg
            .can_enter_position_at(&signal("w-2", "btc", "s"), 1, t0 + 100)
            .await
            .unwrap();
        assert_eq!(d.reason, Some(BlockReason::RateLimitExceeded));
    }

    #[tokio::test]
    async fn zero_interval_disables_rate_limit() {
        let sg = safeguard(SafeguardPolicy {
            min_entry_interval_ms: 0,
            ..Default::default()
        });
        let t0 = 1_700_000_000_000_i64;
        sg.reserve_entry_at("w-1", Some("s"), t0).await.unwrap();
        sg.confirm_entry_at("w-1", Some("s"), Some("BTC"), t0)
            .await
            .unwrap();
        let d = sg
            .can_enter_position_at(&signal("w-2", "BTC", "s"), 1, t0 + 1)
            .await
            .unwrap();
        assert!(d.allowed);
    }

    #[tokio::test]
    async fn stale_reservations_are_swept() {
        let sg = safeguard(SafeguardPolicy {
            reservation_timeout_ms: 50,
            min_entry_interval_ms: 0,
            ..Default::default()
        });
        let t0 = 1_700_000_000_000_i64;
        assert!(sg.reserve_entry_at("w-1", Some("s"), t0).await.unwrap());

        // 60ms later the reservation is no longer observed
        let d = sg
            .can_enter_position_at(&signal("w-1", "BTC", "s"), 0, t0 + 60)
            .await
            .unwrap();
        assert!(d.allowed, "sweep must have removed the reservation");
        assert!(sg.reserve_entry_at("w-1", Some("s"), t0 + 60).await.unwrap());
    }

    #[tokio::test]
    async fn confirmed_entries_survive_the_sweep() {
        let sg = safeguard(SafeguardPolicy {
            reservation_timeout_ms: 50,
            min_entry_interval_ms: 0,
            ..Default::default()
        });
        let t0 = 1_700_000_000_000_i64;
        sg.reserve_entry_at("w-1", Some("s"), t0).await.unwrap();
        sg.confirm_entry_at("w-1", Some("s"), Some("BTC"), t0)
            .await
            .unwrap();
        let d = sg
            .can_enter_position_at(&signal("w-1", "BTC", "s"), 1, t0 + 60)
            .await
            .unwrap();
        assert_eq!(d.reason, Some(BlockReason::DuplicateWindowEntry));
    }

    #[tokio::test]
    async fn caps_report_in_priority_order() {
        let sg = safeguard(SafeguardPolicy {
            max_concurrent_positions: 2,
            max_entries_per_tick: 1,
            min_entry_interval_ms: 0,
            ..Default::default()
        });
        // concurrent cap fires before the per-tick cap
        sg.tick_entries.store(5, Ordering::Relaxed);
        let d = sg
            .can_enter_position(&signal("w-9", "BTC", "s"), 2)
            .await
            .unwrap();
        assert_eq!(d.reason, Some(BlockReason::MaxConcurrentPositionsReached));

        let d = sg
            .can_enter_position(&signal("w-9", "BTC", "s"), 1)
            .await
            .unwrap();
        assert_eq!(d.reason, Some(BlockReason::MaxEntriesPerTickReached));

        sg.reset_tick_entries();
        let d = sg
            .can_enter_position(&signal("w-9", "BTC", "s"), 1)
            .await
            .unwrap();
        assert!(d.allowed);
    }

    #[tokio::test]
    async fn reserve_release_reserve_round_trip() {
        let sg = safeguard(SafeguardPolicy::default());
        assert!(sg.reserve_entry("w-1", Some("s")).await.unwrap());
        assert!(sg.release_entry("w-1", Some("s")).await.unwrap());
        assert!(sg.reserve_entry("w-1", Some("s")).await.unwrap());
        // confirm -> remove -> reserve succeeds again
        assert!(sg.confirm_entry("w-1", Some("s"), Some("BTC")).await.unwrap());
        assert!(sg.remove_entry("w-1", Some("s")).await.unwrap());
        assert!(sg.reserve_entry("w-1", Some("s")).await.unwrap());
        // confirm then reserve again fails while the entry lives
        assert!(sg.confirm_entry("w-1", Some("s"), Some("BTC")).await.unwrap());
        assert!(!sg.reserve_entry("w-1", Some("s")).await.unwrap());
        // releasing nothing reports false
        assert!(!sg.release_entry("w-gone", Some("s")).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_reserves_yield_exactly_one_winner() {
        let sg = Arc::new(safeguard(SafeguardPolicy::default()));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let sg = Arc::clone(&sg);
            handles.push(tokio::spawn(async move {
                sg.reserve_entry("w-race", Some("s")).await.unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn confirm_without_reservation_reports_false() {
        let sg = safeguard(SafeguardPolicy::default());
        assert!(!sg
            .confirm_entry("w-none", Some("s"), Some("BTC"))
            .await
            .unwrap());
        assert_eq!(sg.tick_entries(), 0);
    }
}
