//! Position manager
//!
//! Sole writer of the `positions` table. Every open and close is wrapped in
//! a write-ahead intent so crash recovery can tell completed work from work
//! that died mid-flight.

use rusqlite::params;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::intent::{IntentStore, IntentType};
use super::lifecycle::LifecycleState;
use super::Position;
use crate::db::Db;
use crate::error::{EngineError, Result};
use crate::exchange::ExchangeClient;
use crate::models::{now_ms, PositionStatus, Side, TradeMode};

/// Relative tolerance for exchange balance comparison
const RECONCILE_TOLERANCE_REL: f64 = 1e-4;
const RECONCILE_TOLERANCE_ABS: f64 = 1e-4;

/// Parameters for a new position
#[derive(Debug, Clone)]
pub struct NewPositionParams {
    pub window_id: String,
    pub market_id: String,
    pub token_id: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub strategy_id: Option<String>,
    pub mode: TradeMode,
}

/// Risk limits applied at entry when provided
#[derive(Debug, Clone)]
pub struct RiskLimits {
    pub max_position_size: f64,
    pub max_exposure: f64,
    /// None or Some(0) means no per-market limit
    pub position_limit_per_market: Option<u32>,
}

impl From<&crate::config::RiskConfig> for RiskLimits {
    fn from(c: &crate::config::RiskConfig) -> Self {
        Self {
            max_position_size: c.max_position_size,
            max_exposure: c.max_exposure,
            position_limit_per_market: c.position_limit_per_market,
        }
    }
}

/// Options for closing a position
#[derive(Debug, Clone, Default)]
pub struct CloseOptions {
    pub emergency: bool,
    /// Price to settle at; falls back to the stored current price
    pub close_price: Option<f64>,
}

/// Reconciliation divergence kinds
#[derive(Debug, Clone)]
pub enum DivergenceKind {
    SizeMismatch { local_size: f64, exchange_balance: f64 },
    MissingOnExchange { local_size: f64 },
    ApiError { message: String },
}

impl DivergenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DivergenceKind::SizeMismatch { .. } => "SIZE_MISMATCH",
            DivergenceKind::MissingOnExchange { .. } => "MISSING_ON_EXCHANGE",
            DivergenceKind::ApiError { .. } => "API_ERROR",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Divergence {
    pub position_id: i64,
    pub token_id: String,
    pub kind: DivergenceKind,
}

/// Result of one reconciliation pass
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub verified: usize,
    pub divergences: Vec<Divergence>,
    pub timestamp: i64,
    pub success: bool,
}

/// Notification emitted after a successful close
#[derive(Debug, Clone)]
pub struct CloseNotice {
    pub position_id: i64,
    pub window_id: String,
    pub strategy_id: Option<String>,
    pub pnl: f64,
    pub emergency: bool,
}

/// The only component allowed to mutate position rows
#[derive(Clone)]
pub struct PositionManager {
    db: Db,
    intents: IntentStore,
    close_notices: Option<mpsc::UnboundedSender<CloseNotice>>,
}

impl PositionManager {
    pub fn new(db: Db) -> Self {
        let intents = IntentStore::new(db.clone());
        Self {
            db,
            intents,
            close_notices: None,
        }
    }

    /// Wire the fire-and-forget close notification channel
    pub fn with_close_notices(mut self, tx: mpsc::UnboundedSender<CloseNotice>) -> Self {
        self.close_notices = Some(tx);
        self
    }

    pub fn intents(&self) -> &IntentStore {
        &self.intents
    }

    /// Validate, check limits, log intent, insert as MONITORING
    pub async fn add_position(
        &self,
        params_in: NewPositionParams,
        risk: Option<&RiskLimits>,
    ) -> Result<Position> {
        validate_new_position(&params_in)?;
        if let Some(risk) = risk {
            self.check_limits(&params_in, risk).await?;
        }

        let intent_id = self
            .intents
            .log(
                IntentType::OpenPosition,
                &params_in.window_id,
                json!({
                    "window_id": params_in.window_id,
                    "market_id": params_in.market_id,
                    "token_id": params_in.token_id,
                    "side": params_in.side.as_str(),
                    "size": params_in.size,
                    "entry_price": params_in.entry_price,
                    "strategy_id": params_in.strategy_id,
                    "mode": params_in.mode.as_str(),
                }),
            )
            .await?;
        self.intents.mark_executing(intent_id).await?;

        let p = params_in.clone();
        let opened_at = now_ms();
        let insert = self
            .db
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO positions
                         (window_id, market_id, token_id, side, size, entry_price,
                          current_price, status, strategy_id, opened_at, mode,
                          lifecycle_state, high_water_mark)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 'open', ?7, ?8, ?9, 'MONITORING', ?6)",
                    params![
                        p.window_id,
                        p.market_id,
                        p.token_id,
                        p.side.as_str(),
                        p.size,
                        p.entry_price,
                        p.strategy_id,
                        opened_at,
                        p.mode.as_str(),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await;

        let position_id = match insert {
            Ok(id) => id,
            Err(e) => {
                let err = if EngineError::is_unique_violation(&e) {
                    EngineError::DuplicatePosition {
                        window_id: params_in.window_id.clone(),
                        market_id: params_in.market_id.clone(),
                        token_id: params_in.token_id.clone(),
                    }
                } else {
                    EngineError::Database(e.to_string())
                };
                self.intents
                    .mark_failed(intent_id, json!({"error": err.code()}))
                    .await?;
                return Err(err);
            }
        };

        self.intents
            .mark_completed(intent_id, json!({"position_id": position_id}))
            .await?;

        info!(
            position_id,
            window_id = %params_in.window_id,
            side = params_in.side.as_str(),
            size = params_in.size,
            entry_price = params_in.entry_price,
            mode = params_in.mode.as_str(),
            "position opened"
        );
        self.get_position(position_id).await
    }

    /// Close an OPEN position at an explicit or last-known price
    pub async fn close_position(&self, id: i64, opts: CloseOptions) -> Result<Position> {
        let position = self.get_position(id).await?;
        if position.status != PositionStatus::Open {
            return Err(EngineError::CloseFailed {
                position_id: id,
                reason: format!("position status is {}", position.status.as_str()),
            });
        }

        let intent_id = self
            .intents
            .log(
                IntentType::ClosePosition,
                &position.window_id,
                json!({
                    "position_id": id,
                    "emergency": opts.emergency,
                    "close_price": opts.close_price,
                }),
            )
            .await?;
        self.intents.mark_executing(intent_id).await?;

        let effective = opts.close_price.or(position.current_price);
        let Some(close_price) = effective.filter(|p| p.is_finite() && *p >= 0.0) else {
            let err = EngineError::CloseFailed {
                position_id: id,
                reason: format!("no usable close price (requested {:?})", opts.close_price),
            };
            self.intents
                .mark_failed(intent_id, json!({"error": err.to_string()}))
                .await?;
            return Err(err);
        };

        let pnl = match position.side {
            Side::Long => (close_price - position.entry_price) * position.size,
            Side::Short => (position.entry_price - close_price) * position.size,
        };

        let closed_at = now_ms();
        let changes = self
            .db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE positions
                     SET status = 'closed', close_price = ?1, closed_at = ?2, pnl = ?3,
                         lifecycle_state = 'CLOSED'
                     WHERE id = ?4 AND status = 'open'",
                    params![close_price, closed_at, pnl, id],
                )
            })
            .await;

        match changes {
            Ok(1) => {}
            Ok(n) => {
                let err = EngineError::Database(format!(
                    "close matched {n} rows for position {id}"
                ));
                self.intents
                    .mark_failed(intent_id, json!({"error": err.to_string()}))
                    .await?;
                return Err(err);
            }
            Err(e) => {
                let err = EngineError::Database(e.to_string());
                self.intents
                    .mark_failed(intent_id, json!({"error": err.to_string()}))
                    .await?;
                return Err(err);
            }
        }

        // the CLOSED lifecycle write and this completion marker settle together
        self.intents
            .mark_completed(intent_id, json!({"position_id": id, "pnl": pnl}))
            .await?;

        info!(
            position_id = id,
            close_price,
            pnl,
            emergency = opts.emergency,
            "position closed"
        );

        if let Some(tx) = &self.close_notices {
            let _ = tx.send(CloseNotice {
                position_id: id,
                window_id: position.window_id.clone(),
                strategy_id: position.strategy_id.clone(),
                pnl,
                emergency: opts.emergency,
            });
        }

        self.get_position(id).await
    }

    /// Record a fresh mark and maintain the high-water mark
    pub async fn update_price(&self, id: i64, price: f64) -> Result<Position> {
        if !price.is_finite() || price < 0.0 {
            return Err(EngineError::Validation(format!(
                "price {price} must be finite and >= 0"
            )));
        }
        let changes = self
            .db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE positions
                     SET current_price = ?1,
                         high_water_mark = CASE side
                             WHEN 'LONG' THEN MAX(COALESCE(high_water_mark, ?1), ?1)
                             ELSE MIN(COALESCE(high_water_mark, ?1), ?1)
                         END
                     WHERE id = ?2 AND status = 'open'",
                    params![price, id],
                )
            })
            .await
            .map_err(EngineError::from)?;
        if changes == 0 {
            return Err(EngineError::NotFound(id));
        }
        self.get_position(id).await
    }

    pub async fn get_position(&self, id: i64) -> Result<Position> {
        let row = self
            .db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {POSITION_COLUMNS} FROM positions WHERE id = ?1"
                ))?;
                let mut rows = stmt.query_map(params![id], row_to_position)?;
                rows.next().transpose()
            })
            .await
            .map_err(EngineError::from)?;
        row.ok_or(EngineError::NotFound(id))
    }

    /// All positions, optionally filtered by mode (filter pushed into SQL)
    pub async fn get_positions(&self, mode: Option<TradeMode>) -> Result<Vec<Position>> {
        self.db
            .with_conn(move |conn| match mode {
                Some(m) => {
                    let mut stmt = conn.prepare_cached(&format!(
                        "SELECT {POSITION_COLUMNS} FROM positions WHERE mode = ?1 ORDER BY id ASC"
                    ))?;
                    let rows = stmt.query_map(params![m.as_str()], row_to_position)?;
                    rows.collect()
                }
                None => {
                    let mut stmt = conn.prepare_cached(&format!(
                        "SELECT {POSITION_COLUMNS} FROM positions ORDER BY id ASC"
                    ))?;
                    let rows = stmt.query_map([], row_to_position)?;
                    rows.collect()
                }
            })
            .await
            .map_err(EngineError::from)
    }

    pub async fn open_positions(&self) -> Result<Vec<Position>> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {POSITION_COLUMNS} FROM positions WHERE status = 'open' ORDER BY id ASC"
                ))?;
                let rows = stmt.query_map([], row_to_position)?;
                rows.collect()
            })
            .await
            .map_err(EngineError::from)
    }

    /// Compare every open position against the exchange balance
    pub async fn reconcile(&self, exchange: &dyn ExchangeClient) -> Result<ReconcileReport> {
        let open = self.open_positions().await?;
        let mut verified = 0usize;
        let mut divergences = Vec::new();

        for pos in &open {
            match exchange.get_balance(&pos.token_id).await {
                Ok(balance) => {
                    let tolerance =
                        (pos.size * RECONCILE_TOLERANCE_REL).max(RECONCILE_TOLERANCE_ABS);
                    if (balance - pos.size).abs() <= tolerance {
                        let id = pos.id;
                        let now = now_ms();
                        self.db
                            .with_conn(move |conn| {
                                conn.execute(
                                    "UPDATE positions SET exchange_verified_at = ?1 WHERE id = ?2",
                                    params![now, id],
                                )
                            })
                            .await
                            .map_err(EngineError::from)?;
                        verified += 1;
                    } else if balance == 0.0 {
                        warn!(
                            position_id = pos.id,
                            token_id = %pos.token_id,
                            local_size = pos.size,
                            "position missing on exchange"
                        );
                        divergences.push(Divergence {
                            position_id: pos.id,
                            token_id: pos.token_id.clone(),
                            kind: DivergenceKind::MissingOnExchange {
                                local_size: pos.size,
                            },
                        });
                    } else {
                        warn!(
                            position_id = pos.id,
                            token_id = %pos.token_id,
                            local_size = pos.size,
                            exchange_balance = balance,
                            "position size mismatch"
                        );
                        divergences.push(Divergence {
                            position_id: pos.id,
                            token_id: pos.token_id.clone(),
                            kind: DivergenceKind::SizeMismatch {
                                local_size: pos.size,
                                exchange_balance: balance,
                            },
                        });
                    }
                }
                Err(e) => {
                    error!(position_id = pos.id, error = %e, "reconcile api call failed");
                    divergences.push(Divergence {
                        position_id: pos.id,
                        token_id: pos.token_id.clone(),
                        kind: DivergenceKind::ApiError {
                            message: e.to_string(),
                        },
                    });
                }
            }
        }

        let success = divergences.is_empty();
        Ok(ReconcileReport {
            verified,
            divergences,
            timestamp: now_ms(),
            success,
        })
    }

    /// Risk limit checks in fixed order: size, exposure, per-market count
    async fn check_limits(&self, p: &NewPositionParams, risk: &RiskLimits) -> Result<()> {
        if p.size > risk.max_position_size {
            return Err(EngineError::PositionLimitExceeded {
                check: "max_position_size".into(),
                detail: format!("size {} exceeds cap", p.size),
                limit: risk.max_position_size,
            });
        }

        let exposure: f64 = self
            .db
            .with_conn(|conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT COALESCE(SUM(size * entry_price), 0.0)
                     FROM positions WHERE status = 'open'",
                )?;
                stmt.query_row([], |row| row.get(0))
            })
            .await
            .map_err(EngineError::from)?;
        let new_exposure = exposure + p.size * p.entry_price;
        if new_exposure > risk.max_exposure {
            return Err(EngineError::PositionLimitExceeded {
                check: "max_exposure".into(),
                detail: format!("total exposure {new_exposure:.4} exceeds cap"),
                limit: risk.max_exposure,
            });
        }

        // None and Some(0) both mean unlimited; coercing null to zero would
        // block every entry
        if let Some(limit) = risk.position_limit_per_market.filter(|l| *l > 0) {
            let market_id = p.market_id.clone();
            let count: i64 = self
                .db
                .with_conn(move |conn| {
                    let mut stmt = conn.prepare_cached(
                        "SELECT COUNT(*) FROM positions
                         WHERE status = 'open' AND market_id = ?1",
                    )?;
                    stmt.query_row(params![market_id], |row| row.get(0))
                })
                .await
                .map_err(EngineError::from)?;
            if count >= limit as i64 {
                return Err(EngineError::PositionLimitExceeded {
                    check: "position_limit_per_market".into(),
                    detail: format!("market {} already holds {count}", p.market_id),
                    limit: limit as f64,
                });
            }
        }

        Ok(())
    }
}

const POSITION_COLUMNS: &str = "id, window_id, market_id, token_id, side, size, entry_price, \
     current_price, status, strategy_id, opened_at, closed_at, close_price, pnl, \
     exchange_verified_at, mode, lifecycle_state, high_water_mark";

fn row_to_position(row: &rusqlite::Row<'_>) -> rusqlite::Result<Position> {
    let side_raw: String = row.get(4)?;
    let status_raw: String = row.get(8)?;
    let mode_raw: String = row.get(15)?;
    let lifecycle_raw: Option<String> = row.get(16)?;
    Ok(Position {
        id: row.get(0)?,
        window_id: row.get(1)?,
        market_id: row.get(2)?,
        token_id: row.get(3)?,
        side: Side::parse(&side_raw).unwrap_or(Side::Long),
        size: row.get(5)?,
        entry_price: row.get(6)?,
        current_price: row.get(7)?,
        status: PositionStatus::parse(&status_raw).unwrap_or(PositionStatus::Open),
        strategy_id: row.get(9)?,
        opened_at: row.get(10)?,
        closed_at: row.get(11)?,
        close_price: row.get(12)?,
        pnl: row.get(13)?,
        exchange_verified_at: row.get(14)?,
        mode: TradeMode::parse(&mode_raw).unwrap_or(TradeMode::Paper),
        lifecycle_state: lifecycle_raw.as_deref().and_then(LifecycleState::parse),
        high_water_mark: row.get(17)?,
    })
}

fn validate_new_position(p: &NewPositionParams) -> Result<()> {
    if p.window_id.trim().is_empty()
        || p.market_id.trim().is_empty()
        || p.token_id.trim().is_empty()
    {
        return Err(EngineError::Validation(
            "window_id, market_id and token_id are required".into(),
        ));
    }
    if !(p.size.is_finite() && p.size > 0.0) {
        return Err(EngineError::Validation(format!(
            "size {} must be a positive number",
            p.size
        )));
    }
    // binary option prices live in (0, 1]
    if !(p.entry_price.is_finite() && p.entry_price > 0.0 && p.entry_price <= 1.0) {
        return Err(EngineError::Validation(format!(
            "entry_price {} must be in (0, 1]",
            p.entry_price
        )));
    }
    Ok(())
}
