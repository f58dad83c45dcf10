//! Orchestrator
//!
//! Single-threaded cooperative tick loop. Each tick runs to completion:
//! quant updates, exit evaluation for open positions, strategy signals,
//! safeguarded entries, and the per-tick counter reset. Background work
//! (reconcile, reservation sweep) rides cooperative timers and only ever
//! suspends at DB or exchange awaits.

use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::Db;
use crate::error::{EngineError, Result};
use crate::exchange::{ExchangeClient, OrderRequest};
use crate::models::{Direction, Side, Tick, TradeMode};
use crate::position::{
    CloseOptions, ExitEvaluator, ExitPolicy, ExitTriggerKind, IntentState, IntentType,
    LifecycleMachine, LifecycleState, NewPositionParams, Position, PositionManager, RiskLimits,
};
use crate::quant::{
    fair_probability_up, implied_vol, RegimeConfig, RegimeDetector, SpotLagAnalyzer,
    SpotLagConfig, SpotMoveEvent, VolConfig, VolatilityEstimator,
};
use crate::safeguard::{EntrySafeguard, EntrySignal, SafeguardPolicy};
use crate::strategy::{SignalAction, Strategy, StrategyContext};
use crate::window::{ExpiryEvaluatorConfig, WindowExpiryEvaluator};

/// Engine-wide counters, all monotone within a run
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub ticks: AtomicU64,
    pub signals: AtomicU64,
    pub entries: AtomicU64,
    pub exits: AtomicU64,
    pub settlements: AtomicU64,
    pub skipped_gate: AtomicU64,
    pub skipped_safeguard: AtomicU64,
    pub order_failures: AtomicU64,
    pub realized_pnl: RwLock<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsSummary {
    pub ticks: u64,
    pub signals: u64,
    pub entries: u64,
    pub exits: u64,
    pub settlements: u64,
    pub skipped_gate: u64,
    pub skipped_safeguard: u64,
    pub order_failures: u64,
    pub realized_pnl: f64,
}

impl EngineMetrics {
    pub fn record_pnl(&self, pnl: f64) {
        *self.realized_pnl.write() += pnl;
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            ticks: self.ticks.load(Ordering::Relaxed),
            signals: self.signals.load(Ordering::Relaxed),
            entries: self.entries.load(Ordering::Relaxed),
            exits: self.exits.load(Ordering::Relaxed),
            settlements: self.settlements.load(Ordering::Relaxed),
            skipped_gate: self.skipped_gate.load(Ordering::Relaxed),
            skipped_safeguard: self.skipped_safeguard.load(Ordering::Relaxed),
            order_failures: self.order_failures.load(Ordering::Relaxed),
            realized_pnl: *self.realized_pnl.read(),
        }
    }
}

/// The trading runtime: owns every component and the tick loop
pub struct Orchestrator {
    config: Config,
    mode: TradeMode,
    manager: PositionManager,
    safeguard: EntrySafeguard,
    lifecycle: LifecycleMachine,
    exit_evaluator: ExitEvaluator,
    expiry: WindowExpiryEvaluator,
    vol: VolatilityEstimator,
    regime: RegimeDetector,
    spot_lag: SpotLagAnalyzer,
    strategies: Vec<Box<dyn Strategy>>,
    exchange: Arc<dyn ExchangeClient>,
    metrics: Arc<EngineMetrics>,
    /// asset -> window the engine currently considers live
    current_window: HashMap<String, String>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        db: Db,
        exchange: Arc<dyn ExchangeClient>,
    ) -> anyhow::Result<Self> {
        let mode = TradeMode::parse(&config.engine.mode).unwrap_or(TradeMode::Paper);
        let expiry = WindowExpiryEvaluator::new(ExpiryEvaluatorConfig {
            window_duration_ms: config.trading.window_duration_ms,
            expiry_warning_threshold_ms: config.window_expiry.expiry_warning_threshold_ms,
            min_time_remaining_ms: config.trading.min_time_remaining_ms,
        })?;
        let exit_evaluator = ExitEvaluator::new(
            ExitPolicy {
                stop_loss_pct: config.exit.stop_loss_pct,
                take_profit_pct: config.exit.take_profit_pct,
                trailing_stop_pct: config.exit.trailing_stop_pct,
                expiry_enabled: config.window_expiry.enabled,
            },
            expiry.clone(),
        );
        let safeguard = EntrySafeguard::new(db.clone(), SafeguardPolicy::from(&config.safeguards));
        let vol = VolatilityEstimator::new(VolConfig {
            ewma_lambda: config.quant.ewma_lambda,
            fallback_vol: config.quant.fallback_vol,
            ..Default::default()
        });
        let spot_lag = SpotLagAnalyzer::new(SpotLagConfig {
            move_threshold: config.quant.spot_move_threshold,
            tracking_duration_ms: config.quant.lag_tracking_duration_ms,
            max_concurrent_events: config.quant.max_concurrent_lag_events,
            ..Default::default()
        });

        Ok(Self {
            mode,
            manager: PositionManager::new(db.clone()),
            safeguard,
            lifecycle: LifecycleMachine::new(db),
            exit_evaluator,
            expiry,
            vol,
            regime: RegimeDetector::new(RegimeConfig::default()),
            spot_lag,
            strategies: Vec::new(),
            exchange,
            metrics: Arc::new(EngineMetrics::default()),
            current_window: HashMap::new(),
            config,
        })
    }

    /// Install the strategy roster; invocation order is declaration order
    pub fn with_strategies(mut self, strategies: Vec<Box<dyn Strategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn manager(&self) -> &PositionManager {
        &self.manager
    }

    pub fn safeguard(&self) -> &EntrySafeguard {
        &self.safeguard
    }

    /// Startup: replay unfinished intents, then restore safeguard state
    pub async fn bootstrap(&self) -> Result<()> {
        self.recover_intents().await?;
        let open = self.manager.open_positions().await?;
        self.safeguard.initialize_from_positions(&open).await?;
        info!(open_positions = open.len(), "orchestrator bootstrapped");
        Ok(())
    }

    /// Resolve intents a crash left in `logged` or `executing`
    async fn recover_intents(&self) -> Result<()> {
        let unfinished = self.manager.intents().unfinished().await?;
        for intent in unfinished {
            match intent.intent_type {
                IntentType::OpenPosition => {
                    // the insert either landed or it did not; the unique key tells us
                    let landed = match intent.payload.as_ref() {
                        Some(p) => {
                            let window = p["window_id"].as_str().unwrap_or_default().to_string();
                            let market = p["market_id"].as_str().unwrap_or_default().to_string();
                            let token = p["token_id"].as_str().unwrap_or_default().to_string();
                            self.manager.get_positions(None).await?.iter().any(|pos| {
                                pos.window_id == window
                                    && pos.market_id == market
                                    && pos.token_id == token
                            })
                        }
                        None => false,
                    };
                    if landed {
                        self.manager
                            .intents()
                            .mark_completed(intent.id, json!({"recovered": true}))
                            .await?;
                    } else {
                        self.manager
                            .intents()
                            .mark_failed(intent.id, json!({"recovered": true}))
                            .await?;
                    }
                    info!(intent_id = intent.id, landed, "open intent recovered");
                }
                IntentType::ClosePosition => {
                    let position_id = intent
                        .payload
                        .as_ref()
                        .and_then(|p| p["position_id"].as_i64());
                    let Some(position_id) = position_id else {
                        self.manager
                            .intents()
                            .mark_failed(intent.id, json!({"recovered": true}))
                            .await?;
                        continue;
                    };
                    match self.manager.get_position(position_id).await {
                        Ok(pos) if pos.status == crate::models::PositionStatus::Open => {
                            // re-attempt the close once; it logs its own intent
                            let res = self
                                .manager
                                .close_position(position_id, CloseOptions::default())
                                .await;
                            let state = if res.is_ok() {
                                IntentState::Completed
                            } else {
                                IntentState::Failed
                            };
                            match state {
                                IntentState::Completed => {
                                    self.manager
                                        .intents()
                                        .mark_completed(
                                            intent.id,
                                            json!({"recovered": true, "reclosed": true}),
                                        )
                                        .await?
                                }
                                _ => {
                                    self.manager
                                        .intents()
                                        .mark_failed(intent.id, json!({"recovered": true}))
                                        .await?
                                }
                            }
                            info!(intent_id = intent.id, position_id, "close intent recovered");
                        }
                        Ok(_) => {
                            self.manager
                                .intents()
                                .mark_completed(intent.id, json!({"recovered": true}))
                                .await?;
                        }
                        Err(_) => {
                            self.manager
                                .intents()
                                .mark_failed(intent.id, json!({"recovered": true}))
                                .await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// The cooperative loop: ticks plus reconcile and sweep timers
    pub async fn run(
        &mut self,
        mut ticks: mpsc::Receiver<Tick>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut reconcile_timer = tokio::time::interval(Duration::from_millis(
            self.config.engine.reconcile_interval_ms.max(1_000) as u64,
        ));
        let mut sweep_timer = tokio::time::interval(Duration::from_millis(
            self.config.engine.sweep_interval_ms.max(500) as u64,
        ));
        // the first firing of an interval is immediate; consume it
        reconcile_timer.tick().await;
        sweep_timer.tick().await;

        info!(mode = self.mode.as_str(), "tick loop started");
        loop {
            tokio::select! {
                maybe_tick = ticks.recv() => {
                    match maybe_tick {
                        Some(tick) => {
                            if let Err(e) = self.process_tick(&tick).await {
                                error!(error = %e, window_id = %tick.window_id, "tick processing failed");
                            }
                        }
                        None => {
                            info!("tick stream closed, shutting down");
                            break;
                        }
                    }
                }
                _ = reconcile_timer.tick() => {
                    match self.manager.reconcile(self.exchange.as_ref()).await {
                        Ok(report) if !report.success => {
                            warn!(divergences = report.divergences.len(), "reconcile found divergences");
                        }
                        Ok(report) => {
                            debug!(verified = report.verified, "reconcile clean");
                        }
                        Err(e) => error!(error = %e, "reconcile pass failed"),
                    }
                    let summary = self.metrics.summary();
                    info!(?summary, "engine heartbeat");
                }
                _ = sweep_timer.tick() => {
                    if let Err(e) = self.safeguard.sweep_stale().await {
                        error!(error = %e, "reservation sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("shutdown requested");
                        break;
                    }
                }
            }
        }
        info!(summary = ?self.metrics.summary(), "tick loop stopped");
        Ok(())
    }

    /// One full tick cycle
    pub async fn process_tick(&mut self, tick: &Tick) -> Result<()> {
        self.metrics.ticks.fetch_add(1, Ordering::Relaxed);
        let now = tick.timestamp;

        // window rollover hooks
        let prev = self.current_window.get(&tick.crypto).cloned();
        if prev.as_deref() != Some(tick.window_id.as_str()) {
            if let Some(old) = prev {
                for s in self.strategies.iter_mut() {
                    s.on_window_end(&old);
                }
            }
            for s in self.strategies.iter_mut() {
                s.on_window_start(&tick.window_id);
            }
            self.current_window
                .insert(tick.crypto.clone(), tick.window_id.clone());
        }

        // quant updates
        self.vol
            .record(&tick.crypto, tick.spot_price, Some(tick.up_mid), now);
        self.regime
            .record(&tick.crypto, tick.spot_price, tick.spread_bps());
        let vol_estimate = self.vol.estimate(&tick.crypto, now);
        let fair_prob = fair_probability_up(
            tick.spot_price,
            tick.price_to_beat,
            tick.time_remaining_sec,
            vol_estimate.best,
            self.config.quant.drift,
        );
        self.spot_lag
            .record_tick(&tick.crypto, tick.spot_price, tick.up_mid, fair_prob, now);
        let regime = self.regime.assess(&tick.crypto, vol_estimate.best);
        let market_iv = implied_vol(
            tick.up_mid,
            tick.spot_price,
            tick.price_to_beat,
            tick.time_remaining_sec,
            self.config.quant.drift,
        );

        // mark open positions on this window and drive exits everywhere
        let open = self.manager.open_positions().await?;
        for pos in &open {
            let current_price = if pos.window_id == tick.window_id {
                match self.manager.update_price(pos.id, tick.up_mid).await {
                    Ok(updated) => updated.current_price.unwrap_or(tick.up_mid),
                    Err(e) => {
                        warn!(position_id = pos.id, error = %e, "price update failed");
                        continue;
                    }
                }
            } else {
                pos.current_price.unwrap_or(pos.entry_price)
            };
            self.drive_position(tick, pos, current_price, now).await?;
        }

        // strategies, in declared order, each blind to the others
        let lag_event: Option<SpotMoveEvent> =
            self.spot_lag.latest_active(&tick.crypto).cloned();
        let ctx = StrategyContext {
            fair_prob,
            implied_vol: market_iv,
            vol: vol_estimate,
            regime,
            lag_event: lag_event.as_ref(),
            edge_threshold: self.config.quant.edge_threshold,
            default_size: self.config.engine.default_order_size,
        };

        let open = self.manager.open_positions().await?;
        let mut actions = Vec::new();
        for strategy in self.strategies.iter_mut() {
            let name = strategy.name();
            let own_position = open
                .iter()
                .find(|p| p.window_id == tick.window_id && p.strategy_id.as_deref() == Some(name));
            let signal = strategy.on_tick(tick, own_position, &ctx);
            debug!(
                strategy = name,
                action = signal.action.as_str(),
                reason = %signal.reason,
                "strategy signal"
            );
            if signal.is_actionable() {
                self.metrics.signals.fetch_add(1, Ordering::Relaxed);
                actions.push((name, signal, own_position.map(|p| p.id)));
            }
        }

        for (name, signal, position_id) in actions {
            match signal.action {
                SignalAction::Buy => {
                    if let Err(e) = self.try_enter(tick, name, &signal, now).await {
                        warn!(strategy = name, error = %e, "entry attempt failed");
                    }
                }
                SignalAction::Sell => {
                    if let Some(id) = position_id {
                        if let Err(e) = self.strategy_exit(id, tick.up_mid, &signal.reason).await {
                            warn!(position_id = id, error = %e, "strategy exit failed");
                        }
                    }
                }
                SignalAction::Hold => {}
            }
        }

        // tick-cycle boundary
        self.safeguard.reset_tick_entries();
        Ok(())
    }

    /// Walk one open position through exit evaluation and the state machine
    async fn drive_position(
        &self,
        tick: &Tick,
        pos: &Position,
        current_price: f64,
        now: i64,
    ) -> Result<()> {
        match pos.lifecycle() {
            LifecycleState::Monitoring => {
                let Some(trigger) = self.exit_evaluator.evaluate(pos, current_price, now) else {
                    return Ok(());
                };
                info!(
                    position_id = pos.id,
                    trigger = trigger.kind.as_str(),
                    reason = %trigger.reason,
                    "exit triggered"
                );
                self.lifecycle
                    .transition(pos.id, trigger.lifecycle_target)
                    .await?;
                match trigger.kind {
                    ExitTriggerKind::StopLoss | ExitTriggerKind::TakeProfit => {
                        self.lifecycle
                            .transition(pos.id, LifecycleState::ExitPending)
                            .await?;
                        let closed = self
                            .manager
                            .close_position(
                                pos.id,
                                CloseOptions {
                                    emergency: false,
                                    close_price: Some(trigger.price),
                                },
                            )
                            .await?;
                        self.metrics.exits.fetch_add(1, Ordering::Relaxed);
                        self.metrics.record_pnl(closed.pnl.unwrap_or(0.0));
                        self.safeguard
                            .remove_entry(&pos.window_id, pos.strategy_id.as_deref())
                            .await?;
                    }
                    ExitTriggerKind::Expiry => {
                        // settlement happens once the window is actually resolved
                        self.try_settle(tick, pos, now).await?;
                    }
                }
            }
            LifecycleState::Expiry => {
                self.try_settle(tick, pos, now).await?;
            }
            // locked states move only via close paths already in flight
            _ => {}
        }
        Ok(())
    }

    /// EXPIRY -> SETTLEMENT -> CLOSED once the resolution is known
    async fn try_settle(&self, tick: &Tick, pos: &Position, now: i64) -> Result<()> {
        let status = self
            .expiry
            .check_expiry(&pos.window_id, now)
            .map_err(|e| EngineError::Validation(e.to_string()))?;
        if !status.is_resolved {
            return Ok(());
        }

        // the resolution is observable only while the feed still carries this
        // window's strike
        let resolution = if pos.window_id == tick.window_id {
            Some(if tick.spot_price >= tick.price_to_beat {
                1.0
            } else {
                0.0
            })
        } else {
            None
        };

        self.lifecycle
            .transition(pos.id, LifecycleState::Settlement)
            .await?;
        let settlement =
            self.expiry
                .settle(pos.side, pos.size, pos.entry_price, resolution);

        let close_price = match resolution {
            Some(r) => r,
            None => {
                warn!(
                    position_id = pos.id,
                    window_id = %pos.window_id,
                    "window resolved without an observable strike, settling flat"
                );
                pos.entry_price
            }
        };
        let closed = self
            .manager
            .close_position(
                pos.id,
                CloseOptions {
                    emergency: false,
                    close_price: Some(close_price),
                },
            )
            .await?;
        self.metrics.settlements.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_pnl(closed.pnl.unwrap_or(0.0));
        self.safeguard
            .remove_entry(&pos.window_id, pos.strategy_id.as_deref())
            .await?;

        info!(
            position_id = pos.id,
            outcome = ?settlement.outcome,
            pnl = settlement.pnl,
            pnl_pct = settlement.pnl_pct,
            "position settled"
        );
        Ok(())
    }

    /// Strategy-requested exit: classify as stop or take-profit by sign
    async fn strategy_exit(&self, position_id: i64, price: f64, reason: &str) -> Result<()> {
        let pos = self.manager.get_position(position_id).await?;
        if pos.lifecycle() != LifecycleState::Monitoring {
            return Ok(());
        }
        let pnl = match pos.side {
            Side::Long => (price - pos.entry_price) * pos.size,
            Side::Short => (pos.entry_price - price) * pos.size,
        };
        let target = if pnl >= 0.0 {
            LifecycleState::TpTriggered
        } else {
            LifecycleState::StopTriggered
        };
        info!(position_id, reason, pnl, "strategy requested exit");
        self.lifecycle.transition(position_id, target).await?;
        self.lifecycle
            .transition(position_id, LifecycleState::ExitPending)
            .await?;
        let closed = self
            .manager
            .close_position(
                position_id,
                CloseOptions {
                    emergency: false,
                    close_price: Some(price),
                },
            )
            .await?;
        self.metrics.exits.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_pnl(closed.pnl.unwrap_or(0.0));
        self.safeguard
            .remove_entry(&pos.window_id, pos.strategy_id.as_deref())
            .await?;
        Ok(())
    }

    /// Gate, reserve, place, confirm-or-release
    async fn try_enter(
        &self,
        tick: &Tick,
        strategy_name: &'static str,
        signal: &crate::strategy::Signal,
        now: i64,
    ) -> Result<()> {
        let Some(direction) = signal.side else {
            return Ok(());
        };
        if !(signal.size > 0.0) {
            return Ok(());
        }

        let gate = self.expiry.can_enter_window(&tick.window_id, now);
        if !gate.allowed {
            debug!(
                strategy = strategy_name,
                reason = gate.reason.as_deref().unwrap_or("unknown"),
                "entry gate closed"
            );
            self.metrics.skipped_gate.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let (side, token_id, entry_price) = match direction {
            Direction::Up => (Side::Long, tick.up_token_id.clone(), tick.buy_up_price()),
            Direction::Down => (
                Side::Short,
                tick.down_token_id.clone(),
                tick.sell_up_price(),
            ),
        };
        if !(entry_price > 0.0 && entry_price <= 1.0) {
            return Err(EngineError::Validation(format!(
                "entry price {entry_price} outside (0,1]"
            )));
        }

        let entry_signal = EntrySignal {
            window_id: tick.window_id.clone(),
            symbol: Some(tick.crypto.to_ascii_uppercase()),
            strategy_id: Some(strategy_name.to_string()),
        };
        let open_count = self.manager.open_positions().await?.len();
        let decision = self
            .safeguard
            .can_enter_position_at(&entry_signal, open_count, now)
            .await?;
        if !decision.allowed {
            debug!(
                strategy = strategy_name,
                reason = decision.reason.map(|r| r.as_str()).unwrap_or("unknown"),
                "safeguard blocked entry"
            );
            self.metrics.skipped_safeguard.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        if !self
            .safeguard
            .reserve_entry_at(&tick.window_id, Some(strategy_name), now)
            .await?
        {
            self.metrics.skipped_safeguard.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let order = OrderRequest {
            window_id: tick.window_id.clone(),
            market_id: tick.market_id.clone(),
            token_id: token_id.clone(),
            side,
            size: signal.size,
            limit_price: entry_price,
        };
        let placed = tokio::time::timeout(
            Duration::from_millis(self.config.engine.exchange_timeout_ms),
            self.exchange.place_order(&order),
        )
        .await;

        let order_id = match placed {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                warn!(strategy = strategy_name, error = %e, "order placement failed");
                self.metrics.order_failures.fetch_add(1, Ordering::Relaxed);
                self.safeguard
                    .release_entry(&tick.window_id, Some(strategy_name))
                    .await?;
                return Ok(());
            }
            Err(_) => {
                warn!(strategy = strategy_name, "order placement timed out");
                self.metrics.order_failures.fetch_add(1, Ordering::Relaxed);
                self.safeguard
                    .release_entry(&tick.window_id, Some(strategy_name))
                    .await?;
                return Ok(());
            }
        };

        self.safeguard
            .confirm_entry_at(
                &tick.window_id,
                Some(strategy_name),
                Some(&tick.crypto.to_ascii_uppercase()),
                now,
            )
            .await?;

        let risk = RiskLimits::from(&self.config.risk);
        let created = self
            .manager
            .add_position(
                NewPositionParams {
                    window_id: tick.window_id.clone(),
                    market_id: tick.market_id.clone(),
                    token_id,
                    side,
                    size: signal.size,
                    entry_price,
                    strategy_id: Some(strategy_name.to_string()),
                    mode: self.mode,
                },
                Some(&risk),
            )
            .await;

        match created {
            Ok(pos) => {
                self.metrics.entries.fetch_add(1, Ordering::Relaxed);
                info!(
                    position_id = pos.id,
                    strategy = strategy_name,
                    order_id = %order_id,
                    side = side.as_str(),
                    size = signal.size,
                    entry_price,
                    confidence = signal.confidence,
                    "entered position"
                );
                Ok(())
            }
            Err(e) => {
                // the order is on the exchange but the record is not;
                // reconciliation will surface the imbalance
                error!(
                    strategy = strategy_name,
                    order_id = %order_id,
                    error = %e,
                    "order placed but position insert failed"
                );
                self.safeguard
                    .release_entry(&tick.window_id, Some(strategy_name))
                    .await?;
                Err(e)
            }
        }
    }
}
