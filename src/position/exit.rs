//! Exit evaluator
//!
//! One priority-ordered decision per MONITORING position per tick:
//! stop-loss, then take-profit, then window expiry. A triggered check
//! short-circuits the rest; a check that errors is skipped and evaluation
//! continues with the next one.

use tracing::debug;

use super::lifecycle::LifecycleState;
use super::Position;
use crate::error::{EngineError, Result};
use crate::models::Side;
use crate::window::WindowExpiryEvaluator;

/// Exit thresholds, fractions of entry price
#[derive(Debug, Clone)]
pub struct ExitPolicy {
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    /// Give-back fraction from the high-water mark; None disables trailing
    pub trailing_stop_pct: Option<f64>,
    /// Master toggle for expiry-driven exits
    pub expiry_enabled: bool,
}

impl Default for ExitPolicy {
    fn default() -> Self {
        Self {
            stop_loss_pct: 0.40,
            take_profit_pct: 0.50,
            trailing_stop_pct: None,
            expiry_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitTriggerKind {
    StopLoss,
    TakeProfit,
    Expiry,
}

impl ExitTriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitTriggerKind::StopLoss => "STOP_LOSS",
            ExitTriggerKind::TakeProfit => "TAKE_PROFIT",
            ExitTriggerKind::Expiry => "EXPIRY",
        }
    }

    /// Lifecycle state this trigger drives the position into
    pub fn lifecycle_target(&self) -> LifecycleState {
        match self {
            ExitTriggerKind::StopLoss => LifecycleState::StopTriggered,
            ExitTriggerKind::TakeProfit => LifecycleState::TpTriggered,
            ExitTriggerKind::Expiry => LifecycleState::Expiry,
        }
    }
}

/// The single decision the evaluator produces
#[derive(Debug, Clone)]
pub struct ExitTrigger {
    pub kind: ExitTriggerKind,
    pub lifecycle_target: LifecycleState,
    pub reason: String,
    pub price: f64,
}

/// Priority-ordered exit decision function
#[derive(Clone)]
pub struct ExitEvaluator {
    policy: ExitPolicy,
    expiry: WindowExpiryEvaluator,
}

impl ExitEvaluator {
    pub fn new(policy: ExitPolicy, expiry: WindowExpiryEvaluator) -> Self {
        Self { policy, expiry }
    }

    /// Evaluate one MONITORING position; anything else returns None
    pub fn evaluate(
        &self,
        position: &Position,
        current_price: f64,
        now_ms: i64,
    ) -> Option<ExitTrigger> {
        if position.lifecycle() != LifecycleState::Monitoring {
            return None;
        }

        type Check = fn(&ExitEvaluator, &Position, f64, i64) -> Result<Option<ExitTrigger>>;
        let checks: [(&str, Check); 3] = [
            ("stop_loss", ExitEvaluator::check_stop_loss),
            ("take_profit", ExitEvaluator::check_take_profit),
            ("expiry", ExitEvaluator::check_expiry),
        ];

        for (name, check) in checks {
            match check(self, position, current_price, now_ms) {
                Ok(Some(trigger)) => return Some(trigger),
                Ok(None) => {}
                Err(e) => {
                    // a broken check must not mask the ones below it
                    debug!(
                        position_id = position.id,
                        check = name,
                        error = %e,
                        "exit check failed, continuing"
                    );
                }
            }
        }
        None
    }

    fn check_stop_loss(
        &self,
        position: &Position,
        current_price: f64,
        _now_ms: i64,
    ) -> Result<Option<ExitTrigger>> {
        let price = validated_price(current_price)?;

        let adverse = match position.side {
            Side::Long => (position.entry_price - price) / position.entry_price,
            Side::Short => (price - position.entry_price) / position.entry_price,
        };
        if adverse >= self.policy.stop_loss_pct {
            return Ok(Some(ExitTrigger {
                kind: ExitTriggerKind::StopLoss,
                lifecycle_target: ExitTriggerKind::StopLoss.lifecycle_target(),
                reason: format!(
                    "adverse move {:.1}% >= stop {:.1}%",
                    adverse * 100.0,
                    self.policy.stop_loss_pct * 100.0
                ),
                price,
            }));
        }

        // trailing stop against the persisted high-water mark
        if let (Some(trail), Some(hwm)) = (self.policy.trailing_stop_pct, position.high_water_mark)
        {
            let giveback = match position.side {
                Side::Long => (hwm - price) / hwm,
                Side::Short => (price - hwm) / hwm,
            };
            if hwm > 0.0 && giveback >= trail {
                return Ok(Some(ExitTrigger {
                    kind: ExitTriggerKind::StopLoss,
                    lifecycle_target: ExitTriggerKind::StopLoss.lifecycle_target(),
                    reason: format!(
                        "gave back {:.1}% from water mark {:.4}",
                        giveback * 100.0,
                        hwm
                    ),
                    price,
                }));
            }
        }

        Ok(None)
    }

    fn check_take_profit(
        &self,
        position: &Position,
        current_price: f64,
        _now_ms: i64,
    ) -> Result<Option<ExitTrigger>> {
        let price = validated_price(current_price)?;

        let favorable = match position.side {
            Side::Long => (price - position.entry_price) / position.entry_price,
            Side::Short => (position.entry_price - price) / position.entry_price,
        };
        if favorable >= self.policy.take_profit_pct {
            return Ok(Some(ExitTrigger {
                kind: ExitTriggerKind::TakeProfit,
                lifecycle_target: ExitTriggerKind::TakeProfit.lifecycle_target(),
                reason: format!(
                    "favorable move {:.1}% >= target {:.1}%",
                    favorable * 100.0,
                    self.policy.take_profit_pct * 100.0
                ),
                price,
            }));
        }
        Ok(None)
    }

    fn check_expiry(
        &self,
        position: &Position,
        current_price: f64,
        now_ms: i64,
    ) -> Result<Option<ExitTrigger>> {
        if !self.policy.expiry_enabled {
            return Ok(None);
        }
        let status = self
            .expiry
            .check_expiry(&position.window_id, now_ms)
            .map_err(|e| EngineError::Validation(e.to_string()))?;
        if status.is_resolved || status.is_expiring {
            return Ok(Some(ExitTrigger {
                kind: ExitTriggerKind::Expiry,
                lifecycle_target: ExitTriggerKind::Expiry.lifecycle_target(),
                reason: if status.is_resolved {
                    format!("window resolved {}ms ago", -status.time_remaining_ms)
                } else {
                    format!("window expiring in {}ms", status.time_remaining_ms)
                },
                price: current_price,
            }));
        }
        Ok(None)
    }
}

fn validated_price(price: f64) -> Result<f64> {
    if !price.is_finite() || price < 0.0 {
        return Err(EngineError::Validation(format!(
            "current price {price} is not a valid probability price"
        )));
    }
    Ok(price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PositionStatus, TradeMode};
    use crate::window::ExpiryEvaluatorConfig;
    use chrono::Utc;

    fn expiry() -> WindowExpiryEvaluator {
        WindowExpiryEvaluator::new(ExpiryEvaluatorConfig {
            window_duration_ms: 900_000,
            expiry_warning_threshold_ms: 60_000,
            min_time_remaining_ms: 0,
        })
        .unwrap()
    }

    fn position(side: Side, entry: f64, lifecycle: LifecycleState) -> Position {
        Position {
            id: 1,
            window_id: "btc-15m-2026-01-31-10:00".into(),
            market_id: "m-1".into(),
            token_id: "t-1".into(),
            side,
            size: 10.0,
            entry_price: entry,
            current_price: Some(entry),
            status: PositionStatus::Open,
            strategy_id: Some("s".into()),
            opened_at: 0,
            closed_at: None,
            close_price: None,
            pnl: None,
            exchange_verified_at: None,
            mode: TradeMode::Paper,
            lifecycle_state: Some(lifecycle),
            high_water_mark: None,
        }
    }

    fn ms(rfc3339: &str) -> i64 {
        chrono::DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
            .timestamp_millis()
    }

    fn mid_window_ms() -> i64 {
        ms("2026-01-31T10:05:00Z")
    }

    #[test]
    fn only_monitoring_positions_are_evaluated() {
        let ev = ExitEvaluator::new(ExitPolicy::default(), expiry());
        for state in [
            LifecycleState::Entry,
            LifecycleState::StopTriggered,
            LifecycleState::TpTriggered,
            LifecycleState::Expiry,
            LifecycleState::ExitPending,
            LifecycleState::Settlement,
            LifecycleState::Closed,
        ] {
            let p = position(Side::Long, 0.50, state);
            // price that would certainly trigger the stop
            assert!(ev.evaluate(&p, 0.01, mid_window_ms()).is_none());
        }
    }

    #[test]
    fn stop_loss_wins_over_take_profit() {
        // thresholds chosen so one price satisfies both checks
        let ev = ExitEvaluator::new(
            ExitPolicy {
                stop_loss_pct: 0.10,
                take_profit_pct: -0.50, // any price is "favorable enough"
                trailing_stop_pct: None,
                expiry_enabled: true,
            },
            expiry(),
        );
        let p = position(Side::Long, 0.50, LifecycleState::Monitoring);
        let t = ev.evaluate(&p, 0.40, mid_window_ms()).unwrap();
        assert_eq!(t.kind, ExitTriggerKind::StopLoss);
        assert_eq!(t.lifecycle_target, LifecycleState::StopTriggered);
    }

    #[test]
    fn take_profit_triggers_for_both_sides() {
        let ev = ExitEvaluator::new(ExitPolicy::default(), expiry());
        let p = position(Side::Long, 0.50, LifecycleState::Monitoring);
        let t = ev.evaluate(&p, 0.80, mid_window_ms()).unwrap();
        assert_eq!(t.kind, ExitTriggerKind::TakeProfit);
        assert_eq!(t.lifecycle_target, LifecycleState::TpTriggered);

        let p = position(Side::Short, 0.50, LifecycleState::Monitoring);
        let t = ev.evaluate(&p, 0.20, mid_window_ms()).unwrap();
        assert_eq!(t.kind, ExitTriggerKind::TakeProfit);

        // for a SHORT a rising price is the losing direction
        let t = ev.evaluate(&p, 0.80, mid_window_ms()).unwrap();
        assert_eq!(t.kind, ExitTriggerKind::StopLoss);
    }

    #[test]
    fn expiry_triggers_inside_warning_band_and_after_resolution() {
        let ev = ExitEvaluator::new(ExitPolicy::default(), expiry());
        let p = position(Side::Long, 0.50, LifecycleState::Monitoring);

        let t = ev.evaluate(&p, 0.50, ms("2026-01-31T10:14:30Z")).unwrap();
        assert_eq!(t.kind, ExitTriggerKind::Expiry);
        assert_eq!(t.lifecycle_target, LifecycleState::Expiry);

        let t = ev.evaluate(&p, 0.50, ms("2026-01-31T10:16:00Z")).unwrap();
        assert_eq!(t.kind, ExitTriggerKind::Expiry);

        // mid-window, no trigger
        assert!(ev.evaluate(&p, 0.50, mid_window_ms()).is_none());
    }

    #[test]
    fn erroring_price_checks_fall_through_to_expiry() {
        let ev = ExitEvaluator::new(ExitPolicy::default(), expiry());
        let p = position(Side::Long, 0.50, LifecycleState::Monitoring);
        // NaN price makes stop-loss and take-profit error; expiry still fires
        let t = ev.evaluate(&p, f64::NAN, ms("2026-01-31T10:16:00Z")).unwrap();
        assert_eq!(t.kind, ExitTriggerKind::Expiry);
    }

    #[test]
    fn erroring_expiry_check_yields_no_trigger_not_a_panic() {
        let ev = ExitEvaluator::new(ExitPolicy::default(), expiry());
        let mut p = position(Side::Long, 0.50, LifecycleState::Monitoring);
        p.window_id = "garbage".into();
        assert!(ev.evaluate(&p, 0.50, mid_window_ms()).is_none());
    }

    #[test]
    fn trailing_stop_uses_high_water_mark() {
        let ev = ExitEvaluator::new(
            ExitPolicy {
                stop_loss_pct: 0.90,
                take_profit_pct: 5.0,
                trailing_stop_pct: Some(0.10),
                expiry_enabled: false,
            },
            expiry(),
        );
        let mut p = position(Side::Long, 0.50, LifecycleState::Monitoring);
        p.high_water_mark = Some(0.70);
        // gave back (0.70-0.62)/0.70 = 11.4% >= 10%
        let t = ev.evaluate(&p, 0.62, mid_window_ms()).unwrap();
        assert_eq!(t.kind, ExitTriggerKind::StopLoss);
        // inside the allowance, no trigger
        assert!(ev.evaluate(&p, 0.66, mid_window_ms()).is_none());
    }

    #[test]
    fn expiry_disabled_never_fires() {
        let ev = ExitEvaluator::new(
            ExitPolicy {
                expiry_enabled: false,
                ..Default::default()
            },
            expiry(),
        );
        let p = position(Side::Long, 0.50, LifecycleState::Monitoring);
        assert!(ev.evaluate(&p, 0.50, ms("2026-01-31T10:16:00Z")).is_none());
    }
}
