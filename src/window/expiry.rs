//! Window-expiry evaluation and settlement
//!
//! Classifies positions against their window clock (safe / expiring /
//! resolved) and computes the binary settlement P&L once a resolution price
//! is known.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use super::codec::{parse_window_id, WindowId};
use crate::models::Side;

/// Timing parameters, validated at construction
#[derive(Debug, Clone)]
pub struct ExpiryEvaluatorConfig {
    pub window_duration_ms: i64,
    pub expiry_warning_threshold_ms: i64,
    pub min_time_remaining_ms: i64,
}

impl ExpiryEvaluatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_duration_ms <= 0 {
            bail!("window_duration_ms must be > 0, got {}", self.window_duration_ms);
        }
        if self.expiry_warning_threshold_ms < 0
            || self.expiry_warning_threshold_ms >= self.window_duration_ms
        {
            bail!(
                "expiry_warning_threshold_ms must be in [0, {}), got {}",
                self.window_duration_ms,
                self.expiry_warning_threshold_ms
            );
        }
        if self.min_time_remaining_ms < 0 {
            bail!(
                "min_time_remaining_ms must be >= 0, got {}",
                self.min_time_remaining_ms
            );
        }
        Ok(())
    }
}

/// Timing classification of one window at one instant
#[derive(Debug, Clone)]
pub struct WindowExpiryStatus {
    pub window: WindowId,
    pub time_remaining_ms: i64,
    /// Inside the warning band: 0 < remaining <= threshold
    pub is_expiring: bool,
    /// At or past resolution: remaining <= 0
    pub is_resolved: bool,
}

/// Entry-time gate verdict
#[derive(Debug, Clone)]
pub struct EntryGate {
    pub allowed: bool,
    pub reason: Option<String>,
    pub time_remaining_ms: Option<i64>,
}

/// Binary settlement outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementOutcome {
    Win,
    Loss,
}

/// Settlement result for one position
#[derive(Debug, Clone)]
pub struct Settlement {
    /// None when the resolution price is missing
    pub outcome: Option<SettlementOutcome>,
    pub pnl: f64,
    pub pnl_pct: f64,
}

/// Evaluates window timing and settlement
#[derive(Debug, Clone)]
pub struct WindowExpiryEvaluator {
    config: ExpiryEvaluatorConfig,
}

impl WindowExpiryEvaluator {
    pub fn new(config: ExpiryEvaluatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ExpiryEvaluatorConfig {
        &self.config
    }

    /// Classify a window against the clock
    pub fn check_expiry(&self, window_id: &str, now_ms: i64) -> Result<WindowExpiryStatus> {
        let window = parse_window_id(window_id)?;
        let time_remaining_ms = window.end_ms() - now_ms;
        Ok(WindowExpiryStatus {
            is_expiring: time_remaining_ms > 0
                && time_remaining_ms <= self.config.expiry_warning_threshold_ms,
            is_resolved: time_remaining_ms <= 0,
            window,
            time_remaining_ms,
        })
    }

    /// Entry-time gate: enough runway left in the window?
    ///
    /// Never errors out to the caller; an unparseable id is simply not
    /// enterable, with the parser's complaint as the reason.
    pub fn can_enter_window(&self, window_id: &str, now_ms: i64) -> EntryGate {
        match parse_window_id(window_id) {
            Ok(window) => {
                let remaining = window.end_ms() - now_ms;
                if remaining >= self.config.min_time_remaining_ms {
                    EntryGate {
                        allowed: true,
                        reason: None,
                        time_remaining_ms: Some(remaining),
                    }
                } else {
                    EntryGate {
                        allowed: false,
                        reason: Some(format!(
                            "time remaining {remaining}ms below floor {}ms",
                            self.config.min_time_remaining_ms
                        )),
                        time_remaining_ms: Some(remaining),
                    }
                }
            }
            Err(e) => EntryGate {
                allowed: false,
                reason: Some(format!("invalid window id: {e}")),
                time_remaining_ms: None,
            },
        }
    }

    /// Settlement P&L for a binary payoff in [0,1]
    ///
    /// LONG: pnl = size * (R - entry), WIN iff R = 1.
    /// SHORT: pnl = size * (entry - R), WIN iff R = 0.
    pub fn settle(
        &self,
        side: Side,
        size: f64,
        entry_price: f64,
        resolution_price: Option<f64>,
    ) -> Settlement {
        let Some(r) = resolution_price else {
            return Settlement {
                outcome: None,
                pnl: 0.0,
                pnl_pct: 0.0,
            };
        };

        let won = match side {
            Side::Long => r >= 1.0,
            Side::Short => r <= 0.0,
        };
        let pnl = match side {
            Side::Long => size * (r - entry_price),
            Side::Short => size * (entry_price - r),
        };
        let cost_basis = size * entry_price;
        let pnl_pct = if cost_basis > 0.0 { pnl / cost_basis } else { 0.0 };

        Settlement {
            outcome: Some(if won {
                SettlementOutcome::Win
            } else {
                SettlementOutcome::Loss
            }),
            pnl,
            pnl_pct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn evaluator() -> WindowExpiryEvaluator {
        WindowExpiryEvaluator::new(ExpiryEvaluatorConfig {
            window_duration_ms: 15 * 60 * 1000,
            expiry_warning_threshold_ms: 60_000,
            min_time_remaining_ms: 120_000,
        })
        .unwrap()
    }

    fn ms(rfc3339: &str) -> i64 {
        chrono::DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
            .timestamp_millis()
    }

    #[test]
    fn config_validation_fails_loud() {
        assert!(WindowExpiryEvaluator::new(ExpiryEvaluatorConfig {
            window_duration_ms: 0,
            expiry_warning_threshold_ms: 0,
            min_time_remaining_ms: 0,
        })
        .is_err());
        assert!(WindowExpiryEvaluator::new(ExpiryEvaluatorConfig {
            window_duration_ms: 900_000,
            expiry_warning_threshold_ms: 900_000,
            min_time_remaining_ms: 0,
        })
        .is_err());
        assert!(WindowExpiryEvaluator::new(ExpiryEvaluatorConfig {
            window_duration_ms: 900_000,
            expiry_warning_threshold_ms: 60_000,
            min_time_remaining_ms: -1,
        })
        .is_err());
    }

    #[test]
    fn zero_remaining_is_resolved_not_expiring() {
        let ev = evaluator();
        let status = ev
            .check_expiry("btc-15m-2026-01-31-10:00", ms("2026-01-31T10:15:00Z"))
            .unwrap();
        assert_eq!(status.time_remaining_ms, 0);
        assert!(status.is_resolved);
        assert!(!status.is_expiring);
    }

    #[test]
    fn exactly_at_warning_threshold_is_expiring() {
        let ev = evaluator();
        let status = ev
            .check_expiry("btc-15m-2026-01-31-10:00", ms("2026-01-31T10:14:00Z"))
            .unwrap();
        assert_eq!(status.time_remaining_ms, 60_000);
        assert!(status.is_expiring);
        assert!(!status.is_resolved);

        // one ms earlier leaves the band
        let status = ev
            .check_expiry("btc-15m-2026-01-31-10:00", ms("2026-01-31T10:14:00Z") - 1)
            .unwrap();
        assert!(!status.is_expiring);
    }

    #[test]
    fn entry_gate_honors_floor_and_bad_ids() {
        let ev = evaluator();
        let g = ev.can_enter_window("btc-15m-2026-01-31-10:00", ms("2026-01-31T10:13:00Z"));
        assert!(g.allowed); // exactly 120s left
        let g = ev.can_enter_window(
            "btc-15m-2026-01-31-10:00",
            ms("2026-01-31T10:13:00Z") + 1,
        );
        assert!(!g.allowed);

        let g = ev.can_enter_window("not-a-window", 0);
        assert!(!g.allowed);
        assert!(g.reason.unwrap().contains("invalid window id"));
        assert!(g.time_remaining_ms.is_none());
    }

    #[test]
    fn settlement_long_win() {
        // LONG size=10 entry=0.50, resolved UP
        let ev = evaluator();
        let s = ev.settle(Side::Long, 10.0, 0.50, Some(1.0));
        assert_eq!(s.outcome, Some(SettlementOutcome::Win));
        assert!((s.pnl - 5.0).abs() < 1e-9);
        assert!((s.pnl_pct - 1.0).abs() < 1e-9);
    }

    #[test]
    fn settlement_short_sides() {
        let ev = evaluator();
        let s = ev.settle(Side::Short, 10.0, 0.40, Some(0.0));
        assert_eq!(s.outcome, Some(SettlementOutcome::Win));
        assert!((s.pnl - 4.0).abs() < 1e-9);

        let s = ev.settle(Side::Short, 10.0, 0.40, Some(1.0));
        assert_eq!(s.outcome, Some(SettlementOutcome::Loss));
        assert!((s.pnl + 6.0).abs() < 1e-9);
    }

    #[test]
    fn settlement_pnl_bounded_by_size() {
        let ev = evaluator();
        for side in [Side::Long, Side::Short] {
            for r in [0.0, 1.0] {
                for entry in [0.01, 0.5, 1.0] {
                    let s = ev.settle(side, 10.0, entry, Some(r));
                    assert!(s.pnl.abs() <= 10.0 + 1e-9);
                }
            }
        }
    }

    #[test]
    fn missing_resolution_reports_null_outcome() {
        let ev = evaluator();
        let s = ev.settle(Side::Long, 10.0, 0.50, None);
        assert!(s.outcome.is_none());
        assert_eq!(s.pnl, 0.0);
        assert_eq!(s.pnl_pct, 0.0);
    }
}
