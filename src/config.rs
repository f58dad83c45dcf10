//! Engine configuration
//!
//! Layered the same way across every section: hard defaults -> optional TOML
//! file -> environment overrides. Validation is fail-loud at init; a process
//! that boots with a bad config is worse than one that refuses to start.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Window timing parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    /// Window length in milliseconds
    pub window_duration_ms: i64,
    /// Entry-eligibility floor: skip windows with less remaining time
    pub min_time_remaining_ms: i64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            window_duration_ms: 15 * 60 * 1000, // 15 minute windows
            min_time_remaining_ms: 120_000,     // don't enter the last 2 minutes
        }
    }
}

/// Window-expiry evaluation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowExpiryConfig {
    /// Master toggle for expiry-driven exits
    pub enabled: bool,
    /// Positions inside this band before resolution are flagged expiring
    pub expiry_warning_threshold_ms: i64,
}

impl Default for WindowExpiryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            expiry_warning_threshold_ms: 60_000,
        }
    }
}

/// Entry safeguard policies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafeguardConfig {
    /// Cap across all strategies
    pub max_concurrent_positions: usize,
    /// Per-symbol cool-down; 0 disables the check
    pub min_entry_interval_ms: i64,
    /// Cap per tick cycle
    pub max_entries_per_tick: u32,
    /// Master toggle for (window, strategy) duplicate prevention
    pub duplicate_window_prevention: bool,
    /// Reservations older than this are swept
    pub reservation_timeout_ms: i64,
}

impl Default for SafeguardConfig {
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

/// Position-level risk limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Maximum size of a single position, in shares
    pub max_position_size: f64,
    /// Maximum total exposure (sum of size * entry_price) across open positions
    pub max_exposure: f64,
    /// Per-market open position cap; None or 0 means no limit
    pub position_limit_per_market: Option<u32>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_size: 1_000.0,
            max_exposure: 5_000.0,
            position_limit_per_market: None,
        }
    }
}

/// Exit trigger thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    /// Adverse move as a fraction of entry price that triggers the stop
    pub stop_loss_pct: f64,
    /// Favorable move as a fraction of entry price that takes profit
    pub take_profit_pct: f64,
    /// Optional trailing stop: give-back fraction from the high-water mark
    pub trailing_stop_pct: Option<f64>,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: 0.40,   // cut at -40% of entry
            take_profit_pct: 0.50, // take at +50% of entry
            trailing_stop_pct: None,
        }
    }
}

/// Quant model parameters shared by strategies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantConfig {
    /// Minimum |fair - market| probability gap to call an edge tradable
    pub edge_threshold: f64,
    /// Drift used in the fair-value model (annualized)
    pub drift: f64,
    /// EWMA decay for the volatility estimator
    pub ewma_lambda: f64,
    /// Fallback annualized volatility when no estimator has data
    pub fallback_vol: f64,
    /// Spot move detection threshold as |delta| / spot
    pub spot_move_threshold: f64,
    /// How long a spot-move event collects market snapshots, ms
    pub lag_tracking_duration_ms: i64,
    /// Concurrent tracked events per asset
    pub max_concurrent_lag_events: usize,
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            edge_threshold: 0.03,
            drift: 0.0,
            ewma_lambda: 0.90,
            fallback_vol: 0.8,
            spot_move_threshold: 5e-4,
            lag_tracking_duration_ms: 30_000,
            max_concurrent_lag_events: 50,
        }
    }
}

/// Orchestrator-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Execution mode: LIVE, PAPER or DRY_RUN
    pub mode: String,
    /// sqlite database path
    pub db_path: String,
    /// Reconciliation loop period, ms
    pub reconcile_interval_ms: i64,
    /// Stale-reservation sweep period, ms
    pub sweep_interval_ms: i64,
    /// Default order size in shares when a strategy does not size itself
    pub default_order_size: f64,
    /// Upper bound on any single exchange call, ms
    pub exchange_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: "PAPER".to_string(),
            db_path: "updown_bot.db".to_string(),
            reconcile_interval_ms: 60_000,
            sweep_interval_ms: 10_000,
            default_order_size: 10.0,
            exchange_timeout_ms: 5_000,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub trading: TradingConfig,
    pub window_expiry: WindowExpiryConfig,
    pub safeguards: SafeguardConfig,
    pub risk: RiskConfig,
    pub exit: ExitConfig,
    pub quant: QuantConfig,
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration: defaults, then optional TOML file, then env overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("read config file {}", p.display()))?;
                toml::from_str(&raw).with_context(|| format!("parse config {}", p.display()))?
            }
            None => Self::default(),
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Environment overrides for the knobs operators actually turn at runtime
    fn apply_env(&mut self) {
        if let Some(v) = env_parse::<i64>("UPDOWN_WINDOW_DURATION_MS") {
            if v > 0 {
                self.trading.window_duration_ms = v;
            }
        }
        if let Some(v) = env_parse::<i64>("UPDOWN_MIN_TIME_REMAINING_MS") {
            if v >= 0 {
                self.trading.min_time_remaining_ms = v;
            }
        }
        if let Some(v) = env_parse::<usize>("UPDOWN_MAX_CONCURRENT_POSITIONS") {
            if v > 0 {
                self.safeguards.max_concurrent_positions = v;
            }
        }
        if let Some(v) = env_parse::<i64>("UPDOWN_MIN_ENTRY_INTERVAL_MS") {
            if v >= 0 {
                self.safeguards.min_entry_interval_ms = v;
            }
        }
        if let Some(v) = env_parse::<u32>("UPDOWN_MAX_ENTRIES_PER_TICK") {
            if v > 0 {
                self.safeguards.max_entries_per_tick = v;
            }
        }
        if let Some(v) = env_parse::<i64>("UPDOWN_RESERVATION_TIMEOUT_MS") {
            if v > 0 {
                self.safeguards.reservation_timeout_ms = v;
            }
        }
        if let Ok(v) = std::env::var("UPDOWN_MODE") {
            if matches!(v.as_str(), "LIVE" | "PAPER" | "DRY_RUN") {
                self.engine.mode = v;
            }
        }
        if let Ok(v) = std::env::var("UPDOWN_DB_PATH") {
            if !v.trim().is_empty() {
                self.engine.db_path = v;
            }
        }
    }

    /// Fail-loud sanity checks, run once at init
    pub fn validate(&self) -> Result<()> {
        if self.trading.window_duration_ms <= 0 {
            bail!(
                "trading.window_duration_ms must be > 0, got {}",
                self.trading.window_duration_ms
            );
        }
        if self.window_expiry.expiry_warning_threshold_ms < 0
            || self.window_expiry.expiry_warning_threshold_ms >= self.trading.window_duration_ms
        {
            bail!(
                "window_expiry.expiry_warning_threshold_ms must be in [0, {}), got {}",
                self.trading.window_duration_ms,
                self.window_expiry.expiry_warning_threshold_ms
            );
        }
        if self.trading.min_time_remaining_ms < 0 {
            bail!(
                "trading.min_time_remaining_ms must be >= 0, got {}",
                self.trading.min_time_remaining_ms
            );
        }
        if self.safeguards.max_concurrent_positions == 0 {
            bail!("safeguards.max_concurrent_positions must be > 0");
        }
        if self.safeguards.reservation_timeout_ms <= 0 {
            bail!("safeguards.reservation_timeout_ms must be > 0");
        }
        if !(self.quant.ewma_lambda > 0.0 && self.quant.ewma_lambda < 1.0) {
            bail!(
                "quant.ewma_lambda must be in (0,1), got {}",
                self.quant.ewma_lambda
            );
        }
        if self.quant.edge_threshold <= 0.0 || self.quant.edge_threshold >= 0.5 {
            bail!(
                "quant.edge_threshold must be in (0,0.5), got {}",
                self.quant.edge_threshold
            );
        }
        if !(self.exit.stop_loss_pct > 0.0 && self.exit.take_profit_pct > 0.0) {
            bail!("exit thresholds must be positive");
        }
        if self.risk.max_position_size <= 0.0 || self.risk.max_exposure <= 0.0 {
            bail!("risk.max_position_size and risk.max_exposure must be > 0");
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn warning_band_must_fit_inside_window() {
        let mut cfg = Config::default();
        cfg.window_expiry.expiry_warning_threshold_ms = cfg.trading.window_duration_ms;
        assert!(cfg.validate().is_err());

        cfg.window_expiry.expiry_warning_threshold_ms = -1;
        assert!(cfg.validate().is_err());

        cfg.window_expiry.expiry_warning_threshold_ms = 0;
        cfg.validate().unwrap();
    }

    #[test]
    fn zero_window_duration_rejected() {
        let mut cfg = Config::default();
        cfg.trading.window_duration_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "[safeguards]\nmax_concurrent_positions = 3\n\n[risk]\nposition_limit_per_market = 2"
        )
        .unwrap();
        let cfg = Config::load(Some(f.path())).unwrap();
        assert_eq!(cfg.safeguards.max_concurrent_positions, 3);
        assert_eq!(cfg.risk.position_limit_per_market, Some(2));
        // untouched sections keep defaults
        assert_eq!(cfg.trading.window_duration_ms, 900_000);
    }
}
