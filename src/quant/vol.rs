//! Rolling volatility estimation per asset
//!
//! Three estimators run side by side over the spot stream: close-to-close
//! realized sigma over {10, 30, 60} samples, an EWMA of squared returns, and
//! Parkinson range volatility over 5-second min/max bars. `best_estimate`
//! averages whichever of {realized-30, EWMA, Parkinson} has data.

use std::collections::{HashMap, VecDeque};

use super::SECONDS_PER_YEAR;

/// Estimator tuning
#[derive(Debug, Clone)]
pub struct VolConfig {
    /// EWMA decay; weight on the previous variance estimate
    pub ewma_lambda: f64,
    /// Annualized fallback when nothing has data yet
    pub fallback_vol: f64,
    /// Estimate cache lifetime, ms
    pub cache_ms: i64,
    /// Min/max bar length for the Parkinson estimator, ms
    pub bar_duration_ms: i64,
    /// Rolling sample caps
    pub max_samples: usize,
    pub max_bars: usize,
}

impl Default for VolConfig {
    fn default() -> Self {
        Self {
            ewma_lambda: 0.90,
            fallback_vol: 0.8,
            cache_ms: 500,
            bar_duration_ms: 5_000,
            max_samples: 256,
            max_bars: 120,
        }
    }
}

/// One volatility snapshot, annualized
#[derive(Debug, Clone, Copy)]
pub struct VolEstimate {
    pub realized_10: Option<f64>,
    pub realized_30: Option<f64>,
    pub realized_60: Option<f64>,
    pub ewma: Option<f64>,
    pub parkinson: Option<f64>,
    /// Mean of the available {realized_30, ewma, parkinson}, else fallback
    pub best: f64,
    pub sample_count: usize,
}

#[derive(Debug, Clone, Copy)]
struct Bar {
    start_ms: i64,
    high: f64,
    low: f64,
}

#[derive(Debug, Default)]
struct AssetVolState {
    /// (timestamp ms, spot)
    spots: VecDeque<(i64, f64)>,
    /// (timestamp ms, market mid) kept alongside for diagnostics
    mids: VecDeque<(i64, f64)>,
    /// EWMA of per-second squared log returns
    ewma_var_per_sec: Option<f64>,
    bars: VecDeque<Bar>,
    current_bar: Option<Bar>,
    cached: Option<(i64, VolEstimate)>,
}

/// Per-asset rolling volatility estimator
pub struct VolatilityEstimator {
    config: VolConfig,
    assets: HashMap<String, AssetVolState>,
}

impl VolatilityEstimator {
    pub fn new(config: VolConfig) -> Self {
        Self {
            config,
            assets: HashMap::new(),
        }
    }

    /// Record one observation of spot (and optionally the market mid)
    pub fn record(&mut self, asset: &str, spot: f64, mid: Option<f64>, ts_ms: i64) {
        if !(spot > 0.0 && spot.is_finite()) {
            return;
        }
        let max_samples = self.config.max_samples;
        let bar_ms = self.config.bar_duration_ms;
        let max_bars = self.config.max_bars;
        let lambda = self.config.ewma_lambda;

        let state = self.assets.entry(asset.to_string()).or_default();
        state.cached = None;

        // EWMA update from the previous spot
        if let Some(&(prev_ts, prev_spot)) = state.spots.back() {
            let dt_sec = (ts_ms - prev_ts) as f64 / 1000.0;
            if dt_sec > 0.0 && prev_spot > 0.0 {
                let r = (spot / prev_spot).ln();
                let var_per_sec = (r * r) / dt_sec;
                state.ewma_var_per_sec = Some(match state.ewma_var_per_sec {
                    Some(prev) => lambda * prev + (1.0 - lambda) * var_per_sec,
                    None => var_per_sec,
                });
            }
        }

        state.spots.push_back((ts_ms, spot));
        while state.spots.len() > max_samples {
            state.spots.pop_front();
        }
        if let Some(m) = mid {
            state.mids.push_back((ts_ms, m));
            while state.mids.len() > max_samples {
                state.mids.pop_front();
            }
        }

        // Min/max bar roll
        let bar_start = (ts_ms / bar_ms) * bar_ms;
        match &mut state.current_bar {
            Some(bar) if bar.start_ms == bar_start => {
                bar.high = bar.high.max(spot);
                bar.low = bar.low.min(spot);
            }
            Some(bar) => {
                state.bars.push_back(*bar);
                while state.bars.len() > max_bars {
                    state.bars.pop_front();
                }
                state.current_bar = Some(Bar {
                    start_ms: bar_start,
                    high: spot,
                    low: spot,
                });
            }
            None => {
                state.current_bar = Some(Bar {
                    start_ms: bar_start,
                    high: spot,
                    low: spot,
                });
            }
        }
    }

    /// Current estimate for an asset; cached for `cache_ms`
    pub fn estimate(&mut self, asset: &str, now_ms: i64) -> VolEstimate {
        let cache_ms = self.config.cache_ms;
        let fallback = self.config.fallback_vol;
        let bar_sec = self.config.bar_duration_ms as f64 / 1000.0;

        let Some(state) = self.assets.get_mut(asset) else {
            return VolEstimate {
                realized_10: None,
                realized_30: None,
                realized_60: None,
                ewma: None,
                parkinson: None,
                best: fallback,
                sample_count: 0,
            };
        };

        if let Some((ts, cached)) = state.cached {
            if now_ms - ts <= cache_ms {
                return cached;
            }
        }

        let realized_10 = realized_sigma(&state.spots, 10);
        let realized_30 = realized_sigma(&state.spots, 30);
        let realized_60 = realized_sigma(&state.spots, 60);
        let ewma = state
            .ewma_var_per_sec
            .map(|v| (v * SECONDS_PER_YEAR).sqrt());
        let parkinson = parkinson_sigma(&state.bars, bar_sec);

        let components: Vec<f64> = [realized_30, ewma, parkinson]
            .into_iter()
            .flatten()
            .filter(|v| v.is_finite())
            .collect();
        let best = if components.is_empty() {
            fallback
        } else {
            components.iter().sum::<f64>() / components.len() as f64
        };

        let est = VolEstimate {
            realized_10,
            realized_30,
            realized_60,
            ewma,
            parkinson,
            best,
            sample_count: state.spots.len(),
        };
        state.cached = Some((now_ms, est));
        est
    }
}

/// Close-to-close realized sigma over the trailing `n` returns, annualized
/// by the observed mean sample interval
fn realized_sigma(spots: &VecDeque<(i64, f64)>, n: usize) -> Option<f64> {
    if spots.len() < n + 1 {
        return None;
    }
    let tail: Vec<&(i64, f64)> = spots.iter().rev().take(n + 1).collect();
    // tail is newest-first
    let mut returns = Vec::with_capacity(n);
    let mut total_dt_sec = 0.0;
    for w in tail.windows(2) {
        let (ts_new, s_new) = *w[0];
        let (ts_old, s_old) = *w[1];
        if s_old <= 0.0 || ts_new <= ts_old {
            return None;
        }
        returns.push((s_new / s_old).ln());
        total_dt_sec += (ts_new - ts_old) as f64 / 1000.0;
    }
    let mean_dt = total_dt_sec / returns.len() as f64;
    if mean_dt <= 0.0 {
        return None;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>()
        / returns.len() as f64;
    Some(var.sqrt() * (SECONDS_PER_YEAR / mean_dt).sqrt())
}

/// Parkinson range estimator over completed min/max bars
fn parkinson_sigma(bars: &VecDeque<Bar>, bar_sec: f64) -> Option<f64> {
    if bars.is_empty() || bar_sec <= 0.0 {
        return None;
    }
    let mut sum = 0.0;
    let mut used = 0usize;
    for bar in bars {
        if bar.low > 0.0 && bar.high >= bar.low {
            let hl = (bar.high / bar.low).ln();
            sum += hl * hl;
            used += 1;
        }
    }
    if used == 0 {
        return None;
    }
    let var_per_bar = sum / used as f64 / (4.0 * std::f64::consts::LN_2);
    Some(var_per_bar.sqrt() * (SECONDS_PER_YEAR / bar_sec).sqrt())
}
