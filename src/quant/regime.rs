//! Regime classification per asset
//!
//! Three independent axes (volatility, trend, liquidity) collapse into one
//! combined tag via a fixed rule table. The combined tag carries a size
//! multiplier strategies apply to their base sizing.

use std::collections::{HashMap, VecDeque};

use crate::models::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolRegime {
    Low,
    Medium,
    High,
}

impl VolRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolRegime::Low => "LOW",
            VolRegime::Medium => "MEDIUM",
            VolRegime::High => "HIGH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendClass {
    Ranging,
    Trending,
    StrongTrend,
}

impl TrendClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendClass::Ranging => "RANGING",
            TrendClass::Trending => "TRENDING",
            TrendClass::StrongTrend => "STRONG_TREND",
        }
    }

    fn is_trending(&self) -> bool {
        !matches!(self, TrendClass::Ranging)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiquidityRegime {
    Thin,
    Normal,
    Thick,
}

impl LiquidityRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            LiquidityRegime::Thin => "THIN",
            LiquidityRegime::Normal => "NORMAL",
            LiquidityRegime::Thick => "THICK",
        }
    }
}

/// Combined regime tag with its recommended size multiplier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombinedRegime {
    CautionThinLiquidity,
    MomentumFavorable,
    ChoppyAvoid,
    MeanReversionFavorable,
    TrendFollowing,
    Neutral,
}

impl CombinedRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            CombinedRegime::CautionThinLiquidity => "CAUTION_THIN_LIQUIDITY",
            CombinedRegime::MomentumFavorable => "MOMENTUM_FAVORABLE",
            CombinedRegime::ChoppyAvoid => "CHOPPY_AVOID",
            CombinedRegime::MeanReversionFavorable => "MEAN_REVERSION_FAVORABLE",
            CombinedRegime::TrendFollowing => "TREND_FOLLOWING",
            CombinedRegime::Neutral => "NEUTRAL",
        }
    }

    /// Recommended position-size multiplier for strategies
    pub fn size_multiplier(&self) -> f64 {
        match self {
            CombinedRegime::CautionThinLiquidity => 0.25,
            CombinedRegime::MomentumFavorable => 1.25,
            CombinedRegime::ChoppyAvoid => 0.0,
            CombinedRegime::MeanReversionFavorable => 1.0,
            CombinedRegime::TrendFollowing => 1.0,
            CombinedRegime::Neutral => 0.75,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegimeConfig {
    /// Annualized realized-vol boundaries
    pub vol_low: f64,
    pub vol_high: f64,
    /// Samples in the trend lookback
    pub trend_lookback: usize,
    /// |relative price change| boundaries over the lookback
    pub trend_threshold: f64,
    pub strong_trend_threshold: f64,
    /// Average spread boundaries, basis points
    pub thin_spread_bps: f64,
    pub thick_spread_bps: f64,
    pub max_samples: usize,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            vol_low: 0.3,
            vol_high: 0.8,
            trend_lookback: 20,
            trend_threshold: 0.02,
            strong_trend_threshold: 0.05,
            thin_spread_bps: 200.0,
            thick_spread_bps: 50.0,
            max_samples: 128,
        }
    }
}

/// Full assessment for one asset at one instant
#[derive(Debug, Clone, Copy)]
pub struct RegimeAssessment {
    pub vol: VolRegime,
    pub trend: TrendClass,
    pub trend_direction: Option<Direction>,
    pub liquidity: LiquidityRegime,
    pub combined: CombinedRegime,
    pub size_multiplier: f64,
}

#[derive(Debug, Default)]
struct AssetRegimeState {
    prices: VecDeque<f64>,
    spreads_bps: VecDeque<f64>,
}

/// Classifies volatility / trend / liquidity regimes per asset
pub struct RegimeDetector {
    config: RegimeConfig,
    assets: HashMap<String, AssetRegimeState>,
}

impl RegimeDetector {
    pub fn new(config: RegimeConfig) -> Self {
        Self {
            config,
            assets: HashMap::new(),
        }
    }

    pub fn record(&mut self, asset: &str, spot: f64, spread_bps: Option<f64>) {
        if !(spot > 0.0 && spot.is_finite()) {
            return;
        }
        let max = self.config.max_samples;
        let state = self.assets.entry(asset.to_string()).or_default();
        state.prices.push_back(spot);
        while state.prices.len() > max {
            state.prices.pop_front();
        }
        if let Some(s) = spread_bps {
            if s.is_finite() && s >= 0.0 {
                state.spreads_bps.push_back(s);
                while state.spreads_bps.len() > max {
                    state.spreads_bps.pop_front();
                }
            }
        }
    }

    /// Classify using the caller-supplied annualized realized vol
    pub fn assess(&self, asset: &str, realized_vol: f64) -> RegimeAssessment {
        let state = self.assets.get(asset);

        let vol = if realized_vol < self.config.vol_low {
            VolRegime::Low
        } else if realized_vol < self.config.vol_high {
            VolRegime::Medium
        } else {
            VolRegime::High
        };

        let (trend, trend_direction) = self.classify_trend(state);
        let liquidity = self.classify_liquidity(state);
        let combined = combine(vol, trend, liquidity);

        RegimeAssessment {
            vol,
            trend,
            trend_direction,
            liquidity,
            combined,
            size_multiplier: combined.size_multiplier(),
        }
    }

    fn classify_trend(&self, state: Option<&AssetRegimeState>) -> (TrendClass, Option<Direction>) {
        let Some(state) = state else {
            return (TrendClass::Ranging, None);
        };
        let lookback = self.config.trend_lookback;
        if state.prices.len() < lookback {
            return (TrendClass::Ranging, None);
        }
        let newest = *state.prices.back().unwrap_or(&0.0);
        let oldest = state.prices[state.prices.len() - lookback];
        if oldest <= 0.0 {
            return (TrendClass::Ranging, None);
        }
        let change = (newest - oldest) / oldest;
        let direction = if change > 0.0 {
            Direction::Up
        } else {
            Direction::Down
        };
        let class = if change.abs() >= self.config.strong_trend_threshold {
            TrendClass::StrongTrend
        } else if change.abs() >= self.config.trend_threshold {
            TrendClass::Trending
        } else {
            return (TrendClass::Ranging, None);
        };
        (class, Some(direction))
    }

    fn classify_liquidity(&self, state: Option<&AssetRegimeState>) -> LiquidityRegime {
        let Some(state) = state else {
            return LiquidityRegime::Normal;
        };
        if state.spreads_bps.is_empty() {
            return LiquidityRegime::Normal;
        }
        let avg = state.spreads_bps.iter().sum::<f64>() / state.spreads_bps.len() as f64;
        if avg > self.config.thin_spread_bps {
            LiquidityRegime::Thin
        } else if avg < self.config.thick_spread_bps {
            LiquidityRegime::Thick
        } else {
            LiquidityRegime::Normal
        }
    }
}

/// The combined-tag rule table; order matters, thin liquidity wins
fn combine(vol: VolRegime, trend: TrendClass, liquidity: LiquidityRegime) -> CombinedRegime {
    if liquidity == LiquidityRegime::Thin {
        return CombinedRegime::CautionThinLiquidity;
    }
    match (vol, trend.is_trending()) {
        (VolRegime::High, true) => CombinedRegime::MomentumFavorable,
        (VolRegime::High, false) => CombinedRegime::ChoppyAvoid,
        (VolRegime::Low, false) => CombinedRegime::MeanReversionFavorable,
        (VolRegime::Medium, true) => CombinedRegime::TrendFollowing,
        _ => CombinedRegime::Neutral,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_trend(det: &mut RegimeDetector, start: f64, step: f64, n: usize) {
        let mut p = start;
        for _ in 0..n {
            det.record("btc", p, Some(100.0));
            p *= 1.0 + step;
        }
    }

    #[test]
    fn vol_regime_boundaries() {
        let det = RegimeDetector::new(RegimeConfig::default());
        assert_eq!(det.assess("btc", 0.1).vol, VolRegime::Low);
        assert_eq!(det.assess("btc", 0.3).vol, VolRegime::Medium);
        assert_eq!(det.assess("btc", 0.79).vol, VolRegime::Medium);
        assert_eq!(det.assess("btc", 0.8).vol, VolRegime::High);
    }

    #[test]
    fn trend_classification_with_direction() {
        let mut det = RegimeDetector::new(RegimeConfig::default());
        // ~+0.1% per step over 20 samples is ~2% -> TRENDING up
        feed_trend(&mut det, 100.0, 0.0012, 25);
        let a = det.assess("btc", 0.5);
        assert_eq!(a.trend, TrendClass::Trending);
        assert_eq!(a.trend_direction, Some(Direction::Up));

        let mut det = RegimeDetector::new(RegimeConfig::default());
        feed_trend(&mut det, 100.0, -0.004, 25);
        let a = det.assess("btc", 0.5);
        assert_eq!(a.trend, TrendClass::StrongTrend);
        assert_eq!(a.trend_direction, Some(Direction::Down));

        let mut det = RegimeDetector::new(RegimeConfig::default());
        feed_trend(&mut det, 100.0, 0.0, 25);
        let a = det.assess("btc", 0.5);
        assert_eq!(a.trend, TrendClass::Ranging);
        assert_eq!(a.trend_direction, None);
    }

    #[test]
    fn liquidity_thresholds() {
        let mut det = RegimeDetector::new(RegimeConfig::default());
        for _ in 0..10 {
            det.record("btc", 100.0, Some(250.0));
        }
        assert_eq!(det.assess("btc", 0.5).liquidity, LiquidityRegime::Thin);

        let mut det = RegimeDetector::new(RegimeConfig::default());
        for _ in 0..10 {
            det.record("btc", 100.0, Some(20.0));
        }
        assert_eq!(det.assess("btc", 0.5).liquidity, LiquidityRegime::Thick);

        // no spread data defaults to NORMAL
        let det = RegimeDetector::new(RegimeConfig::default());
        assert_eq!(det.assess("btc", 0.5).liquidity, LiquidityRegime::Normal);
    }

    #[test]
    fn combined_rule_table() {
        use CombinedRegime::*;
        assert_eq!(
            combine(VolRegime::High, TrendClass::Trending, LiquidityRegime::Thin),
            CautionThinLiquidity
        );
        assert_eq!(
            combine(VolRegime::High, TrendClass::Trending, LiquidityRegime::Normal),
            MomentumFavorable
        );
        assert_eq!(
            combine(VolRegime::High, TrendClass::Ranging, LiquidityRegime::Normal),
            ChoppyAvoid
        );
        assert_eq!(
            combine(VolRegime::Low, TrendClass::Ranging, LiquidityRegime::Thick),
            MeanReversionFavorable
        );
        assert_eq!(
            combine(VolRegime::Medium, TrendClass::StrongTrend, LiquidityRegime::Normal),
            TrendFollowing
        );
        assert_eq!(
            combine(VolRegime::Low, TrendClass::Trending, LiquidityRegime::Normal),
            Neutral
        );
        assert_eq!(
            combine(VolRegime::Medium, TrendClass::Ranging, LiquidityRegime::Normal),
            Neutral
        );
    }

    #[test]
    fn choppy_regime_zeroes_sizing() {
        assert_eq!(CombinedRegime::ChoppyAvoid.size_multiplier(), 0.0);
        assert!(CombinedRegime::MomentumFavorable.size_multiplier() > 1.0);
    }
}
