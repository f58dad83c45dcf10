//! Fair-value probability for binary windows
//!
//! Under GBM with drift mu and volatility sigma, the probability that spot
//! finishes above the strike after t seconds is `Phi(d)` with
//! `d = (ln(S/K) + (mu - sigma^2/2) t) / (sigma sqrt(t))`, t in years.

use statrs::distribution::{Continuous, ContinuousCDF, Normal};
use std::sync::OnceLock;

use super::SECONDS_PER_YEAR;
use crate::models::Direction;

/// Implied-vol solver bounds and iteration budget
const IV_MIN: f64 = 0.01;
const IV_MAX: f64 = 10.0;
const IV_MAX_ITER: usize = 50;
const IV_TOL: f64 = 1e-6;
const IV_INITIAL_GUESS: f64 = 0.8;

fn std_normal() -> &'static Normal {
    static NORMAL: OnceLock<Normal> = OnceLock::new();
    NORMAL.get_or_init(|| Normal::new(0.0, 1.0).expect("unit normal parameters are valid"))
}

/// P(spot >= strike at expiry) under GBM
///
/// Deterministic at the boundary: with no time or no volatility left the
/// outcome is already decided by where spot sits relative to the strike.
pub fn fair_probability_up(spot: f64, strike: f64, t_sec: f64, sigma: f64, mu: f64) -> f64 {
    if !(spot > 0.0 && strike > 0.0) {
        return if spot >= strike { 1.0 } else { 0.0 };
    }
    if t_sec <= 0.0 || sigma <= 0.0 {
        return if spot >= strike { 1.0 } else { 0.0 };
    }

    let t = t_sec / SECONDS_PER_YEAR;
    let d = ((spot / strike).ln() + (mu - sigma * sigma / 2.0) * t) / (sigma * t.sqrt());
    std_normal().cdf(d)
}

/// Solve for the volatility implied by a market probability
///
/// Newton-Raphson on the binary vega, bounded to [0.01, 10]. Returns None
/// when the inputs are degenerate or the solver fails to converge.
pub fn implied_vol(p_market: f64, spot: f64, strike: f64, t_sec: f64, mu: f64) -> Option<f64> {
    if !(p_market > 0.0 && p_market < 1.0) {
        return None;
    }
    if !(spot > 0.0 && strike > 0.0 && t_sec > 0.0) {
        return None;
    }

    let t = t_sec / SECONDS_PER_YEAR;
    let sqrt_t = t.sqrt();
    // d(sigma) = a / sigma - b * sigma with these constants
    let a = ((spot / strike).ln() + mu * t) / sqrt_t;
    let b = sqrt_t / 2.0;
    // for a >= 0 the price is strictly decreasing in sigma, so a bracket
    // can rescue Newton steps that fly out of range
    let monotone = a >= 0.0;

    let n = std_normal();
    let (mut lo, mut hi) = (IV_MIN, IV_MAX);
    let mut sigma = IV_INITIAL_GUESS;
    for _ in 0..IV_MAX_ITER {
        let d = a / sigma - b * sigma;
        let diff = n.cdf(d) - p_market;
        if diff.abs() < IV_TOL {
            return Some(sigma);
        }
        if monotone {
            if diff > 0.0 {
                lo = sigma;
            } else {
                hi = sigma;
            }
        }
        // vega = phi(d) * d'(sigma), d'(sigma) = -a/sigma^2 - b
        let vega = n.pdf(d) * (-a / (sigma * sigma) - b);
        let newton = if vega.is_finite() && vega.abs() > 1e-12 {
            Some(sigma - diff / vega)
        } else {
            None
        };
        sigma = match newton {
            Some(next) if monotone && (next <= lo || next >= hi) => (lo + hi) / 2.0,
            Some(next) => next.clamp(IV_MIN, IV_MAX),
            None if monotone => (lo + hi) / 2.0,
            None => return None,
        };
    }
    None
}

/// A tradable gap between model and market
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeCall {
    /// Which outcome the model says is underpriced
    pub direction: Direction,
    /// |p_fair - p_market|
    pub edge: f64,
}

/// Classify the fair-vs-market gap; None below the threshold
pub fn classify_edge(p_fair: f64, p_market: f64, threshold: f64) -> Option<EdgeCall> {
    let gap = p_fair - p_market;
    if gap.abs() < threshold {
        return None;
    }
    Some(EdgeCall {
        direction: if gap > 0.0 {
            Direction::Up
        } else {
            Direction::Down
        },
        edge: gap.abs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_the_money_is_near_even() {
        let p = fair_probability_up(100.0, 100.0, 600.0, 0.8, 0.0);
        assert!((p - 0.5).abs() < 0.01, "got {p}");
    }

    #[test]
    fn deterministic_when_no_time_or_no_vol() {
        assert_eq!(fair_probability_up(101.0, 100.0, 0.0, 0.8, 0.0), 1.0);
        assert_eq!(fair_probability_up(99.0, 100.0, -5.0, 0.8, 0.0), 0.0);
        assert_eq!(fair_probability_up(100.0, 100.0, 600.0, 0.0, 0.0), 1.0);
        assert_eq!(fair_probability_up(99.99, 100.0, 600.0, -1.0, 0.0), 0.0);
    }

    #[test]
    fn monotone_in_spot_and_strike() {
        // non-decreasing in S, non-increasing in K
        let mut last = 0.0;
        for s in [95.0, 98.0, 100.0, 102.0, 105.0] {
            let p = fair_probability_up(s, 100.0, 600.0, 0.8, 0.0);
            assert!(p >= last - 1e-12, "p(UP) must not decrease in spot");
            last = p;
        }
        let mut last = 1.0;
        for k in [95.0, 98.0, 100.0, 102.0, 105.0] {
            let p = fair_probability_up(100.0, k, 600.0, 0.8, 0.0);
            assert!(p <= last + 1e-12, "p(UP) must not increase in strike");
            last = p;
        }
    }

    #[test]
    fn implied_vol_recovers_forward_price() {
        for sigma in [0.2, 0.8, 2.5] {
            let p = fair_probability_up(100.2, 100.0, 420.0, sigma, 0.0);
            let iv = implied_vol(p, 100.2, 100.0, 420.0, 0.0).unwrap();
            assert!(
                (iv - sigma).abs() < 1e-3,
                "sigma={sigma} p={p} recovered={iv}"
            );
        }
    }

    #[test]
    fn implied_vol_rejects_degenerate_inputs() {
        assert!(implied_vol(0.0, 100.0, 100.0, 600.0, 0.0).is_none());
        assert!(implied_vol(1.0, 100.0, 100.0, 600.0, 0.0).is_none());
        assert!(implied_vol(0.6, 100.0, 100.0, 0.0, 0.0).is_none());
        assert!(implied_vol(0.6, 0.0, 100.0, 600.0, 0.0).is_none());
    }

    #[test]
    fn implied_vol_stays_in_bounds() {
        // a probability far from what any in-bounds sigma can produce at
        // this moneyness still must not escape the clamp
        if let Some(iv) = implied_vol(0.999, 100.0, 100.01, 10.0, 0.0) {
            assert!((IV_MIN..=IV_MAX).contains(&iv));
        }
    }

    #[test]
    fn edge_classification_thresholds() {
        assert!(classify_edge(0.52, 0.50, 0.03).is_none());
        let e = classify_edge(0.55, 0.50, 0.03).unwrap();
        assert_eq!(e.direction, Direction::Up);
        assert!((e.edge - 0.05).abs() < 1e-12);
        let e = classify_edge(0.40, 0.50, 0.03).unwrap();
        assert_eq!(e.direction, Direction::Down);
        assert!((e.edge - 0.10).abs() < 1e-12);
    }
}
