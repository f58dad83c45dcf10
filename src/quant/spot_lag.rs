//! Spot-lag detection
//!
//! When spot jumps, the binary market takes time to reprice. Each detected
//! move opens an event that snapshots the market probability until the
//! tracking window closes, then measures how fast the market captured the
//! model-expected change (half = 50%, full = 90%).

use std::collections::{HashMap, VecDeque};
use tracing::debug;

use crate::models::Direction;

/// Fraction of the expected change that counts as half / full pricing
const HALF_CAPTURE: f64 = 0.50;
const FULL_CAPTURE: f64 = 0.90;

#[derive(Debug, Clone)]
pub struct SpotLagConfig {
    /// Move detection threshold as |delta| / spot
    pub move_threshold: f64,
    /// How long an event collects snapshots, ms
    pub tracking_duration_ms: i64,
    /// Concurrent tracked events per asset; the oldest is finalized early
    /// when the cap is hit
    pub max_concurrent_events: usize,
    /// Completed moves kept for inspection
    pub max_archived: usize,
}

impl Default for SpotLagConfig {
    fn default() -> Self {
        Self {
            move_threshold: 5e-4,
            tracking_duration_ms: 30_000,
            max_concurrent_events: 50,
            max_archived: 512,
        }
    }
}

/// One market observation inside a tracking window
#[derive(Debug, Clone, Copy)]
pub struct MoveSnapshot {
    pub dt_ms: i64,
    pub market_prob: f64,
    /// Fraction of the expected probability change captured so far
    pub captured_frac: f64,
}

/// A detected spot move under tracking
#[derive(Debug, Clone)]
pub struct SpotMoveEvent {
    pub crypto: String,
    pub t0_ms: i64,
    pub spot_before: f64,
    pub spot_after: f64,
    pub direction: Direction,
    /// Market probability just before the move
    pub market_prob_before: f64,
    /// Model fair probability just after the move
    pub expected_fair_prob: f64,
    pub snapshots: Vec<MoveSnapshot>,
}

impl SpotMoveEvent {
    fn expected_change(&self) -> f64 {
        self.expected_fair_prob - self.market_prob_before
    }

    fn first_capture_at(&self, frac: f64) -> Option<i64> {
        self.snapshots
            .iter()
            .find(|s| s.captured_frac >= frac)
            .map(|s| s.dt_ms)
    }
}

/// A finalized move with its pricing-speed verdict
#[derive(Debug, Clone)]
pub struct CompletedMove {
    pub event: SpotMoveEvent,
    /// First dt at which the market captured >= 50% of the expected change
    pub half_pricing_ms: Option<i64>,
    /// First dt at which it captured >= 90%
    pub full_pricing_ms: Option<i64>,
}

/// Per-direction aggregate of completed moves
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectionStats {
    pub moves: u64,
    pub half_priced: u64,
    pub full_priced: u64,
    pub avg_half_pricing_ms: f64,
    pub avg_full_pricing_ms: f64,
}

impl DirectionStats {
    fn absorb(&mut self, m: &CompletedMove) {
        self.moves += 1;
        if let Some(h) = m.half_pricing_ms {
            let total = self.avg_half_pricing_ms * self.half_priced as f64 + h as f64;
            self.half_priced += 1;
            self.avg_half_pricing_ms = total / self.half_priced as f64;
        }
        if let Some(f) = m.full_pricing_ms {
            let total = self.avg_full_pricing_ms * self.full_priced as f64 + f as f64;
            self.full_priced += 1;
            self.avg_full_pricing_ms = total / self.full_priced as f64;
        }
    }
}

#[derive(Debug, Default)]
struct AssetLagState {
    active: VecDeque<SpotMoveEvent>,
    last_spot: Option<f64>,
    last_market_prob: Option<f64>,
    up_stats: DirectionStats,
    down_stats: DirectionStats,
}

/// Detects spot moves and tracks market catch-up per asset
pub struct SpotLagAnalyzer {
    config: SpotLagConfig,
    assets: HashMap<String, AssetLagState>,
    archived: VecDeque<CompletedMove>,
}

impl SpotLagAnalyzer {
    pub fn new(config: SpotLagConfig) -> Self {
        Self {
            config,
            assets: HashMap::new(),
            archived: VecDeque::new(),
        }
    }

    /// Feed one tick; returns any events finalized on this tick
    ///
    /// `fair_prob` is the model's fair probability for the current window at
    /// the post-move spot; it anchors the expected repricing magnitude.
    pub fn record_tick(
        &mut self,
        crypto: &str,
        spot: f64,
        market_prob: f64,
        fair_prob: f64,
        ts_ms: i64,
    ) -> Vec<CompletedMove> {
        let tracking_ms = self.config.tracking_duration_ms;
        let threshold = self.config.move_threshold;
        let max_events = self.config.max_concurrent_events;

        let state = self.assets.entry(crypto.to_string()).or_default();
        let mut completed = Vec::new();

        // 1. snapshot the market into every live event
        for ev in state.active.iter_mut() {
            let dt_ms = ts_ms - ev.t0_ms;
            let expected = ev.expected_change();
            let captured_frac = if expected.abs() > 1e-9 {
                ((market_prob - ev.market_prob_before) / expected).clamp(-10.0, 10.0)
            } else {
                1.0
            };
            ev.snapshots.push(MoveSnapshot {
                dt_ms,
                market_prob,
                captured_frac,
            });
        }

        // 2. finalize events whose tracking window closed
        while state
            .active
            .front()
            .is_some_and(|ev| ts_ms - ev.t0_ms >= tracking_ms)
        {
            if let Some(ev) = state.active.pop_front() {
                completed.push(finalize(ev));
            }
        }

        // 3. move detection against the previous spot
        if let (Some(prev_spot), Some(prev_prob)) = (state.last_spot, state.last_market_prob) {
            if prev_spot > 0.0 {
                let rel = (spot - prev_spot) / prev_spot;
                if rel.abs() >= threshold {
                    if state.active.len() >= max_events {
                        // cap hit: finalize the oldest early rather than drop data
                        if let Some(ev) = state.active.pop_front() {
                            completed.push(finalize(ev));
                        }
                    }
                    let direction = if rel > 0.0 {
                        Direction::Up
                    } else {
                        Direction::Down
                    };
                    debug!(
                        crypto,
                        rel_move = rel,
                        direction = direction.as_str(),
                        "spot move detected"
                    );
                    state.active.push_back(SpotMoveEvent {
                        crypto: crypto.to_string(),
                        t0_ms: ts_ms,
                        spot_before: prev_spot,
                        spot_after: spot,
                        direction,
                        market_prob_before: prev_prob,
                        expected_fair_prob: fair_prob,
                        snapshots: Vec::new(),
                    });
                }
            }
        }

        state.last_spot = Some(spot);
        state.last_market_prob = Some(market_prob);

        // 4. fold completed moves into per-direction aggregates
        for m in &completed {
            match m.event.direction {
                Direction::Up => state.up_stats.absorb(m),
                Direction::Down => state.down_stats.absorb(m),
            }
            self.archived.push_back(m.clone());
            while self.archived.len() > self.config.max_archived {
                self.archived.pop_front();
            }
        }

        completed
    }

    pub fn active_events(&self, crypto: &str) -> usize {
        self.assets.get(crypto).map_or(0, |s| s.active.len())
    }

    pub fn stats(&self, crypto: &str, direction: Direction) -> DirectionStats {
        self.assets
            .get(crypto)
            .map(|s| match direction {
                Direction::Up => s.up_stats,
                Direction::Down => s.down_stats,
            })
            .unwrap_or_default()
    }

    pub fn archived(&self) -> impl Iterator<Item = &CompletedMove> {
        self.archived.iter()
    }

    /// The most recent still-tracking event for an asset, if any
    pub fn latest_active(&self, crypto: &str) -> Option<&SpotMoveEvent> {
        self.assets.get(crypto).and_then(|s| s.active.back())
    }
}

fn finalize(event: SpotMoveEvent) -> CompletedMove {
    let half_pricing_ms = event.first_capture_at(HALF_CAPTURE);
    let full_pricing_ms = event.first_capture_at(FULL_CAPTURE);
    CompletedMove {
        event,
        half_pricing_ms,
        full_pricing_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> SpotLagAnalyzer {
        SpotLagAnalyzer::new(SpotLagConfig {
            move_threshold: 5e-4,
            tracking_duration_ms: 30_000,
            max_concurrent_events: 3,
            max_archived: 16,
        })
    }

    #[test]
    fn small_moves_are_ignored() {
        let mut a = analyzer();
        let t0 = 1_700_000_000_000_i64;
        a.record_tick("btc", 100_000.0, 0.50, 0.50, t0);
        a.record_tick("btc", 100_010.0, 0.50, 0.50, t0 + 1_000); // 1bp, under threshold
        assert_eq!(a.active_events("btc"), 0);
    }

    #[test]
    fn move_opens_event_and_market_catchup_is_measured() {
        let mut a = analyzer();
        let t0 = 1_700_000_000_000_i64;
        a.record_tick("btc", 100_000.0, 0.50, 0.50, t0);
        // +10bp spot move; model expects market to go to 0.60
        a.record_tick("btc", 100_100.0, 0.50, 0.60, t0 + 1_000);
        assert_eq!(a.active_events("btc"), 1);

        // market halfway there at +4s, fully there at +8s
        a.record_tick("btc", 100_100.0, 0.55, 0.60, t0 + 5_000);
        a.record_tick("btc", 100_100.0, 0.595, 0.60, t0 + 9_000);
        // window closes
        let done = a.record_tick("btc", 100_100.0, 0.60, 0.60, t0 + 32_000);
        assert_eq!(done.len(), 1);
        let m = &done[0];
        assert_eq!(m.event.direction, Direction::Up);
        assert_eq!(m.half_pricing_ms, Some(4_000));
        assert_eq!(m.full_pricing_ms, Some(8_000));

        let stats = a.stats("btc", Direction::Up);
        assert_eq!(stats.moves, 1);
        assert_eq!(stats.half_priced, 1);
        assert!((stats.avg_half_pricing_ms - 4_000.0).abs() < 1e-9);
    }

    #[test]
    fn market_that_never_reprices_reports_no_capture() {
        let mut a = analyzer();
        let t0 = 1_700_000_000_000_i64;
        a.record_tick("btc", 100_000.0, 0.50, 0.50, t0);
        a.record_tick("btc", 99_900.0, 0.50, 0.40, t0 + 1_000); // down move
        a.record_tick("btc", 99_900.0, 0.50, 0.40, t0 + 10_000);
        let done = a.record_tick("btc", 99_900.0, 0.50, 0.40, t0 + 40_000);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].event.direction, Direction::Down);
        assert!(done[0].half_pricing_ms.is_none());
        assert!(done[0].full_pricing_ms.is_none());
    }

    #[test]
    fn concurrent_event_cap_finalizes_oldest() {
        let mut a = analyzer();
        let t0 = 1_700_000_000_000_i64;
        let mut spot = 100_000.0;
        a.record_tick("btc", spot, 0.50, 0.50, t0);
        // open 4 moves against a cap of 3
        for i in 1..=4 {
            spot *= 1.001;
            a.record_tick("btc", spot, 0.50, 0.55, t0 + i * 1_000);
        }
        assert_eq!(a.active_events("btc"), 3);
        let stats = a.stats("btc", Direction::Up);
        assert_eq!(stats.moves, 1, "oldest event must have been finalized");
    }

    #[test]
    fn assets_do_not_share_events() {
        let mut a = analyzer();
        let t0 = 1_700_000_000_000_i64;
        a.record_tick("btc", 100_000.0, 0.50, 0.50, t0);
        a.record_tick("btc", 100_200.0, 0.50, 0.60, t0 + 1_000);
        assert_eq!(a.active_events("btc"), 1);
        assert_eq!(a.active_events("eth"), 0);
    }
}
