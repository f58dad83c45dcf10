//! Shared market and position types
//!
//! The tick is the single input event of the engine: one observation of the
//! market book and the underlying spot, tagged with the window it belongs to.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Current UTC time in epoch milliseconds
///
/// All persisted timestamps and interval arithmetic in the engine use epoch
/// milliseconds; wall-clock formatting happens only at the logging edge.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Position direction on the binary market
///
/// LONG profits when the window resolves UP, SHORT when it resolves DOWN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LONG" => Some(Side::Long),
            "SHORT" => Some(Side::Short),
            _ => None,
        }
    }
}

/// Direction of a binary outcome or a detected market move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }

    /// Position side that profits if this direction resolves
    pub fn position_side(&self) -> Side {
        match self {
            Direction::Up => Side::Long,
            Direction::Down => Side::Short,
        }
    }
}

/// Settlement-level position status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
    Liquidated,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
            PositionStatus::Liquidated => "liquidated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Some(PositionStatus::Open),
            "closed" => Some(PositionStatus::Closed),
            "liquidated" => Some(PositionStatus::Liquidated),
            _ => None,
        }
    }
}

/// Execution mode a position was opened under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeMode {
    Live,
    Paper,
    DryRun,
}

impl TradeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeMode::Live => "LIVE",
            TradeMode::Paper => "PAPER",
            TradeMode::DryRun => "DRY_RUN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LIVE" => Some(TradeMode::Live),
            "PAPER" => Some(TradeMode::Paper),
            "DRY_RUN" => Some(TradeMode::DryRun),
            _ => None,
        }
    }
}

/// One observation of the market and spot state
///
/// Book fields are optional; thin feeds only deliver the mid. Strategies must
/// treat a missing field as "unknown", never as zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    /// Underlying asset symbol, lower-case (`btc`, `eth`, ...)
    pub crypto: String,
    /// Window this tick belongs to, wire format `{asset}-{dur}m-YYYY-MM-DD-HH:MM`
    pub window_id: String,
    /// Window start as epoch seconds
    pub window_epoch: i64,
    /// Observation time, epoch milliseconds
    pub timestamp: i64,
    /// Spot price of the underlying
    pub spot_price: f64,
    /// Strike declared at window start
    pub price_to_beat: f64,
    /// Seconds until the window resolves
    pub time_remaining_sec: f64,
    /// Mid price of the UP outcome token, in (0,1)
    pub up_mid: f64,
    pub up_bid: Option<f64>,
    pub up_ask: Option<f64>,
    pub up_bid_size: Option<f64>,
    pub up_ask_size: Option<f64>,
    /// Book spread in probability points
    pub spread: Option<f64>,
    /// Exchange identifiers needed to place an order on this window
    pub market_id: String,
    pub up_token_id: String,
    pub down_token_id: String,
}

impl Tick {
    /// Best price to buy the UP token, falling back to mid on a thin book
    pub fn buy_up_price(&self) -> f64 {
        self.up_ask.unwrap_or(self.up_mid)
    }

    /// Best price to sell the UP token, falling back to mid on a thin book
    pub fn sell_up_price(&self) -> f64 {
        self.up_bid.unwrap_or(self.up_mid)
    }

    /// Spread in basis points of notional, if the book is two-sided
    pub fn spread_bps(&self) -> Option<f64> {
        match (self.up_bid, self.up_ask) {
            (Some(bid), Some(ask)) if ask > bid && ask > 0.0 => {
                Some((ask - bid) / ((ask + bid) / 2.0) * 10_000.0)
            }
            _ => self.spread.map(|s| s * 10_000.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick() -> Tick {
        Tick {
            crypto: "btc".into(),
            window_id: "btc-15m-2026-01-31-10:00".into(),
            window_epoch: 1_769_853_600,
            timestamp: 1_769_853_700_000,
            spot_price: 101_250.0,
            price_to_beat: 101_000.0,
            time_remaining_sec: 800.0,
            up_mid: 0.61,
            up_bid: Some(0.60),
            up_ask: Some(0.62),
            up_bid_size: Some(1500.0),
            up_ask_size: Some(900.0),
            spread: Some(0.02),
            market_id: "mkt-1".into(),
            up_token_id: "tok-up".into(),
            down_token_id: "tok-down".into(),
        }
    }

    #[test]
    fn book_prices_fall_back_to_mid() {
        let mut t = tick();
        assert_eq!(t.buy_up_price(), 0.62);
        assert_eq!(t.sell_up_price(), 0.60);
        t.up_bid = None;
        t.up_ask = None;
        assert_eq!(t.buy_up_price(), 0.61);
        assert_eq!(t.sell_up_price(), 0.61);
    }

    #[test]
    fn side_round_trips_through_strings() {
        assert_eq!(Side::parse("LONG"), Some(Side::Long));
        assert_eq!(Side::parse(Side::Short.as_str()), Some(Side::Short));
        assert_eq!(Side::parse("sideways"), None);
    }

    #[test]
    fn spread_bps_prefers_live_book() {
        let t = tick();
        let bps = t.spread_bps().unwrap();
        assert!((bps - (0.02 / 0.61 * 10_000.0)).abs() < 1.0);
    }
}
