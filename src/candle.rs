//! Core data-model types shared by every store and component (spec §3).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestionSource {
    WsLive,
    WsLate,
    RestBackfill,
}

impl IngestionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionSource::WsLive => "ws-live",
            IngestionSource::WsLate => "ws-late",
            IngestionSource::RestBackfill => "rest-backfill",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "ws-live" => Some(IngestionSource::WsLive),
            "ws-late" => Some(IngestionSource::WsLate),
            "rest-backfill" => Some(IngestionSource::RestBackfill),
            _ => None,
        }
    }
}

/// A single OHLCV bar. Identity is (symbol, interval, open_time); all other
/// fields are mutable via upsert (§4.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub interval: String,
    pub open_time: i64,
    pub close_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub trade_count: i64,
    pub taker_buy_volume: Decimal,
    pub taker_buy_quote_volume: Decimal,
    pub is_closed: bool,
    pub ingestion_source: IngestionSource,
}

impl Candle {
    /// Merge `new` into `self` per the upsert contract in §4.1: high keeps
    /// the max, low keeps the min, everything else is replaced by the later
    /// observation. `is_closed` may only transition false -> true.
    pub fn merge_from(&mut self, new: &Candle) {
        self.close_time = new.close_time;
        self.high = self.high.max(new.high);
        self.low = self.low.min(new.low);
        self.close = new.close;
        self.volume = new.volume;
        self.trade_count = new.trade_count;
        self.taker_buy_volume = new.taker_buy_volume;
        self.taker_buy_quote_volume = new.taker_buy_quote_volume;
        self.is_closed = self.is_closed || new.is_closed;
        self.ingestion_source = new.ingestion_source;
    }
}

/// Expected bar count over an inclusive span, per the Interval derivation
/// rule in §3.
pub fn expected_bar_count(from_open_time: i64, to_open_time: i64, interval_ms: i64) -> i64 {
    (to_open_time - from_open_time) / interval_ms + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn sample(open_time: i64, high: &str, low: &str, closed: bool) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            interval: "1m".into(),
            open_time,
            close_time: open_time + 59_999,
            open: d("100"),
            high: d(high),
            low: d(low),
            close: d("100"),
            volume: d("1"),
            trade_count: 1,
            taker_buy_volume: d("0.5"),
            taker_buy_quote_volume: d("50"),
            is_closed: closed,
            ingestion_source: IngestionSource::WsLive,
        }
    }

    #[test]
    fn merge_keeps_max_high_min_low() {
        let mut a = sample(0, "101", "99", false);
        let b = sample(0, "100", "100", true);
        a.merge_from(&b);
        assert_eq!(a.high, d("101"));
        assert_eq!(a.low, d("99"));
        assert!(a.is_closed);
    }

    #[test]
    fn closed_flag_never_reverts() {
        let mut a = sample(0, "100", "100", true);
        let b = sample(0, "100", "100", false);
        a.merge_from(&b);
        assert!(a.is_closed);
    }

    #[test]
    fn expected_bar_count_is_inclusive() {
        assert_eq!(expected_bar_count(0, 0, 60_000), 1);
        assert_eq!(expected_bar_count(0, 120_000, 60_000), 3);
    }
}
