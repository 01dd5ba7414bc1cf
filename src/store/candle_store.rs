//! C1 — Candle Store: durable, idempotent, indexed store of OHLCV bars.
//!
//! Grounded on the teacher's `database.rs` connection-management pattern;
//! the upsert contract is generalized from `retriever.rs::insert_batch`'s
//! plain `INSERT OR IGNORE` into the full merge-on-conflict semantics of
//! spec §4.1.

use crate::candle::{Candle, IngestionSource};
use crate::error::{PipelineError, PipelineResult};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{instrument, warn};

use super::{decimal_from_sql, decimal_to_sql};

pub struct CandleStore {
    conn: Connection,
}

impl CandleStore {
    pub fn open(path: &str) -> PipelineResult<Self> {
        let conn = Connection::open(path)?;
        let store = CandleStore { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> PipelineResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = CandleStore { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> PipelineResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ohlcv_candles (
                symbol TEXT NOT NULL,
                interval TEXT NOT NULL,
                open_time INTEGER NOT NULL,
                close_time INTEGER NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                trade_count INTEGER NOT NULL,
                taker_buy_volume TEXT NOT NULL,
                taker_buy_quote_volume TEXT NOT NULL,
                is_closed INTEGER NOT NULL,
                ingestion_source TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (symbol, interval, open_time)
            );
            CREATE INDEX IF NOT EXISTS idx_ohlcv_range ON ohlcv_candles(symbol, interval, open_time);",
        )?;
        Ok(())
    }

    /// Upsert one candle per the merge contract in §4.1. Idempotent and
    /// commutative for repeated observations of the same bar.
    #[instrument(skip(self, candle), fields(symbol = %candle.symbol, open_time = candle.open_time))]
    pub fn upsert_one(&self, candle: &Candle) -> PipelineResult<()> {
        self.upsert_batch(std::slice::from_ref(candle))?;
        Ok(())
    }

    /// Transactional batch upsert; `source` tags every row's provenance
    /// unless the row already carries its own `ingestion_source`.
    pub fn bulk_upsert(&mut self, candles: &[Candle]) -> PipelineResult<usize> {
        self.upsert_batch(candles)
    }

    fn upsert_batch(&self, candles: &[Candle]) -> PipelineResult<usize> {
        if candles.is_empty() {
            return Ok(0);
        }
        let now = chrono::Utc::now().timestamp_millis();
        let mut affected = 0usize;
        for c in candles {
            let existing = self.fetch_one(&c.symbol, &c.interval, c.open_time)?;
            match existing {
                Some(mut cur) => {
                    cur.merge_from(c);
                    self.write_row(&cur, now)?;
                }
                None => {
                    self.write_row(c, now)?;
                }
            }
            affected += 1;
        }
        Ok(affected)
    }

    fn write_row(&self, c: &Candle, now: i64) -> PipelineResult<()> {
        self.conn.execute(
            "INSERT INTO ohlcv_candles (
                symbol, interval, open_time, close_time, open, high, low, close, volume,
                trade_count, taker_buy_volume, taker_buy_quote_volume, is_closed,
                ingestion_source, updated_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
            ON CONFLICT(symbol, interval, open_time) DO UPDATE SET
                close_time = excluded.close_time,
                open = ohlcv_candles.open,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                volume = excluded.volume,
                trade_count = excluded.trade_count,
                taker_buy_volume = excluded.taker_buy_volume,
                taker_buy_quote_volume = excluded.taker_buy_quote_volume,
                is_closed = excluded.is_closed,
                ingestion_source = excluded.ingestion_source,
                updated_at = excluded.updated_at",
            params![
                c.symbol,
                c.interval,
                c.open_time,
                c.close_time,
                decimal_to_sql(&c.open),
                decimal_to_sql(&c.high),
                decimal_to_sql(&c.low),
                decimal_to_sql(&c.close),
                decimal_to_sql(&c.volume),
                c.trade_count,
                decimal_to_sql(&c.taker_buy_volume),
                decimal_to_sql(&c.taker_buy_quote_volume),
                c.is_closed as i64,
                c.ingestion_source.as_str(),
                now,
            ],
        )?;
        Ok(())
    }

    fn fetch_one(&self, symbol: &str, interval: &str, open_time: i64) -> PipelineResult<Option<Candle>> {
        let row = self
            .conn
            .query_row(
                "SELECT symbol, interval, open_time, close_time, open, high, low, close, volume,
                    trade_count, taker_buy_volume, taker_buy_quote_volume, is_closed, ingestion_source
                 FROM ohlcv_candles WHERE symbol=?1 AND interval=?2 AND open_time=?3",
                params![symbol, interval, open_time],
                row_to_candle,
            )
            .optional()?;
        Ok(row)
    }

    /// Most recent `limit` candles, descending by open_time.
    pub fn fetch_recent(&self, symbol: &str, interval: &str, limit: usize) -> PipelineResult<Vec<Candle>> {
        let mut stmt = self.conn.prepare(
            "SELECT symbol, interval, open_time, close_time, open, high, low, close, volume,
                trade_count, taker_buy_volume, taker_buy_quote_volume, is_closed, ingestion_source
             FROM ohlcv_candles WHERE symbol=?1 AND interval=?2
             ORDER BY open_time DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![symbol, interval, limit as i64], row_to_candle)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Candles within `[from, to]` (inclusive open_time), ascending.
    pub fn fetch_range(&self, symbol: &str, interval: &str, from: i64, to: i64) -> PipelineResult<Vec<Candle>> {
        let mut stmt = self.conn.prepare(
            "SELECT symbol, interval, open_time, close_time, open, high, low, close, volume,
                trade_count, taker_buy_volume, taker_buy_quote_volume, is_closed, ingestion_source
             FROM ohlcv_candles WHERE symbol=?1 AND interval=?2 AND open_time BETWEEN ?3 AND ?4
             ORDER BY open_time ASC",
        )?;
        let rows = stmt
            .query_map(params![symbol, interval, from, to], row_to_candle)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_in_range(&self, symbol: &str, interval: &str, from: i64, to: i64) -> PipelineResult<i64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM ohlcv_candles WHERE symbol=?1 AND interval=?2 AND open_time BETWEEN ?3 AND ?4",
            params![symbol, interval, from, to],
            |r| r.get(0),
        )?;
        Ok(n)
    }
}

fn row_to_candle(row: &rusqlite::Row) -> rusqlite::Result<Candle> {
    let is_closed: i64 = row.get(12)?;
    let source_str: String = row.get(13)?;
    let source = IngestionSource::from_str_opt(&source_str).unwrap_or_else(|| {
        warn!("unrecognized ingestion_source {source_str}, defaulting to ws-live");
        IngestionSource::WsLive
    });
    Ok(Candle {
        symbol: row.get(0)?,
        interval: row.get(1)?,
        open_time: row.get(2)?,
        close_time: row.get(3)?,
        open: decimal_from_sql(&row.get::<_, String>(4)?)?,
        high: decimal_from_sql(&row.get::<_, String>(5)?)?,
        low: decimal_from_sql(&row.get::<_, String>(6)?)?,
        close: decimal_from_sql(&row.get::<_, String>(7)?)?,
        volume: decimal_from_sql(&row.get::<_, String>(8)?)?,
        trade_count: row.get(9)?,
        taker_buy_volume: decimal_from_sql(&row.get::<_, String>(10)?)?,
        taker_buy_quote_volume: decimal_from_sql(&row.get::<_, String>(11)?)?,
        is_closed: is_closed != 0,
        ingestion_source: source,
    })
}

pub fn unavailable(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Unavailable(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn candle(open_time: i64, high: &str, low: &str, closed: bool) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            interval: "1m".into(),
            open_time,
            close_time: open_time + 59_999,
            open: rust_decimal::Decimal::from_str("100").unwrap(),
            high: rust_decimal::Decimal::from_str(high).unwrap(),
            low: rust_decimal::Decimal::from_str(low).unwrap(),
            close: rust_decimal::Decimal::from_str("100").unwrap(),
            volume: rust_decimal::Decimal::from_str("1").unwrap(),
            trade_count: 1,
            taker_buy_volume: rust_decimal::Decimal::from_str("0.5").unwrap(),
            taker_buy_quote_volume: rust_decimal::Decimal::from_str("50").unwrap(),
            is_closed: closed,
            ingestion_source: IngestionSource::WsLive,
        }
    }

    #[test]
    fn upsert_is_idempotent() {
        let mut store = CandleStore::in_memory().unwrap();
        let c = candle(60_000, "101", "99", true);
        store.bulk_upsert(&[c.clone()]).unwrap();
        store.bulk_upsert(&[c.clone()]).unwrap();
        let rows = store.fetch_recent("BTCUSDT", "1m", 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].high, c.high);
    }

    #[test]
    fn upsert_merges_high_low() {
        let mut store = CandleStore::in_memory().unwrap();
        store.bulk_upsert(&[candle(60_000, "101", "99", false)]).unwrap();
        store.bulk_upsert(&[candle(60_000, "100", "98", true)]).unwrap();
        let rows = store.fetch_recent("BTCUSDT", "1m", 10).unwrap();
        assert_eq!(rows[0].high, rust_decimal::Decimal::from_str("101").unwrap());
        assert_eq!(rows[0].low, rust_decimal::Decimal::from_str("98").unwrap());
        assert!(rows[0].is_closed);
    }

    #[test]
    fn fetch_range_is_ascending() {
        let mut store = CandleStore::in_memory().unwrap();
        store
            .bulk_upsert(&[candle(120_000, "1", "1", true), candle(60_000, "1", "1", true)])
            .unwrap();
        let rows = store.fetch_range("BTCUSDT", "1m", 0, 200_000).unwrap();
        assert_eq!(rows[0].open_time, 60_000);
        assert_eq!(rows[1].open_time, 120_000);
    }
}
