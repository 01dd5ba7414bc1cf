//! C2 — Gap Segment Store: lifecycle-tracked spans of missing bars.
//!
//! No direct teacher analog (the teacher's `gap_filler.rs` synthesizes
//! interpolated bars rather than tracking recoverable spans). Grounded on
//! `original_source/backend/apps/ingestion/repository/gap_repository.py`
//! for the schema/lifecycle operations and on
//! `gap_backfill_service.py`/`kline_consumer.py` for the overlap-merge
//! algorithm in §4.3.1.

use crate::candle::expected_bar_count;
use crate::error::PipelineResult;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapStatus {
    Open,
    Partial,
    Recovered,
    Merged,
}

impl GapStatus {
    fn as_str(&self) -> &'static str {
        match self {
            GapStatus::Open => "open",
            GapStatus::Partial => "partial",
            GapStatus::Recovered => "recovered",
            GapStatus::Merged => "merged",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "partial" => GapStatus::Partial,
            "recovered" => GapStatus::Recovered,
            "merged" => GapStatus::Merged,
            _ => GapStatus::Open,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GapSegment {
    pub id: i64,
    pub symbol: String,
    pub interval: String,
    pub from_open_time: i64,
    pub to_open_time: i64,
    pub missing_bars: i64,
    pub remaining_bars: i64,
    pub recovered_bars: i64,
    pub status: GapStatus,
    pub detected_at: i64,
    pub recovered_at: Option<i64>,
    pub merged: bool,
}

pub struct GapStore {
    conn: Connection,
}

impl GapStore {
    pub fn open(path: &str) -> PipelineResult<Self> {
        let conn = Connection::open(path)?;
        let s = GapStore { conn };
        s.init_schema()?;
        Ok(s)
    }

    pub fn in_memory() -> PipelineResult<Self> {
        let conn = Connection::open_in_memory()?;
        let s = GapStore { conn };
        s.init_schema()?;
        Ok(s)
    }

    fn init_schema(&self) -> PipelineResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS gap_segments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                interval TEXT NOT NULL,
                from_open_time INTEGER NOT NULL,
                to_open_time INTEGER NOT NULL,
                missing_bars INTEGER NOT NULL,
                remaining_bars INTEGER NOT NULL,
                recovered_bars INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                detected_at INTEGER NOT NULL,
                recovered_at INTEGER,
                merged INTEGER NOT NULL DEFAULT 0,
                UNIQUE(symbol, interval, from_open_time)
            );
            CREATE INDEX IF NOT EXISTS idx_gap_open ON gap_segments(symbol, interval, status);",
        )?;
        Ok(())
    }

    /// Insert a newly detected gap, merging with any overlapping non-recovered
    /// segment first (§4.3.1). `present_bars` is supplied by the caller
    /// (counted from C1 within the merged span) so this store has no direct
    /// dependency on the candle store.
    #[instrument(skip(self, present_bars_in_span))]
    pub fn insert_gap(
        &mut self,
        symbol: &str,
        interval: &str,
        from_open_time: i64,
        to_open_time: i64,
        interval_ms: i64,
        now: i64,
        present_bars_in_span: impl Fn(i64, i64) -> PipelineResult<i64>,
    ) -> PipelineResult<GapSegment> {
        let tx = self.conn.transaction()?;
        let mut stmt = tx.prepare(
            "SELECT id, from_open_time, to_open_time, missing_bars, remaining_bars,
                    recovered_bars, status, detected_at, recovered_at, merged
             FROM gap_segments
             WHERE symbol=?1 AND interval=?2 AND status != 'recovered' AND status != 'merged'
               AND NOT (to_open_time < ?3 OR from_open_time > ?4)",
        )?;
        let overlapping: Vec<(i64, i64, i64, i64)> = stmt
            .query_map(params![symbol, interval, from_open_time, to_open_time], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?, r.get::<_, i64>(7)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let (min_from, max_to, merged_flag, earliest_detected) = if overlapping.is_empty() {
            (from_open_time, to_open_time, false, now)
        } else {
            let min_from = overlapping.iter().map(|o| o.1).min().unwrap().min(from_open_time);
            let max_to = overlapping.iter().map(|o| o.2).max().unwrap().max(to_open_time);
            let earliest_detected = overlapping.iter().map(|o| o.3).min().unwrap().min(now);
            for (id, ..) in &overlapping {
                tx.execute(
                    "UPDATE gap_segments SET status='merged', merged=1, recovered_at=?2 WHERE id=?1",
                    params![id, now],
                )?;
            }
            (min_from, max_to, true, earliest_detected)
        };

        let expected = expected_bar_count(min_from, max_to, interval_ms);
        let present = present_bars_in_span(min_from, max_to)?;
        let missing = (expected - present).max(0);

        tx.execute(
            "INSERT INTO gap_segments (symbol, interval, from_open_time, to_open_time, missing_bars,
                remaining_bars, recovered_bars, status, detected_at, recovered_at, merged)
             VALUES (?1,?2,?3,?4,?5,?5,0,'open',?6,NULL,?7)",
            params![symbol, interval, min_from, max_to, missing, earliest_detected, merged_flag as i64],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        if merged_flag {
            info!(symbol, min_from, max_to, missing, "gap segments merged");
        }

        Ok(GapSegment {
            id,
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            from_open_time: min_from,
            to_open_time: max_to,
            missing_bars: missing,
            remaining_bars: missing,
            recovered_bars: 0,
            status: GapStatus::Open,
            detected_at: earliest_detected,
            recovered_at: None,
            merged: merged_flag,
        })
    }

    pub fn load_open(&self, symbol: &str, interval: &str, limit: usize) -> PipelineResult<Vec<GapSegment>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, from_open_time, to_open_time, missing_bars, remaining_bars, recovered_bars,
                    status, detected_at, recovered_at, merged
             FROM gap_segments
             WHERE symbol=?1 AND interval=?2 AND status IN ('open','partial')
             ORDER BY detected_at ASC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![symbol, interval, limit as i64], |r| row_to_segment(r, symbol, interval))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn mark_recovered(&self, id: i64, now: i64) -> PipelineResult<()> {
        self.conn.execute(
            "UPDATE gap_segments SET status='recovered', remaining_bars=0, recovered_at=?2 WHERE id=?1",
            params![id, now],
        )?;
        Ok(())
    }

    pub fn partial_recover(&self, id: i64, new_remaining: i64, recovered_delta: i64) -> PipelineResult<()> {
        self.conn.execute(
            "UPDATE gap_segments SET status='partial', remaining_bars=?2, recovered_bars = recovered_bars + ?3
             WHERE id=?1",
            params![id, new_remaining, recovered_delta],
        )?;
        Ok(())
    }

    pub fn update_span_and_remaining(
        &self,
        id: i64,
        to_open_time: i64,
        missing_bars: i64,
        remaining_bars: i64,
    ) -> PipelineResult<()> {
        self.conn.execute(
            "UPDATE gap_segments SET to_open_time=?2, missing_bars=?3, remaining_bars=?4 WHERE id=?1",
            params![id, to_open_time, missing_bars, remaining_bars],
        )?;
        Ok(())
    }

    pub fn insert_split_segment(
        &self,
        symbol: &str,
        interval: &str,
        from_open_time: i64,
        to_open_time: i64,
        missing_bars: i64,
        remaining_bars: i64,
        detected_at: i64,
    ) -> PipelineResult<i64> {
        self.conn.execute(
            "INSERT INTO gap_segments (symbol, interval, from_open_time, to_open_time, missing_bars,
                remaining_bars, recovered_bars, status, detected_at, recovered_at, merged)
             VALUES (?1,?2,?3,?4,?5,?6,0,'open',?7,NULL,0)",
            params![symbol, interval, from_open_time, to_open_time, missing_bars, remaining_bars, detected_at],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn fetch(&self, id: i64) -> PipelineResult<Option<GapSegment>> {
        let symbol_interval: Option<(String, String)> = self
            .conn
            .query_row("SELECT symbol, interval FROM gap_segments WHERE id=?1", params![id], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .optional()?;
        let Some((symbol, interval)) = symbol_interval else {
            return Ok(None);
        };
        let row = self
            .conn
            .query_row(
                "SELECT id, from_open_time, to_open_time, missing_bars, remaining_bars, recovered_bars,
                        status, detected_at, recovered_at, merged
                 FROM gap_segments WHERE id=?1",
                params![id],
                |r| row_to_segment(r, &symbol, &interval),
            )
            .optional()?;
        Ok(row)
    }
}

fn row_to_segment(row: &rusqlite::Row, symbol: &str, interval: &str) -> rusqlite::Result<GapSegment> {
    let status: String = row.get(6)?;
    let merged: i64 = row.get(9)?;
    Ok(GapSegment {
        id: row.get(0)?,
        symbol: symbol.to_string(),
        interval: interval.to_string(),
        from_open_time: row.get(1)?,
        to_open_time: row.get(2)?,
        missing_bars: row.get(3)?,
        remaining_bars: row.get(4)?,
        recovered_bars: row.get(5)?,
        status: GapStatus::from_str(&status),
        detected_at: row.get(7)?,
        recovered_at: row.get(8)?,
        merged: merged != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_with_no_overlap_is_direct() {
        let mut store = GapStore::in_memory().unwrap();
        let seg = store
            .insert_gap("BTCUSDT", "1m", 180_000, 240_000, 60_000, 1_000, |_, _| Ok(0))
            .unwrap();
        assert_eq!(seg.missing_bars, 2);
        assert_eq!(seg.status, GapStatus::Open);
        assert!(!seg.merged);
    }

    #[test]
    fn overlapping_insert_merges_and_recomputes_missing() {
        let mut store = GapStore::in_memory().unwrap();
        store
            .insert_gap("BTCUSDT", "1m", 180_000, 300_000, 60_000, 1_000, |_, _| Ok(0))
            .unwrap();
        // overlapping, extends range to 420_000, with 1 present bar already recovered in span
        let seg = store
            .insert_gap("BTCUSDT", "1m", 240_000, 420_000, 60_000, 2_000, |_, _| Ok(1))
            .unwrap();
        assert!(seg.merged);
        assert_eq!(seg.from_open_time, 180_000);
        assert_eq!(seg.to_open_time, 420_000);
        let expected = expected_bar_count(180_000, 420_000, 60_000);
        assert_eq!(seg.missing_bars, expected - 1);

        let open = store.load_open("BTCUSDT", "1m", 10).unwrap();
        assert_eq!(open.len(), 1);
    }

    #[test]
    fn reinsert_after_full_recovery_is_fresh() {
        let mut store = GapStore::in_memory().unwrap();
        let seg = store
            .insert_gap("BTCUSDT", "1m", 180_000, 240_000, 60_000, 1_000, |_, _| Ok(0))
            .unwrap();
        store.mark_recovered(seg.id, 1_500).unwrap();
        let seg2 = store
            .insert_gap("BTCUSDT", "1m", 180_000, 240_000, 60_000, 2_000, |_, _| Ok(0))
            .unwrap();
        assert!(!seg2.merged);
        assert_eq!(store.load_open("BTCUSDT", "1m", 10).unwrap().len(), 1);
    }
}
