//! C4 — Inference Log: append-only predictions with a later-written
//! realized label (written once by C9, never overwritten — invariant 5).

use crate::error::PipelineResult;
use rusqlite::{params, Connection};

#[derive(Debug, Clone)]
pub struct InferenceRecord {
    pub id: i64,
    pub created_at: i64,
    pub probability: f64,
    pub decision: i32,
    pub threshold: f64,
    pub model_name: String,
    pub model_version: String,
    pub symbol: String,
    pub interval: String,
    pub target: String,
    pub realized_label: Option<i32>,
}

pub struct InferenceLog {
    conn: Connection,
}

impl InferenceLog {
    pub fn open(path: &str) -> PipelineResult<Self> {
        let conn = Connection::open(path)?;
        let s = InferenceLog { conn };
        s.init_schema()?;
        Ok(s)
    }

    pub fn in_memory() -> PipelineResult<Self> {
        let conn = Connection::open_in_memory()?;
        let s = InferenceLog { conn };
        s.init_schema()?;
        Ok(s)
    }

    fn init_schema(&self) -> PipelineResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS inference_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at INTEGER NOT NULL,
                probability REAL NOT NULL,
                decision INTEGER NOT NULL,
                threshold REAL NOT NULL,
                model_name TEXT NOT NULL,
                model_version TEXT NOT NULL,
                symbol TEXT NOT NULL,
                interval TEXT NOT NULL,
                target TEXT NOT NULL,
                realized_label INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_inference_unlabeled
                ON inference_log(symbol, interval, target, created_at)
                WHERE realized_label IS NULL;",
        )?;
        Ok(())
    }

    pub fn record(
        &self,
        created_at: i64,
        probability: f64,
        decision: i32,
        threshold: f64,
        model_name: &str,
        model_version: &str,
        symbol: &str,
        interval: &str,
        target: &str,
    ) -> PipelineResult<i64> {
        self.conn.execute(
            "INSERT INTO inference_log (created_at, probability, decision, threshold, model_name,
                model_version, symbol, interval, target, realized_label)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,NULL)",
            params![created_at, probability, decision, threshold, model_name, model_version, symbol, interval, target],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Unlabeled rows older than `min_age_seconds` at `now`, oldest first,
    /// up to `limit`.
    pub fn fetch_unlabeled_candidates(
        &self,
        now: i64,
        min_age_seconds: i64,
        limit: usize,
    ) -> PipelineResult<Vec<InferenceRecord>> {
        let cutoff = now - min_age_seconds * 1000;
        let mut stmt = self.conn.prepare(
            "SELECT id, created_at, probability, decision, threshold, model_name, model_version,
                    symbol, interval, target, realized_label
             FROM inference_log
             WHERE realized_label IS NULL AND created_at <= ?1
             ORDER BY created_at ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![cutoff, limit as i64], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Writes `(id, label)` pairs, but only for rows still unlabeled —
    /// satisfies label immutability (invariant 5) even under a racing
    /// second labeler run.
    pub fn update_realized_batch(&self, labeled: &[(i64, i32)]) -> PipelineResult<usize> {
        let mut updated = 0;
        for (id, label) in labeled {
            let n = self.conn.execute(
                "UPDATE inference_log SET realized_label=?2 WHERE id=?1 AND realized_label IS NULL",
                params![id, label],
            )?;
            updated += n;
        }
        Ok(updated)
    }

    pub fn fetch_by_id(&self, id: i64) -> PipelineResult<Option<InferenceRecord>> {
        use rusqlite::OptionalExtension;
        let row = self
            .conn
            .query_row(
                "SELECT id, created_at, probability, decision, threshold, model_name, model_version,
                        symbol, interval, target, realized_label
                 FROM inference_log WHERE id=?1",
                params![id],
                row_to_record,
            )
            .optional()?;
        Ok(row)
    }

    pub fn fetch_labeled_for_calibration(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> PipelineResult<Vec<InferenceRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, created_at, probability, decision, threshold, model_name, model_version,
                    symbol, interval, target, realized_label
             FROM inference_log
             WHERE symbol=?1 AND interval=?2 AND realized_label IS NOT NULL
             ORDER BY created_at DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![symbol, interval, limit as i64], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<InferenceRecord> {
    Ok(InferenceRecord {
        id: row.get(0)?,
        created_at: row.get(1)?,
        probability: row.get(2)?,
        decision: row.get(3)?,
        threshold: row.get(4)?,
        model_name: row.get(5)?,
        model_version: row.get(6)?,
        symbol: row.get(7)?,
        interval: row.get(8)?,
        target: row.get(9)?,
        realized_label: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_is_immutable_once_set() {
        let log = InferenceLog::in_memory().unwrap();
        let id = log
            .record(1_000, 0.7, 1, 0.5, "bottom", "v1", "BTCUSDT", "1m", "bottom")
            .unwrap();
        log.update_realized_batch(&[(id, 1)]).unwrap();
        log.update_realized_batch(&[(id, 0)]).unwrap();
        let rec = log.fetch_by_id(id).unwrap().unwrap();
        assert_eq!(rec.realized_label, Some(1));
    }

    #[test]
    fn candidates_respect_min_age() {
        let log = InferenceLog::in_memory().unwrap();
        log.record(10_000, 0.7, 1, 0.5, "bottom", "v1", "BTCUSDT", "1m", "bottom")
            .unwrap();
        let now = 10_000 + 5_000;
        let candidates = log.fetch_unlabeled_candidates(now, 10, 10).unwrap();
        assert!(candidates.is_empty());
        let candidates = log.fetch_unlabeled_candidates(now, 1, 10).unwrap();
        assert_eq!(candidates.len(), 1);
    }
}
