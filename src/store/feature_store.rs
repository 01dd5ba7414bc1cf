//! Long-format (EAV-style) feature snapshot store: one meta row per
//! `(symbol, interval, close_time)` plus one value row per feature name,
//! so the feature set can grow without a migration.

use crate::error::PipelineResult;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;

pub struct FeatureStore {
    conn: Connection,
}

impl FeatureStore {
    pub fn open(path: &str) -> PipelineResult<Self> {
        let conn = Connection::open(path)?;
        let s = FeatureStore { conn };
        s.init_schema()?;
        Ok(s)
    }

    pub fn in_memory() -> PipelineResult<Self> {
        let conn = Connection::open_in_memory()?;
        let s = FeatureStore { conn };
        s.init_schema()?;
        Ok(s)
    }

    fn init_schema(&self) -> PipelineResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS feature_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                interval TEXT NOT NULL,
                close_time INTEGER NOT NULL,
                computed_at INTEGER NOT NULL,
                UNIQUE(symbol, interval, close_time)
            );
            CREATE TABLE IF NOT EXISTS feature_values (
                snapshot_id INTEGER NOT NULL,
                feature_name TEXT NOT NULL,
                feature_value REAL,
                PRIMARY KEY (snapshot_id, feature_name)
            );
            CREATE TABLE IF NOT EXISTS feature_dedup_pointer (
                symbol TEXT NOT NULL,
                interval TEXT NOT NULL,
                last_close_time INTEGER NOT NULL,
                PRIMARY KEY (symbol, interval)
            );",
        )?;
        Ok(())
    }

    /// Writes (or replaces) the snapshot at `(symbol, interval, close_time)`
    /// with the given `feature_name -> value` map. `None` values are stored
    /// as SQL NULL rather than skipped, so a feature that failed to compute
    /// for this bar is still visible as "present but null" in the schema.
    pub fn write_snapshot(
        &mut self,
        symbol: &str,
        interval: &str,
        close_time: i64,
        computed_at: i64,
        values: &BTreeMap<String, Option<f64>>,
    ) -> PipelineResult<i64> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO feature_snapshots (symbol, interval, close_time, computed_at)
             VALUES (?1,?2,?3,?4)
             ON CONFLICT(symbol, interval, close_time) DO UPDATE SET computed_at=excluded.computed_at",
            params![symbol, interval, close_time, computed_at],
        )?;
        let snapshot_id: i64 = tx.query_row(
            "SELECT id FROM feature_snapshots WHERE symbol=?1 AND interval=?2 AND close_time=?3",
            params![symbol, interval, close_time],
            |r| r.get(0),
        )?;
        for (name, value) in values {
            tx.execute(
                "INSERT INTO feature_values (snapshot_id, feature_name, feature_value)
                 VALUES (?1,?2,?3)
                 ON CONFLICT(snapshot_id, feature_name) DO UPDATE SET feature_value=excluded.feature_value",
                params![snapshot_id, name, value],
            )?;
        }
        tx.commit()?;
        Ok(snapshot_id)
    }

    /// All `(feature_name, value)` pairs at a given snapshot, as a map —
    /// "at most one value per feature_name" holds by construction via the
    /// `(snapshot_id, feature_name)` primary key.
    pub fn read_snapshot(
        &self,
        symbol: &str,
        interval: &str,
        close_time: i64,
    ) -> PipelineResult<Option<BTreeMap<String, Option<f64>>>> {
        let snapshot_id: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM feature_snapshots WHERE symbol=?1 AND interval=?2 AND close_time=?3",
                params![symbol, interval, close_time],
                |r| r.get(0),
            )
            .optional()?;
        let Some(snapshot_id) = snapshot_id else {
            return Ok(None);
        };
        let mut stmt = self
            .conn
            .prepare("SELECT feature_name, feature_value FROM feature_values WHERE snapshot_id=?1")?;
        let rows = stmt
            .query_map(params![snapshot_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, Option<f64>>(1)?))
            })?
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(Some(rows))
    }

    /// Snapshots in `[from, to]` ordered ascending, for dataset assembly.
    pub fn read_range(
        &self,
        symbol: &str,
        interval: &str,
        from: i64,
        to: i64,
    ) -> PipelineResult<Vec<(i64, BTreeMap<String, Option<f64>>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, close_time FROM feature_snapshots
             WHERE symbol=?1 AND interval=?2 AND close_time BETWEEN ?3 AND ?4
             ORDER BY close_time ASC",
        )?;
        let ids = stmt
            .query_map(params![symbol, interval, from, to], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut out = Vec::with_capacity(ids.len());
        let mut value_stmt = self
            .conn
            .prepare("SELECT feature_name, feature_value FROM feature_values WHERE snapshot_id=?1")?;
        for (snapshot_id, close_time) in ids {
            let values = value_stmt
                .query_map(params![snapshot_id], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, Option<f64>>(1)?))
                })?
                .collect::<Result<BTreeMap<_, _>, _>>()?;
            out.push((close_time, values));
        }
        Ok(out)
    }

    /// The `close_time` of the most recently computed snapshot, used by C8
    /// to dedup work: a scheduler tick only advances this pointer after a
    /// snapshot write fully succeeds.
    pub fn dedup_pointer(&self, symbol: &str, interval: &str) -> PipelineResult<Option<i64>> {
        let v = self
            .conn
            .query_row(
                "SELECT last_close_time FROM feature_dedup_pointer WHERE symbol=?1 AND interval=?2",
                params![symbol, interval],
                |r| r.get(0),
            )
            .optional()?;
        Ok(v)
    }

    /// Advance the dedup pointer. Only call this after `write_snapshot`
    /// returns `Ok` — advancing on failure would silently skip the bar on
    /// retry.
    pub fn advance_dedup_pointer(&self, symbol: &str, interval: &str, close_time: i64) -> PipelineResult<()> {
        self.conn.execute(
            "INSERT INTO feature_dedup_pointer (symbol, interval, last_close_time) VALUES (?1,?2,?3)
             ON CONFLICT(symbol, interval) DO UPDATE SET last_close_time=excluded.last_close_time
             WHERE excluded.last_close_time > feature_dedup_pointer.last_close_time",
            params![symbol, interval, close_time],
        )?;
        Ok(())
    }
}
