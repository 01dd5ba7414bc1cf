//! C3 — Model Registry: durable registry of model artifacts with a
//! staging/production/deleted lifecycle and an append-only metric history.
//!
//! Grounded on `original_source/backend/apps/model_registry/repository/
//! registry_repository.py`, ported from asyncpg to the teacher's `rusqlite`
//! connection idiom (`database.rs`).

use crate::error::PipelineResult;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    Staging,
    Production,
    Deleted,
}

impl ModelStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::Staging => "staging",
            ModelStatus::Production => "production",
            ModelStatus::Deleted => "deleted",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "production" => ModelStatus::Production,
            "deleted" => ModelStatus::Deleted,
            _ => ModelStatus::Staging,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelRow {
    pub id: i64,
    pub name: String,
    pub version: String,
    pub model_type: String,
    pub status: ModelStatus,
    pub artifact_path: Option<String>,
    pub metrics: Value,
    pub created_at: i64,
    pub promoted_at: Option<i64>,
}

pub struct ModelRegistry {
    conn: Connection,
}

/// Replace non-finite floats with `null` so the stored JSON is strictly
/// valid, matching `registry_repository.py::_sanitize`.
pub fn sanitize_metrics(v: &Value) -> Value {
    match v {
        Value::Number(n) => match n.as_f64() {
            Some(f) if !f.is_finite() => Value::Null,
            _ => v.clone(),
        },
        Value::Object(map) => {
            Value::Object(map.iter().map(|(k, v)| (k.clone(), sanitize_metrics(v))).collect())
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sanitize_metrics).collect()),
        other => other.clone(),
    }
}

impl ModelRegistry {
    pub fn open(path: &str) -> PipelineResult<Self> {
        let conn = Connection::open(path)?;
        let r = ModelRegistry { conn };
        r.init_schema()?;
        Ok(r)
    }

    pub fn in_memory() -> PipelineResult<Self> {
        let conn = Connection::open_in_memory()?;
        let r = ModelRegistry { conn };
        r.init_schema()?;
        Ok(r)
    }

    fn init_schema(&self) -> PipelineResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS model_registry (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                version TEXT NOT NULL,
                model_type TEXT NOT NULL,
                status TEXT NOT NULL,
                artifact_path TEXT,
                metrics TEXT,
                created_at INTEGER NOT NULL,
                promoted_at INTEGER,
                UNIQUE(name, version, model_type)
            );
            CREATE TABLE IF NOT EXISTS model_metrics_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                model_id INTEGER NOT NULL,
                metrics TEXT NOT NULL,
                recorded_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS model_lineage (
                parent_id INTEGER NOT NULL,
                child_id INTEGER NOT NULL,
                UNIQUE(parent_id, child_id)
            );",
        )?;
        Ok(())
    }

    /// Register a new row; on duplicate (name, version, model_type) returns
    /// the existing id rather than erroring.
    pub fn register(
        &self,
        name: &str,
        version: &str,
        model_type: &str,
        status: ModelStatus,
        artifact_path: Option<&str>,
        metrics: Option<&Value>,
        now: i64,
    ) -> PipelineResult<i64> {
        let sanitized = metrics.map(sanitize_metrics);
        let metrics_json = sanitized.as_ref().map(|v| v.to_string());
        let inserted = self.conn.execute(
            "INSERT INTO model_registry (name, version, model_type, status, artifact_path, metrics, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)
             ON CONFLICT(name, version, model_type) DO NOTHING",
            params![name, version, model_type, status.as_str(), artifact_path, metrics_json, now],
        )?;
        if inserted > 0 {
            return Ok(self.conn.last_insert_rowid());
        }
        let id: i64 = self.conn.query_row(
            "SELECT id FROM model_registry WHERE name=?1 AND version=?2 AND model_type=?3",
            params![name, version, model_type],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn fetch_by_id(&self, id: i64) -> PipelineResult<Option<ModelRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, version, model_type, status, artifact_path, metrics, created_at, promoted_at
                 FROM model_registry WHERE id=?1",
                params![id],
                row_to_model,
            )
            .optional()?;
        Ok(row)
    }

    pub fn fetch_latest(&self, name: &str, model_type: &str, limit: usize) -> PipelineResult<Vec<ModelRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, version, model_type, status, artifact_path, metrics, created_at, promoted_at
             FROM model_registry WHERE name=?1 AND model_type=?2 ORDER BY created_at DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![name, model_type, limit as i64], row_to_model)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn fetch_production_history(&self, name: &str, model_type: &str, limit: usize) -> PipelineResult<Vec<ModelRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, version, model_type, status, artifact_path, metrics, created_at, promoted_at
             FROM model_registry WHERE name=?1 AND model_type=?2 AND status='production'
             ORDER BY COALESCE(promoted_at, created_at) DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![name, model_type, limit as i64], row_to_model)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Promote `id` to production iff it is not already, then demote every
    /// other production row with the same (name, model_type). Returns
    /// `false` without mutation if `id` was already production.
    pub fn promote(&self, id: i64, now: i64) -> PipelineResult<bool> {
        let Some(row) = self.fetch_by_id(id)? else {
            return Ok(false);
        };
        if row.status == ModelStatus::Production {
            return Ok(false);
        }
        let updated = self.conn.execute(
            "UPDATE model_registry SET status='production', promoted_at=?2 WHERE id=?1 AND status != 'production'",
            params![id, now],
        )?;
        if updated == 0 {
            return Ok(false);
        }
        self.demote_others(&row.name, &row.model_type, id)?;
        Ok(true)
    }

    pub fn demote_others(&self, name: &str, model_type: &str, keep_id: i64) -> PipelineResult<usize> {
        let n = self.conn.execute(
            "UPDATE model_registry SET status='staging'
             WHERE name=?1 AND model_type=?2 AND id != ?3 AND status='production'",
            params![name, model_type, keep_id],
        )?;
        Ok(n)
    }

    pub fn activate(&self, id: i64, now: i64) -> PipelineResult<bool> {
        let n = self.conn.execute(
            "UPDATE model_registry SET status='production', promoted_at=?2 WHERE id=?1",
            params![id, now],
        )?;
        Ok(n > 0)
    }

    pub fn soft_delete(&self, id: i64) -> PipelineResult<bool> {
        let n = self.conn.execute(
            "UPDATE model_registry SET status='deleted' WHERE id=?1 AND status != 'deleted'",
            params![id],
        )?;
        Ok(n > 0)
    }

    pub fn append_metrics(&self, id: i64, metrics: &Value, now: i64) -> PipelineResult<()> {
        let sanitized = sanitize_metrics(metrics);
        let json = sanitized.to_string();
        self.conn.execute(
            "INSERT INTO model_metrics_history (model_id, metrics, recorded_at) VALUES (?1,?2,?3)",
            params![id, json, now],
        )?;
        self.conn
            .execute("UPDATE model_registry SET metrics=?2 WHERE id=?1", params![id, json])?;
        Ok(())
    }

    pub fn add_lineage(&self, parent_id: i64, child_id: i64) -> PipelineResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO model_lineage (parent_id, child_id) VALUES (?1,?2)",
            params![parent_id, child_id],
        )?;
        Ok(())
    }

    /// Count of rows with status=production for (name, model_type) — used by
    /// tests to enforce invariant 6.
    pub fn production_count(&self, name: &str, model_type: &str) -> PipelineResult<i64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM model_registry WHERE name=?1 AND model_type=?2 AND status='production'",
            params![name, model_type],
            |r| r.get(0),
        )?;
        Ok(n)
    }
}

fn row_to_model(row: &rusqlite::Row) -> rusqlite::Result<ModelRow> {
    let status: String = row.get(4)?;
    let metrics_json: Option<String> = row.get(6)?;
    let metrics = metrics_json
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(Value::Null);
    Ok(ModelRow {
        id: row.get(0)?,
        name: row.get(1)?,
        version: row.get(2)?,
        model_type: row.get(3)?,
        status: ModelStatus::from_str(&status),
        artifact_path: row.get(5)?,
        metrics,
        created_at: row.get(7)?,
        promoted_at: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn promotion_demotes_incumbent() {
        let reg = ModelRegistry::in_memory().unwrap();
        let a = reg
            .register("bottom", "v1", "supervised", ModelStatus::Staging, None, None, 1)
            .unwrap();
        let b = reg
            .register("bottom", "v2", "supervised", ModelStatus::Staging, None, None, 2)
            .unwrap();
        assert!(reg.promote(a, 10).unwrap());
        assert_eq!(reg.production_count("bottom", "supervised").unwrap(), 1);
        assert!(reg.promote(b, 20).unwrap());
        assert_eq!(reg.production_count("bottom", "supervised").unwrap(), 1);
        assert_eq!(reg.fetch_by_id(a).unwrap().unwrap().status, ModelStatus::Staging);
        assert_eq!(reg.fetch_by_id(b).unwrap().unwrap().status, ModelStatus::Production);
    }

    #[test]
    fn register_on_conflict_returns_existing_id() {
        let reg = ModelRegistry::in_memory().unwrap();
        let a = reg
            .register("bottom", "v1", "supervised", ModelStatus::Staging, None, None, 1)
            .unwrap();
        let b = reg
            .register("bottom", "v1", "supervised", ModelStatus::Staging, None, None, 2)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sanitize_replaces_non_finite_with_null() {
        let v = json!({"auc": f64::NAN, "brier": 0.1});
        let sanitized = sanitize_metrics(&v);
        assert!(sanitized["auc"].is_null());
        assert_eq!(sanitized["brier"], 0.1);
    }
}
