//! Explicit replacement for the "module-level cache of model objects by
//! name" pattern: an owned component mapping model name to its most
//! recently loaded `(version, bytes, loaded_at)`, evicted by TTL rather than
//! living forever as a process-global.
//!
//! Grounded on spec §9's Design Notes entry for this exact pattern; `moka`
//! is the teacher's own cache dependency (`Cargo.toml`, used in
//! `web_server.rs`'s candle cache before that module was trimmed) repurposed
//! here for model bytes instead of candles.

use crate::error::{PipelineError, PipelineResult};
use crate::store::ModelRegistry;
use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub version: String,
    pub bytes: Arc<Vec<u8>>,
}

pub struct ModelCache {
    cache: Cache<String, LoadedModel>,
}

impl ModelCache {
    pub fn new(ttl: Duration, max_capacity: u64) -> Self {
        ModelCache {
            cache: Cache::builder().time_to_live(ttl).max_capacity(max_capacity).build(),
        }
    }

    /// Returns the cached production model bytes for `(name, model_type)`,
    /// loading from the registry + artifact file on a cache miss or after
    /// the version on disk has changed.
    pub fn get_or_load(&self, registry: &ModelRegistry, name: &str, model_type: &str) -> PipelineResult<LoadedModel> {
        let key = format!("{name}:{model_type}");
        let rows = registry.fetch_production_history(name, model_type, 1)?;
        let Some(row) = rows.into_iter().next() else {
            return Err(PipelineError::Unavailable(format!("no production model for {name}:{model_type}")));
        };

        if let Some(cached) = self.cache.get(&key) {
            if cached.version == row.version {
                return Ok(cached);
            }
        }

        let path = row.artifact_path.ok_or_else(|| PipelineError::Integrity(format!("production row {} has no artifact_path", row.id)))?;
        let bytes = std::fs::read(&path).map_err(|e| PipelineError::Unavailable(format!("artifact read failed: {e}")))?;
        let artifact = super::artifact::ModelArtifact::from_json_bytes(&bytes)?;
        let model_bytes = artifact.model_bytes()?;
        let loaded = LoadedModel { version: row.version, bytes: Arc::new(model_bytes) };
        self.cache.insert(key, loaded.clone());
        Ok(loaded)
    }

    pub fn invalidate(&self, name: &str, model_type: &str) {
        self.cache.invalidate(&format!("{name}:{model_type}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ModelStatus;
    use crate::training::artifact::ModelArtifact;
    use serde_json::json;

    #[test]
    fn loads_then_serves_from_cache_until_version_changes() {
        let dir = std::env::temp_dir().join("model_cache_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bottom-v1.json");
        let artifact = ModelArtifact::seal(b"v1-bytes", json!({"auc": 0.8})).unwrap();
        std::fs::write(&path, artifact.to_json_bytes().unwrap()).unwrap();

        let registry = ModelRegistry::in_memory().unwrap();
        registry
            .register("bottom", "v1", "bottom", ModelStatus::Production, Some(path.to_str().unwrap()), Some(&json!({"auc": 0.8})), 1)
            .unwrap();

        let cache = ModelCache::new(Duration::from_secs(60), 10);
        let loaded = cache.get_or_load(&registry, "bottom", "bottom").unwrap();
        assert_eq!(*loaded.bytes, b"v1-bytes".to_vec());

        std::fs::remove_file(&path).unwrap();
        let loaded_again = cache.get_or_load(&registry, "bottom", "bottom").unwrap();
        assert_eq!(loaded_again.version, "v1");
    }
}
