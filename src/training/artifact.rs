//! Model artifact serialization: a base64-wrapped model blob plus a sha256
//! checksum over the model bytes and the canonical metrics JSON, so a stored
//! artifact can detect silent corruption on load.
//!
//! Grounded on spec §6's artifact file format note (`serde_json` + `base64`
//! + `sha2`/`hex`, the same crates `orc2626-tech-sBot9999` and
//! `cooprefr-bettersys` use for signing/checksumming request payloads).

use crate::error::{PipelineError, PipelineResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub sk_model_b64: String,
    pub metrics: Value,
    pub checksum: String,
}

impl ModelArtifact {
    /// `serde_json::Value::Object` is backed by a `BTreeMap`, so `metrics`
    /// serializes with sorted keys for free — the checksum is stable across
    /// runs without a separate canonicalization pass.
    pub fn seal(model_bytes: &[u8], metrics: Value) -> PipelineResult<Self> {
        let sk_model_b64 = STANDARD.encode(model_bytes);
        let metrics_json = serde_json::to_vec(&metrics).map_err(|e| PipelineError::Integrity(format!("metrics serialize failed: {e}")))?;
        let checksum = checksum_of(model_bytes, &metrics_json);
        Ok(ModelArtifact { sk_model_b64, metrics, checksum })
    }

    pub fn to_json_bytes(&self) -> PipelineResult<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| PipelineError::Integrity(format!("artifact serialize failed: {e}")))
    }

    pub fn from_json_bytes(bytes: &[u8]) -> PipelineResult<Self> {
        let artifact: ModelArtifact = serde_json::from_slice(bytes).map_err(|e| PipelineError::Integrity(format!("artifact deserialize failed: {e}")))?;
        artifact.verify_checksum()?;
        Ok(artifact)
    }

    pub fn model_bytes(&self) -> PipelineResult<Vec<u8>> {
        STANDARD.decode(&self.sk_model_b64).map_err(|e| PipelineError::Integrity(format!("model b64 decode failed: {e}")))
    }

    fn verify_checksum(&self) -> PipelineResult<()> {
        let model_bytes = self.model_bytes()?;
        let metrics_json = serde_json::to_vec(&self.metrics).map_err(|e| PipelineError::Integrity(format!("metrics serialize failed: {e}")))?;
        let expected = checksum_of(&model_bytes, &metrics_json);
        if expected != self.checksum {
            return Err(PipelineError::Integrity(format!("artifact checksum mismatch: expected {expected}, got {}", self.checksum)));
        }
        Ok(())
    }
}

fn checksum_of(model_bytes: &[u8], metrics_json: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model_bytes);
    hasher.update(metrics_json);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn seal_then_load_round_trips() {
        let artifact = ModelArtifact::seal(b"fake model bytes", json!({"auc": 0.9})).unwrap();
        let bytes = artifact.to_json_bytes().unwrap();
        let loaded = ModelArtifact::from_json_bytes(&bytes).unwrap();
        assert_eq!(loaded.model_bytes().unwrap(), b"fake model bytes");
        assert_eq!(loaded.metrics["auc"], 0.9);
    }

    #[test]
    fn tampered_metrics_fail_checksum_verification() {
        let artifact = ModelArtifact::seal(b"fake model bytes", json!({"auc": 0.9})).unwrap();
        let mut bytes = artifact.to_json_bytes().unwrap();
        let s = String::from_utf8(bytes.clone()).unwrap().replace("0.9", "0.1");
        bytes = s.into_bytes();
        assert!(ModelArtifact::from_json_bytes(&bytes).is_err());
    }
}
