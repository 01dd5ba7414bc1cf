//! Calibration drift monitor: tracks ECE on recent labeled inferences
//! against the current production model's recorded ECE, and a CV-mean-AUC
//! degradation ratio that co-gates the calibration retrain path.
//!
//! Grounded on `original_source/backend/apps/training/
//! auto_retrain_scheduler.py`'s calibration block: `abs_drift`/`rel_drift`
//! flags, a streak counter, and `last_cv_mean_auc / production_auc` as the
//! degradation ratio.

use crate::error::PipelineResult;
use crate::store::{InferenceLog, ModelRegistry, ModelStatus};
use crate::training::metrics::calibration_error;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct CalibrationSnapshot {
    pub live_ece: f64,
    pub prod_ece: f64,
    pub delta: f64,
    pub abs_drift: bool,
    pub rel_drift: bool,
}

pub struct CalibrationMonitor {
    abs_threshold: f64,
    rel_threshold: f64,
    streak: u32,
    required_streak: u32,
}

impl CalibrationMonitor {
    pub fn new(abs_threshold: f64, rel_threshold: f64, required_streak: u32) -> Self {
        CalibrationMonitor { abs_threshold, rel_threshold, streak: 0, required_streak }
    }

    /// Computes live ECE over the most recent `window` labeled inferences
    /// and compares it to the production model's recorded ECE. Returns
    /// `None` if there isn't a labeled sample or a production ECE to
    /// compare against.
    pub fn check(
        &mut self,
        inference_log: &InferenceLog,
        model_registry: &ModelRegistry,
        symbol: &str,
        interval: &str,
        model_name: &str,
        model_type: &str,
        window: usize,
    ) -> PipelineResult<Option<CalibrationSnapshot>> {
        let records = inference_log.fetch_labeled_for_calibration(symbol, interval, window)?;
        if records.is_empty() {
            self.streak = 0;
            return Ok(None);
        }
        let probs: Vec<f64> = records.iter().map(|r| r.probability).collect();
        let labels: Vec<i32> = records.iter().filter_map(|r| r.realized_label).collect();
        if labels.len() != probs.len() || labels.is_empty() {
            self.streak = 0;
            return Ok(None);
        }
        let (Some(live_ece), _) = calibration_error(&probs, &labels) else {
            self.streak = 0;
            return Ok(None);
        };

        let Some(prod_ece) = production_ece(model_registry, model_name, model_type)? else {
            self.streak = 0;
            return Ok(None);
        };

        let delta = live_ece - prod_ece;
        let abs_drift = delta >= self.abs_threshold;
        let rel_drift = prod_ece > 0.0 && (delta / prod_ece) >= self.rel_threshold;
        let drifting = abs_drift || rel_drift;
        self.streak = if drifting { self.streak + 1 } else { 0 };

        Ok(Some(CalibrationSnapshot { live_ece, prod_ece, delta, abs_drift, rel_drift }))
    }

    /// A recommendation fires once the drift condition has held for
    /// `required_streak` consecutive checks, matching the original's
    /// `_streak_state.last_recommend` gate.
    pub fn recommends_retrain(&self) -> bool {
        self.streak >= self.required_streak.max(1)
    }

    pub fn reset(&mut self) {
        self.streak = 0;
    }
}

fn production_ece(model_registry: &ModelRegistry, model_name: &str, model_type: &str) -> PipelineResult<Option<f64>> {
    let rows = model_registry.fetch_production_history(model_name, model_type, 1)?;
    Ok(rows.first().and_then(|r| extract_metric(&r.metrics, "ece")))
}

/// `last_cv_mean_auc / production_auc`: active (degraded) when the ratio
/// drops below `min_ratio`. Returns `None` when either side is missing.
pub fn cv_degradation_ratio(model_registry: &ModelRegistry, model_name: &str, model_type: &str) -> PipelineResult<Option<f64>> {
    let latest = model_registry.fetch_latest(model_name, model_type, 5)?;
    let prod_auc = latest.iter().find_map(|r| {
        if r.status == ModelStatus::Production {
            extract_metric(&r.metrics, "auc")
        } else {
            None
        }
    });
    let last_cv_mean = latest.iter().find_map(|r| extract_metric(&r.metrics, "cv").and_then(|_| cv_mean_auc(&r.metrics)));
    match (prod_auc, last_cv_mean) {
        (Some(p), Some(c)) if p != 0.0 => Ok(Some(c / p)),
        _ => Ok(None),
    }
}

pub fn cv_degradation_active(ratio: Option<f64>, min_ratio: f64) -> bool {
    ratio.map(|r| r < min_ratio).unwrap_or(false)
}

fn extract_metric(metrics: &Value, key: &str) -> Option<f64> {
    metrics.get(key).and_then(|v| v.as_f64())
}

fn cv_mean_auc(metrics: &Value) -> Option<f64> {
    metrics.get("cv")?.get("auc_mean")?.as_f64()
}
