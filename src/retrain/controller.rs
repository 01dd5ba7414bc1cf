//! C11 — Retrain Controller: polls feature drift and calibration drift,
//! triggers a training run when either fires, then runs the promotion gate
//! against the current production model.
//!
//! Grounded on `original_source/backend/apps/training/
//! auto_retrain_scheduler.py`'s main loop (minimum-interval gating,
//! advisory-lock-style single-flight via a `try_lock`, state machine
//! `idle -> evaluating -> training -> promoting -> idle`) and
//! `auto_promotion.py::promote_if_better`'s threshold checks, adapted from
//! asyncpg's `pg_try_advisory_lock` to an in-process `tokio::sync::Mutex`
//! since this pipeline is single-process.

use super::calibration::{cv_degradation_active, cv_degradation_ratio, CalibrationMonitor};
use super::drift::{aggregate_drift, ConsecutiveDriftCounter};
use crate::config::Config;
use crate::error::PipelineResult;
use crate::store::{FeatureStore, InferenceLog, ModelRegistry, ModelStatus};
use crate::training::service::{LabelTarget, TrainingOutcome, TrainingService};
use serde_json::Value;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Evaluating,
    Training,
    Promoting,
}

#[derive(Debug, Clone)]
pub struct PromotionDecision {
    pub promoted: bool,
    pub reason: String,
}

pub struct RetrainController {
    config: Config,
    feature_store: Arc<StdMutex<FeatureStore>>,
    inference_log: Arc<StdMutex<InferenceLog>>,
    model_registry: Arc<StdMutex<ModelRegistry>>,
    training_service: TrainingService,
    run_lock: AsyncMutex<()>,
    drift_counter: StdMutex<ConsecutiveDriftCounter>,
    calibration_monitor: StdMutex<CalibrationMonitor>,
    last_run_ms: StdMutex<Option<i64>>,
    state: StdMutex<ControllerState>,
}

impl RetrainController {
    pub fn new(
        config: Config,
        feature_store: Arc<StdMutex<FeatureStore>>,
        inference_log: Arc<StdMutex<InferenceLog>>,
        model_registry: Arc<StdMutex<ModelRegistry>>,
        training_service: TrainingService,
    ) -> Self {
        let calibration_monitor = CalibrationMonitor::new(config.calibration_ece_abs_threshold, config.calibration_ece_rel_threshold, config.auto_retrain_required_consecutive_drifts);
        RetrainController {
            config,
            feature_store,
            inference_log,
            model_registry,
            training_service,
            run_lock: AsyncMutex::new(()),
            drift_counter: StdMutex::new(ConsecutiveDriftCounter::default()),
            calibration_monitor: StdMutex::new(calibration_monitor),
            last_run_ms: StdMutex::new(None),
            state: StdMutex::new(ControllerState::Idle),
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.auto_retrain_check_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.check_once(current_time_ms()).await {
                warn!(error = %e, "retrain controller check failed");
            }
        }
    }

    /// `now` is ms-since-epoch, threaded through explicitly so tests can
    /// drive the minimum-interval gate deterministically.
    pub async fn check_once(&self, now: i64) -> PipelineResult<Option<TrainingOutcome>> {
        if !self.config.auto_retrain_enabled {
            return Ok(None);
        }
        if let Some(last) = *self.last_run_ms.lock().unwrap() {
            if now - last < self.config.auto_retrain_min_interval.as_millis() as i64 {
                return Ok(None);
            }
        }

        let Ok(_permit) = self.run_lock.try_lock() else {
            return Ok(None);
        };
        *self.state.lock().unwrap() = ControllerState::Evaluating;

        let feature_drift_trigger = {
            let fs = self.feature_store.lock().unwrap();
            let aggregate = aggregate_drift(&fs, &self.config.symbol, &self.config.interval, &self.config)?;
            drop(fs);
            let drift_flag = aggregate.as_ref().map(|a| a.triggered).unwrap_or(false);
            let streak = self.drift_counter.lock().unwrap().observe(drift_flag);
            if let Some(a) = &aggregate {
                info!(feature = %a.selected_feature, z = a.z_score, streak, "drift check");
            }
            streak >= self.config.auto_retrain_required_consecutive_drifts
        };

        let calibration_trigger = if self.config.calibration_retrain_enabled {
            let inference_log = self.inference_log.lock().unwrap();
            let registry = self.model_registry.lock().unwrap();
            let mut monitor = self.calibration_monitor.lock().unwrap();
            monitor.check(&inference_log, &registry, &self.config.symbol, &self.config.interval, &self.config.model_name, "bottom", self.config.auto_retrain_drift_window)?;
            let recommends = monitor.recommends_retrain();
            let ratio = cv_degradation_ratio(&registry, &self.config.model_name, "bottom")?;
            recommends || cv_degradation_active(ratio, self.config.calibration_cv_degradation_min_ratio)
        } else {
            false
        };

        if !feature_drift_trigger && !calibration_trigger {
            *self.state.lock().unwrap() = ControllerState::Idle;
            return Ok(None);
        }

        *self.state.lock().unwrap() = ControllerState::Training;
        let outcome = self.training_service.run(LabelTarget::Bottom, now)?;
        *self.last_run_ms.lock().unwrap() = Some(now);

        if let TrainingOutcome::Trained { model_id, ref metrics, .. } = outcome {
            self.drift_counter.lock().unwrap().observe(false);
            self.calibration_monitor.lock().unwrap().reset();
            *self.state.lock().unwrap() = ControllerState::Promoting;
            let decision = self.promote_if_better(model_id, metrics)?;
            info!(model_id, promoted = decision.promoted, reason = %decision.reason, "promotion gate evaluated");
        }

        *self.state.lock().unwrap() = ControllerState::Idle;
        Ok(Some(outcome))
    }

    /// Grounded on `auto_promotion.py::promote_if_better`'s threshold
    /// checks: sample growth, relative AUC improvement, and bounded
    /// Brier/ECE degradation, each compared against the current production
    /// row in the same (name, model_type) family.
    pub fn promote_if_better(&self, new_model_id: i64, new_metrics: &Value) -> PipelineResult<PromotionDecision> {
        if !self.config.auto_promote_enabled {
            return Ok(PromotionDecision { promoted: false, reason: "disabled".to_string() });
        }
        let registry = self.model_registry.lock().unwrap();
        let Some(new_row) = registry.fetch_by_id(new_model_id)? else {
            return Ok(PromotionDecision { promoted: false, reason: "unknown_model_id".to_string() });
        };
        let latest = registry.fetch_latest(&new_row.name, &new_row.model_type, 10)?;
        let production = latest.into_iter().find(|r| r.status == ModelStatus::Production);

        let Some(production) = production else {
            let promoted = registry.promote(new_model_id, 0)?;
            return Ok(PromotionDecision {
                promoted,
                reason: if promoted { "no_existing_production".to_string() } else { "promotion_call_failed".to_string() },
            });
        };

        let new_holdout = new_metrics.get("holdout");
        let prod_holdout = production.metrics.get("holdout");

        if let (Some(prod_samples), Some(new_samples)) = (production.metrics.get("n_samples").and_then(Value::as_f64), new_metrics.get("n_samples").and_then(Value::as_f64)) {
            if new_samples < prod_samples * self.config.auto_promote_min_sample_growth {
                return Ok(PromotionDecision { promoted: false, reason: "insufficient_sample_growth".to_string() });
            }
        }

        if let (Some(prod_auc), Some(new_auc)) = (metric_f64(prod_holdout, "auc"), metric_f64(new_holdout, "auc")) {
            let rel_improve = if prod_auc.abs() > 0.0 {
                (new_auc - prod_auc) / prod_auc.abs()
            } else if new_auc > prod_auc {
                f64::INFINITY
            } else {
                0.0
            };
            if rel_improve < self.config.auto_promote_min_auc_improve {
                return Ok(PromotionDecision { promoted: false, reason: "insufficient_auc_improvement".to_string() });
            }
        }

        if let (Some(prod_brier), Some(new_brier)) = (metric_f64(prod_holdout, "brier"), metric_f64(new_holdout, "brier")) {
            let delta = new_brier - prod_brier;
            if self.config.promotion_require_non_worse_calibration && delta > 0.0 {
                return Ok(PromotionDecision { promoted: false, reason: "brier_worse_blocked".to_string() });
            }
            if delta > self.config.promotion_max_brier_degradation {
                return Ok(PromotionDecision { promoted: false, reason: "brier_degradation_too_large".to_string() });
            }
        }

        if let (Some(prod_ece), Some(new_ece)) = (metric_f64(prod_holdout, "ece"), metric_f64(new_holdout, "ece")) {
            let delta = new_ece - prod_ece;
            if self.config.promotion_require_non_worse_calibration && delta > 0.0 {
                return Ok(PromotionDecision { promoted: false, reason: "ece_worse_blocked".to_string() });
            }
            if delta > self.config.promotion_max_ece_degradation {
                return Ok(PromotionDecision { promoted: false, reason: "ece_degradation_too_large".to_string() });
            }
        }

        let promoted = registry.promote(new_model_id, 0)?;
        Ok(PromotionDecision {
            promoted,
            reason: if promoted { "promotion_success".to_string() } else { "promotion_call_failed".to_string() },
        })
    }
}

fn metric_f64(block: Option<&Value>, key: &str) -> Option<f64> {
    block?.get(key)?.as_f64()
}

fn current_time_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CandleStore;
    use serde_json::json;

    fn config() -> Config {
        let mut c = Config::from_env().unwrap();
        c.symbol = "BTCUSDT".into();
        c.interval = "1m".into();
        c.interval_ms = 60_000;
        c.auto_retrain_enabled = true;
        c.calibration_retrain_enabled = false;
        c.auto_retrain_min_interval = Duration::from_secs(0);
        c
    }

    fn controller() -> RetrainController {
        let candle_store = Arc::new(StdMutex::new(CandleStore::in_memory().unwrap()));
        let feature_store = Arc::new(StdMutex::new(FeatureStore::in_memory().unwrap()));
        let inference_log = Arc::new(StdMutex::new(InferenceLog::in_memory().unwrap()));
        let model_registry = Arc::new(StdMutex::new(ModelRegistry::in_memory().unwrap()));
        let training_service = TrainingService::new(config(), candle_store, feature_store.clone(), inference_log.clone(), model_registry.clone());
        RetrainController::new(config(), feature_store, inference_log, model_registry, training_service)
    }

    #[tokio::test]
    async fn idle_when_disabled() {
        let mut cfg = config();
        cfg.auto_retrain_enabled = false;
        let candle_store = Arc::new(StdMutex::new(CandleStore::in_memory().unwrap()));
        let feature_store = Arc::new(StdMutex::new(FeatureStore::in_memory().unwrap()));
        let inference_log = Arc::new(StdMutex::new(InferenceLog::in_memory().unwrap()));
        let model_registry = Arc::new(StdMutex::new(ModelRegistry::in_memory().unwrap()));
        let training_service = TrainingService::new(cfg.clone(), candle_store, feature_store.clone(), inference_log.clone(), model_registry.clone());
        let controller = RetrainController::new(cfg, feature_store, inference_log, model_registry, training_service);
        let outcome = controller.check_once(0).await.unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn promotion_requires_sample_growth() {
        let controller = controller();
        let registry = controller.model_registry.lock().unwrap();
        registry
            .register("bottom", "v1", "bottom", ModelStatus::Production, None, Some(&json!({"n_samples": 1000, "holdout": {"auc": 0.7}})), 1)
            .unwrap();
        let new_id = registry
            .register("bottom", "v2", "bottom", ModelStatus::Staging, None, Some(&json!({"n_samples": 500, "holdout": {"auc": 0.9}})), 2)
            .unwrap();
        drop(registry);
        let decision = controller.promote_if_better(new_id, &json!({"n_samples": 500, "holdout": {"auc": 0.9}})).unwrap();
        assert!(!decision.promoted);
        assert_eq!(decision.reason, "insufficient_sample_growth");
    }

    #[test]
    fn promotion_succeeds_when_every_gate_passes() {
        let controller = controller();
        let registry = controller.model_registry.lock().unwrap();
        registry
            .register("bottom", "v1", "bottom", ModelStatus::Production, None, Some(&json!({"n_samples": 500, "holdout": {"auc": 0.7, "brier": 0.2, "ece": 0.05}})), 1)
            .unwrap();
        let new_id = registry
            .register(
                "bottom",
                "v2",
                "bottom",
                ModelStatus::Staging,
                None,
                Some(&json!({"n_samples": 1000, "holdout": {"auc": 0.9, "brier": 0.15, "ece": 0.04}})),
                2,
            )
            .unwrap();
        drop(registry);
        let decision = controller
            .promote_if_better(new_id, &json!({"n_samples": 1000, "holdout": {"auc": 0.9, "brier": 0.15, "ece": 0.04}}))
            .unwrap();
        assert!(decision.promoted);
        let registry = controller.model_registry.lock().unwrap();
        assert_eq!(registry.fetch_by_id(new_id).unwrap().unwrap().status, ModelStatus::Production);
    }
}
