//! C10 — Training Service: assembles a (features, label) dataset for one of
//! three label variants, runs time-ordered CV plus a final chronological
//! holdout, fits a standardized logistic classifier, and registers the
//! sealed artifact.
//!
//! Grounded on spec §4.7 (`RunTraining` variants, CV/holdout contract, data
//! sufficiency floors) and `original_source/backend/apps/training/service/
//! training_service.py`'s shared feature vector
//! `[ret_1, ret_5, ret_10, rsi_14, rolling_vol_20, ma_20, ma_50]`.

use super::artifact::ModelArtifact;
use super::cv::time_ordered_folds;
use super::dataset::{build_dataset, Dataset};
use super::metrics::{auc, brier_score, calibration_error};
use super::model::TrainedModel;
use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use crate::store::model_registry::sanitize_metrics;
use crate::store::{CandleStore, FeatureStore, InferenceLog, ModelRegistry, ModelStatus};
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

pub const FEATURE_ORDER: [&str; 7] = ["ret_1", "ret_5", "ret_10", "rsi_14", "rolling_vol_20", "ma_20", "ma_50"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelTarget {
    Direction1m,
    Horizon(usize),
    Bottom,
}

impl LabelTarget {
    pub fn name(&self) -> String {
        match self {
            LabelTarget::Direction1m => "direction_1m".to_string(),
            LabelTarget::Horizon(h) => format!("horizon_{h}m"),
            LabelTarget::Bottom => "bottom".to_string(),
        }
    }
}

#[derive(Debug)]
pub enum TrainingOutcome {
    Trained { model_id: i64, version: String, metrics: Value },
    InsufficientData { reason: String },
    InsufficientLabels { reason: String },
}

struct Standardizer {
    means: Vec<f64>,
    scales: Vec<f64>,
}

impl Standardizer {
    fn fit(rows: &[Vec<f64>]) -> Self {
        let n_features = rows.first().map(|r| r.len()).unwrap_or(0);
        let n = rows.len() as f64;
        let mut means = vec![0.0; n_features];
        for row in rows {
            for (j, &v) in row.iter().enumerate() {
                means[j] += v;
            }
        }
        for m in &mut means {
            *m /= n.max(1.0);
        }
        let mut variances = vec![0.0; n_features];
        for row in rows {
            for (j, &v) in row.iter().enumerate() {
                variances[j] += (v - means[j]).powi(2);
            }
        }
        let scales = variances
            .into_iter()
            .map(|v| {
                let std = (v / n.max(1.0)).sqrt();
                if std > 1e-12 {
                    std
                } else {
                    1.0
                }
            })
            .collect();
        Standardizer { means, scales }
    }

    fn transform(&self, rows: &[Vec<f64>]) -> Vec<Vec<f64>> {
        rows.iter()
            .map(|row| row.iter().enumerate().map(|(j, &v)| (v - self.means[j]) / self.scales[j]).collect())
            .collect()
    }
}

pub struct TrainingService {
    config: Config,
    candle_store: Arc<Mutex<CandleStore>>,
    feature_store: Arc<Mutex<FeatureStore>>,
    inference_log: Arc<Mutex<InferenceLog>>,
    model_registry: Arc<Mutex<ModelRegistry>>,
}

impl TrainingService {
    pub fn new(
        config: Config,
        candle_store: Arc<Mutex<CandleStore>>,
        feature_store: Arc<Mutex<FeatureStore>>,
        inference_log: Arc<Mutex<InferenceLog>>,
        model_registry: Arc<Mutex<ModelRegistry>>,
    ) -> Self {
        TrainingService { config, candle_store, feature_store, inference_log, model_registry }
    }

    /// `now` is ms-since-epoch, supplied by the caller rather than read from
    /// the clock so the generated version string stays deterministic.
    pub fn run(&self, target: LabelTarget, now: i64) -> PipelineResult<TrainingOutcome> {
        let labeled_points = self.labeled_points(target)?;
        if labeled_points.len() < self.config.train_min_bars {
            return Ok(TrainingOutcome::InsufficientData {
                reason: format!("{} labeled bars available, need at least {}", labeled_points.len(), self.config.train_min_bars),
            });
        }
        let positives = labeled_points.iter().filter(|&&(_, l)| l == 1).count();
        if positives < self.config.train_min_positive_labels {
            return Ok(TrainingOutcome::InsufficientLabels {
                reason: format!("{} positive labels available, need at least {}", positives, self.config.train_min_positive_labels),
            });
        }

        let dataset = {
            let fs = self.feature_store.lock().unwrap();
            build_dataset(&fs, &self.config.symbol, &self.config.interval, &labeled_points)?
        };
        let dataset = select_canonical_features(&dataset);
        let n = dataset.samples.len();
        if n < self.config.train_min_bars {
            return Ok(TrainingOutcome::InsufficientData {
                reason: format!("only {n} samples have a matching feature snapshot, need at least {}", self.config.train_min_bars),
            });
        }

        let cv_summary = self.run_cv(&dataset);

        let val_floor = 200usize.min(((n as f64) * 0.1).round() as usize).max(50.min(n));
        let mut val_n = ((n as f64) * self.config.train_val_frac).round() as usize;
        val_n = val_n.max(val_floor).min(n.saturating_sub(1)).max(1);
        let train_n = n - val_n;
        let train_idx: Vec<usize> = (0..train_n).collect();
        let val_idx: Vec<usize> = (train_n..n).collect();

        let train_set = dataset.subset(&train_idx);
        let val_set = dataset.subset(&val_idx);
        let train_labels = train_set.labels();
        if train_labels.iter().all(|&l| l == train_labels[0]) {
            return Ok(TrainingOutcome::InsufficientLabels {
                reason: "training split is single-class after holdout split".to_string(),
            });
        }

        let standardizer = Standardizer::fit(&train_set.feature_rows());
        let train_rows = standardizer.transform(&train_set.feature_rows());
        let val_rows = standardizer.transform(&val_set.feature_rows());

        let model = TrainedModel::fit(&dataset.feature_names, &train_rows, &train_labels)?;
        let val_probs = model.predict_proba(&val_rows);
        let val_labels = val_set.labels();

        let holdout_auc = auc(&val_probs, &val_labels);
        let holdout_brier = brier_score(&val_probs, &val_labels);
        let (ece, mce) = calibration_error(&val_probs, &val_labels);
        let holdout_accuracy = accuracy(&val_probs, &val_labels);

        let version = format!("{now}-{:06x}", rand::thread_rng().gen_range(0..0xFFFFFF_u32));

        let metrics = json!({
            "version": version,
            "target": target.name(),
            "feature_order": dataset.feature_names,
            "n_samples": n,
            "n_train": train_n,
            "n_val": val_n,
            "cv": cv_summary,
            "holdout": {
                "auc": holdout_auc,
                "accuracy": holdout_accuracy,
                "brier": holdout_brier,
                "ece": ece,
                "mce": mce,
            },
        });
        let sanitized_metrics = sanitize_metrics(&metrics);

        let model_bytes = model.to_bytes()?;
        let artifact = ModelArtifact::seal(&model_bytes, sanitized_metrics.clone())?;
        let artifact_bytes = artifact.to_json_bytes()?;
        let artifact_path = format!("{}/{}-{}.json", self.config.artifact_dir, self.config.model_name, version);
        std::fs::create_dir_all(&self.config.artifact_dir).map_err(|e| PipelineError::Unavailable(format!("artifact dir create failed: {e}")))?;
        std::fs::write(&artifact_path, &artifact_bytes).map_err(|e| PipelineError::Unavailable(format!("artifact write failed: {e}")))?;

        let model_id = {
            let registry = self.model_registry.lock().unwrap();
            registry.register(&self.config.model_name, &version, &target.name(), ModelStatus::Staging, Some(&artifact_path), Some(&sanitized_metrics), now)?
        };
        info!(model_id, version = %version, n_samples = n, "training run registered a staging model");

        Ok(TrainingOutcome::Trained { model_id, version, metrics: sanitized_metrics })
    }

    fn run_cv(&self, dataset: &Dataset) -> Value {
        let n = dataset.samples.len();
        let folds = time_ordered_folds(n, self.config.train_cv_folds);
        let mut aucs = Vec::new();
        let mut accs = Vec::new();
        let mut briers = Vec::new();
        let mut skipped = 0usize;

        for fold in &folds {
            if fold.val_idx.len() < 30 {
                skipped += 1;
                continue;
            }
            let train_set = dataset.subset(&fold.train_idx);
            let labels = train_set.labels();
            if labels.is_empty() || labels.iter().all(|&l| l == labels[0]) {
                skipped += 1;
                continue;
            }
            let val_set = dataset.subset(&fold.val_idx);
            let standardizer = Standardizer::fit(&train_set.feature_rows());
            let train_rows = standardizer.transform(&train_set.feature_rows());
            let val_rows = standardizer.transform(&val_set.feature_rows());

            let Ok(model) = TrainedModel::fit(&dataset.feature_names, &train_rows, &labels) else {
                skipped += 1;
                continue;
            };
            let probs = model.predict_proba(&val_rows);
            let val_labels = val_set.labels();
            if let Some(a) = auc(&probs, &val_labels) {
                aucs.push(a);
            }
            if let Some(acc) = accuracy(&probs, &val_labels) {
                accs.push(acc);
            }
            if let Some(b) = brier_score(&probs, &val_labels) {
                briers.push(b);
            }
        }

        if skipped > 0 {
            warn!(skipped, total = folds.len(), "skipped degenerate CV folds (validation < 30 rows or single-class training)");
        }

        json!({
            "folds_run": aucs.len(),
            "folds_skipped": skipped,
            "auc_mean": mean(&aucs),
            "auc_std": std_dev(&aucs),
            "accuracy_mean": mean(&accs),
            "brier_mean": mean(&briers),
        })
    }

    fn labeled_points(&self, target: LabelTarget) -> PipelineResult<Vec<(i64, i32)>> {
        match target {
            LabelTarget::Direction1m => self.direction_points(1),
            LabelTarget::Horizon(h) => self.direction_points(h),
            LabelTarget::Bottom => {
                let log = self.inference_log.lock().unwrap();
                let records = log.fetch_labeled_for_calibration(&self.config.symbol, &self.config.interval, usize::MAX)?;
                Ok(records
                    .into_iter()
                    .filter(|r| r.target == "bottom")
                    .filter_map(|r| r.realized_label.map(|l| (r.created_at, l)))
                    .collect())
            }
        }
    }

    fn direction_points(&self, horizon: usize) -> PipelineResult<Vec<(i64, i32)>> {
        let candles = {
            let cs = self.candle_store.lock().unwrap();
            cs.fetch_range(&self.config.symbol, &self.config.interval, 0, i64::MAX)?
        };
        if candles.len() <= horizon {
            return Ok(Vec::new());
        }
        let closes: Vec<f64> = candles.iter().map(|c| c.close.to_f64().unwrap_or(0.0)).collect();
        let points = (0..closes.len() - horizon)
            .map(|i| {
                let label = if closes[i + horizon] > closes[i] { 1 } else { 0 };
                (candles[i].close_time, label)
            })
            .collect();
        Ok(points)
    }
}

/// Reorders a dataset's feature columns into the canonical vector, dropping
/// any extended features the snapshot store also carries.
fn select_canonical_features(dataset: &Dataset) -> Dataset {
    let present: std::collections::HashMap<&str, usize> = dataset.feature_names.iter().map(|s| s.as_str()).zip(0..).collect();
    let wanted: Vec<usize> = FEATURE_ORDER.iter().filter_map(|name| present.get(name).copied()).collect();
    let names: Vec<String> = FEATURE_ORDER.iter().filter(|name| present.contains_key(*name)).map(|s| s.to_string()).collect();
    let samples = dataset
        .samples
        .iter()
        .map(|s| super::dataset::Sample {
            close_time: s.close_time,
            features: wanted.iter().map(|&idx| s.features[idx]).collect(),
            label: s.label,
        })
        .collect();
    Dataset { feature_names: names, samples }
}

fn accuracy(probs: &[f64], labels: &[i32]) -> Option<f64> {
    if probs.is_empty() {
        return None;
    }
    let correct = probs.iter().zip(labels).filter(|&(&p, &l)| ((p >= 0.5) as i32) == l).count();
    Some(correct as f64 / probs.len() as f64)
}

fn mean(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        None
    } else {
        Some(xs.iter().sum::<f64>() / xs.len() as f64)
    }
}

fn std_dev(xs: &[f64]) -> Option<f64> {
    let m = mean(xs)?;
    if xs.len() < 2 {
        return Some(0.0);
    }
    let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64;
    Some(var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle::{Candle, IngestionSource};
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn candle(open_time: i64, close: f64) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            interval: "1m".into(),
            open_time,
            close_time: open_time + 59_999,
            open: Decimal::from_str(&close.to_string()).unwrap(),
            high: Decimal::from_str(&(close + 1.0).to_string()).unwrap(),
            low: Decimal::from_str(&(close - 1.0).to_string()).unwrap(),
            close: Decimal::from_str(&close.to_string()).unwrap(),
            volume: Decimal::from_str("10").unwrap(),
            trade_count: 5,
            taker_buy_volume: Decimal::from_str("5").unwrap(),
            taker_buy_quote_volume: Decimal::from_str("500").unwrap(),
            is_closed: true,
            ingestion_source: IngestionSource::WsLive,
        }
    }

    fn config() -> Config {
        let mut c = Config::from_env().unwrap();
        c.symbol = "BTCUSDT".into();
        c.interval = "1m".into();
        c.interval_ms = 60_000;
        c.train_min_bars = 60;
        c.train_min_positive_labels = 5;
        c.train_cv_folds = 2;
        c.artifact_dir = std::env::temp_dir().join("training_service_test").to_string_lossy().to_string();
        c
    }

    fn seed_candles_and_features(n: usize) -> (Arc<Mutex<CandleStore>>, Arc<Mutex<FeatureStore>>) {
        let candle_store = Arc::new(Mutex::new(CandleStore::in_memory().unwrap()));
        let feature_store = Arc::new(Mutex::new(FeatureStore::in_memory().unwrap()));
        let mut candles = Vec::new();
        let mut closes = Vec::new();
        for i in 0..n {
            let price = 100.0 + ((i % 7) as f64) - ((i % 5) as f64);
            closes.push(price);
            candles.push(candle((i as i64) * 60_000, price));
        }
        {
            let mut cs = candle_store.lock().unwrap();
            cs.bulk_upsert(&candles).unwrap();
        }
        {
            let mut fs = feature_store.lock().unwrap();
            for i in 0..n {
                let window = &closes[..=i];
                let values = crate::features::calculators::compute_all(window);
                fs.write_snapshot("BTCUSDT", "1m", candles[i].close_time, 0, &values).unwrap();
            }
        }
        (candle_store, feature_store)
    }

    #[test]
    fn insufficient_bars_short_circuits_before_fitting() {
        let (candle_store, feature_store) = seed_candles_and_features(10);
        let inference_log = Arc::new(Mutex::new(InferenceLog::in_memory().unwrap()));
        let model_registry = Arc::new(Mutex::new(ModelRegistry::in_memory().unwrap()));
        let service = TrainingService::new(config(), candle_store, feature_store, inference_log, model_registry);
        let outcome = service.run(LabelTarget::Direction1m, 1_000_000).unwrap();
        assert!(matches!(outcome, TrainingOutcome::InsufficientData { .. }));
    }

    #[test]
    fn direction_target_trains_and_registers_a_staging_model() {
        let (candle_store, feature_store) = seed_candles_and_features(300);
        let inference_log = Arc::new(Mutex::new(InferenceLog::in_memory().unwrap()));
        let model_registry = Arc::new(Mutex::new(ModelRegistry::in_memory().unwrap()));
        let service = TrainingService::new(config(), candle_store, feature_store, inference_log, model_registry.clone());
        let outcome = service.run(LabelTarget::Direction1m, 1_000_000).unwrap();
        match outcome {
            TrainingOutcome::Trained { model_id, .. } => {
                let registry = model_registry.lock().unwrap();
                let row = registry.fetch_by_id(model_id).unwrap().unwrap();
                assert_eq!(row.status, ModelStatus::Staging);
                assert!(row.artifact_path.is_some());
            }
            other => panic!("expected a trained model, got {other:?}"),
        }
    }
}
