//! Runtime configuration, assembled from environment variables with typed
//! defaults. Kept deliberately outside any config-loading crate: the
//! pipeline treats configuration as an external collaborator (see spec §1),
//! this module only exists so the binary has something to pass around.

use crate::error::PipelineError;
use std::env;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone)]
pub struct Config {
    pub symbol: String,
    pub interval: String,
    pub interval_ms: i64,
    pub ingestion_enabled: bool,

    pub kline_batch_size: usize,
    pub flush_interval: Duration,

    pub feature_sched_interval: Duration,
    pub extended_features: bool,

    pub sentiment_step_ms: i64,
    pub sentiment_lookback_min: i64,
    pub sentiment_ema_windows: Vec<i64>,
    pub sentiment_pos_threshold: f64,

    pub bottom_lookahead: usize,
    pub bottom_drawdown: f64,
    pub bottom_rebound: f64,

    pub auto_retrain_enabled: bool,
    pub auto_retrain_check_interval: Duration,
    pub auto_retrain_min_interval: Duration,
    pub auto_retrain_min_samples: usize,
    pub auto_retrain_required_consecutive_drifts: u32,
    pub auto_retrain_drift_window: usize,
    pub drift_z_threshold: f64,
    pub auto_retrain_drift_mode: DriftMode,
    pub auto_retrain_drift_features: Vec<String>,
    pub auto_retrain_lock_key: i64,
    pub calibration_retrain_enabled: bool,
    pub calibration_retrain_min_interval: Duration,
    pub calibration_cv_degradation_min_ratio: f64,
    pub calibration_ece_abs_threshold: f64,
    pub calibration_ece_rel_threshold: f64,

    pub auto_promote_enabled: bool,
    pub auto_promote_min_interval: Duration,
    pub auto_promote_min_sample_growth: f64,
    pub auto_promote_min_auc_improve: f64,
    pub promotion_max_brier_degradation: f64,
    pub promotion_max_ece_degradation: f64,
    pub promotion_require_non_worse_calibration: bool,

    pub inference_prob_threshold: f64,

    pub gap_backfill_max_batch: u32,
    pub gap_orchestrator_concurrency: usize,
    pub gap_orchestrator_poll_interval: Duration,

    pub train_val_frac: f64,
    pub train_cv_folds: usize,
    pub train_min_bars: usize,
    pub train_min_positive_labels: usize,
    pub model_name: String,
    pub artifact_dir: String,

    pub db_dir: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftMode {
    MaxAbs,
    MeanTop3,
}

impl Config {
    pub fn from_env() -> Result<Self, PipelineError> {
        let symbol = env_string("SYMBOL", "BTCUSDT");
        let interval = env_string("INTERVAL", "1m");
        let interval_ms = interval_to_ms(&interval)
            .ok_or_else(|| PipelineError::Config(format!("unrecognized interval {interval}")))?;

        let drift_mode = match env_string("AUTO_RETRAIN_DRIFT_MODE", "max_abs").as_str() {
            "mean_top3" => DriftMode::MeanTop3,
            "max_abs" => DriftMode::MaxAbs,
            other => {
                return Err(PipelineError::Config(format!("unknown drift mode {other}")));
            }
        };

        let sentiment_ema_windows = env_string("SENTIMENT_EMA_WINDOWS", "5,15,60")
            .split(',')
            .filter_map(|s| s.trim().parse::<i64>().ok())
            .collect();

        let drift_features: Vec<String> = env_string("AUTO_RETRAIN_DRIFT_FEATURES", "ret_1")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let val_frac: f64 = env_or("TRAIN_VAL_FRAC", 0.2);
        if !(0.0..0.9).contains(&val_frac) {
            return Err(PipelineError::Config(format!(
                "TRAIN_VAL_FRAC out of (0, 0.9): {val_frac}"
            )));
        }

        Ok(Config {
            symbol,
            interval,
            interval_ms,
            ingestion_enabled: env_or("INGESTION_ENABLED", true),
            kline_batch_size: env_or("KLINE_CONSUMER_BATCH_SIZE", 50),
            flush_interval: Duration::from_secs_f64(env_or("FLUSH_INTERVAL_SECONDS", 1.0)),
            feature_sched_interval: Duration::from_secs_f64(env_or("FEATURE_SCHED_INTERVAL", 30.0)),
            extended_features: env_or("EXTENDED_FEATURES", false),
            sentiment_step_ms: env_or("SENTIMENT_STEP_DEFAULT", 60_000),
            sentiment_lookback_min: env_or("SENTIMENT_LOOKBACK_MIN", 60),
            sentiment_ema_windows,
            sentiment_pos_threshold: env_or("SENTIMENT_POS_THRESHOLD", 0.0),
            bottom_lookahead: env_or("BOTTOM_LOOKAHEAD", 30),
            bottom_drawdown: env_or("BOTTOM_DRAWDOWN", 0.005),
            bottom_rebound: env_or("BOTTOM_REBOUND", 0.003),
            auto_retrain_enabled: env_or("AUTO_RETRAIN_ENABLED", true),
            auto_retrain_check_interval: Duration::from_secs_f64(env_or(
                "AUTO_RETRAIN_CHECK_INTERVAL",
                60.0,
            )),
            auto_retrain_min_interval: Duration::from_secs_f64(env_or(
                "AUTO_RETRAIN_MIN_INTERVAL",
                3600.0,
            )),
            auto_retrain_min_samples: env_or("AUTO_RETRAIN_MIN_SAMPLES", 500),
            auto_retrain_required_consecutive_drifts: env_or(
                "AUTO_RETRAIN_REQUIRED_CONSECUTIVE_DRIFTS",
                3,
            ),
            auto_retrain_drift_window: env_or("AUTO_RETRAIN_DRIFT_WINDOW", 200),
            drift_z_threshold: env_or("DRIFT_Z_THRESHOLD", 2.5),
            auto_retrain_drift_mode: drift_mode,
            auto_retrain_drift_features: drift_features,
            auto_retrain_lock_key: env_or("AUTO_RETRAIN_LOCK_KEY", 927_331),
            calibration_retrain_enabled: env_or("CALIBRATION_RETRAIN_ENABLED", false),
            calibration_retrain_min_interval: Duration::from_secs_f64(env_or(
                "CALIBRATION_RETRAIN_MIN_INTERVAL",
                3600.0,
            )),
            calibration_cv_degradation_min_ratio: env_or(
                "CALIBRATION_CV_DEGRADATION_MIN_RATIO",
                0.95,
            ),
            calibration_ece_abs_threshold: env_or("CALIBRATION_ECE_ABS_THRESHOLD", 0.02),
            calibration_ece_rel_threshold: env_or("CALIBRATION_ECE_REL_THRESHOLD", 0.25),
            auto_promote_enabled: env_or("AUTO_PROMOTE_ENABLED", true),
            auto_promote_min_interval: Duration::from_secs_f64(env_or(
                "AUTO_PROMOTE_MIN_INTERVAL",
                1800.0,
            )),
            auto_promote_min_sample_growth: env_or("AUTO_PROMOTE_MIN_SAMPLE_GROWTH", 1.05),
            auto_promote_min_auc_improve: env_or("AUTO_PROMOTE_MIN_AUC_IMPROVE", 0.0),
            promotion_max_brier_degradation: env_or("PROMOTION_MAX_BRIER_DEGRADATION", 0.01),
            promotion_max_ece_degradation: env_or("PROMOTION_MAX_ECE_DEGRADATION", 0.01),
            promotion_require_non_worse_calibration: env_or(
                "PROMOTION_REQUIRE_NON_WORSE_CALIBRATION",
                false,
            ),
            inference_prob_threshold: env_or("INFERENCE_PROB_THRESHOLD", 0.5),
            gap_backfill_max_batch: env_or("GAP_BACKFILL_MAX_BATCH", 1500),
            gap_orchestrator_concurrency: env_or("GAP_ORCHESTRATOR_CONCURRENCY", 2),
            gap_orchestrator_poll_interval: Duration::from_secs_f64(env_or(
                "GAP_ORCHESTRATOR_POLL_INTERVAL",
                30.0,
            )),
            train_val_frac: val_frac,
            train_cv_folds: env_or("TRAIN_CV_FOLDS", 5),
            train_min_bars: env_or("TRAIN_MIN_BARS", 150),
            train_min_positive_labels: env_or("TRAIN_MIN_POSITIVE_LABELS", 150),
            model_name: env_string("MODEL_NAME", "bottom"),
            artifact_dir: env_string("ARTIFACT_DIR", "./artifacts"),
            db_dir: env_string("DB_DIR", "./data"),
        })
    }
}

/// Canonical interval-to-milliseconds table, consolidating the three
/// divergent copies the teacher carried (`gap_filler.rs`, `realtime.rs`,
/// the missing `utils::timeframe_to_interval` referenced by `verify.rs`).
pub fn interval_to_ms(interval: &str) -> Option<i64> {
    let (num, unit) = interval.split_at(interval.len().checked_sub(1)?);
    let n: i64 = num.parse().ok()?;
    let unit_ms = match unit {
        "m" => 60_000,
        "h" => 60 * 60_000,
        "d" => 24 * 60 * 60_000,
        "w" => 7 * 24 * 60 * 60_000,
        "M" => 30 * 24 * 60 * 60_000,
        _ => return None,
    };
    Some(n * unit_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_intervals() {
        assert_eq!(interval_to_ms("1m"), Some(60_000));
        assert_eq!(interval_to_ms("5m"), Some(300_000));
        assert_eq!(interval_to_ms("1h"), Some(3_600_000));
        assert_eq!(interval_to_ms("1d"), Some(86_400_000));
    }

    #[test]
    fn rejects_unknown_unit() {
        assert_eq!(interval_to_ms("1x"), None);
    }
}
