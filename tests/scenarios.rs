//! Scenario-level tests exercising the in-memory stores end-to-end, one per
//! testable property from the design doc's properties section.

use candle_pipeline::candle::{Candle, IngestionSource};
use candle_pipeline::config::{Config, DriftMode};
use candle_pipeline::features::FeatureEngine;
use candle_pipeline::ingest::StreamIngestor;
use candle_pipeline::labeling::bottom::label_for_created_ts;
use candle_pipeline::retrain::{select_aggregate, RetrainController};
use candle_pipeline::store::{CandleStore, FeatureStore, GapStore, InferenceLog, ModelRegistry, ModelStatus};
use candle_pipeline::training::TrainingService;
use rust_decimal::Decimal;
use serde_json::json;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn config() -> Config {
    let mut c = Config::from_env().expect("default config");
    c.symbol = "BTCUSDT".into();
    c.interval = "1m".into();
    c.interval_ms = 60_000;
    c
}

fn kline_candle(open_time: i64) -> Candle {
    Candle {
        symbol: "BTCUSDT".into(),
        interval: "1m".into(),
        open_time,
        close_time: open_time + 59_999,
        open: Decimal::from_str("100").unwrap(),
        high: Decimal::from_str("100").unwrap(),
        low: Decimal::from_str("100").unwrap(),
        close: Decimal::from_str("100").unwrap(),
        volume: Decimal::from_str("1").unwrap(),
        trade_count: 1,
        taker_buy_volume: Decimal::from_str("0.5").unwrap(),
        taker_buy_quote_volume: Decimal::from_str("50").unwrap(),
        is_closed: true,
        ingestion_source: IngestionSource::WsLive,
    }
}

/// S1 — Gap detection: closed bars at [60000, 120000, 300000] on a 60s
/// interval leave a gap spanning [180000, 240000] with 2 missing bars.
#[test]
fn s1_gap_detection() {
    let candle_store = Arc::new(Mutex::new(CandleStore::in_memory().unwrap()));
    let gap_store = Arc::new(Mutex::new(GapStore::in_memory().unwrap()));
    let ingestor = StreamIngestor::new(candle_store, gap_store.clone(), &config());

    ingestor.on_candle(kline_candle(60_000)).unwrap();
    ingestor.on_candle(kline_candle(120_000)).unwrap();
    ingestor.on_candle(kline_candle(300_000)).unwrap();

    let open = gap_store.lock().unwrap().load_open("BTCUSDT", "1m", 10).unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].from_open_time, 180_000);
    assert_eq!(open[0].to_open_time, 240_000);
    assert_eq!(open[0].missing_bars, 2);
}

/// S2 — Late fill split: a gap spanning [180000, 480000] (6 missing bars)
/// splits into two remainders when a bar at 300000 arrives late, with the
/// post-fill remaining counts apportioned by each side's share of the span.
#[test]
fn s2_late_fill_split() {
    let candle_store = Arc::new(Mutex::new(CandleStore::in_memory().unwrap()));
    let gap_store = Arc::new(Mutex::new(GapStore::in_memory().unwrap()));
    let ingestor = StreamIngestor::new(candle_store.clone(), gap_store.clone(), &config());

    ingestor.on_candle(kline_candle(120_000)).unwrap();
    ingestor.on_candle(kline_candle(540_000)).unwrap(); // gap [180000, 480000], missing=6
    ingestor.on_candle(kline_candle(300_000)).unwrap(); // late fill inside the gap

    let open = gap_store.lock().unwrap().load_open("BTCUSDT", "1m", 10).unwrap();
    assert_eq!(open.len(), 2);
    let left = open.iter().find(|s| s.from_open_time == 180_000).unwrap();
    let right = open.iter().find(|s| s.from_open_time == 360_000).unwrap();
    assert_eq!(left.to_open_time, 240_000);
    assert_eq!(left.missing_bars, 2);
    assert_eq!(right.to_open_time, 480_000);
    assert_eq!(right.missing_bars, 3);
    assert_eq!(left.remaining_bars + right.remaining_bars, 5); // 6 - 1 bar just observed

    let stored = candle_store.lock().unwrap().fetch_range("BTCUSDT", "1m", 300_000, 300_000).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].ingestion_source, IngestionSource::WsLate);
}

/// S3 — Bottom-event label: drawdown to -5% followed by a +3.16% rebound
/// within the lookahead window labels positive.
#[test]
fn s3_bottom_event_label() {
    let closes = vec![100.0, 95.0, 96.0, 98.0, 98.0];
    let label = label_for_created_ts(&closes, 0, 3, 0.05, 0.03);
    assert_eq!(label, Some(1));
}

/// S4 — Promotion block: insufficient sample growth blocks first; relaxing
/// growth but tightening the Brier bound then blocks on calibration
/// degradation instead.
#[test]
fn s4_promotion_block() {
    let candle_store = Arc::new(Mutex::new(CandleStore::in_memory().unwrap()));
    let feature_store = Arc::new(Mutex::new(FeatureStore::in_memory().unwrap()));
    let inference_log = Arc::new(Mutex::new(InferenceLog::in_memory().unwrap()));
    let model_registry = Arc::new(Mutex::new(ModelRegistry::in_memory().unwrap()));

    let incumbent_metrics = json!({"n_samples": 400.0, "holdout": {"auc": 0.58, "brier": 0.200, "ece": 0.040}});
    let new_metrics = json!({"n_samples": 200.0, "holdout": {"auc": 0.59, "brier": 0.205, "ece": 0.041}});

    {
        let registry = model_registry.lock().unwrap();
        registry.register("bottom", "v1", "bottom", ModelStatus::Production, None, Some(&incumbent_metrics), 0).unwrap();
        registry.register("bottom", "v2", "bottom", ModelStatus::Staging, None, Some(&new_metrics), 1).unwrap();
    }
    let new_id = model_registry.lock().unwrap().fetch_latest("bottom", "bottom", 1).unwrap()[0].id;

    let mut cfg = config();
    cfg.auto_promote_enabled = true;
    cfg.auto_promote_min_sample_growth = 1.05;
    let training_service = TrainingService::new(cfg.clone(), candle_store.clone(), feature_store.clone(), inference_log.clone(), model_registry.clone());
    let controller = RetrainController::new(cfg, feature_store.clone(), inference_log.clone(), model_registry.clone(), training_service);
    let decision = controller.promote_if_better(new_id, &new_metrics).unwrap();
    assert!(!decision.promoted);
    assert_eq!(decision.reason, "insufficient_sample_growth");

    let mut cfg2 = config();
    cfg2.auto_promote_enabled = true;
    cfg2.auto_promote_min_sample_growth = 0.1;
    cfg2.promotion_max_brier_degradation = 0.0001;
    let training_service2 = TrainingService::new(cfg2.clone(), candle_store, feature_store.clone(), inference_log.clone(), model_registry.clone());
    let controller2 = RetrainController::new(cfg2, feature_store, inference_log, model_registry, training_service2);
    let decision2 = controller2.promote_if_better(new_id, &new_metrics).unwrap();
    assert!(!decision2.promoted);
    assert_eq!(decision2.reason, "brier_degradation_too_large");
}

/// S5 — Drift trigger: mean |z| over the top-3 configured features exceeds
/// the threshold and reports the largest-|z| feature.
#[test]
fn s5_drift_trigger() {
    let z_scores = vec![("ret_1".to_string(), 3.0), ("ret_5".to_string(), 2.6), ("ret_10".to_string(), 2.4)];
    let result = select_aggregate(&z_scores, DriftMode::MeanTop3, 2.5);
    assert!(result.triggered);
    assert_eq!(result.selected_feature, "ret_1");
    assert!((result.z_score - 3.0).abs() < 1e-9);
}

/// S6 — Leak-safe join: a sentiment tick 30s after the bar's close must not
/// influence that bar's snapshot; a tick 30s before it must.
#[tokio::test]
async fn s6_leak_safe_join() {
    let candle_store = Arc::new(Mutex::new(CandleStore::in_memory().unwrap()));
    let feature_store = Arc::new(Mutex::new(FeatureStore::in_memory().unwrap()));
    {
        let mut cs = candle_store.lock().unwrap();
        cs.bulk_upsert(&[kline_candle(0)]).unwrap();
    }
    let mut cfg = config();
    cfg.sentiment_ema_windows = vec![5];
    let engine = FeatureEngine::new(candle_store, feature_store.clone(), &cfg);

    let close_time = 59_999;
    engine.ingest_sentiment_tick(close_time - 30_000, 0.6);
    engine.ingest_sentiment_tick(close_time + 30_000, -0.9);

    engine.run_once().await.unwrap();

    let snapshot = feature_store.lock().unwrap().read_snapshot("BTCUSDT", "1m", close_time).unwrap().unwrap();
    let sent_score = snapshot.get("sent_score").copied().flatten();
    assert_eq!(sent_score, Some(0.6));
    let sent_cnt = snapshot.get("sent_cnt").copied().flatten();
    assert!(sent_cnt.unwrap_or(0.0) >= 1.0);
}
