//! C8 — Feature Engine: orchestrates the calculators and the sentiment join
//! into long-format snapshots, enforcing leak-safety and per-scheduler
//! mutual exclusion.
//!
//! Grounded on spec §4.8 for the orchestration contract and on
//! `original_source/backend/apps/features/service/feature_ohlcv_sentiment.py`
//! for the supplemental extended feature set (§4.10 of the expanded spec).
//! The try-lock pattern generalizes the teacher's `RwLock`-guarded cache in
//! `realtime.rs` to a single-tick-in-flight scheduler guard.

use crate::candle::Candle;
use crate::config::Config;
use crate::error::PipelineResult;
use crate::features::{calculators, sentiment};
use crate::store::{CandleStore, FeatureStore};
use rust_decimal::prelude::ToPrimitive;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

const ATR_PERIOD: usize = 14;
const EXT_VOLUME_WINDOW: usize = 20;

pub struct FeatureEngine {
    candle_store: Arc<Mutex<CandleStore>>,
    feature_store: Arc<Mutex<FeatureStore>>,
    sentiment_ticks: Arc<Mutex<Vec<(i64, f64)>>>,
    symbol: String,
    interval: String,
    interval_ms: i64,
    extended_features: bool,
    ema_windows: Vec<i64>,
    sentiment_pos_threshold: f64,
    sentiment_step_ms: i64,
    sentiment_lookback_ms: i64,
    scheduler_lock: AsyncMutex<()>,
}

impl FeatureEngine {
    pub fn new(candle_store: Arc<Mutex<CandleStore>>, feature_store: Arc<Mutex<FeatureStore>>, config: &Config) -> Self {
        FeatureEngine {
            candle_store,
            feature_store,
            sentiment_ticks: Arc::new(Mutex::new(Vec::new())),
            symbol: config.symbol.clone(),
            interval: config.interval.clone(),
            interval_ms: config.interval_ms,
            extended_features: config.extended_features,
            ema_windows: config.sentiment_ema_windows.clone(),
            sentiment_pos_threshold: config.sentiment_pos_threshold,
            sentiment_step_ms: config.sentiment_step_ms,
            sentiment_lookback_ms: config.sentiment_lookback_min * 60_000,
            scheduler_lock: AsyncMutex::new(()),
        }
    }

    /// Mirrors an incoming sentiment tick into the in-memory series used for
    /// the leak-safe join. Kept sorted by timestamp; duplicate timestamps are
    /// appended (the original permits multiple ticks per instant).
    pub fn ingest_sentiment_tick(&self, ts: i64, value: f64) {
        let mut ticks = self.sentiment_ticks.lock().unwrap();
        let insert_at = ticks.partition_point(|(t, _)| *t <= ts);
        ticks.insert(insert_at, (ts, value));
    }

    /// One scheduler tick. Returns immediately with `Ok(0)` if a previous
    /// tick for this engine is still running — this is the per-scheduler
    /// try-lock from §5, not a retry loop.
    pub async fn run_once(&self) -> PipelineResult<usize> {
        let Ok(_guard) = self.scheduler_lock.try_lock() else {
            debug!(symbol = %self.symbol, "feature scheduler tick skipped: previous tick still running");
            return Ok(0);
        };
        self.process_pending()
    }

    fn process_pending(&self) -> PipelineResult<usize> {
        let pointer = {
            let fs = self.feature_store.lock().unwrap();
            fs.dedup_pointer(&self.symbol, &self.interval)?
        };
        let from = pointer.map(|p| p + self.interval_ms).unwrap_or(i64::MIN);

        let history = {
            let cs = self.candle_store.lock().unwrap();
            cs.fetch_range(&self.symbol, &self.interval, from.saturating_sub(200 * self.interval_ms.max(1)), i64::MAX)?
        };
        let closed: Vec<Candle> = history.into_iter().filter(|c| c.is_closed).collect();
        let new_from_idx = closed.partition_point(|c| c.open_time < from);

        let mut written = 0usize;
        let now = chrono::Utc::now().timestamp_millis();
        for i in new_from_idx..closed.len() {
            let window = &closed[..=i];
            let closes: Vec<f64> = window.iter().map(|c| c.close.to_f64().unwrap_or(0.0)).collect();
            let mut values = calculators::compute_all(&closes);
            if self.extended_features {
                values.extend(self.extended_feature_values(window));
            }
            values.extend(self.leak_safe_sentiment_join(window.last().unwrap().close_time));

            let mut fs = self.feature_store.lock().unwrap();
            fs.write_snapshot(&self.symbol, &self.interval, window.last().unwrap().close_time, now, &values)?;
            fs.advance_dedup_pointer(&self.symbol, &self.interval, window.last().unwrap().open_time)?;
            written += 1;
        }
        if written > 0 {
            info!(symbol = %self.symbol, written, "feature snapshots written");
        }
        Ok(written)
    }

    /// Sentiment ticks with `ts > close_time` are excluded before any
    /// aggregation runs, so a snapshot at `close_time = T` can never observe
    /// information from after `T`. Ticks older than the configured lookback
    /// window are dropped too, matching the bounded join range the join
    /// contract requires.
    fn leak_safe_sentiment_join(&self, close_time: i64) -> BTreeMap<String, Option<f64>> {
        let ticks = self.sentiment_ticks.lock().unwrap();
        let from = close_time - self.sentiment_lookback_ms;
        let eligible: Vec<(i64, f64)> = ticks.iter().filter(|(ts, _)| *ts >= from && *ts <= close_time).copied().collect();
        drop(ticks);
        if eligible.is_empty() {
            return BTreeMap::new();
        }
        let buckets = sentiment::bucketize(&eligible, self.sentiment_step_ms, self.sentiment_pos_threshold);
        sentiment::join_sentiment(&buckets, &self.ema_windows)
    }

    /// Supplemental extended feature set (§4.10): EMA ratio, log return,
    /// ATR, and a volume z-score, grounded on `feature_ohlcv_sentiment.py`.
    fn extended_feature_values(&self, window: &[Candle]) -> BTreeMap<String, Option<f64>> {
        let closes: Vec<f64> = window.iter().map(|c| c.close.to_f64().unwrap_or(0.0)).collect();
        let highs: Vec<f64> = window.iter().map(|c| c.high.to_f64().unwrap_or(0.0)).collect();
        let lows: Vec<f64> = window.iter().map(|c| c.low.to_f64().unwrap_or(0.0)).collect();
        let volumes: Vec<f64> = window.iter().map(|c| c.volume.to_f64().unwrap_or(0.0)).collect();

        let mut out = BTreeMap::new();

        let ema12 = sentiment::compute_ema(&closes, 12.0);
        let ema26 = sentiment::compute_ema(&closes, 26.0);
        let ratio = match (ema12.last(), ema26.last()) {
            (Some(&e12), Some(&e26)) if e26 != 0.0 => Some(e12 / e26),
            _ => None,
        };
        out.insert("ext_ema_ratio_12_26".to_string(), ratio);

        let log_ret = if closes.len() >= 2 {
            let prev = closes[closes.len() - 2];
            let last = *closes.last().unwrap();
            (prev > 0.0 && last > 0.0).then(|| (last / prev).ln())
        } else {
            None
        };
        out.insert("ext_log_ret_1".to_string(), log_ret);

        let atr = if window.len() >= ATR_PERIOD + 1 {
            let trs: Vec<f64> = (1..window.len())
                .map(|i| {
                    let hi = highs[i];
                    let lo = lows[i];
                    let prev_close = closes[i - 1];
                    (hi - lo).max((hi - prev_close).abs()).max((lo - prev_close).abs())
                })
                .collect();
            let tail = &trs[trs.len() - ATR_PERIOD..];
            Some(tail.iter().sum::<f64>() / ATR_PERIOD as f64)
        } else {
            None
        };
        out.insert("ext_atr_14".to_string(), atr);

        if volumes.len() >= EXT_VOLUME_WINDOW {
            let tail = &volumes[volumes.len() - EXT_VOLUME_WINDOW..];
            let mean = tail.iter().sum::<f64>() / EXT_VOLUME_WINDOW as f64;
            let variance = tail.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / EXT_VOLUME_WINDOW as f64;
            let std = variance.sqrt();
            out.insert("ext_volume_mean_20".to_string(), Some(mean));
            let z = (std > 0.0).then(|| (volumes.last().unwrap() - mean) / std);
            out.insert("ext_volume_zscore_20".to_string(), z);
        } else {
            out.insert("ext_volume_mean_20".to_string(), None);
            out.insert("ext_volume_zscore_20".to_string(), None);
        }

        out
    }
}
