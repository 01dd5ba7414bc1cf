//! C9 — Auto Labeler: batches unlabeled inference records, evaluates the
//! bottom-event rule once their future window has matured, and writes
//! realized labels back to the inference log.
//!
//! Grounded on `original_source/backend/apps/training/service/
//! auto_labeler.py::AutoLabelerService`: `min_age_seconds` floor, a
//! `batch_limit`, and a candle window sized `clamp(batch_limit*(L+5), 200,
//! 2000)`. The original groups candidates by `(symbol, interval, target)`;
//! this pipeline runs a single configured `(symbol, interval)` pair, so
//! that grouping collapses to one fixed target ("bottom") rather than a
//! runtime dispatch table.

use super::bottom;
use crate::config::Config;
use crate::error::PipelineResult;
use crate::store::{CandleStore, InferenceLog};
use rust_decimal::prelude::ToPrimitive;
use std::sync::{Arc, Mutex};
use tracing::info;

pub struct AutoLabelerService {
    inference_log: Arc<Mutex<InferenceLog>>,
    candle_store: Arc<Mutex<CandleStore>>,
    symbol: String,
    interval: String,
    interval_ms: i64,
    lookahead: usize,
    drawdown: f64,
    rebound: f64,
    min_age_seconds: i64,
    batch_limit: usize,
}

impl AutoLabelerService {
    pub fn new(inference_log: Arc<Mutex<InferenceLog>>, candle_store: Arc<Mutex<CandleStore>>, config: &Config) -> Self {
        AutoLabelerService {
            inference_log,
            candle_store,
            symbol: config.symbol.clone(),
            interval: config.interval.clone(),
            interval_ms: config.interval_ms,
            lookahead: config.bottom_lookahead,
            drawdown: config.bottom_drawdown,
            rebound: config.bottom_rebound,
            min_age_seconds: ((config.bottom_lookahead as i64) * config.interval_ms) / 1000,
            batch_limit: 200,
        }
    }

    pub fn run_once(&self, now: i64) -> PipelineResult<usize> {
        let candidates = {
            let log = self.inference_log.lock().unwrap();
            log.fetch_unlabeled_candidates(now, self.min_age_seconds, self.batch_limit)?
        };
        if candidates.is_empty() {
            return Ok(0);
        }

        let window_bars = (self.batch_limit * (self.lookahead + 5)).clamp(200, 2000) as i64;
        let earliest = candidates.iter().map(|c| c.created_at).min().unwrap();
        let from = earliest - window_bars * self.interval_ms;

        let candles = {
            let cs = self.candle_store.lock().unwrap();
            cs.fetch_range(&self.symbol, &self.interval, from, i64::MAX)?
        };
        let closes: Vec<f64> = candles.iter().map(|c| c.close.to_f64().unwrap_or(0.0)).collect();
        let open_times: Vec<i64> = candles.iter().map(|c| c.open_time).collect();

        let mut labeled = Vec::new();
        for rec in &candidates {
            let Some(start_idx) = open_times.iter().position(|&t| t >= rec.created_at) else {
                continue;
            };
            if let Some(label) = bottom::label_for_created_ts(&closes, start_idx, self.lookahead, self.drawdown, self.rebound) {
                labeled.push((rec.id, label));
            }
        }

        let updated = {
            let log = self.inference_log.lock().unwrap();
            log.update_realized_batch(&labeled)?
        };
        if updated > 0 {
            info!(updated, candidates = candidates.len(), "auto-labeler wrote realized labels");
        }
        Ok(updated)
    }
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
            high: Decimal::from_str(&close.to_string()).unwrap(),
            low: Decimal::from_str(&close.to_string()).unwrap(),
            close: Decimal::from_str(&close.to_string()).unwrap(),
            volume: Decimal::from_str("1").unwrap(),
            trade_count: 1,
            taker_buy_volume: Decimal::from_str("0.5").unwrap(),
            taker_buy_quote_volume: Decimal::from_str("50").unwrap(),
            is_closed: true,
            ingestion_source: IngestionSource::WsLive,
        }
    }

    fn config() -> Config {
        let mut c = Config::from_env().unwrap();
        c.symbol = "BTCUSDT".into();
        c.interval = "1m".into();
        c.interval_ms = 60_000;
        c.bottom_lookahead = 3;
        c.bottom_drawdown = 0.05;
        c.bottom_rebound = 0.05;
        c
    }

    #[test]
    fn labels_ripe_candidates_and_leaves_immature_ones() {
        let candle_store = Arc::new(Mutex::new(CandleStore::in_memory().unwrap()));
        let inference_log = Arc::new(Mutex::new(InferenceLog::in_memory().unwrap()));
        {
            let mut cs = candle_store.lock().unwrap();
            cs.bulk_upsert(&[
                candle(0, 100.0),
                candle(60_000, 90.0),
                candle(120_000, 92.0),
                candle(180_000, 99.0),
            ])
            .unwrap();
        }
        let ripe_id = {
            let log = inference_log.lock().unwrap();
            log.record(0, 0.8, 1, 0.5, "bottom", "v1", "BTCUSDT", "1m", "bottom").unwrap()
        };
        let unripe_id = {
            let log = inference_log.lock().unwrap();
            log.record(180_000, 0.8, 1, 0.5, "bottom", "v1", "BTCUSDT", "1m", "bottom").unwrap()
        };

        let service = AutoLabelerService::new(inference_log.clone(), candle_store, &config());
        let now = 10_000_000;
        let updated = service.run_once(now).unwrap();
        assert_eq!(updated, 1);

        let log = inference_log.lock().unwrap();
        assert_eq!(log.fetch_by_id(ripe_id).unwrap().unwrap().realized_label, Some(1));
        assert_eq!(log.fetch_by_id(unripe_id).unwrap().unwrap().realized_label, None);
    }
}
