//! C6 — Gap Backfill Worker: recovers a single gap segment with one bounded
//! REST range request.
//!
//! Grounded on `original_source/backend/apps/ingestion/backfill/
//! gap_backfill_service.py::_recover_gap`, wired onto the teacher's
//! `retriever.rs` Binance REST client idiom.

use crate::candle::{Candle, IngestionSource};
use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use crate::store::{CandleStore, GapSegment, GapStore};
use binance::api::Binance;
use binance::market::Market;
use binance::model::{KlineSummaries, KlineSummary};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

pub struct GapBackfillWorker {
    market: Market,
    candle_store: Arc<Mutex<CandleStore>>,
    gap_store: Arc<Mutex<GapStore>>,
    symbol: String,
    interval: String,
    interval_ms: i64,
    max_batch: u32,
}

impl GapBackfillWorker {
    pub fn new(candle_store: Arc<Mutex<CandleStore>>, gap_store: Arc<Mutex<GapStore>>, config: &Config) -> Self {
        let market: Market = Binance::new(None, None);
        GapBackfillWorker {
            market,
            candle_store,
            gap_store,
            symbol: config.symbol.clone(),
            interval: config.interval.clone(),
            interval_ms: config.interval_ms,
            max_batch: config.gap_backfill_max_batch,
        }
    }

    /// One bounded range request covering `[from_open_time, to_open_time +
    /// interval]`, `limit = min(max_batch, remaining_bars + 2)`, filtered
    /// back down to the segment's own span before writing.
    pub fn recover_gap(&self, seg: &GapSegment) -> PipelineResult<i64> {
        let start_time = seg.from_open_time as u64;
        let end_time = (seg.to_open_time + self.interval_ms) as u64;
        let limit = self.max_batch.min((seg.remaining_bars + 2).max(1) as u32) as u16;

        let klines = self
            .market
            .get_klines(&self.symbol, &self.interval, Some(limit), Some(start_time), Some(end_time))
            .map_err(|e| PipelineError::Transient(format!("binance get_klines failed: {e:?}")))?;
        let KlineSummaries::AllKlineSummaries(klines) = klines;

        let candles: Vec<Candle> = klines
            .into_iter()
            .filter(|k| k.open_time >= seg.from_open_time && k.open_time <= seg.to_open_time)
            .map(|k| kline_to_candle(&self.symbol, &self.interval, k))
            .collect::<PipelineResult<Vec<_>>>()?;

        let recovered = candles.len() as i64;
        {
            let mut store = self.candle_store.lock().unwrap();
            store.bulk_upsert(&candles)?;
        }

        let now = chrono::Utc::now().timestamp_millis();
        let gap_store = self.gap_store.lock().unwrap();
        if recovered >= seg.missing_bars {
            gap_store.mark_recovered(seg.id, now)?;
            info!(gap_id = seg.id, recovered, "gap fully recovered");
        } else if recovered > 0 {
            let new_remaining = (seg.remaining_bars - recovered).max(0);
            gap_store.partial_recover(seg.id, new_remaining, recovered)?;
            warn!(gap_id = seg.id, recovered, new_remaining, "gap partially recovered");
        } else {
            warn!(gap_id = seg.id, "no bars recovered for gap");
        }
        Ok(recovered)
    }
}

fn kline_to_candle(symbol: &str, interval: &str, k: KlineSummary) -> PipelineResult<Candle> {
    let dec = |s: &str| Decimal::from_str(s).map_err(|e| PipelineError::Data(format!("bad decimal {s}: {e}")));
    Ok(Candle {
        symbol: symbol.to_string(),
        interval: interval.to_string(),
        open_time: k.open_time,
        close_time: k.close_time,
        open: dec(&k.open)?,
        high: dec(&k.high)?,
        low: dec(&k.low)?,
        close: dec(&k.close)?,
        volume: dec(&k.volume)?,
        trade_count: k.number_of_trades,
        taker_buy_volume: dec(&k.taker_buy_base_asset_volume)?,
        taker_buy_quote_volume: dec(&k.taker_buy_quote_asset_volume)?,
        is_closed: true,
        ingestion_source: IngestionSource::RestBackfill,
    })
}
