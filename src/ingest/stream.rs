//! C5 — Streaming Ingestor: WebSocket kline consumer with a buffered flush,
//! gap detection against a monotone close frontier, and late-fill split
//! handling.
//!
//! Grounded on `original_source/backend/apps/ingestion/ws/kline_consumer.py`
//! for the buffer/flush, gap-detection and late-fill-apportionment
//! algorithms, wired onto the teacher's `realtime.rs` reconnect-loop idiom
//! (`tokio-tungstenite` + `futures_util` + one `tokio::spawn`ed task per
//! stream).

use crate::candle::{Candle, IngestionSource};
use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use crate::store::{CandleStore, GapStore};
use futures_util::StreamExt;
use rand::Rng;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{error, info, warn};

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "k")]
    kline: KlinePayload,
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "n")]
    trade_count: i64,
    #[serde(rename = "V")]
    taker_buy_volume: String,
    #[serde(rename = "Q")]
    taker_buy_quote_volume: String,
    #[serde(rename = "x")]
    is_closed: bool,
}

impl KlinePayload {
    fn into_candle(self, symbol: &str, interval: &str) -> PipelineResult<Candle> {
        let dec = |s: &str| {
            Decimal::from_str(s).map_err(|e| PipelineError::Data(format!("bad decimal {s}: {e}")))
        };
        Ok(Candle {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            open_time: self.open_time,
            close_time: self.close_time,
            open: dec(&self.open)?,
            high: dec(&self.high)?,
            low: dec(&self.low)?,
            close: dec(&self.close)?,
            volume: dec(&self.volume)?,
            trade_count: self.trade_count,
            taker_buy_volume: dec(&self.taker_buy_volume)?,
            taker_buy_quote_volume: dec(&self.taker_buy_quote_volume)?,
            is_closed: self.is_closed,
            ingestion_source: IngestionSource::WsLive,
        })
    }
}

/// Frontier + buffer state shared between the socket-reader task and the
/// periodic flusher task.
struct IngestorState {
    buffer: Vec<Candle>,
    last_closed_open_time: Option<i64>,
}

pub struct StreamIngestor {
    candle_store: Arc<Mutex<CandleStore>>,
    gap_store: Arc<Mutex<GapStore>>,
    symbol: String,
    interval: String,
    interval_ms: i64,
    batch_size: usize,
    flush_interval: Duration,
    state: Arc<Mutex<IngestorState>>,
}

impl StreamIngestor {
    pub fn new(candle_store: Arc<Mutex<CandleStore>>, gap_store: Arc<Mutex<GapStore>>, config: &Config) -> Arc<Self> {
        Arc::new(StreamIngestor {
            candle_store,
            gap_store,
            symbol: config.symbol.clone(),
            interval: config.interval.clone(),
            interval_ms: config.interval_ms,
            batch_size: config.kline_batch_size,
            flush_interval: config.flush_interval,
            state: Arc::new(Mutex::new(IngestorState {
                buffer: Vec::new(),
                last_closed_open_time: None,
            })),
        })
    }

    /// Runs the reconnect loop forever. Backoff follows
    /// `min(30, 2^min(attempt,6) + U(0,1))`, matching the original
    /// consumer's jittered exponential backoff.
    pub async fn run(self: Arc<Self>) {
        let stream_name = format!("{}@kline_{}", self.symbol.to_lowercase(), self.interval);
        let url = format!("wss://stream.binance.com:9443/ws/{stream_name}");
        let mut attempt: u32 = 0;

        let flusher_handle = {
            let this = Arc::clone(&self);
            tokio::spawn(async move { this.periodic_flusher().await })
        };

        loop {
            info!(url, "connecting to kline stream");
            match connect_async(&url).await {
                Ok((ws, _)) => {
                    attempt = 0;
                    let (_write, mut read) = ws.split();
                    while let Some(msg) = read.next().await {
                        match msg {
                            Ok(Message::Text(text)) => {
                                if let Err(e) = self.handle_message(&text) {
                                    warn!(error = %e, "failed to handle kline message");
                                }
                            }
                            Ok(Message::Close(_)) => break,
                            Err(e) => {
                                error!(error = %e, "websocket error");
                                break;
                            }
                            _ => {}
                        }
                    }
                }
                Err(e) => error!(error = %e, "failed to connect to kline stream"),
            }

            let backoff = Self::reconnect_backoff(attempt);
            attempt = attempt.saturating_add(1);
            warn!(seconds = backoff.as_secs_f64(), "reconnecting after backoff");
            tokio::time::sleep(backoff).await;
        }

        #[allow(unreachable_code)]
        flusher_handle.abort();
    }

    fn reconnect_backoff(attempt: u32) -> Duration {
        let capped = attempt.min(6);
        let base = 2f64.powi(capped as i32);
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        Duration::from_secs_f64((base + jitter).min(30.0))
    }

    async fn periodic_flusher(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.flush() {
                error!(error = %e, "periodic flush failed");
            }
        }
    }

    fn handle_message(&self, text: &str) -> PipelineResult<()> {
        let event: KlineEvent = serde_json::from_str(text)
            .map_err(|e| PipelineError::Data(format!("malformed kline event: {e}")))?;
        if event.event_type != "kline" {
            return Ok(());
        }
        let candle = event.kline.into_candle(&self.symbol, &self.interval)?;
        self.on_candle(candle)
    }

    /// Feeds one observed bar through gap detection / late-fill handling and
    /// the write buffer. Public so scenario-level tests can drive it without
    /// a live socket.
    pub fn on_candle(&self, mut candle: Candle) -> PipelineResult<()> {
        let should_flush = {
            let mut state = self.state.lock().unwrap();
            if candle.is_closed {
                self.detect_gap_and_late_fill(&mut state, &mut candle)?;
                state.last_closed_open_time =
                    Some(state.last_closed_open_time.map_or(candle.open_time, |f| f.max(candle.open_time)));
            }
            state.buffer.push(candle);
            state.buffer.len() >= self.batch_size
        };
        if should_flush {
            self.flush()?;
        }
        Ok(())
    }

    fn detect_gap_and_late_fill(&self, state: &mut IngestorState, candle: &mut Candle) -> PipelineResult<()> {
        let Some(last) = state.last_closed_open_time else {
            return Ok(());
        };
        if candle.open_time == last + self.interval_ms {
            return Ok(()); // contiguous
        }
        if candle.open_time > last + self.interval_ms {
            let from = last + self.interval_ms;
            let to = candle.open_time - self.interval_ms;
            return self.record_gap(from, to);
        }
        if candle.open_time < last {
            candle.ingestion_source = IngestionSource::WsLate;
            return self.apply_late_fill(candle.open_time);
        }
        Ok(()) // candle.open_time == last: re-observation of the same bar, merge handles it
    }

    fn record_gap(&self, from_open_time: i64, to_open_time: i64) -> PipelineResult<()> {
        let candle_store = Arc::clone(&self.candle_store);
        let symbol = self.symbol.clone();
        let interval = self.interval.clone();
        let now = chrono::Utc::now().timestamp_millis();
        let mut gap_store = self.gap_store.lock().unwrap();
        let seg = gap_store.insert_gap(&self.symbol, &self.interval, from_open_time, to_open_time, self.interval_ms, now, |f, t| {
            let store = candle_store.lock().unwrap();
            store.count_in_range(&symbol, &interval, f, t)
        })?;
        info!(from_open_time = seg.from_open_time, to_open_time = seg.to_open_time, missing = seg.missing_bars, "gap recorded from stream");
        Ok(())
    }

    /// Splits the open/partial segment containing `filled_open_time` into a
    /// left remainder and a right remainder (either may vanish), apportioning
    /// `remaining_bars - 1` between them in proportion to each side's share
    /// of the still-missing span — the exact apportionment the original
    /// consumer uses so the left/right allocations always sum to the
    /// pre-fill remaining count minus the bar just observed.
    fn apply_late_fill(&self, filled_open_time: i64) -> PipelineResult<()> {
        let mut gap_store = self.gap_store.lock().unwrap();
        let open_segments = gap_store.load_open(&self.symbol, &self.interval, 200)?;
        let Some(seg) = open_segments
            .into_iter()
            .find(|s| filled_open_time >= s.from_open_time && filled_open_time <= s.to_open_time)
        else {
            return Ok(());
        };

        let left_missing = (filled_open_time - seg.from_open_time) / self.interval_ms;
        let right_missing = (seg.to_open_time - filled_open_time) / self.interval_ms;
        let total_new_missing = left_missing + right_missing;
        let now = chrono::Utc::now().timestamp_millis();

        if total_new_missing == 0 {
            gap_store.mark_recovered(seg.id, now)?;
            return Ok(());
        }

        let rem_after = (seg.remaining_bars - 1).max(0);
        let left_alloc = ((rem_after as f64) * (left_missing as f64 / total_new_missing as f64)) as i64;
        let right_alloc = rem_after - left_alloc;

        if left_missing > 0 && right_missing > 0 {
            gap_store.update_span_and_remaining(seg.id, filled_open_time - self.interval_ms, left_missing, left_alloc)?;
            gap_store.partial_recover(seg.id, left_alloc, 1)?;
            gap_store.insert_split_segment(
                &self.symbol,
                &self.interval,
                filled_open_time + self.interval_ms,
                seg.to_open_time,
                right_missing,
                right_alloc,
                seg.detected_at,
            )?;
            info!(gap_id = seg.id, filled_open_time, left_alloc, right_alloc, "late fill split a gap segment");
        } else if left_missing > 0 {
            gap_store.update_span_and_remaining(seg.id, filled_open_time - self.interval_ms, left_missing, left_alloc)?;
            gap_store.partial_recover(seg.id, left_alloc, 1)?;
        } else if right_missing > 0 {
            gap_store.update_span_and_remaining(seg.id, seg.to_open_time, right_missing, right_alloc)?;
            gap_store.partial_recover(seg.id, right_alloc, 1)?;
        } else {
            gap_store.mark_recovered(seg.id, now)?;
        }
        Ok(())
    }

    fn flush(&self) -> PipelineResult<()> {
        let to_write = {
            let mut state = self.state.lock().unwrap();
            if state.buffer.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut state.buffer)
        };
        let mut store = self.candle_store.lock().unwrap();
        let n = store.bulk_upsert(&to_write)?;
        info!(count = n, "flushed candles to store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_pair() -> (Arc<Mutex<CandleStore>>, Arc<Mutex<GapStore>>) {
        (
            Arc::new(Mutex::new(CandleStore::in_memory().unwrap())),
            Arc::new(Mutex::new(GapStore::in_memory().unwrap())),
        )
    }

    fn config() -> Config {
        let mut c = Config::from_env().unwrap();
        c.symbol = "BTCUSDT".into();
        c.interval = "1m".into();
        c.interval_ms = 60_000;
        c.kline_batch_size = 2;
        c
    }

    fn kline_candle(open_time: i64, closed: bool) -> Candle {
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
            is_closed: closed,
            ingestion_source: IngestionSource::WsLive,
        }
    }

    #[test]
    fn contiguous_closed_bars_record_no_gap() {
        let (cs, gs) = store_pair();
        let ingestor = StreamIngestor::new(cs, gs.clone(), &config());
        ingestor.on_candle(kline_candle(0, true)).unwrap();
        ingestor.on_candle(kline_candle(60_000, true)).unwrap();
        assert!(gs.lock().unwrap().load_open("BTCUSDT", "1m", 10).unwrap().is_empty());
    }

    #[test]
    fn forward_jump_records_a_gap() {
        let (cs, gs) = store_pair();
        let ingestor = StreamIngestor::new(cs, gs.clone(), &config());
        ingestor.on_candle(kline_candle(0, true)).unwrap();
        ingestor.on_candle(kline_candle(180_000, true)).unwrap();
        let open = gs.lock().unwrap().load_open("BTCUSDT", "1m", 10).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].from_open_time, 60_000);
        assert_eq!(open[0].to_open_time, 120_000);
    }

    #[test]
    fn late_fill_inside_gap_splits_segment() {
        let (cs, gs) = store_pair();
        let ingestor = StreamIngestor::new(cs, gs.clone(), &config());
        ingestor.on_candle(kline_candle(0, true)).unwrap();
        ingestor.on_candle(kline_candle(240_000, true)).unwrap(); // gap 60_000..180_000, 3 missing
        ingestor.on_candle(kline_candle(120_000, true)).unwrap(); // late fill in the middle
        let open = gs.lock().unwrap().load_open("BTCUSDT", "1m", 10).unwrap();
        assert_eq!(open.len(), 2);
    }
}
