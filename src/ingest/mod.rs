pub mod backfill;
pub mod orchestrator;
pub mod stream;

pub use backfill::GapBackfillWorker;
pub use orchestrator::GapOrchestrator;
pub use stream::StreamIngestor;

use crate::store::{CandleStore, GapStore};
use crate::error::PipelineResult;

/// One-shot historical sweep: walks every candle currently on disk for
/// `(symbol, interval)` and records a gap segment for each break larger
/// than one bar. Used by the `backfill` CLI command, which has no running
/// stream to detect gaps as they happen and so must reconstruct them from
/// the stored history before handing them to the orchestrator.
pub fn scan_for_gaps(
    candle_store: &CandleStore,
    gap_store: &mut GapStore,
    symbol: &str,
    interval: &str,
    interval_ms: i64,
    now: i64,
) -> PipelineResult<usize> {
    let candles = candle_store.fetch_range(symbol, interval, i64::MIN, i64::MAX)?;
    let mut found = 0;
    for pair in candles.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.open_time > prev.open_time + interval_ms {
            let from = prev.open_time + interval_ms;
            let to = next.open_time - interval_ms;
            gap_store.insert_gap(symbol, interval, from, to, interval_ms, now, |f, t| {
                candle_store.count_in_range(symbol, interval, f, t)
            })?;
            found += 1;
        }
    }
    Ok(found)
}
