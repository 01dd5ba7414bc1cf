//! C7 — Gap Orchestrator: priority-queue scheduler feeding a bounded pool
//! of backfill workers.
//!
//! Grounded on `original_source/backend/apps/ingestion/backfill/
//! gap_orchestrator_service.py`: a max-heap keyed by `(remaining_bars,
//! detected_at)`, `concurrency` workers per pass, pruning already-finished
//! gaps before each spawn round.

use crate::config::Config;
use crate::error::PipelineResult;
use crate::ingest::backfill::GapBackfillWorker;
use crate::store::{GapSegment, GapStatus, GapStore};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct PrioritizedGap(GapSegment);

impl PartialEq for PrioritizedGap {
    fn eq(&self, other: &Self) -> bool {
        self.0.remaining_bars == other.0.remaining_bars && self.0.detected_at == other.0.detected_at
    }
}
impl Eq for PrioritizedGap {}

impl Ord for PrioritizedGap {
    /// Larger `remaining_bars` pops first; ties broken by earlier
    /// `detected_at` popping first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .remaining_bars
            .cmp(&other.0.remaining_bars)
            .then_with(|| other.0.detected_at.cmp(&self.0.detected_at))
    }
}
impl PartialOrd for PrioritizedGap {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct GapOrchestrator {
    gap_store: Arc<Mutex<GapStore>>,
    worker: Arc<GapBackfillWorker>,
    symbol: String,
    interval: String,
    concurrency: usize,
    poll_interval: Duration,
}

impl GapOrchestrator {
    pub fn new(gap_store: Arc<Mutex<GapStore>>, worker: Arc<GapBackfillWorker>, config: &Config) -> Self {
        GapOrchestrator {
            gap_store,
            worker,
            symbol: config.symbol.clone(),
            interval: config.interval.clone(),
            concurrency: config.gap_orchestrator_concurrency,
            poll_interval: config.gap_orchestrator_poll_interval,
        }
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            if let Err(e) = self.run_once().await {
                warn!(error = %e, "gap orchestrator pass failed");
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// One orchestration pass: drains every currently-open gap through the
    /// worker pool and returns. Exposed for the one-shot `backfill` CLI
    /// command, which wants a single pass rather than the polling loop.
    pub async fn run_once(&self) -> PipelineResult<()> {
        let open = {
            let store = self.gap_store.lock().unwrap();
            store.load_open(&self.symbol, &self.interval, 500)?
        };
        if open.is_empty() {
            return Ok(());
        }

        let mut heap: BinaryHeap<PrioritizedGap> = open.into_iter().map(PrioritizedGap).collect();
        info!(count = heap.len(), "gap orchestrator pass starting");

        while !heap.is_empty() {
            let batch = self.next_batch(&mut heap)?;
            if batch.is_empty() {
                break;
            }

            let mut tasks = Vec::with_capacity(batch.len());
            for seg in batch {
                let worker = Arc::clone(&self.worker);
                tasks.push(tokio::task::spawn_blocking(move || worker.recover_gap(&seg)));
            }
            for task in tasks {
                match task.await {
                    Ok(Ok(n)) => info!(recovered = n, "gap recovery task finished"),
                    Ok(Err(e)) => warn!(error = %e, "gap recovery task failed"),
                    Err(e) => warn!(error = %e, "gap recovery task panicked"),
                }
            }
        }
        Ok(())
    }

    /// Pops up to `concurrency` segments, pruning any that were already
    /// recovered or merged away by a racing writer since the heap was built.
    fn next_batch(&self, heap: &mut BinaryHeap<PrioritizedGap>) -> PipelineResult<Vec<GapSegment>> {
        let mut batch = Vec::new();
        while batch.len() < self.concurrency {
            let Some(PrioritizedGap(seg)) = heap.pop() else {
                break;
            };
            let still_open = {
                let store = self.gap_store.lock().unwrap();
                store
                    .fetch(seg.id)?
                    .map(|s| matches!(s.status, GapStatus::Open | GapStatus::Partial))
                    .unwrap_or(false)
            };
            if still_open {
                batch.push(seg);
            }
        }
        Ok(batch)
    }
}
