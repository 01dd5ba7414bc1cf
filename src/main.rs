use anyhow::{Context, Result};
use candle_pipeline::config::Config;
use candle_pipeline::features::FeatureEngine;
use candle_pipeline::ingest::{scan_for_gaps, GapBackfillWorker, GapOrchestrator, StreamIngestor};
use candle_pipeline::labeling::AutoLabelerService;
use candle_pipeline::retrain::RetrainController;
use candle_pipeline::store::{CandleStore, FeatureStore, GapStore, InferenceLog, ModelRegistry};
use candle_pipeline::training::{LabelTarget, TrainingOutcome, TrainingService};
use clap::{Parser, Subcommand};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Candle ingestion, feature, labeling and training pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the long-lived tasks: streaming ingestor, gap orchestrator,
    /// feature scheduler, auto-labeler and retrain controller.
    Run,
    /// One-shot sweep: scan stored history for gaps, then drain them
    /// through the backfill worker pool once.
    Backfill,
    /// One-shot training run for a single label target.
    Train {
        /// One of "direction1m", "bottom", or "horizon:<minutes>".
        #[arg(long, default_value = "bottom")]
        target: String,
    },
    /// Data-spacing integrity check: reports any open_time gap larger than
    /// one bar across the stored history.
    Verify,
}

struct Stores {
    candle_store: Arc<Mutex<CandleStore>>,
    gap_store: Arc<Mutex<GapStore>>,
    feature_store: Arc<Mutex<FeatureStore>>,
    inference_log: Arc<Mutex<InferenceLog>>,
    model_registry: Arc<Mutex<ModelRegistry>>,
}

fn open_stores(config: &Config) -> Result<Stores> {
    std::fs::create_dir_all(&config.db_dir).context("creating db_dir")?;
    let prefix = format!("{}/{}_{}", config.db_dir, config.symbol, config.interval);
    Ok(Stores {
        candle_store: Arc::new(Mutex::new(CandleStore::open(&format!("{prefix}_candles.db"))?)),
        gap_store: Arc::new(Mutex::new(GapStore::open(&format!("{prefix}_gaps.db"))?)),
        feature_store: Arc::new(Mutex::new(FeatureStore::open(&format!("{prefix}_features.db"))?)),
        inference_log: Arc::new(Mutex::new(InferenceLog::open(&format!("{prefix}_inference.db"))?)),
        model_registry: Arc::new(Mutex::new(ModelRegistry::open(&format!("{prefix}_models.db"))?)),
    })
}

fn parse_target(s: &str) -> Result<LabelTarget> {
    if s == "direction1m" {
        return Ok(LabelTarget::Direction1m);
    }
    if s == "bottom" {
        return Ok(LabelTarget::Bottom);
    }
    if let Some(minutes) = s.strip_prefix("horizon:") {
        let h: usize = minutes.parse().context("horizon minutes must be an integer")?;
        return Ok(LabelTarget::Horizon(h));
    }
    anyhow::bail!("unrecognized training target {s:?}; expected direction1m, bottom, or horizon:<minutes>")
}

fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .compact()
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("loading configuration")?;
    info!(symbol = %config.symbol, interval = %config.interval, "configuration loaded");

    match cli.command {
        Command::Run => run(config).await,
        Command::Backfill => backfill(config).await,
        Command::Train { target } => train(config, &target).await,
        Command::Verify => verify(config).await,
    }
}

async fn run(config: Config) -> Result<()> {
    let stores = open_stores(&config)?;

    let stream_ingestor = StreamIngestor::new(Arc::clone(&stores.candle_store), Arc::clone(&stores.gap_store), &config);
    let backfill_worker = Arc::new(GapBackfillWorker::new(Arc::clone(&stores.candle_store), Arc::clone(&stores.gap_store), &config));
    let gap_orchestrator = Arc::new(GapOrchestrator::new(Arc::clone(&stores.gap_store), backfill_worker, &config));
    let feature_engine = Arc::new(FeatureEngine::new(Arc::clone(&stores.candle_store), Arc::clone(&stores.feature_store), &config));
    let auto_labeler = Arc::new(AutoLabelerService::new(Arc::clone(&stores.inference_log), Arc::clone(&stores.candle_store), &config));
    let training_service = TrainingService::new(
        config.clone(),
        Arc::clone(&stores.candle_store),
        Arc::clone(&stores.feature_store),
        Arc::clone(&stores.inference_log),
        Arc::clone(&stores.model_registry),
    );
    let retrain_controller = Arc::new(RetrainController::new(
        config.clone(),
        Arc::clone(&stores.feature_store),
        Arc::clone(&stores.inference_log),
        Arc::clone(&stores.model_registry),
        training_service,
    ));

    let mut handles = Vec::new();

    if config.ingestion_enabled {
        handles.push(tokio::spawn(stream_ingestor.run()));
        handles.push(tokio::spawn(gap_orchestrator.run()));
    } else {
        info!("ingestion disabled, skipping stream ingestor and gap orchestrator");
    }

    handles.push(tokio::spawn({
        let engine = Arc::clone(&feature_engine);
        let sched_interval = config.feature_sched_interval;
        async move {
            let mut ticker = tokio::time::interval(sched_interval);
            loop {
                ticker.tick().await;
                match engine.run_once().await {
                    Ok(n) => info!(snapshots = n, "feature scheduler tick"),
                    Err(e) => warn!(error = %e, "feature scheduler tick failed"),
                }
            }
        }
    }));

    handles.push(tokio::spawn({
        let labeler = Arc::clone(&auto_labeler);
        async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                ticker.tick().await;
                match labeler.run_once(current_time_ms()) {
                    Ok(n) => info!(labeled = n, "auto-labeler tick"),
                    Err(e) => warn!(error = %e, "auto-labeler tick failed"),
                }
            }
        }
    }));

    if config.auto_retrain_enabled {
        handles.push(tokio::spawn(retrain_controller.run()));
    } else {
        info!("auto-retrain disabled, skipping retrain controller loop");
    }

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}

async fn backfill(config: Config) -> Result<()> {
    let stores = open_stores(&config)?;
    let now = current_time_ms();

    let found = {
        let candle_store = stores.candle_store.lock().unwrap();
        let mut gap_store = stores.gap_store.lock().unwrap();
        scan_for_gaps(&candle_store, &mut gap_store, &config.symbol, &config.interval, config.interval_ms, now)?
    };
    info!(found, "historical gap sweep complete");

    let worker = Arc::new(GapBackfillWorker::new(Arc::clone(&stores.candle_store), Arc::clone(&stores.gap_store), &config));
    let orchestrator = GapOrchestrator::new(Arc::clone(&stores.gap_store), worker, &config);
    orchestrator.run_once().await?;
    info!("backfill pass complete");
    Ok(())
}

async fn train(config: Config, target: &str) -> Result<()> {
    let stores = open_stores(&config)?;
    let target = parse_target(target)?;
    let service = TrainingService::new(
        config,
        Arc::clone(&stores.candle_store),
        Arc::clone(&stores.feature_store),
        Arc::clone(&stores.inference_log),
        Arc::clone(&stores.model_registry),
    );
    match service.run(target, current_time_ms())? {
        TrainingOutcome::Trained { model_id, version, metrics } => {
            info!(model_id, %version, %metrics, "training run produced a staging model");
        }
        TrainingOutcome::InsufficientData { reason } => {
            warn!(%reason, "training run skipped: insufficient data");
        }
        TrainingOutcome::InsufficientLabels { reason } => {
            warn!(%reason, "training run skipped: insufficient positive labels");
        }
    }
    Ok(())
}

async fn verify(config: Config) -> Result<()> {
    let stores = open_stores(&config)?;
    let candle_store = stores.candle_store.lock().unwrap();
    let candles = candle_store.fetch_range(&config.symbol, &config.interval, i64::MIN, i64::MAX)?;

    let mut anomalies = 0usize;
    for pair in candles.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        let delta = next.open_time - prev.open_time;
        if delta != config.interval_ms {
            anomalies += 1;
            warn!(
                prev_open_time = prev.open_time,
                next_open_time = next.open_time,
                delta_ms = delta,
                expected_ms = config.interval_ms,
                "spacing anomaly"
            );
        }
    }

    info!(total_candles = candles.len(), anomalies, "verification complete");
    if anomalies > 0 {
        anyhow::bail!("{anomalies} spacing anomalies found across {} candles", candles.len());
    }
    Ok(())
}
