//! Wires configuration, store, metrics and shutdown into running stages.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info};

use tickline_config::AppConfig;
use tickline_core::ShutdownSignal;
use tickline_feeds::{run_feed, Feed};
use tickline_pipeline::{
    AnomalyDetector, DetectorConfig, Normalizer, QuotePublisher, SymbolTable,
};
use tickline_store::RedisStore;
use tickline_telemetry::{spawn_metrics_server, PipelineMetrics};

/// Window granted to in-flight work after the shutdown signal trips.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Ingest,
    Normalize,
    Publish,
    Detect,
    All,
}

impl Stage {
    fn includes(self, other: Stage) -> bool {
        self == Stage::All || self == other
    }
}

pub async fn run(stage: Stage, config: AppConfig) -> Result<()> {
    let metrics = Arc::new(PipelineMetrics::new());
    let store = RedisStore::connect(&config.redis_url, metrics.clone())
        .await
        .with_context(|| format!("failed to connect to store at {}", config.redis_url))?;

    let shutdown = ShutdownSignal::new();
    shutdown.listen_for_os_signals();

    let metrics_addr = config.metrics_addr();
    let metrics_task = spawn_metrics_server(metrics.registry(), metrics_addr);
    info!(addr = %metrics_addr, "metrics server listening");

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if stage.includes(Stage::Ingest) {
        for url in &config.feed_urls {
            let feed = Feed::classify(url, config.poll_interval());
            tasks.push(tokio::spawn(run_feed(
                feed,
                store.clone(),
                metrics.clone(),
                shutdown.clone(),
            )));
        }
    }

    if stage.includes(Stage::Normalize) {
        let tables = Arc::new(SymbolTable::new(
            config.mappings.symbols.clone(),
            config.mappings.sectors.clone(),
        ));
        let normalizer = Normalizer::new(
            store.clone(),
            tables,
            metrics.clone(),
            config.batch_size,
            config.max_workers,
        );
        let worker_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = normalizer.run(worker_shutdown).await {
                error!(error = %err, "normalizer terminated");
            }
        }));
    }

    if stage.includes(Stage::Publish) {
        let publisher = QuotePublisher::new(store.clone(), metrics.clone(), config.batch_size);
        let worker_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = publisher.run(worker_shutdown).await {
                error!(error = %err, "publisher terminated");
            }
        }));
    }

    if stage.includes(Stage::Detect) {
        let detector = AnomalyDetector::new(
            store.clone(),
            metrics.clone(),
            DetectorConfig {
                window_size: config.anomaly_window_size,
                threshold: config.anomaly_threshold,
            },
        );
        let worker_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = detector.run(worker_shutdown).await {
                error!(error = %err, "anomaly detector terminated");
            }
        }));
    }

    shutdown.wait().await;
    info!("shutdown signal received, exiting");

    tokio::time::sleep(SHUTDOWN_GRACE).await;
    metrics_task.abort();
    for task in tasks {
        task.abort();
    }
    Ok(())
}
