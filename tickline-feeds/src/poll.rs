//! Polling ingestor: periodic GET expecting a JSON array of ticks.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, warn};

use tickline_core::{RawTick, ShutdownSignal};
use tickline_telemetry::PipelineMetrics;

use crate::TickSender;

/// Per-request deadline.
const REQUEST_DEADLINE: Duration = Duration::from_secs(5);

pub(crate) async fn run(
    url: &str,
    every: Duration,
    sender: &TickSender,
    metrics: &Arc<PipelineMetrics>,
    shutdown: &ShutdownSignal,
) {
    let client = match reqwest::Client::builder().timeout(REQUEST_DEADLINE).build() {
        Ok(client) => client,
        Err(err) => {
            error!(url, error = %err, "failed to build http client");
            return;
        }
    };

    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.wait() => return,
            _ = ticker.tick() => {}
        }

        let response = match client.get(url).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(url, error = %err, "http get failed");
                metrics.inc_ingest_error();
                continue;
            }
        };
        if !response.status().is_success() {
            warn!(url, status = %response.status(), "non-success response from feed");
            metrics.inc_ingest_error();
            continue;
        }

        let batch: Vec<RawTick> = match response.json().await {
            Ok(batch) => batch,
            Err(err) => {
                warn!(url, error = %err, "feed payload decode error");
                metrics.inc_ingest_error();
                continue;
            }
        };

        for mut tick in batch {
            tick.sanitize();
            match tick.validate() {
                Ok(()) => sender.offer(tick),
                Err(err) => {
                    warn!(url, error = %err, "invalid feed tick");
                    metrics.inc_ingest_error();
                }
            }
        }
    }
}
