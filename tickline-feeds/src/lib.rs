//! Feed ingestors: translate external feeds into validated [`RawTick`]
//! records appended to the raw log.
//!
//! Two transport variants share one output contract: a bounded per-feed
//! channel drained by a small writer group. The channel is the pipeline's
//! only drop point; when it is full the reader sheds the tick and counts it,
//! so a slow store never blocks a feed socket.

pub mod poll;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tickline_core::{RawTick, ShutdownSignal, RAW_STREAM};
use tickline_store::RedisStore;
use tickline_telemetry::PipelineMetrics;

/// Buffered ticks per feed before the reader starts shedding.
pub const INGEST_CHANNEL_CAPACITY: usize = 1000;
/// Writer tasks appending to the raw log per feed.
pub const WRITER_GROUP_SIZE: usize = 5;

/// A configured feed endpoint, dispatched at startup to one of two loops.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Feed {
    /// Persistent websocket delivering one JSON tick per message.
    Streaming { url: String },
    /// Endpoint polled on an interval, returning a JSON array of ticks.
    Polling { url: String, interval: Duration },
}

impl Feed {
    /// `ws://`/`wss://` URLs stream; everything else is polled.
    pub fn classify(url: &str, poll_interval: Duration) -> Self {
        if url.starts_with("ws://") || url.starts_with("wss://") {
            Self::Streaming {
                url: url.to_string(),
            }
        } else {
            Self::Polling {
                url: url.to_string(),
                interval: poll_interval,
            }
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Self::Streaming { url } | Self::Polling { url, .. } => url,
        }
    }
}

/// Producer half of the ingest channel with the non-blocking drop policy.
pub struct TickSender {
    tx: mpsc::Sender<RawTick>,
    metrics: Arc<PipelineMetrics>,
}

impl TickSender {
    pub(crate) fn new(tx: mpsc::Sender<RawTick>, metrics: Arc<PipelineMetrics>) -> Self {
        Self { tx, metrics }
    }

    /// Offers a tick without blocking; a full channel sheds it.
    pub fn offer(&self, tick: RawTick) {
        match self.tx.try_send(tick) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("ingest channel full, dropping tick");
                self.metrics.inc_ingest_dropped();
            }
            Err(TrySendError::Closed(_)) => {
                debug!("ingest channel closed, ignoring tick");
            }
        }
    }
}

/// Runs one feed to completion: reader plus writer group, terminated by the
/// shutdown signal (or, for websockets, by the reader giving up).
pub async fn run_feed(
    feed: Feed,
    store: RedisStore,
    metrics: Arc<PipelineMetrics>,
    shutdown: ShutdownSignal,
) {
    info!(url = %feed.url(), "starting feed ingestor");

    let (tx, rx) = mpsc::channel::<RawTick>(INGEST_CHANNEL_CAPACITY);
    let rx = Arc::new(Mutex::new(rx));
    let mut writers = Vec::with_capacity(WRITER_GROUP_SIZE);
    for worker in 0..WRITER_GROUP_SIZE {
        writers.push(tokio::spawn(write_loop(
            worker,
            rx.clone(),
            store.clone(),
            metrics.clone(),
            shutdown.clone(),
        )));
    }

    let sender = TickSender::new(tx, metrics.clone());
    match &feed {
        Feed::Streaming { url } => ws::run(url, &sender, &metrics, &shutdown).await,
        Feed::Polling { url, interval } => {
            poll::run(url, *interval, &sender, &metrics, &shutdown).await
        }
    }

    // Closing the channel lets writers drain what is already buffered.
    drop(sender);
    for writer in writers {
        let _ = writer.await;
    }
    info!(url = %feed.url(), "feed ingestor terminated");
}

async fn write_loop(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<RawTick>>>,
    store: RedisStore,
    metrics: Arc<PipelineMetrics>,
    shutdown: ShutdownSignal,
) {
    loop {
        let received = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = shutdown.wait() => {
                    debug!(worker, "writer exiting");
                    return;
                }
                tick = rx.recv() => tick,
            }
        };
        let Some(tick) = received else {
            return;
        };
        match store.append(RAW_STREAM, &tick.to_fields()).await {
            Ok(()) => metrics.inc_ingest(),
            Err(err) => {
                warn!(worker, error = %err, "raw stream write failed");
                metrics.inc_ingest_error();
            }
        }
    }
}
