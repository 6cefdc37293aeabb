//! Latest-state publisher: materializes `quotes:latest:<ticker>` and
//! broadcasts every tick on `quotes:pubsub`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use tickline_core::{
    latest_quote_key, LatestQuote, NormalizedTick, ShutdownSignal, NORMALIZED_STREAM,
    QUOTES_CHANNEL,
};
use tickline_store::{RedisStore, StoreResult, StreamEntry};
use tickline_telemetry::PipelineMetrics;

use crate::{READ_BLOCK, READ_RETRY_DELAY};

/// Per-ticker high-water mark of applied timestamps.
///
/// The upstream stream is totally ordered, so with a single consumer this is
/// a no-op; it exists for at-least-once replays and for ticks reordered by
/// the normalizer's parallel admission, either of which could otherwise
/// regress `quotes:latest`.
#[derive(Debug, Default)]
pub struct MonotonicGuard {
    last: HashMap<String, i64>,
}

impl MonotonicGuard {
    /// True when the tick is not older than the last applied one.
    pub fn admit(&self, ticker: &str, ts_ms: i64) -> bool {
        self.last.get(ticker).map_or(true, |&prev| ts_ms >= prev)
    }

    /// Records a successfully applied timestamp.
    pub fn record(&mut self, ticker: &str, ts_ms: i64) {
        let entry = self.last.entry(ticker.to_string()).or_insert(ts_ms);
        if ts_ms > *entry {
            *entry = ts_ms;
        }
    }
}

/// Serial consumer of `normalized:events`; each message becomes one batched
/// store write (hash set + publish) under a single deadline, no retries.
pub struct QuotePublisher {
    store: RedisStore,
    metrics: Arc<PipelineMetrics>,
    batch_size: usize,
    guard: MonotonicGuard,
}

impl QuotePublisher {
    pub fn new(store: RedisStore, metrics: Arc<PipelineMetrics>, batch_size: usize) -> Self {
        Self {
            store,
            metrics,
            batch_size,
            guard: MonotonicGuard::default(),
        }
    }

    pub async fn run(mut self, shutdown: ShutdownSignal) -> StoreResult<()> {
        info!("cachepub service started");
        let mut reader = self
            .store
            .stream_reader(NORMALIZED_STREAM, self.batch_size, READ_BLOCK)
            .await?;

        while !shutdown.triggered() {
            let entries = tokio::select! {
                _ = shutdown.wait() => break,
                result = reader.read_batch() => match result {
                    Ok(entries) => entries,
                    Err(err) => {
                        warn!(error = %err, "normalized stream read failed");
                        if !shutdown.sleep(READ_RETRY_DELAY).await {
                            break;
                        }
                        continue;
                    }
                }
            };

            for entry in entries {
                reader.advance(&entry.id);
                self.apply(&entry).await;
            }
        }

        info!("cachepub service stopped");
        Ok(())
    }

    async fn apply(&mut self, entry: &StreamEntry) {
        let start = Instant::now();

        let tick = match NormalizedTick::from_fields(&entry.fields) {
            Ok(tick) => tick,
            Err(err) => {
                warn!(id = %entry.id, error = %err, "normalized parse error");
                self.metrics.inc_cachepub_error();
                return;
            }
        };

        if !self.guard.admit(&tick.ticker, tick.timestamp_ms) {
            debug!(ticker = %tick.ticker, ts_ms = tick.timestamp_ms, "stale tick skipped");
            return;
        }

        let payload = match tick.to_json() {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, "tick serialization failed");
                self.metrics.inc_cachepub_error();
                return;
            }
        };
        let quote = LatestQuote::from(&tick);

        match self
            .store
            .hset_publish(
                &latest_quote_key(&tick.ticker),
                &quote.to_fields(),
                QUOTES_CHANNEL,
                &payload,
            )
            .await
        {
            Ok(()) => {
                self.guard.record(&tick.ticker, tick.timestamp_ms);
                self.metrics.inc_cachepub();
            }
            Err(err) => {
                error!(error = %err, "quote publish failed");
                self.metrics.inc_cachepub_error();
            }
        }
        self.metrics
            .observe_cachepub_latency(start.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_tick_per_ticker_is_admitted() {
        let guard = MonotonicGuard::default();
        assert!(guard.admit("BTCUSD", 1_000));
    }

    #[test]
    fn regressions_are_rejected_equal_timestamps_pass() {
        let mut guard = MonotonicGuard::default();
        guard.record("BTCUSD", 2_000);
        assert!(!guard.admit("BTCUSD", 1_999));
        assert!(guard.admit("BTCUSD", 2_000));
        assert!(guard.admit("BTCUSD", 2_001));
    }

    #[test]
    fn record_keeps_the_maximum() {
        let mut guard = MonotonicGuard::default();
        guard.record("BTCUSD", 2_000);
        guard.record("BTCUSD", 1_500);
        assert!(!guard.admit("BTCUSD", 1_999));
    }

    #[test]
    fn tickers_are_tracked_independently() {
        let mut guard = MonotonicGuard::default();
        guard.record("BTCUSD", 2_000);
        assert!(guard.admit("ETHUSD", 1));
    }
}
