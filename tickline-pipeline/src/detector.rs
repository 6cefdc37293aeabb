//! Anomaly detector: one rolling window per ticker, z-score threshold,
//! two-leg emission onto the anomaly stream and per-ticker index.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info, warn};

use tickline_core::{anomaly_index_key, Anomaly, NormalizedTick, ShutdownSignal, ANOMALY_STREAM, QUOTES_CHANNEL};
use tickline_store::{RedisStore, StoreResult};
use tickline_telemetry::PipelineMetrics;

use crate::window::RollingWindow;

#[derive(Clone, Copy, Debug)]
pub struct DetectorConfig {
    /// Window capacity `W` per ticker.
    pub window_size: usize,
    /// Emission threshold on `|z|`.
    pub threshold: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            threshold: 3.0,
        }
    }
}

/// Per-ticker windows plus the emit rule.
///
/// Owned by a single detector task, so per-ticker single-writer access is a
/// property of ownership rather than locking. Windows are created lazily on
/// first observation of a ticker.
pub struct DetectorState {
    config: DetectorConfig,
    windows: HashMap<String, RollingWindow>,
}

impl DetectorState {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
        }
    }

    /// Feeds one tick into its window; returns an anomaly when the absolute
    /// z-score reaches the threshold. A zero deviation carries no signal and
    /// never emits.
    pub fn observe(&mut self, tick: &NormalizedTick) -> Option<Anomaly> {
        let window = self
            .windows
            .entry(tick.ticker.clone())
            .or_insert_with(|| RollingWindow::new(self.config.window_size));
        window.push(tick.price);

        let (mean, std) = window.mean_std();
        if std == 0.0 {
            return None;
        }
        let z = ((tick.price - mean) / std).abs();
        if z < self.config.threshold {
            return None;
        }
        Some(Anomaly {
            ticker: tick.ticker.clone(),
            price: tick.price,
            z_score: z,
            timestamp_ms: tick.timestamp_ms,
        })
    }

    pub fn tracked_tickers(&self) -> usize {
        self.windows.len()
    }
}

/// Subscriber loop over `quotes:pubsub` driving [`DetectorState`].
pub struct AnomalyDetector {
    store: RedisStore,
    metrics: Arc<PipelineMetrics>,
    state: DetectorState,
}

impl AnomalyDetector {
    pub fn new(store: RedisStore, metrics: Arc<PipelineMetrics>, config: DetectorConfig) -> Self {
        Self {
            store,
            metrics,
            state: DetectorState::new(config),
        }
    }

    pub async fn run(mut self, shutdown: ShutdownSignal) -> StoreResult<()> {
        info!("anomaly detector started");
        let mut subscription = self.store.subscribe(QUOTES_CHANNEL).await?;

        loop {
            let received = tokio::select! {
                _ = shutdown.wait() => {
                    info!("anomaly detector stopping");
                    return Ok(());
                }
                payload = subscription.next_payload() => payload,
            };

            let Some(payload) = received else {
                // Restart policy belongs to the supervisor.
                warn!("quotes subscription closed by broker");
                return Ok(());
            };
            let payload = match payload {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "subscription receive failed");
                    self.metrics.inc_anomaly_error();
                    continue;
                }
            };
            let tick = match NormalizedTick::from_json(&payload) {
                Ok(tick) => tick,
                Err(err) => {
                    warn!(error = %err, "invalid tick payload");
                    self.metrics.inc_anomaly_error();
                    continue;
                }
            };

            if let Some(anomaly) = self.state.observe(&tick) {
                self.emit(&anomaly).await;
            }
        }
    }

    /// Stream append and index write fail independently; the success counter
    /// follows the index write.
    async fn emit(&self, anomaly: &Anomaly) {
        if let Err(err) = self.store.append(ANOMALY_STREAM, &anomaly.to_fields()).await {
            error!(error = %err, "anomaly stream append failed");
            self.metrics.inc_anomaly_error();
        }

        let member = match anomaly.to_json() {
            Ok(member) => member,
            Err(err) => {
                error!(error = %err, "anomaly serialization failed");
                self.metrics.inc_anomaly_error();
                return;
            }
        };
        match self
            .store
            .zadd(
                &anomaly_index_key(&anomaly.ticker),
                anomaly.timestamp_ms as f64,
                &member,
            )
            .await
        {
            Ok(()) => self.metrics.inc_anomaly(),
            Err(err) => {
                error!(error = %err, "anomaly index write failed");
                self.metrics.inc_anomaly_error();
            }
        }
    }
}
