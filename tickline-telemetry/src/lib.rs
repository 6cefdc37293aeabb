//! Metrics registry and tracing bootstrap shared by every pipeline service.

use std::convert::Infallible;
use std::fs::{self, OpenOptions};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use hyper::body::Body;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Request, Response, StatusCode};
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Registry,
    TextEncoder,
};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global tracing subscriber with optional JSON file logging.
pub fn init_tracing(filter: &str, log_path: Option<&Path>) -> Result<()> {
    if let Some(path) = log_path {
        let stdout_layer = fmt::layer()
            .with_target(false)
            .with_filter(EnvFilter::new(filter));
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {dir:?}"))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        let _ = FILE_GUARD.set(guard);
        let file_layer = fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_writer(writer)
            .with_filter(EnvFilter::new(filter));
        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .try_init()?;
    } else {
        let stdout_layer = fmt::layer()
            .with_target(false)
            .with_filter(EnvFilter::new(filter));
        tracing_subscriber::registry()
            .with(stdout_layer)
            .try_init()?;
    }

    Ok(())
}

/// Prometheus metrics collected across the pipeline stages.
///
/// Drop counters are tracked separately from error counters: a drop is a
/// deliberate load-shedding decision, an error is a failed operation.
pub struct PipelineMetrics {
    registry: Registry,
    ingest_events: IntCounter,
    ingest_errors: IntCounter,
    ingest_dropped: IntCounter,
    normalize_events: IntCounter,
    normalize_errors: IntCounter,
    normalize_dropped: IntCounter,
    normalize_latency: Histogram,
    cachepub_events: IntCounter,
    cachepub_errors: IntCounter,
    cachepub_latency: Histogram,
    anomaly_events: IntCounter,
    anomaly_errors: IntCounter,
    redis_op_duration: HistogramVec,
    redis_errors: IntCounterVec,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let ingest_events = IntCounter::new(
            "pipeline_ingest_events_total",
            "Total raw events ingested",
        )
        .unwrap();
        let ingest_errors =
            IntCounter::new("pipeline_ingest_errors_total", "Raw ingest errors").unwrap();
        let ingest_dropped = IntCounter::new(
            "pipeline_ingest_dropped_total",
            "Raw events dropped because the ingest channel was full",
        )
        .unwrap();
        let normalize_events = IntCounter::new(
            "pipeline_normalize_events_total",
            "Total events normalized",
        )
        .unwrap();
        let normalize_errors =
            IntCounter::new("pipeline_normalize_errors_total", "Normalization errors").unwrap();
        let normalize_dropped = IntCounter::new(
            "pipeline_normalize_dropped_total",
            "Events dropped because the normalizer worker pool was full",
        )
        .unwrap();
        let normalize_latency = Histogram::with_opts(HistogramOpts::new(
            "pipeline_normalize_latency_seconds",
            "Time to normalize one event",
        ))
        .unwrap();
        let cachepub_events = IntCounter::new(
            "pipeline_cachepub_events_total",
            "Total cache/pub events processed",
        )
        .unwrap();
        let cachepub_errors =
            IntCounter::new("pipeline_cachepub_errors_total", "Cache/pub/sub errors").unwrap();
        let cachepub_latency = Histogram::with_opts(HistogramOpts::new(
            "pipeline_cachepub_latency_seconds",
            "Time to process one cache/pub event",
        ))
        .unwrap();
        let anomaly_events = IntCounter::new(
            "pipeline_anomaly_events_total",
            "Total anomalies detected",
        )
        .unwrap();
        let anomaly_errors =
            IntCounter::new("pipeline_anomaly_errors_total", "Anomaly detection errors").unwrap();
        let redis_op_duration = HistogramVec::new(
            HistogramOpts::new(
                "redis_operation_duration_seconds",
                "Redis operation duration",
            ),
            &["operation", "status"],
        )
        .unwrap();
        let redis_errors = IntCounterVec::new(
            prometheus::Opts::new("redis_errors_total", "Total Redis errors"),
            &["operation"],
        )
        .unwrap();

        registry.register(Box::new(ingest_events.clone())).unwrap();
        registry.register(Box::new(ingest_errors.clone())).unwrap();
        registry.register(Box::new(ingest_dropped.clone())).unwrap();
        registry
            .register(Box::new(normalize_events.clone()))
            .unwrap();
        registry
            .register(Box::new(normalize_errors.clone()))
            .unwrap();
        registry
            .register(Box::new(normalize_dropped.clone()))
            .unwrap();
        registry
            .register(Box::new(normalize_latency.clone()))
            .unwrap();
        registry
            .register(Box::new(cachepub_events.clone()))
            .unwrap();
        registry
            .register(Box::new(cachepub_errors.clone()))
            .unwrap();
        registry
            .register(Box::new(cachepub_latency.clone()))
            .unwrap();
        registry.register(Box::new(anomaly_events.clone())).unwrap();
        registry.register(Box::new(anomaly_errors.clone())).unwrap();
        registry
            .register(Box::new(redis_op_duration.clone()))
            .unwrap();
        registry.register(Box::new(redis_errors.clone())).unwrap();

        Self {
            registry,
            ingest_events,
            ingest_errors,
            ingest_dropped,
            normalize_events,
            normalize_errors,
            normalize_dropped,
            normalize_latency,
            cachepub_events,
            cachepub_errors,
            cachepub_latency,
            anomaly_events,
            anomaly_errors,
            redis_op_duration,
            redis_errors,
        }
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    pub fn inc_ingest(&self) {
        self.ingest_events.inc();
    }

    pub fn inc_ingest_error(&self) {
        self.ingest_errors.inc();
    }

    pub fn inc_ingest_dropped(&self) {
        self.ingest_dropped.inc();
    }

    pub fn ingest_dropped_count(&self) -> u64 {
        self.ingest_dropped.get()
    }

    pub fn inc_normalize(&self) {
        self.normalize_events.inc();
    }

    pub fn inc_normalize_error(&self) {
        self.normalize_errors.inc();
    }

    pub fn inc_normalize_dropped(&self) {
        self.normalize_dropped.inc();
    }

    pub fn normalize_dropped_count(&self) -> u64 {
        self.normalize_dropped.get()
    }

    pub fn observe_normalize_latency(&self, seconds: f64) {
        self.normalize_latency.observe(seconds);
    }

    pub fn inc_cachepub(&self) {
        self.cachepub_events.inc();
    }

    pub fn inc_cachepub_error(&self) {
        self.cachepub_errors.inc();
    }

    pub fn observe_cachepub_latency(&self, seconds: f64) {
        self.cachepub_latency.observe(seconds);
    }

    pub fn inc_anomaly(&self) {
        self.anomaly_events.inc();
    }

    pub fn inc_anomaly_error(&self) {
        self.anomaly_errors.inc();
    }

    pub fn observe_redis_op(&self, operation: &str, ok: bool, seconds: f64) {
        let status = if ok { "success" } else { "error" };
        self.redis_op_duration
            .with_label_values(&[operation, status])
            .observe(seconds);
        if !ok {
            self.redis_errors.with_label_values(&[operation]).inc();
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Launch a lightweight HTTP server that exposes Prometheus metrics.
pub fn spawn_metrics_server(registry: Registry, addr: SocketAddr) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let make_svc = make_service_fn(move |_| {
            let registry = registry.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        if req.uri().path() != "/metrics" {
                            return Ok::<_, Infallible>(
                                Response::builder()
                                    .status(StatusCode::NOT_FOUND)
                                    .body(Body::from("not found"))
                                    .unwrap(),
                            );
                        }
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
                            error!(error = %err, "failed to encode Prometheus metrics");
                            return Ok::<_, Infallible>(
                                Response::builder()
                                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                                    .body(Body::from("failed to encode metrics"))
                                    .unwrap(),
                            );
                        }
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("Content-Type", encoder.format_type())
                                .body(Body::from(buffer))
                                .unwrap(),
                        )
                    }
                }))
            }
        });

        if let Err(err) = hyper::Server::bind(&addr).serve(make_svc).await {
            error!(error = %err, %addr, "metrics server terminated");
        } else {
            info!(%addr, "metrics server shutdown");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_counters_are_distinct_from_error_counters() {
        let metrics = PipelineMetrics::new();
        metrics.inc_ingest_dropped();
        metrics.inc_ingest_dropped();
        metrics.inc_ingest_error();
        assert_eq!(metrics.ingest_dropped_count(), 2);
    }

    #[test]
    fn registry_exposes_all_pipeline_families() {
        let metrics = PipelineMetrics::new();
        metrics.inc_ingest();
        metrics.inc_normalize();
        metrics.inc_cachepub();
        metrics.inc_anomaly();
        metrics.observe_redis_op("xadd", false, 0.01);
        let names: Vec<String> = metrics
            .registry()
            .gather()
            .into_iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"pipeline_ingest_events_total".to_string()));
        assert!(names.contains(&"pipeline_normalize_events_total".to_string()));
        assert!(names.contains(&"pipeline_cachepub_events_total".to_string()));
        assert!(names.contains(&"pipeline_anomaly_events_total".to_string()));
        assert!(names.contains(&"redis_errors_total".to_string()));
    }
}
