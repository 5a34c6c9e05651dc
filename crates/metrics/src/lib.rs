//! Metrics and tracing setup for deskvault.
//!
//! Provides a global [`VaultMetrics`] singleton backed by the `prometheus`
//! crate, plus an optional lightweight HTTP server for Prometheus scraping.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

static METRICS: OnceLock<VaultMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static VaultMetrics {
    METRICS.get_or_init(VaultMetrics::new)
}

pub struct VaultMetrics {
    pub registry: Registry,

    // ── Record store ──
    pub records_saved: IntCounter,
    pub records_read: IntCounter,
    pub records_deleted: IntCounter,
    pub chunked_writes: IntCounter,
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub cache_stale: IntCounter,

    // ── Indexes ──
    pub index_evictions: IntCounter,
    pub index_corrupt_reads: IntCounter,

    // ── Quotas ──
    pub quota_rejections: IntCounterVec,
    pub quota_counters_reclaimed: IntCounter,

    // ── Transactions ──
    pub txn_committed: IntCounter,
    pub txn_rolled_back: IntCounter,
    pub txn_inverse_failures: IntCounter,
    pub lock_timeouts: IntCounter,
    pub txn_latency_secs: Histogram,
}

impl std::fmt::Debug for VaultMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultMetrics").finish_non_exhaustive()
    }
}

/// Histogram buckets (seconds) for transaction latency.
const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0];

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help)).expect("valid counter opts");
    registry
        .register(Box::new(c.clone()))
        .expect("unique counter name");
    c
}

impl VaultMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let records_saved = counter(&registry, "deskvault_records_saved_total", "Records saved");
        let records_read = counter(&registry, "deskvault_records_read_total", "Records read");
        let records_deleted =
            counter(&registry, "deskvault_records_deleted_total", "Records deleted");
        let chunked_writes = counter(
            &registry,
            "deskvault_chunked_writes_total",
            "Saves that split the record into chunks",
        );
        let cache_hits = counter(&registry, "deskvault_cache_hits_total", "Read cache hits");
        let cache_misses = counter(&registry, "deskvault_cache_misses_total", "Read cache misses");
        let cache_stale = counter(
            &registry,
            "deskvault_cache_stale_total",
            "Cached records discarded after a version mismatch",
        );

        let index_evictions = counter(
            &registry,
            "deskvault_index_evictions_total",
            "Index entries trimmed after overflowing",
        );
        let index_corrupt_reads = counter(
            &registry,
            "deskvault_index_corrupt_reads_total",
            "Index entries that failed to decode and were treated as empty",
        );

        let quota_rejections = IntCounterVec::new(
            Opts::new(
                "deskvault_quota_rejections_total",
                "Calls rejected by the quota limiter, by window",
            ),
            &["operation", "window"],
        )
        .expect("valid counter vec opts");
        registry
            .register(Box::new(quota_rejections.clone()))
            .expect("register quota_rejections");
        let quota_counters_reclaimed = counter(
            &registry,
            "deskvault_quota_counters_reclaimed_total",
            "Expired quota counters deleted by cleanup",
        );

        let txn_committed = counter(
            &registry,
            "deskvault_txn_committed_total",
            "Transactions committed",
        );
        let txn_rolled_back = counter(
            &registry,
            "deskvault_txn_rolled_back_total",
            "Transactions rolled back",
        );
        let txn_inverse_failures = counter(
            &registry,
            "deskvault_txn_inverse_failures_total",
            "Undo steps that failed during rollback",
        );
        let lock_timeouts = counter(
            &registry,
            "deskvault_lock_timeouts_total",
            "Lock acquisitions that timed out",
        );

        let txn_latency_secs = Histogram::with_opts(
            HistogramOpts::new(
                "deskvault_txn_latency_seconds",
                "Transaction latency in seconds, lock wait included",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )
        .expect("valid histogram opts");
        registry
            .register(Box::new(txn_latency_secs.clone()))
            .expect("register txn_latency_secs");

        Self {
            registry,
            records_saved,
            records_read,
            records_deleted,
            chunked_writes,
            cache_hits,
            cache_misses,
            cache_stale,
            index_evictions,
            index_corrupt_reads,
            quota_rejections,
            quota_counters_reclaimed,
            txn_committed,
            txn_rolled_back,
            txn_inverse_failures,
            lock_timeouts,
            txn_latency_secs,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&m.registry.gather(), &mut buf) {
        tracing::warn!("prometheus encoding failed: {}", e);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Start a transaction latency timer; records elapsed time on drop.
pub fn start_txn_timer() -> prometheus::HistogramTimer {
    metrics().txn_latency_secs.start_timer()
}

// ────────────────────────── Metrics HTTP server ──────────────────────────

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn metrics_handler(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    if req.uri().path() != "/metrics" {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found\n")));
    }
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Full::new(Bytes::from(encode_metrics())))
}

/// Serve Prometheus metrics on the given address (`GET /metrics`).
///
/// Runs until the listener fails. Call from a `tokio::spawn`.
pub async fn serve_metrics(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::debug!("metrics connection error: {}", e);
            }
        });
    }
}

// ────────────────────────── Tests ──────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init_and_increment() {
        let m = metrics();

        let before = m.records_saved.get();
        m.records_saved.inc();
        m.records_saved.inc();
        assert_eq!(m.records_saved.get(), before + 2);

        m.quota_rejections
            .with_label_values(&["record_write", "minute"])
            .inc();
        assert!(
            m.quota_rejections
                .with_label_values(&["record_write", "minute"])
                .get()
                >= 1
        );
    }

    #[test]
    fn test_encode_metrics_format() {
        metrics().txn_committed.inc();

        let output = encode_metrics();
        assert!(output.contains("deskvault_txn_committed_total"));
        assert!(output.contains("deskvault_records_saved_total"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_txn_timer_records_sample() {
        let before = metrics().txn_latency_secs.get_sample_count();
        {
            let _timer = start_txn_timer();
        }
        assert_eq!(metrics().txn_latency_secs.get_sample_count(), before + 1);
    }
}
