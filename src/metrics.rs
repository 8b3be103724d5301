//! Prometheus metrics: connections, records received/dropped/indexed, bulk requests, queue depth.
//! When metrics.enabled, GET /metrics on the configured port exposes text format.

use once_cell::sync::OnceCell;
use prometheus::{Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};

static METRICS: OnceCell<MetricsInner> = OnceCell::new();

struct MetricsInner {
    connections: IntGauge,
    records_received_total: IntCounter,
    records_dropped_total: IntCounterVec,
    records_indexed_total: IntCounter,
    bulk_requests_total: IntCounterVec,
    bulk_duration_seconds: Histogram,
    queue_depth: IntGauge,
}

/// Initialize metrics and register with the default registry. Call once when metrics are enabled.
pub fn init() -> Result<(), prometheus::Error> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let connections = IntGauge::new("xlogd_connections", "Open RESP client connections")?;
    let records_received_total = IntCounter::new(
        "xlogd_records_received_total",
        "Push values received over RESP",
    )?;
    let records_dropped_total = IntCounterVec::new(
        Opts::new(
            "xlogd_records_dropped_total",
            "Records dropped before or during delivery by reason",
        ),
        &["reason"],
    )?;
    let records_indexed_total = IntCounter::new(
        "xlogd_records_indexed_total",
        "Records accepted by the bulk sink",
    )?;
    let bulk_requests_total = IntCounterVec::new(
        Opts::new(
            "xlogd_bulk_requests_total",
            "Bulk requests by outcome (ok, partial, retryable, permanent)",
        ),
        &["status"],
    )?;
    let bulk_duration_seconds = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "xlogd_bulk_duration_seconds",
            "Bulk request duration in seconds",
        )
        .buckets(prometheus::exponential_buckets(0.005, 2.0, 12)?),
    )?;
    let queue_depth = IntGauge::new("xlogd_queue_depth", "Records buffered for delivery")?;

    prometheus::register(Box::new(connections.clone()))?;
    prometheus::register(Box::new(records_received_total.clone()))?;
    prometheus::register(Box::new(records_dropped_total.clone()))?;
    prometheus::register(Box::new(records_indexed_total.clone()))?;
    prometheus::register(Box::new(bulk_requests_total.clone()))?;
    prometheus::register(Box::new(bulk_duration_seconds.clone()))?;
    prometheus::register(Box::new(queue_depth.clone()))?;

    let _ = METRICS.set(MetricsInner {
        connections,
        records_received_total,
        records_dropped_total,
        records_indexed_total,
        bulk_requests_total,
        bulk_duration_seconds,
        queue_depth,
    });
    Ok(())
}

pub fn set_connections(count: i64) {
    if let Some(m) = METRICS.get() {
        m.connections.set(std::cmp::max(0, count));
    }
}

pub fn record_received(count: u64) {
    if let Some(m) = METRICS.get() {
        m.records_received_total.inc_by(count);
    }
}

/// Record dropped records. reason: a normalize error label, "oversized", "ignored",
/// "missing_keyword", "queue_full", "bulk_failed", "bulk_rejected".
pub fn record_dropped(reason: &str, count: u64) {
    if let Some(m) = METRICS.get() {
        m.records_dropped_total
            .with_label_values(&[reason])
            .inc_by(count);
    }
}

pub fn record_indexed(count: u64) {
    if let Some(m) = METRICS.get() {
        m.records_indexed_total.inc_by(count);
    }
}

/// Record one bulk request. status: "ok", "partial", "retryable", "permanent".
pub fn record_bulk(status: &str, duration_secs: f64) {
    if let Some(m) = METRICS.get() {
        m.bulk_requests_total.with_label_values(&[status]).inc();
        m.bulk_duration_seconds.observe(duration_secs);
    }
}

pub fn set_queue_depth(depth: u64) {
    if let Some(m) = METRICS.get() {
        m.queue_depth.set(i64::try_from(depth).unwrap_or(i64::MAX));
    }
}

/// Encode all metrics in Prometheus text format. Returns empty string if metrics not initialized.
pub fn encode() -> String {
    if METRICS.get().is_none() {
        return String::new();
    }
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&families, &mut buffer).is_ok() {
        String::from_utf8_lossy(&buffer).into_owned()
    } else {
        String::new()
    }
}
