//! Throughput counters and the periodic stats document indexed into the sink.

use crate::config::StatsConfig;
use crate::queue::RecordQueue;
use crate::sink::BulkSink;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Process-wide counters, shared through `ServerContext` and the dispatcher.
#[derive(Debug, Default)]
pub struct Counters {
    records_total: AtomicU64,
}

impl Counters {
    /// Count records drained from the queue for delivery.
    pub fn add_records(&self, n: u64) {
        self.records_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn records_total(&self) -> u64 {
        self.records_total.load(Ordering::Relaxed)
    }
}

/// One liveness snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stats {
    pub timestamp: DateTime<Utc>,
    pub hostname: String,
    pub records_total: u64,
    pub records_last_interval: u64,
    pub records_queued: u64,
}

impl Stats {
    pub fn index(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.timestamp.format("%Y-%m-%d"))
    }
}

/// Configured hostname, else the system host name.
pub fn resolve_hostname(configured: Option<&str>) -> String {
    configured
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .or_else(sysinfo::System::host_name)
        .unwrap_or_else(|| "unknown".to_string())
}

pub struct StatsEmitter {
    sink: Arc<dyn BulkSink>,
    queue: Arc<dyn RecordQueue>,
    counters: Arc<Counters>,
    hostname: String,
    index_prefix: String,
    interval_secs: u64,
    jitter_secs: u64,
}

impl StatsEmitter {
    pub fn new(
        sink: Arc<dyn BulkSink>,
        queue: Arc<dyn RecordQueue>,
        counters: Arc<Counters>,
        hostname: String,
        config: &StatsConfig,
    ) -> Self {
        Self {
            sink,
            queue,
            counters,
            hostname,
            index_prefix: config.index_prefix.clone(),
            interval_secs: config.interval_secs,
            jitter_secs: config.jitter_secs.unwrap_or(0),
        }
    }

    pub fn snapshot(&self, previous_total: u64, now: DateTime<Utc>) -> Stats {
        let total = self.counters.records_total();
        Stats {
            timestamp: now,
            hostname: self.hostname.clone(),
            records_total: total,
            records_last_interval: total.saturating_sub(previous_total),
            records_queued: self.queue.depth(),
        }
    }

    /// Index one snapshot. Failures are logged, not retried. Returns the total it reported.
    pub async fn emit(&self, previous_total: u64) -> u64 {
        let stats = self.snapshot(previous_total, Utc::now());
        let index = stats.index(&self.index_prefix);
        let body = match serde_json::to_value(&stats) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode stats");
                return stats.records_total;
            }
        };
        match self.sink.index_single(&index, &body).await {
            Ok(()) => tracing::info!(
                records_total = stats.records_total,
                records_last_interval = stats.records_last_interval,
                records_queued = stats.records_queued,
                "stats collected"
            ),
            Err(e) => tracing::error!(error = %e, index = %index, "failed to write stats"),
        }
        stats.records_total
    }

    /// Emit every interval until cancelled. The first snapshot comes one interval after start.
    pub async fn run(self, cancel: CancellationToken) {
        let mut previous = self.counters.records_total();
        loop {
            let delay = next_delay(self.interval_secs, self.jitter_secs);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {
                    previous = self.emit(previous).await;
                }
            }
        }
        tracing::debug!("stats emitter stopped");
    }
}

/// Interval ± jitter, at least 1s.
fn next_delay(interval_secs: u64, jitter_secs: u64) -> Duration {
    let delta = if jitter_secs > 0 {
        rand::random_range(-(jitter_secs as i64)..=(jitter_secs as i64))
    } else {
        0
    };
    Duration::from_secs((interval_secs as i64 + delta).max(1) as u64)
}
