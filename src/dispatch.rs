//! Batch dispatcher: drain the queue by size or timeout, pace through a token bucket,
//! bulk-index, then commit or keep the batch depending on the outcome and queue kind.

use crate::config::BatchConfig;
use crate::metrics;
use crate::queue::{Batch, RecordQueue};
use crate::record::{IndexSettings, Operation};
use crate::sink::BulkSink;
use crate::stats::Counters;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Pause after a failed bulk write before the next cycle.
pub const FAILURE_COOLDOWN: Duration = Duration::from_millis(500);

pub struct Dispatcher {
    queue: Arc<dyn RecordQueue>,
    sink: Arc<dyn BulkSink>,
    counters: Arc<Counters>,
    settings: IndexSettings,
    batch_size: usize,
    batch_timeout: Duration,
    limiter: DefaultDirectRateLimiter,
    burst: NonZeroU32,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn RecordQueue>,
        sink: Arc<dyn BulkSink>,
        counters: Arc<Counters>,
        batch: &BatchConfig,
        settings: IndexSettings,
    ) -> anyhow::Result<Self> {
        let rate = NonZeroU32::new(batch.rate)
            .ok_or_else(|| anyhow::anyhow!("batch.rate must be > 0"))?;
        let burst = NonZeroU32::new(batch.burst)
            .ok_or_else(|| anyhow::anyhow!("batch.burst must be > 0"))?;
        if batch.size == 0 {
            anyhow::bail!("batch.size must be > 0");
        }
        Ok(Self {
            queue,
            sink,
            counters,
            settings,
            batch_size: batch.size,
            batch_timeout: batch.timeout(),
            limiter: RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)),
            burst,
        })
    }

    /// Loop until shutdown is requested and the queue is empty.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let shutting_down = cancel.is_cancelled();
            if shutting_down && self.queue.depth() == 0 {
                break;
            }
            // while draining, take what is there instead of waiting for a full batch
            let wait = if shutting_down {
                Duration::ZERO
            } else {
                self.batch_timeout
            };
            if let Err(e) = self.dispatch_once(wait).await {
                tracing::error!(error = %e, "dispatch cycle failed");
                tokio::time::sleep(FAILURE_COOLDOWN).await;
            }
        }
        tracing::info!("dispatcher drained and stopped");
    }

    /// One cycle: collect a batch (at most `batch.size`, waiting at most `wait`), deliver it.
    /// Returns how many records were submitted.
    pub async fn dispatch_once(&self, wait: Duration) -> anyhow::Result<usize> {
        let batch = self.queue.next_batch(self.batch_size, wait).await?;
        if batch.is_empty() {
            if batch.holds_rows() {
                // only undecodable rows; acknowledge so they do not come back
                self.queue.commit(batch).await?;
            }
            return Ok(0);
        }

        let ops: Vec<Operation> = batch
            .records
            .iter()
            .map(|r| r.to_operation(&self.settings))
            .collect();
        let count = batch.len();
        self.counters.add_records(count as u64);

        self.pace(count).await;

        let started = Instant::now();
        let result = self.sink.bulk_index(&ops).await;
        let elapsed = started.elapsed().as_secs_f64();
        drop(ops);

        match result {
            Ok(outcome) => {
                metrics::record_bulk(if outcome.failed > 0 { "partial" } else { "ok" }, elapsed);
                metrics::record_indexed(outcome.indexed as u64);
                let requeued = if self.queue.is_durable() {
                    match self.requeue(&batch, &outcome.retry).await {
                        Ok(n) => n,
                        Err(e) => {
                            // nothing committed: the whole batch comes back
                            tracing::warn!(
                                retryable = outcome.retry.len(),
                                error = %e,
                                "failed to re-queue retryable items; batch kept for redelivery"
                            );
                            tokio::time::sleep(FAILURE_COOLDOWN).await;
                            metrics::set_queue_depth(self.queue.depth());
                            return Ok(count);
                        }
                    }
                } else {
                    0
                };
                if outcome.failed > 0 {
                    tracing::warn!(
                        indexed = outcome.indexed,
                        failed = outcome.failed,
                        requeued,
                        first_error = outcome.first_error.as_deref().unwrap_or(""),
                        "bulk items rejected"
                    );
                    let dropped = outcome.failed.saturating_sub(requeued);
                    if dropped > 0 {
                        metrics::record_dropped("bulk_item_rejected", dropped as u64);
                    }
                }
                tracing::debug!(records = count, elapsed_secs = elapsed, "bulk committed");
                self.queue.commit(batch).await?;
            }
            Err(e) if e.is_retryable() => {
                metrics::record_bulk("retryable", elapsed);
                if self.queue.is_durable() {
                    tracing::warn!(records = count, error = %e, "failed to bulk insert; batch kept for redelivery");
                } else {
                    tracing::error!(records = count, error = %e, "failed to bulk insert; batch lost");
                    metrics::record_dropped("bulk_failed", count as u64);
                    self.queue.commit(batch).await?;
                }
                tokio::time::sleep(FAILURE_COOLDOWN).await;
            }
            Err(e) => {
                metrics::record_bulk("permanent", elapsed);
                tracing::error!(records = count, error = %e, "bulk rejected; dropping batch");
                metrics::record_dropped("bulk_rejected", count as u64);
                self.queue.commit(batch).await?;
            }
        }
        metrics::set_queue_depth(self.queue.depth());
        Ok(count)
    }

    /// Put the records at `positions` back at the tail of the queue, before their batch is
    /// committed. Returns how many went back.
    async fn requeue(&self, batch: &Batch, positions: &[usize]) -> anyhow::Result<usize> {
        let mut n = 0;
        for record in positions.iter().filter_map(|&i| batch.records.get(i)) {
            self.queue.put(record.clone()).await?;
            n += 1;
        }
        Ok(n)
    }

    /// Wait for `n` tokens, in chunks no larger than the bucket.
    async fn pace(&self, n: usize) {
        let mut left = n;
        while left > 0 {
            let chunk = left.min(self.burst.get() as usize);
            let Some(cells) = NonZeroU32::new(chunk as u32) else {
                break;
            };
            if let Err(e) = self.limiter.until_n_ready(cells).await {
                // unreachable while chunk <= burst
                tracing::warn!(error = %e, "rate limiter rejected chunk");
                break;
            }
            left -= chunk;
        }
    }
}
