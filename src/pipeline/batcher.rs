//! Size/interval-bounded batching in front of an `EventSink`
//!
//! Rows are held until a flush succeeds. A failed write is retried with
//! exponential backoff; when retries run out the partition gets a
//! `FatalIngestion` error and the rows stay held for the next attempt.

use super::backoff::ExponentialBackoff;
use super::config::PipelineConfig;
use super::db::EventSink;
use super::engine::Outbox;
use super::error::{BatchKind, PipelineError, SinkError};
use super::stats::IngestStats;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Held rows beyond this many batches saturate the partition.
const HELD_BATCHES: usize = 4;

const FLUSH_ORDER: [BatchKind; 4] = [
    BatchKind::Raw,
    BatchKind::Rejected,
    BatchKind::Funnels,
    BatchKind::Buckets,
];

pub struct SinkBatcher {
    partition: usize,
    sink: Arc<dyn EventSink>,
    held: Outbox,
    batch_size: usize,
    flush_interval: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
    max_retries: u32,
    last_flush: Instant,
    stats: Arc<IngestStats>,
}

impl SinkBatcher {
    pub fn new(
        partition: usize,
        sink: Arc<dyn EventSink>,
        config: &PipelineConfig,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            partition,
            sink,
            held: Outbox::default(),
            batch_size: config.flush_batch_size.max(1),
            flush_interval: Duration::from_millis(config.flush_interval_ms),
            backoff_initial: Duration::from_millis(config.flush_backoff_initial_ms),
            backoff_max: Duration::from_millis(config.flush_backoff_max_ms),
            max_retries: config.flush_max_retries,
            last_flush: Instant::now(),
            stats,
        }
    }

    /// Take ownership of rows produced by the engine.
    pub fn hold(&mut self, outbox: Outbox) {
        self.held.merge(outbox);
    }

    pub fn held_rows(&self) -> usize {
        self.held.len()
    }

    /// Size or age bound reached. `pending_raw` counts rows still in the engine.
    pub fn should_flush(&self, pending_raw: usize) -> bool {
        self.held.raw.len() + pending_raw >= self.batch_size
            || self.last_flush.elapsed() >= self.flush_interval
    }

    /// Too much held after failed flushes; the worker stops pulling input.
    pub fn is_saturated(&self) -> bool {
        self.held.len() >= self.batch_size * HELD_BATCHES
    }

    fn held_len(&self, kind: BatchKind) -> usize {
        match kind {
            BatchKind::Raw => self.held.raw.len(),
            BatchKind::Rejected => self.held.rejected.len(),
            BatchKind::Funnels => self.held.funnels.len(),
            BatchKind::Buckets => self.held.buckets.len(),
        }
    }

    async fn write(&self, kind: BatchKind, n: usize) -> Result<usize, SinkError> {
        match kind {
            BatchKind::Raw => self.sink.persist_raw(&self.held.raw[..n]).await,
            BatchKind::Rejected => self.sink.persist_rejected(&self.held.rejected[..n]).await,
            BatchKind::Funnels => self.sink.persist_funnels(&self.held.funnels[..n]).await,
            BatchKind::Buckets => self.sink.persist_buckets(&self.held.buckets[..n]).await,
        }
    }

    fn release(&mut self, kind: BatchKind, n: usize) {
        match kind {
            BatchKind::Raw => drop(self.held.raw.drain(..n)),
            BatchKind::Rejected => drop(self.held.rejected.drain(..n)),
            BatchKind::Funnels => drop(self.held.funnels.drain(..n)),
            BatchKind::Buckets => drop(self.held.buckets.drain(..n)),
        }
    }

    /// Write every held row, one bounded batch at a time.
    ///
    /// Returns rows acknowledged by the sink. On `FatalIngestion` the failing
    /// batch and everything after it remain held.
    pub async fn flush(&mut self) -> Result<usize, PipelineError> {
        self.last_flush = Instant::now();
        if self.held.is_empty() {
            return Ok(0);
        }

        let flush_start = Instant::now();
        let mut written = 0;

        for kind in FLUSH_ORDER {
            while self.held_len(kind) > 0 {
                let n = self.held_len(kind).min(self.batch_size);
                let mut backoff =
                    ExponentialBackoff::new(self.backoff_initial, self.backoff_max, self.max_retries);

                loop {
                    match self.write(kind, n).await {
                        Ok(inserted) => {
                            self.release(kind, n);
                            self.stats.add_rows_written(inserted as u64);
                            written += n;
                            break;
                        }
                        Err(e) => {
                            self.stats.add_flush_failures(1);
                            log::warn!(
                                "⚠️  Partition {} {} flush failed ({} rows): {}",
                                self.partition,
                                kind,
                                n,
                                e
                            );
                            if backoff.sleep().await.is_err() {
                                self.stats.add_fatal_faults(1);
                                log::error!(
                                    "❌ Partition {} {} batch held after {} attempts ({} rows held)",
                                    self.partition,
                                    kind,
                                    backoff.attempts() + 1,
                                    self.held.len()
                                );
                                return Err(PipelineError::FatalIngestion {
                                    partition: self.partition,
                                    batch: kind,
                                    attempts: backoff.attempts() + 1,
                                    source: e,
                                });
                            }
                        }
                    }
                }
            }
        }

        self.stats.add_flushes(1);
        log::debug!(
            "✅ Partition {} flushed {} rows in {}ms",
            self.partition,
            written,
            flush_start.elapsed().as_millis()
        );
        Ok(written)
    }
}
