//! Pipeline ingestion - partitioned async workers
//!
//! Raw records are validated on submit and routed to a bounded queue per
//! partition (by `location_id`). Each partition has exactly one worker, which
//! owns a `PartitionEngine` and a `SinkBatcher`:
//!
//! - receive → `engine.ingest()` (synchronous, no awaits)
//! - size bound or tick → sweep, take outbox, `batcher.flush()` (the only await besides recv)
//! - queue closed → drain, final flush including open funnels
//!
//! A worker whose batcher is saturated stops receiving, so its queue fills and
//! `try_submit` reports `QueueFull` instead of memory growing without bound.

use super::batcher::SinkBatcher;
use super::config::PipelineConfig;
use super::db::EventSink;
use super::engine::PartitionEngine;
use super::error::PipelineError;
use super::source::EventSource;
use super::stats::{IngestStats, StatsSnapshot};
use super::validator::{EventValidator, Validation};
use super::windows::{rank_items, ItemRanking, ItemTally, LocationWindow, WindowSize};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Partition owning `location_id`. Stable for a given partition count.
pub fn partition_for(location_id: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    location_id.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}

fn lock(engine: &Mutex<PartitionEngine>) -> MutexGuard<'_, PartitionEngine> {
    engine.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a partition worker did before it stopped.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PartitionReport {
    pub partition: usize,
    pub processed: u64,
    pub rows_flushed: u64,
    /// Rows still unwritten at exit; non-zero only if the sink never recovered.
    pub held_rows: usize,
    pub fatal_faults: u32,
    pub last_fault: Option<String>,
}

impl PartitionReport {
    fn record_fault(&mut self, err: PipelineError) {
        log::error!("❌ {}", err);
        self.fatal_faults += 1;
        self.last_fault = Some(err.to_string());
    }
}

/// Read-only view over every partition's live window state.
#[derive(Clone)]
pub struct QueryHandle {
    engines: Vec<Arc<Mutex<PartitionEngine>>>,
}

impl QueryHandle {
    /// Per-location totals (revenue, funnel counts, waits, items) over `window`.
    pub fn location_windows(&self, window: WindowSize) -> Vec<LocationWindow> {
        let mut merged: BTreeMap<String, LocationWindow> = BTreeMap::new();
        for engine in &self.engines {
            for lw in lock(engine).location_windows(window.duration_secs()) {
                match merged.get_mut(&lw.location_id) {
                    Some(existing) => existing.acc.merge(&lw.acc),
                    None => {
                        merged.insert(lw.location_id.clone(), lw);
                    }
                }
            }
        }
        merged.into_values().collect()
    }

    /// Top-K items across all locations.
    pub fn top_items(&self, window: WindowSize, k: usize) -> Vec<ItemRanking> {
        let mut totals: BTreeMap<String, ItemTally> = BTreeMap::new();
        for engine in &self.engines {
            for (item_id, tally) in lock(engine).item_totals(window.duration_secs()) {
                let entry = totals.entry(item_id).or_default();
                if entry.item_name.is_empty() {
                    entry.item_name = tally.item_name;
                    entry.category = tally.category;
                }
                entry.quantity += tally.quantity;
                entry.order_count += tally.order_count;
            }
        }
        rank_items(totals, k)
    }

    pub fn live_funnels(&self) -> usize {
        self.engines.iter().map(|e| lock(e).live_funnels()).sum()
    }
}

pub struct Pipeline {
    senders: Vec<mpsc::Sender<Validation>>,
    engines: Vec<Arc<Mutex<PartitionEngine>>>,
    workers: Vec<JoinHandle<PartitionReport>>,
    closing: watch::Sender<bool>,
    stats: Arc<IngestStats>,
    validator: EventValidator,
    capacity: usize,
    now_fn: Arc<dyn Fn() -> i64 + Send + Sync>,
}

impl Pipeline {
    /// Spawn one worker per partition. Must be called inside a tokio runtime.
    pub fn start(config: PipelineConfig, sink: Arc<dyn EventSink>) -> Result<Self, PipelineError> {
        Self::start_with_timestamp_fn(config, sink, Arc::new(|| chrono::Utc::now().timestamp()))
    }

    /// Same as `start`, with an injected processing clock (for testing with mock time).
    pub fn start_with_timestamp_fn(
        config: PipelineConfig,
        sink: Arc<dyn EventSink>,
        now_fn: Arc<dyn Fn() -> i64 + Send + Sync>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        log::info!("🚀 Starting servflow pipeline");
        log::info!("   ├─ Partitions: {}", config.partition_count);
        log::info!("   ├─ Queue capacity: {}/partition", config.partition_queue_capacity);
        log::info!(
            "   ├─ Flush: {} rows or {}ms",
            config.flush_batch_size,
            config.flush_interval_ms
        );
        log::info!(
            "   └─ Dedup horizon: {}m, lateness: {}m, clock: {}",
            config.dedup_horizon_minutes,
            config.max_lateness_minutes,
            config.clock.as_str()
        );

        let stats = Arc::new(IngestStats::new());
        let (closing, closing_rx) = watch::channel(false);
        let mut senders = Vec::with_capacity(config.partition_count);
        let mut engines = Vec::with_capacity(config.partition_count);
        let mut workers = Vec::with_capacity(config.partition_count);

        for partition in 0..config.partition_count {
            let (tx, rx) = mpsc::channel(config.partition_queue_capacity);
            let clock = Arc::clone(&now_fn);
            let engine = Arc::new(Mutex::new(PartitionEngine::new_with_timestamp_fn(
                partition,
                &config,
                Arc::clone(&stats),
                Box::new(move || clock()),
            )));
            let batcher = SinkBatcher::new(partition, Arc::clone(&sink), &config, Arc::clone(&stats));

            workers.push(tokio::spawn(run_partition(
                rx,
                Arc::clone(&engine),
                batcher,
                Duration::from_millis(config.flush_interval_ms),
                closing_rx.clone(),
            )));
            senders.push(tx);
            engines.push(engine);
        }

        Ok(Self {
            senders,
            engines,
            workers,
            closing,
            stats,
            validator: EventValidator::new(),
            capacity: config.partition_queue_capacity,
            now_fn,
        })
    }

    fn route(&self, raw: &str) -> (usize, Validation) {
        // Provisional; the owning engine restamps `rejected_at` with its own clock.
        let validation = self.validator.validate_line(raw, (self.now_fn)());
        let partition = match &validation {
            Validation::Valid(event) => partition_for(&event.location_id, self.senders.len()),
            // Dead-letter rows have no trustworthy location.
            Validation::Rejected(_) => 0,
        };
        (partition, validation)
    }

    /// Validate and enqueue one raw record, waiting for queue space.
    pub async fn submit(&self, raw: &str) -> Result<(), PipelineError> {
        let (partition, validation) = self.route(raw);
        self.senders[partition]
            .send(validation)
            .await
            .map_err(|_| PipelineError::Closed)
    }

    /// Validate and enqueue without waiting; a full queue is reported, not hidden.
    pub fn try_submit(&self, raw: &str) -> Result<(), PipelineError> {
        let (partition, validation) = self.route(raw);
        self.senders[partition].try_send(validation).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                self.stats.add_queue_full(1);
                PipelineError::QueueFull { partition }
            }
            mpsc::error::TrySendError::Closed(_) => PipelineError::Closed,
        })
    }

    /// Pull from `source` until it is exhausted. Returns records submitted.
    pub async fn ingest_from<S: EventSource + ?Sized>(
        &self,
        source: &mut S,
        batch_size: usize,
    ) -> Result<u64, PipelineError> {
        let mut submitted = 0u64;
        while let Some(batch) = source.next_batch(batch_size).await? {
            for raw in batch {
                self.submit(&raw).await?;
                submitted += 1;
            }
        }
        Ok(submitted)
    }

    pub fn handle(&self) -> QueryHandle {
        QueryHandle {
            engines: self.engines.clone(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Records waiting in each partition queue.
    pub fn queue_depths(&self) -> Vec<usize> {
        self.senders
            .iter()
            .map(|s| self.capacity - s.capacity())
            .collect()
    }

    /// Close the queues, let every worker drain and flush, and collect reports.
    pub async fn shutdown(self) -> Vec<PartitionReport> {
        log::info!("🔄 Shutting down pipeline, draining partitions...");
        let _ = self.closing.send(true);
        drop(self.senders);

        let mut reports = Vec::with_capacity(self.workers.len());
        for (partition, worker) in self.workers.into_iter().enumerate() {
            match worker.await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    log::error!("❌ Partition {} worker failed: {}", partition, e);
                    reports.push(PartitionReport {
                        partition,
                        last_fault: Some(e.to_string()),
                        ..PartitionReport::default()
                    });
                }
            }
        }

        let held: usize = reports.iter().map(|r| r.held_rows).sum();
        if held > 0 {
            log::error!("❌ Pipeline stopped with {} rows unwritten", held);
        } else {
            log::info!("✅ Pipeline stopped, all partitions drained");
        }
        reports
    }
}

async fn run_partition(
    mut rx: mpsc::Receiver<Validation>,
    engine: Arc<Mutex<PartitionEngine>>,
    mut batcher: SinkBatcher,
    tick: Duration,
    closing: watch::Receiver<bool>,
) -> PartitionReport {
    let partition = lock(&engine).partition();
    let mut report = PartitionReport {
        partition,
        ..PartitionReport::default()
    };
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    log::debug!("Partition {} worker started", partition);

    loop {
        tokio::select! {
            maybe = rx.recv(), if !batcher.is_saturated() => {
                let Some(item) = maybe else {
                    break;
                };
                report.processed += 1;
                let size_bound = {
                    let mut engine = lock(&engine);
                    engine.ingest(item);
                    if batcher.should_flush(engine.pending_raw()) {
                        batcher.hold(engine.take_outbox());
                        true
                    } else {
                        false
                    }
                };
                if size_bound {
                    flush(&mut batcher, &mut report).await;
                }
            }

            _ = ticker.tick() => {
                {
                    let mut engine = lock(&engine);
                    engine.sweep();
                    batcher.hold(engine.take_outbox());
                }
                flush(&mut batcher, &mut report).await;

                if batcher.is_saturated() {
                    log::warn!(
                        "⚠️  Partition {} saturated ({} rows held), not pulling input",
                        partition,
                        batcher.held_rows()
                    );
                    if *closing.borrow() {
                        break;
                    }
                }
            }
        }
    }

    // A saturated worker can stop with records still queued. They are
    // ingested and held like everything else, never dropped with `rx`.
    rx.close();
    let mut leftover = 0u64;
    {
        let mut engine = lock(&engine);
        while let Ok(item) = rx.try_recv() {
            engine.ingest(item);
            leftover += 1;
        }
        engine.sweep();
        batcher.hold(engine.drain_for_shutdown());
    }
    report.processed += leftover;
    if leftover > 0 {
        log::warn!(
            "⚠️  Partition {} ingested {} queued records during shutdown",
            partition,
            leftover
        );
    }
    flush(&mut batcher, &mut report).await;
    report.held_rows = batcher.held_rows();

    log::info!(
        "✅ Partition {} stopped: {} records, {} rows flushed",
        partition,
        report.processed,
        report.rows_flushed
    );
    report
}

async fn flush(batcher: &mut SinkBatcher, report: &mut PartitionReport) {
    match batcher.flush().await {
        Ok(rows) => report.rows_flushed += rows as u64,
        Err(e) => report.record_fault(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::MemoryEventSink;

    #[test]
    fn test_partition_for_is_stable_and_in_range() {
        for n in 1..8 {
            let p = partition_for("rest_001", n);
            assert!(p < n);
            assert_eq!(p, partition_for("rest_001", n));
        }
        assert_eq!(partition_for("anything", 0), 0);
    }

    fn seated(id: &str, location: &str) -> String {
        serde_json::json!({
            "event_id": id,
            "event_type": "table_seated",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "location_id": location,
            "location_name": "Test Location",
            "table_id": "table_01",
            "party_size": 2,
            "server_id": "server_100"
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_try_submit_reports_queue_full() {
        let sink: Arc<dyn EventSink> = Arc::new(MemoryEventSink::new());
        let config = PipelineConfig {
            partition_count: 1,
            partition_queue_capacity: 1,
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::start(config, sink).unwrap();

        // Current-thread runtime: the worker cannot run between these calls.
        assert!(pipeline.try_submit(&seated("a", "rest_001")).is_ok());
        match pipeline.try_submit(&seated("b", "rest_001")) {
            Err(PipelineError::QueueFull { partition }) => assert_eq!(partition, 0),
            other => panic!("expected QueueFull, got {:?}", other),
        }
        assert_eq!(pipeline.stats().queue_full, 1);
        assert_eq!(pipeline.queue_depths(), vec![1]);

        let reports = pipeline.shutdown().await;
        assert_eq!(reports[0].processed, 1);
        assert_eq!(reports[0].held_rows, 0);
    }

    #[tokio::test]
    async fn test_saturated_shutdown_keeps_queued_records() {
        let memory = Arc::new(MemoryEventSink::new());
        memory.fail_next(u32::MAX);
        let sink: Arc<dyn EventSink> = memory.clone();
        let config = PipelineConfig {
            partition_count: 1,
            flush_batch_size: 1,
            flush_interval_ms: 10,
            flush_max_retries: 1,
            flush_backoff_initial_ms: 1,
            flush_backoff_max_ms: 1,
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::start(config, sink).unwrap();

        for i in 0..50 {
            pipeline
                .submit(&seated(&format!("evt_{}", i), "rest_001"))
                .await
                .unwrap();
        }
        // Long enough for the worker to saturate and stop receiving.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let reports = pipeline.shutdown().await;
        assert_eq!(reports[0].processed, 50);
        assert!(reports[0].fatal_faults > 0);
        // Every accepted record is still accounted for as an unwritten raw row.
        assert!(reports[0].held_rows >= 50, "held_rows = {}", reports[0].held_rows);
        assert!(memory.snapshot().raw.is_empty());
    }
}
