//! Partition engine: the synchronous hot path
//!
//! One engine per partition owns that partition's dedup filter, funnel
//! correlator and window buckets, so none of them needs locking internally.
//!
//! ```text
//! Validation
//!     ↓
//! PartitionEngine::ingest()
//!     ├─ Rejected → dead-letter outbox
//!     └─ Valid → DedupFilter → FunnelCorrelator → WindowedAggregator → raw outbox
//!     ↓
//! PartitionEngine::take_outbox()  (raw, rejected, finalized funnels, dirty buckets)
//! ```

use super::config::{Clock, PipelineConfig};
use super::correlator::{FunnelCorrelator, FunnelRecord, FunnelStatus};
use super::dedup::{Admission, DedupFilter};
use super::stats::IngestStats;
use super::types::{EventType, RejectedEvent, StoredEvent};
use super::validator::Validation;
use super::windows::{ItemRanking, LocationWindow, WindowBucket, WindowedAggregator};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Dedup slots are one minute wide.
const DEDUP_SLOT_SECS: i64 = 60;

/// What happened to one ingested record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Accepted {
        newly_completed: Option<EventType>,
        /// False when the event was older than bucket retention.
        aggregated: bool,
    },
    Duplicate,
    Rejected,
}

/// Rows waiting to be handed to the sink.
#[derive(Debug, Default, Clone)]
pub struct Outbox {
    pub raw: Vec<StoredEvent>,
    pub rejected: Vec<RejectedEvent>,
    pub funnels: Vec<FunnelRecord>,
    pub buckets: Vec<WindowBucket>,
}

impl Outbox {
    pub fn len(&self) -> usize {
        self.raw.len() + self.rejected.len() + self.funnels.len() + self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `other`. Buckets are keyed, so a newer snapshot replaces an older one.
    pub fn merge(&mut self, other: Outbox) {
        self.raw.extend(other.raw);
        self.rejected.extend(other.rejected);
        self.funnels.extend(other.funnels);
        for bucket in other.buckets {
            match self.buckets.iter_mut().find(|b| {
                b.location_id == bucket.location_id && b.bucket_start == bucket.bucket_start
            }) {
                Some(existing) => *existing = bucket,
                None => self.buckets.push(bucket),
            }
        }
    }
}

/// Counts from one maintenance sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub dedup_evicted: usize,
    pub funnels_expired: usize,
    pub buckets_evicted: usize,
}

pub struct PartitionEngine {
    partition: usize,
    dedup: DedupFilter,
    correlator: FunnelCorrelator,
    windows: WindowedAggregator,
    stats: Arc<IngestStats>,
    clock: Clock,
    /// Highest event timestamp seen; the clock under `Clock::EventTime`.
    watermark: Option<i64>,
    outbox: Outbox,

    /// Timestamp function (for testing with mock time)
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl PartitionEngine {
    pub fn new(partition: usize, config: &PipelineConfig, stats: Arc<IngestStats>) -> Self {
        Self::new_with_timestamp_fn(
            partition,
            config,
            stats,
            Box::new(|| chrono::Utc::now().timestamp()),
        )
    }

    pub fn new_with_timestamp_fn(
        partition: usize,
        config: &PipelineConfig,
        stats: Arc<IngestStats>,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Self {
        Self {
            partition,
            dedup: DedupFilter::new(config.dedup_horizon_secs(), DEDUP_SLOT_SECS),
            correlator: FunnelCorrelator::new(
                config.max_funnel_lifetime_secs(),
                config.max_lateness_secs(),
            ),
            windows: WindowedAggregator::new(config.bucket_width_secs, config.bucket_retention_secs()),
            stats,
            clock: config.clock,
            watermark: None,
            outbox: Outbox::default(),
            now_fn,
        }
    }

    /// Current partition time (Unix seconds).
    pub fn now(&self) -> i64 {
        match (self.clock, self.watermark) {
            (Clock::EventTime, Some(watermark)) => watermark,
            _ => (self.now_fn)(),
        }
    }

    /// Process one validated-or-rejected record.
    pub fn ingest(&mut self, item: Validation) -> Disposition {
        self.stats.add_received(1);

        let event = match item {
            Validation::Rejected(mut rejected) => {
                rejected.rejected_at = self.now();
                self.stats.record_rejection(rejected.reason.code());
                self.outbox.rejected.push(rejected);
                return Disposition::Rejected;
            }
            Validation::Valid(event) => event,
        };

        if self.clock == Clock::EventTime {
            let ts = event.unix_ts();
            self.watermark = Some(self.watermark.map_or(ts, |w| w.max(ts)));
        }
        let now = self.now();

        if self.dedup.admit(&event.event_id, now) == Admission::Duplicate {
            log::debug!("Duplicate event {} dropped", event.event_id);
            self.stats.add_duplicates(1);
            return Disposition::Duplicate;
        }
        self.stats.add_accepted(1);

        let update = self.correlator.correlate(&event, now);
        if update.anomaly.is_some() {
            self.stats.add_anomalies(1);
        }

        let aggregated = self.windows.apply(&event, &update, now);
        if !aggregated {
            self.stats.add_too_late(1);
        }

        self.outbox.raw.push(StoredEvent {
            event,
            partition: self.partition,
            ingested_at: now,
        });

        Disposition::Accepted {
            newly_completed: update.newly_completed,
            aggregated,
        }
    }

    /// Evict expired dedup slots, funnels and buckets. Idempotent.
    ///
    /// Dirty buckets are snapshotted into the outbox before eviction so a late
    /// contribution is never lost.
    pub fn sweep(&mut self) -> SweepReport {
        let now = self.now();
        self.collect_derived();
        let report = SweepReport {
            dedup_evicted: self.dedup.evict_expired(now),
            funnels_expired: self.correlator.evict_expired(now),
            buckets_evicted: self.windows.evict_expired(now),
        };
        if report != SweepReport::default() {
            log::debug!("Partition {} sweep: {:?}", self.partition, report);
        }
        report
    }

    fn collect_derived(&mut self) {
        for record in self.correlator.take_finalized() {
            match record.status {
                FunnelStatus::Complete => self.stats.add_funnels_completed(1),
                FunnelStatus::Expired => self.stats.add_funnels_expired(1),
                FunnelStatus::Abandoned => self.stats.add_funnels_abandoned(1),
                FunnelStatus::Open => {}
            }
            self.outbox.funnels.push(record);
        }
        let dirty = self.windows.take_dirty();
        self.outbox.merge(Outbox {
            buckets: dirty,
            ..Outbox::default()
        });
    }

    /// Raw events buffered since the last take.
    pub fn pending_raw(&self) -> usize {
        self.outbox.raw.len()
    }

    /// Everything ready for the sink, including finalized funnels and dirty buckets.
    pub fn take_outbox(&mut self) -> Outbox {
        self.collect_derived();
        std::mem::take(&mut self.outbox)
    }

    /// Final outbox on shutdown: live funnels are included as `Open` rows.
    pub fn drain_for_shutdown(&mut self) -> Outbox {
        let mut outbox = self.take_outbox();
        outbox.funnels.extend(self.correlator.drain_open());
        outbox
    }

    pub fn location_windows(&self, window_secs: i64) -> Vec<LocationWindow> {
        self.windows.location_windows(window_secs, self.now())
    }

    pub fn item_totals(&self, window_secs: i64) -> BTreeMap<String, super::windows::ItemTally> {
        self.windows.item_totals(window_secs, self.now(), None)
    }

    pub fn top_items(&self, window_secs: i64, k: usize) -> Vec<ItemRanking> {
        self.windows.top_items(window_secs, self.now(), k)
    }

    pub fn live_funnels(&self) -> usize {
        self.correlator.live_count()
    }

    pub fn correlator(&self) -> &FunnelCorrelator {
        &self.correlator
    }

    pub fn partition(&self) -> usize {
        self.partition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::correlator::FunnelKey;
    use crate::pipeline::validator::EventValidator;
    use crate::pipeline::windows::WindowSize;
    use serde_json::json;
    use std::sync::atomic::{AtomicI64, Ordering};

    const T0: i64 = 1_709_316_000; // 2024-03-01T18:00:00Z

    fn iso(ts: i64) -> String {
        chrono::DateTime::from_timestamp(ts, 0)
            .unwrap()
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string()
    }

    fn common(id: &str, event_type: &str, ts: i64) -> serde_json::Value {
        json!({
            "event_id": id,
            "event_type": event_type,
            "timestamp": iso(ts),
            "restaurant_id": "rest_001",
            "restaurant_name": "Downtown Location",
            "table_id": "table_05",
        })
    }

    fn with(mut base: serde_json::Value, extra: serde_json::Value) -> serde_json::Value {
        let obj = base.as_object_mut().unwrap();
        for (k, v) in extra.as_object().unwrap() {
            obj.insert(k.clone(), v.clone());
        }
        base
    }

    fn seated(id: &str, ts: i64) -> serde_json::Value {
        with(common(id, "table_seated", ts), json!({"party_size": 4, "server_id": "server_101"}))
    }

    fn placed(id: &str, ts: i64) -> serde_json::Value {
        with(
            common(id, "order_placed", ts),
            json!({
                "order_id": "order_x",
                "server_id": "server_101",
                "items": [
                    {"item_id": "item_00001", "item_name": "Margherita Pizza", "category": "Pizza", "price": 18.99, "quantity": 1},
                    {"item_id": "item_00002", "item_name": "Caesar Salad", "category": "Salad", "price": 11.99, "quantity": 2}
                ],
                "subtotal": 42.97
            }),
        )
    }

    fn completed(id: &str, ts: i64) -> serde_json::Value {
        with(common(id, "order_completed", ts), json!({"order_id": "order_x", "kitchen_time_minutes": 8.0}))
    }

    fn paid(id: &str, ts: i64, total: f64) -> serde_json::Value {
        with(
            common(id, "payment", ts),
            json!({
                "order_id": "order_x",
                "subtotal": 60.14,
                "tax": 5.41,
                "tip": 0.0,
                "total_amount": total,
                "payment_method": "credit_card"
            }),
        )
    }

    struct Harness {
        engine: PartitionEngine,
        clock: Arc<AtomicI64>,
        stats: Arc<IngestStats>,
    }

    impl Harness {
        fn new(config: PipelineConfig) -> Self {
            let clock = Arc::new(AtomicI64::new(T0));
            let stats = Arc::new(IngestStats::new());
            let c = Arc::clone(&clock);
            let engine = PartitionEngine::new_with_timestamp_fn(
                0,
                &config,
                Arc::clone(&stats),
                Box::new(move || c.load(Ordering::SeqCst)),
            );
            Self { engine, clock, stats }
        }

        fn at(&mut self, now: i64, raw: serde_json::Value) -> Disposition {
            self.clock.store(now, Ordering::SeqCst);
            let v = EventValidator::new().validate_value(&raw, now);
            self.engine.ingest(v)
        }
    }

    #[test]
    fn test_scenario_full_funnel_with_duplicate() {
        let mut h = Harness::new(PipelineConfig::default());

        h.at(T0, seated("s1", T0));
        h.at(T0 + 120, placed("o1", T0 + 120));
        assert_eq!(h.at(T0 + 180, placed("o1", T0 + 120)), Disposition::Duplicate);
        h.at(T0 + 600, completed("c1", T0 + 600));
        h.at(T0 + 720, paid("p1", T0 + 720, 65.55));

        let windows = h.engine.location_windows(WindowSize::Min5.duration_secs());
        assert_eq!(windows.len(), 1);
        assert!((windows[0].acc.revenue - 65.55).abs() < 1e-9);
        assert_eq!(windows[0].acc.order_count, 1);

        let hour = h.engine.location_windows(WindowSize::Hour1.duration_secs());
        assert_eq!(hour[0].acc.stage_counts, [1, 1, 1, 1]);
        assert_eq!(hour[0].acc.items["item_00002"].quantity, 2);

        let outbox = h.engine.take_outbox();
        assert_eq!(outbox.raw.len(), 4);
        assert_eq!(outbox.funnels.len(), 1);
        assert_eq!(outbox.funnels[0].status, FunnelStatus::Complete);
        assert_eq!(h.engine.live_funnels(), 0);

        let snap = h.stats.snapshot();
        assert_eq!(snap.received, 5);
        assert_eq!(snap.accepted, 4);
        assert_eq!(snap.duplicates, 1);
        assert_eq!(snap.funnels_completed, 1);
    }

    #[test]
    fn test_scenario_malformed_event_is_dead_lettered() {
        let mut h = Harness::new(PipelineConfig::default());
        let mut raw = placed("bad", T0);
        raw.as_object_mut().unwrap().remove("event_type");

        assert_eq!(h.at(T0, raw), Disposition::Rejected);

        assert!(h.engine.location_windows(3_600).is_empty());
        assert_eq!(h.engine.live_funnels(), 0);
        let outbox = h.engine.take_outbox();
        assert_eq!(outbox.rejected.len(), 1);
        assert!(outbox.raw.is_empty());
        assert_eq!(h.stats.snapshot().rejected_by_reason["missing_field"], 1);
    }

    #[test]
    fn test_scenario_late_event_updates_historical_bucket() {
        let mut h = Harness::new(PipelineConfig {
            dedup_horizon_minutes: 5,
            max_lateness_minutes: 5,
            ..PipelineConfig::default()
        });

        h.at(T0 + 5, paid("p1", T0, 20.0));
        let first = h.engine.take_outbox();
        assert_eq!(first.buckets.len(), 1);
        assert_eq!(first.buckets[0].bucket_start, T0);

        // Six minutes of processing time later: the dedup horizon has passed.
        h.clock.store(T0 + 370, Ordering::SeqCst);
        assert_eq!(h.engine.sweep().dedup_evicted, 1);

        let late = with(paid("p2", T0 + 10, 7.5), json!({"order_id": "order_y"}));
        assert!(matches!(
            h.at(T0 + 370, late.clone()),
            Disposition::Accepted { aggregated: true, .. }
        ));
        let second = h.engine.take_outbox();
        assert_eq!(second.buckets.len(), 1);
        assert_eq!(second.buckets[0].bucket_start, T0);
        assert!((second.buckets[0].acc.revenue - 27.5).abs() < 1e-9);

        let window = h.engine.location_windows(WindowSize::Min30.duration_secs());
        assert!((window[0].acc.revenue - 27.5).abs() < 1e-9);

        // The late record itself is remembered for a full horizon from its arrival.
        assert_eq!(h.at(T0 + 400, late), Disposition::Duplicate);

        // A re-delivery of p1 six minutes after its first arrival is past the
        // horizon, so it is admitted again into its historical bucket.
        assert!(matches!(
            h.at(T0 + 400, paid("p1", T0, 20.0)),
            Disposition::Accepted { aggregated: true, .. }
        ));
        let window = h.engine.location_windows(WindowSize::Min30.duration_secs());
        assert!((window[0].acc.revenue - 47.5).abs() < 1e-9);
        assert_eq!(window[0].acc.order_count, 3);
        assert_eq!(h.stats.snapshot().duplicates, 1);
    }

    #[test]
    fn test_sweep_expires_paid_funnel_missing_predecessors() {
        let mut h = Harness::new(PipelineConfig::default());
        h.at(T0, paid("p1", T0, 10.0));
        assert_eq!(h.engine.live_funnels(), 1);

        h.clock.store(T0 + 301, Ordering::SeqCst);
        let report = h.engine.sweep();
        assert_eq!(report.funnels_expired, 1);

        let outbox = h.engine.take_outbox();
        assert_eq!(outbox.funnels.len(), 1);
        assert_eq!(outbox.funnels[0].status, FunnelStatus::Expired);
        assert_eq!(h.stats.snapshot().funnels_expired, 1);
    }

    #[test]
    fn test_shutdown_drain_includes_open_funnels() {
        let mut h = Harness::new(PipelineConfig::default());
        h.at(T0, seated("s1", T0));
        h.at(T0 + 60, placed("o1", T0 + 60));

        let outbox = h.engine.drain_for_shutdown();
        assert_eq!(outbox.raw.len(), 2);
        assert_eq!(outbox.funnels.len(), 1);
        assert_eq!(outbox.funnels[0].status, FunnelStatus::Open);
        assert_eq!(
            outbox.funnels[0].key,
            FunnelKey {
                location_id: "rest_001".to_string(),
                table_id: "table_05".to_string(),
                order_id: Some("order_x".to_string()),
            }
        );
        assert_eq!(h.engine.live_funnels(), 0);
    }

    #[test]
    fn test_event_time_clock_follows_watermark() {
        let config = PipelineConfig {
            clock: Clock::EventTime,
            ..PipelineConfig::default()
        };
        let mut h = Harness::new(config);
        // Wall clock far in the future; replayed events still aggregate.
        h.clock.store(T0 + 86_400 * 30, Ordering::SeqCst);
        let v = EventValidator::new().validate_value(&paid("p1", T0, 12.0), T0);
        assert!(matches!(
            h.engine.ingest(v),
            Disposition::Accepted { aggregated: true, .. }
        ));
        assert_eq!(h.engine.now(), T0);
        assert_eq!(h.engine.location_windows(300)[0].acc.order_count, 1);

        // Dead letters are stamped with the same clock as accepted rows.
        let bad = EventValidator::new().validate_line("{not json", T0 + 86_400 * 30);
        assert_eq!(h.engine.ingest(bad), Disposition::Rejected);
        let outbox = h.engine.take_outbox();
        assert_eq!(outbox.raw[0].ingested_at, T0);
        assert_eq!(outbox.rejected[0].rejected_at, T0);
    }
}
