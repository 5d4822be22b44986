//! Time-bucketed rolling aggregates
//!
//! Each location keeps fixed-width buckets keyed by bucket start (event time).
//! Sliding windows (5m / 30m / 1h) are answered by summing the buckets whose
//! start falls inside the window, so a query never rescans raw events.
//! Late events land in their historical bucket; buckets touched since the last
//! flush are tracked as dirty so the late contribution reaches storage too.

use super::correlator::FunnelUpdate;
use super::types::{Event, EventPayload, EventType};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WindowSize {
    Min5,
    Min30,
    Hour1,
}

impl WindowSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowSize::Min5 => "5m",
            WindowSize::Min30 => "30m",
            WindowSize::Hour1 => "1h",
        }
    }

    pub fn duration_secs(&self) -> i64 {
        match self {
            WindowSize::Min5 => 5 * 60,
            WindowSize::Min30 => 30 * 60,
            WindowSize::Hour1 => 60 * 60,
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "5m" => Some(WindowSize::Min5),
            "30m" => Some(WindowSize::Min30),
            "1h" => Some(WindowSize::Hour1),
            _ => None,
        }
    }

    pub fn all() -> [WindowSize; 3] {
        [WindowSize::Min5, WindowSize::Min30, WindowSize::Hour1]
    }

    /// Longest supported window; buckets older than this (plus lateness) are evicted.
    pub fn max_secs() -> i64 {
        WindowSize::Hour1.duration_secs()
    }
}

/// Running totals for one menu item.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ItemTally {
    pub item_name: String,
    pub category: String,
    pub quantity: u64,
    /// Orders containing the item, counted once per order.
    pub order_count: u64,
}

impl ItemTally {
    fn merge(&mut self, other: &ItemTally) {
        if self.item_name.is_empty() {
            self.item_name = other.item_name.clone();
            self.category = other.category.clone();
        }
        self.quantity += other.quantity;
        self.order_count += other.order_count;
    }
}

/// Additive accumulators shared by buckets and window totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Accumulators {
    pub revenue: f64,
    pub tax: f64,
    pub tips: f64,
    /// Paid orders (Payment events).
    pub order_count: u64,
    /// Newly reached funnel stages, indexed by `EventType::index()`.
    pub stage_counts: [u64; 4],
    pub kitchen_minutes_sum: f64,
    pub kitchen_count: u64,
    pub seat_wait_secs_sum: i64,
    pub seat_wait_count: u64,
    pub items: BTreeMap<String, ItemTally>,
}

impl Accumulators {
    pub fn merge(&mut self, other: &Accumulators) {
        self.revenue += other.revenue;
        self.tax += other.tax;
        self.tips += other.tips;
        self.order_count += other.order_count;
        for (mine, theirs) in self.stage_counts.iter_mut().zip(other.stage_counts.iter()) {
            *mine += theirs;
        }
        self.kitchen_minutes_sum += other.kitchen_minutes_sum;
        self.kitchen_count += other.kitchen_count;
        self.seat_wait_secs_sum += other.seat_wait_secs_sum;
        self.seat_wait_count += other.seat_wait_count;
        for (item_id, tally) in &other.items {
            self.items.entry(item_id.clone()).or_default().merge(tally);
        }
    }

    pub fn stage_count(&self, stage: EventType) -> u64 {
        self.stage_counts[stage.index()]
    }

    /// `to / from` stage counts, `None` when nothing entered `from`.
    pub fn conversion(&self, from: EventType, to: EventType) -> Option<f64> {
        let base = self.stage_count(from);
        (base > 0).then(|| self.stage_count(to) as f64 / base as f64)
    }

    pub fn avg_kitchen_minutes(&self) -> Option<f64> {
        (self.kitchen_count > 0).then(|| self.kitchen_minutes_sum / self.kitchen_count as f64)
    }

    pub fn avg_seat_wait_minutes(&self) -> Option<f64> {
        (self.seat_wait_count > 0)
            .then(|| self.seat_wait_secs_sum as f64 / 60.0 / self.seat_wait_count as f64)
    }

    pub fn avg_ticket(&self) -> Option<f64> {
        (self.order_count > 0).then(|| self.revenue / self.order_count as f64)
    }
}

/// One fixed-width bucket for one location.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowBucket {
    pub location_id: String,
    pub location_name: String,
    pub bucket_start: i64,
    pub width_secs: i64,
    pub acc: Accumulators,
}

/// Sum of a location's buckets over a trailing window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationWindow {
    pub location_id: String,
    pub location_name: String,
    pub window_secs: i64,
    pub acc: Accumulators,
}

/// Top-K entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemRanking {
    pub item_id: String,
    pub item_name: String,
    pub category: String,
    pub total_quantity: u64,
    pub order_count: u64,
}

/// Rank items by quantity, then order count, then `item_id` ascending.
pub fn rank_items(totals: BTreeMap<String, ItemTally>, k: usize) -> Vec<ItemRanking> {
    let mut ranked: Vec<ItemRanking> = totals
        .into_iter()
        .map(|(item_id, tally)| ItemRanking {
            item_id,
            item_name: tally.item_name,
            category: tally.category,
            total_quantity: tally.quantity,
            order_count: tally.order_count,
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.total_quantity
            .cmp(&a.total_quantity)
            .then_with(|| b.order_count.cmp(&a.order_count))
            .then_with(|| a.item_id.cmp(&b.item_id))
    });
    ranked.truncate(k);
    ranked
}

/// Partition-local bucketed aggregator.
#[derive(Debug)]
pub struct WindowedAggregator {
    bucket_secs: i64,
    retention_secs: i64,
    buckets: HashMap<String, BTreeMap<i64, WindowBucket>>,
    dirty: BTreeSet<(String, i64)>,
}

impl WindowedAggregator {
    pub fn new(bucket_secs: i64, retention_secs: i64) -> Self {
        let bucket_secs = bucket_secs.max(1);
        Self {
            bucket_secs,
            retention_secs: retention_secs.max(WindowSize::max_secs()),
            buckets: HashMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    pub fn bucket_of(&self, ts: i64) -> i64 {
        ts.div_euclid(self.bucket_secs) * self.bucket_secs
    }

    fn is_retained(&self, bucket_start: i64, now: i64) -> bool {
        bucket_start + self.bucket_secs > now - self.retention_secs
    }

    fn bucket_mut(&mut self, location_id: &str, location_name: &str, bucket_start: i64) -> &mut Accumulators {
        self.dirty.insert((location_id.to_string(), bucket_start));
        let width_secs = self.bucket_secs;
        &mut self
            .buckets
            .entry(location_id.to_string())
            .or_default()
            .entry(bucket_start)
            .or_insert_with(|| WindowBucket {
                location_id: location_id.to_string(),
                location_name: location_name.to_string(),
                bucket_start,
                width_secs,
                acc: Accumulators::default(),
            })
            .acc
    }

    /// Apply an admitted event and its funnel delta.
    ///
    /// Returns `false` when the event's bucket is already past retention; the
    /// event then contributes to no window.
    pub fn apply(&mut self, event: &Event, update: &FunnelUpdate, now: i64) -> bool {
        let start = self.bucket_of(event.unix_ts());
        if !self.is_retained(start, now) {
            log::debug!(
                "Event {} at {} is older than window retention, not aggregated",
                event.event_id,
                event.timestamp
            );
            return false;
        }

        let newly = update.newly_completed;
        let acc = self.bucket_mut(&event.location_id, &event.location_name, start);

        if let Some(stage) = newly {
            acc.stage_counts[stage.index()] += 1;
        }

        match &event.payload {
            EventPayload::Payment(payment) => {
                acc.revenue += payment.total_amount;
                acc.tax += payment.tax;
                acc.tips += payment.tip;
                acc.order_count += 1;
            }
            EventPayload::OrderPlaced(order) if newly == Some(EventType::OrderPlaced) => {
                let mut seen_in_order = HashSet::new();
                for line in &order.items {
                    let tally = acc.items.entry(line.item_id.clone()).or_insert_with(|| ItemTally {
                        item_name: line.item_name.clone(),
                        category: line.category.clone(),
                        ..ItemTally::default()
                    });
                    tally.quantity += u64::from(line.quantity);
                    if seen_in_order.insert(line.item_id.as_str()) {
                        tally.order_count += 1;
                    }
                }
            }
            EventPayload::OrderCompleted(done) if newly == Some(EventType::OrderCompleted) => {
                acc.kitchen_minutes_sum += done.kitchen_time_minutes;
                acc.kitchen_count += 1;
            }
            _ => {}
        }

        if let Some((placed_at, secs)) = update.seat_wait {
            let wait_start = self.bucket_of(placed_at.timestamp());
            if self.is_retained(wait_start, now) {
                let acc = self.bucket_mut(&event.location_id, &event.location_name, wait_start);
                acc.seat_wait_secs_sum += secs;
                acc.seat_wait_count += 1;
            }
        }

        true
    }

    /// Per-location totals for the trailing `window_secs` ending at `now`.
    ///
    /// A bucket counts when its start lies in `[now - window_secs, now]`.
    pub fn location_windows(&self, window_secs: i64, now: i64) -> Vec<LocationWindow> {
        let window_secs = window_secs.max(0);
        let mut out: Vec<LocationWindow> = self
            .buckets
            .iter()
            .filter_map(|(location_id, buckets)| {
                let mut acc = Accumulators::default();
                let mut location_name = None;
                for (_, bucket) in buckets.range(now - window_secs..=now) {
                    location_name.get_or_insert_with(|| bucket.location_name.clone());
                    acc.merge(&bucket.acc);
                }
                location_name.map(|location_name| LocationWindow {
                    location_id: location_id.clone(),
                    location_name,
                    window_secs,
                    acc,
                })
            })
            .collect();
        out.sort_by(|a, b| a.location_id.cmp(&b.location_id));
        out
    }

    /// Item tallies over the window, optionally for one location only.
    pub fn item_totals(
        &self,
        window_secs: i64,
        now: i64,
        location_id: Option<&str>,
    ) -> BTreeMap<String, ItemTally> {
        let window_secs = window_secs.max(0);
        let mut totals: BTreeMap<String, ItemTally> = BTreeMap::new();
        for (loc, buckets) in &self.buckets {
            if location_id.map_or(false, |wanted| wanted != loc) {
                continue;
            }
            for (_, bucket) in buckets.range(now - window_secs..=now) {
                for (item_id, tally) in &bucket.acc.items {
                    totals.entry(item_id.clone()).or_default().merge(tally);
                }
            }
        }
        totals
    }

    pub fn top_items(&self, window_secs: i64, now: i64, k: usize) -> Vec<ItemRanking> {
        rank_items(self.item_totals(window_secs, now, None), k)
    }

    pub fn bucket(&self, location_id: &str, bucket_start: i64) -> Option<&WindowBucket> {
        self.buckets.get(location_id)?.get(&bucket_start)
    }

    /// Snapshot of buckets modified since the last call.
    pub fn take_dirty(&mut self) -> Vec<WindowBucket> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty
            .into_iter()
            .filter_map(|(loc, start)| self.bucket(&loc, start).cloned())
            .collect()
    }

    /// Drop buckets past retention. Idempotent; returns buckets removed.
    pub fn evict_expired(&mut self, now: i64) -> usize {
        let cutoff = now - self.retention_secs - self.bucket_secs;
        let mut removed = 0;
        for buckets in self.buckets.values_mut() {
            // Keep buckets starting after the cutoff.
            let kept = buckets.split_off(&(cutoff + 1));
            removed += buckets.len();
            *buckets = kept;
        }
        self.buckets.retain(|_, b| !b.is_empty());
        removed
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.values().map(|b| b.len()).sum()
    }

    pub fn bucket_secs(&self) -> i64 {
        self.bucket_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::correlator::FunnelCorrelator;
    use crate::pipeline::types::{LineItem, OrderPlaced, Payment};
    use chrono::DateTime;

    const T0: i64 = 1_700_000_040; // aligned to a 60s bucket

    fn line(item_id: &str, quantity: u32) -> LineItem {
        LineItem {
            item_id: item_id.to_string(),
            item_name: format!("Item {}", item_id),
            category: "Pizza".to_string(),
            unit_price: 10.0,
            quantity,
        }
    }

    fn event(id: &str, location: &str, ts: i64, payload: EventPayload) -> Event {
        Event {
            event_id: id.to_string(),
            timestamp: DateTime::from_timestamp(ts, 0).unwrap(),
            location_id: location.to_string(),
            location_name: format!("{} name", location),
            table_id: "table_01".to_string(),
            payload,
        }
    }

    fn order(id: &str, order_id: &str, ts: i64, items: Vec<LineItem>) -> Event {
        event(
            id,
            "rest_001",
            ts,
            EventPayload::OrderPlaced(OrderPlaced {
                order_id: order_id.to_string(),
                server_id: "server_1".to_string(),
                items,
                subtotal: 0.0,
            }),
        )
    }

    fn payment(id: &str, location: &str, order_id: &str, ts: i64, total: f64) -> Event {
        event(
            id,
            location,
            ts,
            EventPayload::Payment(Payment {
                order_id: order_id.to_string(),
                subtotal: total,
                tax: 0.0,
                tip: 0.0,
                total_amount: total,
                payment_method: "cash".to_string(),
            }),
        )
    }

    /// Correlate then aggregate, like the engine does.
    fn feed(agg: &mut WindowedAggregator, corr: &mut FunnelCorrelator, e: &Event, now: i64) -> bool {
        let update = corr.correlate(e, now);
        agg.apply(e, &update, now)
    }

    #[test]
    fn test_window_size_lookup() {
        for w in WindowSize::all() {
            assert_eq!(WindowSize::from_str(w.as_str()), Some(w));
        }
        assert_eq!(WindowSize::Min30.duration_secs(), 1_800);
    }

    #[test]
    fn test_bucket_of_floors_to_width() {
        let agg = WindowedAggregator::new(60, 4_200);
        assert_eq!(agg.bucket_of(T0 + 59), T0);
        assert_eq!(agg.bucket_of(T0 + 60), T0 + 60);
        assert_eq!(agg.bucket_of(-1), -60);
    }

    #[test]
    fn test_revenue_window_by_location() {
        let mut agg = WindowedAggregator::new(60, 4_200);
        let mut corr = FunnelCorrelator::new(10_800, 300);
        let now = T0 + 600;

        feed(&mut agg, &mut corr, &payment("p1", "rest_001", "a", T0 + 590, 65.55), now);
        feed(&mut agg, &mut corr, &payment("p2", "rest_001", "b", T0 + 300, 10.0), now);
        feed(&mut agg, &mut corr, &payment("p3", "rest_002", "c", T0 + 580, 5.0), now);
        // Outside the 5 minute window.
        feed(&mut agg, &mut corr, &payment("p4", "rest_001", "d", T0, 100.0), now);

        let windows = agg.location_windows(WindowSize::Min5.duration_secs(), now);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].location_id, "rest_001");
        assert!((windows[0].acc.revenue - 75.55).abs() < 1e-9);
        assert_eq!(windows[0].acc.order_count, 2);
        assert_eq!(windows[1].acc.order_count, 1);

        let hour = agg.location_windows(WindowSize::Hour1.duration_secs(), now);
        assert!((hour[0].acc.revenue - 175.55).abs() < 1e-9);
    }

    #[test]
    fn test_item_order_count_once_per_order() {
        let mut agg = WindowedAggregator::new(60, 4_200);
        let mut corr = FunnelCorrelator::new(10_800, 300);
        let now = T0 + 120;

        let e = order("o1", "A", T0 + 10, vec![line("pizza", 1), line("pizza", 2), line("tea", 1)]);
        feed(&mut agg, &mut corr, &e, now);
        // Retransmission of the same order reaches the aggregator as a no-op stage.
        feed(&mut agg, &mut corr, &e, now);

        let totals = agg.item_totals(300, now, None);
        assert_eq!(totals["pizza"].quantity, 3);
        assert_eq!(totals["pizza"].order_count, 1);
        assert_eq!(totals["tea"].quantity, 1);

        let bucket = agg.bucket("rest_001", T0).unwrap();
        assert_eq!(bucket.acc.stage_count(EventType::OrderPlaced), 1);
    }

    #[test]
    fn test_top_items_tie_break() {
        let mut totals = BTreeMap::new();
        let tally = |q, o| ItemTally {
            item_name: String::new(),
            category: String::new(),
            quantity: q,
            order_count: o,
        };
        totals.insert("b".to_string(), tally(5, 2));
        totals.insert("a".to_string(), tally(5, 2));
        totals.insert("c".to_string(), tally(5, 3));
        totals.insert("d".to_string(), tally(9, 1));
        totals.insert("e".to_string(), tally(1, 1));

        let ranked: Vec<String> = rank_items(totals, 4).into_iter().map(|r| r.item_id).collect();
        assert_eq!(ranked, vec!["d", "c", "a", "b"]);
    }

    #[test]
    fn test_late_event_updates_historical_bucket() {
        let mut agg = WindowedAggregator::new(60, 4_200);
        let mut corr = FunnelCorrelator::new(10_800, 300);

        feed(&mut agg, &mut corr, &payment("p1", "rest_001", "a", T0, 20.0), T0 + 5);
        let flushed = agg.take_dirty();
        assert_eq!(flushed.len(), 1);

        // Six minutes late, same bucket.
        let late_now = T0 + 360;
        assert!(feed(&mut agg, &mut corr, &payment("p2", "rest_001", "b", T0 + 30, 7.5), late_now));

        let dirty = agg.take_dirty();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].bucket_start, T0);
        assert!((dirty[0].acc.revenue - 27.5).abs() < 1e-9);

        let window = agg.location_windows(WindowSize::Min30.duration_secs(), late_now);
        assert!((window[0].acc.revenue - 27.5).abs() < 1e-9);
    }

    #[test]
    fn test_retention_and_eviction() {
        let mut agg = WindowedAggregator::new(60, 3_600);
        let mut corr = FunnelCorrelator::new(10_800, 300);
        let now = T0 + 10_000;

        assert!(!feed(&mut agg, &mut corr, &payment("old", "rest_001", "a", T0, 1.0), now));
        assert!(feed(&mut agg, &mut corr, &payment("new", "rest_001", "b", now - 30, 1.0), now));
        assert_eq!(agg.bucket_count(), 1);

        assert_eq!(agg.evict_expired(now + 3_600 + 120), 1);
        assert_eq!(agg.bucket_count(), 0);
        assert_eq!(agg.evict_expired(now + 3_600 + 120), 0);
    }

    #[test]
    fn test_conversion_rates() {
        let mut acc = Accumulators::default();
        acc.stage_counts = [10, 9, 9, 8];
        assert_eq!(acc.conversion(EventType::TableSeated, EventType::OrderPlaced), Some(0.9));
        assert_eq!(acc.conversion(EventType::TableSeated, EventType::Payment), Some(0.8));
        assert_eq!(Accumulators::default().conversion(EventType::TableSeated, EventType::Payment), None);
    }
}
