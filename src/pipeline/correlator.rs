//! Funnel correlation: stitches the four event types of a table visit into a
//! single evolving `FunnelRecord`.
//!
//! Keying:
//! - TableSeated keys provisionally by `(location_id, table_id)`.
//! - Any event carrying an `order_id` keys by `(location_id, table_id, order_id)`;
//!   the first such event absorbs the table's provisional record.
//!
//! Every stage is first-write-wins. A retransmission of an already recorded
//! stage is a no-op, so the final record does not depend on arrival order.

use super::types::{Event, EventPayload, EventType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Funnel record key. `order_id` is `None` while the record is provisional.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FunnelKey {
    pub location_id: String,
    pub table_id: String,
    pub order_id: Option<String>,
}

impl FunnelKey {
    fn provisional(table: &TableKey) -> Self {
        Self {
            location_id: table.location_id.clone(),
            table_id: table.table_id.clone(),
            order_id: None,
        }
    }

    fn order(table: &TableKey, order_id: &str) -> Self {
        Self {
            location_id: table.location_id.clone(),
            table_id: table.table_id.clone(),
            order_id: Some(order_id.to_string()),
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.order_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TableKey {
    location_id: String,
    table_id: String,
}

impl TableKey {
    fn of(event: &Event) -> Self {
        Self {
            location_id: event.location_id.clone(),
            table_id: event.table_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelStatus {
    /// Still live in the correlator (or snapshotted live at shutdown).
    Open,
    /// All four stages recorded.
    Complete,
    /// Lifetime or post-payment grace elapsed with stages missing.
    Expired,
    /// Provisional seating superseded by a new seating of the same table.
    Abandoned,
}

impl FunnelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunnelStatus::Open => "open",
            FunnelStatus::Complete => "complete",
            FunnelStatus::Expired => "expired",
            FunnelStatus::Abandoned => "abandoned",
        }
    }
}

/// Per-visit funnel state, exclusively owned by the correlator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunnelRecord {
    pub key: FunnelKey,
    pub location_name: String,
    pub seated_at: Option<DateTime<Utc>>,
    pub order_placed_at: Option<DateTime<Utc>>,
    pub order_completed_at: Option<DateTime<Utc>>,
    pub payment_at: Option<DateTime<Utc>>,
    pub party_size: Option<u32>,
    pub server_id: Option<String>,
    pub order_subtotal: Option<f64>,
    pub item_count: Option<u32>,
    pub kitchen_time_minutes: Option<f64>,
    pub payment_method: Option<String>,
    pub tip: Option<f64>,
    pub revenue_total: Option<f64>,
    pub status: FunnelStatus,
    /// Processing time the record was created (Unix seconds).
    pub first_seen: i64,
    pub finalized_at: Option<i64>,
    #[serde(skip)]
    stage_event_ids: [Option<String>; 4],
    #[serde(skip)]
    payment_seen_at: Option<i64>,
}

impl FunnelRecord {
    fn new(key: FunnelKey, location_name: &str, now: i64) -> Self {
        Self {
            key,
            location_name: location_name.to_string(),
            seated_at: None,
            order_placed_at: None,
            order_completed_at: None,
            payment_at: None,
            party_size: None,
            server_id: None,
            order_subtotal: None,
            item_count: None,
            kitchen_time_minutes: None,
            payment_method: None,
            tip: None,
            revenue_total: None,
            status: FunnelStatus::Open,
            first_seen: now,
            finalized_at: None,
            stage_event_ids: Default::default(),
            payment_seen_at: None,
        }
    }

    pub fn stage_at(&self, stage: EventType) -> Option<DateTime<Utc>> {
        match stage {
            EventType::TableSeated => self.seated_at,
            EventType::OrderPlaced => self.order_placed_at,
            EventType::OrderCompleted => self.order_completed_at,
            EventType::Payment => self.payment_at,
        }
    }

    fn stage_slot(&mut self, stage: EventType) -> &mut Option<DateTime<Utc>> {
        match stage {
            EventType::TableSeated => &mut self.seated_at,
            EventType::OrderPlaced => &mut self.order_placed_at,
            EventType::OrderCompleted => &mut self.order_completed_at,
            EventType::Payment => &mut self.payment_at,
        }
    }

    pub fn has_stage(&self, stage: EventType) -> bool {
        self.stage_at(stage).is_some()
    }

    /// Highest stage reached.
    pub fn stage(&self) -> Option<EventType> {
        EventType::all()
            .into_iter()
            .rev()
            .find(|s| self.has_stage(*s))
    }

    pub fn is_complete(&self) -> bool {
        EventType::all().iter().all(|s| self.has_stage(*s))
    }

    pub fn missing_stages(&self) -> Vec<EventType> {
        EventType::all()
            .into_iter()
            .filter(|s| !self.has_stage(*s))
            .collect()
    }

    /// Seconds between seating and order, once both are known.
    pub fn seat_to_order_secs(&self) -> Option<i64> {
        match (self.seated_at, self.order_placed_at) {
            (Some(seated), Some(placed)) => Some((placed - seated).num_seconds()),
            _ => None,
        }
    }

    /// Earliest recorded event time among all stages.
    fn earliest_stage_at(&self) -> Option<DateTime<Utc>> {
        EventType::all()
            .into_iter()
            .filter_map(|s| self.stage_at(s))
            .min()
    }

    fn stage_event_id(&self, stage: EventType) -> Option<&str> {
        self.stage_event_ids[stage.index()].as_deref()
    }

    fn record_stage(&mut self, event: &Event) -> StageWrite {
        let stage = event.event_type();
        match self.stage_event_id(stage) {
            Some(id) if id == event.event_id => return StageWrite::Duplicate,
            Some(_) => return StageWrite::Conflict,
            None => {}
        }

        self.stage_event_ids[stage.index()] = Some(event.event_id.clone());
        *self.stage_slot(stage) = Some(event.timestamp);

        match &event.payload {
            EventPayload::TableSeated(seated) => {
                self.party_size = Some(seated.party_size);
                if self.server_id.is_none() {
                    self.server_id = Some(seated.server_id.clone());
                }
            }
            EventPayload::OrderPlaced(order) => {
                // The server who took the order wins over the seating host.
                self.server_id = Some(order.server_id.clone());
                self.order_subtotal = Some(order.subtotal);
                self.item_count = Some(order.items.iter().map(|i| i.quantity).sum());
            }
            EventPayload::OrderCompleted(done) => {
                self.kitchen_time_minutes = Some(done.kitchen_time_minutes);
            }
            EventPayload::Payment(payment) => {
                self.revenue_total = Some(payment.total_amount);
                self.tip = Some(payment.tip);
                self.payment_method = Some(payment.payment_method.clone());
            }
        }

        StageWrite::Recorded
    }

    fn finalize(&mut self, status: FunnelStatus, now: i64) {
        self.status = status;
        self.finalized_at = Some(now);
    }
}

enum StageWrite {
    Recorded,
    Duplicate,
    Conflict,
}

/// Cross-event inconsistency. Recorded and reported, never rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrelationAnomaly {
    /// A stage was recorded before its predecessor stage.
    MissingPredecessor { stage: EventType, missing: EventType },
    /// A different event already claimed this stage for the key; ignored.
    ConflictingStage { stage: EventType, event_id: String },
}

/// Result of correlating one event.
#[derive(Debug, Clone, PartialEq)]
pub struct FunnelUpdate {
    pub key: FunnelKey,
    /// Record state after this event.
    pub record: FunnelRecord,
    /// Stage this event newly filled; `None` for duplicates and conflicts.
    pub newly_completed: Option<EventType>,
    /// Seat-to-order wait (seconds, bucketed at order time) that became known
    /// with this event.
    pub seat_wait: Option<(DateTime<Utc>, i64)>,
    pub anomaly: Option<CorrelationAnomaly>,
    /// True when this event closed the record (all stages filled).
    pub finalized: bool,
}

/// Partition-local funnel correlator.
#[derive(Debug)]
pub struct FunnelCorrelator {
    records: HashMap<FunnelKey, FunnelRecord>,
    /// Live order ids per table, used to attach late seatings.
    table_orders: HashMap<TableKey, Vec<String>>,
    max_lifetime_secs: i64,
    payment_grace_secs: i64,
    finalized: Vec<FunnelRecord>,
}

impl FunnelCorrelator {
    /// * `max_lifetime_secs` - records older than this (processing time) expire
    /// * `payment_grace_secs` - how long a paid but incomplete record waits for
    ///   late predecessors
    pub fn new(max_lifetime_secs: i64, payment_grace_secs: i64) -> Self {
        Self {
            records: HashMap::new(),
            table_orders: HashMap::new(),
            max_lifetime_secs,
            payment_grace_secs,
            finalized: Vec::new(),
        }
    }

    /// Fold one admitted event into funnel state.
    pub fn correlate(&mut self, event: &Event, now: i64) -> FunnelUpdate {
        let table = TableKey::of(event);
        let stage = event.event_type();

        let mut record = match event.order_id() {
            Some(order_id) => self.take_order_record(&table, order_id, event, now),
            None => self.take_seating_record(&table, event, now),
        };

        let mut newly_completed = None;
        let mut anomaly = None;
        let mut seat_wait = None;

        match record.record_stage(event) {
            StageWrite::Recorded => {
                newly_completed = Some(stage);

                if stage == EventType::Payment {
                    record.payment_seen_at = Some(now);
                }

                if stage.index() > 0 {
                    let previous = EventType::all()[stage.index() - 1];
                    if !record.has_stage(previous) {
                        anomaly = Some(CorrelationAnomaly::MissingPredecessor {
                            stage,
                            missing: previous,
                        });
                    }
                }

                if matches!(stage, EventType::TableSeated | EventType::OrderPlaced) {
                    if let (Some(secs), Some(placed)) =
                        (record.seat_to_order_secs(), record.order_placed_at)
                    {
                        if secs >= 0 {
                            seat_wait = Some((placed, secs));
                        }
                    }
                }
            }
            StageWrite::Duplicate => {
                log::trace!("Stage {} already recorded by {}", stage, event.event_id);
            }
            StageWrite::Conflict => {
                anomaly = Some(CorrelationAnomaly::ConflictingStage {
                    stage,
                    event_id: event.event_id.clone(),
                });
            }
        }

        if let Some(ref a) = anomaly {
            log::debug!("Correlation anomaly for {:?}: {:?}", record.key, a);
        }

        let key = record.key.clone();
        let finalized = record.is_complete();

        if finalized {
            record.finalize(FunnelStatus::Complete, now);
            self.unregister(&key);
            self.finalized.push(record.clone());
        } else {
            self.records.insert(key.clone(), record.clone());
        }

        FunnelUpdate {
            key,
            record,
            newly_completed,
            seat_wait,
            anomaly,
            finalized,
        }
    }

    /// Order-keyed record for `order_id`, absorbing the table's provisional
    /// record when this is the first event naming the order.
    fn take_order_record(
        &mut self,
        table: &TableKey,
        order_id: &str,
        event: &Event,
        now: i64,
    ) -> FunnelRecord {
        let key = FunnelKey::order(table, order_id);
        if let Some(record) = self.records.remove(&key) {
            return record;
        }

        let provisional = FunnelKey::provisional(table);
        let absorbs = self
            .records
            .get(&provisional)
            .and_then(|r| r.seated_at)
            .map_or(false, |seated| seated <= event.timestamp);

        self.register(table, order_id);

        if absorbs {
            if let Some(mut record) = self.records.remove(&provisional) {
                log::trace!("Re-keying {:?} -> order {}", provisional, order_id);
                record.key = key;
                return record;
            }
        }

        FunnelRecord::new(key, &event.location_name, now)
    }

    /// Record for a TableSeated event: a live order of this table still
    /// waiting for its seating, else the provisional record.
    fn take_seating_record(&mut self, table: &TableKey, event: &Event, now: i64) -> FunnelRecord {
        if let Some(key) = self.unseated_order_for(table, event.timestamp) {
            if let Some(record) = self.records.remove(&key) {
                return record;
            }
        }

        let provisional = FunnelKey::provisional(table);
        match self.records.remove(&provisional) {
            Some(mut previous)
                if previous
                    .stage_event_id(EventType::TableSeated)
                    .map_or(false, |id| id != event.event_id) =>
            {
                log::debug!(
                    "Table {}/{} re-seated; closing previous seating without order",
                    table.location_id,
                    table.table_id
                );
                previous.finalize(FunnelStatus::Abandoned, now);
                self.finalized.push(previous);
                FunnelRecord::new(provisional, &event.location_name, now)
            }
            Some(record) => record,
            None => FunnelRecord::new(provisional, &event.location_name, now),
        }
    }

    /// Unseated live order on `table` whose earliest stage is closest to (and
    /// not before) `seated_at`.
    fn unseated_order_for(&self, table: &TableKey, seated_at: DateTime<Utc>) -> Option<FunnelKey> {
        self.table_orders
            .get(table)?
            .iter()
            .map(|order_id| FunnelKey::order(table, order_id))
            .filter_map(|key| {
                let record = self.records.get(&key)?;
                if record.seated_at.is_some() {
                    return None;
                }
                let earliest = record.earliest_stage_at()?;
                (earliest >= seated_at).then_some((earliest, key))
            })
            .min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
            .map(|(_, key)| key)
    }

    fn register(&mut self, table: &TableKey, order_id: &str) {
        let orders = self.table_orders.entry(table.clone()).or_default();
        if !orders.iter().any(|o| o == order_id) {
            orders.push(order_id.to_string());
        }
    }

    fn unregister(&mut self, key: &FunnelKey) {
        let Some(order_id) = key.order_id.as_deref() else {
            return;
        };
        let table = TableKey {
            location_id: key.location_id.clone(),
            table_id: key.table_id.clone(),
        };
        if let Some(orders) = self.table_orders.get_mut(&table) {
            orders.retain(|o| o != order_id);
            if orders.is_empty() {
                self.table_orders.remove(&table);
            }
        }
    }

    /// Expire records past their lifetime, and paid records whose grace for
    /// late predecessors has run out. Returns the number expired.
    pub fn evict_expired(&mut self, now: i64) -> usize {
        let expired: Vec<FunnelKey> = self
            .records
            .iter()
            .filter(|(_, r)| {
                now - r.first_seen > self.max_lifetime_secs
                    || r.payment_seen_at
                        .map_or(false, |paid| now - paid >= self.payment_grace_secs)
            })
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            if let Some(mut record) = self.records.remove(key) {
                self.unregister(key);
                log::debug!(
                    "Funnel {:?} expired at stage {:?}, missing {:?}",
                    key,
                    record.stage(),
                    record.missing_stages()
                );
                record.finalize(FunnelStatus::Expired, now);
                self.finalized.push(record);
            }
        }

        expired.len()
    }

    /// Records closed since the last call, ready to be flushed.
    pub fn take_finalized(&mut self) -> Vec<FunnelRecord> {
        std::mem::take(&mut self.finalized)
    }

    /// Snapshot every live record as `Open` and clear live state (shutdown).
    pub fn drain_open(&mut self) -> Vec<FunnelRecord> {
        self.table_orders.clear();
        let mut open: Vec<FunnelRecord> = self.records.drain().map(|(_, r)| r).collect();
        open.sort_by(|a, b| a.key.cmp(&b.key));
        open
    }

    pub fn get(&self, key: &FunnelKey) -> Option<&FunnelRecord> {
        self.records.get(key)
    }

    pub fn live_count(&self) -> usize {
        self.records.len()
    }
}
