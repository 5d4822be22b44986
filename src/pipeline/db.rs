//! Sink adapter: durable storage for raw events and derived rows
//!
//! Tables written (see `/sql/` directory):
//! - `events` - INSERT OR IGNORE on event_id (raw, audit + analytics)
//! - `dead_letter_events` - INSERT (append-only rejects)
//! - `funnels` - UPSERT on funnel_id
//! - `window_buckets` / `bucket_items` - UPSERT snapshots of dirty buckets

use super::correlator::FunnelRecord;
use super::error::SinkError;
use super::types::{RejectedEvent, StoredEvent};
use super::windows::WindowBucket;
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Schema files, applied in order. Every statement is `IF NOT EXISTS`.
const SCHEMA: [(&str, &str); 4] = [
    ("01_events.sql", include_str!("../../sql/01_events.sql")),
    ("02_dead_letter.sql", include_str!("../../sql/02_dead_letter.sql")),
    ("03_funnels.sql", include_str!("../../sql/03_funnels.sql")),
    ("04_window_buckets.sql", include_str!("../../sql/04_window_buckets.sql")),
];

/// Storage boundary consumed by the pipeline.
///
/// Every operation must be safe to repeat with the same batch: a retried
/// flush re-sends rows that may already have landed.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Insert validated events, ignoring event_ids already stored.
    /// Returns the number of new rows.
    async fn persist_raw(&self, batch: &[StoredEvent]) -> Result<usize, SinkError>;

    /// Append dead-lettered records.
    async fn persist_rejected(&self, batch: &[RejectedEvent]) -> Result<usize, SinkError>;

    /// Upsert funnel records by key.
    async fn persist_funnels(&self, batch: &[FunnelRecord]) -> Result<usize, SinkError>;

    /// Upsert bucket snapshots (and their item rows) by `(location_id, bucket_start)`.
    async fn persist_buckets(&self, batch: &[WindowBucket]) -> Result<usize, SinkError>;
}

/// Run schema migrations from the embedded SQL files
///
/// Enables WAL mode, then executes each file in name order.
pub fn run_schema_migrations(conn: &Connection) -> Result<(), SinkError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    log::info!("📊 Enabled WAL mode for SQLite database");

    for (filename, sql) in SCHEMA {
        log::debug!("   ├─ Executing: {}", filename);
        conn.execute_batch(sql)?;
    }

    log::info!("✅ Schema migrations completed ({} files)", SCHEMA.len());
    Ok(())
}

/// Stable row key for a funnel record.
pub fn funnel_id(record: &FunnelRecord) -> String {
    let key = &record.key;
    match &key.order_id {
        Some(order_id) => format!("{}:{}:{}", key.location_id, key.table_id, order_id),
        None => format!(
            "{}:{}:seated@{}",
            key.location_id,
            key.table_id,
            record.seated_at.map_or(record.first_seen, |t| t.timestamp())
        ),
    }
}

/// SQLite implementation of EventSink
pub struct SqliteEventSink {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEventSink {
    /// Open (or create) the database at `db_path` and apply the schema.
    pub fn open(db_path: &str) -> Result<Self, SinkError> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SinkError::Unavailable(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }

        let conn = Connection::open(db_path)?;
        run_schema_migrations(&conn)?;
        log::info!("💾 SQLite sink ready: {}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, SinkError> {
        self.conn
            .lock()
            .map_err(|_| SinkError::Unavailable("connection lock poisoned".to_string()))
    }
}

fn ts(t: Option<chrono::DateTime<chrono::Utc>>) -> Option<i64> {
    t.map(|t| t.timestamp())
}

#[async_trait]
impl EventSink for SqliteEventSink {
    async fn persist_raw(&self, batch: &[StoredEvent]) -> Result<usize, SinkError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT OR IGNORE INTO events (
                    event_id, event_type, event_ts, location_id, location_name,
                    table_id, order_id, partition_id, ingested_at, payload_json
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )?;
            for stored in batch {
                let event = &stored.event;
                inserted += stmt.execute(params![
                    event.event_id,
                    event.event_type().as_str(),
                    event.unix_ts(),
                    event.location_id,
                    event.location_name,
                    event.table_id,
                    event.order_id(),
                    stored.partition as i64,
                    stored.ingested_at,
                    serde_json::to_string(event)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    async fn persist_rejected(&self, batch: &[RejectedEvent]) -> Result<usize, SinkError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO dead_letter_events (reason_code, reason, raw_payload, rejected_at)
                 VALUES (?, ?, ?, ?)",
            )?;
            for rejected in batch {
                stmt.execute(params![
                    rejected.reason.code(),
                    rejected.reason.to_string(),
                    rejected.raw_payload,
                    rejected.rejected_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(batch.len())
    }

    async fn persist_funnels(&self, batch: &[FunnelRecord]) -> Result<usize, SinkError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT INTO funnels (
                    funnel_id, location_id, location_name, table_id, order_id,
                    seated_at, order_placed_at, order_completed_at, payment_at,
                    party_size, server_id, order_subtotal, item_count,
                    kitchen_time_minutes, payment_method, tip, revenue_total,
                    stage, status, missing_stages, first_seen, finalized_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(funnel_id) DO UPDATE SET
                    location_name = excluded.location_name,
                    seated_at = excluded.seated_at,
                    order_placed_at = excluded.order_placed_at,
                    order_completed_at = excluded.order_completed_at,
                    payment_at = excluded.payment_at,
                    party_size = excluded.party_size,
                    server_id = excluded.server_id,
                    order_subtotal = excluded.order_subtotal,
                    item_count = excluded.item_count,
                    kitchen_time_minutes = excluded.kitchen_time_minutes,
                    payment_method = excluded.payment_method,
                    tip = excluded.tip,
                    revenue_total = excluded.revenue_total,
                    stage = excluded.stage,
                    status = excluded.status,
                    missing_stages = excluded.missing_stages,
                    finalized_at = excluded.finalized_at
                "#,
            )?;
            for record in batch {
                let missing: Vec<&str> = record.missing_stages().iter().map(|s| s.as_str()).collect();
                stmt.execute(params![
                    funnel_id(record),
                    record.key.location_id,
                    record.location_name,
                    record.key.table_id,
                    record.key.order_id,
                    ts(record.seated_at),
                    ts(record.order_placed_at),
                    ts(record.order_completed_at),
                    ts(record.payment_at),
                    record.party_size,
                    record.server_id,
                    record.order_subtotal,
                    record.item_count,
                    record.kitchen_time_minutes,
                    record.payment_method,
                    record.tip,
                    record.revenue_total,
                    record.stage().map(|s| s.as_str()),
                    record.status.as_str(),
                    missing.join(","),
                    record.first_seen,
                    record.finalized_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(batch.len())
    }

    async fn persist_buckets(&self, batch: &[WindowBucket]) -> Result<usize, SinkError> {
        let now = chrono::Utc::now().timestamp();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut bucket_stmt = tx.prepare_cached(
                r#"
                INSERT INTO window_buckets (
                    location_id, bucket_start, width_secs, location_name,
                    revenue, tax, tips, order_count,
                    seated_count, placed_count, completed_count, paid_count,
                    kitchen_minutes_sum, kitchen_count, seat_wait_secs_sum, seat_wait_count,
                    updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(location_id, bucket_start) DO UPDATE SET
                    width_secs = excluded.width_secs,
                    location_name = excluded.location_name,
                    revenue = excluded.revenue,
                    tax = excluded.tax,
                    tips = excluded.tips,
                    order_count = excluded.order_count,
                    seated_count = excluded.seated_count,
                    placed_count = excluded.placed_count,
                    completed_count = excluded.completed_count,
                    paid_count = excluded.paid_count,
                    kitchen_minutes_sum = excluded.kitchen_minutes_sum,
                    kitchen_count = excluded.kitchen_count,
                    seat_wait_secs_sum = excluded.seat_wait_secs_sum,
                    seat_wait_count = excluded.seat_wait_count,
                    updated_at = excluded.updated_at
                "#,
            )?;
            let mut item_stmt = tx.prepare_cached(
                r#"
                INSERT INTO bucket_items (
                    location_id, bucket_start, item_id, item_name, category, quantity, order_count
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(location_id, bucket_start, item_id) DO UPDATE SET
                    item_name = excluded.item_name,
                    category = excluded.category,
                    quantity = excluded.quantity,
                    order_count = excluded.order_count
                "#,
            )?;

            for bucket in batch {
                let acc = &bucket.acc;
                bucket_stmt.execute(params![
                    bucket.location_id,
                    bucket.bucket_start,
                    bucket.width_secs,
                    bucket.location_name,
                    acc.revenue,
                    acc.tax,
                    acc.tips,
                    acc.order_count as i64,
                    acc.stage_counts[0] as i64,
                    acc.stage_counts[1] as i64,
                    acc.stage_counts[2] as i64,
                    acc.stage_counts[3] as i64,
                    acc.kitchen_minutes_sum,
                    acc.kitchen_count as i64,
                    acc.seat_wait_secs_sum,
                    acc.seat_wait_count as i64,
                    now,
                ])?;
                for (item_id, tally) in &acc.items {
                    item_stmt.execute(params![
                        bucket.location_id,
                        bucket.bucket_start,
                        item_id,
                        tally.item_name,
                        tally.category,
                        tally.quantity as i64,
                        tally.order_count as i64,
                    ])?;
                }
            }
        }
        tx.commit()?;
        Ok(batch.len())
    }
}

/// In-memory sink with the same idempotency rules as SQLite.
///
/// `fail_next(n)` makes the next `n` calls return `SinkError::Unavailable`,
/// which is how outage behaviour is exercised in tests.
#[derive(Default)]
pub struct MemoryEventSink {
    state: Mutex<MemoryState>,
    failures_left: AtomicU32,
}

#[derive(Default, Clone)]
pub struct MemoryState {
    pub raw: HashMap<String, StoredEvent>,
    pub rejected: Vec<RejectedEvent>,
    pub funnels: HashMap<String, FunnelRecord>,
    pub buckets: HashMap<(String, i64), WindowBucket>,
    pub calls: usize,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Copy of everything stored so far.
    pub fn snapshot(&self) -> MemoryState {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn guard(&self) -> Result<MutexGuard<'_, MemoryState>, SinkError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SinkError::Unavailable("simulated outage".to_string()));
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| SinkError::Unavailable("state lock poisoned".to_string()))?;
        state.calls += 1;
        Ok(state)
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn persist_raw(&self, batch: &[StoredEvent]) -> Result<usize, SinkError> {
        let mut state = self.guard()?;
        let mut inserted = 0;
        for stored in batch {
            if !state.raw.contains_key(&stored.event.event_id) {
                state.raw.insert(stored.event.event_id.clone(), stored.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn persist_rejected(&self, batch: &[RejectedEvent]) -> Result<usize, SinkError> {
        let mut state = self.guard()?;
        state.rejected.extend_from_slice(batch);
        Ok(batch.len())
    }

    async fn persist_funnels(&self, batch: &[FunnelRecord]) -> Result<usize, SinkError> {
        let mut state = self.guard()?;
        for record in batch {
            state.funnels.insert(funnel_id(record), record.clone());
        }
        Ok(batch.len())
    }

    async fn persist_buckets(&self, batch: &[WindowBucket]) -> Result<usize, SinkError> {
        let mut state = self.guard()?;
        for bucket in batch {
            state
                .buckets
                .insert((bucket.location_id.clone(), bucket.bucket_start), bucket.clone());
        }
        Ok(batch.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::correlator::FunnelCorrelator;
    use crate::pipeline::error::RejectReason;
    use crate::pipeline::types::{Event, EventPayload, Payment, TableSeated};
    use crate::pipeline::windows::WindowedAggregator;
    use chrono::DateTime;
    use tempfile::TempDir;

    const T0: i64 = 1_709_316_000;

    fn create_test_sink() -> (TempDir, SqliteEventSink, String) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/servflow.db");
        let path = path.to_str().unwrap().to_string();
        let sink = SqliteEventSink::open(&path).unwrap();
        (dir, sink, path)
    }

    fn payment(id: &str, ts: i64, total: f64) -> Event {
        Event {
            event_id: id.to_string(),
            timestamp: DateTime::from_timestamp(ts, 0).unwrap(),
            location_id: "rest_002".to_string(),
            location_name: "Westside Location".to_string(),
            table_id: "table_11".to_string(),
            payload: EventPayload::Payment(Payment {
                order_id: "order_9".to_string(),
                subtotal: total,
                tax: 0.0,
                tip: 0.0,
                total_amount: total,
                payment_method: "cash".to_string(),
            }),
        }
    }

    fn stored(event: Event) -> StoredEvent {
        StoredEvent {
            event,
            partition: 1,
            ingested_at: T0,
        }
    }

    #[tokio::test]
    async fn test_raw_insert_is_idempotent() {
        let (_dir, sink, path) = create_test_sink();
        let batch = vec![stored(payment("p1", T0, 10.0)), stored(payment("p2", T0, 5.0))];

        assert_eq!(sink.persist_raw(&batch).await.unwrap(), 2);
        // A retried flush re-sends the same rows.
        assert_eq!(sink.persist_raw(&batch).await.unwrap(), 0);

        let conn = Connection::open(&path).unwrap();
        let (count, order_id): (i64, String) = conn
            .query_row(
                "SELECT COUNT(*), MAX(order_id) FROM events WHERE event_type = 'payment'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(order_id, "order_9");
    }

    #[tokio::test]
    async fn test_dead_letter_rows_keep_reason_code() {
        let (_dir, sink, path) = create_test_sink();
        let rejected = RejectedEvent {
            reason: RejectReason::MissingField("event_type".to_string()),
            raw_payload: "{\"event_id\":\"x\"}".to_string(),
            rejected_at: T0,
        };
        sink.persist_rejected(&[rejected]).await.unwrap();

        let conn = Connection::open(&path).unwrap();
        let code: String = conn
            .query_row("SELECT reason_code FROM dead_letter_events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(code, "missing_field");
    }

    #[tokio::test]
    async fn test_bucket_upsert_replaces_snapshot() {
        let (_dir, sink, path) = create_test_sink();
        let mut corr = FunnelCorrelator::new(10_800, 300);
        let mut agg = WindowedAggregator::new(60, 4_200);

        let first = payment("p1", T0, 10.0);
        let u = corr.correlate(&first, T0);
        agg.apply(&first, &u, T0);
        sink.persist_buckets(&agg.take_dirty()).await.unwrap();

        let late = Event {
            payload: EventPayload::Payment(Payment {
                order_id: "order_10".to_string(),
                subtotal: 4.5,
                tax: 0.0,
                tip: 0.0,
                total_amount: 4.5,
                payment_method: "cash".to_string(),
            }),
            ..payment("p2", T0 + 20, 0.0)
        };
        let u = corr.correlate(&late, T0 + 400);
        agg.apply(&late, &u, T0 + 400);
        sink.persist_buckets(&agg.take_dirty()).await.unwrap();

        let conn = Connection::open(&path).unwrap();
        let (rows, revenue, orders): (i64, f64, i64) = conn
            .query_row(
                "SELECT COUNT(*), SUM(revenue), SUM(order_count) FROM window_buckets",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(rows, 1);
        assert!((revenue - 14.5).abs() < 1e-9);
        assert_eq!(orders, 2);
    }

    #[tokio::test]
    async fn test_funnel_upsert_and_seating_ids() {
        let (_dir, sink, path) = create_test_sink();
        let mut corr = FunnelCorrelator::new(10_800, 300);

        let seat = |id: &str, ts: i64| Event {
            event_id: id.to_string(),
            timestamp: DateTime::from_timestamp(ts, 0).unwrap(),
            location_id: "rest_002".to_string(),
            location_name: "Westside Location".to_string(),
            table_id: "table_11".to_string(),
            payload: EventPayload::TableSeated(TableSeated {
                party_size: 2,
                server_id: "server_300".to_string(),
            }),
        };
        corr.correlate(&seat("s1", T0), T0);
        corr.correlate(&seat("s2", T0 + 600), T0 + 600);
        let mut records = corr.take_finalized();
        records.extend(corr.drain_open());
        assert_eq!(records.len(), 2);

        sink.persist_funnels(&records).await.unwrap();
        sink.persist_funnels(&records).await.unwrap();

        let conn = Connection::open(&path).unwrap();
        let mut stmt = conn
            .prepare("SELECT status, missing_stages FROM funnels ORDER BY seated_at")
            .unwrap();
        let rows: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            rows,
            vec![
                ("abandoned".to_string(), "order_placed,order_completed,payment".to_string()),
                ("open".to_string(), "order_placed,order_completed,payment".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_memory_sink_simulated_outage() {
        let sink = MemoryEventSink::new();
        sink.fail_next(2);
        let batch = vec![stored(payment("p1", T0, 1.0))];

        assert!(sink.persist_raw(&batch).await.is_err());
        assert!(sink.persist_raw(&batch).await.is_err());
        assert_eq!(sink.persist_raw(&batch).await.unwrap(), 1);
        assert_eq!(sink.persist_raw(&batch).await.unwrap(), 0);
        assert_eq!(sink.snapshot().raw.len(), 1);
    }
}
