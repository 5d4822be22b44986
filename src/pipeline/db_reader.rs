//! Read-side queries over persisted window buckets
//!
//! The dashboard reads trailing windows straight from `window_buckets` and
//! `bucket_items`: a window is the set of buckets whose start lies in
//! `[now - window_secs, now]`, so every query is a range scan plus GROUP BY.

use super::error::SinkError;
use super::windows::ItemRanking;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RevenueRow {
    pub location_id: String,
    pub location_name: String,
    pub revenue: f64,
    pub tips: f64,
    pub order_count: i64,
}

impl RevenueRow {
    pub fn avg_ticket(&self) -> Option<f64> {
        (self.order_count > 0).then(|| self.revenue / self.order_count as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunnelRow {
    pub location_id: String,
    pub seated: i64,
    pub placed: i64,
    pub completed: i64,
    pub paid: i64,
}

impl FunnelRow {
    fn rate(to: i64, from: i64) -> Option<f64> {
        (from > 0).then(|| to as f64 / from as f64)
    }

    pub fn seat_to_order(&self) -> Option<f64> {
        Self::rate(self.placed, self.seated)
    }

    pub fn order_to_complete(&self) -> Option<f64> {
        Self::rate(self.completed, self.placed)
    }

    pub fn complete_to_pay(&self) -> Option<f64> {
        Self::rate(self.paid, self.completed)
    }

    pub fn seat_to_pay(&self) -> Option<f64> {
        Self::rate(self.paid, self.seated)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaitRow {
    pub location_id: String,
    pub avg_kitchen_minutes: Option<f64>,
    pub avg_seat_wait_minutes: Option<f64>,
}

/// Read-only connection to the servflow database.
pub struct StoreReader {
    conn: Connection,
}

impl StoreReader {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let conn = Connection::open(db_path)?;
        // Readers never take write locks on the sink's database.
        conn.execute_batch("PRAGMA query_only = ON")?;
        Ok(Self { conn })
    }

    /// Revenue and paid order count per location.
    pub fn revenue_by_location(&self, window_secs: i64, now: i64) -> Result<Vec<RevenueRow>, SinkError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT location_id, MAX(location_name), SUM(revenue), SUM(tips), SUM(order_count)
             FROM window_buckets
             WHERE bucket_start BETWEEN ?1 AND ?2
             GROUP BY location_id
             ORDER BY location_id",
        )?;
        let rows = stmt
            .query_map(params![now - window_secs, now], |row| {
                Ok(RevenueRow {
                    location_id: row.get(0)?,
                    location_name: row.get(1)?,
                    revenue: row.get(2)?,
                    tips: row.get(3)?,
                    order_count: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Stage counts per location; conversion rates come from `FunnelRow`.
    pub fn funnel_by_location(&self, window_secs: i64, now: i64) -> Result<Vec<FunnelRow>, SinkError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT location_id, SUM(seated_count), SUM(placed_count),
                    SUM(completed_count), SUM(paid_count)
             FROM window_buckets
             WHERE bucket_start BETWEEN ?1 AND ?2
             GROUP BY location_id
             ORDER BY location_id",
        )?;
        let rows = stmt
            .query_map(params![now - window_secs, now], |row| {
                Ok(FunnelRow {
                    location_id: row.get(0)?,
                    seated: row.get(1)?,
                    placed: row.get(2)?,
                    completed: row.get(3)?,
                    paid: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Top-K items by quantity (ties: order count, then item_id).
    pub fn top_items(&self, window_secs: i64, now: i64, k: usize) -> Result<Vec<ItemRanking>, SinkError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT item_id, MAX(item_name), MAX(category), SUM(quantity) AS qty, SUM(order_count) AS orders
             FROM bucket_items
             WHERE bucket_start BETWEEN ?1 AND ?2
             GROUP BY item_id
             ORDER BY qty DESC, orders DESC, item_id ASC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![now - window_secs, now, k as i64], |row| {
                Ok(ItemRanking {
                    item_id: row.get(0)?,
                    item_name: row.get(1)?,
                    category: row.get(2)?,
                    total_quantity: row.get::<_, i64>(3)?.max(0) as u64,
                    order_count: row.get::<_, i64>(4)?.max(0) as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn wait_times(&self, window_secs: i64, now: i64) -> Result<Vec<WaitRow>, SinkError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT location_id,
                    SUM(kitchen_minutes_sum) / NULLIF(SUM(kitchen_count), 0),
                    SUM(seat_wait_secs_sum) / 60.0 / NULLIF(SUM(seat_wait_count), 0)
             FROM window_buckets
             WHERE bucket_start BETWEEN ?1 AND ?2
             GROUP BY location_id
             ORDER BY location_id",
        )?;
        let rows = stmt
            .query_map(params![now - window_secs, now], |row| {
                Ok(WaitRow {
                    location_id: row.get(0)?,
                    avg_kitchen_minutes: row.get(1)?,
                    avg_seat_wait_minutes: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Dead-lettered record counts by reason code.
    pub fn dead_letter_counts(&self) -> Result<Vec<(String, i64)>, SinkError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT reason_code, COUNT(*) FROM dead_letter_events
             GROUP BY reason_code ORDER BY reason_code",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn raw_event_count(&self) -> Result<i64, SinkError> {
        Ok(self.conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?)
    }
}
