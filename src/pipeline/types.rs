//! Core event types shared by every pipeline stage
//!
//! Raw JSON never travels past the validator: everything downstream works on
//! the closed `Event` / `EventPayload` union defined here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Restaurant operational event type.
///
/// Ordering follows the logical service funnel, so `Ord` doubles as
/// "stage progression" (TableSeated < OrderPlaced < OrderCompleted < Payment).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TableSeated,
    OrderPlaced,
    OrderCompleted,
    Payment,
}

/// A funnel stage is one of the four event types, in progression order.
pub type FunnelStage = EventType;

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TableSeated => "table_seated",
            EventType::OrderPlaced => "order_placed",
            EventType::OrderCompleted => "order_completed",
            EventType::Payment => "payment",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "table_seated" => Some(EventType::TableSeated),
            "order_placed" => Some(EventType::OrderPlaced),
            "order_completed" => Some(EventType::OrderCompleted),
            "payment" => Some(EventType::Payment),
            _ => None,
        }
    }

    /// Position in the funnel, 0-based. Used to index per-stage counters.
    pub fn index(&self) -> usize {
        match self {
            EventType::TableSeated => 0,
            EventType::OrderPlaced => 1,
            EventType::OrderCompleted => 2,
            EventType::Payment => 3,
        }
    }

    pub fn all() -> [EventType; 4] {
        [
            EventType::TableSeated,
            EventType::OrderPlaced,
            EventType::OrderCompleted,
            EventType::Payment,
        ]
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub item_id: String,
    pub item_name: String,
    pub category: String,
    #[serde(alias = "price")]
    pub unit_price: f64,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSeated {
    pub party_size: u32,
    pub server_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: String,
    pub server_id: String,
    pub items: Vec<LineItem>,
    pub subtotal: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCompleted {
    pub order_id: String,
    pub kitchen_time_minutes: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub order_id: String,
    pub subtotal: f64,
    pub tax: f64,
    pub tip: f64,
    pub total_amount: f64,
    pub payment_method: String,
}

/// Variant-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    TableSeated(TableSeated),
    OrderPlaced(OrderPlaced),
    OrderCompleted(OrderCompleted),
    Payment(Payment),
}

/// Validated, immutable restaurant event.
///
/// Two events with equal `event_id` are the same logical occurrence no matter
/// what else differs between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub location_id: String,
    pub location_name: String,
    pub table_id: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self.payload {
            EventPayload::TableSeated(_) => EventType::TableSeated,
            EventPayload::OrderPlaced(_) => EventType::OrderPlaced,
            EventPayload::OrderCompleted(_) => EventType::OrderCompleted,
            EventPayload::Payment(_) => EventType::Payment,
        }
    }

    /// Order id carried by the event, if the variant has one.
    pub fn order_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::TableSeated(_) => None,
            EventPayload::OrderPlaced(p) => Some(&p.order_id),
            EventPayload::OrderCompleted(p) => Some(&p.order_id),
            EventPayload::Payment(p) => Some(&p.order_id),
        }
    }

    /// Event time as Unix seconds.
    pub fn unix_ts(&self) -> i64 {
        self.timestamp.timestamp()
    }
}

/// An event that failed validation, kept verbatim for the dead-letter path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedEvent {
    pub reason: crate::pipeline::error::RejectReason,
    pub raw_payload: String,
    /// Processing time the record was rejected at (Unix seconds).
    pub rejected_at: i64,
}

/// Validated event plus ingestion metadata, as handed to the raw-events sink.
///
/// The sink keys rows on `event.event_id` with insert-or-ignore semantics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredEvent {
    pub event: Event,
    pub partition: usize,
    pub ingested_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_round_trip_names() {
        for t in EventType::all() {
            assert_eq!(EventType::from_str(t.as_str()), Some(t));
        }
        assert_eq!(EventType::from_str("refund"), None);
    }

    #[test]
    fn test_stage_progression_order() {
        assert!(EventType::TableSeated < EventType::OrderPlaced);
        assert!(EventType::OrderPlaced < EventType::OrderCompleted);
        assert!(EventType::OrderCompleted < EventType::Payment);
        assert_eq!(EventType::Payment.index(), 3);
    }

    #[test]
    fn test_event_serializes_flat_with_tag() {
        let event = Event {
            event_id: "e1".to_string(),
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            location_id: "rest_001".to_string(),
            location_name: "Downtown Location".to_string(),
            table_id: "table_04".to_string(),
            payload: EventPayload::OrderCompleted(OrderCompleted {
                order_id: "order_1".to_string(),
                kitchen_time_minutes: 18.0,
            }),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "order_completed");
        assert_eq!(json["order_id"], "order_1");
        assert_eq!(event.order_id(), Some("order_1"));
        assert_eq!(event.unix_ts(), 1_700_000_000);
    }
}
