//! Event validation and normalization
//!
//! Turns an untyped JSON record into a typed `Event`, or classifies it as a
//! `RejectedEvent` for the dead-letter path. Malformed input never surfaces as
//! an error to the caller. Cross-event consistency is not checked here.

use super::error::RejectReason;
use super::types::{
    Event, EventPayload, EventType, OrderCompleted, OrderPlaced, Payment, RejectedEvent,
    TableSeated,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Outcome of validating one raw record.
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Valid(Event),
    Rejected(RejectedEvent),
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid(_))
    }
}

/// Naive timestamp layouts accepted when no offset is present (read as UTC).
const NAIVE_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Stateless validator; cheap to copy into every submitter.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventValidator;

impl EventValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a single JSONL line.
    pub fn validate_line(&self, line: &str, now: i64) -> Validation {
        match serde_json::from_str::<Value>(line) {
            Ok(value) => self.classify(&value, line.trim().to_string(), now),
            Err(e) => Validation::Rejected(RejectedEvent {
                reason: RejectReason::InvalidJson(e.to_string()),
                raw_payload: line.trim().to_string(),
                rejected_at: now,
            }),
        }
    }

    /// Validate an already-decoded JSON value.
    pub fn validate_value(&self, value: &Value, now: i64) -> Validation {
        self.classify(value, value.to_string(), now)
    }

    fn classify(&self, value: &Value, raw_payload: String, now: i64) -> Validation {
        match parse_event(value) {
            Ok(event) => Validation::Valid(event),
            Err(reason) => {
                log::debug!("Rejected event ({}): {}", reason.code(), reason);
                Validation::Rejected(RejectedEvent {
                    reason,
                    raw_payload,
                    rejected_at: now,
                })
            }
        }
    }
}

fn parse_event(value: &Value) -> Result<Event, RejectReason> {
    let obj = value.as_object().ok_or(RejectReason::NotAnObject)?;

    let type_name = required_str(obj, "event_type", None)?;
    let event_type = EventType::from_str(type_name)
        .ok_or_else(|| RejectReason::UnknownEventType(type_name.to_string()))?;

    let event_id = required_str(obj, "event_id", None)?.to_string();
    let timestamp = parse_timestamp(required_str(obj, "timestamp", None)?)?;
    let location_id = required_str(obj, "location_id", Some("restaurant_id"))?.to_string();
    let location_name = required_str(obj, "location_name", Some("restaurant_name"))?.to_string();
    let table_id = required_str(obj, "table_id", None)?.to_string();

    let payload = match event_type {
        EventType::TableSeated => EventPayload::TableSeated(payload::<TableSeated>(value)?),
        EventType::OrderPlaced => {
            let order: OrderPlaced = payload(value)?;
            check_order(&order)?;
            EventPayload::OrderPlaced(order)
        }
        EventType::OrderCompleted => {
            let done: OrderCompleted = payload(value)?;
            non_negative("kitchen_time_minutes", done.kitchen_time_minutes)?;
            EventPayload::OrderCompleted(done)
        }
        EventType::Payment => {
            let payment: Payment = payload(value)?;
            non_negative("subtotal", payment.subtotal)?;
            non_negative("tax", payment.tax)?;
            non_negative("tip", payment.tip)?;
            non_negative("total_amount", payment.total_amount)?;
            EventPayload::Payment(payment)
        }
    };

    Ok(Event {
        event_id,
        timestamp,
        location_id,
        location_name,
        table_id,
        payload,
    })
}

/// Look up a non-empty string field, falling back to a legacy alias.
fn required_str<'a>(
    obj: &'a Map<String, Value>,
    field: &str,
    alias: Option<&str>,
) -> Result<&'a str, RejectReason> {
    let value = obj
        .get(field)
        .or_else(|| alias.and_then(|a| obj.get(a)))
        .filter(|v| !v.is_null())
        .ok_or_else(|| RejectReason::MissingField(field.to_string()))?;

    match value.as_str() {
        Some("") => Err(RejectReason::MissingField(field.to_string())),
        Some(s) => Ok(s),
        None => Err(RejectReason::WrongType(field.to_string())),
    }
}

fn payload<T: DeserializeOwned>(value: &Value) -> Result<T, RejectReason> {
    T::deserialize(value).map_err(|e| {
        let msg = e.to_string();
        match msg.strip_prefix("missing field `") {
            Some(rest) => RejectReason::MissingField(rest.trim_end_matches('`').to_string()),
            None => RejectReason::MalformedPayload(msg),
        }
    })
}

fn check_order(order: &OrderPlaced) -> Result<(), RejectReason> {
    if order.items.is_empty() {
        return Err(RejectReason::EmptyItems);
    }
    non_negative("subtotal", order.subtotal)?;
    for item in &order.items {
        non_negative("items.unit_price", item.unit_price)?;
    }
    Ok(())
}

fn non_negative(field: &str, value: f64) -> Result<(), RejectReason> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(RejectReason::NegativeValue(field.to_string()))
    }
}

/// Parse RFC 3339, or a naive ISO-8601 timestamp interpreted as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, RejectReason> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NAIVE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| RejectReason::InvalidTimestamp(raw.to_string()))
}
