//! Error and classification types for the ingestion pipeline

use serde::Serialize;
use thiserror::Error;

/// Why a raw record was routed to the dead-letter path.
///
/// This is a classification, not a failure: the validator returns it and the
/// stream keeps going.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum RejectReason {
    #[error("record is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("field has wrong type: {0}")]
    WrongType(String),

    #[error("unknown event_type: {0}")]
    UnknownEventType(String),

    #[error("timestamp is not a parseable UTC instant: {0}")]
    InvalidTimestamp(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("negative value in field: {0}")]
    NegativeValue(String),

    #[error("order has no items")]
    EmptyItems,
}

impl RejectReason {
    /// Stable reason code stored alongside dead-lettered rows.
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::InvalidJson(_) => "invalid_json",
            RejectReason::NotAnObject => "not_an_object",
            RejectReason::MissingField(_) => "missing_field",
            RejectReason::WrongType(_) => "wrong_type",
            RejectReason::UnknownEventType(_) => "unknown_event_type",
            RejectReason::InvalidTimestamp(_) => "invalid_timestamp",
            RejectReason::MalformedPayload(_) => "malformed_payload",
            RejectReason::NegativeValue(_) => "negative_value",
            RejectReason::EmptyItems => "empty_items",
        }
    }
}

/// Storage-side failure reported by an `EventSink`.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sink unavailable: {0}")]
    Unavailable(String),
}

/// Which buffered batch a flush was working on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Raw,
    Rejected,
    Funnels,
    Buckets,
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::Raw => "raw",
            BatchKind::Rejected => "rejected",
            BatchKind::Funnels => "funnels",
            BatchKind::Buckets => "buckets",
        }
    }
}

impl std::fmt::Display for BatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The partition queue is full; the source should block or shed.
    #[error("partition {partition} queue is full")]
    QueueFull { partition: usize },

    #[error("pipeline is shut down")]
    Closed,

    /// Retries exhausted for one partition's batch. The batch is held, not dropped.
    #[error("fatal ingestion fault on partition {partition} ({batch} batch) after {attempts} attempts: {source}")]
    FatalIngestion {
        partition: usize,
        batch: BatchKind,
        attempts: u32,
        #[source]
        source: SinkError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("event source failed: {0}")]
    Source(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_reason_codes_and_display() {
        let reason = RejectReason::MissingField("event_type".to_string());
        assert_eq!(reason.code(), "missing_field");
        assert_eq!(reason.to_string(), "missing required field: event_type");
        assert_eq!(RejectReason::EmptyItems.code(), "empty_items");
    }

    #[test]
    fn test_fatal_ingestion_message_names_partition_and_batch() {
        let err = PipelineError::FatalIngestion {
            partition: 2,
            batch: BatchKind::Raw,
            attempts: 5,
            source: SinkError::Unavailable("disk full".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("partition 2"));
        assert!(msg.contains("raw batch"));
        assert!(msg.contains("disk full"));
    }
}
