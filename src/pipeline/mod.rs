//! # Restaurant event correlation pipeline
//!
//! Turns a noisy, at-least-once stream of restaurant events into deduplicated
//! per-visit funnels and time-bucketed aggregates for a live dashboard.
//!
//! ```text
//! raw JSON ─▶ validator ─┬─▶ dead letter
//!                        └─▶ dedup ─▶ correlator ─▶ windows
//!                                          │            │
//!                                          ▼            ▼
//!                                   funnel rows    bucket rows ─▶ sink (batched)
//! ```
//!
//! ## Module Organization
//!
//! - `types` - Event tagged union and sink row types
//! - `error` - Reject reasons, sink and pipeline errors
//! - `validator` - Raw record → `Event` or `RejectedEvent`
//! - `dedup` - Time-bounded `event_id` filter
//! - `correlator` - Per-visit funnel state
//! - `windows` - Fixed-width buckets and sliding-window queries
//! - `engine` - Per-partition hot path
//! - `batcher` / `backoff` - Batched sink writes with retry
//! - `db` / `db_reader` - SQLite sink and read-side queries
//! - `source` - JSONL / stdin event sources
//! - `ingestion` - Partitioned async runtime
//! - `config` / `stats` - Environment configuration and counters

pub mod backoff;
pub mod batcher;
pub mod config;
pub mod correlator;
pub mod db;
pub mod db_reader;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod ingestion;
pub mod source;
pub mod stats;
pub mod types;
pub mod validator;
pub mod windows;

// Re-export commonly used types
pub use config::{Clock, PipelineConfig};
pub use correlator::{FunnelCorrelator, FunnelKey, FunnelRecord, FunnelStatus, FunnelUpdate};
pub use db::{EventSink, MemoryEventSink, SqliteEventSink};
pub use dedup::{Admission, DedupFilter};
pub use engine::PartitionEngine;
pub use error::{PipelineError, RejectReason, SinkError};
pub use ingestion::{Pipeline, QueryHandle};
pub use types::{Event, EventPayload, EventType, RejectedEvent};
pub use validator::{EventValidator, Validation};
pub use windows::{WindowSize, WindowedAggregator};
