//! servflow - restaurant event correlator and windowed aggregator

pub mod pipeline;
