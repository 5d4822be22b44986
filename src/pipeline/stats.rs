//! Pipeline-wide ingestion counters

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Lock-free counters shared by every partition worker.
#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    duplicates: AtomicU64,
    too_late: AtomicU64,
    anomalies: AtomicU64,
    funnels_completed: AtomicU64,
    funnels_expired: AtomicU64,
    funnels_abandoned: AtomicU64,
    flushes: AtomicU64,
    flush_failures: AtomicU64,
    rows_written: AtomicU64,
    fatal_faults: AtomicU64,
    queue_full: AtomicU64,
    rejected_by_reason: Mutex<BTreeMap<String, u64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub duplicates: u64,
    pub too_late: u64,
    pub anomalies: u64,
    pub funnels_completed: u64,
    pub funnels_expired: u64,
    pub funnels_abandoned: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub rows_written: u64,
    pub fatal_faults: u64,
    pub queue_full: u64,
    pub rejected_by_reason: BTreeMap<String, u64>,
}

macro_rules! counter {
    ($($inc:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $inc(&self, n: u64) {
                self.$field.fetch_add(n, Ordering::Relaxed);
            }
        )*
    };
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        add_received => received,
        add_accepted => accepted,
        add_rejected => rejected,
        add_duplicates => duplicates,
        add_too_late => too_late,
        add_anomalies => anomalies,
        add_funnels_completed => funnels_completed,
        add_funnels_expired => funnels_expired,
        add_funnels_abandoned => funnels_abandoned,
        add_flushes => flushes,
        add_flush_failures => flush_failures,
        add_rows_written => rows_written,
        add_fatal_faults => fatal_faults,
        add_queue_full => queue_full,
    }

    /// Count one dead-lettered record under its reason code.
    pub fn record_rejection(&self, code: &str) {
        self.add_rejected(1);
        if let Ok(mut by_reason) = self.rejected_by_reason.lock() {
            *by_reason.entry(code.to_string()).or_insert(0) += 1;
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            received: load(&self.received),
            accepted: load(&self.accepted),
            rejected: load(&self.rejected),
            duplicates: load(&self.duplicates),
            too_late: load(&self.too_late),
            anomalies: load(&self.anomalies),
            funnels_completed: load(&self.funnels_completed),
            funnels_expired: load(&self.funnels_expired),
            funnels_abandoned: load(&self.funnels_abandoned),
            flushes: load(&self.flushes),
            flush_failures: load(&self.flush_failures),
            rows_written: load(&self.rows_written),
            fatal_faults: load(&self.fatal_faults),
            queue_full: load(&self.queue_full),
            rejected_by_reason: self
                .rejected_by_reason
                .lock()
                .map(|m| m.clone())
                .unwrap_or_default(),
        }
    }
}

impl StatsSnapshot {
    /// Share of received records that were dead-lettered.
    pub fn rejection_rate(&self) -> f64 {
        if self.received == 0 {
            0.0
        } else {
            self.rejected as f64 / self.received as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters_accumulate_across_threads() {
        let stats = Arc::new(IngestStats::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        stats.add_received(1);
                        stats.add_accepted(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for code in ["missing_field", "missing_field", "invalid_json"] {
            stats.add_received(1);
            stats.record_rejection(code);
        }

        let snap = stats.snapshot();
        assert_eq!(snap.received, 1_003);
        assert_eq!(snap.accepted, 1_000);
        assert_eq!(snap.rejected, 3);
        assert_eq!(snap.rejected_by_reason["missing_field"], 2);
        assert_eq!(snap.rejected_by_reason["invalid_json"], 1);
        assert!((snap.rejection_rate() - 3.0 / 1_003.0).abs() < 1e-12);
    }
}
