//! Time-bounded duplicate suppression
//!
//! Seen `event_id`s live in a ring of per-slot sets (one slot per minute by
//! default). Membership checks touch every live slot, which is a small constant
//! (`horizon / slot` sets); eviction drops whole expired slots at once.
//!
//! An id that recurs after its slot has been dropped is accepted again. That
//! window is bounded by the configured horizon.

use std::collections::{HashSet, VecDeque};

/// Dedup verdict for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Duplicate,
}

#[derive(Debug)]
struct Slot {
    start: i64,
    ids: HashSet<String>,
}

/// Partition-local dedup filter keyed on processing time (Unix seconds).
#[derive(Debug)]
pub struct DedupFilter {
    horizon_secs: i64,
    slot_secs: i64,
    slots: VecDeque<Slot>,
}

impl DedupFilter {
    pub fn new(horizon_secs: i64, slot_secs: i64) -> Self {
        let slot_secs = slot_secs.max(1);
        Self {
            horizon_secs: horizon_secs.max(slot_secs),
            slot_secs,
            slots: VecDeque::new(),
        }
    }

    /// Check and record `event_id` seen at processing time `now`.
    pub fn admit(&mut self, event_id: &str, now: i64) -> Admission {
        if self.slots.iter().any(|slot| slot.ids.contains(event_id)) {
            return Admission::Duplicate;
        }

        self.evict_expired(now);

        let slot_start = now.div_euclid(self.slot_secs) * self.slot_secs;
        let needs_slot = self
            .slots
            .back()
            .map_or(true, |last| slot_start > last.start);

        if needs_slot {
            self.slots.push_back(Slot {
                start: slot_start,
                ids: HashSet::new(),
            });
        }

        // Clock moving backwards lands in the newest slot.
        if let Some(last) = self.slots.back_mut() {
            last.ids.insert(event_id.to_string());
        }

        Admission::Accepted
    }

    /// Drop every slot that ended before `now - horizon`. Idempotent.
    pub fn evict_expired(&mut self, now: i64) -> usize {
        let cutoff = now - self.horizon_secs;
        let mut evicted = 0;
        while let Some(front) = self.slots.front() {
            if front.start + self.slot_secs > cutoff {
                break;
            }
            if let Some(slot) = self.slots.pop_front() {
                evicted += slot.ids.len();
            }
        }
        if evicted > 0 {
            log::trace!("Dedup sweep evicted {} ids", evicted);
        }
        evicted
    }

    /// Number of ids currently remembered.
    pub fn len(&self) -> usize {
        self.slots.iter().map(|s| s.ids.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.ids.is_empty())
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_within_horizon() {
        let mut filter = DedupFilter::new(300, 60);
        assert_eq!(filter.admit("a", 1_000), Admission::Accepted);
        assert_eq!(filter.admit("a", 1_001), Admission::Duplicate);
        assert_eq!(filter.admit("a", 1_000 + 240), Admission::Duplicate);
        assert_eq!(filter.admit("b", 1_001), Admission::Accepted);
        assert_eq!(filter.len(), 2);
    }

    #[test]
    fn test_very_late_duplicate_is_accepted_again() {
        let mut filter = DedupFilter::new(300, 60);
        assert_eq!(filter.admit("a", 1_020), Admission::Accepted);

        // Slot [1020, 1080) expires once 1080 <= now - 300.
        filter.evict_expired(1_380);
        assert!(filter.is_empty());
        assert_eq!(filter.admit("a", 1_380), Admission::Accepted);
    }

    #[test]
    fn test_memory_stays_bounded_by_slots() {
        let mut filter = DedupFilter::new(300, 60);
        for i in 0..10_000i64 {
            filter.admit(&format!("evt_{}", i), i);
        }
        // Horizon of 5 slots plus the slot currently filling.
        assert!(filter.slot_count() <= 6, "slots = {}", filter.slot_count());
        assert!(filter.len() <= 6 * 60);
    }

    #[test]
    fn test_clock_going_backwards_still_dedups() {
        let mut filter = DedupFilter::new(300, 60);
        assert_eq!(filter.admit("a", 2_000), Admission::Accepted);
        assert_eq!(filter.admit("b", 1_900), Admission::Accepted);
        assert_eq!(filter.admit("b", 2_010), Admission::Duplicate);
        assert_eq!(filter.slot_count(), 1);
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let mut filter = DedupFilter::new(120, 60);
        filter.admit("a", 0);
        filter.admit("b", 70);
        assert_eq!(filter.evict_expired(190), 1);
        assert_eq!(filter.evict_expired(190), 0);
        assert_eq!(filter.len(), 1);
    }
}
