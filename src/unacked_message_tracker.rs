//! Unacked Message Tracker (SPEC_FULL.md §4.6): a logical ring of time
//! buckets. Each tick rotates the ring; whatever is left in the bucket that
//! falls off the tail is hopped to the Consumer Engine's redeliver path.

use std::collections::{HashSet, VecDeque};

use crate::message_id::MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct IdKey(u64, u64, i64);

fn key_of(id: &MessageId) -> IdKey {
    IdKey(id.ledger_id, id.entry_id, id.batch_index().map(|i| i as i64).unwrap_or(-1))
}

/// `AckTimeout = 0` produces a tracker with `buckets.is_empty()`, which
/// behaves as a permanent no-op ("disabled") instance per SPEC_FULL.md §4.6.
pub(crate) struct UnackedMessageTracker {
    buckets: VecDeque<HashSet<IdKey>>,
    /// reverse index so `remove`/`contains` don't need to scan every bucket
    locations: std::collections::HashMap<IdKey, usize>,
    ids: std::collections::HashMap<IdKey, MessageId>,
}

impl UnackedMessageTracker {
    pub(crate) fn new(num_buckets: usize) -> UnackedMessageTracker {
        UnackedMessageTracker {
            buckets: (0..num_buckets).map(|_| HashSet::new()).collect(),
            locations: std::collections::HashMap::new(),
            ids: std::collections::HashMap::new(),
        }
    }

    pub(crate) fn disabled() -> UnackedMessageTracker {
        UnackedMessageTracker::new(0)
    }

    pub(crate) fn is_disabled(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Inserts into the head bucket (index 0), replacing any earlier
    /// placement of the same id.
    pub(crate) fn add(&mut self, id: MessageId) {
        if self.is_disabled() {
            return;
        }
        let key = key_of(&id);
        self.remove_by_key(key);
        self.buckets[0].insert(key);
        self.locations.insert(key, 0);
        self.ids.insert(key, id);
    }

    pub(crate) fn remove(&mut self, id: &MessageId) {
        self.remove_by_key(key_of(id));
    }

    fn remove_by_key(&mut self, key: IdKey) {
        if let Some(bucket_index) = self.locations.remove(&key) {
            self.buckets[bucket_index].remove(&key);
            self.ids.remove(&key);
        }
    }

    /// Removes every id `<= id` (inclusive), returning how many were
    /// removed. Used when a cumulative ack subsumes a run of older ids.
    pub(crate) fn remove_messages_till(&mut self, id: &MessageId) -> usize {
        let threshold = key_of(id);
        let to_remove: Vec<IdKey> = self
            .ids
            .iter()
            .filter(|(k, _)| **k <= threshold)
            .map(|(k, _)| *k)
            .collect();
        let count = to_remove.len();
        for key in to_remove {
            self.remove_by_key(key);
        }
        count
    }

    /// Rotates the ring by one tick: the tail bucket's surviving ids are
    /// returned for redelivery, the bucket is emptied, and recycled as the
    /// new head.
    pub(crate) fn tick(&mut self) -> Vec<MessageId> {
        if self.is_disabled() {
            return Vec::new();
        }
        let tail = self.buckets.pop_back().unwrap();
        let expired: Vec<MessageId> = tail
            .iter()
            .filter_map(|key| self.ids.remove(key))
            .collect();
        for key in &tail {
            self.locations.remove(key);
        }
        self.buckets.push_front(HashSet::new());
        // every remaining bucket shifted one slot toward the tail
        for (index, bucket) in self.buckets.iter().enumerate() {
            for key in bucket {
                self.locations.insert(*key, index);
            }
        }
        expired
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(entry: u64) -> MessageId {
        MessageId::individual("t", 1, entry, -1)
    }

    #[test]
    fn disabled_tracker_ignores_everything() {
        let mut tracker = UnackedMessageTracker::disabled();
        tracker.add(id(1));
        assert!(tracker.tick().is_empty());
    }

    #[test]
    fn tick_expires_only_after_full_rotation() {
        let mut tracker = UnackedMessageTracker::new(3);
        tracker.add(id(1));
        assert!(tracker.tick().is_empty());
        assert!(tracker.tick().is_empty());
        let expired = tracker.tick();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].entry_id, 1);
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn remove_before_expiry_prevents_redelivery() {
        let mut tracker = UnackedMessageTracker::new(2);
        tracker.add(id(1));
        tracker.remove(&id(1));
        assert!(tracker.tick().is_empty());
        assert!(tracker.tick().is_empty());
    }

    #[test]
    fn remove_messages_till_removes_all_ids_up_to_threshold() {
        let mut tracker = UnackedMessageTracker::new(3);
        tracker.add(id(1));
        tracker.add(id(2));
        tracker.add(id(3));
        let removed = tracker.remove_messages_till(&id(2));
        assert_eq!(removed, 2);
        assert_eq!(tracker.len(), 1);
    }
}
