//! Negative-Ack Tracker (SPEC_FULL.md §4.7): defers redelivery of a
//! negatively-acked message by a configured delay instead of immediately.

use std::time::{Duration, Instant};

use crate::message_id::MessageId;

pub(crate) struct NegativeAckTracker {
    redelivery_delay: Duration,
    entries: Vec<(Instant, MessageId)>,
}

impl NegativeAckTracker {
    pub(crate) fn new(redelivery_delay: Duration) -> NegativeAckTracker {
        NegativeAckTracker {
            redelivery_delay,
            entries: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, id: MessageId, now: Instant) {
        self.entries.push((now + self.redelivery_delay, id));
    }

    /// Drains every entry whose deadline has passed as of `now`, in a single
    /// batch, leaving unexpired entries in place.
    pub(crate) fn drain_expired(&mut self, now: Instant) -> Vec<MessageId> {
        let (expired, remaining): (Vec<_>, Vec<_>) = self.entries.drain(..).partition(|(deadline, _)| *deadline <= now);
        self.entries = remaining;
        expired.into_iter().map(|(_, id)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(entry: u64) -> MessageId {
        MessageId::individual("t", 1, entry, -1)
    }

    #[test]
    fn drains_only_entries_past_their_deadline() {
        let mut tracker = NegativeAckTracker::new(Duration::from_millis(100));
        let t0 = Instant::now();
        tracker.add(id(1), t0);
        assert!(tracker.drain_expired(t0).is_empty());
        assert!(tracker.drain_expired(t0 + Duration::from_millis(50)).is_empty());
        let expired = tracker.drain_expired(t0 + Duration::from_millis(101));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].entry_id, 1);
    }

    #[test]
    fn drained_entries_do_not_reappear() {
        let mut tracker = NegativeAckTracker::new(Duration::from_millis(10));
        let t0 = Instant::now();
        tracker.add(id(1), t0);
        let _ = tracker.drain_expired(t0 + Duration::from_millis(20));
        assert!(tracker.drain_expired(t0 + Duration::from_millis(30)).is_empty());
    }
}
