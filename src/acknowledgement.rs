//! Acknowledgment Grouping Tracker (SPEC_FULL.md §4.5): coalesces individual
//! and cumulative acks behind a periodic flush instead of sending one `ACK`
//! frame per message. Owned exclusively by a Consumer Engine's inbox loop;
//! no internal locking.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::connection::ConnectionSender;
use crate::error::ConnectionError;
use crate::message_id::MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct IdKey(u64, u64, i64);

fn key_of(id: &MessageId) -> IdKey {
    IdKey(id.ledger_id, id.entry_id, id.batch_index().map(|i| i as i64).unwrap_or(-1))
}

/// Buffers `(messageId, ackType)` pairs between flushes. A cumulative ack
/// always wins over any individual acks it covers; `flush` emits at most one
/// `ACK` command per bucket.
pub(crate) struct AckGroupingTracker {
    /// `None` disables grouping entirely: every ack is sent immediately, as
    /// required for non-persistent topics (SPEC_FULL.md §4.5).
    flush_interval: Option<Duration>,
    pending_individual: BTreeSet<IdKey>,
    pending_cumulative: Option<MessageId>,
    last_flushed_individual: BTreeSet<IdKey>,
    last_flushed_cumulative: Option<IdKey>,
}

impl AckGroupingTracker {
    pub(crate) fn new(flush_interval: Option<Duration>, persistent: bool) -> AckGroupingTracker {
        AckGroupingTracker {
            flush_interval: if persistent { flush_interval } else { None },
            pending_individual: BTreeSet::new(),
            pending_cumulative: None,
            last_flushed_individual: BTreeSet::new(),
            last_flushed_cumulative: None,
        }
    }

    pub(crate) fn flush_interval(&self) -> Option<Duration> {
        self.flush_interval
    }

    /// `true` if `id` is already covered by a pending or just-flushed ack
    /// (individual or cumulative), meaning a redelivered duplicate frame
    /// should be dropped rather than requeued.
    pub(crate) fn is_duplicate(&self, id: &MessageId) -> bool {
        let key = key_of(id);
        if self.pending_individual.contains(&key) || self.last_flushed_individual.contains(&key) {
            return true;
        }
        if let Some(ref c) = self.pending_cumulative {
            if key <= key_of(c) {
                return true;
            }
        }
        if let Some(c) = self.last_flushed_cumulative {
            if key <= c {
                return true;
            }
        }
        false
    }

    pub(crate) fn add_individual(&mut self, id: MessageId, sender: &ConnectionSender, consumer_id: u64) {
        if self.flush_interval.is_none() {
            let _ = sender.send_ack(consumer_id, vec![id.to_proto()], false);
            return;
        }
        self.pending_individual.insert(key_of(&id));
    }

    pub(crate) fn add_cumulative(&mut self, id: MessageId, sender: &ConnectionSender, consumer_id: u64) {
        if self.flush_interval.is_none() {
            let _ = sender.send_ack(consumer_id, vec![id.to_proto()], true);
            return;
        }
        let replace = match &self.pending_cumulative {
            Some(current) => key_of(&id) > key_of(current),
            None => true,
        };
        if replace {
            self.pending_cumulative = Some(id);
        }
    }

    /// Emits at most one `ACK` command per non-empty bucket. Called on the
    /// tracker's own tick, and also on close/seek (SPEC_FULL.md §4.5, §4.9).
    pub(crate) fn flush(&mut self, sender: &ConnectionSender, consumer_id: u64) -> Result<(), ConnectionError> {
        if let Some(id) = self.pending_cumulative.take() {
            sender.send_ack(consumer_id, vec![id.to_proto()], true)?;
            self.last_flushed_cumulative = Some(key_of(&id));
        }
        if !self.pending_individual.is_empty() {
            let ids: Vec<_> = self.pending_individual.iter().copied().collect();
            let proto_ids = ids
                .iter()
                .map(|k| crate::message::proto::MessageIdData {
                    ledger_id: k.0,
                    entry_id: k.1,
                    partition: -1,
                    batch_index: k.2 as i32,
                })
                .collect();
            sender.send_ack(consumer_id, proto_ids, false)?;
            self.last_flushed_individual = self.pending_individual.clone();
            self.pending_individual.clear();
        }
        Ok(())
    }

    /// Discards every pending and remembered ack without sending anything,
    /// used when a seek invalidates in-flight acknowledgment state.
    pub(crate) fn clear(&mut self) {
        self.pending_individual.clear();
        self.pending_cumulative = None;
        self.last_flushed_individual.clear();
        self.last_flushed_cumulative = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(ledger: u64, entry: u64) -> MessageId {
        MessageId::individual("t", ledger, entry, -1)
    }

    #[test]
    fn cumulative_ack_covers_lower_individual_ids() {
        let mut tracker = AckGroupingTracker::new(Some(Duration::from_millis(10)), true);
        tracker.pending_cumulative = Some(id(1, 10));
        assert!(tracker.is_duplicate(&id(1, 5)));
        assert!(!tracker.is_duplicate(&id(1, 11)));
    }

    #[test]
    fn higher_cumulative_ack_replaces_lower_one() {
        let mut tracker = AckGroupingTracker::new(Some(Duration::from_millis(10)), true);
        tracker.pending_cumulative = Some(id(1, 5));
        tracker.add_cumulative(id(1, 3), &dummy_sender(), 0);
        assert_eq!(tracker.pending_cumulative.as_ref().unwrap().entry_id, 5);
        tracker.add_cumulative(id(1, 8), &dummy_sender(), 0);
        assert_eq!(tracker.pending_cumulative.as_ref().unwrap().entry_id, 8);
    }

    #[test]
    fn clear_removes_duplicate_suppression_state() {
        let mut tracker = AckGroupingTracker::new(Some(Duration::from_millis(10)), true);
        tracker.pending_individual.insert(key_of(&id(1, 1)));
        tracker.clear();
        assert!(!tracker.is_duplicate(&id(1, 1)));
    }

    fn dummy_sender() -> ConnectionSender {
        let (tx, _rx) = futures::channel::mpsc::unbounded();
        let (reg_tx, _reg_rx) = futures::channel::mpsc::unbounded();
        ConnectionSender::new(tx, reg_tx, crate::connection::SerialId::new(), crate::error::SharedError::new())
    }
}
