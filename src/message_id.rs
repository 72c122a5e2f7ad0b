//! `MessageId`: the identifier a consumer receives and a seek targets.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::batch_acker::BatchAcker;
use crate::message::proto;

/// Whether this id names a whole (non-batched) entry or one sub-message of
/// a batch. `Cumulative` carries the shared acker so that acking any
/// sub-message can tell whether the whole batch is now fully acked.
#[derive(Debug, Clone)]
pub enum MessageIdType {
    Individual,
    Cumulative(u32, Arc<BatchAcker>),
}

#[derive(Debug, Clone)]
pub struct MessageId {
    pub ledger_id: u64,
    pub entry_id: u64,
    pub partition: i32,
    pub topic: String,
    pub message_type: MessageIdType,
}

impl MessageId {
    /// The sentinel `earliest` position accepted by `SubscriptionInitialPosition`/seek.
    pub fn earliest(topic: impl Into<String>) -> MessageId {
        MessageId {
            ledger_id: 0,
            entry_id: u64::MAX,
            partition: -1,
            topic: topic.into(),
            message_type: MessageIdType::Individual,
        }
    }

    pub fn individual(topic: impl Into<String>, ledger_id: u64, entry_id: u64, partition: i32) -> MessageId {
        MessageId {
            ledger_id,
            entry_id,
            partition,
            topic: topic.into(),
            message_type: MessageIdType::Individual,
        }
    }

    pub fn batch_index(&self) -> Option<u32> {
        match &self.message_type {
            MessageIdType::Individual => None,
            MessageIdType::Cumulative(index, _) => Some(*index),
        }
    }

    pub fn to_proto(&self) -> proto::MessageIdData {
        proto::MessageIdData {
            ledger_id: self.ledger_id,
            entry_id: self.entry_id,
            partition: self.partition,
            batch_index: self.batch_index().map(|i| i as i32).unwrap_or(-1),
        }
    }

    pub fn from_proto(topic: impl Into<String>, data: &proto::MessageIdData) -> MessageId {
        MessageId {
            ledger_id: data.ledger_id,
            entry_id: data.entry_id,
            partition: data.partition,
            topic: topic.into(),
            message_type: MessageIdType::Individual,
        }
    }

    fn sort_key(&self) -> (u64, u64, i64) {
        (self.ledger_id, self.entry_id, self.batch_index().map(|i| i as i64).unwrap_or(-1))
    }
}

impl PartialEq for MessageId {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}
impl Eq for MessageId {}

impl PartialOrd for MessageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MessageId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_lexicographically_on_ledger_then_entry_then_batch_index() {
        let a = MessageId::individual("t", 1, 5, -1);
        let b = MessageId::individual("t", 1, 6, -1);
        assert!(a < b);

        let acker = Arc::new(BatchAcker::new(2));
        let c0 = MessageId {
            message_type: MessageIdType::Cumulative(0, acker.clone()),
            ..MessageId::individual("t", 2, 0, -1)
        };
        let c1 = MessageId {
            message_type: MessageIdType::Cumulative(1, acker),
            ..MessageId::individual("t", 2, 0, -1)
        };
        assert!(c0 < c1);
    }

    #[test]
    fn earliest_sentinel_has_max_entry_id() {
        let e = MessageId::earliest("t");
        assert_eq!(e.entry_id, u64::MAX);
    }
}
