//! Reader (SPEC_FULL.md §4.10): a thin wrapper over a non-durable,
//! `Exclusive` `Consumer` that starts from a caller-supplied `MessageId`
//! instead of a named subscription's cursor.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::connection_manager::ConnectionManager;
use crate::consumer::{self, ConsumerOptions, InitialPosition, SubType};
use crate::error::ConsumerError;
use crate::executor::Executor;
use crate::lookup::LookupService;
use crate::message_id::MessageId;

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub topic: String,
    pub start_message_id: MessageId,
    /// Whether `start_message_id` itself should be returned, rather than
    /// only messages strictly after it.
    pub start_message_id_inclusive: bool,
    pub reader_name: Option<String>,
    pub receiver_queue_size: u32,
    pub read_compacted: bool,
}

impl ReaderOptions {
    pub fn new(topic: impl Into<String>, start_message_id: MessageId) -> ReaderOptions {
        ReaderOptions {
            topic: topic.into(),
            start_message_id,
            start_message_id_inclusive: false,
            reader_name: None,
            receiver_queue_size: 1000,
            read_compacted: false,
        }
    }
}

/// Non-durable, ack-free consumption from a fixed starting position.
pub struct Reader {
    consumer: consumer::Consumer,
}

impl Reader {
    pub fn new<Exe: Executor>(
        options: ReaderOptions,
        connection_manager: Arc<ConnectionManager<Exe>>,
        lookup: Arc<LookupService<Exe>>,
    ) -> Reader {
        let consumer_options = ConsumerOptions {
            topic: options.topic,
            subscription: format!("reader-{}", Uuid::new_v4()),
            sub_type: SubType::Exclusive,
            consumer_name: options.reader_name,
            durable: false,
            read_compacted: options.read_compacted,
            initial_position: InitialPosition::Earliest,
            start_message_id: Some(options.start_message_id.to_proto()),
            reset_include_head: options.start_message_id_inclusive,
            priority_level: None,
            receiver_queue_size: options.receiver_queue_size,
            ack_timeout: Duration::from_secs(0),
            negative_ack_redelivery_delay: Duration::from_millis(60_000),
            ack_grouping_interval: None,
            operation_timeout: Duration::from_secs(30),
        };
        let consumer_id = crate::connection::SerialId::new().get();
        let consumer = consumer::spawn(consumer_id, consumer_options, connection_manager, lookup);
        Reader { consumer }
    }

    /// Reads forward, without acknowledging (readers never ack; the broker
    /// cursor is tracked client-side only, via `start_message_id`).
    pub async fn read_next(&self) -> Result<consumer::ReceivedMessage, ConsumerError> {
        self.consumer.receive().await
    }

    pub async fn has_message_available(&self) -> Result<bool, ConsumerError> {
        self.consumer.has_message_available().await
    }

    pub async fn seek(&self, id: MessageId) -> Result<(), ConsumerError> {
        self.consumer.seek(Some(id)).await
    }

    pub async fn seek_to_timestamp(&self, timestamp: u64) -> Result<(), ConsumerError> {
        self.consumer.seek_to_timestamp(timestamp).await
    }

    pub async fn close(&self) -> Result<(), ConsumerError> {
        self.consumer.close().await
    }

    pub fn topic(&self) -> &str {
        self.consumer.topic()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_defaults_to_exclusive_non_inclusive_reads() {
        let options = ReaderOptions::new("my-topic", MessageId::earliest("my-topic"));
        assert!(!options.start_message_id_inclusive);
        assert_eq!(options.receiver_queue_size, 1000);
        assert!(!options.read_compacted);
        assert!(options.reader_name.is_none());
    }
}
