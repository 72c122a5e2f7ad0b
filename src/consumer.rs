//! Consumer Engine (SPEC_FULL.md §4.9): subscribe, flow control, batch
//! explosion, acknowledgment, redelivery, seek and close. Same
//! single-inbox actor shape as the Producer Engine.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{
    channel::{mpsc, oneshot},
    select, FutureExt, StreamExt,
};

use crate::batch_acker::BatchAcker;
use crate::compression;
use crate::connection::ConnectionSender;
use crate::connection_handler::ConnectionHandler;
use crate::connection_manager::ConnectionManager;
use crate::error::{ConnectionError, ConsumerError};
use crate::executor::Executor;
use crate::lookup::LookupService;
use crate::message::{proto, Message as WireMessage};
use crate::message_id::MessageId;
use crate::unacked_message_tracker::UnackedMessageTracker;

pub use proto::command_subscribe::SubType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialPosition {
    Latest,
    Earliest,
}

impl From<InitialPosition> for proto::command_subscribe::InitialPosition {
    fn from(p: InitialPosition) -> Self {
        match p {
            InitialPosition::Latest => proto::command_subscribe::InitialPosition::Latest,
            InitialPosition::Earliest => proto::command_subscribe::InitialPosition::Earliest,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub topic: String,
    pub subscription: String,
    pub sub_type: SubType,
    pub consumer_name: Option<String>,
    pub durable: bool,
    pub read_compacted: bool,
    pub initial_position: InitialPosition,
    pub start_message_id: Option<proto::MessageIdData>,
    /// Whether `start_message_id` itself should be included in the results
    /// rather than treated as the last-seen (exclusive) position.
    pub reset_include_head: bool,
    pub priority_level: Option<i32>,
    pub receiver_queue_size: u32,
    pub ack_timeout: Duration,
    pub negative_ack_redelivery_delay: Duration,
    pub ack_grouping_interval: Option<Duration>,
    pub operation_timeout: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        ConsumerOptions {
            topic: String::new(),
            subscription: String::new(),
            sub_type: SubType::Exclusive,
            consumer_name: None,
            durable: true,
            read_compacted: false,
            initial_position: InitialPosition::Latest,
            start_message_id: None,
            reset_include_head: false,
            priority_level: None,
            receiver_queue_size: 1000,
            ack_timeout: Duration::from_secs(0),
            negative_ack_redelivery_delay: Duration::from_millis(60_000),
            ack_grouping_interval: Some(Duration::from_millis(100)),
            operation_timeout: Duration::from_secs(30),
        }
    }
}

/// One application-visible message, exploded out of its batch if necessary.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub id: MessageId,
    pub payload: Vec<u8>,
    pub properties: Vec<(String, String)>,
    pub partition_key: Option<String>,
    pub redelivery_count: u32,
}

pub(crate) enum Inbox {
    Receive {
        reply: oneshot::Sender<Result<ReceivedMessage, ConsumerError>>,
    },
    Ack {
        id: MessageId,
        cumulative: bool,
        reply: oneshot::Sender<Result<(), ConsumerError>>,
    },
    NegativeAck {
        id: MessageId,
    },
    RedeliverUnacknowledged {
        reply: oneshot::Sender<Result<(), ConsumerError>>,
    },
    Seek {
        id: Option<MessageId>,
        publish_time: Option<u64>,
        reply: oneshot::Sender<Result<(), ConsumerError>>,
    },
    HasMessageAvailable {
        reply: oneshot::Sender<Result<bool, ConsumerError>>,
    },
    Unsubscribe {
        reply: oneshot::Sender<Result<(), ConsumerError>>,
    },
    Close {
        reply: oneshot::Sender<Result<(), ConsumerError>>,
    },
    Disconnected,
    Wire(WireMessage),
}

#[derive(Clone)]
pub struct Consumer {
    tx: mpsc::UnboundedSender<Inbox>,
    topic: String,
}

impl Consumer {
    pub async fn receive(&self) -> Result<ReceivedMessage, ConsumerError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .unbounded_send(Inbox::Receive { reply })
            .map_err(|_| ConsumerError::AlreadyClosed)?;
        response.await.map_err(|_| ConsumerError::AlreadyClosed)?
    }

    pub async fn ack(&self, id: MessageId) -> Result<(), ConsumerError> {
        self.send_ack(id, false).await
    }

    pub async fn ack_cumulative(&self, id: MessageId) -> Result<(), ConsumerError> {
        self.send_ack(id, true).await
    }

    async fn send_ack(&self, id: MessageId, cumulative: bool) -> Result<(), ConsumerError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .unbounded_send(Inbox::Ack { id, cumulative, reply })
            .map_err(|_| ConsumerError::AlreadyClosed)?;
        response.await.map_err(|_| ConsumerError::AlreadyClosed)?
    }

    pub fn negative_ack(&self, id: MessageId) {
        let _ = self.tx.unbounded_send(Inbox::NegativeAck { id });
    }

    pub async fn redeliver_unacknowledged_messages(&self) -> Result<(), ConsumerError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .unbounded_send(Inbox::RedeliverUnacknowledged { reply })
            .map_err(|_| ConsumerError::AlreadyClosed)?;
        response.await.map_err(|_| ConsumerError::AlreadyClosed)?
    }

    pub async fn seek(&self, id: Option<MessageId>) -> Result<(), ConsumerError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .unbounded_send(Inbox::Seek {
                id,
                publish_time: None,
                reply,
            })
            .map_err(|_| ConsumerError::AlreadyClosed)?;
        response.await.map_err(|_| ConsumerError::AlreadyClosed)?
    }

    /// `seekAsync(timestamp)` (SPEC_FULL.md §4.9): rewinds the subscription
    /// cursor to the first message published at or after `timestamp`.
    pub async fn seek_to_timestamp(&self, timestamp: u64) -> Result<(), ConsumerError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .unbounded_send(Inbox::Seek {
                id: None,
                publish_time: Some(timestamp),
                reply,
            })
            .map_err(|_| ConsumerError::AlreadyClosed)?;
        response.await.map_err(|_| ConsumerError::AlreadyClosed)?
    }

    pub async fn has_message_available(&self) -> Result<bool, ConsumerError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .unbounded_send(Inbox::HasMessageAvailable { reply })
            .map_err(|_| ConsumerError::AlreadyClosed)?;
        response.await.map_err(|_| ConsumerError::AlreadyClosed)?
    }

    pub async fn unsubscribe(&self) -> Result<(), ConsumerError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .unbounded_send(Inbox::Unsubscribe { reply })
            .map_err(|_| ConsumerError::AlreadyClosed)?;
        response.await.map_err(|_| ConsumerError::AlreadyClosed)?
    }

    pub async fn close(&self) -> Result<(), ConsumerError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .unbounded_send(Inbox::Close { reply })
            .map_err(|_| ConsumerError::AlreadyClosed)?;
        response.await.map_err(|_| ConsumerError::AlreadyClosed)?
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

struct ConsumerEngine<Exe: Executor> {
    consumer_id: u64,
    consumer_name: String,
    topic: String,
    options: ConsumerOptions,
    handler: ConnectionHandler,
    connection_manager: Arc<ConnectionManager<Exe>>,
    lookup: Arc<LookupService<Exe>>,
    /// Messages delivered by the broker but not yet handed to `receive()`.
    queue: VecDeque<ReceivedMessage>,
    /// Counts delivered (non-filtered) messages since the last `FLOW`; reset
    /// to zero every time it crosses `receiver_queue_size / 2`.
    available_permits: u32,
    ack_grouping: crate::acknowledgement::AckGroupingTracker,
    unacked: UnackedMessageTracker,
    negative_acks: crate::negative_acks::NegativeAckTracker,
    waiting_receivers: VecDeque<oneshot::Sender<Result<ReceivedMessage, ConsumerError>>>,
    inbox_tx: mpsc::UnboundedSender<Inbox>,
    last_dequeued_id: Option<MessageId>,
}

impl<Exe: Executor> ConsumerEngine<Exe> {
    fn sender(&self) -> Option<ConnectionSender> {
        self.handler.connection().map(|c| c.sender().clone())
    }

    fn ack_timeout_buckets(&self) -> usize {
        if self.options.ack_timeout.is_zero() {
            0
        } else {
            // a handful of buckets gives coarse-but-bounded expiry granularity
            // without needing one bucket per millisecond of timeout.
            10
        }
    }

    /// Whether `message_id` (and, for a batch sub-message, `batch_index`)
    /// falls at or before `start_message_id` and should be dropped, per
    /// the non-durable start-message filtering rule.
    fn is_prior(&self, message_id: &proto::MessageIdData, batch_index: Option<u32>) -> bool {
        if self.options.durable {
            return false;
        }
        let start = match &self.options.start_message_id {
            Some(s) => s,
            None => return false,
        };
        if message_id.ledger_id != start.ledger_id {
            return false;
        }
        if message_id.entry_id < start.entry_id {
            return true;
        }
        if message_id.entry_id > start.entry_id {
            return false;
        }
        match batch_index {
            Some(i) if start.batch_index >= 0 => {
                let i = i as i32;
                if self.options.reset_include_head {
                    i < start.batch_index
                } else {
                    i <= start.batch_index
                }
            }
            Some(_) => false,
            None => !self.options.reset_include_head,
        }
    }

    fn explode_and_enqueue(
        &mut self,
        message_id: proto::MessageIdData,
        redelivery_count: u32,
        meta: proto::MessageMetadata,
        payload: Vec<u8>,
    ) {
        let num_messages = meta.num_messages_in_batch.unwrap_or(1);
        let uncompressed_size = meta.uncompressed_size.unwrap_or(payload.len() as u32) as usize;
        let compression = meta
            .compression
            .and_then(proto::CompressionType::from_i32)
            .unwrap_or(proto::CompressionType::None);
        let decompressed = match compression::decompress(compression, &payload, uncompressed_size) {
            Ok(d) => d,
            Err(e) => {
                warn!("dropping undecodable message: {}", e);
                return;
            }
        };

        if num_messages <= 1 {
            if self.is_prior(&message_id, None) {
                return;
            }
            let id = MessageId::from_proto(self.topic.clone(), &message_id);
            self.available_permits += 1;
            self.maybe_send_flow();
            if self.ack_grouping.is_duplicate(&id) {
                return;
            }
            self.unacked.add(id.clone());
            self.queue.push_back(ReceivedMessage {
                id,
                payload: decompressed,
                properties: meta.properties.into_iter().map(|kv| (kv.key, kv.value)).collect(),
                partition_key: meta.partition_key,
                redelivery_count,
            });
            return;
        }

        let batch = match crate::message::decode_batch(&decompressed, num_messages) {
            Ok(b) => b,
            Err(e) => {
                warn!("dropping unparseable batch: {}", e);
                return;
            }
        };
        let acker = Arc::new(BatchAcker::new(num_messages as u32));
        for (index, (single_meta, single_payload)) in batch.into_iter().enumerate() {
            if self.is_prior(&message_id, Some(index as u32)) {
                continue;
            }
            let id = MessageId {
                ledger_id: message_id.ledger_id,
                entry_id: message_id.entry_id,
                partition: message_id.partition,
                topic: self.topic.clone(),
                message_type: crate::message_id::MessageIdType::Cumulative(index as u32, acker.clone()),
            };
            self.available_permits += 1;
            self.maybe_send_flow();
            if self.ack_grouping.is_duplicate(&id) {
                continue;
            }
            self.unacked.add(id.clone());
            self.queue.push_back(ReceivedMessage {
                id,
                payload: single_payload,
                properties: single_meta.properties.into_iter().map(|kv| (kv.key, kv.value)).collect(),
                partition_key: single_meta.partition_key,
                redelivery_count,
            });
        }
    }

    fn drain_queue_to_waiters(&mut self) {
        while let Some(msg) = self.queue.pop_front() {
            match self.waiting_receivers.pop_front() {
                Some(waiter) => {
                    self.last_dequeued_id = Some(msg.id.clone());
                    let _ = waiter.send(Ok(msg));
                }
                None => {
                    self.queue.push_front(msg);
                    break;
                }
            }
        }
    }

    /// Sends `FLOW(availablePermits)` and resets the counter once it
    /// reaches half the receiver queue size, per SPEC_FULL.md §4.9.
    fn maybe_send_flow(&mut self) {
        if self.available_permits < self.options.receiver_queue_size / 2 {
            return;
        }
        if let Some(sender) = self.sender() {
            if sender.send_flow(self.consumer_id, self.available_permits).is_ok() {
                self.available_permits = 0;
            }
        }
    }

    fn handle_ack(&mut self, id: MessageId, cumulative: bool, reply: oneshot::Sender<Result<(), ConsumerError>>) {
        let sender = match self.sender() {
            Some(s) => s,
            None => {
                let _ = reply.send(Err(ConsumerError::NotConnected));
                return;
            }
        };

        if cumulative {
            match &id.message_type {
                // SPEC_FULL.md §4.9: a cumulative ack landing inside a
                // not-yet-fully-acked batch can't be sent as-is (the broker
                // entry only advances once every sub-index is acked). Mark
                // the sub-index, and the first time this batch sees a
                // cumulative ack, advance the cursor up to the *previous*
                // entry so the subscription still makes forward progress.
                crate::message_id::MessageIdType::Cumulative(index, acker) => {
                    let batch_complete = acker.ack_cumulative(*index);
                    if !acker.prev_batch_cumulatively_acked() {
                        acker.set_prev_batch_cumulatively_acked();
                        if let Some(prev) = self.previous_entry_id(&id) {
                            self.unacked.remove_messages_till(&prev);
                            self.ack_grouping.add_cumulative(prev, &sender, self.consumer_id);
                        }
                    }
                    if batch_complete {
                        self.unacked.remove_messages_till(&id);
                        self.ack_grouping.add_cumulative(id, &sender, self.consumer_id);
                    }
                }
                crate::message_id::MessageIdType::Individual => {
                    self.unacked.remove_messages_till(&id);
                    self.ack_grouping.add_cumulative(id, &sender, self.consumer_id);
                }
            }
        } else {
            let completes_batch = match &id.message_type {
                crate::message_id::MessageIdType::Cumulative(index, acker) => acker.ack_individual(*index),
                crate::message_id::MessageIdType::Individual => true,
            };
            self.unacked.remove(&id);
            if completes_batch {
                self.ack_grouping.add_individual(id, &sender, self.consumer_id);
            }
        }
        let _ = reply.send(Ok(()));
    }

    /// The entry immediately before `id`'s, as a whole (non-batch) id.
    /// `None` at the start of the ledger, where there is nothing to advance.
    fn previous_entry_id(&self, id: &MessageId) -> Option<MessageId> {
        id.entry_id.checked_sub(1).map(|entry_id| MessageId {
            ledger_id: id.ledger_id,
            entry_id,
            partition: id.partition,
            topic: self.topic.clone(),
            message_type: crate::message_id::MessageIdType::Individual,
        })
    }

    fn handle_negative_ack(&mut self, id: MessageId) {
        self.unacked.remove(&id);
        self.negative_acks.add(id, Instant::now());
    }

    /// Sends `REDELIVER_UNACKNOWLEDGED_MESSAGES` in chunks of at most 1000
    /// ids, per SPEC_FULL.md §4.9.
    fn redeliver(&mut self, ids: Vec<MessageId>) {
        if ids.is_empty() {
            return;
        }
        let sender = match self.sender() {
            Some(s) => s,
            None => return,
        };
        for chunk in ids.chunks(1000) {
            let proto_ids = chunk.iter().map(|id| id.to_proto()).collect();
            let _ = sender.send_redeliver_unacknowledged_messages(self.consumer_id, proto_ids);
        }
    }

    /// Clears the local queue and unacked tracker and asks the broker to
    /// redeliver everything outstanding, for subscription types that do not
    /// support redelivering an explicit id list.
    fn redeliver_all(&mut self) {
        self.queue.clear();
        let ack_buckets = self.ack_timeout_buckets();
        self.unacked = if ack_buckets == 0 {
            UnackedMessageTracker::disabled()
        } else {
            UnackedMessageTracker::new(ack_buckets)
        };
        if let Some(sender) = self.sender() {
            let _ = sender.send_redeliver_unacknowledged_messages(self.consumer_id, Vec::new());
        }
    }

    fn negative_ack_tick(&mut self) {
        let expired = self.negative_acks.drain_expired(Instant::now());
        self.redeliver(expired);
    }

    fn unacked_tick(&mut self) {
        let expired = self.unacked.tick();
        self.redeliver(expired);
    }

    async fn ack_flush_tick(&mut self) {
        if let Some(sender) = self.sender() {
            if let Err(e) = self.ack_grouping.flush(&sender, self.consumer_id) {
                warn!("failed to flush grouped acks: {}", e);
            }
        }
    }

    async fn connect(&mut self) -> Result<(), ConnectionError> {
        loop {
            self.handler.begin_connecting();
            match self.try_connect_once().await {
                Ok(()) => return Ok(()),
                Err(e) => match self.handler.retry_decision(&e) {
                    crate::connection_handler::RetryDecision::RetryAfter(delay) => {
                        Exe::delay(delay).await;
                    }
                    crate::connection_handler::RetryDecision::GiveUp => return Err(e),
                },
            }
        }
    }

    /// `start_message_id` is only meaningful for non-durable subscriptions
    /// (SPEC_FULL.md §4.9): a durable subscription resumes from its
    /// broker-side cursor instead. On a first connect it is the caller's
    /// original `start_message_id`; on reconnect it is recomputed from the
    /// most recent message this consumer has seen — the tail of the local
    /// queue if anything is still queued, else the last dequeued message —
    /// so a reconnect does not replay everything already delivered.
    fn resume_start_message_id(&self) -> Option<proto::MessageIdData> {
        if self.options.durable {
            return None;
        }
        if let Some(last_queued) = self.queue.back() {
            return Some(last_queued.id.to_proto());
        }
        if let Some(dequeued) = &self.last_dequeued_id {
            return Some(dequeued.to_proto());
        }
        self.options.start_message_id.clone()
    }

    async fn try_connect_once(&mut self) -> Result<(), ConnectionError> {
        let broker = self
            .lookup
            .get_broker(&self.topic)
            .await
            .map_err(|e| ConnectionError::Unexpected(e.to_string()))?;
        let proxy_url = if broker.proxy {
            Some(broker.logical.to_string())
        } else {
            None
        };
        let connection = self.connection_manager.get_connection(&broker.physical, proxy_url).await?;

        let mut subscribe_options = self.options.clone();
        subscribe_options.start_message_id = self.resume_start_message_id();

        let (consumer_tx, mut consumer_rx) = mpsc::unbounded::<crate::message::Message>();
        connection
            .sender()
            .subscribe(
                consumer_tx,
                self.topic.clone(),
                self.options.subscription.clone(),
                self.options.sub_type,
                self.consumer_id,
                if self.consumer_name.is_empty() {
                    None
                } else {
                    Some(self.consumer_name.clone())
                },
                subscribe_options,
            )
            .await?;
        let sender = connection.sender().clone();
        self.handler.set_ready(connection);
        self.available_permits = 0;
        let _ = sender.send_flow(self.consumer_id, self.options.receiver_queue_size);

        let forward = self.inbox_tx.clone();
        let _ = Exe::spawn(Box::pin(async move {
            while let Some(msg) = consumer_rx.next().await {
                if forward.unbounded_send(Inbox::Wire(msg)).is_err() {
                    break;
                }
            }
            let _ = forward.unbounded_send(Inbox::Disconnected);
        }));
        Ok(())
    }

    fn fail_all_waiting(&mut self, error: ConsumerError) {
        for waiter in self.waiting_receivers.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Inbox>) {
        if let Err(e) = self.connect().await {
            error!("consumer for {} failed to connect: {}", self.topic, e);
            return;
        }

        let ack_buckets = self.ack_timeout_buckets();
        self.unacked = if ack_buckets == 0 {
            UnackedMessageTracker::disabled()
        } else {
            UnackedMessageTracker::new(ack_buckets)
        };
        let bucket_duration = if ack_buckets == 0 {
            None
        } else {
            Some(self.options.ack_timeout / ack_buckets as u32)
        };

        let mut unacked_tick = bucket_duration.map(Exe::interval);
        let mut negative_ack_tick = Some(Exe::interval(self.options.negative_ack_redelivery_delay.min(Duration::from_secs(1))));
        let mut ack_flush_tick = self.ack_grouping.flush_interval().map(Exe::interval);

        loop {
            let next_unacked = async {
                match &mut unacked_tick {
                    Some(i) => {
                        i.next().await;
                    }
                    None => futures::future::pending().await,
                }
            }
            .fuse();
            let next_negative = async {
                match &mut negative_ack_tick {
                    Some(i) => {
                        i.next().await;
                    }
                    None => futures::future::pending().await,
                }
            }
            .fuse();
            let next_flush = async {
                match &mut ack_flush_tick {
                    Some(i) => {
                        i.next().await;
                    }
                    None => futures::future::pending().await,
                }
            }
            .fuse();
            futures::pin_mut!(next_unacked, next_negative, next_flush);

            select! {
                msg = inbox.next() => {
                    match msg {
                        Some(Inbox::Receive { reply }) => {
                            self.waiting_receivers.push_back(reply);
                            self.drain_queue_to_waiters();
                        }
                        Some(Inbox::Ack { id, cumulative, reply }) => {
                            self.handle_ack(id, cumulative, reply);
                        }
                        Some(Inbox::NegativeAck { id }) => {
                            self.handle_negative_ack(id);
                        }
                        Some(Inbox::RedeliverUnacknowledged { reply }) => {
                            if self.handler.connection().is_none() {
                                let _ = reply.send(Err(ConsumerError::NotConnected));
                            } else {
                                match self.options.sub_type {
                                    SubType::Shared | SubType::KeyShared => {
                                        let ids: Vec<MessageId> = self.queue.iter().map(|m| m.id.clone()).collect();
                                        self.redeliver(ids);
                                    }
                                    SubType::Exclusive | SubType::Failover => {
                                        self.redeliver_all();
                                    }
                                }
                                let _ = reply.send(Ok(()));
                            }
                        }
                        Some(Inbox::Seek { id, publish_time, reply }) => {
                            if let Some(sender) = self.sender() {
                                let target = id.as_ref().map(|i| i.to_proto());
                                match sender.seek(self.consumer_id, target, publish_time).await {
                                    Ok(_) => {
                                        self.queue.clear();
                                        self.ack_grouping.clear();
                                        self.last_dequeued_id = id;
                                        let _ = reply.send(Ok(()));
                                    }
                                    Err(e) => {
                                        let _ = reply.send(Err(e.into()));
                                    }
                                }
                            } else {
                                let _ = reply.send(Err(ConsumerError::NotConnected));
                            }
                        }
                        Some(Inbox::HasMessageAvailable { reply }) => {
                            if !self.queue.is_empty() {
                                let _ = reply.send(Ok(true));
                                continue;
                            }
                            match self.sender() {
                                Some(sender) => match sender.get_last_message_id(self.consumer_id).await {
                                    Ok(resp) => {
                                        let has_more = match (&resp.last_message_id, &self.last_dequeued_id) {
                                            (Some(last), Some(dequeued)) => {
                                                MessageId::from_proto(self.topic.clone(), last) > *dequeued
                                            }
                                            (Some(_), None) => true,
                                            (None, _) => false,
                                        };
                                        let _ = reply.send(Ok(has_more));
                                    }
                                    Err(e) => {
                                        let _ = reply.send(Err(e.into()));
                                    }
                                },
                                None => {
                                    let _ = reply.send(Err(ConsumerError::NotConnected));
                                }
                            }
                        }
                        Some(Inbox::Unsubscribe { reply }) => {
                            match self.sender() {
                                Some(sender) => {
                                    let result = sender.unsubscribe(self.consumer_id).await;
                                    self.handler.set_closing();
                                    self.fail_all_waiting(ConsumerError::AlreadyClosed);
                                    let _ = reply.send(result.map(|_| ()).map_err(Into::into));
                                    self.handler.set_closed();
                                    return;
                                }
                                None => {
                                    let _ = reply.send(Err(ConsumerError::NotConnected));
                                }
                            }
                        }
                        Some(Inbox::Close { reply }) => {
                            self.handler.set_closing();
                            self.fail_all_waiting(ConsumerError::AlreadyClosed);
                            if let Some(sender) = self.sender() {
                                let _ = sender.close_consumer(self.consumer_id).await;
                            }
                            self.handler.set_closed();
                            let _ = reply.send(Ok(()));
                            return;
                        }
                        Some(Inbox::Wire(wire)) => {
                            if let Some(m) = wire.command.message {
                                if let Some(payload) = wire.payload {
                                    let redelivery_count = m.redelivery_count.unwrap_or(0);
                                    self.explode_and_enqueue(m.message_id, redelivery_count, payload.metadata, payload.data);
                                    self.drain_queue_to_waiters();
                                }
                            } else if wire.command.close_consumer.is_some() {
                                warn!("broker closed consumer {}", self.consumer_id);
                                self.handler.set_closing();
                            } else if wire.command.reached_end_of_topic.is_some() {
                                debug!("reached end of topic for consumer {}", self.consumer_id);
                            }
                        }
                        Some(Inbox::Disconnected) => {
                            self.handler.begin_connecting();
                            if self.connect().await.is_err() {
                                self.fail_all_waiting(ConsumerError::NotConnected);
                                return;
                            }
                        }
                        None => return,
                    }
                }
                _ = next_unacked => {
                    self.unacked_tick();
                }
                _ = next_negative => {
                    self.negative_ack_tick();
                }
                _ = next_flush => {
                    self.ack_flush_tick().await;
                }
            }
        }
    }
}

/// Constructs a `Consumer` and spawns its engine onto `Exe`. The fluent
/// builder surface that would normally call this is out of scope
/// (SPEC_FULL.md §1); callers assemble `ConsumerOptions` directly.
pub fn spawn<Exe: Executor>(
    consumer_id: u64,
    options: ConsumerOptions,
    connection_manager: Arc<ConnectionManager<Exe>>,
    lookup: Arc<LookupService<Exe>>,
) -> Consumer {
    let (tx, rx) = mpsc::unbounded();
    let topic = options.topic.clone();
    let operation_timeout = options.operation_timeout;
    let persistent = !topic.starts_with("non-persistent://");
    let ack_grouping = crate::acknowledgement::AckGroupingTracker::new(options.ack_grouping_interval, persistent);
    let negative_acks = crate::negative_acks::NegativeAckTracker::new(options.negative_ack_redelivery_delay);
    let engine = ConsumerEngine::<Exe> {
        consumer_id,
        consumer_name: options.consumer_name.clone().unwrap_or_default(),
        topic: topic.clone(),
        options,
        handler: ConnectionHandler::new(operation_timeout),
        connection_manager,
        lookup,
        queue: VecDeque::new(),
        available_permits: 0,
        ack_grouping,
        unacked: UnackedMessageTracker::disabled(),
        negative_acks,
        waiting_receivers: VecDeque::new(),
        inbox_tx: tx.clone(),
        last_dequeued_id: None,
    };
    let _ = Exe::spawn(Box::pin(engine.run(rx)));
    Consumer { tx, topic }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let options = ConsumerOptions::default();
        assert_eq!(options.receiver_queue_size, 1000);
        assert_eq!(options.sub_type, SubType::Exclusive);
        assert_eq!(options.initial_position, InitialPosition::Latest);
    }

    #[test]
    fn initial_position_maps_to_wire_enum() {
        let wire: proto::command_subscribe::InitialPosition = InitialPosition::Earliest.into();
        assert_eq!(wire, proto::command_subscribe::InitialPosition::Earliest);
    }
}
