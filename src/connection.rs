use std::collections::BTreeMap;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use futures::{
    channel::{mpsc, oneshot},
    task::{Context, Poll},
    Future, FutureExt, Sink, SinkExt, Stream, StreamExt,
};
use url::Url;

use crate::consumer::ConsumerOptions;
use crate::error::{ConnectionError, SharedError};
use crate::executor::{Executor, ExecutorKind};
use crate::message::{proto, BaseCommand, Codec, Message};
use crate::producer::ProducerOptions;

/// Messages the connection's reader task accepts out-of-band, i.e. not as
/// frames off the wire: waiter registration and producer/consumer routing
/// table maintenance. Posted from `ConnectionSender`, drained by `Receiver`.
pub(crate) enum Register {
    Request {
        key: RequestKey,
        resolver: oneshot::Sender<Message>,
    },
    Consumer {
        consumer_id: u64,
        resolver: mpsc::UnboundedSender<Message>,
    },
    Producer {
        producer_id: u64,
        resolver: mpsc::UnboundedSender<Message>,
    },
    RemoveConsumer {
        consumer_id: u64,
    },
    RemoveProducer {
        producer_id: u64,
    },
    Ping {
        resolver: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, PartialEq, Ord, PartialOrd, Eq)]
pub enum RequestKey {
    RequestId(u64),
    Producer { producer_id: u64 },
    Consumer { consumer_id: u64 },
}

/// Authentication parameters for the `CONNECT` command. The actual auth
/// primitive (token, oauth2, mutual TLS, ...) is an external collaborator;
/// this type only carries the bytes the wire command needs.
#[derive(Clone)]
pub struct Authentication {
    pub name: String,
    pub data: Vec<u8>,
}

/// Drains the framed socket and dispatches every decoded `Message` either to
/// a waiting oneshot (request/response RPCs) or to a registered
/// producer/consumer inbox (PUSH frames). Runs as one detached task per
/// connection; it is the only code that ever mutates its routing tables.
pub(crate) struct Receiver<S: Stream<Item = Result<Message, ConnectionError>>> {
    inbound: Pin<Box<S>>,
    outbound: mpsc::UnboundedSender<Message>,
    error: SharedError,
    pending_requests: BTreeMap<RequestKey, oneshot::Sender<Message>>,
    received_messages: BTreeMap<RequestKey, Message>,
    consumers: BTreeMap<u64, mpsc::UnboundedSender<Message>>,
    producers: BTreeMap<u64, mpsc::UnboundedSender<Message>>,
    registrations: Pin<Box<mpsc::UnboundedReceiver<Register>>>,
    shutdown: Pin<Box<oneshot::Receiver<()>>>,
    ping: Option<oneshot::Sender<()>>,
}

impl<S: Stream<Item = Result<Message, ConnectionError>>> Receiver<S> {
    pub fn new(
        inbound: S,
        outbound: mpsc::UnboundedSender<Message>,
        error: SharedError,
        registrations: mpsc::UnboundedReceiver<Register>,
        shutdown: oneshot::Receiver<()>,
    ) -> Receiver<S> {
        Receiver {
            inbound: Box::pin(inbound),
            outbound,
            error,
            pending_requests: BTreeMap::new(),
            received_messages: BTreeMap::new(),
            consumers: BTreeMap::new(),
            producers: BTreeMap::new(),
            registrations: Box::pin(registrations),
            shutdown: Box::pin(shutdown),
            ping: None,
        }
    }

    /// On connection loss every registered producer/consumer inbox is
    /// dropped and every pending RPC waiter is dropped too, so nothing is
    /// left silently hanging on a `oneshot::Canceled`.
    fn fail_everyone(&mut self) {
        self.pending_requests.clear();
        self.consumers.clear();
        self.producers.clear();
    }
}

impl<S: Stream<Item = Result<Message, ConnectionError>>> Future for Receiver<S> {
    type Output = Result<(), ()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.shutdown.as_mut().poll(cx) {
            Poll::Ready(_) => {
                self.fail_everyone();
                return Poll::Ready(Err(()));
            }
            Poll::Pending => {}
        }

        // Registrations arrive far slower than wire frames (bounded by how
        // fast producers/consumers are created), so draining them fully on
        // every poll before touching `inbound` is cheap and starvation-free.
        loop {
            match self.registrations.as_mut().poll_next(cx) {
                Poll::Ready(Some(Register::Request { key, resolver })) => {
                    match self.received_messages.remove(&key) {
                        Some(msg) => {
                            let _ = resolver.send(msg);
                        }
                        None => {
                            self.pending_requests.insert(key, resolver);
                        }
                    }
                }
                Poll::Ready(Some(Register::Consumer {
                    consumer_id,
                    resolver,
                })) => {
                    self.consumers.insert(consumer_id, resolver);
                }
                Poll::Ready(Some(Register::Producer {
                    producer_id,
                    resolver,
                })) => {
                    self.producers.insert(producer_id, resolver);
                }
                Poll::Ready(Some(Register::RemoveConsumer { consumer_id })) => {
                    self.consumers.remove(&consumer_id);
                }
                Poll::Ready(Some(Register::RemoveProducer { producer_id })) => {
                    self.producers.remove(&producer_id);
                }
                Poll::Ready(Some(Register::Ping { resolver })) => {
                    self.ping = Some(resolver);
                }
                Poll::Ready(None) => {
                    self.error.set(ConnectionError::Disconnected);
                    self.fail_everyone();
                    return Poll::Ready(Err(()));
                }
                Poll::Pending => break,
            }
        }

        loop {
            match self.inbound.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(msg))) => match msg {
                    Message {
                        command: BaseCommand { ping: Some(_), .. },
                        ..
                    } => {
                        let _ = self.outbound.unbounded_send(messages::pong());
                    }
                    Message {
                        command: BaseCommand { pong: Some(_), .. },
                        ..
                    } => {
                        if let Some(sender) = self.ping.take() {
                            let _ = sender.send(());
                        }
                    }
                    msg => match msg.request_key() {
                        Some(key @ RequestKey::RequestId(_)) => {
                            if let Some(resolver) = self.pending_requests.remove(&key) {
                                let _ = resolver.send(msg);
                            } else {
                                self.received_messages.insert(key, msg);
                            }
                        }
                        Some(RequestKey::Producer { producer_id }) => {
                            if let Some(producer) = self.producers.get_mut(&producer_id) {
                                let _ = producer.unbounded_send(msg);
                            }
                        }
                        Some(RequestKey::Consumer { consumer_id }) => {
                            if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
                                let _ = consumer.unbounded_send(msg);
                            }
                        }
                        None => {
                            warn!("received unexpected message, dropping: {:?}", msg.command);
                        }
                    },
                },
                Poll::Ready(None) => {
                    self.error.set(ConnectionError::Disconnected);
                    self.fail_everyone();
                    return Poll::Ready(Err(()));
                }
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Err(e))) => {
                    self.error.set(e);
                    self.fail_everyone();
                    return Poll::Ready(Err(()));
                }
            }
        }
    }
}

/// Process-wide monotonic id generator, used for both request ids and
/// (cloned per-producer) sequence ids.
#[derive(Clone)]
pub struct SerialId(Arc<AtomicUsize>);

impl Default for SerialId {
    fn default() -> Self {
        SerialId(Arc::new(AtomicUsize::new(0)))
    }
}

impl SerialId {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn get(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) as u64
    }
}

/// An owned, cloneable handle for sending frames on a connection and
/// correlating replies. Producer/Consumer engines hold one of these rather
/// than the `Connection` itself, so a reconnect only requires swapping it.
#[derive(Clone)]
pub struct ConnectionSender {
    tx: mpsc::UnboundedSender<Message>,
    registrations: mpsc::UnboundedSender<Register>,
    request_id: SerialId,
    error: SharedError,
}

impl ConnectionSender {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<Message>,
        registrations: mpsc::UnboundedSender<Register>,
        request_id: SerialId,
        error: SharedError,
    ) -> ConnectionSender {
        ConnectionSender {
            tx,
            registrations,
            request_id,
            error,
        }
    }

    /// Fire-and-forget: the Producer Engine uses this for `SEND` frames and
    /// relies on its registered inbox to observe the eventual
    /// `SEND_RECEIPT`/`SEND_ERROR` push rather than awaiting a reply inline.
    pub(crate) fn send_message_frame(
        &self,
        producer_id: u64,
        producer_name: String,
        sequence_id: u64,
        message: crate::producer::PendingMessage,
    ) -> bool {
        let msg = messages::send(producer_id, producer_name, sequence_id, message);
        self.tx.unbounded_send(msg).is_ok()
    }

    pub async fn send_ping(&self) -> Result<(), ConnectionError> {
        let (resolver, response) = oneshot::channel();
        trace!("sending ping");

        match (
            self.registrations
                .unbounded_send(Register::Ping { resolver }),
            self.tx.unbounded_send(messages::ping()),
        ) {
            (Ok(_), Ok(_)) => response
                .await
                .map_err(|_: oneshot::Canceled| ConnectionError::Disconnected)
                .map(|_| trace!("received pong")),
            _ => Err(ConnectionError::Disconnected),
        }
    }

    pub async fn lookup_topic<T: Into<String>>(
        &self,
        topic: T,
        authoritative: bool,
    ) -> Result<proto::CommandLookupTopicResponse, ConnectionError> {
        let request_id = self.request_id.get();
        let msg = messages::lookup_topic(topic.into(), authoritative, request_id);
        self.send_message(msg, RequestKey::RequestId(request_id), |resp| {
            resp.command.lookup_topic_response
        })
        .await
    }

    pub async fn lookup_partitioned_topic<T: Into<String>>(
        &self,
        topic: T,
    ) -> Result<proto::CommandPartitionedTopicMetadataResponse, ConnectionError> {
        let request_id = self.request_id.get();
        let msg = messages::lookup_partitioned_topic(topic.into(), request_id);
        self.send_message(msg, RequestKey::RequestId(request_id), |resp| {
            resp.command.partition_metadata_response
        })
        .await
    }

    pub async fn create_producer(
        &self,
        resolver: mpsc::UnboundedSender<Message>,
        topic: String,
        producer_id: u64,
        producer_name: Option<String>,
        options: ProducerOptions,
    ) -> Result<proto::CommandProducerSuccess, ConnectionError> {
        let request_id = self.request_id.get();
        let msg = messages::create_producer(topic, producer_name, producer_id, request_id, options);
        if self
            .registrations
            .unbounded_send(Register::Producer {
                producer_id,
                resolver,
            })
            .is_err()
        {
            self.error.set(ConnectionError::Disconnected);
            return Err(ConnectionError::Disconnected);
        }
        self.send_message(msg, RequestKey::RequestId(request_id), |resp| {
            resp.command.producer_success
        })
        .await
    }

    pub async fn get_topics_of_namespace(
        &self,
        namespace: String,
        mode: proto::get_topics::Mode,
    ) -> Result<proto::CommandGetTopicsOfNamespaceResponse, ConnectionError> {
        let request_id = self.request_id.get();
        let msg = messages::get_topics_of_namespace(request_id, namespace, mode);
        self.send_message(msg, RequestKey::RequestId(request_id), |resp| {
            resp.command.get_topics_of_namespace_response
        })
        .await
    }

    pub async fn close_producer(&self, producer_id: u64) -> Result<proto::CommandSuccess, ConnectionError> {
        let request_id = self.request_id.get();
        let msg = messages::close_producer(producer_id, request_id);
        let result = self
            .send_message(msg, RequestKey::RequestId(request_id), |resp| resp.command.success)
            .await;
        let _ = self
            .registrations
            .unbounded_send(Register::RemoveProducer { producer_id });
        result
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn subscribe(
        &self,
        resolver: mpsc::UnboundedSender<Message>,
        topic: String,
        subscription: String,
        sub_type: proto::command_subscribe::SubType,
        consumer_id: u64,
        consumer_name: Option<String>,
        options: ConsumerOptions,
    ) -> Result<proto::CommandSuccess, ConnectionError> {
        let request_id = self.request_id.get();
        let msg = messages::subscribe(
            topic,
            subscription,
            sub_type,
            consumer_id,
            request_id,
            consumer_name,
            options,
        );
        if self
            .registrations
            .unbounded_send(Register::Consumer {
                consumer_id,
                resolver,
            })
            .is_err()
        {
            self.error.set(ConnectionError::Disconnected);
            return Err(ConnectionError::Disconnected);
        }
        self.send_message(msg, RequestKey::RequestId(request_id), |resp| resp.command.success)
            .await
    }

    pub fn send_flow(&self, consumer_id: u64, message_permits: u32) -> Result<(), ConnectionError> {
        self.tx
            .unbounded_send(messages::flow(consumer_id, message_permits))
            .map_err(|_| ConnectionError::Disconnected)
    }

    pub fn send_ack(
        &self,
        consumer_id: u64,
        message_id: Vec<proto::MessageIdData>,
        cumulative: bool,
    ) -> Result<(), ConnectionError> {
        self.tx
            .unbounded_send(messages::ack(consumer_id, message_id, cumulative))
            .map_err(|_| ConnectionError::Disconnected)
    }

    pub fn send_redeliver_unacknowledged_messages(
        &self,
        consumer_id: u64,
        message_ids: Vec<proto::MessageIdData>,
    ) -> Result<(), ConnectionError> {
        self.tx
            .unbounded_send(messages::redeliver_unacknowledged_messages(consumer_id, message_ids))
            .map_err(|_| ConnectionError::Disconnected)
    }

    pub async fn seek(
        &self,
        consumer_id: u64,
        message_id: Option<proto::MessageIdData>,
        message_publish_time: Option<u64>,
    ) -> Result<proto::CommandSuccess, ConnectionError> {
        let request_id = self.request_id.get();
        let msg = messages::seek(consumer_id, request_id, message_id, message_publish_time);
        self.send_message(msg, RequestKey::RequestId(request_id), |resp| resp.command.success)
            .await
    }

    pub async fn get_last_message_id(
        &self,
        consumer_id: u64,
    ) -> Result<proto::CommandGetLastMessageIdResponse, ConnectionError> {
        let request_id = self.request_id.get();
        let msg = messages::get_last_message_id(consumer_id, request_id);
        self.send_message(msg, RequestKey::RequestId(request_id), |resp| {
            resp.command.get_last_message_id_response
        })
        .await
    }

    pub async fn unsubscribe(&self, consumer_id: u64) -> Result<proto::CommandSuccess, ConnectionError> {
        let request_id = self.request_id.get();
        let msg = messages::unsubscribe(consumer_id, request_id);
        self.send_message(msg, RequestKey::RequestId(request_id), |resp| resp.command.success)
            .await
    }

    pub async fn close_consumer(&self, consumer_id: u64) -> Result<proto::CommandSuccess, ConnectionError> {
        let request_id = self.request_id.get();
        let msg = messages::close_consumer(consumer_id, request_id);
        let result = self
            .send_message(msg, RequestKey::RequestId(request_id), |resp| resp.command.success)
            .await;
        let _ = self
            .registrations
            .unbounded_send(Register::RemoveConsumer { consumer_id });
        result
    }

    async fn send_message<R: Debug, F>(&self, msg: Message, key: RequestKey, extract: F) -> Result<R, ConnectionError>
    where
        F: FnOnce(Message) -> Option<R>,
    {
        let (resolver, response) = oneshot::channel();
        trace!("sending message(key = {:?}): type {:?}", key, msg.command.type_);

        match (
            self.registrations
                .unbounded_send(Register::Request { key, resolver }),
            self.tx.unbounded_send(msg),
        ) {
            (Ok(_), Ok(_)) => response
                .await
                .map_err(|_: oneshot::Canceled| {
                    self.error.set(ConnectionError::Disconnected);
                    ConnectionError::Disconnected
                })
                .and_then(|message| extract_message(message, extract)),
            _ => Err(ConnectionError::Disconnected),
        }
    }
}

pub struct Connection {
    id: i64,
    url: Url,
    sender: ConnectionSender,
    receiver_shutdown: Option<oneshot::Sender<()>>,
}

impl Connection {
    pub async fn new<Exe: Executor>(
        url: Url,
        auth_data: Option<Authentication>,
        proxy_to_broker_url: Option<String>,
        executor: Exe,
    ) -> Result<Connection, ConnectionError> {
        if url.scheme() != "pulsar" {
            error!("invalid scheme: {}", url.scheme());
            return Err(ConnectionError::NotFound);
        }

        let u = url.clone();
        let address: Option<SocketAddr> = Exe::spawn_blocking(move || {
            use rand::Rng;
            let addrs: Vec<SocketAddr> = u.socket_addrs(|| Some(6650)).unwrap_or_default();
            if addrs.is_empty() {
                None
            } else {
                let index = rand::thread_rng().gen_range(0..addrs.len());
                addrs.get(index).copied()
            }
        })
        .await
        .flatten();

        let address = address.ok_or(ConnectionError::NotFound)?;

        debug!("connecting to {} ({})", url, address);
        let (sender, receiver_shutdown) =
            Connection::prepare_stream::<Exe>(address, auth_data, proxy_to_broker_url).await?;
        let _ = executor;

        Ok(Connection {
            id: rand::random(),
            url,
            sender,
            receiver_shutdown: Some(receiver_shutdown),
        })
    }

    async fn prepare_stream<Exe: Executor>(
        address: SocketAddr,
        auth_data: Option<Authentication>,
        proxy_to_broker_url: Option<String>,
    ) -> Result<(ConnectionSender, oneshot::Sender<()>), ConnectionError> {
        match Exe::kind() {
            #[cfg(feature = "tokio-runtime")]
            ExecutorKind::Tokio => {
                let stream = tokio::net::TcpStream::connect(&address)
                    .await
                    .map(|stream| tokio_util::codec::Framed::new(stream, Codec))?;
                Connection::connect::<Exe, _>(stream, auth_data, proxy_to_broker_url).await
            }
            #[cfg(not(feature = "tokio-runtime"))]
            ExecutorKind::Tokio => {
                unimplemented!("the tokio-runtime cargo feature is not active")
            }
            #[cfg(feature = "async-std-runtime")]
            ExecutorKind::AsyncStd => {
                let stream = async_std::net::TcpStream::connect(&address)
                    .await
                    .map(|stream| asynchronous_codec::Framed::new(stream, Codec))?;
                Connection::connect::<Exe, _>(stream, auth_data, proxy_to_broker_url).await
            }
            #[cfg(not(feature = "async-std-runtime"))]
            ExecutorKind::AsyncStd => {
                unimplemented!("the async-std-runtime cargo feature is not active")
            }
        }
    }

    async fn connect<Exe, S>(
        mut stream: S,
        auth_data: Option<Authentication>,
        proxy_to_broker_url: Option<String>,
    ) -> Result<(ConnectionSender, oneshot::Sender<()>), ConnectionError>
    where
        Exe: Executor,
        S: Stream<Item = Result<Message, ConnectionError>>,
        S: Sink<Message, Error = ConnectionError>,
        S: Send + Unpin + 'static,
    {
        stream.send(messages::connect(auth_data, proxy_to_broker_url)).await?;

        match stream.next().await {
            Some(Ok(Message {
                command: proto::BaseCommand { error: Some(e), .. },
                ..
            })) => Err(crate::error::server_error(e.error, e.message)),
            Some(Ok(msg)) => {
                let kind = msg.command.type_;
                msg.command.connected.ok_or_else(|| {
                    ConnectionError::UnexpectedResponse(format!("unexpected command type {} after CONNECT", kind))
                })?;
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Err(ConnectionError::Disconnected),
        }?;

        let (mut sink, stream) = stream.split();
        let (tx, mut rx) = mpsc::unbounded();
        let (registrations_tx, registrations_rx) = mpsc::unbounded();
        let error = SharedError::new();
        let (receiver_shutdown_tx, receiver_shutdown_rx) = oneshot::channel();

        if Exe::spawn(Box::pin(
            Receiver::new(stream, tx.clone(), error.clone(), registrations_rx, receiver_shutdown_rx)
                .map(|_| ()),
        ))
        .is_err()
        {
            error!("the executor could not spawn the receiver task");
            return Err(ConnectionError::Shutdown);
        }

        let writer_error = error.clone();
        if Exe::spawn(Box::pin(async move {
            while let Some(msg) = rx.next().await {
                if let Err(e) = sink.send(msg).await {
                    writer_error.set(e);
                    break;
                }
            }
        }))
        .is_err()
        {
            error!("the executor could not spawn the writer task");
            return Err(ConnectionError::Shutdown);
        }

        let sender = ConnectionSender::new(tx, registrations_tx, SerialId::new(), error);
        Ok((sender, receiver_shutdown_tx))
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The first error recorded by this connection's tasks, if any, taking
    /// it out of the shared slot.
    pub fn error(&self) -> Option<ConnectionError> {
        self.sender.error.remove()
    }

    pub fn is_valid(&self) -> bool {
        !self.sender.error.is_set()
    }

    pub fn sender(&self) -> &ConnectionSender {
        &self.sender
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(shutdown) = self.receiver_shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

fn extract_message<T: Debug, F>(message: Message, extract: F) -> Result<T, ConnectionError>
where
    F: FnOnce(Message) -> Option<T>,
{
    if let Some(e) = message.command.error.clone() {
        return Err(crate::error::server_error(e.error, e.message));
    }
    let kind = message.command.type_;
    match extract(message) {
        Some(extracted) => {
            trace!("extracted message: {:?}", extracted);
            Ok(extracted)
        }
        None => Err(ConnectionError::UnexpectedResponse(format!(
            "unexpected command type {} for this request",
            kind
        ))),
    }
}

pub(crate) mod messages {
    use crate::connection::Authentication;
    use crate::consumer::ConsumerOptions;
    use crate::message::{proto, Message, Payload};
    use crate::producer::{PendingMessage, ProducerOptions};

    pub fn connect(auth: Option<Authentication>, proxy_to_broker_url: Option<String>) -> Message {
        let (auth_method_name, auth_data) = match auth {
            Some(auth) => (Some(auth.name), Some(auth.data)),
            None => (None, None),
        };

        Message {
            command: proto::BaseCommand {
                type_: proto::base_command::Type::Connect as i32,
                connect: Some(proto::CommandConnect {
                    auth_method_name,
                    auth_data,
                    proxy_to_broker_url,
                    client_version: String::from("pulsar-core-rs/0.1"),
                    protocol_version: Some(18),
                    ..Default::default()
                }),
                ..Default::default()
            },
            payload: None,
        }
    }

    pub fn ping() -> Message {
        Message {
            command: proto::BaseCommand {
                type_: proto::base_command::Type::Ping as i32,
                ping: Some(proto::CommandPing {}),
                ..Default::default()
            },
            payload: None,
        }
    }

    pub fn pong() -> Message {
        Message {
            command: proto::BaseCommand {
                type_: proto::base_command::Type::Pong as i32,
                pong: Some(proto::CommandPong {}),
                ..Default::default()
            },
            payload: None,
        }
    }

    pub fn create_producer(
        topic: String,
        producer_name: Option<String>,
        producer_id: u64,
        request_id: u64,
        options: ProducerOptions,
    ) -> Message {
        Message {
            command: proto::BaseCommand {
                type_: proto::base_command::Type::Producer as i32,
                producer: Some(proto::CommandProducer {
                    topic,
                    producer_id,
                    request_id,
                    producer_name,
                    encrypted: Some(false),
                    metadata: options
                        .metadata
                        .into_iter()
                        .map(|(key, value)| proto::KeyValue { key, value })
                        .collect(),
                    schema: None,
                }),
                ..Default::default()
            },
            payload: None,
        }
    }

    pub fn get_topics_of_namespace(request_id: u64, namespace: String, mode: proto::get_topics::Mode) -> Message {
        Message {
            command: proto::BaseCommand {
                type_: proto::base_command::Type::GetTopicsOfNamespace as i32,
                get_topics_of_namespace: Some(proto::CommandGetTopicsOfNamespace {
                    request_id,
                    namespace,
                    mode: Some(mode as i32),
                }),
                ..Default::default()
            },
            payload: None,
        }
    }

    pub(crate) fn send(producer_id: u64, producer_name: String, sequence_id: u64, message: PendingMessage) -> Message {
        let metadata = message.build_metadata(producer_name, sequence_id);
        let num_messages_in_batch = message.num_messages_in_batch;

        Message {
            command: proto::BaseCommand {
                type_: proto::base_command::Type::Send as i32,
                send: Some(proto::CommandSend {
                    producer_id,
                    sequence_id,
                    num_messages: num_messages_in_batch,
                }),
                ..Default::default()
            },
            payload: Some(Payload {
                metadata,
                data: message.payload,
            }),
        }
    }

    pub fn lookup_topic(topic: String, authoritative: bool, request_id: u64) -> Message {
        Message {
            command: proto::BaseCommand {
                type_: proto::base_command::Type::Lookup as i32,
                lookup_topic: Some(proto::CommandLookupTopic {
                    topic,
                    request_id,
                    authoritative: Some(authoritative),
                }),
                ..Default::default()
            },
            payload: None,
        }
    }

    pub fn lookup_partitioned_topic(topic: String, request_id: u64) -> Message {
        Message {
            command: proto::BaseCommand {
                type_: proto::base_command::Type::PartitionedMetadata as i32,
                partition_metadata: Some(proto::CommandPartitionedTopicMetadata {
                    topic,
                    request_id,
                    original_authoritative: None,
                }),
                ..Default::default()
            },
            payload: None,
        }
    }

    pub fn close_producer(producer_id: u64, request_id: u64) -> Message {
        Message {
            command: proto::BaseCommand {
                type_: proto::base_command::Type::CloseProducer as i32,
                close_producer: Some(proto::CommandCloseProducer { producer_id, request_id }),
                ..Default::default()
            },
            payload: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn subscribe(
        topic: String,
        subscription: String,
        sub_type: proto::command_subscribe::SubType,
        consumer_id: u64,
        request_id: u64,
        consumer_name: Option<String>,
        options: ConsumerOptions,
    ) -> Message {
        Message {
            command: proto::BaseCommand {
                type_: proto::base_command::Type::Subscribe as i32,
                subscribe: Some(proto::CommandSubscribe {
                    topic,
                    subscription,
                    sub_type: sub_type as i32,
                    consumer_id,
                    request_id,
                    consumer_name,
                    priority_level: None,
                    durable: Some(options.durable),
                    metadata: Vec::new(),
                    read_compacted: Some(options.read_compacted),
                    initial_position: Some(options.initial_position as i32),
                    schema: None,
                    start_message_id: options.start_message_id,
                }),
                ..Default::default()
            },
            payload: None,
        }
    }

    pub fn flow(consumer_id: u64, message_permits: u32) -> Message {
        Message {
            command: proto::BaseCommand {
                type_: proto::base_command::Type::Flow as i32,
                flow: Some(proto::CommandFlow {
                    consumer_id,
                    message_permits,
                }),
                ..Default::default()
            },
            payload: None,
        }
    }

    pub fn ack(consumer_id: u64, message_id: Vec<proto::MessageIdData>, cumulative: bool) -> Message {
        Message {
            command: proto::BaseCommand {
                type_: proto::base_command::Type::Ack as i32,
                ack: Some(proto::CommandAck {
                    consumer_id,
                    ack_type: if cumulative {
                        proto::command_ack::AckType::Cumulative as i32
                    } else {
                        proto::command_ack::AckType::Individual as i32
                    },
                    message_id,
                    validation_error: None,
                    properties: Vec::new(),
                }),
                ..Default::default()
            },
            payload: None,
        }
    }

    pub fn redeliver_unacknowledged_messages(consumer_id: u64, message_ids: Vec<proto::MessageIdData>) -> Message {
        Message {
            command: proto::BaseCommand {
                type_: proto::base_command::Type::RedeliverUnacknowledgedMessages as i32,
                redeliver_unacknowledged_messages: Some(proto::CommandRedeliverUnacknowledgedMessages {
                    consumer_id,
                    message_ids,
                }),
                ..Default::default()
            },
            payload: None,
        }
    }

    pub fn seek(
        consumer_id: u64,
        request_id: u64,
        message_id: Option<proto::MessageIdData>,
        message_publish_time: Option<u64>,
    ) -> Message {
        Message {
            command: proto::BaseCommand {
                type_: proto::base_command::Type::Seek as i32,
                seek: Some(proto::CommandSeek {
                    consumer_id,
                    request_id,
                    message_id,
                    message_publish_time,
                }),
                ..Default::default()
            },
            payload: None,
        }
    }

    pub fn get_last_message_id(consumer_id: u64, request_id: u64) -> Message {
        Message {
            command: proto::BaseCommand {
                type_: proto::base_command::Type::GetLastMessageId as i32,
                get_last_message_id: Some(proto::CommandGetLastMessageId { consumer_id, request_id }),
                ..Default::default()
            },
            payload: None,
        }
    }

    pub fn unsubscribe(consumer_id: u64, request_id: u64) -> Message {
        Message {
            command: proto::BaseCommand {
                type_: proto::base_command::Type::Unsubscribe as i32,
                unsubscribe: Some(proto::CommandUnsubscribe { consumer_id, request_id }),
                ..Default::default()
            },
            payload: None,
        }
    }

    pub fn close_consumer(consumer_id: u64, request_id: u64) -> Message {
        Message {
            command: proto::BaseCommand {
                type_: proto::base_command::Type::CloseConsumer as i32,
                close_consumer: Some(proto::CommandCloseConsumer { consumer_id, request_id }),
                ..Default::default()
            },
            payload: None,
        }
    }
}
