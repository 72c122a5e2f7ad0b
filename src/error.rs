//! Error taxonomy. Transient failures are absorbed by the connection
//! handler / engine and only surface once the relevant budget is
//! exhausted; fatal failures surface immediately (see SPEC_FULL.md §7).

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::message::proto::ServerError;

/// Maps a broker-reported `ServerError` onto our own error, separating
/// retriable conditions from fatal ones (used by the connection handler's
/// `grabCnx` failure classification).
pub fn server_error(error: i32, message: String) -> ConnectionError {
    match ServerError::from_i32(error) {
        Some(ServerError::ServiceNotReady) | Some(ServerError::TooManyRequests) => {
            ConnectionError::Retriable(message)
        }
        Some(ServerError::AuthenticationError) | Some(ServerError::AuthorizationError) => {
            ConnectionError::AuthFailed(message)
        }
        Some(ServerError::TopicTerminatedError) => ConnectionError::TopicTerminated,
        Some(ServerError::ChecksumError) => ConnectionError::ChecksumFailed,
        Some(e) => ConnectionError::PulsarError(format!("{:?}", e), Some(message)),
        None => ConnectionError::Unexpected(format!(
            "unknown server error code {}: {}",
            error, message
        )),
    }
}

/// Transport/protocol-level failures: anything that can occur while
/// establishing or using a single `Connection`.
#[derive(Debug, Clone)]
pub enum ConnectionError {
    Io(Arc<std::io::Error>),
    Disconnected,
    PulsarError(String, Option<String>),
    /// A server error classified as transient by `server_error`.
    Retriable(String),
    AuthFailed(String),
    TopicTerminated,
    ChecksumFailed,
    NotFound,
    Shutdown,
    Unexpected(String),
    UnexpectedResponse(String),
}

impl ConnectionError {
    /// Whether the connection handler should retry-with-backoff (true) or
    /// transition straight to `Failed` (false). See SPEC_FULL.md §4.3.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ConnectionError::Io(_)
                | ConnectionError::Disconnected
                | ConnectionError::Retriable(_)
                | ConnectionError::NotFound
                | ConnectionError::UnexpectedResponse(_)
        )
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(Arc::new(e))
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "io error: {}", e),
            ConnectionError::Disconnected => write!(f, "connection disconnected"),
            ConnectionError::PulsarError(e, msg) => match msg {
                Some(msg) => write!(f, "server error {}: {}", e, msg),
                None => write!(f, "server error {}", e),
            },
            ConnectionError::Retriable(e) => write!(f, "retriable server error: {}", e),
            ConnectionError::AuthFailed(e) => write!(f, "authentication failed: {}", e),
            ConnectionError::TopicTerminated => write!(f, "topic terminated"),
            ConnectionError::ChecksumFailed => write!(f, "checksum validation failed"),
            ConnectionError::NotFound => write!(f, "address could not be resolved"),
            ConnectionError::Shutdown => write!(f, "executor could not spawn task"),
            ConnectionError::Unexpected(e) => write!(f, "unexpected error: {}", e),
            ConnectionError::UnexpectedResponse(e) => write!(f, "unexpected response: {}", e),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Errors surfaced by the Producer Engine's public futures.
#[derive(Debug, Clone)]
pub enum ProducerError {
    Connection(ConnectionError),
    NotConnected,
    AlreadyClosed,
    Timeout,
    ChecksumFailed,
    QueueFull,
    TopicTerminated,
    Custom(String),
}

impl From<ConnectionError> for ProducerError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Disconnected => ProducerError::NotConnected,
            ConnectionError::TopicTerminated => ProducerError::TopicTerminated,
            ConnectionError::ChecksumFailed => ProducerError::ChecksumFailed,
            e => ProducerError::Connection(e),
        }
    }
}

impl fmt::Display for ProducerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProducerError::Connection(e) => write!(f, "{}", e),
            ProducerError::NotConnected => write!(f, "producer not connected"),
            ProducerError::AlreadyClosed => write!(f, "producer already closed"),
            ProducerError::Timeout => write!(f, "send timed out"),
            ProducerError::ChecksumFailed => write!(f, "checksum validation failed"),
            ProducerError::QueueFull => write!(f, "pending message queue is full"),
            ProducerError::TopicTerminated => write!(f, "topic terminated"),
            ProducerError::Custom(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ProducerError {}

/// Errors surfaced by the Consumer Engine's public futures.
#[derive(Debug, Clone)]
pub enum ConsumerError {
    Connection(ConnectionError),
    NotConnected,
    AlreadyClosed,
    Timeout,
    SubscriptionMismatch,
    Custom(String),
}

impl From<ConnectionError> for ConsumerError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Disconnected => ConsumerError::NotConnected,
            e => ConsumerError::Connection(e),
        }
    }
}

impl fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerError::Connection(e) => write!(f, "{}", e),
            ConsumerError::NotConnected => write!(f, "consumer not connected"),
            ConsumerError::AlreadyClosed => write!(f, "consumer already closed"),
            ConsumerError::Timeout => write!(f, "operation timed out"),
            ConsumerError::SubscriptionMismatch => {
                write!(f, "subscription type does not match existing subscription")
            }
            ConsumerError::Custom(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ConsumerError {}

/// Errors surfaced by the Lookup Service.
#[derive(Debug, Clone)]
pub enum LookupError {
    Connection(ConnectionError),
    TooManyRedirects,
    Timeout,
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupError::Connection(e) => write!(f, "{}", e),
            LookupError::TooManyRedirects => write!(f, "lookup followed too many redirects"),
            LookupError::Timeout => write!(f, "lookup timed out"),
        }
    }
}

impl std::error::Error for LookupError {}

/// Crate-wide error, used by the client-facing creation APIs
/// (`create_producer`, `subscribe`, `create_reader`) that can fail for
/// reasons spanning more than one subsystem.
#[derive(Debug, Clone)]
pub enum Error {
    Connection(ConnectionError),
    Producer(ProducerError),
    Consumer(ConsumerError),
    Lookup(LookupError),
    InvalidConfiguration(String),
    Custom(String),
}

impl From<ConnectionError> for Error {
    fn from(e: ConnectionError) -> Self {
        Error::Connection(e)
    }
}
impl From<ProducerError> for Error {
    fn from(e: ProducerError) -> Self {
        Error::Producer(e)
    }
}
impl From<ConsumerError> for Error {
    fn from(e: ConsumerError) -> Self {
        Error::Consumer(e)
    }
}
impl From<LookupError> for Error {
    fn from(e: LookupError) -> Self {
        Error::Lookup(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "{}", e),
            Error::Producer(e) => write!(f, "{}", e),
            Error::Consumer(e) => write!(f, "{}", e),
            Error::Lookup(e) => write!(f, "{}", e),
            Error::InvalidConfiguration(e) => write!(f, "invalid configuration: {}", e),
            Error::Custom(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

/// A `Connection`-wide error slot shared between its reader task and
/// anything holding a handle to it, matching the teacher crate's
/// single-assignment "first error wins" semantics.
#[derive(Clone)]
pub struct SharedError(Arc<Mutex<Option<ConnectionError>>>);

impl SharedError {
    pub fn new() -> Self {
        SharedError(Arc::new(Mutex::new(None)))
    }

    pub fn set(&self, error: ConnectionError) {
        let mut lock = self.0.lock().unwrap();
        if lock.is_none() {
            *lock = Some(error);
        }
    }

    pub fn remove(&self) -> Option<ConnectionError> {
        self.0.lock().unwrap().take()
    }

    pub fn is_set(&self) -> bool {
        self.0.lock().unwrap().is_some()
    }
}

impl Default for SharedError {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_error_keeps_first_error() {
        let err = SharedError::new();
        err.set(ConnectionError::Disconnected);
        err.set(ConnectionError::NotFound);
        assert!(matches!(err.remove(), Some(ConnectionError::Disconnected)));
        assert!(err.remove().is_none());
    }

    #[test]
    fn retriable_classification_matches_handler_expectations() {
        assert!(ConnectionError::Disconnected.is_retriable());
        assert!(!ConnectionError::TopicTerminated.is_retriable());
        assert!(!ConnectionError::AuthFailed("x".into()).is_retriable());
    }
}
