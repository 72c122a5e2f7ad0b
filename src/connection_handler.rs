//! Connection Handler (SPEC_FULL.md §4.3): the per-producer/consumer
//! reconnection state machine. Owned exclusively by its engine's inbox loop
//! (see §5); nothing else ever touches it, so no locking is needed here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backoff::Backoff;
use crate::connection::Connection;
use crate::error::ConnectionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Initializing,
    Connecting,
    Ready,
    Reconnecting,
    Closing,
    Closed,
    Failed,
    Terminated,
}

/// What the engine should do after a failed `grabCnx` attempt.
pub(crate) enum RetryDecision {
    /// Wait `delay`, then try again.
    RetryAfter(Duration),
    /// The `OperationTimeout` budget is exhausted, or the error was fatal:
    /// transition to `Failed` and give up.
    GiveUp,
}

/// Tracks `ConnectionState` plus the backoff schedule and the
/// `OperationTimeout` budget across repeated `grabCnx` attempts
/// (SPEC_FULL.md §4.3's `min(backoff.next(), mandatoryStop - elapsed)`).
pub(crate) struct ConnectionHandler {
    state: ConnectionState,
    connection: Option<Arc<Connection>>,
    backoff: Backoff,
    operation_timeout: Duration,
    attempts_started_at: Option<Instant>,
}

impl ConnectionHandler {
    pub(crate) fn new(operation_timeout: Duration) -> ConnectionHandler {
        ConnectionHandler {
            state: ConnectionState::Initializing,
            connection: None,
            backoff: Backoff::default(),
            operation_timeout,
            attempts_started_at: None,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.clone()
    }

    /// `AlreadyClosed` on `Closing|Closed`, `NotConnected` on
    /// `Connecting|Reconnecting`, `Ok` otherwise (SPEC_FULL.md §4.3).
    pub(crate) fn check_if_active(&self) -> Result<(), ConnectionError> {
        match self.state {
            ConnectionState::Closing | ConnectionState::Closed => Err(ConnectionError::Shutdown),
            ConnectionState::Connecting | ConnectionState::Reconnecting => Err(ConnectionError::Disconnected),
            ConnectionState::Terminated => Err(ConnectionError::TopicTerminated),
            ConnectionState::Failed => Err(ConnectionError::Disconnected),
            ConnectionState::Initializing | ConnectionState::Ready => Ok(()),
        }
    }

    pub(crate) fn begin_connecting(&mut self) {
        self.state = if self.connection.is_some() {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };
        if self.attempts_started_at.is_none() {
            self.attempts_started_at = Some(Instant::now());
        }
    }

    pub(crate) fn set_ready(&mut self, connection: Arc<Connection>) {
        self.state = ConnectionState::Ready;
        self.connection = Some(connection);
        self.backoff.reset();
        self.attempts_started_at = None;
    }

    pub(crate) fn set_closing(&mut self) {
        self.state = ConnectionState::Closing;
    }

    pub(crate) fn set_closed(&mut self) {
        self.state = ConnectionState::Closed;
        self.connection = None;
    }

    pub(crate) fn set_terminated(&mut self) {
        self.state = ConnectionState::Terminated;
        self.connection = None;
    }

    /// Classifies a failed `grabCnx` attempt: retriable errors get a backoff
    /// delay bounded by the remaining `OperationTimeout` budget; fatal
    /// errors and exhausted budgets give up immediately.
    pub(crate) fn retry_decision(&mut self, error: &ConnectionError) -> RetryDecision {
        if !error.is_retriable() {
            self.state = ConnectionState::Failed;
            self.connection = None;
            return RetryDecision::GiveUp;
        }
        let elapsed = self.attempts_started_at.map(|t| t.elapsed()).unwrap_or_default();
        if elapsed >= self.operation_timeout {
            self.state = ConnectionState::Failed;
            self.connection = None;
            return RetryDecision::GiveUp;
        }
        let remaining = self.operation_timeout - elapsed;
        let delay = std::cmp::min(self.backoff.next(), remaining);
        RetryDecision::RetryAfter(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_initializing_and_has_no_connection() {
        let handler = ConnectionHandler::new(Duration::from_secs(30));
        assert_eq!(handler.state(), ConnectionState::Initializing);
        assert!(handler.connection().is_none());
        assert!(handler.check_if_active().is_ok());
    }

    #[test]
    fn reconnecting_after_ready_requires_having_been_ready_once() {
        let mut handler = ConnectionHandler::new(Duration::from_secs(30));
        handler.begin_connecting();
        assert_eq!(handler.state(), ConnectionState::Connecting);
    }

    #[test]
    fn fatal_error_gives_up_immediately() {
        let mut handler = ConnectionHandler::new(Duration::from_secs(30));
        handler.begin_connecting();
        match handler.retry_decision(&ConnectionError::AuthFailed("nope".into())) {
            RetryDecision::GiveUp => {}
            RetryDecision::RetryAfter(_) => panic!("expected GiveUp"),
        }
        assert_eq!(handler.state(), ConnectionState::Failed);
    }

    #[test]
    fn retriable_error_schedules_backoff_within_budget() {
        let mut handler = ConnectionHandler::new(Duration::from_secs(30));
        handler.begin_connecting();
        match handler.retry_decision(&ConnectionError::Disconnected) {
            RetryDecision::RetryAfter(d) => assert!(d <= Duration::from_secs(30)),
            RetryDecision::GiveUp => panic!("expected a retry"),
        }
        assert_eq!(handler.state(), ConnectionState::Connecting);
    }

    #[test]
    fn exhausted_operation_timeout_gives_up() {
        let mut handler = ConnectionHandler::new(Duration::from_millis(1));
        handler.begin_connecting();
        std::thread::sleep(Duration::from_millis(5));
        match handler.retry_decision(&ConnectionError::Disconnected) {
            RetryDecision::GiveUp => {}
            RetryDecision::RetryAfter(_) => panic!("expected GiveUp once the budget is exhausted"),
        }
        assert_eq!(handler.state(), ConnectionState::Failed);
    }
}
