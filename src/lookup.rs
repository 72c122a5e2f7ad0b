//! Lookup Service (SPEC_FULL.md §4.4): topic-to-broker resolution with
//! redirect following and retry-with-backoff, shared by every producer and
//! consumer created from the same client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use url::Url;

use crate::backoff::Backoff;
use crate::connection::Connection;
use crate::connection_manager::ConnectionManager;
use crate::error::{ConnectionError, LookupError};
use crate::executor::Executor;
use crate::message::proto::{self, command_lookup_topic_response::LookupType};

const MAX_LOOKUP_REDIRECTS: u32 = 20;

#[derive(Debug, Clone)]
pub struct BrokerAddress {
    /// The address to open a TCP connection to.
    pub physical: Url,
    /// The address the `SUBSCRIBE`/`PRODUCER` command should claim as the
    /// logical topic owner; differs from `physical` when proxied.
    pub logical: Url,
    pub proxy: bool,
}

pub struct LookupService<Exe: Executor> {
    manager: Arc<ConnectionManager<Exe>>,
    operation_timeout: Duration,
}

impl<Exe: Executor> LookupService<Exe> {
    pub fn new(manager: Arc<ConnectionManager<Exe>>, operation_timeout: Duration) -> LookupService<Exe> {
        LookupService {
            manager,
            operation_timeout,
        }
    }

    async fn service_connection(&self) -> Result<Arc<Connection>, ConnectionError> {
        let url = self.manager.service_url().clone();
        self.manager.get_connection(&url, None).await
    }

    /// Resolves the number of partitions for `topic` (0 for a non-partitioned topic).
    pub async fn get_partitioned_topic_metadata(&self, topic: &str) -> Result<u32, LookupError> {
        self.with_retry(|| async {
            let conn = self.service_connection().await?;
            let resp = conn.sender().lookup_partitioned_topic(topic.to_string()).await?;
            if let Some(error) = resp.error {
                return Err(crate::error::server_error(error as i32, resp.message.unwrap_or_default()));
            }
            Ok(resp.partitions.unwrap_or(0))
        })
        .await
    }

    /// Resolves the broker owning `topic`, following redirects up to
    /// `MAX_LOOKUP_REDIRECTS` hops.
    pub async fn get_broker(&self, topic: &str) -> Result<BrokerAddress, LookupError> {
        self.with_retry(|| async {
            let mut current_topic = topic.to_string();
            let mut authoritative = false;
            let mut conn = self.service_connection().await?;

            for _ in 0..MAX_LOOKUP_REDIRECTS {
                let resp = conn
                    .sender()
                    .lookup_topic(current_topic.clone(), authoritative)
                    .await?;
                if let Some(error) = resp.error {
                    return Err(crate::error::server_error(error as i32, resp.message.unwrap_or_default()));
                }
                authoritative = resp.authoritative.unwrap_or(false);
                match resp.response {
                    Some(r) if r == LookupType::Redirect as i32 => {
                        let redirect_url = resp
                            .broker_service_url
                            .ok_or_else(|| ConnectionError::UnexpectedResponse("redirect missing broker url".into()))?;
                        let url = Url::parse(&redirect_url)
                            .map_err(|e| ConnectionError::UnexpectedResponse(format!("invalid redirect url: {}", e)))?;
                        conn = self.manager.get_connection(&url, None).await?;
                        continue;
                    }
                    Some(r) if r == LookupType::Connect as i32 => {
                        let broker_url = resp
                            .broker_service_url
                            .ok_or_else(|| ConnectionError::UnexpectedResponse("lookup response missing broker url".into()))?;
                        let logical = Url::parse(&broker_url)
                            .map_err(|e| ConnectionError::UnexpectedResponse(format!("invalid broker url: {}", e)))?;
                        let proxy = resp.proxy_through_service_url.unwrap_or(false);
                        let physical = if proxy { conn.url().clone() } else { logical.clone() };
                        return Ok(BrokerAddress {
                            physical,
                            logical,
                            proxy,
                        });
                    }
                    _ => {
                        return Err(ConnectionError::UnexpectedResponse("unexpected lookup response".into()));
                    }
                }
            }
            Err(ConnectionError::UnexpectedResponse("too many lookup redirects".into()))
        })
        .await
        .map_err(|e| match e {
            LookupError::Connection(ConnectionError::UnexpectedResponse(ref m)) if m == "too many lookup redirects" => {
                LookupError::TooManyRedirects
            }
            e => e,
        })
    }

    pub async fn get_topics_under_namespace(
        &self,
        namespace: &str,
        mode: proto::get_topics::Mode,
    ) -> Result<Vec<String>, LookupError> {
        self.with_retry(|| async {
            let conn = self.service_connection().await?;
            let resp = conn
                .sender()
                .get_topics_of_namespace(namespace.to_string(), mode)
                .await?;
            Ok(resp.topics)
        })
        .await
    }

    /// Retries `op` with the shared backoff policy until it succeeds, a
    /// fatal error occurs, or `operation_timeout` is exhausted.
    async fn with_retry<F, Fut, T>(&self, op: F) -> Result<T, LookupError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ConnectionError>>,
    {
        let mut backoff = Backoff::default();
        let start = Instant::now();
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retriable() => return Err(LookupError::Connection(e)),
                Err(e) => {
                    if start.elapsed() >= self.operation_timeout {
                        warn!("lookup retry budget exhausted: {}", e);
                        return Err(LookupError::Timeout);
                    }
                    let delay = std::cmp::min(backoff.next(), self.operation_timeout - start.elapsed());
                    trace!("lookup retrying after {:?}: {}", delay, e);
                    Exe::delay(delay).await;
                }
            }
        }
    }
}
