//! Connection Pool (SPEC_FULL.md §4.2/§5): shares one `Connection` per
//! `(host, port)`, opening it lazily and tearing it down once the last
//! holder drops its `Arc`. Concurrent callers race to open the same
//! address; the loser's connection is simply discarded in favor of the
//! winner already stored in the pool, matching the teacher's
//! "longest holder keeps alive" ownership model.

use std::collections::HashMap;
use std::sync::Arc;

use futures::lock::Mutex;
use url::Url;

use crate::connection::{Authentication, Connection};
use crate::error::ConnectionError;
use crate::executor::Executor;

pub struct ConnectionManager<Exe: Executor> {
    service_url: Url,
    auth: Option<Authentication>,
    pool: Mutex<HashMap<String, Arc<Connection>>>,
    executor: Exe,
}

impl<Exe: Executor> ConnectionManager<Exe> {
    pub fn new(service_url: Url, auth: Option<Authentication>, executor: Exe) -> ConnectionManager<Exe> {
        ConnectionManager {
            service_url,
            auth,
            pool: Mutex::new(HashMap::new()),
            executor,
        }
    }

    pub fn service_url(&self) -> &Url {
        &self.service_url
    }

    /// Returns the pooled connection for `url` if it is still valid, opening
    /// a new one otherwise. `proxy_to_broker_url` is set when `url` is a
    /// proxy address and the broker behind it differs (SPEC_FULL.md §4.4).
    pub async fn get_connection(
        &self,
        url: &Url,
        proxy_to_broker_url: Option<String>,
    ) -> Result<Arc<Connection>, ConnectionError> {
        let key = format!("{}|{}", url, proxy_to_broker_url.as_deref().unwrap_or(""));
        {
            let pool = self.pool.lock().await;
            if let Some(conn) = pool.get(&key) {
                if conn.is_valid() {
                    return Ok(conn.clone());
                }
            }
        }

        debug!("opening new connection to {}", url);
        let connection = Arc::new(
            Connection::new(url.clone(), self.auth.clone(), proxy_to_broker_url, self.executor.clone()).await?,
        );

        let mut pool = self.pool.lock().await;
        // another task may have raced us; keep whichever is already valid.
        let winner = match pool.get(&key) {
            Some(existing) if existing.is_valid() => existing.clone(),
            _ => {
                pool.insert(key, connection.clone());
                connection
            }
        };
        Ok(winner)
    }

    /// Drops a connection known to be broken so the next `get_connection`
    /// opens a fresh one instead of handing out the dead one again.
    pub async fn evict(&self, url: &Url, proxy_to_broker_url: Option<&str>) {
        let key = format!("{}|{}", url, proxy_to_broker_url.unwrap_or(""));
        self.pool.lock().await.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_key_distinguishes_proxy_targets() {
        let a = format!("{}|{}", "pulsar://broker1:6650", "");
        let b = format!("{}|{}", "pulsar://broker1:6650", "pulsar://broker2:6650");
        assert_ne!(a, b);
    }
}
