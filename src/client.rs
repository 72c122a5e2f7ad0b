//! `Pulsar` (SPEC_FULL.md §6A): the composition root that owns the
//! `ConnectionManager`/`LookupService` pair a `Producer`, `Consumer`, or
//! `Reader` needs, and hands out process-wide unique producer/consumer ids.
//!
//! This is the contract the (out-of-scope, SPEC_FULL.md §1) fluent builder
//! surface would populate: no `.with_*` chaining, just plain option structs
//! passed straight to [`producer::spawn`]/[`consumer::spawn`]/[`Reader::new`].

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::connection::{Authentication, SerialId};
use crate::connection_manager::ConnectionManager;
use crate::consumer::{self, Consumer, ConsumerOptions};
use crate::error::ConnectionError;
use crate::executor::Executor;
use crate::lookup::LookupService;
use crate::producer::{self, Producer, ProducerOptions};
use crate::reader::{Reader, ReaderOptions};

#[derive(Clone)]
pub struct Pulsar<Exe: Executor> {
    manager: Arc<ConnectionManager<Exe>>,
    lookup: Arc<LookupService<Exe>>,
    ids: SerialId,
}

impl<Exe: Executor> Pulsar<Exe> {
    pub fn new(
        service_url: Url,
        auth: Option<Authentication>,
        executor: Exe,
        operation_timeout: Duration,
    ) -> Result<Pulsar<Exe>, ConnectionError> {
        let manager = Arc::new(ConnectionManager::new(service_url, auth, executor));
        let lookup = Arc::new(LookupService::new(manager.clone(), operation_timeout));
        Ok(Pulsar {
            manager,
            lookup,
            ids: SerialId::new(),
        })
    }

    pub fn producer(&self, options: ProducerOptions) -> Producer {
        producer::spawn(self.ids.get(), options, self.manager.clone(), self.lookup.clone())
    }

    pub fn consumer(&self, options: ConsumerOptions) -> Consumer {
        consumer::spawn(self.ids.get(), options, self.manager.clone(), self.lookup.clone())
    }

    pub fn reader(&self, options: ReaderOptions) -> Reader {
        Reader::new(options, self.manager.clone(), self.lookup.clone())
    }

    pub fn lookup(&self) -> &Arc<LookupService<Exe>> {
        &self.lookup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TokioExecutor;

    #[test]
    fn producer_and_consumer_share_the_connection_manager() {
        let url: Url = "pulsar://localhost:6650".parse().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let pulsar = Pulsar::new(url, None, TokioExecutor(rt.handle().clone()), Duration::from_secs(30)).unwrap();
        assert_eq!(pulsar.manager.service_url().as_str(), "pulsar://localhost:6650/");
    }
}
