//! Throughput monitoring across connections.
//!
//! A [`Throughput`] monitor is attached to one or more live clients. Every
//! call made on an attached client adds to the monitor's counters; reading
//! [`Throughput::status`] takes a snapshot. The monitor never owns the
//! clients: a client that closes detaches itself, and detaching twice is
//! harmless.
//!
//! A client carries at most one monitor. Attaching a second monitor moves the
//! client over to it.
//!
//! # Example
//!
//! ```ignore
//! let throughput = Throughput::new();
//! throughput.attach([&client])?;
//!
//! client.call("STFC_CONNECTION", params).await?;
//! assert_eq!(throughput.status().number_of_calls, 1);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use crate::client::{Client, ClientInner};
use crate::environment::Environment;
use crate::error::{Result, RfcError};
use crate::transport::CallStats;

/// Snapshot of a monitor's counters. Times are in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThroughputStatus {
    pub number_of_calls: u64,
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub application_time: u64,
    pub total_time: u64,
    pub serialization_time: u64,
    pub deserialization_time: u64,
}

#[derive(Debug, Default)]
struct Counters {
    number_of_calls: AtomicU64,
    sent_bytes: AtomicU64,
    received_bytes: AtomicU64,
    application_time: AtomicU64,
    total_time: AtomicU64,
    serialization_time: AtomicU64,
    deserialization_time: AtomicU64,
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

impl Counters {
    fn record(&self, stats: &CallStats) {
        self.number_of_calls.fetch_add(1, Ordering::Relaxed);
        self.sent_bytes.fetch_add(stats.sent_bytes, Ordering::Relaxed);
        self.received_bytes
            .fetch_add(stats.received_bytes, Ordering::Relaxed);
        self.application_time
            .fetch_add(micros(stats.application_time), Ordering::Relaxed);
        self.total_time
            .fetch_add(micros(stats.total_time), Ordering::Relaxed);
        self.serialization_time
            .fetch_add(micros(stats.serialization_time), Ordering::Relaxed);
        self.deserialization_time
            .fetch_add(micros(stats.deserialization_time), Ordering::Relaxed);
    }

    fn snapshot(&self) -> ThroughputStatus {
        ThroughputStatus {
            number_of_calls: self.number_of_calls.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
            application_time: self.application_time.load(Ordering::Relaxed),
            total_time: self.total_time.load(Ordering::Relaxed),
            serialization_time: self.serialization_time.load(Ordering::Relaxed),
            deserialization_time: self.deserialization_time.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.number_of_calls,
            &self.sent_bytes,
            &self.received_bytes,
            &self.application_time,
            &self.total_time,
            &self.serialization_time,
            &self.deserialization_time,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// State shared between a monitor and the clients it is attached to.
pub(crate) struct ThroughputShared {
    handle: u64,
    counters: Counters,
    /// Attached clients by client id.
    members: DashMap<u64, Weak<ClientInner>>,
    destroyed: AtomicBool,
    env: Arc<Environment>,
}

impl ThroughputShared {
    pub(crate) fn handle(&self) -> u64 {
        self.handle
    }

    pub(crate) fn record(&self, stats: &CallStats) {
        self.counters.record(stats);
    }

    /// Add a client to the membership set. Called under the client's slot lock.
    pub(crate) fn admit(&self, client_id: u64, client: Weak<ClientInner>) {
        self.members.insert(client_id, client);
    }

    /// Drop a client from the membership set. Called by a closing client.
    pub(crate) fn forget(&self, client_id: u64) {
        self.members.remove(&client_id);
    }
}

impl Drop for ThroughputShared {
    fn drop(&mut self) {
        self.env.unregister_throughput(self.handle);
    }
}

/// Aggregates call counters over a set of clients.
#[derive(Clone)]
pub struct Throughput {
    shared: Arc<ThroughputShared>,
}

impl Throughput {
    /// Create a detached monitor in the global environment.
    pub fn new() -> Self {
        Self::with_environment(Environment::global())
    }

    pub fn with_environment(env: Arc<Environment>) -> Self {
        let shared = Arc::new(ThroughputShared {
            handle: env.next_throughput_handle(),
            counters: Counters::default(),
            members: DashMap::new(),
            destroyed: AtomicBool::new(false),
            env: env.clone(),
        });
        env.register_throughput(&shared);
        Self { shared }
    }

    /// Create a monitor attached to `clients`, registered in their
    /// environment. Nothing stays attached if one of them is not live.
    pub fn with_clients<'a, I>(clients: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a Client>,
    {
        let clients: Vec<&Client> = clients.into_iter().collect();
        let env = clients
            .first()
            .map(|client| client.environment().clone())
            .unwrap_or_else(Environment::global);
        let throughput = Self::with_environment(env);
        if let Err(e) = throughput.attach(clients.iter().copied()) {
            throughput.destroy();
            return Err(e);
        }
        Ok(throughput)
    }

    pub(crate) fn from_shared(shared: Arc<ThroughputShared>) -> Self {
        Self { shared }
    }

    /// Monitor handle, distinct from connection handles.
    pub fn handle(&self) -> u64 {
        self.shared.handle
    }

    /// Attach to every client in `clients`.
    ///
    /// Fails on the first client that is not live, naming it. Clients
    /// before it stay attached.
    pub fn attach<'a, I>(&self, clients: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Client>,
    {
        if self.shared.destroyed.load(Ordering::Acquire) {
            return Err(RfcError::Throughput(format!(
                "Throughput {} is destroyed",
                self.shared.handle
            )));
        }

        for client in clients {
            if client.connection_handle() == 0 {
                return Err(RfcError::Throughput(format!(
                    "Throughput can't be set on closed client: {}",
                    client.id()
                )));
            }

            let previous = client
                .inner()
                .attach_throughput(&self.shared)
                .map_err(|_| {
                    RfcError::Throughput(format!(
                        "Throughput can't be set on closed client: {}",
                        client.id()
                    ))
                })?;

            if let Some(previous) = previous.and_then(|w| w.upgrade()) {
                if previous.handle != self.shared.handle {
                    previous.forget(client.id());
                }
            }
            tracing::debug!(
                throughput = self.shared.handle,
                client = client.id(),
                "throughput attached"
            );
        }
        Ok(())
    }

    /// Detach from every client in `clients`. Already-detached or closed
    /// clients are skipped.
    pub fn detach<'a, I>(&self, clients: I)
    where
        I: IntoIterator<Item = &'a Client>,
    {
        for client in clients {
            self.shared.members.remove(&client.id());
            client.inner().detach_throughput(self.shared.handle);
        }
    }

    /// Clients currently attached.
    pub fn clients(&self) -> Vec<Client> {
        self.shared
            .members
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .map(Client::from_inner)
            .collect()
    }

    pub fn status(&self) -> ThroughputStatus {
        self.shared.counters.snapshot()
    }

    /// Zero the counters; membership is unchanged.
    pub fn reset(&self) {
        self.shared.counters.reset();
    }

    /// Detach from all clients and release the monitor handle.
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let members: Vec<(u64, Weak<ClientInner>)> = self
            .shared
            .members
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        for (id, member) in members {
            self.shared.members.remove(&id);
            if let Some(inner) = member.upgrade() {
                inner.detach_throughput(self.shared.handle);
            }
        }
        self.shared.env.unregister_throughput(self.shared.handle);
        tracing::debug!(throughput = self.shared.handle, "throughput destroyed");
    }

    /// The monitor attached to `client`, if any.
    pub fn get_from_connection(client: &Client) -> Option<Throughput> {
        if client.connection_handle() == 0 {
            return None;
        }
        let handle = client.inner().throughput_handle()?;
        client.environment().throughput(handle)
    }
}

impl Default for Throughput {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Throughput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throughput")
            .field("handle", &self.shared.handle)
            .field("members", &self.shared.members.len())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(sent: u64, received: u64) -> CallStats {
        CallStats {
            sent_bytes: sent,
            received_bytes: received,
            total_time: Duration::from_micros(100),
            ..CallStats::default()
        }
    }

    #[test]
    fn test_counters_accumulate_and_reset() {
        let counters = Counters::default();
        counters.record(&stats(10, 20));
        counters.record(&stats(1, 2));

        let status = counters.snapshot();
        assert_eq!(status.number_of_calls, 2);
        assert_eq!(status.sent_bytes, 11);
        assert_eq!(status.received_bytes, 22);
        assert_eq!(status.total_time, 200);

        counters.reset();
        assert_eq!(counters.snapshot(), ThroughputStatus::default());
    }

    #[test]
    fn test_registry_lookup_and_destroy() {
        let env = Environment::new();
        let throughput = Throughput::with_environment(env.clone());

        let found = env.throughput(throughput.handle()).unwrap();
        assert_eq!(found.handle(), throughput.handle());

        throughput.destroy();
        assert!(env.throughput(throughput.handle()).is_none());

        // idempotent
        throughput.destroy();
    }

    #[test]
    fn test_distinct_handles() {
        let env = Environment::new();
        let a = Throughput::with_environment(env.clone());
        let b = Throughput::with_environment(env.clone());
        assert_ne!(a.handle(), b.handle());
        assert_eq!(env.throughput_count(), 2);
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let json = serde_json::to_value(ThroughputStatus::default()).unwrap();
        assert!(json.get("numberOfCalls").is_some());
        assert!(json.get("deserializationTime").is_some());
    }
}
