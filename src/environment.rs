//! Process-wide library state.
//!
//! An [`Environment`] owns the library event channel, the id counters and the
//! registry that maps throughput monitor handles back to their monitors. One
//! instance is created lazily by [`Environment::global`] and lives until the
//! process exits. Clients, pools, servers and monitors accept an explicit
//! `Arc<Environment>` so tests can run against a fresh one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::error::NativeError;
use crate::throughput::{Throughput, ThroughputShared};

/// Capacity of the library event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

static GLOBAL: OnceLock<Arc<Environment>> = OnceLock::new();

/// Cross-cutting library events.
#[derive(Debug, Clone, PartialEq)]
pub enum LibraryEvent {
    Opened { client: u64, handle: u64 },
    Closed { client: u64, handle: u64 },
    /// A call timeout fired and a cancel was sent.
    CancelRequested { client: u64, handle: u64 },
    /// The transport reported the connection as unusable.
    ConnectionBroken { client: u64, handle: u64 },
    NativeError { client: u64, error: NativeError },
}

/// Shared library state.
pub struct Environment {
    events: broadcast::Sender<LibraryEvent>,
    throughput: DashMap<u64, Weak<ThroughputShared>>,
    next_client_id: AtomicU64,
    next_pool_id: AtomicU64,
    next_server_id: AtomicU64,
    next_throughput_handle: AtomicU64,
}

impl Environment {
    /// Create an isolated environment.
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            events,
            throughput: DashMap::new(),
            next_client_id: AtomicU64::new(1),
            next_pool_id: AtomicU64::new(1),
            next_server_id: AtomicU64::new(1),
            next_throughput_handle: AtomicU64::new(1),
        })
    }

    /// The process-wide environment.
    pub fn global() -> Arc<Self> {
        GLOBAL.get_or_init(Environment::new).clone()
    }

    /// Subscribe to library events.
    pub fn subscribe(&self) -> broadcast::Receiver<LibraryEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: LibraryEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_pool_id(&self) -> u64 {
        self.next_pool_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_server_id(&self) -> u64 {
        self.next_server_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_throughput_handle(&self) -> u64 {
        self.next_throughput_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_throughput(&self, shared: &Arc<ThroughputShared>) {
        self.throughput.insert(shared.handle(), Arc::downgrade(shared));
    }

    pub(crate) fn unregister_throughput(&self, handle: u64) {
        self.throughput.remove(&handle);
    }

    /// Resolve a monitor handle to its monitor, if still alive.
    pub fn throughput(&self, handle: u64) -> Option<Throughput> {
        self.throughput
            .get(&handle)
            .and_then(|weak| weak.upgrade())
            .map(Throughput::from_shared)
    }

    /// Number of registered monitors.
    pub fn throughput_count(&self) -> usize {
        self.throughput.len()
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("throughput", &self.throughput.len())
            .field("subscribers", &self.events.receiver_count())
            .finish()
    }
}
