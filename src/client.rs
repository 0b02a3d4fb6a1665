//! Connection handle wrapper.
//!
//! A [`Client`] owns one native connection identity. It is cheap to clone;
//! clones share the same connection. Every operation exists in two forms:
//!
//! - `op(..)` returns a [`Deferred`] that resolves exactly once
//! - `op_with(.., callback)` delivers the outcome to `callback` instead
//!
//! Both forms run the same code through a [`Completion`](crate::completion::Completion).
//! Operations need a running tokio runtime.
//!
//! # Lifecycle
//!
//! ```text
//! created ──open──► live ──close / broken transport──► closed
//!                    │  ▲
//!                    └──┘ ping, invoke, cancel, reset_context
//! ```
//!
//! Everything except `open` fails with [`RfcError::NotConnected`] on a client
//! that is not live. The error arrives through the normal completion path.
//!
//! # Example
//!
//! ```ignore
//! use rfcwire::{Client, config::{ClientConfig, ClientOptions, CallOptions}};
//!
//! let client = Client::new(connector, ClientConfig::new(params)
//!     .with_options(ClientOptions::default().timeout(10)));
//!
//! client.open().await?;
//! let result = client.call("STFC_CONNECTION", params).await?;
//! client.close().await?;
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::call::{supervise, CallDescriptor};
use crate::completion::{Completion, Deferred};
use crate::config::{effective_timeout, CallOptions, ClientConfig};
use crate::environment::{Environment, LibraryEvent};
use crate::error::{NativeError, Result, RfcError};
use crate::pool::PoolInner;
use crate::throughput::ThroughputShared;
use crate::transport::{CallStats, ConnectionInfo, Connector, NativeConnection, RfcObject};

/// Link from a client to the monitor counting its calls.
struct Attachment {
    handle: u64,
    monitor: Weak<ThroughputShared>,
}

/// State behind a [`Client`].
pub(crate) struct ClientInner {
    id: u64,
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    env: Arc<Environment>,
    native: RwLock<Option<Arc<dyn NativeConnection>>>,
    alive: AtomicBool,
    handle: AtomicU64,
    /// Invokes currently waiting on the transport.
    in_flight: AtomicUsize,
    /// Serializes open and close.
    lifecycle: tokio::sync::Mutex<()>,
    pool_id: u64,
    pool: Option<Weak<PoolInner>>,
    throughput: Mutex<Option<Attachment>>,
}

/// Decrements the in-flight counter when the invoke finishes, however it finishes.
struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlightGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ClientInner {
    fn label(&self) -> String {
        format!("client {}", self.id)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// The native connection, or `NotConnected`.
    fn live_connection(&self) -> Result<Arc<dyn NativeConnection>> {
        if !self.is_alive() {
            return Err(RfcError::NotConnected(self.label()));
        }
        self.native
            .read()
            .clone()
            .ok_or_else(|| RfcError::NotConnected(self.label()))
    }

    /// Classify a native failure, tearing the handle down if the transport is gone.
    fn native_failure(&self, error: NativeError) -> RfcError {
        if error.is_broken_connection() {
            let handle = self.handle.load(Ordering::Acquire);
            if self.mark_closed() {
                tracing::warn!(client = self.id, handle, "connection broken: {}", error);
                self.env.emit(LibraryEvent::ConnectionBroken {
                    client: self.id,
                    handle,
                });
            }
        }
        self.env.emit(LibraryEvent::NativeError {
            client: self.id,
            error: error.clone(),
        });
        error.into()
    }

    /// Drop liveness and detach from any monitor. Returns false if already closed.
    fn mark_closed(&self) -> bool {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.handle.store(0, Ordering::Release);
        self.native.write().take();

        let attachment = self.throughput.lock().take();
        if let Some(monitor) = attachment.and_then(|a| a.monitor.upgrade()) {
            monitor.forget(self.id);
        }
        true
    }

    pub(crate) fn attach_throughput(
        self: &Arc<Self>,
        monitor: &Arc<ThroughputShared>,
    ) -> Result<Option<Weak<ThroughputShared>>> {
        let mut slot = self.throughput.lock();
        if !self.is_alive() {
            return Err(RfcError::NotConnected(self.label()));
        }
        monitor.admit(self.id, Arc::downgrade(self));
        let previous = slot.replace(Attachment {
            handle: monitor.handle(),
            monitor: Arc::downgrade(monitor),
        });
        Ok(previous.map(|a| a.monitor))
    }

    /// Clear the slot if it still points at monitor `handle`.
    pub(crate) fn detach_throughput(&self, handle: u64) {
        let mut slot = self.throughput.lock();
        if slot.as_ref().is_some_and(|a| a.handle == handle) {
            slot.take();
            tracing::debug!(client = self.id, throughput = handle, "throughput detached");
        }
    }

    pub(crate) fn throughput_handle(&self) -> Option<u64> {
        self.throughput.lock().as_ref().map(|a| a.handle)
    }

    fn record_throughput(&self, stats: &CallStats) {
        let monitor = self
            .throughput
            .lock()
            .as_ref()
            .and_then(|a| a.monitor.upgrade());
        if let Some(monitor) = monitor {
            monitor.record(stats);
        }
    }

    async fn open(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_alive() {
            if self.config.client_options.error_on_reopen {
                return Err(RfcError::AlreadyOpen(self.label()));
            }
            tracing::debug!(client = self.id, "open on live client ignored");
            return Ok(());
        }

        let native = self
            .connector
            .open(
                &self.config.connection_parameters,
                &self.config.client_options,
            )
            .await
            .map_err(|e| self.native_failure(e))?;

        let handle = native.handle();
        *self.native.write() = Some(native);
        self.handle.store(handle, Ordering::Release);
        self.alive.store(true, Ordering::Release);

        tracing::debug!(client = self.id, handle, "client opened");
        self.env.emit(LibraryEvent::Opened {
            client: self.id,
            handle,
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let native = self.live_connection()?;
        let handle = native.handle();

        native.close().await.map_err(|e| self.native_failure(e))?;

        if self.mark_closed() {
            tracing::debug!(client = self.id, handle, "client closed");
            self.env.emit(LibraryEvent::Closed {
                client: self.id,
                handle,
            });
        }
        Ok(())
    }

    async fn ping(&self) -> Result<bool> {
        let native = self.live_connection()?;
        native.ping().await.map_err(|e| self.native_failure(e))?;
        Ok(true)
    }

    async fn reset_context(&self) -> Result<()> {
        let native = self.live_connection()?;
        native
            .reset_context()
            .await
            .map_err(|e| self.native_failure(e))
    }

    async fn cancel(&self) -> Result<()> {
        let native = self.live_connection()?;
        if self.in_flight.load(Ordering::Acquire) == 0 {
            tracing::debug!(client = self.id, "cancel without call in flight ignored");
            return Ok(());
        }
        native.cancel().await.map_err(|e| self.native_failure(e))
    }

    async fn invoke(&self, descriptor: CallDescriptor) -> Result<RfcObject> {
        let native = self.live_connection()?;
        let options = &self.config.client_options;
        let timeout = effective_timeout(&descriptor.options, options);
        let name = descriptor.name.clone();
        let request = descriptor.into_request(options.filter);

        let supervised = {
            let _in_flight = InFlightGuard::new(&self.in_flight);
            supervise(native.invoke(request), timeout, || {
                self.request_timeout_cancel(native.clone())
            })
            .await
        };

        // completion never overtakes the cancel it triggered
        if let Some(cancel) = supervised.cancel {
            if let Err(e) = cancel.await {
                tracing::warn!(client = self.id, "cancel task failed: {}", e);
            }
        }

        let outcome = supervised.output;
        self.record_throughput(&outcome.stats);

        match outcome.result {
            Ok(result) => {
                if options.stateless {
                    if let Err(e) = native.reset_context().await {
                        tracing::warn!(client = self.id, "stateless context reset failed: {}", e);
                        self.native_failure(e);
                    }
                }
                Ok(result)
            }
            Err(e) => {
                tracing::debug!(client = self.id, function = %name, "call failed: {}", e);
                Err(self.native_failure(e))
            }
        }
    }

    /// Fire the cancel for a timed-out call.
    fn request_timeout_cancel(
        &self,
        native: Arc<dyn NativeConnection>,
    ) -> tokio::task::JoinHandle<()> {
        let handle = native.handle();
        self.env.emit(LibraryEvent::CancelRequested {
            client: self.id,
            handle,
        });
        let id = self.id;
        tokio::spawn(async move {
            if let Err(e) = native.cancel().await {
                tracing::warn!(client = id, handle, "timeout cancel failed: {}", e);
            }
        })
    }
}

/// Handle to one connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client in the global environment. No connection is opened.
    pub fn new(connector: Arc<dyn Connector>, config: ClientConfig) -> Self {
        Self::with_environment(connector, config, Environment::global())
    }

    pub fn with_environment(
        connector: Arc<dyn Connector>,
        config: ClientConfig,
        env: Arc<Environment>,
    ) -> Self {
        Self::build(connector, config, env, 0, None)
    }

    pub(crate) fn pooled(
        connector: Arc<dyn Connector>,
        config: ClientConfig,
        env: Arc<Environment>,
        pool_id: u64,
        pool: Weak<PoolInner>,
    ) -> Self {
        Self::build(connector, config, env, pool_id, Some(pool))
    }

    fn build(
        connector: Arc<dyn Connector>,
        config: ClientConfig,
        env: Arc<Environment>,
        pool_id: u64,
        pool: Option<Weak<PoolInner>>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                id: env.next_client_id(),
                config,
                connector,
                env,
                native: RwLock::new(None),
                alive: AtomicBool::new(false),
                handle: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                lifecycle: tokio::sync::Mutex::new(()),
                pool_id,
                pool,
                throughput: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<ClientInner> {
        &self.inner
    }

    /// Client id, unique within its environment.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn alive(&self) -> bool {
        self.inner.is_alive()
    }

    /// Native connection handle; 0 when not connected.
    pub fn connection_handle(&self) -> u64 {
        self.inner.handle.load(Ordering::Acquire)
    }

    /// Owning pool id; 0 for a direct client.
    pub fn pool_id(&self) -> u64 {
        self.inner.pool_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.inner.env
    }

    /// Number of invokes currently waiting on the transport.
    pub fn calls_in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Endpoint and session metadata.
    pub fn connection_info(&self) -> Result<ConnectionInfo> {
        Ok(self.inner.live_connection()?.connection_info())
    }

    pub(crate) fn same_as(&self, other: &Client) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn open(&self) -> Deferred<()> {
        self.run(|inner| async move { inner.open().await })
    }

    pub fn open_with<F>(&self, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.run_with(callback, |inner| async move { inner.open().await });
    }

    /// Same as [`Client::open`].
    pub fn connect(&self) -> Deferred<()> {
        self.open()
    }

    pub fn close(&self) -> Deferred<()> {
        self.run(|inner| async move { inner.close().await })
    }

    pub fn close_with<F>(&self, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.run_with(callback, |inner| async move { inner.close().await });
    }

    pub fn ping(&self) -> Deferred<bool> {
        self.run(|inner| async move { inner.ping().await })
    }

    pub fn ping_with<F>(&self, callback: F)
    where
        F: FnOnce(Result<bool>) + Send + 'static,
    {
        self.run_with(callback, |inner| async move { inner.ping().await });
    }

    /// Clear the server-side session context; the connection stays open.
    pub fn reset_context(&self) -> Deferred<()> {
        self.run(|inner| async move { inner.reset_context().await })
    }

    pub fn reset_context_with<F>(&self, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.run_with(callback, |inner| async move {
            inner.reset_context().await
        });
    }

    /// Abort the call in flight. A no-op when nothing is in flight.
    pub fn cancel(&self) -> Deferred<()> {
        self.run(|inner| async move { inner.cancel().await })
    }

    pub fn cancel_with<F>(&self, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.run_with(callback, |inner| async move { inner.cancel().await });
    }

    /// Invoke a remote function.
    ///
    /// The descriptor is validated before anything reaches the transport;
    /// a malformed one yields an already-settled `Deferred`.
    pub fn invoke(
        &self,
        name: impl Into<String>,
        params: RfcObject,
        options: CallOptions,
    ) -> Deferred<RfcObject> {
        let descriptor = CallDescriptor::new(name, params, options);
        if let Err(e) = descriptor.validate() {
            return Deferred::ready(Err(e));
        }
        self.run(move |inner| async move { inner.invoke(descriptor).await })
    }

    /// Callback form of [`Client::invoke`]. Validation errors reach
    /// `callback` before this returns.
    pub fn invoke_with<F>(
        &self,
        name: impl Into<String>,
        params: RfcObject,
        options: CallOptions,
        callback: F,
    ) where
        F: FnOnce(Result<RfcObject>) + Send + 'static,
    {
        let descriptor = CallDescriptor::new(name, params, options);
        if let Err(e) = descriptor.validate() {
            callback(Err(e));
            return;
        }
        self.run_with(callback, move |inner| async move {
            inner.invoke(descriptor).await
        });
    }

    /// Invoke with default call options.
    pub fn call(&self, name: impl Into<String>, params: RfcObject) -> Deferred<RfcObject> {
        self.invoke(name, params, CallOptions::default())
    }

    /// Return a pooled client to its pool.
    pub fn release(&self) -> Deferred<()> {
        let client = self.clone();
        self.run(move |_| async move { client.release_to_pool().await })
    }

    pub fn release_with<F>(&self, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let client = self.clone();
        self.run_with(callback, move |_| async move {
            client.release_to_pool().await
        });
    }

    async fn release_to_pool(self) -> Result<()> {
        let pool = self
            .inner
            .pool
            .as_ref()
            .and_then(|p| p.upgrade())
            .ok_or_else(|| {
                RfcError::InvalidArgument(format!(
                    "{} is not managed by a pool",
                    self.inner.label()
                ))
            })?;
        PoolInner::release(&pool, vec![self]).await
    }

    fn run<T, F, Fut>(&self, op: F) -> Deferred<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<ClientInner>) -> Fut,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        let (completion, deferred) = Completion::deferred();
        completion.spawn(op(self.inner.clone()));
        deferred
    }

    fn run_with<T, C, F, Fut>(&self, callback: C, op: F)
    where
        T: Send + 'static,
        C: FnOnce(Result<T>) + Send + 'static,
        F: FnOnce(Arc<ClientInner>) -> Fut,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        Completion::callback(callback).spawn(op(self.inner.clone()));
    }
}

impl std::fmt::Display for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} handle: {} ", self.id(), self.connection_handle())?;
        if self.pool_id() > 0 {
            write!(f, "[m] pool: {}", self.pool_id())
        } else {
            write!(f, "[d]")
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id())
            .field("alive", &self.alive())
            .field("handle", &self.connection_handle())
            .field("pool_id", &self.pool_id())
            .finish()
    }
}

/// Cancel whatever `client` has in flight.
pub fn cancel_client(client: &Client) -> Deferred<()> {
    client.cancel()
}
