//! Connection pool manager.
//!
//! A [`Pool`] lends out [`Client`]s that share one connection configuration.
//! Members live in exactly one of two sets: idle or leased. An acquire of
//! `count` members reserves all of them in one step, taking idle members first
//! and opening new ones while `idle + leased + opening <= high`. Otherwise it
//! queues, and queued acquires are served in order as members come back.
//! An acquire whose caller stopped waiting releases what it was given.
//!
//! Release resets the member's server context (see
//! [`PoolOptions::reset_on_release`](crate::config::PoolOptions)) before it
//! becomes visible to the next acquirer. A member that is dead or fails the
//! reset is closed and dropped, which frees a growth slot.
//!
//! # Example
//!
//! ```ignore
//! let pool = Pool::new(connector, PoolConfig::new(params, PoolOptions::new(1, 4)));
//!
//! let client = pool.acquire().await?;
//! let result = client.call("STFC_CONNECTION", params).await?;
//! pool.release(&client).await?;
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::client::Client;
use crate::completion::{Completion, Deferred};
use crate::config::PoolConfig;
use crate::environment::Environment;
use crate::error::{Result, RfcError};
use crate::transport::{BoxFuture, Connector};

/// Snapshot of pool membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub id: u64,
    pub idle: usize,
    pub leased: usize,
    /// Acquires waiting for a member.
    pub queued: usize,
    /// Members being opened right now.
    pub opening: usize,
    pub low: usize,
    pub high: usize,
}

/// A queued acquire. Only the front waiter gathers members.
struct Waiter {
    want: usize,
    gathered: Vec<Client>,
    tx: oneshot::Sender<Result<Vec<Client>>>,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Client>,
    /// Members lent out, including those gathered by the front waiter.
    leased: HashMap<u64, Client>,
    /// Leased members with a release in progress.
    returning: HashSet<u64>,
    opening: usize,
    /// Opens whose member is handed off on success. Subset of `opening`.
    growing: usize,
    waiters: VecDeque<Waiter>,
    closed: bool,
}

impl PoolState {
    fn members(&self) -> usize {
        self.idle.len() + self.leased.len() + self.opening
    }

    fn drop_abandoned(&mut self, spare: &mut Vec<Client>) {
        while self.waiters.front().is_some_and(|w| w.tx.is_closed()) {
            if let Some(waiter) = self.waiters.pop_front() {
                spare.extend(waiter.gathered);
            }
        }
    }
}

/// Where a freshly opened member goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Destination {
    /// Straight to the acquire that reserved the slot.
    Lease,
    /// Through hand-off: the front waiter, else idle.
    Shared,
}

enum Checkout {
    /// Slots taken in one step: `idle` members already leased, `open` slots
    /// counted in `opening`.
    Reserved { idle: Vec<Client>, open: usize },
    Wait {
        rx: oneshot::Receiver<Result<Vec<Client>>>,
        grow: usize,
    },
}

pub(crate) struct PoolInner {
    id: u64,
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    env: Arc<Environment>,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn high(&self) -> usize {
        self.config.pool_options.high
    }

    fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            id: self.id,
            idle: state.idle.len(),
            leased: state.leased.len(),
            queued: state.waiters.len(),
            opening: state.opening,
            low: self.config.pool_options.low,
            high: self.high(),
        }
    }

    async fn acquire_one(self: &Arc<Self>) -> Result<Client> {
        let mut clients = self.acquire(1).await?;
        clients.pop().ok_or(RfcError::PoolClosed(self.id))
    }

    /// Lease `count` members. Either all of them are delivered or none stay
    /// leased.
    async fn acquire(self: &Arc<Self>, count: usize) -> Result<Vec<Client>> {
        self.config.pool_options.validate()?;

        let checkout = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(RfcError::PoolClosed(self.id));
            }
            self.checkout(&mut state, count)
        };

        match checkout {
            Checkout::Reserved { idle, open } => {
                if !idle.is_empty() {
                    tracing::debug!(pool = self.id, members = idle.len(), "idle members leased");
                }
                self.complete_reservation(idle, open).await
            }
            Checkout::Wait { rx, grow } => {
                tracing::debug!(pool = self.id, count, "pool exhausted, acquire queued");
                self.spawn_growth(grow);
                rx.await.unwrap_or(Err(RfcError::PoolClosed(self.id)))
            }
        }
    }

    fn checkout(&self, state: &mut PoolState, count: usize) -> Checkout {
        let before = state.idle.len();
        state.idle.retain(|client| client.alive());
        if state.idle.len() < before {
            tracing::debug!(pool = self.id, dropped = before - state.idle.len(), "dead idle members dropped");
        }

        let growth = self.high().saturating_sub(state.members());
        if state.waiters.is_empty() && state.idle.len() + growth >= count {
            let take = count.min(state.idle.len());
            let idle: Vec<Client> = state.idle.drain(..take).collect();
            for client in &idle {
                state.leased.insert(client.id(), client.clone());
            }
            let open = count - take;
            state.opening += open;
            return Checkout::Reserved { idle, open };
        }

        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(Waiter {
            want: count,
            gathered: Vec::new(),
            tx,
        });
        let idle: Vec<Client> = state.idle.drain(..).collect();
        let grow = self.settle(state, idle);
        Checkout::Wait { rx, grow }
    }

    async fn complete_reservation(self: &Arc<Self>, idle: Vec<Client>, open: usize) -> Result<Vec<Client>> {
        let mut clients = idle;
        let mut remaining = open;
        while remaining > 0 {
            remaining -= 1;
            match self.clone().open_member(Destination::Lease).await {
                Ok(client) => clients.push(client),
                Err(e) => {
                    self.give_back_slots(remaining);
                    if !clients.is_empty() {
                        if let Err(release_err) = Self::release(self, clients).await {
                            tracing::warn!(pool = self.id, "release after failed acquire: {}", release_err);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(clients)
    }

    /// Return reserved open slots that will not be used.
    fn give_back_slots(self: &Arc<Self>, slots: usize) {
        if slots == 0 {
            return;
        }
        let grow = {
            let mut state = self.state.lock();
            state.opening -= slots;
            self.claim_growth(&mut state)
        };
        self.spawn_growth(grow);
    }

    /// Open one member for a slot already counted in `opening`.
    fn open_member(self: Arc<Self>, destination: Destination) -> BoxFuture<'static, Result<Client>> {
        Box::pin(async move {
            let client = Client::pooled(
                self.connector.clone(),
                self.config.client_config(),
                self.env.clone(),
                self.id,
                Arc::downgrade(&self),
            );
            let opened = client.open().await;

            let (outcome, grow) = {
                let mut state = self.state.lock();
                state.opening -= 1;
                if destination == Destination::Shared {
                    state.growing -= 1;
                }
                match opened {
                    // a failed shared open is settled by its owner
                    Err(e) if destination == Destination::Shared => (Err(e), 0),
                    Err(e) => (Err(e), self.claim_growth(&mut state)),
                    Ok(()) if state.closed => (Ok(false), 0),
                    Ok(()) => {
                        let grow = match destination {
                            Destination::Lease => {
                                state.leased.insert(client.id(), client.clone());
                                0
                            }
                            Destination::Shared => self.settle(&mut state, vec![client.clone()]),
                        };
                        (Ok(true), grow)
                    }
                }
            };
            self.spawn_growth(grow);

            match outcome {
                Ok(true) => {
                    tracing::debug!(
                        pool = self.id,
                        client = client.id(),
                        handle = client.connection_handle(),
                        "pool grew"
                    );
                    Ok(client)
                }
                Ok(false) => {
                    close_quietly(&client).await;
                    Err(RfcError::PoolClosed(self.id))
                }
                Err(e) => {
                    tracing::debug!(pool = self.id, "member open failed: {}", e);
                    Err(e)
                }
            }
        })
    }

    /// Claim growth slots for members the queue still needs.
    fn claim_growth(&self, state: &mut PoolState) -> usize {
        if state.closed {
            return 0;
        }
        let wanted: usize = state
            .waiters
            .iter()
            .map(|w| w.want - w.gathered.len())
            .sum();
        let capacity = self.high().saturating_sub(state.members());
        let slots = wanted.saturating_sub(state.growing).min(capacity);
        state.opening += slots;
        state.growing += slots;
        slots
    }

    fn spawn_growth(self: &Arc<Self>, slots: usize) {
        for _ in 0..slots {
            let pool = self.clone();
            tokio::spawn(async move {
                if let Err(e) = pool.clone().open_member(Destination::Shared).await {
                    pool.fail_front_waiter(e);
                }
            });
        }
    }

    /// A growth open failed: the first queued acquire gets the error and
    /// whatever it had gathered goes back through hand-off.
    fn fail_front_waiter(self: &Arc<Self>, error: RfcError) {
        let grow = {
            let mut state = self.state.lock();
            let mut spare = Vec::new();
            state.drop_abandoned(&mut spare);
            match state.waiters.pop_front() {
                Some(waiter) => {
                    spare.extend(waiter.gathered);
                    let _ = waiter.tx.send(Err(error));
                }
                None => tracing::warn!(pool = self.id, "growth failed with no acquire queued: {}", error),
            }
            self.settle(&mut state, spare)
        };
        self.spawn_growth(grow);
    }

    /// Hand members off, then claim growth for what the queue still lacks.
    fn settle(&self, state: &mut PoolState, clients: Vec<Client>) -> usize {
        self.hand_off(state, clients);
        self.claim_growth(state)
    }

    /// Give live members to the front waiter until it has its count, park the
    /// rest idle. Dead members are dropped.
    fn hand_off(&self, state: &mut PoolState, clients: Vec<Client>) {
        let mut spare = clients;
        while let Some(client) = spare.pop() {
            let id = client.id();
            if !client.alive() {
                state.leased.remove(&id);
                tracing::debug!(pool = self.id, client = id, "dead member dropped");
                continue;
            }

            state.drop_abandoned(&mut spare);
            if state.waiters.is_empty() {
                state.leased.remove(&id);
                state.idle.push_back(client);
                continue;
            }

            state.leased.insert(id, client.clone());
            let complete = match state.waiters.front_mut() {
                Some(waiter) => {
                    waiter.gathered.push(client);
                    waiter.gathered.len() >= waiter.want
                }
                None => false,
            };
            if !complete {
                continue;
            }
            if let Some(waiter) = state.waiters.pop_front() {
                let count = waiter.gathered.len();
                match waiter.tx.send(Ok(waiter.gathered)) {
                    Ok(()) => tracing::debug!(pool = self.id, count, "members handed to waiter"),
                    Err(returned) => spare.extend(returned.unwrap_or_default()),
                }
            }
        }
    }

    pub(crate) async fn release(pool: &Arc<PoolInner>, clients: Vec<Client>) -> Result<()> {
        let returning = {
            let mut state = pool.state.lock();
            if state.closed {
                return Ok(());
            }
            for client in &clients {
                if client.pool_id() != pool.id {
                    return Err(RfcError::NotCheckedOut {
                        client: client.id(),
                        pool: pool.id,
                    });
                }
                let leased = state.leased.contains_key(&client.id());
                let idle = state.idle.iter().any(|c| c.same_as(client));
                if !leased && !idle {
                    return Err(RfcError::NotCheckedOut {
                        client: client.id(),
                        pool: pool.id,
                    });
                }
            }

            let mut returning = Vec::with_capacity(clients.len());
            for client in clients {
                if state.leased.contains_key(&client.id()) && state.returning.insert(client.id()) {
                    returning.push(client);
                } else {
                    tracing::debug!(pool = pool.id, client = client.id(), "member already released");
                }
            }
            returning
        };

        for client in returning {
            pool.check_in(client).await;
        }
        Ok(())
    }

    async fn check_in(self: &Arc<Self>, client: Client) {
        let healthy = if !client.alive() {
            false
        } else if self.config.pool_options.reset_on_release {
            match client.reset_context().await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(pool = self.id, client = client.id(), "reset on release failed: {}", e);
                    close_quietly(&client).await;
                    false
                }
            }
        } else {
            true
        };

        let (to_close, grow) = {
            let mut state = self.state.lock();
            state.returning.remove(&client.id());
            if state.closed {
                state.leased.remove(&client.id());
                (Some(client), 0)
            } else if healthy {
                (None, self.settle(&mut state, vec![client]))
            } else {
                state.leased.remove(&client.id());
                tracing::debug!(pool = self.id, client = client.id(), "unhealthy member dropped");
                (None, self.claim_growth(&mut state))
            }
        };

        if let Some(client) = to_close {
            close_quietly(&client).await;
        }
        self.spawn_growth(grow);
    }

    async fn ready(self: &Arc<Self>) -> Result<()> {
        self.config.pool_options.validate()?;
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(RfcError::PoolClosed(self.id));
                }
                if state.members() >= self.config.pool_options.low {
                    return Ok(());
                }
                state.opening += 1;
                state.growing += 1;
            }
            if let Err(e) = self.clone().open_member(Destination::Shared).await {
                let grow = {
                    let mut state = self.state.lock();
                    self.claim_growth(&mut state)
                };
                self.spawn_growth(grow);
                return Err(e);
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let (members, waiters) = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            let mut members: Vec<Client> = state.idle.drain(..).collect();
            members.extend(state.leased.drain().map(|(_, c)| c));
            state.returning.clear();
            (members, std::mem::take(&mut state.waiters))
        };

        for waiter in waiters {
            let _ = waiter.tx.send(Err(RfcError::PoolClosed(self.id)));
        }
        for client in &members {
            close_quietly(client).await;
        }
        tracing::debug!(pool = self.id, members = members.len(), "pool closed");
        Ok(())
    }
}

async fn close_quietly(client: &Client) {
    if !client.alive() {
        return;
    }
    if let Err(e) = client.close().await {
        tracing::warn!(client = client.id(), "close failed: {}", e);
    }
}

/// Bounded set of reusable clients.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool in the global environment. No member is opened.
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        Self::with_environment(connector, config, Environment::global())
    }

    pub fn with_environment(
        connector: Arc<dyn Connector>,
        config: PoolConfig,
        env: Arc<Environment>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                id: env.next_pool_id(),
                config,
                connector,
                env,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn status(&self) -> PoolStatus {
        self.inner.status()
    }

    /// Open members until `low` exist.
    pub fn ready(&self) -> Deferred<()> {
        let inner = self.inner.clone();
        spawn_deferred(async move { inner.ready().await })
    }

    pub fn ready_with<F>(&self, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let inner = self.inner.clone();
        Completion::callback(callback).spawn(async move { inner.ready().await });
    }

    /// Lease one client.
    pub fn acquire(&self) -> Deferred<Client> {
        let inner = self.inner.clone();
        spawn_lease(self.inner.clone(), async move { inner.acquire_one().await })
    }

    pub fn acquire_with<F>(&self, callback: F)
    where
        F: FnOnce(Result<Client>) + Send + 'static,
    {
        let inner = self.inner.clone();
        Completion::callback(callback).spawn(async move { inner.acquire_one().await });
    }

    /// Lease `count` clients. All or nothing.
    pub fn acquire_many(&self, count: usize) -> Deferred<Vec<Client>> {
        if let Err(e) = self.check_count(count) {
            return Deferred::ready(Err(e));
        }
        let inner = self.inner.clone();
        spawn_lease(self.inner.clone(), async move { inner.acquire(count).await })
    }

    pub fn acquire_many_with<F>(&self, count: usize, callback: F)
    where
        F: FnOnce(Result<Vec<Client>>) + Send + 'static,
    {
        if let Err(e) = self.check_count(count) {
            callback(Err(e));
            return;
        }
        let inner = self.inner.clone();
        Completion::callback(callback).spawn(async move { inner.acquire(count).await });
    }

    fn check_count(&self, count: usize) -> Result<()> {
        let high = self.inner.high();
        if count == 0 || count > high {
            return Err(RfcError::InvalidArgument(format!(
                "Pool {} cannot lease {} clients, high bound is {}",
                self.inner.id, count, high
            )));
        }
        Ok(())
    }

    /// Return a leased client.
    pub fn release(&self, client: &Client) -> Deferred<()> {
        self.release_many(std::slice::from_ref(client))
    }

    pub fn release_with<F>(&self, client: &Client, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let inner = self.inner.clone();
        let clients = vec![client.clone()];
        Completion::callback(callback)
            .spawn(async move { PoolInner::release(&inner, clients).await });
    }

    pub fn release_many(&self, clients: &[Client]) -> Deferred<()> {
        let inner = self.inner.clone();
        let clients = clients.to_vec();
        spawn_deferred(async move { PoolInner::release(&inner, clients).await })
    }

    /// Close every member, idle or leased, and fail queued acquires.
    pub fn close(&self) -> Deferred<()> {
        let inner = self.inner.clone();
        spawn_deferred(async move { inner.close().await })
    }

    pub fn close_with<F>(&self, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let inner = self.inner.clone();
        Completion::callback(callback).spawn(async move { inner.close().await });
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Pool").field(&self.status()).finish()
    }
}

fn spawn_deferred<T, F>(fut: F) -> Deferred<T>
where
    T: Send + 'static,
    F: std::future::Future<Output = Result<T>> + Send + 'static,
{
    let (completion, deferred) = Completion::deferred();
    completion.spawn(fut);
    deferred
}

/// Leased members carried by an acquire result.
trait Lease: Send + 'static {
    fn into_members(self) -> Vec<Client>;
}

impl Lease for Client {
    fn into_members(self) -> Vec<Client> {
        vec![self]
    }
}

impl Lease for Vec<Client> {
    fn into_members(self) -> Vec<Client> {
        self
    }
}

/// Like [`spawn_deferred`], but a lease nobody is waiting for any more goes
/// back to the pool.
fn spawn_lease<T, F>(pool: Arc<PoolInner>, fut: F) -> Deferred<T>
where
    T: Lease,
    F: std::future::Future<Output = Result<T>> + Send + 'static,
{
    let (completion, deferred) = Completion::deferred();
    tokio::spawn(async move {
        let result = fut.await;
        if let Some(Ok(lease)) = completion.try_complete(result) {
            tracing::debug!(pool = pool.id, "acquire abandoned, releasing its lease");
            if let Err(e) = PoolInner::release(&pool, lease.into_members()).await {
                tracing::warn!(pool = pool.id, "release of abandoned lease failed: {}", e);
            }
        }
    });
    deferred
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionParameters, PoolOptions};
    use crate::transport::mock::MockConnector;
    use std::time::Duration;

    fn pool(mock: &Arc<MockConnector>, low: usize, high: usize) -> Pool {
        Pool::with_environment(
            mock.clone(),
            PoolConfig::new(ConnectionParameters::new(), PoolOptions::new(low, high)),
            Environment::new(),
        )
    }

    #[tokio::test]
    async fn test_idle_member_is_reused() {
        let mock = MockConnector::new();
        let pool = pool(&mock, 1, 2);

        let first = pool.acquire().await.unwrap();
        pool.release(&first).await.unwrap();
        let second = pool.acquire().await.unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(mock.opens(), 1);
        assert_eq!(mock.resets(), 1);
    }

    #[tokio::test]
    async fn test_leased_never_exceeds_high() {
        let mock = MockConnector::new();
        let pool = pool(&mock, 0, 2);

        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        let third = pool.acquire();

        tokio::task::yield_now().await;
        assert_eq!(pool.status().leased, 2);
        assert_eq!(pool.status().queued, 1);

        pool.release(&a).await.unwrap();
        let c = tokio::time::timeout(Duration::from_secs(1), third)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(c.id(), a.id());
        assert_eq!(pool.status().leased, 2);
    }

    #[tokio::test]
    async fn test_release_foreign_client_rejected() {
        let mock = MockConnector::new();
        let pool_a = pool(&mock, 0, 2);
        let pool_b = pool(&mock, 0, 2);

        let client = pool_a.acquire().await.unwrap();
        let err = pool_b.release(&client).await.unwrap_err();
        assert!(matches!(err, RfcError::NotCheckedOut { .. }));
    }

    #[tokio::test]
    async fn test_double_release_is_benign() {
        let mock = MockConnector::new();
        let pool = pool(&mock, 0, 2);

        let client = pool.acquire().await.unwrap();
        pool.release(&client).await.unwrap();
        pool.release(&client).await.unwrap();
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn test_open_failure_fails_acquire() {
        let mock = MockConnector::new();
        mock.fail_open(true);
        let pool = pool(&mock, 0, 1);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, RfcError::Remote(_)));
        assert_eq!(pool.status().opening, 0);
        assert_eq!(pool.status().leased, 0);
    }

    #[tokio::test]
    async fn test_misconfigured_bounds() {
        let mock = MockConnector::new();
        let pool = pool(&mock, 3, 1);
        assert!(matches!(
            pool.acquire().await,
            Err(RfcError::PoolMisconfigured(_))
        ));
        assert_eq!(mock.opens(), 0);
    }

    #[tokio::test]
    async fn test_ready_opens_low() {
        let mock = MockConnector::new();
        let pool = pool(&mock, 2, 4);

        pool.ready().await.unwrap();
        let status = pool.status();
        assert_eq!(status.idle, 2);
        assert_eq!(status.leased, 0);
        assert_eq!(mock.opens(), 2);
    }

    #[tokio::test]
    async fn test_close_fails_waiters_and_closes_members() {
        let mock = MockConnector::new();
        let pool = pool(&mock, 0, 1);

        let client = pool.acquire().await.unwrap();
        let waiting = pool.acquire();
        tokio::task::yield_now().await;

        pool.close().await.unwrap();
        assert!(matches!(waiting.await, Err(RfcError::PoolClosed(_))));
        assert!(!client.alive());
        assert_eq!(mock.closes(), 1);
        assert!(matches!(pool.acquire().await, Err(RfcError::PoolClosed(_))));
    }

    #[tokio::test]
    async fn test_close_closes_idle_and_leased_members() {
        let mock = MockConnector::new();
        let pool = pool(&mock, 2, 3);

        pool.ready().await.unwrap();
        let leased = pool.acquire().await.unwrap();
        let idle = pool.acquire().await.unwrap();
        pool.release(&idle).await.unwrap();
        assert_eq!(pool.status().idle, 1);
        assert_eq!(pool.status().leased, 1);

        pool.close().await.unwrap();
        assert!(!leased.alive());
        assert!(!idle.alive());
        assert_eq!(mock.opens(), 2);
        assert_eq!(mock.closes(), 2);
        let status = pool.status();
        assert_eq!((status.idle, status.leased), (0, 0));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_many_takes_turns() {
        let mock = MockConnector::new();
        let pool = pool(&mock, 0, 2);

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    let clients = pool.acquire_many(2).await?;
                    tokio::task::yield_now().await;
                    pool.release_many(&clients).await?;
                    Ok::<usize, RfcError>(clients.len())
                })
            })
            .collect();

        for task in tasks {
            let leased = tokio::time::timeout(Duration::from_secs(2), task)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(leased, 2);
        }
        let status = pool.status();
        assert_eq!((status.idle, status.leased, status.queued), (2, 0, 0));
        assert_eq!(mock.opens(), 2);
    }

    #[tokio::test]
    async fn test_acquire_many_waits_for_whole_lease() {
        let mock = MockConnector::new();
        let pool = pool(&mock, 0, 2);

        let held = pool.acquire().await.unwrap();
        let many = pool.acquire_many(2);
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.status().queued, 1);

        pool.release(&held).await.unwrap();
        let clients = tokio::time::timeout(Duration::from_secs(1), many)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(clients.len(), 2);
        assert!(clients.iter().any(|c| c.same_as(&held)));
        assert_eq!(pool.status().leased, 2);
        assert_eq!(mock.opens(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_acquire_returns_its_member() {
        let mock = MockConnector::new();
        let pool = pool(&mock, 0, 1);

        let held = pool.acquire().await.unwrap();
        let gave_up = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(gave_up.is_err());

        pool.release(&held).await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(1), pool.acquire())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id(), held.id());

        let status = pool.status();
        assert_eq!((status.leased, status.queued, status.idle), (1, 0, 0));
        assert_eq!(mock.opens(), 1);
    }

    #[tokio::test]
    async fn test_dead_member_is_dropped_on_release() {
        let mock = MockConnector::new();
        let pool = pool(&mock, 0, 1);

        let client = pool.acquire().await.unwrap();
        client.close().await.unwrap();
        pool.release(&client).await.unwrap();

        assert_eq!(pool.status().idle, 0);
        let fresh = pool.acquire().await.unwrap();
        assert_ne!(fresh.id(), client.id());
    }

    #[tokio::test]
    async fn test_acquire_many_bounds() {
        let mock = MockConnector::new();
        let pool = pool(&mock, 0, 2);

        assert!(matches!(
            pool.acquire_many(3).await,
            Err(RfcError::InvalidArgument(_))
        ));
        let clients = pool.acquire_many(2).await.unwrap();
        assert_eq!(clients.len(), 2);
        pool.release_many(&clients).await.unwrap();
        assert_eq!(pool.status().idle, 2);
    }

    #[tokio::test]
    async fn test_client_release_goes_to_pool() {
        let mock = MockConnector::new();
        let pool = pool(&mock, 0, 1);

        let client = pool.acquire().await.unwrap();
        assert_eq!(client.pool_id(), pool.id());
        client.release().await.unwrap();
        assert_eq!(pool.status().idle, 1);
    }
}
