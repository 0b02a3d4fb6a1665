//! Scriptable transport for tests.
//!
//! [`MockConnector`] opens [`NativeConnection`]s whose invoke behavior is set
//! with [`MockConnector::set_behavior`]. Every native operation is counted at
//! the moment it is issued, so a test can assert for example that exactly
//! one cancel reached the transport.
//!
//! ```ignore
//! let mock = MockConnector::new();
//! mock.set_behavior(MockBehavior::HangUntilCancelled);
//!
//! let client = Client::new(mock.clone(), config);
//! client.open().await?;
//! assert!(client.invoke("SLOW", params, CallOptions::default().timeout(1)).await.is_err());
//! assert_eq!(mock.cancels(), 1);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{
    BoxFuture, CallStats, ConnectionInfo, Connector, InvokeOutcome, InvokeRequest,
    NativeConnection, NativeResult, RfcObject,
};
use crate::config::{ClientOptions, ConnectionParameters};
use crate::error::{ErrorGroup, NativeError, ReturnCode};

/// What an invoke on a mock connection does.
#[derive(Debug, Clone, PartialEq)]
pub enum MockBehavior {
    /// Reply with the call's parameters.
    Echo,
    Reply(RfcObject),
    Fail(NativeError),
    /// Reply after a delay unless cancelled first.
    Delay(Duration, RfcObject),
    /// Reply after a delay even if cancelled.
    IgnoreCancel(Duration, RfcObject),
    /// Complete only when cancelled.
    HangUntilCancelled,
}

#[derive(Debug, Default)]
struct Counters {
    opens: AtomicUsize,
    pings: AtomicUsize,
    invokes: AtomicUsize,
    cancels: AtomicUsize,
    resets: AtomicUsize,
    closes: AtomicUsize,
}

struct MockState {
    behavior: Mutex<MockBehavior>,
    stats: Mutex<CallStats>,
    fail_open: AtomicBool,
    fail_reset: AtomicBool,
    next_handle: AtomicU64,
    counters: Counters,
    last_request: Mutex<Option<InvokeRequest>>,
}

/// Connector producing scripted connections.
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(MockState {
                behavior: Mutex::new(MockBehavior::Echo),
                stats: Mutex::new(CallStats::default()),
                fail_open: AtomicBool::new(false),
                fail_reset: AtomicBool::new(false),
                next_handle: AtomicU64::new(1000),
                counters: Counters::default(),
                last_request: Mutex::new(None),
            }),
        })
    }

    /// Behavior of subsequent invokes on every connection.
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.state.behavior.lock() = behavior;
    }

    /// Counters every invoke reports.
    pub fn set_stats(&self, stats: CallStats) {
        *self.state.stats.lock() = stats;
    }

    pub fn fail_open(&self, fail: bool) {
        self.state.fail_open.store(fail, Ordering::Release);
    }

    pub fn fail_reset(&self, fail: bool) {
        self.state.fail_reset.store(fail, Ordering::Release);
    }

    pub fn opens(&self) -> usize {
        self.state.counters.opens.load(Ordering::Acquire)
    }

    pub fn pings(&self) -> usize {
        self.state.counters.pings.load(Ordering::Acquire)
    }

    pub fn invokes(&self) -> usize {
        self.state.counters.invokes.load(Ordering::Acquire)
    }

    pub fn cancels(&self) -> usize {
        self.state.counters.cancels.load(Ordering::Acquire)
    }

    pub fn resets(&self) -> usize {
        self.state.counters.resets.load(Ordering::Acquire)
    }

    pub fn closes(&self) -> usize {
        self.state.counters.closes.load(Ordering::Acquire)
    }

    /// The request of the most recent invoke.
    pub fn last_request(&self) -> Option<InvokeRequest> {
        self.state.last_request.lock().clone()
    }
}

impl Connector for MockConnector {
    fn open(
        &self,
        params: &ConnectionParameters,
        _options: &ClientOptions,
    ) -> BoxFuture<'static, NativeResult<Arc<dyn NativeConnection>>> {
        let state = self.state.clone();
        let dest = params.get("dest").unwrap_or_default().to_string();
        Box::pin(async move {
            state.counters.opens.fetch_add(1, Ordering::AcqRel);
            if state.fail_open.load(Ordering::Acquire) {
                return Err(NativeError::new(
                    ReturnCode::LogonFailure,
                    ErrorGroup::LogonFailure,
                    "RFC_LOGON_FAILURE",
                    "Name or password is incorrect",
                ));
            }
            let connection: Arc<dyn NativeConnection> = Arc::new(MockConnection {
                handle: state.next_handle.fetch_add(1, Ordering::Relaxed),
                dest,
                state: state.clone(),
                cancel: Mutex::new(None),
            });
            Ok(connection)
        })
    }
}

struct MockConnection {
    handle: u64,
    dest: String,
    state: Arc<MockState>,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl MockConnection {
    async fn run(&self, behavior: MockBehavior, params: RfcObject) -> NativeResult<RfcObject> {
        let (tx, rx) = oneshot::channel();
        *self.cancel.lock() = Some(tx);

        let result = match behavior {
            MockBehavior::Echo => Ok(params),
            MockBehavior::Reply(reply) => Ok(reply),
            MockBehavior::Fail(error) => Err(error),
            MockBehavior::Delay(delay, reply) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Ok(reply),
                    Ok(()) = rx => Err(NativeError::canceled()),
                }
            }
            MockBehavior::IgnoreCancel(delay, reply) => {
                tokio::time::sleep(delay).await;
                Ok(reply)
            }
            MockBehavior::HangUntilCancelled => match rx.await {
                Ok(()) => Err(NativeError::canceled()),
                Err(_) => Err(NativeError::communication("mock connection dropped")),
            },
        };

        self.cancel.lock().take();
        result
    }
}

impl NativeConnection for MockConnection {
    fn handle(&self) -> u64 {
        self.handle
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            dest: self.dest.clone(),
            host: "mock".into(),
            partner_host: "mock".into(),
            sys_id: "MCK".into(),
            client: "000".into(),
            ..ConnectionInfo::default()
        }
    }

    fn ping(&self) -> BoxFuture<'_, NativeResult<()>> {
        self.state.counters.pings.fetch_add(1, Ordering::AcqRel);
        Box::pin(async { Ok(()) })
    }

    fn close(&self) -> BoxFuture<'_, NativeResult<()>> {
        self.state.counters.closes.fetch_add(1, Ordering::AcqRel);
        Box::pin(async { Ok(()) })
    }

    fn reset_context(&self) -> BoxFuture<'_, NativeResult<()>> {
        self.state.counters.resets.fetch_add(1, Ordering::AcqRel);
        let fail = self.state.fail_reset.load(Ordering::Acquire);
        Box::pin(async move {
            if fail {
                Err(NativeError::new(
                    ReturnCode::AbapRuntimeFailure,
                    ErrorGroup::AbapRuntimeFailure,
                    "RFC_ABAP_RUNTIME_FAILURE",
                    "Context reset failed",
                ))
            } else {
                Ok(())
            }
        })
    }

    fn cancel(&self) -> BoxFuture<'_, NativeResult<()>> {
        self.state.counters.cancels.fetch_add(1, Ordering::AcqRel);
        if let Some(tx) = self.cancel.lock().take() {
            let _ = tx.send(());
        }
        Box::pin(async { Ok(()) })
    }

    fn invoke(&self, request: InvokeRequest) -> BoxFuture<'_, InvokeOutcome> {
        self.state.counters.invokes.fetch_add(1, Ordering::AcqRel);
        let behavior = self.state.behavior.lock().clone();
        let stats = *self.state.stats.lock();
        *self.state.last_request.lock() = Some(request.clone());

        Box::pin(async move {
            let result = self.run(behavior, request.params).await.map(|mut reply| {
                for name in &request.not_requested {
                    reply.remove(name);
                }
                reply
            });
            InvokeOutcome::new(result, stats)
        })
    }
}
