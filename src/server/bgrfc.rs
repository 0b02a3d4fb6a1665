//! Background-unit (bgRFC) phase routing.
//!
//! A background unit runs through `check`, then `commit` or `rollback`, then
//! `confirm`; `get_state` may be asked at any time. The runtime calls the
//! matching handler with the server connection handle and the unit
//! identifier. Transactional semantics belong to the handlers. This module
//! only routes, and units never share state here.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ReturnCode, RfcError};
use crate::transport::BoxFuture;

/// Identifies one background unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitIdentifier {
    /// Queued (`Q`) or transactional (`T`) unit.
    pub queued: bool,
    pub id: String,
}

impl UnitIdentifier {
    pub fn new(queued: bool, id: impl Into<String>) -> Self {
        Self {
            queued,
            id: id.into(),
        }
    }

    pub fn unit_type(&self) -> char {
        if self.queued {
            'Q'
        } else {
            'T'
        }
    }
}

impl std::fmt::Display for UnitIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.unit_type(), self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitState {
    NotFound,
    InProcess,
    Committed,
    RolledBack,
    Confirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnitPhase {
    Check,
    Commit,
    Rollback,
    Confirm,
    GetState,
}

impl std::fmt::Display for UnitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UnitPhase::Check => "check",
            UnitPhase::Commit => "commit",
            UnitPhase::Rollback => "rollback",
            UnitPhase::Confirm => "confirm",
            UnitPhase::GetState => "getState",
        };
        f.write_str(name)
    }
}

/// One phase callback invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitRequest {
    pub phase: UnitPhase,
    pub connection_handle: u64,
    pub unit: UnitIdentifier,
}

/// What a phase callback answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitReply {
    Code(ReturnCode),
    State(UnitState),
}

type PhaseFn = Arc<dyn Fn(u64, UnitIdentifier) -> BoxFuture<'static, ReturnCode> + Send + Sync>;
type StateFn = Arc<dyn Fn(u64, UnitIdentifier) -> BoxFuture<'static, UnitState> + Send + Sync>;

/// The set of background-unit callbacks of a server.
///
/// ```ignore
/// let handlers = BgRfcHandlers::new()
///     .check(|_handle, _unit| async { ReturnCode::Ok })
///     .commit(|_handle, _unit| async { ReturnCode::Ok })
///     .get_state(|_handle, _unit| async { UnitState::Committed });
/// ```
#[derive(Clone, Default)]
pub struct BgRfcHandlers {
    check: Option<PhaseFn>,
    commit: Option<PhaseFn>,
    rollback: Option<PhaseFn>,
    confirm: Option<PhaseFn>,
    get_state: Option<StateFn>,
}

fn phase_fn<F, Fut>(f: F) -> PhaseFn
where
    F: Fn(u64, UnitIdentifier) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ReturnCode> + Send + 'static,
{
    Arc::new(move |handle: u64, unit: UnitIdentifier| {
        Box::pin(f(handle, unit)) as BoxFuture<'static, ReturnCode>
    })
}

impl BgRfcHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(u64, UnitIdentifier) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ReturnCode> + Send + 'static,
    {
        self.check = Some(phase_fn(f));
        self
    }

    pub fn commit<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(u64, UnitIdentifier) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ReturnCode> + Send + 'static,
    {
        self.commit = Some(phase_fn(f));
        self
    }

    pub fn rollback<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(u64, UnitIdentifier) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ReturnCode> + Send + 'static,
    {
        self.rollback = Some(phase_fn(f));
        self
    }

    pub fn confirm<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(u64, UnitIdentifier) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ReturnCode> + Send + 'static,
    {
        self.confirm = Some(phase_fn(f));
        self
    }

    pub fn get_state<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(u64, UnitIdentifier) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = UnitState> + Send + 'static,
    {
        self.get_state = Some(Arc::new(move |handle: u64, unit: UnitIdentifier| {
            Box::pin(f(handle, unit)) as BoxFuture<'static, UnitState>
        }));
        self
    }

    /// Whether a callback is installed for `phase`.
    pub fn handles(&self, phase: UnitPhase) -> bool {
        match phase {
            UnitPhase::Check => self.check.is_some(),
            UnitPhase::Commit => self.commit.is_some(),
            UnitPhase::Rollback => self.rollback.is_some(),
            UnitPhase::Confirm => self.confirm.is_some(),
            UnitPhase::GetState => self.get_state.is_some(),
        }
    }

    /// Run the callback for `request.phase`.
    pub fn route(&self, request: UnitRequest) -> BoxFuture<'static, Result<UnitReply>> {
        let UnitRequest {
            phase,
            connection_handle,
            unit,
        } = request;
        tracing::debug!(%phase, %unit, connection_handle, "background unit phase");

        let phase_handler = match phase {
            UnitPhase::Check => &self.check,
            UnitPhase::Commit => &self.commit,
            UnitPhase::Rollback => &self.rollback,
            UnitPhase::Confirm => &self.confirm,
            UnitPhase::GetState => {
                return match &self.get_state {
                    Some(f) => {
                        let fut = f(connection_handle, unit);
                        Box::pin(async move { Ok(UnitReply::State(fut.await)) })
                    }
                    None => Box::pin(async move { Err(missing(phase)) }),
                };
            }
        };

        match phase_handler {
            Some(f) => {
                let fut = f(connection_handle, unit);
                Box::pin(async move { Ok(UnitReply::Code(fut.await)) })
            }
            None => Box::pin(async move { Err(missing(phase)) }),
        }
    }
}

fn missing(phase: UnitPhase) -> RfcError {
    RfcError::HandlerNotFound(format!("bgRFC {} handler", phase))
}

impl std::fmt::Debug for BgRfcHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BgRfcHandlers")
            .field("check", &self.check.is_some())
            .field("commit", &self.commit.is_some())
            .field("rollback", &self.rollback.is_some())
            .field("confirm", &self.confirm.is_some())
            .field("get_state", &self.get_state.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use parking_lot::Mutex;

    fn request(phase: UnitPhase, id: &str) -> UnitRequest {
        UnitRequest {
            phase,
            connection_handle: 7,
            unit: UnitIdentifier::new(true, id),
        }
    }

    #[tokio::test]
    async fn test_routes_each_phase() {
        let handlers = BgRfcHandlers::new()
            .check(|_, _| async { ReturnCode::Ok })
            .commit(|_, _| async { ReturnCode::Ok })
            .rollback(|_, _| async { ReturnCode::ExternalFailure })
            .confirm(|_, _| async { ReturnCode::Ok })
            .get_state(|_, _| async { UnitState::Committed });

        assert_eq!(
            handlers.route(request(UnitPhase::Check, "U1")).await.unwrap(),
            UnitReply::Code(ReturnCode::Ok)
        );
        assert_eq!(
            handlers.route(request(UnitPhase::Rollback, "U1")).await.unwrap(),
            UnitReply::Code(ReturnCode::ExternalFailure)
        );
        assert_eq!(
            handlers.route(request(UnitPhase::GetState, "U1")).await.unwrap(),
            UnitReply::State(UnitState::Committed)
        );
    }

    #[tokio::test]
    async fn test_missing_phase_handler() {
        let handlers = BgRfcHandlers::new().check(|_, _| async { ReturnCode::Ok });
        assert!(!handlers.handles(UnitPhase::Commit));

        let err = handlers
            .route(request(UnitPhase::Commit, "U1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RfcError::HandlerNotFound(ref m) if m.contains("commit")));
    }

    #[tokio::test]
    async fn test_units_are_independent() {
        let states: Arc<Mutex<HashMap<String, UnitState>>> = Arc::default();
        let commit_states = states.clone();
        let read_states = states.clone();

        let handlers = BgRfcHandlers::new()
            .commit(move |_, unit| {
                commit_states.lock().insert(unit.id, UnitState::Committed);
                async { ReturnCode::Ok }
            })
            .get_state(move |_, unit| {
                let state = read_states
                    .lock()
                    .get(&unit.id)
                    .copied()
                    .unwrap_or(UnitState::NotFound);
                async move { state }
            });

        handlers.route(request(UnitPhase::Commit, "A")).await.unwrap();

        assert_eq!(
            handlers.route(request(UnitPhase::GetState, "A")).await.unwrap(),
            UnitReply::State(UnitState::Committed)
        );
        assert_eq!(
            handlers.route(request(UnitPhase::GetState, "B")).await.unwrap(),
            UnitReply::State(UnitState::NotFound)
        );
    }

    #[test]
    fn test_unit_display() {
        assert_eq!(UnitIdentifier::new(true, "ABC").to_string(), "Q:ABC");
        assert_eq!(UnitIdentifier::new(false, "ABC").to_string(), "T:ABC");
    }
}
