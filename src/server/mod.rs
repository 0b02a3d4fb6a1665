//! Server-side dispatch.
//!
//! A [`Server`] registers remote-callable functions and receives inbound calls
//! through a [`ServerBinding`]. Every inbound call goes through three steps:
//!
//! 1. look up the function by name
//! 2. ask the authentication handler, if one is set
//! 3. run the function and return its reply
//!
//! Background units are routed to [`BgRfcHandlers`] by phase.
//!
//! # Example
//!
//! ```ignore
//! use rfcwire::server::{Server, CallContext};
//!
//! let server = Server::new(gateway.server_binding("RFCWIRE_SERVER"));
//!
//! server.add_function("STFC_CONNECTION", |params: RfcObject, _ctx: CallContext| async move {
//!     Ok(params)
//! })?;
//! server.set_authentication_handler(|attrs| async move { attrs.user == "DEVELOPER" });
//! server.start().await?;
//! ```

mod auth;
mod bgrfc;
mod registry;

pub use auth::{AuthDecision, AuthHandler, FnAuthHandler, SecurityAttributes};
pub use bgrfc::{BgRfcHandlers, UnitIdentifier, UnitPhase, UnitReply, UnitRequest, UnitState};
pub use registry::{
    CallContext, FunctionDescription, FunctionRegistry, Handler, ParameterDescription,
    TypedHandler,
};

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::completion::{Completion, Deferred};
use crate::environment::Environment;
use crate::error::{Result, RfcError};
use crate::transport::{BoxFuture, RfcObject, ServerBinding};

/// One inbound call as delivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundCall {
    pub name: String,
    pub params: RfcObject,
    pub security: SecurityAttributes,
    pub connection_handle: u64,
}

/// Receives inbound calls from a [`ServerBinding`].
pub trait FunctionDispatcher: Send + Sync + 'static {
    fn dispatch(&self, call: InboundCall) -> BoxFuture<'static, Result<RfcObject>>;

    fn dispatch_unit(&self, request: UnitRequest) -> BoxFuture<'static, Result<UnitReply>>;
}

struct ServerInner {
    id: u64,
    binding: Arc<dyn ServerBinding>,
    registry: RwLock<FunctionRegistry>,
    auth: RwLock<Option<Arc<dyn AuthHandler>>>,
    bgrfc: RwLock<BgRfcHandlers>,
    /// Server connection handle; 0 while stopped.
    handle: AtomicU64,
    /// Serializes start and stop.
    lifecycle: tokio::sync::Mutex<()>,
}

impl ServerInner {
    async fn start(self: Arc<Self>) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.handle.load(Ordering::Acquire) != 0 {
            tracing::debug!(server = self.id, "start on running server ignored");
            return Ok(());
        }
        let dispatcher: Arc<dyn FunctionDispatcher> = self.clone();
        let handle = self.binding.start(dispatcher).await?;
        self.handle.store(handle, Ordering::Release);
        tracing::debug!(server = self.id, handle, "server started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let handle = self.handle.load(Ordering::Acquire);
        if handle == 0 {
            return Err(RfcError::NotConnected(format!("server {}", self.id)));
        }
        self.binding.stop().await?;
        self.handle.store(0, Ordering::Release);
        tracing::debug!(server = self.id, handle, "server stopped");
        Ok(())
    }
}

impl FunctionDispatcher for ServerInner {
    fn dispatch(&self, call: InboundCall) -> BoxFuture<'static, Result<RfcObject>> {
        let handler = self.registry.read().get_handler(&call.name);
        let auth = self.auth.read().clone();
        let server = self.id;

        Box::pin(async move {
            let InboundCall {
                name,
                params,
                mut security,
                connection_handle,
            } = call;

            let handler = handler.ok_or_else(|| {
                tracing::debug!(server, function = %name, "no function registered");
                RfcError::HandlerNotFound(name.clone())
            })?;

            if let Some(auth) = auth {
                security.function_name.clone_from(&name);
                let decision = auth.authenticate(security.clone()).await;
                if let Some(reason) = decision.rejection(&name) {
                    tracing::debug!(server, function = %name, user = %security.user, "call denied: {}", reason);
                    return Err(RfcError::AuthenticationDenied(reason));
                }
            }

            handler
                .call(params, CallContext::new(name, connection_handle, security))
                .await
        })
    }

    fn dispatch_unit(&self, request: UnitRequest) -> BoxFuture<'static, Result<UnitReply>> {
        self.bgrfc.read().route(request)
    }
}

/// Remote-callable function host.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a stopped server in the global environment.
    pub fn new(binding: Arc<dyn ServerBinding>) -> Self {
        Self::with_environment(binding, Environment::global())
    }

    pub fn with_environment(binding: Arc<dyn ServerBinding>, env: Arc<Environment>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                id: env.next_server_id(),
                binding,
                registry: RwLock::new(FunctionRegistry::new()),
                auth: RwLock::new(None),
                bgrfc: RwLock::new(BgRfcHandlers::new()),
                handle: AtomicU64::new(0),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn alive(&self) -> bool {
        self.connection_handle() != 0
    }

    /// Server connection handle; 0 while stopped.
    pub fn connection_handle(&self) -> u64 {
        self.inner.handle.load(Ordering::Acquire)
    }

    pub fn start(&self) -> Deferred<()> {
        let inner = self.inner.clone();
        let (completion, deferred) = Completion::deferred();
        completion.spawn(inner.start());
        deferred
    }

    pub fn start_with<F>(&self, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        Completion::callback(callback).spawn(self.inner.clone().start());
    }

    pub fn stop(&self) -> Deferred<()> {
        let inner = self.inner.clone();
        let (completion, deferred) = Completion::deferred();
        completion.spawn(async move { inner.stop().await });
        deferred
    }

    pub fn stop_with<F>(&self, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let inner = self.inner.clone();
        Completion::callback(callback).spawn(async move { inner.stop().await });
    }

    /// Register a typed function under `name`.
    pub fn add_function<F, T, R, Fut>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.inner.registry.write().add(name, handler)?;
        tracing::debug!(server = self.inner.id, function = name, "function added");
        Ok(())
    }

    /// Register a function together with its interface description.
    pub fn add_function_described(
        &self,
        description: FunctionDescription,
        handler: Arc<dyn Handler>,
    ) -> Result<()> {
        let name = description.name.clone();
        self.inner
            .registry
            .write()
            .insert(&name, handler, Some(description))
    }

    pub fn remove_function(&self, name: &str) -> Result<()> {
        self.inner.registry.write().remove(name)?;
        tracing::debug!(server = self.inner.id, function = name, "function removed");
        Ok(())
    }

    pub fn get_function_description(&self, name: &str) -> Result<FunctionDescription> {
        self.inner.registry.read().get_description(name)
    }

    /// Registered function names, sorted.
    pub fn functions(&self) -> Vec<String> {
        self.inner.registry.read().names()
    }

    /// Install the authentication gate. Replaces any previous one.
    pub fn set_authentication_handler<F, Fut, D>(&self, handler: F)
    where
        F: Fn(SecurityAttributes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = D> + Send + 'static,
        D: Into<AuthDecision> + 'static,
    {
        *self.inner.auth.write() = Some(Arc::new(FnAuthHandler::new(handler)));
    }

    pub fn clear_authentication_handler(&self) {
        self.inner.auth.write().take();
    }

    pub fn set_bgrfc_handlers(&self, handlers: BgRfcHandlers) {
        *self.inner.bgrfc.write() = handlers;
    }

    /// This server as seen by a transport.
    pub fn dispatcher(&self) -> Arc<dyn FunctionDispatcher> {
        self.inner.clone()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.inner.id)
            .field("handle", &self.connection_handle())
            .field("functions", &self.inner.registry.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReturnCode;
    use crate::transport::local::LocalGateway;
    use serde_json::json;

    fn server() -> Server {
        let gateway = LocalGateway::new();
        Server::with_environment(gateway.server_binding("TEST"), Environment::new())
    }

    fn call(name: &str, user: &str) -> InboundCall {
        InboundCall {
            name: name.into(),
            params: json!({"REQUTEXT": "hi"}).as_object().cloned().unwrap_or_default(),
            security: SecurityAttributes {
                user: user.into(),
                ..Default::default()
            },
            connection_handle: 1,
        }
    }

    #[tokio::test]
    async fn test_removed_function_is_not_found() {
        let server = server();
        server
            .add_function("FOO", |p: RfcObject, _ctx| async move { Ok(p) })
            .unwrap();
        assert!(server.dispatcher().dispatch(call("FOO", "U")).await.is_ok());

        server.remove_function("FOO").unwrap();
        let err = server.dispatcher().dispatch(call("FOO", "U")).await.unwrap_err();
        assert!(matches!(err, RfcError::HandlerNotFound(ref n) if n == "FOO"));
    }

    #[tokio::test]
    async fn test_auth_runs_before_handler() {
        let server = server();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        server
            .add_function("FOO", move |p: RfcObject, ctx: CallContext| {
                let _ = tx.send(ctx.security().user.clone());
                async move { Ok(p) }
            })
            .unwrap();
        server.set_authentication_handler(|attrs: SecurityAttributes| async move {
            match attrs.user.as_str() {
                "ADMIN" => AuthDecision::OK,
                "GUEST" => AuthDecision::Denied,
                other => AuthDecision::DeniedWithReason(format!("{} is locked", other)),
            }
        });

        assert!(server.dispatcher().dispatch(call("FOO", "ADMIN")).await.is_ok());
        assert_eq!(rx.recv().await.unwrap(), "ADMIN");

        let denied = server.dispatcher().dispatch(call("FOO", "GUEST")).await.unwrap_err();
        assert!(matches!(denied, RfcError::AuthenticationDenied(_)));

        let reason = server.dispatcher().dispatch(call("FOO", "BOB")).await.unwrap_err();
        assert_eq!(reason.to_string(), "Authentication denied: BOB is locked");

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_auth_sees_function_name() {
        let server = server();
        server
            .add_function("FOO", |p: RfcObject, _ctx| async move { Ok(p) })
            .unwrap();
        server.set_authentication_handler(|attrs: SecurityAttributes| async move {
            attrs.function_name == "FOO"
        });

        assert!(server.dispatcher().dispatch(call("FOO", "U")).await.is_ok());
    }

    #[tokio::test]
    async fn test_start_stop() {
        let server = server();
        assert!(!server.alive());

        server.start().await.unwrap();
        assert!(server.alive());
        assert_ne!(server.connection_handle(), 0);

        server.stop().await.unwrap();
        assert!(!server.alive());
        assert!(matches!(server.stop().await, Err(RfcError::NotConnected(_))));
    }

    #[tokio::test]
    async fn test_unit_routing() {
        let server = server();
        server.set_bgrfc_handlers(
            BgRfcHandlers::new().check(|_, _| async { ReturnCode::Ok }),
        );

        let reply = server
            .dispatcher()
            .dispatch_unit(UnitRequest {
                phase: UnitPhase::Check,
                connection_handle: 1,
                unit: UnitIdentifier::new(false, "TID1"),
            })
            .await
            .unwrap();
        assert_eq!(reply, UnitReply::Code(ReturnCode::Ok));
    }
}
