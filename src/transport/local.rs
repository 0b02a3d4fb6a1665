//! In-process gateway.
//!
//! [`LocalGateway`] connects [`Client`](crate::Client)s to
//! [`Server`](crate::server::Server)s living in the same process. A server
//! registers under a program id through [`LocalGateway::server_binding`]; a
//! client reaches it with the connection parameter `program_id`.
//!
//! Calls are measured the way a wire transport would see them: parameters
//! and results are MsgPack-encoded for the byte counters and timing buckets.
//!
//! ```ignore
//! let gateway = LocalGateway::new();
//! let server = Server::new(gateway.server_binding("RFCWIRE"));
//! server.start().await?;
//!
//! let client = Client::new(gateway.clone(), ClientConfig::new(
//!     ConnectionParameters::new().with("program_id", "RFCWIRE").with("user", "DEVELOPER"),
//! ));
//! client.open().await?;
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{
    BoxFuture, CallStats, ConnectionInfo, Connector, InvokeOutcome, InvokeRequest,
    NativeConnection, NativeResult, RfcObject, ServerBinding,
};
use crate::codec::{Measured, MsgPackCodec};
use crate::config::{ClientOptions, ConnectionParameters};
use crate::error::{ErrorGroup, NativeError, ReturnCode, RfcError};
use crate::server::{FunctionDispatcher, InboundCall, SecurityAttributes};

/// Connection parameter naming the target server.
pub const PROGRAM_ID: &str = "program_id";

type ServerTable = DashMap<String, Arc<dyn FunctionDispatcher>>;

/// Routes clients to in-process servers by program id.
pub struct LocalGateway {
    servers: Arc<ServerTable>,
    next_handle: AtomicU64,
}

impl LocalGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            servers: Arc::new(DashMap::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    /// Binding that registers a server under `program_id`.
    pub fn server_binding(self: &Arc<Self>, program_id: &str) -> Arc<dyn ServerBinding> {
        Arc::new(LocalBinding {
            gateway: self.clone(),
            program_id: program_id.to_string(),
        })
    }

    /// Whether a server is registered under `program_id`.
    pub fn is_serving(&self, program_id: &str) -> bool {
        self.servers.contains_key(program_id)
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn dispatcher(&self, program_id: &str) -> NativeResult<Arc<dyn FunctionDispatcher>> {
        self.servers
            .get(program_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                NativeError::communication(format!(
                    "Program id \"{}\" is not registered",
                    program_id
                ))
            })
    }
}

impl Connector for LocalGateway {
    fn open(
        &self,
        params: &ConnectionParameters,
        _options: &ClientOptions,
    ) -> BoxFuture<'static, NativeResult<Arc<dyn NativeConnection>>> {
        let opened = match params.get(PROGRAM_ID) {
            None => Err(NativeError::new(
                ReturnCode::InvalidParameter,
                ErrorGroup::ExternalRuntimeFailure,
                "RFC_INVALID_PARAMETER",
                format!("Missing connection parameter \"{}\"", PROGRAM_ID),
            )),
            Some(program_id) => self.dispatcher(program_id).map(|_| {
                let handle = self.next_handle();
                let connection: Arc<dyn NativeConnection> = Arc::new(LocalConnection {
                    handle,
                    program_id: program_id.to_string(),
                    params: params.clone(),
                    servers: self.servers.clone(),
                    closed: AtomicBool::new(false),
                    cancel: Mutex::new(None),
                });
                tracing::debug!(handle, program_id, "local connection opened");
                connection
            }),
        };
        Box::pin(async move { opened })
    }
}

struct LocalBinding {
    gateway: Arc<LocalGateway>,
    program_id: String,
}

impl ServerBinding for LocalBinding {
    fn start(&self, dispatcher: Arc<dyn FunctionDispatcher>) -> BoxFuture<'_, NativeResult<u64>> {
        Box::pin(async move {
            match self.gateway.servers.entry(self.program_id.clone()) {
                dashmap::mapref::entry::Entry::Occupied(_) => Err(NativeError::new(
                    ReturnCode::IllegalState,
                    ErrorGroup::ExternalRuntimeFailure,
                    "RFC_ILLEGAL_STATE",
                    format!("Program id \"{}\" is already registered", self.program_id),
                )),
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(dispatcher);
                    Ok(self.gateway.next_handle())
                }
            }
        })
    }

    fn stop(&self) -> BoxFuture<'_, NativeResult<()>> {
        Box::pin(async move {
            self.gateway
                .servers
                .remove(&self.program_id)
                .map(|_| ())
                .ok_or_else(|| {
                    NativeError::new(
                        ReturnCode::IllegalState,
                        ErrorGroup::ExternalRuntimeFailure,
                        "RFC_ILLEGAL_STATE",
                        format!("Program id \"{}\" is not registered", self.program_id),
                    )
                })
        })
    }
}

/// One client session against an in-process server.
struct LocalConnection {
    handle: u64,
    program_id: String,
    params: ConnectionParameters,
    servers: Arc<ServerTable>,
    closed: AtomicBool,
    /// Fires the cancel of the call in flight.
    cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl LocalConnection {
    fn check_open(&self) -> NativeResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NativeError::new(
                ReturnCode::InvalidHandle,
                ErrorGroup::ExternalRuntimeFailure,
                "RFC_INVALID_HANDLE",
                format!("Connection {} is closed", self.handle),
            ));
        }
        Ok(())
    }

    fn dispatcher(&self) -> NativeResult<Arc<dyn FunctionDispatcher>> {
        self.servers
            .get(&self.program_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                NativeError::communication(format!(
                    "Partner \"{}\" not reached",
                    self.program_id
                ))
            })
    }

    fn param(&self, key: &str) -> String {
        self.params.get(key).unwrap_or_default().to_string()
    }

    fn security(&self, function: &str) -> SecurityAttributes {
        SecurityAttributes {
            function_name: function.to_string(),
            sys_id: self.param("sysid"),
            client: self.param("client"),
            user: self.param("user"),
            prog_name: self.program_id.clone(),
            partner_host: "localhost".into(),
            snc_name: self.params.get("snc_partnername").map(str::to_string),
        }
    }

    async fn exchange(&self, request: InvokeRequest, stats: &mut CallStats) -> NativeResult<RfcObject> {
        self.check_open()?;
        let dispatcher = self.dispatcher()?;

        let sent = MsgPackCodec::encode_measured(&request.params).map_err(serialization)?;
        stats.sent_bytes = sent.bytes;
        stats.serialization_time = sent.elapsed;

        let (tx, rx) = oneshot::channel();
        *self.cancel.lock() = Some(tx);

        let call = InboundCall {
            security: self.security(&request.name),
            name: request.name,
            params: request.params,
            connection_handle: self.handle,
        };

        let started = Instant::now();
        let reply = tokio::select! {
            reply = dispatcher.dispatch(call) => reply,
            Ok(()) = rx => {
                tracing::debug!(handle = self.handle, "local call cancelled");
                return Err(NativeError::canceled());
            }
        };
        stats.application_time = started.elapsed();
        self.cancel.lock().take();

        let mut result = reply.map_err(|e| to_native(&e))?;
        for name in &request.not_requested {
            result.remove(name);
        }

        let encoded = MsgPackCodec::encode(&result).map_err(serialization)?;
        let received: Measured<RfcObject> =
            MsgPackCodec::decode_measured(&encoded).map_err(serialization)?;
        stats.received_bytes = received.bytes;
        stats.deserialization_time = received.elapsed;
        Ok(received.value)
    }
}

impl NativeConnection for LocalConnection {
    fn handle(&self) -> u64 {
        self.handle
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            dest: self.param("dest"),
            host: "localhost".into(),
            partner_host: "localhost".into(),
            sys_number: self.param("sysnr"),
            sys_id: self.param("sysid"),
            client: self.param("client"),
            user: self.param("user").to_uppercase(),
            language: "E".into(),
            iso_language: "EN".into(),
            codepage: "4103".into(),
            partner_codepage: "4103".into(),
            rfc_role: "C".into(),
            partner_type: "E".into(),
            rel: env!("CARGO_PKG_VERSION").into(),
            partner_rel: env!("CARGO_PKG_VERSION").into(),
            kernel_rel: env!("CARGO_PKG_VERSION").into(),
            cpic_conv_id: format!("{:08}", self.handle),
            prog_name: self.program_id.clone(),
            partner_ip: "127.0.0.1".into(),
        }
    }

    fn ping(&self) -> BoxFuture<'_, NativeResult<()>> {
        Box::pin(async move {
            self.check_open()?;
            self.dispatcher().map(|_| ())
        })
    }

    fn close(&self) -> BoxFuture<'_, NativeResult<()>> {
        Box::pin(async move {
            self.check_open()?;
            self.closed.store(true, Ordering::Release);
            tracing::debug!(handle = self.handle, "local connection closed");
            Ok(())
        })
    }

    fn reset_context(&self) -> BoxFuture<'_, NativeResult<()>> {
        Box::pin(async move { self.check_open() })
    }

    fn cancel(&self) -> BoxFuture<'_, NativeResult<()>> {
        Box::pin(async move {
            if let Some(tx) = self.cancel.lock().take() {
                let _ = tx.send(());
            }
            Ok(())
        })
    }

    fn invoke(&self, request: InvokeRequest) -> BoxFuture<'_, InvokeOutcome> {
        Box::pin(async move {
            let started = Instant::now();
            let mut stats = CallStats::default();
            let result = self.exchange(request, &mut stats).await;
            stats.total_time = started.elapsed();
            InvokeOutcome::new(result, stats)
        })
    }
}

fn serialization(e: RfcError) -> NativeError {
    NativeError::new(
        ReturnCode::SerializationFailure,
        ErrorGroup::ExternalRuntimeFailure,
        "RFC_SERIALIZATION_FAILURE",
        e.to_string(),
    )
}

/// How a server-side failure reaches the calling client.
fn to_native(e: &RfcError) -> NativeError {
    if let Some(native) = e.native() {
        return native.clone();
    }
    match e {
        RfcError::HandlerNotFound(name) => NativeError::new(
            ReturnCode::AbapRuntimeFailure,
            ErrorGroup::AbapRuntimeFailure,
            "FU_NOT_FOUND",
            format!("Function {} not found", name),
        ),
        RfcError::AuthenticationDenied(reason) => NativeError::new(
            ReturnCode::ExternalFailure,
            ErrorGroup::ExternalAuthorizationFailure,
            "RFC_AUTHORIZATION_FAILURE",
            reason.clone(),
        ),
        other => NativeError::new(
            ReturnCode::ExternalFailure,
            ErrorGroup::ExternalApplicationFailure,
            "RFC_EXTERNAL_FAILURE",
            other.to_string(),
        ),
    }
}
