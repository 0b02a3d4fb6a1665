//! Native transport boundary.
//!
//! The marshalling of parameters and the wire protocol live behind these
//! traits. This crate only drives them:
//!
//! - [`Connector`] opens connections from endpoint parameters
//! - [`NativeConnection`] is one open session with its numeric handle
//! - [`ServerBinding`] registers a [`FunctionDispatcher`] to receive inbound calls
//!
//! Two implementations ship with the crate: [`local::LocalGateway`], an
//! in-process gateway that connects clients to a [`crate::server::Server`],
//! and [`mock::MockConnector`], a scriptable transport for tests.

pub mod local;
pub mod mock;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{ClientOptions, ConnectionParameters, ParameterDirection};
use crate::error::NativeError;
use crate::server::FunctionDispatcher;

/// Boxed future returned by transport operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Parameter and result object of a remote function.
pub type RfcObject = serde_json::Map<String, serde_json::Value>;

/// Result of a native operation.
pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Endpoint and session metadata of an open connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub dest: String,
    pub host: String,
    pub partner_host: String,
    pub sys_number: String,
    pub sys_id: String,
    pub client: String,
    pub user: String,
    pub language: String,
    pub iso_language: String,
    pub codepage: String,
    pub partner_codepage: String,
    pub rfc_role: String,
    pub partner_type: String,
    pub rel: String,
    pub partner_rel: String,
    pub kernel_rel: String,
    pub cpic_conv_id: String,
    pub prog_name: String,
    pub partner_ip: String,
}

/// One invocation as handed to the native layer.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeRequest {
    pub name: String,
    pub params: RfcObject,
    pub not_requested: Vec<String>,
    pub filter: Option<ParameterDirection>,
}

/// Counters the native layer measured for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallStats {
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub application_time: Duration,
    pub total_time: Duration,
    pub serialization_time: Duration,
    pub deserialization_time: Duration,
}

/// Outcome of a native invoke: the result plus what it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeOutcome {
    pub result: NativeResult<RfcObject>,
    pub stats: CallStats,
}

impl InvokeOutcome {
    pub fn new(result: NativeResult<RfcObject>, stats: CallStats) -> Self {
        Self { result, stats }
    }
}

/// Opens native connections.
pub trait Connector: Send + Sync + 'static {
    /// Open a connection to the endpoint described by `params`.
    fn open(
        &self,
        params: &ConnectionParameters,
        options: &ClientOptions,
    ) -> BoxFuture<'static, NativeResult<Arc<dyn NativeConnection>>>;
}

/// One open native session.
///
/// All operations take `&self` so a cancel can be issued while an invoke is
/// in flight on the same connection.
pub trait NativeConnection: Send + Sync + 'static {
    /// Nonzero numeric identity of the session.
    fn handle(&self) -> u64;

    fn connection_info(&self) -> ConnectionInfo;

    fn ping(&self) -> BoxFuture<'_, NativeResult<()>>;

    fn close(&self) -> BoxFuture<'_, NativeResult<()>>;

    fn reset_context(&self) -> BoxFuture<'_, NativeResult<()>>;

    /// Abort the in-flight call, if any. Best effort.
    fn cancel(&self) -> BoxFuture<'_, NativeResult<()>>;

    fn invoke(&self, request: InvokeRequest) -> BoxFuture<'_, InvokeOutcome>;
}

/// Server-side native primitive.
pub trait ServerBinding: Send + Sync + 'static {
    /// Start receiving calls; returns the server connection handle.
    fn start(&self, dispatcher: Arc<dyn FunctionDispatcher>) -> BoxFuture<'_, NativeResult<u64>>;

    fn stop(&self) -> BoxFuture<'_, NativeResult<()>>;
}
