//! Error types for rfcwire.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Return codes reported by the native layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReturnCode {
    Ok,
    CommunicationFailure,
    LogonFailure,
    AbapRuntimeFailure,
    AbapMessage,
    AbapException,
    Closed,
    Canceled,
    Timeout,
    MemoryInsufficient,
    VersionMismatch,
    InvalidProtocol,
    SerializationFailure,
    InvalidHandle,
    RetryLater,
    ExternalFailure,
    ExecutedByOtherHandler,
    IllegalState,
    InvalidParameter,
    UnknownError,
}

/// Error group of a native error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorGroup {
    Ok,
    AbapApplicationFailure,
    AbapRuntimeFailure,
    LogonFailure,
    CommunicationFailure,
    ExternalRuntimeFailure,
    ExternalApplicationFailure,
    ExternalAuthorizationFailure,
    ExternalAuthenticationFailure,
    CryptolibFailure,
    LockingFailure,
}

/// Error object produced by the native transport.
///
/// This layer never inspects these beyond the cancellation and
/// broken-connection checks; they reach the caller as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeError {
    pub code: ReturnCode,
    pub group: ErrorGroup,
    pub key: String,
    pub message: String,
}

impl NativeError {
    pub fn new(
        code: ReturnCode,
        group: ErrorGroup,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code,
            group,
            key: key.into(),
            message: message.into(),
        }
    }

    /// The error a native call reports when a cancel won the race.
    pub fn canceled() -> Self {
        Self::new(
            ReturnCode::Canceled,
            ErrorGroup::ExternalRuntimeFailure,
            "RFC_CANCELED",
            "Connection canceled by the client",
        )
    }

    /// A communication failure; the connection is unusable afterwards.
    pub fn communication(message: impl Into<String>) -> Self {
        Self::new(
            ReturnCode::CommunicationFailure,
            ErrorGroup::CommunicationFailure,
            "RFC_COMMUNICATION_FAILURE",
            message,
        )
    }

    /// Whether this error means the underlying transport is gone.
    pub fn is_broken_connection(&self) -> bool {
        self.group == ErrorGroup::CommunicationFailure
            || matches!(self.code, ReturnCode::Closed | ReturnCode::InvalidHandle)
    }
}

impl std::fmt::Display for NativeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:?}): {}", self.key, self.code, self.message)
    }
}

impl std::error::Error for NativeError {}

/// Main error type for all rfcwire operations.
#[derive(Debug, Error)]
pub enum RfcError {
    /// Bad call-convention usage or malformed call descriptor.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted on a handle that is not live.
    #[error("Client not connected: {0}")]
    NotConnected(String),

    /// `open` on a live handle with `errorOnReopen` set.
    #[error("Client already open: {0}")]
    AlreadyOpen(String),

    /// Failure reported by the native transport.
    #[error("Remote error: {0}")]
    Remote(NativeError),

    /// The call was aborted by a cancel request.
    #[error("Call cancelled: {0}")]
    Cancelled(NativeError),

    /// Acquire or release on a closed pool.
    #[error("Pool {0} is closed")]
    PoolClosed(u64),

    /// Pool bounds that cannot be honored.
    #[error("Pool misconfigured: {0}")]
    PoolMisconfigured(String),

    /// Release of a client this pool did not lend out.
    #[error("Client {client} is not checked out from pool {pool}")]
    NotCheckedOut { client: u64, pool: u64 },

    /// No server function registered under the name.
    #[error("Function not registered: {0}")]
    HandlerNotFound(String),

    /// Server function name already in use.
    #[error("Function already registered: {0}")]
    AlreadyRegistered(String),

    /// The authentication handler rejected an inbound call.
    #[error("Authentication denied: {0}")]
    AuthenticationDenied(String),

    /// Throughput monitor could not be attached.
    #[error("Throughput error: {0}")]
    Throughput(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// The task driving an operation went away before completing it.
    #[error("Completion dropped before the operation finished")]
    CompletionDropped,
}

impl RfcError {
    /// True when a timeout- or user-triggered cancel ended the call.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RfcError::Cancelled(_))
    }

    /// The native error, if this error came from the transport.
    pub fn native(&self) -> Option<&NativeError> {
        match self {
            RfcError::Remote(e) | RfcError::Cancelled(e) => Some(e),
            _ => None,
        }
    }
}

impl From<NativeError> for RfcError {
    fn from(e: NativeError) -> Self {
        if e.code == ReturnCode::Canceled {
            RfcError::Cancelled(e)
        } else {
            RfcError::Remote(e)
        }
    }
}

/// Result type alias using RfcError.
pub type Result<T> = std::result::Result<T, RfcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canceled_maps_to_cancelled() {
        let err: RfcError = NativeError::canceled().into();
        assert!(err.is_cancellation());
        assert_eq!(err.native().unwrap().code, ReturnCode::Canceled);
    }

    #[test]
    fn test_remote_passthrough() {
        let native = NativeError::new(
            ReturnCode::AbapException,
            ErrorGroup::AbapApplicationFailure,
            "NOT_FOUND",
            "Material not found",
        );
        let err: RfcError = native.clone().into();
        assert!(!err.is_cancellation());
        assert_eq!(err.native(), Some(&native));
    }

    #[test]
    fn test_broken_connection_detection() {
        assert!(NativeError::communication("partner gone").is_broken_connection());
        assert!(!NativeError::canceled().is_broken_connection());
    }
}
