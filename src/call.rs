//! Call descriptors and the timeout/cancel controller.
//!
//! A call runs through a small state machine:
//!
//! ```text
//! armed ──► completed ─────────────────────► disarmed
//!   └─────► cancel-requested ──► completed ─► disarmed
//! ```
//!
//! When the timer fires first, the only side effect is the cancel request.
//! The caller still receives whatever the underlying call eventually reports,
//! which may be a cancellation error or, if the remote side won the race, a
//! late success. No separate timeout result is ever produced.

use std::future::Future;
use std::time::Duration;

use crate::config::{CallOptions, ParameterDirection};
use crate::error::{Result, RfcError};
use crate::transport::{InvokeRequest, RfcObject};

/// Name, parameters and options of one remote invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CallDescriptor {
    pub name: String,
    pub params: RfcObject,
    pub options: CallOptions,
}

impl CallDescriptor {
    pub fn new(name: impl Into<String>, params: RfcObject, options: CallOptions) -> Self {
        Self {
            name: name.into(),
            params,
            options,
        }
    }

    /// Reject the call before it reaches the transport.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(RfcError::InvalidArgument(
                "Remote function module name must not be empty".into(),
            ));
        }
        for key in self.params.keys() {
            if key.is_empty() {
                return Err(RfcError::InvalidArgument(format!(
                    "Empty RFM parameter name when calling \"{}\"",
                    self.name
                )));
            }
            if !is_valid_parameter_name(key) {
                return Err(RfcError::InvalidArgument(format!(
                    "RFM parameter name invalid: \"{}\" when calling \"{}\"",
                    key, self.name
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn into_request(self, filter: Option<ParameterDirection>) -> InvokeRequest {
        InvokeRequest {
            name: self.name,
            params: self.params,
            not_requested: self.options.not_requested,
            filter,
        }
    }
}

/// `^[A-Za-z0-9_]+$`
pub fn is_valid_parameter_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Output of a supervised call.
#[derive(Debug)]
pub struct Supervised<T, R> {
    pub output: T,
    /// What `request_cancel` returned, if the timer fired.
    pub cancel: Option<R>,
}

impl<T, R> Supervised<T, R> {
    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_some()
    }
}

/// Run `call` under `timeout`.
///
/// If the timer fires before `call` completes, `request_cancel` runs once and
/// the call keeps being awaited. The timer is dropped the moment the call
/// completes.
pub async fn supervise<F, C, R>(
    call: F,
    timeout: Option<Duration>,
    request_cancel: C,
) -> Supervised<F::Output, R>
where
    F: Future,
    C: FnOnce() -> R,
{
    let Some(timeout) = timeout else {
        return Supervised {
            output: call.await,
            cancel: None,
        };
    };

    tokio::pin!(call);
    let timer = tokio::time::sleep(timeout);
    tokio::pin!(timer);

    tokio::select! {
        biased;
        output = &mut call => {
            return Supervised { output, cancel: None };
        }
        _ = &mut timer => {}
    }

    tracing::debug!(?timeout, "call timed out, requesting cancel");
    let cancel = request_cancel();

    let output = call.await;
    tracing::trace!("cancelled call completed");
    Supervised {
        output,
        cancel: Some(cancel),
    }
}
