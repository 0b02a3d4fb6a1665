//! Authentication gate for inbound calls.
//!
//! An authentication handler sees the caller's [`SecurityAttributes`] before
//! any registered function runs. Whatever it returns is normalized once into
//! an [`AuthDecision`]:
//!
//! | handler returns | decision |
//! |---|---|
//! | `()` or [`AuthDecision::OK`] | `Allowed` |
//! | `true` / `false` | `Allowed` / `Denied` |
//! | a string | `DeniedWithReason(string)` |
//! | `None` | `Allowed` |

use std::future::Future;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

use crate::transport::BoxFuture;

/// Identity of the caller of an inbound function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityAttributes {
    pub function_name: String,
    pub sys_id: String,
    pub client: String,
    pub user: String,
    pub prog_name: String,
    pub partner_host: String,
    pub snc_name: Option<String>,
}

/// Outcome of the authentication gate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AuthDecision {
    #[default]
    Allowed,
    Denied,
    DeniedWithReason(String),
}

impl AuthDecision {
    /// Explicit "ok" sentinel.
    pub const OK: AuthDecision = AuthDecision::Allowed;

    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthDecision::Allowed)
    }

    /// Rejection message for `function`, if the call is denied.
    pub fn rejection(&self, function: &str) -> Option<String> {
        match self {
            AuthDecision::Allowed => None,
            AuthDecision::Denied => Some(format!("Authentication failed for \"{}\"", function)),
            AuthDecision::DeniedWithReason(reason) => Some(reason.clone()),
        }
    }
}

impl From<()> for AuthDecision {
    fn from(_: ()) -> Self {
        AuthDecision::Allowed
    }
}

impl From<bool> for AuthDecision {
    fn from(allowed: bool) -> Self {
        if allowed {
            AuthDecision::Allowed
        } else {
            AuthDecision::Denied
        }
    }
}

impl From<String> for AuthDecision {
    fn from(reason: String) -> Self {
        AuthDecision::DeniedWithReason(reason)
    }
}

impl From<&str> for AuthDecision {
    fn from(reason: &str) -> Self {
        AuthDecision::DeniedWithReason(reason.to_string())
    }
}

impl<T: Into<AuthDecision>> From<Option<T>> for AuthDecision {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or_default()
    }
}

/// Decides whether an inbound call may proceed.
pub trait AuthHandler: Send + Sync + 'static {
    fn authenticate(&self, attributes: SecurityAttributes) -> BoxFuture<'static, AuthDecision>;
}

/// Adapts an async closure returning anything convertible to [`AuthDecision`].
pub struct FnAuthHandler<F, Fut, D>
where
    F: Fn(SecurityAttributes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = D> + Send + 'static,
    D: Into<AuthDecision> + 'static,
{
    handler: F,
    _phantom: PhantomData<fn() -> (Fut, D)>,
}

impl<F, Fut, D> FnAuthHandler<F, Fut, D>
where
    F: Fn(SecurityAttributes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = D> + Send + 'static,
    D: Into<AuthDecision> + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut, D> AuthHandler for FnAuthHandler<F, Fut, D>
where
    F: Fn(SecurityAttributes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = D> + Send + 'static,
    D: Into<AuthDecision> + 'static,
{
    fn authenticate(&self, attributes: SecurityAttributes) -> BoxFuture<'static, AuthDecision> {
        let fut = (self.handler)(attributes);
        Box::pin(async move { fut.await.into() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization() {
        assert_eq!(AuthDecision::from(()), AuthDecision::Allowed);
        assert_eq!(AuthDecision::from(true), AuthDecision::Allowed);
        assert_eq!(AuthDecision::from(false), AuthDecision::Denied);
        assert_eq!(
            AuthDecision::from("no access"),
            AuthDecision::DeniedWithReason("no access".into())
        );
        assert_eq!(AuthDecision::from(None::<bool>), AuthDecision::Allowed);
        assert_eq!(AuthDecision::from(Some(false)), AuthDecision::Denied);
        assert_eq!(AuthDecision::OK, AuthDecision::Allowed);
    }

    #[test]
    fn test_rejection_message() {
        assert_eq!(AuthDecision::Allowed.rejection("F"), None);
        assert!(AuthDecision::Denied.rejection("F").unwrap().contains("\"F\""));
        assert_eq!(
            AuthDecision::DeniedWithReason("user locked".into()).rejection("F"),
            Some("user locked".into())
        );
    }

    #[tokio::test]
    async fn test_closure_handler() {
        let handler = FnAuthHandler::new(|attrs: SecurityAttributes| async move {
            if attrs.user == "DEVELOPER" {
                None
            } else {
                Some(format!("user {} rejected", attrs.user))
            }
        });

        let allowed = handler
            .authenticate(SecurityAttributes {
                user: "DEVELOPER".into(),
                ..Default::default()
            })
            .await;
        assert!(allowed.is_allowed());

        let denied = handler
            .authenticate(SecurityAttributes {
                user: "GUEST".into(),
                ..Default::default()
            })
            .await;
        assert_eq!(
            denied,
            AuthDecision::DeniedWithReason("user GUEST rejected".into())
        );
    }
}
