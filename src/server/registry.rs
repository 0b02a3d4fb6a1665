//! Function registry for dispatching inbound calls by name.
//!
//! At most one handler is registered per name. Replacing a handler takes an
//! explicit remove followed by an add; adding over an existing name fails.
//!
//! # Example
//!
//! ```ignore
//! use rfcwire::server::{FunctionRegistry, CallContext};
//!
//! let mut registry = FunctionRegistry::new();
//!
//! registry.add("STFC_CONNECTION", |params: Connection, _ctx: CallContext| async move {
//!     Ok(Echo { echotext: params.requtext })
//! })?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::SecurityAttributes;
use crate::config::ParameterDirection;
use crate::error::{Result, RfcError};
use crate::transport::{BoxFuture, RfcObject};

/// Per-call information handed to a server function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    function: String,
    connection_handle: u64,
    security: SecurityAttributes,
}

impl CallContext {
    pub fn new(function: impl Into<String>, connection_handle: u64, security: SecurityAttributes) -> Self {
        Self {
            function: function.into(),
            connection_handle,
            security,
        }
    }

    #[inline]
    pub fn function(&self) -> &str {
        &self.function
    }

    /// Handle of the server connection the call arrived on.
    #[inline]
    pub fn connection_handle(&self) -> u64 {
        self.connection_handle
    }

    #[inline]
    pub fn security(&self) -> &SecurityAttributes {
        &self.security
    }
}

/// One parameter of a function's interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDescription {
    pub name: String,
    pub direction: ParameterDirection,
    /// Native type name, e.g. `RFCTYPE_CHAR`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub description: String,
}

/// Interface of a remote-callable function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDescription {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<ParameterDescription>,
}

impl FunctionDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
        }
    }

    pub fn parameter(
        mut self,
        name: impl Into<String>,
        direction: ParameterDirection,
        kind: impl Into<String>,
    ) -> Self {
        self.parameters.push(ParameterDescription {
            name: name.into(),
            direction,
            kind: kind.into(),
            optional: false,
            description: String::new(),
        });
        self
    }

    /// Parameters in `direction`.
    pub fn parameters_in(&self, direction: ParameterDirection) -> impl Iterator<Item = &ParameterDescription> {
        self.parameters.iter().filter(move |p| p.direction == direction)
    }
}

/// Trait for server functions.
pub trait Handler: Send + Sync + 'static {
    /// Handle a call with the raw parameter object.
    fn call(&self, params: RfcObject, ctx: CallContext) -> BoxFuture<'static, Result<RfcObject>>;
}

/// Wrapper that deserializes parameters and serializes the reply around a typed function.
pub struct TypedHandler<F, T, R, Fut>
where
    F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, R, Fut> TypedHandler<F, T, R, Fut>
where
    F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, Fut> Handler for TypedHandler<F, T, R, Fut>
where
    F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    fn call(&self, params: RfcObject, ctx: CallContext) -> BoxFuture<'static, Result<RfcObject>> {
        let parsed: T = match serde_json::from_value(serde_json::Value::Object(params)) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e.into()) }),
        };

        let function = ctx.function().to_string();
        let fut = (self.handler)(parsed, ctx);
        Box::pin(async move {
            let reply = fut.await?;
            into_object(&function, serde_json::to_value(reply)?)
        })
    }
}

fn into_object(function: &str, value: serde_json::Value) -> Result<RfcObject> {
    match value {
        serde_json::Value::Object(map) => Ok(map),
        serde_json::Value::Null => Ok(RfcObject::new()),
        other => Err(RfcError::InvalidArgument(format!(
            "Reply of \"{}\" must be an object, got {}",
            function, other
        ))),
    }
}

/// Entry for a registered function.
struct FunctionEntry {
    handler: Arc<dyn Handler>,
    description: Option<FunctionDescription>,
}

/// Registry mapping function names to handlers.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, FunctionEntry>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed function.
    pub fn add<F, T, R, Fut>(&mut self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.insert(name, Arc::new(TypedHandler::new(handler)), None)
    }

    /// Register a handler together with its interface description.
    pub fn insert(
        &mut self,
        name: &str,
        handler: Arc<dyn Handler>,
        description: Option<FunctionDescription>,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(RfcError::InvalidArgument(
                "Server function name must not be empty".into(),
            ));
        }
        if self.functions.contains_key(name) {
            return Err(RfcError::AlreadyRegistered(name.to_string()));
        }
        self.functions.insert(
            name.to_string(),
            FunctionEntry {
                handler,
                description,
            },
        );
        Ok(())
    }

    /// Unregister a function.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        self.functions
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RfcError::HandlerNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn get_handler(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.functions.get(name).map(|e| e.handler.clone())
    }

    /// Interface of `name`. A function registered without one gets a bare
    /// description carrying only its name.
    pub fn get_description(&self, name: &str) -> Result<FunctionDescription> {
        let entry = self
            .functions
            .get(name)
            .ok_or_else(|| RfcError::HandlerNotFound(name.to_string()))?;
        Ok(entry
            .description
            .clone()
            .unwrap_or_else(|| FunctionDescription::new(name)))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Connection {
        #[serde(rename = "REQUTEXT")]
        requtext: String,
    }

    #[derive(Serialize)]
    struct Echo {
        #[serde(rename = "ECHOTEXT")]
        echotext: String,
    }

    fn ctx(function: &str) -> CallContext {
        CallContext::new(function, 1, SecurityAttributes::default())
    }

    fn object(value: serde_json::Value) -> RfcObject {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[tokio::test]
    async fn test_typed_handler_round_trip() {
        let mut registry = FunctionRegistry::new();
        registry
            .add("STFC_CONNECTION", |p: Connection, _ctx| async move {
                Ok(Echo { echotext: p.requtext })
            })
            .unwrap();

        let handler = registry.get_handler("STFC_CONNECTION").unwrap();
        let reply = handler
            .call(object(json!({"REQUTEXT": "hello"})), ctx("STFC_CONNECTION"))
            .await
            .unwrap();
        assert_eq!(reply.get("ECHOTEXT"), Some(&json!("hello")));
    }

    #[tokio::test]
    async fn test_bad_params_are_json_errors() {
        let mut registry = FunctionRegistry::new();
        registry
            .add("F", |p: Connection, _ctx| async move { Ok(Echo { echotext: p.requtext }) })
            .unwrap();

        let err = registry
            .get_handler("F")
            .unwrap()
            .call(object(json!({"OTHER": 1})), ctx("F"))
            .await
            .unwrap_err();
        assert!(matches!(err, RfcError::Json(_)));
    }

    #[tokio::test]
    async fn test_non_object_reply_rejected() {
        let mut registry = FunctionRegistry::new();
        registry
            .add("F", |_: RfcObject, _ctx| async move { Ok(42) })
            .unwrap();

        let err = registry
            .get_handler("F")
            .unwrap()
            .call(RfcObject::new(), ctx("F"))
            .await
            .unwrap_err();
        assert!(matches!(err, RfcError::InvalidArgument(_)));
    }

    #[test]
    fn test_add_remove() {
        let mut registry = FunctionRegistry::new();
        registry
            .add("FOO", |p: RfcObject, _ctx| async move { Ok(p) })
            .unwrap();

        assert!(matches!(
            registry.add("FOO", |p: RfcObject, _ctx| async move { Ok(p) }),
            Err(RfcError::AlreadyRegistered(_))
        ));

        registry.remove("FOO").unwrap();
        assert!(registry.get_handler("FOO").is_none());
        assert!(matches!(
            registry.remove("FOO"),
            Err(RfcError::HandlerNotFound(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_descriptions() {
        let mut registry = FunctionRegistry::new();
        let description = FunctionDescription::new("STFC_CONNECTION")
            .parameter("REQUTEXT", ParameterDirection::Import, "RFCTYPE_CHAR")
            .parameter("ECHOTEXT", ParameterDirection::Export, "RFCTYPE_CHAR");
        let handler: Arc<dyn Handler> = Arc::new(TypedHandler::new(|p: RfcObject, _ctx| async move { Ok(p) }));
        registry
            .insert("STFC_CONNECTION", handler, Some(description.clone()))
            .unwrap();
        registry
            .add("BARE", |p: RfcObject, _ctx| async move { Ok(p) })
            .unwrap();

        assert_eq!(registry.get_description("STFC_CONNECTION").unwrap(), description);
        assert_eq!(
            registry.get_description("BARE").unwrap(),
            FunctionDescription::new("BARE")
        );
        assert_eq!(
            description.parameters_in(ParameterDirection::Export).count(),
            1
        );
        assert_eq!(registry.names(), vec!["BARE", "STFC_CONNECTION"]);
    }
}
