//! Client, call and pool configuration.
//!
//! Every struct deserializes from the camelCase JSON shape used by the
//! connection store, e.g.
//!
//! ```
//! use rfcwire::config::ClientConfig;
//!
//! let config: ClientConfig = serde_json::from_str(r#"{
//!     "connectionParameters": { "ashost": "10.0.0.1", "sysnr": "00", "client": "620" },
//!     "clientOptions": { "stateless": true, "timeout": 10 }
//! }"#).unwrap();
//!
//! assert!(config.client_options.stateless);
//! assert_eq!(config.client_options.timeout, Some(10));
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RfcError};

/// Default lower bound on idle pool members.
pub const DEFAULT_POOL_LOW: usize = 2;

/// Default upper bound on live pool members.
pub const DEFAULT_POOL_HIGH: usize = 4;

/// Endpoint parameters handed to the native layer unmodified.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionParameters(BTreeMap<String, String>);

impl ConnectionParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter (fluent).
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ConnectionParameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Trace level forwarded to the native layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Off,
    Error,
    Warning,
    Info,
    Debug,
    All,
}

/// Parameter direction, used to shape call results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterDirection {
    Import,
    Export,
    Changing,
    Tables,
}

/// Behavioral options of a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientOptions {
    /// Reset the server context after every call.
    pub stateless: bool,
    /// Default call timeout in seconds; `None` or 0 means no timeout.
    pub timeout: Option<u64>,
    pub log_level: LogLevel,
    /// Only return parameters of this direction.
    pub filter: Option<ParameterDirection>,
    /// Fail `open` on a live client instead of treating it as a no-op.
    pub error_on_reopen: bool,
}

impl ClientOptions {
    pub fn stateless(mut self, stateless: bool) -> Self {
        self.stateless = stateless;
        self
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn filter(mut self, direction: ParameterDirection) -> Self {
        self.filter = Some(direction);
        self
    }

    pub fn error_on_reopen(mut self, enabled: bool) -> Self {
        self.error_on_reopen = enabled;
        self
    }
}

/// Everything a client needs to open a connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub connection_parameters: ConnectionParameters,
    #[serde(default)]
    pub client_options: ClientOptions,
}

impl ClientConfig {
    pub fn new(connection_parameters: ConnectionParameters) -> Self {
        Self {
            connection_parameters,
            client_options: ClientOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.client_options = options;
        self
    }

    /// Parse from the JSON shape of the connection store.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallOptions {
    /// Overrides the client timeout when set and nonzero (seconds).
    pub timeout: Option<u64>,
    /// Result parameters the caller does not want returned.
    pub not_requested: Vec<String>,
}

impl CallOptions {
    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn not_requested<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.not_requested = names.into_iter().map(Into::into).collect();
        self
    }
}

/// Resolve the timeout a call runs under.
///
/// The call-level override wins when present and nonzero, then the client
/// default, otherwise the call is unbounded.
pub fn effective_timeout(call: &CallOptions, client: &ClientOptions) -> Option<Duration> {
    call.timeout
        .filter(|t| *t > 0)
        .or(client.timeout.filter(|t| *t > 0))
        .map(Duration::from_secs)
}

/// Pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolOptions {
    /// Members opened eagerly by `Pool::ready`.
    pub low: usize,
    /// Maximum number of members checked out at the same time.
    pub high: usize,
    /// Reset the server context of members coming back to the pool.
    pub reset_on_release: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            low: DEFAULT_POOL_LOW,
            high: DEFAULT_POOL_HIGH,
            reset_on_release: true,
        }
    }
}

impl PoolOptions {
    pub fn new(low: usize, high: usize) -> Self {
        Self {
            low,
            high,
            ..Self::default()
        }
    }

    pub fn reset_on_release(mut self, enabled: bool) -> Self {
        self.reset_on_release = enabled;
        self
    }

    /// Check the bounds can be honored.
    pub fn validate(&self) -> Result<()> {
        if self.high == 0 {
            return Err(RfcError::PoolMisconfigured(
                "high bound must be at least 1".into(),
            ));
        }
        if self.low > self.high {
            return Err(RfcError::PoolMisconfigured(format!(
                "low bound {} exceeds high bound {}",
                self.low, self.high
            )));
        }
        Ok(())
    }
}

/// Configuration shared by every member of a pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    pub connection_parameters: ConnectionParameters,
    #[serde(default)]
    pub client_options: ClientOptions,
    #[serde(default)]
    pub pool_options: PoolOptions,
}

impl PoolConfig {
    pub fn new(connection_parameters: ConnectionParameters, pool_options: PoolOptions) -> Self {
        Self {
            connection_parameters,
            client_options: ClientOptions::default(),
            pool_options,
        }
    }

    pub fn with_client_options(mut self, options: ClientOptions) -> Self {
        self.client_options = options;
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// The configuration each pool member is opened with.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            connection_parameters: self.connection_parameters.clone(),
            client_options: self.client_options.clone(),
        }
    }
}
