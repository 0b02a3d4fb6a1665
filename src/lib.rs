//! # rfcwire
//!
//! Call lifecycle, connection pooling and server dispatch over a native
//! remote-function-call transport.
//!
//! The native layer (marshalling, wire protocol, sessions) sits behind the
//! traits in [`transport`]. On top of it this crate provides:
//!
//! - **[`Client`]**: one connection handle with `open`, `ping`, `close`,
//!   `reset_context`, `cancel` and `invoke`, each usable with a callback or
//!   as an awaitable [`Deferred`]
//! - **Call timeouts**: a timed-out call gets exactly one cancel, and the
//!   caller still receives the call's own completion
//! - **[`Pool`]**: bounded lending of clients with idle reuse and queued acquires
//! - **[`Throughput`]**: call and byte counters aggregated over clients
//! - **[`server::Server`]**: named functions behind an authentication gate,
//!   plus background-unit phase routing
//!
//! ## Example
//!
//! ```ignore
//! use rfcwire::config::{ClientConfig, ClientOptions, ConnectionParameters};
//! use rfcwire::transport::local::LocalGateway;
//! use rfcwire::Client;
//!
//! #[tokio::main]
//! async fn main() -> rfcwire::Result<()> {
//!     let gateway = LocalGateway::new();
//!     let client = Client::new(
//!         gateway.clone(),
//!         ClientConfig::new(ConnectionParameters::new().with("program_id", "RFCWIRE"))
//!             .with_options(ClientOptions::default().timeout(10)),
//!     );
//!
//!     client.open().await?;
//!     let result = client.call("STFC_CONNECTION", Default::default()).await?;
//!     println!("{:?}", result);
//!     client.close().await
//! }
//! ```

pub mod call;
pub mod codec;
pub mod completion;
pub mod config;
pub mod environment;
pub mod error;
pub mod server;
pub mod throughput;
pub mod transport;

mod client;
mod pool;

pub use client::{cancel_client, Client};
pub use completion::Deferred;
pub use environment::{Environment, LibraryEvent};
pub use error::{Result, RfcError};
pub use pool::{Pool, PoolStatus};
pub use throughput::{Throughput, ThroughputStatus};
