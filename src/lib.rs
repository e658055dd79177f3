#![deny(unsafe_code)]

//! Service-discovery-backed RPC client.
//!
//! Resolves a service name against a Nacos-compatible registry, keeps a live address
//! list through a background poller, and dispatches HTTP calls across the resolved
//! endpoints with round-robin selection and per-attempt failover.
//!
//! ## Quick start
//!
//! ```no_run
//! use wayfinder::{ClientError, RegistryConfig, ServiceClient};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config: RegistryConfig = serde_yaml::from_str("ipAddr: 127.0.0.1\nport: 8848\n")?;
//! let client = ServiceClient::connect(&config, "orders", vec![], None).await?;
//!
//! match client.get(wayfinder::get("/v1/orders/42")).await {
//!     Ok(body) => println!("{} bytes", body.len()),
//!     Err(ClientError::NoEndpoints { service }) => eprintln!("no endpoints yet for {service}"),
//!     Err(err) => eprintln!("call failed: {err}"),
//! }
//!
//! client.close().await;
//! # Ok(())
//! # }
//! ```

mod backoff;
mod client;
mod clock;
mod config;
mod dispatcher;
mod error;
mod instance;
mod pool;
mod poller;
mod registry_client;
mod resolver;
mod shutdown;
mod sleeper;
mod updater;

pub use backoff::Backoff;
pub use client::{get, post_json, ServiceClient};
pub use clock::{Clock, MonotonicClock};
pub use config::RegistryConfig;
pub use dispatcher::{Body, CallContext, CallSpec, RequestDispatcher};
pub use error::{ClientError, RegistryConfigError, TimeoutExceeded};
pub use instance::{Instance, InstanceSnapshot, ServiceTarget};
pub use pool::{BufferHandle, BufferPools, BufferTier};
pub use poller::{DiscoveryPoller, PollerToken};
pub use registry_client::RegistryClient;
pub use resolver::AddressResolver;
pub use shutdown::{CompletionToken, ShutdownCoordinator};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
