//! Capwire Core - promise-correlated capability RPC over one duplex connection.
//!
//! A service exposes selected methods, properties and events of its handlers
//! under a scope name; a client invokes them by name and awaits each response
//! independently, while event notifications arrive on the same connection.
//!
//! # Example
//!
//! ```rust,ignore
//! use capwire_core::{CapabilityRegistry, Client, Server, Services};
//! use std::convert::Infallible;
//!
//! #[tokio::main]
//! async fn main() -> capwire_core::Result<()> {
//!     let mut builder = CapabilityRegistry::builder("math-api");
//!     builder.method("add", |(a, b): (i64, i64)| async move { Ok::<_, Infallible>(a + b) });
//!
//!     let mut services = Services::new();
//!     services.add(builder.build()?)?;
//!     let server = Server::bind("127.0.0.1:0", services).await?;
//!
//!     let client = Client::connect(server.addr()).await?;
//!     let sum: i64 = client.call("math-api", "add", vec![2.into(), 3.into()]).await?;
//!     assert_eq!(sum, 5);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;

// Re-export commonly used types
pub use client::{Client, Notification, PendingPromise, PromiseStore, ScopeClient};
pub use config::ProtocolConfig;
pub use error::{CapwireError, ErrorInfo, ErrorKind, Result};
pub use protocol::{Channel, Envelope};
pub use server::{
    serve_connection, ApiHandler, CapabilityKind, CapabilityRegistry, EventSource,
    EventSubscription, RegistryBuilder, Server, ServerHandle, Services,
};
