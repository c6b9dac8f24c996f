//! Server half: capability registries, dispatch and event forwarding.
//!
//! # Architecture
//!
//! - **Registry**: per-handler immutable table of exposed methods, properties and events
//! - **Dispatcher**: per-connection routing of inbound envelopes to the registry
//! - **Subscriptions**: per-connection forwarder bindings onto event sources
//! - **Listener**: TCP accept loop running one connection task per peer

pub mod connection;
pub mod dispatcher;
pub mod event;
pub mod listener;
pub mod registry;
pub mod subscriptions;

pub use connection::serve_connection;
pub use dispatcher::Dispatcher;
pub use event::{EventSource, EventSubscription};
pub use listener::{Server, ServerHandle};
pub use registry::{
    ApiHandler, Capability, CapabilityDescriptor, CapabilityKind, CapabilityRegistry,
    FromParameters, InvokeFuture, RegistryBuilder, Services,
};
pub use subscriptions::SubscriptionRouter;
