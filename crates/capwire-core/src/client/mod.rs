//! Client half: promise correlation over one shared connection.

pub mod connection;
pub mod promise_store;

pub use connection::{Client, Notification, ScopeClient};
pub use promise_store::{PendingPromise, PromiseStore};
