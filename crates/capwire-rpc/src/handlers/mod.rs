//! Capability handlers exposed by the server, one per scope.

mod status;

pub use status::StatusApi;
