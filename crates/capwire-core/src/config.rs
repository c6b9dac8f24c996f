//! Centralized protocol and connection limits.

use std::time::Duration;

/// Wire and connection configuration.
pub struct ProtocolConfig;

impl ProtocolConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 9090;

    /// Largest accepted frame payload.
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB

    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_CONNECTIONS: usize = 64;

    /// Client-side buffer of undelivered event notifications per receiver.
    pub const NOTIFICATION_BUFFER: usize = 256;

    /// Server-side queue of envelopes waiting to be written, per connection.
    /// Event notifications that find it full are dropped.
    pub const OUTBOUND_BUFFER: usize = 1024;

    /// Ids of dropped pending calls remembered so their late responses are
    /// recognized; the oldest are forgotten first.
    pub const MAX_ABANDONED_PROMISES: usize = 1024;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_are_reasonable() {
        assert!(ProtocolConfig::MAX_MESSAGE_SIZE >= 1024 * 1024);
        assert!(ProtocolConfig::CONNECT_TIMEOUT > Duration::ZERO);
        assert!(ProtocolConfig::MAX_CONNECTIONS > 0);
        assert!(ProtocolConfig::OUTBOUND_BUFFER > 0);
        assert!(ProtocolConfig::MAX_ABANDONED_PROMISES > 0);
    }
}
