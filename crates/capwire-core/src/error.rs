//! Error types for capwire.
//!
//! Every failure that can cross the wire collapses onto a stable [`ErrorKind`]
//! and is serialized as one [`ErrorInfo`] shape, so clients branch on the kind
//! rather than on message text.

use crate::server::registry::CapabilityKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for capwire.
#[derive(Debug, Error)]
pub enum CapwireError {
    // Wire errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // Resolution errors
    #[error("Unknown {kind} '{name}'")]
    UnknownCapability { name: String, kind: CapabilityKind },

    #[error("Unknown scope '{scope}'")]
    UnknownScope { scope: String },

    // Invocation errors
    #[error("Method '{method}' takes {required}..={declared} parameters, got {provided}")]
    Arity {
        method: String,
        required: usize,
        declared: usize,
        provided: usize,
    },

    #[error("Parameter {index} of '{method}' could not be converted: {message}")]
    ArgumentConversion {
        method: String,
        index: usize,
        message: String,
    },

    #[error("{message}")]
    Fault { message: String },

    /// Failure reported by the remote side through a `set-promise` envelope.
    #[error("{kind}: {message}")]
    Remote { kind: ErrorKind, message: String },

    // Connection errors
    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for capwire operations.
pub type Result<T> = std::result::Result<T, CapwireError>;

impl From<std::io::Error> for CapwireError {
    fn from(err: std::io::Error) -> Self {
        CapwireError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for CapwireError {
    fn from(err: serde_json::Error) -> Self {
        CapwireError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

/// Stable failure classification carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ProtocolError,
    UnknownCapability,
    ArityError,
    ArgumentConversionError,
    RemoteFault,
    ConnectionClosed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ProtocolError => "ProtocolError",
            ErrorKind::UnknownCapability => "UnknownCapability",
            ErrorKind::ArityError => "ArityError",
            ErrorKind::ArgumentConversionError => "ArgumentConversionError",
            ErrorKind::RemoteFault => "RemoteFault",
            ErrorKind::ConnectionClosed => "ConnectionClosed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ProtocolError" => Some(ErrorKind::ProtocolError),
            "UnknownCapability" => Some(ErrorKind::UnknownCapability),
            "ArityError" => Some(ErrorKind::ArityError),
            "ArgumentConversionError" => Some(ErrorKind::ArgumentConversionError),
            "RemoteFault" => Some(ErrorKind::RemoteFault),
            "ConnectionClosed" => Some(ErrorKind::ConnectionClosed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Serialized failure body of a `set-promise` envelope.
///
/// `kind` stays a plain string on the wire so a newer server can introduce
/// kinds an older client does not know; see [`ErrorInfo::error_kind`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    pub kind: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: kind.as_str().to_string(),
        }
    }

    /// Decoded kind; unrecognized kinds are treated as a remote fault.
    pub fn error_kind(&self) -> ErrorKind {
        ErrorKind::from_str(&self.kind).unwrap_or(ErrorKind::RemoteFault)
    }
}

impl From<ErrorInfo> for CapwireError {
    fn from(info: ErrorInfo) -> Self {
        CapwireError::Remote {
            kind: info.error_kind(),
            message: info.message,
        }
    }
}

impl CapwireError {
    pub fn protocol(message: impl Into<String>) -> Self {
        CapwireError::Protocol {
            message: message.into(),
        }
    }

    pub fn fault(message: impl Into<String>) -> Self {
        CapwireError::Fault {
            message: message.into(),
        }
    }

    pub fn connection_closed(reason: impl Into<String>) -> Self {
        CapwireError::ConnectionClosed {
            reason: reason.into(),
        }
    }

    /// Classify this error onto the stable wire kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CapwireError::Protocol { .. } | CapwireError::Json { .. } => ErrorKind::ProtocolError,

            CapwireError::UnknownCapability { .. } | CapwireError::UnknownScope { .. } => {
                ErrorKind::UnknownCapability
            }

            CapwireError::Arity { .. } => ErrorKind::ArityError,

            CapwireError::ArgumentConversion { .. } => ErrorKind::ArgumentConversionError,

            CapwireError::Remote { kind, .. } => *kind,

            CapwireError::ConnectionClosed { .. } | CapwireError::Io { .. } => {
                ErrorKind::ConnectionClosed
            }

            CapwireError::Fault { .. } | CapwireError::Config { .. } => ErrorKind::RemoteFault,
        }
    }

    /// Build the wire failure body for this error.
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            // Relay the original message untouched rather than re-prefixing it.
            CapwireError::Remote { kind, message } => ErrorInfo::new(*kind, message.clone()),
            other => ErrorInfo::new(other.kind(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CapwireError::UnknownCapability {
            name: "doesNotExist".into(),
            kind: CapabilityKind::Method,
        };
        assert_eq!(err.to_string(), "Unknown method 'doesNotExist'");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            CapwireError::Arity {
                method: "add".into(),
                required: 2,
                declared: 2,
                provided: 1,
            }
            .kind(),
            ErrorKind::ArityError
        );
        assert_eq!(
            CapwireError::UnknownScope { scope: "x".into() }.kind(),
            ErrorKind::UnknownCapability
        );
        assert_eq!(CapwireError::fault("boom").kind(), ErrorKind::RemoteFault);
        assert_eq!(
            CapwireError::connection_closed("bye").kind(),
            ErrorKind::ConnectionClosed
        );
    }

    #[test]
    fn test_error_info_serializes_kind_by_name() {
        let info = CapwireError::fault("boom").to_error_info();
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json, serde_json::json!({"message": "boom", "kind": "RemoteFault"}));
    }

    #[test]
    fn test_unknown_kind_decodes_as_remote_fault() {
        let info = ErrorInfo {
            message: "?".into(),
            kind: "SomethingNew".into(),
        };
        assert_eq!(info.error_kind(), ErrorKind::RemoteFault);
    }

    #[test]
    fn test_remote_error_keeps_message() {
        let err: CapwireError = ErrorInfo::new(ErrorKind::ArityError, "too few").into();
        let info = err.to_error_info();
        assert_eq!(info.message, "too few");
        assert_eq!(info.error_kind(), ErrorKind::ArityError);
    }
}
