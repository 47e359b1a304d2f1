//! Error types for the driver protocol.
//!
//! Every error carries a stable wire `kind` so that a failure raised inside a
//! remote backend can be reconstructed on the orchestrator side.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by a dialect driver or by the transport reaching it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// A stateful call was issued before `Init` (or after `Close`).
    #[error("Driver not initialized: {0}")]
    NotInitialized(String),

    /// The backend could not reach the target database instance.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The SQL text could not be parsed by the backend.
    #[error("Parse error: {0}")]
    Parse(String),

    /// A statement failed while executing on the target database.
    #[error("Execution error: {0}")]
    Execution(String),

    /// The backend does not implement the requested call.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Malformed request or reply (wrong arity, unknown tag, bad JSON).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote backend could not be reached.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type alias using DriverError.
pub type DriverResult<T> = Result<T, DriverError>;

/// Error body exchanged on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: String,
    pub error: String,
}

impl DriverError {
    /// Stable wire code for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            DriverError::NotInitialized(_) => "not_initialized",
            DriverError::Connection(_) => "connection",
            DriverError::Parse(_) => "parse",
            DriverError::Execution(_) => "execution",
            DriverError::Unsupported(_) => "unsupported",
            DriverError::Protocol(_) => "protocol",
            DriverError::Transport(_) => "transport",
        }
    }

    /// The bare message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            DriverError::NotInitialized(m)
            | DriverError::Connection(m)
            | DriverError::Parse(m)
            | DriverError::Execution(m)
            | DriverError::Unsupported(m)
            | DriverError::Protocol(m)
            | DriverError::Transport(m) => m,
        }
    }

    pub fn to_wire(&self) -> WireError {
        WireError {
            kind: self.kind().to_string(),
            error: self.message().to_string(),
        }
    }
}

impl From<WireError> for DriverError {
    fn from(wire: WireError) -> Self {
        match wire.kind.as_str() {
            "not_initialized" => DriverError::NotInitialized(wire.error),
            "connection" => DriverError::Connection(wire.error),
            "parse" => DriverError::Parse(wire.error),
            "execution" => DriverError::Execution(wire.error),
            "unsupported" => DriverError::Unsupported(wire.error),
            "transport" => DriverError::Transport(wire.error),
            _ => DriverError::Protocol(wire.error),
        }
    }
}

impl From<reqwest::Error> for DriverError {
    fn from(e: reqwest::Error) -> Self {
        DriverError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(e: serde_json::Error) -> Self {
        DriverError::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DriverError::Execution("duplicate key".to_string());
        assert_eq!(err.to_string(), "Execution error: duplicate key");
    }

    #[test]
    fn test_wire_roundtrip_keeps_kind() {
        let err = DriverError::NotInitialized("call init first".to_string());
        let back = DriverError::from(err.to_wire());
        assert_eq!(back, err);
    }

    #[test]
    fn test_unknown_wire_kind_is_protocol() {
        let wire = WireError {
            kind: "exploded".to_string(),
            error: "boom".to_string(),
        };
        assert!(matches!(DriverError::from(wire), DriverError::Protocol(_)));
    }
}
