//! Common error types
//!
//! One taxonomy is shared by the port table, the stream buffer, the locked
//! buffers and the attach path. [`Error::code`] maps every variant onto the
//! negative error codes returned to callers of the control interface.

use protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Transport-establishment failures that are worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkFailure {
    /// Host name or service could not be resolved
    AddrInfo,
    /// No resolved address accepted the connection
    Connect,
    /// Generic network failure on an established socket
    Network,
}

impl std::fmt::Display for NetworkFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AddrInfo => "address resolution",
            Self::Connect => "connect",
            Self::Network => "network",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid port number, malformed record, null or empty buffer
    #[error("Invalid parameter: {0}")]
    Parameter(String),

    /// Page locking or allocation failure
    #[error("Insufficient resources: {0}")]
    Resource(String),

    /// Retryable transport failure during attach
    #[error("{kind} failure: {message}")]
    Network {
        kind: NetworkFailure,
        message: String,
    },

    /// Attach failure that will not succeed on retry
    #[error("Request failed: {0}")]
    Request(String),

    /// Not enough bytes buffered yet; wait for more network input
    #[error("Insufficient data buffered: requested {requested}, available {available}")]
    InsufficientData { requested: usize, available: usize },

    /// Every port is in use
    #[error("No free port")]
    PortFull,

    /// No device is attached to the port
    #[error("No device on port {port}")]
    NoDevice { port: i32 },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn network(kind: NetworkFailure, message: impl Into<String>) -> Self {
        Self::Network {
            kind,
            message: message.into(),
        }
    }

    /// Whether a failed attach should be tried again later
    ///
    /// Only transport-establishment failures qualify: address resolution
    /// can fail for a while after boot until name services come up.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network {
                kind: NetworkFailure::AddrInfo | NetworkFailure::Connect | NetworkFailure::Network,
                ..
            }
        )
    }

    /// Negative error code reported to callers
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Parameter(_) | Self::Protocol(_) => ErrorCode::InvArg,
            Self::Network { .. } => ErrorCode::Network,
            Self::PortFull => ErrorCode::PortFull,
            Self::NoDevice { .. } => ErrorCode::NotExist,
            Self::Resource(_)
            | Self::Request(_)
            | Self::InsufficientData { .. }
            | Self::Config(_)
            | Self::Io(_) => ErrorCode::General,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
