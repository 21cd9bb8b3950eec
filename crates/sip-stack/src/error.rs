//! Error types for the signaling stack
//!
//! Two families with different propagation rules:
//!
//! - [`ConfigurationError`] is fatal. The engine could not be built and
//!   process startup should abort.
//! - [`TransportError`] concerns one transport only. It is logged where it
//!   happens and handed back as a value so sibling transports keep going.

use thiserror::Error;

use gbsip_sip_transport::TransportKind;

/// Fatal errors while building the signaling engine
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// The listen address is empty
    #[error("Invalid listen address: {0:?}")]
    InvalidListenAddress(String),

    /// The engine has already been configured in this process
    #[error("Signaling engine is already configured")]
    AlreadyConfigured,

    /// The engine could not be instantiated from its properties
    #[error("Signaling engine unavailable: {message}")]
    EngineUnavailable { message: String },
}

impl ConfigurationError {
    /// Create an engine-unavailable error
    pub fn engine_unavailable(message: impl Into<String>) -> Self {
        Self::EngineUnavailable {
            message: message.into(),
        }
    }
}

/// Per-transport startup and send errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// The requested transport is not one the engine speaks
    #[error("Transport '{name}' is not supported")]
    UnsupportedTransport { name: String },

    /// Bad address, port 0, port in use or address not on a local interface
    #[error("Cannot bind {kind} to {address}:{port}: {reason}")]
    InvalidBindTarget {
        kind: TransportKind,
        address: String,
        port: u16,
        reason: String,
    },

    /// The endpoint already has its listener
    #[error("{kind} endpoint on {address}:{port} already has a registered listener")]
    ResourceExhausted {
        kind: TransportKind,
        address: String,
        port: u16,
    },

    /// The listening point is already claimed
    #[error("{kind} listening point {address}:{port} is already in use")]
    ResourceBusy {
        kind: TransportKind,
        address: String,
        port: u16,
    },

    /// The engine was shut down
    #[error("Signaling engine has been shut down")]
    EngineShutdown,

    /// Failure inside a running transport (send path, socket registration)
    #[error("Transport error: {0}")]
    Transport(#[from] gbsip_sip_transport::Error),
}

impl TransportError {
    /// Create an invalid bind target error
    pub fn invalid_bind_target(
        kind: TransportKind,
        address: impl Into<String>,
        port: u16,
        reason: impl ToString,
    ) -> Self {
        Self::InvalidBindTarget {
            kind,
            address: address.into(),
            port,
            reason: reason.to_string(),
        }
    }

    /// Create a resource busy error
    pub fn resource_busy(kind: TransportKind, address: impl Into<String>, port: u16) -> Self {
        Self::ResourceBusy {
            kind,
            address: address.into(),
            port,
        }
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(kind: TransportKind, address: impl Into<String>, port: u16) -> Self {
        Self::ResourceExhausted {
            kind,
            address: address.into(),
            port,
        }
    }

    /// Transport kind the error refers to, when known
    pub fn kind(&self) -> Option<TransportKind> {
        match self {
            Self::InvalidBindTarget { kind, .. }
            | Self::ResourceExhausted { kind, .. }
            | Self::ResourceBusy { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
