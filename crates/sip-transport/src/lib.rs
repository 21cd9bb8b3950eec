//! SIP transport layer for the gbsip signaling stack
//!
//! This crate provides the UDP (datagram) and TCP (stream) listening points
//! the signaling engine binds to. Sockets are bound synchronously so that a
//! bind failure is reported at the call site, and are only handed to the
//! async runtime once the caller decides to start dispatching.

pub mod error;
pub mod transport;

// Internal modules
#[cfg(test)]
mod tests;

// Re-export commonly used types and functions
pub use error::{Error, Result};
pub use transport::{
    BoundSocket, CloseReason, Transport, TransportConfig, TransportEvent, TransportKind,
    resolve_bind_addr,
};
pub use transport::tcp::{StreamFramer, TcpTransport};
pub use transport::udp::UdpTransport;

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        BoundSocket, CloseReason, Error, Result, TcpTransport, Transport, TransportConfig,
        TransportEvent, TransportKind, UdpTransport,
    };
}
