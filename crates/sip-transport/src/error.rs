use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the transport layer
#[derive(Error, Debug)]
pub enum Error {
    /// The requested transport name is not one of the supported kinds
    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// The bind address could not be turned into a socket address
    #[error("Invalid bind address '{0}': {1}")]
    InvalidAddress(String, String),

    /// Binding the socket failed
    #[error("Failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, #[source] io::Error),

    /// Opening an outbound stream connection failed
    #[error("Failed to connect to {0}: {1}")]
    ConnectFailed(SocketAddr, #[source] io::Error),

    /// Sending failed
    #[error("Failed to send to {0}: {1}")]
    SendFailed(SocketAddr, #[source] io::Error),

    /// Datagram payload exceeds the UDP limit
    #[error("Packet too large: {0} bytes (max {1})")]
    PacketTooLarge(usize, usize),

    /// The transport has been closed
    #[error("Transport is closed")]
    TransportClosed,

    /// The byte stream could not be split into messages
    #[error("Stream framing error: {0}")]
    Framing(String),

    /// Any other I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// The I/O error kind behind a bind failure, if any
    pub fn bind_error_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Error::BindFailed(_, e) => Some(e.kind()),
            _ => None,
        }
    }

    /// True when the bind failed because the address/port is already taken
    pub fn is_addr_in_use(&self) -> bool {
        self.bind_error_kind() == Some(io::ErrorKind::AddrInUse)
    }

    pub(crate) fn framing(message: impl Into<String>) -> Self {
        Error::Framing(message.into())
    }
}
