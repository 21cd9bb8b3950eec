pub mod tcp;
pub mod udp;

use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::{Error, Result};

// Default channel capacity
const DEFAULT_CHANNEL_CAPACITY: usize = 100;
// Pending connection backlog for stream listeners
const TCP_LISTEN_BACKLOG: i32 = 1024;

/// Transport kinds a listening point can be bound for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportKind {
    /// Connection-oriented (TCP)
    Stream,
    /// Connectionless (UDP)
    Datagram,
}

impl TransportKind {
    /// Every supported kind, in bootstrap order
    pub const ALL: [TransportKind; 2] = [TransportKind::Stream, TransportKind::Datagram];

    /// Protocol token as it appears in a Via header
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stream => "TCP",
            TransportKind::Datagram => "UDP",
        }
    }

    /// Whether the transport delivers bytes reliably and in order
    pub fn is_reliable(&self) -> bool {
        matches!(self, TransportKind::Stream)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" | "stream" => Ok(TransportKind::Stream),
            "udp" | "datagram" => Ok(TransportKind::Datagram),
            _ => Err(Error::UnsupportedTransport(s.to_string())),
        }
    }
}

/// Why a stream connection went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the connection
    Remote,
    /// No traffic within the keep-alive timeout
    IdleTimeout,
    /// The local transport was closed
    Local,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Remote => f.write_str("closed by peer"),
            CloseReason::IdleTimeout => f.write_str("keep-alive timeout"),
            CloseReason::Local => f.write_str("closed locally"),
        }
    }
}

/// Events emitted by a running transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A complete message was received
    MessageReceived {
        /// Raw message bytes
        payload: Bytes,
        /// Peer that sent the message
        source: SocketAddr,
        /// Local address the message arrived on
        destination: SocketAddr,
    },

    /// A stream connection was established (inbound or outbound)
    ConnectionOpened {
        peer: SocketAddr,
    },

    /// A stream connection ended without error
    ConnectionClosed {
        peer: SocketAddr,
        reason: CloseReason,
    },

    /// A stream connection broke (I/O or framing error)
    ConnectionFailed {
        peer: SocketAddr,
        error: String,
    },

    /// An error not tied to a single connection
    Error {
        error: String,
    },

    /// The transport has stopped receiving
    Closed,
}

/// Runtime settings for a started transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Capacity of the event channel
    pub channel_capacity: usize,
    /// Idle limit for stream connections; `None` disables it
    pub keep_alive_timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            keep_alive_timeout: None,
        }
    }
}

impl TransportConfig {
    /// Sets the keep-alive timeout in seconds, 0 meaning disabled
    pub fn with_keep_alive_secs(mut self, secs: u64) -> Self {
        self.keep_alive_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        self
    }
}

/// Common interface of the UDP and TCP transports
#[async_trait::async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Kind of this transport
    fn kind(&self) -> TransportKind;

    /// Local address the transport is bound to
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Sends raw message bytes to `destination`
    async fn send_bytes(&self, payload: Bytes, destination: SocketAddr) -> Result<()>;

    /// Stops receiving and releases the socket
    async fn close(&self) -> Result<()>;

    /// Whether `close` has been called
    fn is_closed(&self) -> bool;
}

// Hands an event to the consumer unless the transport is shutting down.
// Returns false when the loop should stop.
pub(crate) async fn forward_event(
    events_tx: &mpsc::Sender<TransportEvent>,
    shutdown: &mut watch::Receiver<bool>,
    event: TransportEvent,
) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = shutdown.changed() => false,
        sent = events_tx.send(event) => sent.is_ok(),
    }
}

/// Resolves a bind host (IP literal or host name) and port to a socket address
pub fn resolve_bind_addr(address: &str, port: u16) -> Result<SocketAddr> {
    let host = address.trim();
    if host.is_empty() {
        return Err(Error::InvalidAddress(address.to_string(), "empty address".into()));
    }
    if port == 0 {
        return Err(Error::InvalidAddress(
            address.to_string(),
            "port must be in 1..=65535".into(),
        ));
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::InvalidAddress(address.to_string(), e.to_string()))?
        .next()
        .ok_or_else(|| Error::InvalidAddress(address.to_string(), "no address resolved".into()))
}

/// A socket bound for one transport kind, not yet attached to a runtime
#[derive(Debug)]
pub enum BoundSocket {
    Stream(std::net::TcpListener),
    Datagram(std::net::UdpSocket),
}

impl BoundSocket {
    /// Binds a socket of the given kind. Blocking and runtime-independent.
    pub fn bind(kind: TransportKind, addr: SocketAddr) -> Result<Self> {
        let domain = Domain::for_address(addr);
        match kind {
            TransportKind::Stream => {
                let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
                // Allows quick restarts; an active listener still yields AddrInUse
                socket.set_reuse_address(true)?;
                socket.bind(&addr.into()).map_err(|e| Error::BindFailed(addr, e))?;
                socket.listen(TCP_LISTEN_BACKLOG).map_err(|e| Error::BindFailed(addr, e))?;
                socket.set_nonblocking(true)?;
                debug!("Bound TCP listener on {}", addr);
                Ok(BoundSocket::Stream(socket.into()))
            }
            TransportKind::Datagram => {
                let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
                socket.bind(&addr.into()).map_err(|e| Error::BindFailed(addr, e))?;
                socket.set_nonblocking(true)?;
                debug!("Bound UDP socket on {}", addr);
                Ok(BoundSocket::Datagram(socket.into()))
            }
        }
    }

    /// Kind of the bound socket
    pub fn kind(&self) -> TransportKind {
        match self {
            BoundSocket::Stream(_) => TransportKind::Stream,
            BoundSocket::Datagram(_) => TransportKind::Datagram,
        }
    }

    /// Address the socket actually bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addr = match self {
            BoundSocket::Stream(listener) => listener.local_addr()?,
            BoundSocket::Datagram(socket) => socket.local_addr()?,
        };
        Ok(addr)
    }

    /// Registers the socket with `runtime` and starts its receive loop
    pub fn start(
        self,
        config: TransportConfig,
        runtime: &Handle,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>)> {
        match self {
            BoundSocket::Stream(listener) => {
                let (transport, events_rx) = tcp::TcpTransport::start(listener, config, runtime)?;
                Ok((Arc::new(transport), events_rx))
            }
            BoundSocket::Datagram(socket) => {
                let (transport, events_rx) = udp::UdpTransport::start(socket, config, runtime)?;
                Ok((Arc::new(transport), events_rx))
            }
        }
    }
}
