//! Inbound signaling events and the observer they are delivered to

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::mpsc;

use gbsip_sip_transport::{CloseReason, TransportKind};

/// An inbound event from one endpoint
#[derive(Debug, Clone)]
pub struct SipEvent {
    /// Transport the event arrived on
    pub transport: TransportKind,
    /// Local address of the endpoint
    pub local_addr: SocketAddr,
    /// What happened
    pub kind: SipEventKind,
}

/// Kinds of events delivered to the observer
#[derive(Debug, Clone)]
pub enum SipEventKind {
    /// A complete, unparsed signaling message
    Message {
        payload: Bytes,
        source: SocketAddr,
    },

    /// A peer opened a stream connection
    ConnectionOpened {
        peer: SocketAddr,
    },

    /// A stream connection ended normally
    ConnectionClosed {
        peer: SocketAddr,
        reason: CloseReason,
    },

    /// A broken connection was torn down by the endpoint and its dialogs
    /// terminated without involving the observer
    DialogErrorHandled {
        peer: SocketAddr,
        error: String,
    },

    /// I/O failure left for the observer to handle
    IoError {
        peer: Option<SocketAddr>,
        error: String,
    },

    /// The endpoint stopped receiving
    EndpointClosed,
}

impl SipEvent {
    /// Payload of a message event
    pub fn payload(&self) -> Option<&Bytes> {
        match &self.kind {
            SipEventKind::Message { payload, .. } => Some(payload),
            _ => None,
        }
    }
}

/// Receives every inbound event from every active endpoint
///
/// The same observer is shared by the TCP and UDP endpoints and is called
/// from their dispatch tasks concurrently. Implementations must return
/// quickly; heavy work belongs on a queue of the observer's own.
pub trait SipObserver: Send + Sync {
    fn on_event(&self, event: SipEvent);
}

impl<F> SipObserver for F
where
    F: Fn(SipEvent) + Send + Sync,
{
    fn on_event(&self, event: SipEvent) {
        self(event)
    }
}

/// Observer forwarding events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    events_tx: mpsc::UnboundedSender<SipEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SipEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (Self { events_tx }, events_rx)
    }
}

impl SipObserver for ChannelObserver {
    fn on_event(&self, event: SipEvent) {
        // Receiver gone means the application is shutting down
        let _ = self.events_tx.send(event);
    }
}
