use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, trace};

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportConfig, TransportEvent, TransportKind, forward_event};

// Maximum UDP payload size
pub(crate) const MAX_UDP_PACKET_SIZE: usize = 65_507;
// Buffer size for receiving packets
const UDP_BUFFER_SIZE: usize = 65_535;

/// UDP transport for SIP messages
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<UdpTransportInner>,
}

struct UdpTransportInner {
    // Taken on close so the port is freed once the receive loop stops
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    // Fires once the receive loop has dropped its socket handle
    released_rx: Mutex<Option<oneshot::Receiver<()>>>,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl UdpTransport {
    /// Attaches an already bound socket to `runtime` and starts receiving
    pub fn start(
        socket: std::net::UdpSocket,
        config: TransportConfig,
        runtime: &Handle,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let _guard = runtime.enter();
        let socket = Arc::new(UdpSocket::from_std(socket)?);
        let local_addr = socket.local_addr()?;
        info!("SIP UDP transport bound to {}", local_addr);

        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity);
        let (shutdown_tx, _) = watch::channel(false);
        let (released_tx, released_rx) = oneshot::channel();

        let transport = UdpTransport {
            inner: Arc::new(UdpTransportInner {
                socket: Mutex::new(Some(socket.clone())),
                local_addr,
                closed: AtomicBool::new(false),
                shutdown_tx,
                released_rx: Mutex::new(Some(released_rx)),
                events_tx,
            }),
        };

        transport.spawn_receive_loop(socket, released_tx, runtime);

        Ok((transport, events_rx))
    }

    // Spawns a task to receive packets from the UDP socket
    fn spawn_receive_loop(
        &self,
        socket: Arc<UdpSocket>,
        released_tx: oneshot::Sender<()>,
        runtime: &Handle,
    ) {
        let inner = self.inner.clone();
        let mut shutdown = inner.shutdown_tx.subscribe();

        runtime.spawn(async move {
            let mut buffer = vec![0u8; UDP_BUFFER_SIZE];

            while !*shutdown.borrow() {
                let received = tokio::select! {
                    _ = shutdown.changed() => break,
                    received = socket.recv_from(&mut buffer) => received,
                };

                let (len, src) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        if inner.closed.load(Ordering::Relaxed) {
                            break;
                        }

                        error!("Error receiving UDP packet: {}", e);
                        let event = TransportEvent::Error {
                            error: format!("Error receiving packet: {}", e),
                        };
                        if !forward_event(&inner.events_tx, &mut shutdown, event).await {
                            break;
                        }
                        continue;
                    }
                };

                let packet = &buffer[..len];
                if is_keep_alive(packet) {
                    trace!("Dropping CRLF keep-alive from {}", src);
                    continue;
                }

                debug!("Received {} byte datagram from {}", len, src);
                let event = TransportEvent::MessageReceived {
                    payload: Bytes::copy_from_slice(packet),
                    source: src,
                    destination: inner.local_addr,
                };

                if !forward_event(&inner.events_tx, &mut shutdown, event).await {
                    break;
                }
            }

            drop(socket);
            let _ = released_tx.send(());
            let _ = inner.events_tx.send(TransportEvent::Closed).await;
            info!("UDP receive loop on {} terminated", inner.local_addr);
        });
    }
}

// Empty datagrams and those made only of CR/LF are keep-alive pings
fn is_keep_alive(packet: &[u8]) -> bool {
    packet.iter().all(|b| *b == b'\r' || *b == b'\n')
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr)
    }

    async fn send_bytes(&self, payload: Bytes, destination: SocketAddr) -> Result<()> {
        let socket = self.inner.socket.lock().clone();
        let Some(socket) = socket.filter(|_| !self.is_closed()) else {
            return Err(Error::TransportClosed);
        };

        if payload.len() > MAX_UDP_PACKET_SIZE {
            return Err(Error::PacketTooLarge(payload.len(), MAX_UDP_PACKET_SIZE));
        }

        socket
            .send_to(&payload, destination)
            .await
            .map_err(|e| Error::SendFailed(destination, e))?;

        trace!("Sent {} bytes to {}", payload.len(), destination);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Relaxed);
        self.inner.socket.lock().take();
        self.inner.shutdown_tx.send_replace(true);

        // The port is free once the loop has let go of the socket
        let released = self.inner.released_rx.lock().take();
        if let Some(released) = released {
            let _ = released.await;
            debug!("UDP socket {} released", self.inner.local_addr);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UdpTransport({})", self.inner.local_addr)
    }
}
