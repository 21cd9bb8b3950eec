mod framing;

pub use framing::{MAX_BODY_SIZE, MAX_HEADER_SIZE, StreamFramer};

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::transport::{
    CloseReason, Transport, TransportConfig, TransportEvent, TransportKind, forward_event,
};

const READ_CHUNK_SIZE: usize = 4096;

/// TCP transport for SIP messages
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<TcpTransportInner>,
}

struct TcpTransportInner {
    local_addr: SocketAddr,
    connections: DashMap<SocketAddr, Arc<Mutex<OwnedWriteHalf>>>,
    keep_alive_timeout: Option<Duration>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    // Fires once the accept loop has dropped the listener
    released_rx: Mutex<Option<oneshot::Receiver<()>>>,
    events_tx: mpsc::Sender<TransportEvent>,
    runtime: Handle,
}

enum ReadOutcome {
    Data,
    Eof,
    Idle,
    Failed(std::io::Error),
}

impl TcpTransport {
    /// Attaches an already listening socket to `runtime` and starts accepting
    pub fn start(
        listener: std::net::TcpListener,
        config: TransportConfig,
        runtime: &Handle,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let _guard = runtime.enter();
        let listener = TcpListener::from_std(listener)?;
        let local_addr = listener.local_addr()?;
        info!("SIP TCP transport bound to {}", local_addr);

        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity);
        let (shutdown_tx, _) = watch::channel(false);
        let (released_tx, released_rx) = oneshot::channel();

        let transport = TcpTransport {
            inner: Arc::new(TcpTransportInner {
                local_addr,
                connections: DashMap::new(),
                keep_alive_timeout: config.keep_alive_timeout,
                closed: AtomicBool::new(false),
                shutdown_tx,
                released_rx: Mutex::new(Some(released_rx)),
                events_tx,
                runtime: runtime.clone(),
            }),
        };

        transport.spawn_accept_loop(listener, released_tx);

        Ok((transport, events_rx))
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    fn spawn_accept_loop(&self, listener: TcpListener, released_tx: oneshot::Sender<()>) {
        let inner = self.inner.clone();
        let mut shutdown = inner.shutdown_tx.subscribe();

        self.inner.runtime.spawn(async move {
            while !*shutdown.borrow() {
                let accepted = tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted TCP connection from {}", peer);
                        TcpTransportInner::register(&inner, stream, peer).await;
                    }
                    Err(e) => {
                        if inner.closed.load(Ordering::Relaxed) {
                            break;
                        }
                        error!("Error accepting TCP connection: {}", e);
                        let event = TransportEvent::Error {
                            error: format!("Error accepting connection: {}", e),
                        };
                        if !forward_event(&inner.events_tx, &mut shutdown, event).await {
                            break;
                        }
                    }
                }
            }

            drop(listener);
            let _ = released_tx.send(());
            let _ = inner.events_tx.send(TransportEvent::Closed).await;
            info!("TCP accept loop on {} terminated", inner.local_addr);
        });
    }

    async fn connect(&self, destination: SocketAddr) -> Result<Arc<Mutex<OwnedWriteHalf>>> {
        let stream = TcpStream::connect(destination)
            .await
            .map_err(|e| Error::ConnectFailed(destination, e))?;
        debug!("Opened TCP connection to {}", destination);
        Ok(TcpTransportInner::register(&self.inner, stream, destination).await)
    }
}

impl TcpTransportInner {
    // Stores the write half and spawns the reader for a new connection
    async fn register(
        inner: &Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Arc<Mutex<OwnedWriteHalf>> {
        let (reader, writer) = stream.into_split();
        let writer = Arc::new(Mutex::new(writer));
        inner.connections.insert(peer, writer.clone());

        let mut shutdown = inner.shutdown_tx.subscribe();
        forward_event(&inner.events_tx, &mut shutdown, TransportEvent::ConnectionOpened { peer }).await;

        let reader_inner = inner.clone();
        inner.runtime.spawn(async move {
            reader_inner.read_connection(reader, peer).await;
        });

        writer
    }

    async fn read_connection(self: Arc<Self>, mut reader: OwnedReadHalf, peer: SocketAddr) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut framer = StreamFramer::new();

        let final_event = loop {
            if *shutdown.borrow() {
                break TransportEvent::ConnectionClosed { peer, reason: CloseReason::Local };
            }

            let outcome = tokio::select! {
                _ = shutdown.changed() => {
                    break TransportEvent::ConnectionClosed { peer, reason: CloseReason::Local };
                }
                outcome = read_chunk(&mut reader, &mut framer, self.keep_alive_timeout) => outcome,
            };

            match outcome {
                ReadOutcome::Data => {}
                ReadOutcome::Eof => {
                    break TransportEvent::ConnectionClosed { peer, reason: CloseReason::Remote };
                }
                ReadOutcome::Idle => {
                    debug!("TCP connection {} idle past keep-alive timeout", peer);
                    break TransportEvent::ConnectionClosed {
                        peer,
                        reason: CloseReason::IdleTimeout,
                    };
                }
                ReadOutcome::Failed(e) => {
                    warn!("TCP connection {} failed: {}", peer, e);
                    break TransportEvent::ConnectionFailed { peer, error: e.to_string() };
                }
            }

            match self.drain_messages(&mut framer, peer, &mut shutdown).await {
                Ok(true) => {}
                Ok(false) => {
                    break TransportEvent::ConnectionClosed { peer, reason: CloseReason::Local };
                }
                Err(e) => {
                    warn!("Dropping TCP connection {}: {}", peer, e);
                    break TransportEvent::ConnectionFailed { peer, error: e.to_string() };
                }
            }
        };

        self.connections.remove(&peer);
        drop(reader);
        let _ = self.events_tx.send(final_event).await;
    }

    // Forwards every complete message; Ok(false) on shutdown or once nobody
    // listens anymore
    async fn drain_messages(
        &self,
        framer: &mut StreamFramer,
        peer: SocketAddr,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool> {
        while let Some(payload) = framer.next_message()? {
            trace!("Framed {} byte message from {}", payload.len(), peer);
            let event = TransportEvent::MessageReceived {
                payload,
                source: peer,
                destination: self.local_addr,
            };
            if !forward_event(&self.events_tx, shutdown, event).await {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

async fn read_chunk(
    reader: &mut OwnedReadHalf,
    framer: &mut StreamFramer,
    keep_alive_timeout: Option<Duration>,
) -> ReadOutcome {
    let buffer = framer.buffer_mut();
    buffer.reserve(READ_CHUNK_SIZE);

    let result = match keep_alive_timeout {
        Some(limit) => match tokio::time::timeout(limit, reader.read_buf(buffer)).await {
            Ok(result) => result,
            Err(_) => return ReadOutcome::Idle,
        },
        None => reader.read_buf(buffer).await,
    };

    match result {
        Ok(0) => ReadOutcome::Eof,
        Ok(_) => ReadOutcome::Data,
        Err(e) => ReadOutcome::Failed(e),
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr)
    }

    async fn send_bytes(&self, payload: Bytes, destination: SocketAddr) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }

        let existing = self.inner.connections.get(&destination).map(|c| c.value().clone());
        let writer = match existing {
            Some(writer) => writer,
            None => self.connect(destination).await?,
        };

        let mut writer = writer.lock().await;
        writer
            .write_all(&payload)
            .await
            .map_err(|e| Error::SendFailed(destination, e))?;

        trace!("Sent {} bytes to {}", payload.len(), destination);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Relaxed);
        self.inner.shutdown_tx.send_replace(true);
        self.inner.connections.clear();

        // The port is free once the accept loop has let go of the listener
        let released = self.inner.released_rx.lock().await.take();
        if let Some(released) = released {
            let _ = released.await;
            debug!("TCP listener {} released", self.inner.local_addr);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TcpTransport({}, {} connections)",
            self.inner.local_addr,
            self.inner.connections.len()
        )
    }
}
