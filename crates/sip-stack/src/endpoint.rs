//! Endpoints: a started transport plus the observer it dispatches to

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use gbsip_sip_transport::{Transport, TransportEvent, TransportKind};

use crate::engine::{EngineHandle, EngineInner, ListeningPoint};
use crate::error::TransportError;
use crate::observer::{SipEvent, SipEventKind, SipObserver};
use crate::options::TraceLevel;

/// A listening endpoint bound to one transport kind and address/port
///
/// Owns its socket (through the transport) but neither the engine nor the
/// observer. Clones share the same endpoint.
#[derive(Clone)]
pub struct SipEndpoint {
    inner: Arc<EndpointInner>,
}

struct EndpointInner {
    point: ListeningPoint,
    local_addr: SocketAddr,
    transport: Arc<dyn Transport>,
    engine: Weak<EngineInner>,
    runtime: Handle,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    listener: OnceLock<Arc<dyn SipObserver>>,
    dialog_errors_auto: Arc<AtomicBool>,
    trace: MessageTrace,
    closed: AtomicBool,
}

// State the dispatch task needs; it must not keep the endpoint alive
struct Dispatcher {
    transport: TransportKind,
    local_addr: SocketAddr,
    dialog_errors_auto: Arc<AtomicBool>,
    trace: MessageTrace,
}

#[derive(Debug, Clone, Copy)]
struct MessageTrace {
    level: TraceLevel,
    log_content: bool,
}

impl SipEndpoint {
    pub(crate) fn new(
        engine: &EngineHandle,
        point: ListeningPoint,
        transport: Arc<dyn Transport>,
        events_rx: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        let settings = engine.settings();
        let local_addr = point.local_addr();
        Self {
            inner: Arc::new(EndpointInner {
                point,
                local_addr,
                transport,
                engine: engine.downgrade(),
                runtime: engine.runtime().clone(),
                events_rx: Mutex::new(Some(events_rx)),
                listener: OnceLock::new(),
                dialog_errors_auto: Arc::new(AtomicBool::new(false)),
                trace: MessageTrace {
                    level: settings.trace_level,
                    log_content: settings.log_message_content,
                },
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.inner.point.kind()
    }

    /// Address as it was requested
    pub fn address(&self) -> &str {
        self.inner.point.address()
    }

    pub fn port(&self) -> u16 {
        self.inner.point.port()
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn listening_point(&self) -> &ListeningPoint {
        &self.inner.point
    }

    /// The engine this endpoint belongs to, while it is alive
    pub fn engine(&self) -> Option<EngineHandle> {
        self.inner.engine.upgrade().map(EngineHandle::from_inner)
    }

    /// Lets the endpoint terminate dialogs on broken connections by itself
    pub fn set_dialog_errors_automatically_handled(&self) {
        self.inner.dialog_errors_auto.store(true, Ordering::SeqCst);
    }

    pub fn dialog_errors_automatically_handled(&self) -> bool {
        self.inner.dialog_errors_auto.load(Ordering::SeqCst)
    }

    /// Registers the observer and starts dispatching inbound events to it
    ///
    /// An endpoint takes exactly one observer; a second registration fails
    /// with [`TransportError::ResourceExhausted`].
    pub fn add_listener(&self, observer: Arc<dyn SipObserver>) -> Result<(), TransportError> {
        let exhausted = || {
            TransportError::resource_exhausted(self.transport_kind(), self.address(), self.port())
        };

        self.inner.listener.set(observer.clone()).map_err(|_| exhausted())?;
        let events_rx = self.inner.events_rx.lock().take().ok_or_else(exhausted)?;

        let dispatcher = Dispatcher {
            transport: self.transport_kind(),
            local_addr: self.local_addr(),
            dialog_errors_auto: self.inner.dialog_errors_auto.clone(),
            trace: self.inner.trace,
        };
        self.inner.runtime.spawn(dispatcher.run(events_rx, observer));

        debug!(
            "Listener registered on {} endpoint {}",
            self.transport_kind(),
            self.local_addr()
        );
        Ok(())
    }

    /// The registered observer, if any
    pub fn listener(&self) -> Option<&Arc<dyn SipObserver>> {
        self.inner.listener.get()
    }

    /// Sends raw message bytes through this endpoint's transport
    pub async fn send(&self, payload: Bytes, destination: SocketAddr) -> Result<(), TransportError> {
        self.inner.transport.send_bytes(payload, destination).await?;
        Ok(())
    }

    /// Stops the transport and releases the listening point
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.inner.transport.close().await {
            warn!("Error closing {} endpoint {}: {}", self.transport_kind(), self.local_addr(), e);
        }
        self.inner.point.release();
        info!("{} endpoint {} closed", self.transport_kind(), self.local_addr());
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn close_in_background(&self) {
        let endpoint = self.clone();
        self.inner.runtime.spawn(async move { endpoint.close().await });
    }
}

impl Dispatcher {
    async fn run(self, mut events_rx: mpsc::Receiver<TransportEvent>, observer: Arc<dyn SipObserver>) {
        while let Some(event) = events_rx.recv().await {
            let finished = matches!(event, TransportEvent::Closed);
            let kind = self.translate(event);

            observer.on_event(SipEvent {
                transport: self.transport,
                local_addr: self.local_addr,
                kind,
            });

            if finished {
                break;
            }
        }

        debug!("{} endpoint {} dispatch finished", self.transport, self.local_addr);
    }

    fn translate(&self, event: TransportEvent) -> SipEventKind {
        match event {
            TransportEvent::MessageReceived { payload, source, .. } => {
                self.trace_message(&payload, source);
                SipEventKind::Message { payload, source }
            }
            TransportEvent::ConnectionOpened { peer } => SipEventKind::ConnectionOpened { peer },
            TransportEvent::ConnectionClosed { peer, reason } => {
                SipEventKind::ConnectionClosed { peer, reason }
            }
            TransportEvent::ConnectionFailed { peer, error } => {
                if self.dialog_errors_auto.load(Ordering::SeqCst) {
                    debug!("Connection to {} failed, dialogs terminated automatically: {}", peer, error);
                    SipEventKind::DialogErrorHandled { peer, error }
                } else {
                    SipEventKind::IoError {
                        peer: Some(peer),
                        error,
                    }
                }
            }
            TransportEvent::Error { error } => SipEventKind::IoError { peer: None, error },
            TransportEvent::Closed => SipEventKind::EndpointClosed,
        }
    }

    fn trace_message(&self, payload: &Bytes, source: SocketAddr) {
        if self.trace.level < TraceLevel::Debug {
            return;
        }
        debug!(
            "{} message from {} ({} bytes) on {}",
            self.transport,
            source,
            payload.len(),
            self.local_addr
        );
        if self.trace.level == TraceLevel::Trace && self.trace.log_content {
            trace!("{}", String::from_utf8_lossy(payload));
        }
    }
}

impl Drop for EndpointInner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            let transport = self.transport.clone();
            self.runtime.spawn(async move {
                let _ = transport.close().await;
            });
        }
    }
}

impl fmt::Debug for SipEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SipEndpoint")
            .field("transport", &self.transport_kind())
            .field("local_addr", &self.local_addr())
            .field("dialog_errors_auto", &self.dialog_errors_automatically_handled())
            .field("listener", &self.inner.listener.get().is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}
