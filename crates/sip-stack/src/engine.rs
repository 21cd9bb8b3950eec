//! The signaling engine instance and its listening points

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use gbsip_sip_transport::{BoundSocket, TransportConfig, TransportKind, resolve_bind_addr};

use crate::endpoint::SipEndpoint;
use crate::error::{ConfigurationError, TransportError};
use crate::options::{ReleaseReferencesStrategy, TraceLevel};
use crate::properties::{self, EngineProperties};

static NEXT_LISTENING_POINT_ID: AtomicU64 = AtomicU64::new(1);

/// Typed view of the properties an engine was built from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub stack_name: String,
    pub ip_address: String,
    pub log_message_content: bool,
    pub deliver_unsolicited_notify: bool,
    pub automatic_dialog_error_handling: bool,
    pub cancel_client_transaction_checked: bool,
    pub deliver_terminated_event_for_null_dialog: bool,
    pub release_references_strategy: ReleaseReferencesStrategy,
    pub keep_alive_timeout_secs: u64,
    pub trace_level: TraceLevel,
}

impl EngineSettings {
    /// Parses the entries; unknown keys are ignored, malformed values rejected
    pub fn from_properties(props: &EngineProperties) -> Result<Self, ConfigurationError> {
        Ok(Self {
            stack_name: required(props, properties::STACK_NAME)?,
            ip_address: required(props, properties::IP_ADDRESS)?,
            log_message_content: flag(props, properties::LOG_MESSAGE_CONTENT, true)?,
            deliver_unsolicited_notify: flag(props, properties::DELIVER_UNSOLICITED_NOTIFY, false)?,
            automatic_dialog_error_handling: flag(
                props,
                properties::AUTOMATIC_DIALOG_ERROR_HANDLING,
                true,
            )?,
            cancel_client_transaction_checked: flag(
                props,
                properties::CANCEL_CLIENT_TRANSACTION_CHECKED,
                true,
            )?,
            deliver_terminated_event_for_null_dialog: flag(
                props,
                properties::DELIVER_TERMINATED_EVENT_FOR_NULL_DIALOG,
                false,
            )?,
            release_references_strategy: match props.get(properties::RELEASE_REFERENCES_STRATEGY) {
                Some(value) => value.parse()?,
                None => ReleaseReferencesStrategy::default(),
            },
            keep_alive_timeout_secs: match props.get(properties::RELIABLE_CONNECTION_KEEP_ALIVE_TIMEOUT) {
                Some(value) => value.trim().parse().map_err(|_| {
                    ConfigurationError::engine_unavailable(format!(
                        "{} must be a non-negative number of seconds, got '{}'",
                        properties::RELIABLE_CONNECTION_KEEP_ALIVE_TIMEOUT,
                        value
                    ))
                })?,
                None => 0,
            },
            trace_level: match props.get(properties::TRACE_LEVEL) {
                Some(value) => value.parse()?,
                None => TraceLevel::default(),
            },
        })
    }
}

fn required(props: &EngineProperties, key: &str) -> Result<String, ConfigurationError> {
    match props.get(key).map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(ConfigurationError::engine_unavailable(format!(
            "missing required property {}",
            key
        ))),
    }
}

fn flag(props: &EngineProperties, key: &str, default: bool) -> Result<bool, ConfigurationError> {
    match props.get(key).map(str::trim) {
        None => Ok(default),
        Some(value) if value.eq_ignore_ascii_case("true") => Ok(true),
        Some(value) if value.eq_ignore_ascii_case("false") => Ok(false),
        Some(value) => Err(ConfigurationError::engine_unavailable(format!(
            "{} must be true or false, got '{}'",
            key, value
        ))),
    }
}

type ListeningPointKey = (TransportKind, SocketAddr);

/// Handle to the running signaling engine
///
/// Cloning shares the same engine. Endpoints only keep a weak reference, so
/// the process (through [`StackConfigurator`](crate::StackConfigurator))
/// remains the owner.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    settings: EngineSettings,
    runtime: Handle,
    listening_points: DashMap<ListeningPointKey, u64>,
    shut_down: AtomicBool,
}

impl EngineInner {
    // Only drops the claim if it still belongs to the given point
    pub(crate) fn release(&self, key: ListeningPointKey, id: u64) {
        if self.listening_points.remove_if(&key, |_, owner| *owner == id).is_some() {
            debug!("Released {} listening point {}", key.0, key.1);
        }
    }
}

impl EngineHandle {
    /// Builds an engine on the current tokio runtime
    pub fn from_properties(props: &EngineProperties) -> Result<Self, ConfigurationError> {
        let runtime = Handle::try_current().map_err(|e| {
            ConfigurationError::engine_unavailable(format!("no async runtime available: {}", e))
        })?;
        Self::with_runtime(props, runtime)
    }

    /// Builds an engine whose event sources run on `runtime`
    pub fn with_runtime(props: &EngineProperties, runtime: Handle) -> Result<Self, ConfigurationError> {
        let settings = EngineSettings::from_properties(props)?;
        info!(
            "Signaling engine {} created for {} (trace level {})",
            settings.stack_name, settings.ip_address, settings.trace_level
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                settings,
                runtime,
                listening_points: DashMap::new(),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn stack_name(&self) -> &str {
        &self.inner.settings.stack_name
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    pub(crate) fn downgrade(&self) -> Weak<EngineInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<EngineInner>) -> Self {
        Self { inner }
    }

    /// Whether both handles refer to the same engine
    pub fn ptr_eq(&self, other: &EngineHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of listening points currently claimed
    pub fn listening_point_count(&self) -> usize {
        self.inner.listening_points.len()
    }

    fn ensure_running(&self) -> Result<(), TransportError> {
        if self.is_shut_down() {
            return Err(TransportError::EngineShutdown);
        }
        Ok(())
    }

    /// Binds a listening point for `kind` on `address:port`
    ///
    /// The socket is bound immediately so that an occupied port surfaces
    /// here, before any endpoint exists.
    pub fn create_listening_point(
        &self,
        address: &str,
        port: u16,
        kind: TransportKind,
    ) -> Result<ListeningPoint, TransportError> {
        self.ensure_running()?;

        let addr = resolve_bind_addr(address, port)
            .map_err(|e| TransportError::invalid_bind_target(kind, address, port, e))?;

        let id = NEXT_LISTENING_POINT_ID.fetch_add(1, Ordering::Relaxed);
        let (socket, local_addr) = match self.inner.listening_points.entry((kind, addr)) {
            Entry::Occupied(_) => return Err(TransportError::resource_busy(kind, address, port)),
            Entry::Vacant(slot) => {
                let socket = BoundSocket::bind(kind, addr)
                    .map_err(|e| TransportError::invalid_bind_target(kind, address, port, e))?;
                let local_addr = socket.local_addr()?;
                slot.insert(id);
                (socket, local_addr)
            }
        };
        debug!("Created {} listening point {} ({}:{})", kind, local_addr, address, port);

        Ok(ListeningPoint {
            inner: Arc::new(ListeningPointInner {
                id,
                kind,
                address: address.trim().to_string(),
                port,
                key: (kind, addr),
                local_addr,
                socket: Mutex::new(Some(socket)),
                engine: self.downgrade(),
            }),
        })
    }

    /// Wraps a listening point into an endpoint and starts its transport
    pub fn create_endpoint(&self, point: &ListeningPoint) -> Result<SipEndpoint, TransportError> {
        self.ensure_running()?;

        if !Weak::ptr_eq(&point.inner.engine, &self.downgrade()) {
            return Err(TransportError::invalid_bind_target(
                point.kind(),
                point.address(),
                point.port(),
                "listening point belongs to another engine",
            ));
        }

        let socket = point
            .inner
            .socket
            .lock()
            .take()
            .ok_or_else(|| TransportError::resource_busy(point.kind(), point.address(), point.port()))?;

        let config =
            TransportConfig::default().with_keep_alive_secs(self.inner.settings.keep_alive_timeout_secs);
        let (transport, events_rx) = socket.start(config, &self.inner.runtime)?;

        Ok(SipEndpoint::new(self, point.clone(), transport, events_rx))
    }

    /// Refuses new listening points; close endpoints before calling this
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let remaining = self.listening_point_count();
        if remaining > 0 {
            warn!(
                "Signaling engine {} shut down with {} listening point(s) still claimed",
                self.stack_name(),
                remaining
            );
        } else {
            info!("Signaling engine {} shut down", self.stack_name());
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("stack_name", &self.inner.settings.stack_name)
            .field("ip_address", &self.inner.settings.ip_address)
            .field("listening_points", &self.inner.listening_points.len())
            .finish()
    }
}

/// An engine resource listening for one transport kind on one address/port
#[derive(Clone)]
pub struct ListeningPoint {
    inner: Arc<ListeningPointInner>,
}

struct ListeningPointInner {
    id: u64,
    kind: TransportKind,
    address: String,
    port: u16,
    key: ListeningPointKey,
    local_addr: SocketAddr,
    socket: Mutex<Option<BoundSocket>>,
    engine: Weak<EngineInner>,
}

impl ListeningPoint {
    pub fn kind(&self) -> TransportKind {
        self.inner.kind
    }

    /// Address as it was requested
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Whether an endpoint has already taken this point
    pub fn is_claimed(&self) -> bool {
        self.inner.socket.lock().is_none()
    }

    pub(crate) fn release(&self) {
        if let Some(engine) = self.inner.engine.upgrade() {
            engine.release(self.inner.key, self.inner.id);
        }
    }
}

impl Drop for ListeningPointInner {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.release(self.key, self.id);
        }
    }
}

impl fmt::Debug for ListeningPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListeningPoint({} {})", self.inner.kind, self.inner.local_addr)
    }
}
