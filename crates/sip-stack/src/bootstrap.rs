//! Transport bootstrap: one endpoint per transport kind, failing independently
//!
//! Every transport is started through [`TransportBootstrapper::start_transport`],
//! which logs its own outcome and returns a `Result`. Callers collect the
//! results; nothing here unwinds past a sibling transport.

use std::sync::Arc;

use tracing::{error, info};

use gbsip_sip_transport::TransportKind;

use crate::configurator::StackConfigurator;
use crate::endpoint::SipEndpoint;
use crate::engine::EngineHandle;
use crate::error::{ConfigurationError, TransportError};
use crate::observer::SipObserver;
use crate::options::EngineOptions;

/// Per-transport endpoint behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportPolicy {
    /// Endpoint terminates dialogs on broken connections by itself
    pub auto_dialog_error_handling: bool,
}

// Reliable transports can safely tear down broken dialogs; datagram ones cannot
const TRANSPORT_POLICIES: [(TransportKind, TransportPolicy); 2] = [
    (
        TransportKind::Stream,
        TransportPolicy {
            auto_dialog_error_handling: true,
        },
    ),
    (
        TransportKind::Datagram,
        TransportPolicy {
            auto_dialog_error_handling: false,
        },
    ),
];

/// Looks up the endpoint policy for `kind`
pub fn transport_policy(kind: TransportKind) -> TransportPolicy {
    TRANSPORT_POLICIES
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, policy)| *policy)
        .unwrap_or_default()
}

/// A transport that did not start
#[derive(Debug)]
pub struct TransportStartFailure {
    /// Requested transport name
    pub transport: String,
    pub error: TransportError,
}

/// Endpoints that started, plus the transports that did not
#[derive(Debug, Default)]
pub struct RunningTransports {
    endpoints: Vec<SipEndpoint>,
    failures: Vec<TransportStartFailure>,
}

impl RunningTransports {
    pub fn endpoints(&self) -> &[SipEndpoint] {
        &self.endpoints
    }

    /// The endpoint for `kind`, if that transport started
    pub fn endpoint(&self, kind: TransportKind) -> Option<&SipEndpoint> {
        self.endpoints.iter().find(|e| e.transport_kind() == kind)
    }

    pub fn failures(&self) -> &[TransportStartFailure] {
        &self.failures
    }

    /// No transport is serving
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Serving, but at least one transport failed
    pub fn is_degraded(&self) -> bool {
        !self.endpoints.is_empty() && !self.failures.is_empty()
    }

    fn record(&mut self, transport: &str, result: Result<SipEndpoint, TransportError>) {
        match result {
            Ok(endpoint) => self.endpoints.push(endpoint),
            Err(error) => self.failures.push(TransportStartFailure {
                transport: transport.to_string(),
                error,
            }),
        }
    }

    /// Closes every endpoint
    pub async fn close_all(&self) {
        for endpoint in &self.endpoints {
            endpoint.close().await;
        }
    }

    /// Closes every endpoint, then shuts `engine` down
    pub async fn shutdown(self, engine: &EngineHandle) {
        self.close_all().await;
        engine.shutdown();
    }
}

/// Starts listening endpoints on an engine
#[derive(Debug, Clone, Copy)]
pub struct TransportBootstrapper<'a> {
    engine: &'a EngineHandle,
}

impl<'a> TransportBootstrapper<'a> {
    pub fn new(engine: &'a EngineHandle) -> Self {
        Self { engine }
    }

    /// Starts one transport and registers `observer` on it
    ///
    /// Failures are logged here, with transport, address and port, and
    /// returned; they are never fatal to the process.
    pub fn start_transport(
        &self,
        kind: TransportKind,
        address: &str,
        port: u16,
        observer: &Arc<dyn SipObserver>,
    ) -> Result<SipEndpoint, TransportError> {
        match self.try_start(kind, address, port, observer) {
            Ok(endpoint) => {
                info!("[Sip Server] {} started successfully {}:{}", kind, address, port);
                Ok(endpoint)
            }
            Err(e) => {
                report_failure(kind.as_str(), address, port, &e);
                Err(e)
            }
        }
    }

    /// Same as [`start_transport`](Self::start_transport) for a transport
    /// given by name, as found in configuration files
    pub fn start_named(
        &self,
        transport: &str,
        address: &str,
        port: u16,
        observer: &Arc<dyn SipObserver>,
    ) -> Result<SipEndpoint, TransportError> {
        match transport.parse::<TransportKind>() {
            Ok(kind) => self.start_transport(kind, address, port, observer),
            Err(_) => {
                let e = TransportError::UnsupportedTransport {
                    name: transport.to_string(),
                };
                report_failure(transport, address, port, &e);
                Err(e)
            }
        }
    }

    /// Starts TCP and UDP on the same address and port
    pub fn bootstrap(
        &self,
        address: &str,
        port: u16,
        observer: &Arc<dyn SipObserver>,
    ) -> RunningTransports {
        let mut running = RunningTransports::default();
        for kind in TransportKind::ALL {
            running.record(kind.as_str(), self.start_transport(kind, address, port, observer));
        }
        running
    }

    /// Starts the named transports, each independently
    pub fn bootstrap_named<S: AsRef<str>>(
        &self,
        transports: &[S],
        address: &str,
        port: u16,
        observer: &Arc<dyn SipObserver>,
    ) -> RunningTransports {
        let mut running = RunningTransports::default();
        for transport in transports {
            let transport = transport.as_ref();
            running.record(transport, self.start_named(transport, address, port, observer));
        }
        running
    }

    fn try_start(
        &self,
        kind: TransportKind,
        address: &str,
        port: u16,
        observer: &Arc<dyn SipObserver>,
    ) -> Result<SipEndpoint, TransportError> {
        let point = self.engine.create_listening_point(address, port, kind)?;
        let endpoint = self.engine.create_endpoint(&point)?;

        if transport_policy(kind).auto_dialog_error_handling {
            endpoint.set_dialog_errors_automatically_handled();
        }

        if let Err(e) = endpoint.add_listener(observer.clone()) {
            endpoint.close_in_background();
            return Err(e);
        }

        Ok(endpoint)
    }
}

fn report_failure(transport: &str, address: &str, port: u16, error: &TransportError) {
    match error {
        TransportError::InvalidBindTarget { reason, .. } => error!(
            "[Sip Server] cannot use [{}:{}] as SIP [{}] service ({}), check: 1. that the monitor ip is an address of a local interface; 2. that the port is not already in use",
            address, port, transport, reason
        ),
        other => error!(
            "[Sip Server] SIP [{}] service on [{}:{}] did not start: {}",
            transport, address, port, other
        ),
    }
}

/// A configured engine together with its running transports
#[derive(Debug)]
pub struct SipServer {
    pub engine: EngineHandle,
    pub transports: RunningTransports,
}

impl SipServer {
    /// Closes the endpoints, then the engine
    pub async fn shutdown(self) {
        self.transports.shutdown(&self.engine).await;
    }
}

/// Configures the engine through `configurator` and starts `transports`
///
/// Only configuration errors are returned; transport failures are recorded
/// in [`SipServer::transports`].
pub fn start_sip_server<S: AsRef<str>>(
    configurator: &StackConfigurator,
    options: EngineOptions,
    port: u16,
    transports: &[S],
    observer: &Arc<dyn SipObserver>,
) -> Result<SipServer, ConfigurationError> {
    let address = options.listen_address.trim().to_string();
    let engine = configurator.configure(options)?;

    let transports =
        TransportBootstrapper::new(&engine).bootstrap_named(transports, &address, port, observer);
    if transports.is_empty() {
        error!("[Sip Server] no SIP transport could be started on {}:{}", address, port);
    }

    Ok(SipServer { engine, transports })
}
