//! Signaling engine configuration and transport bootstrap
//!
//! This crate brings up a SIP signaling endpoint for a GB28181 platform:
//!
//! - [`StackConfigurator`] turns [`EngineOptions`] into the single
//!   [`EngineHandle`] of the process.
//! - [`TransportBootstrapper`] binds one [`SipEndpoint`] per
//!   [`TransportKind`] on the same address and port and registers a shared
//!   [`SipObserver`] on each of them.
//!
//! Transports start and fail independently. A TCP bind failure is logged
//! and reported as a value; it never keeps UDP from starting.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gbsip_sip_stack::{EngineOptions, SipEvent, SipObserver, StackConfigurator, TransportBootstrapper};
//!
//! struct Printer;
//!
//! impl SipObserver for Printer {
//!     fn on_event(&self, event: SipEvent) {
//!         println!("{:?}", event);
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = StackConfigurator::global().configure(EngineOptions::new("0.0.0.0"))?;
//! let observer: Arc<dyn SipObserver> = Arc::new(Printer);
//! let running = TransportBootstrapper::new(&engine).bootstrap("0.0.0.0", 5060, &observer);
//! if running.is_empty() {
//!     eprintln!("no SIP transport could be started");
//! }
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod configurator;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod observer;
pub mod options;
pub mod properties;

pub use bootstrap::{
    RunningTransports, SipServer, TransportBootstrapper, TransportPolicy, TransportStartFailure,
    start_sip_server, transport_policy,
};
pub use configurator::StackConfigurator;
pub use endpoint::SipEndpoint;
pub use engine::{EngineHandle, EngineSettings, ListeningPoint};
pub use error::{ConfigurationError, TransportError};
pub use observer::{ChannelObserver, SipEvent, SipEventKind, SipObserver};
pub use options::{EngineOptions, ReleaseReferencesStrategy, TraceLevel};
pub use properties::EngineProperties;

pub use gbsip_sip_transport::{CloseReason, TransportKind};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        ConfigurationError, EngineHandle, EngineOptions, RunningTransports, SipEndpoint, SipEvent,
        SipEventKind, SipObserver, StackConfigurator, TraceLevel, TransportBootstrapper,
        TransportError, TransportKind,
    };
}
