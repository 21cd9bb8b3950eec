//! Engine options supplied by process configuration

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigurationError;

/// Default keep-alive timeout for reliable (TCP) connections
pub const DEFAULT_KEEP_ALIVE_TIMEOUT_SECS: u64 = 60;

/// Verbosity of the engine's own message tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TraceLevel {
    Off,
    #[default]
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl TraceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceLevel::Off => "OFF",
            TraceLevel::Error => "ERROR",
            TraceLevel::Warning => "WARNING",
            TraceLevel::Info => "INFO",
            TraceLevel::Debug => "DEBUG",
            TraceLevel::Trace => "TRACE",
        }
    }
}

impl fmt::Display for TraceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TraceLevel {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OFF" => Ok(TraceLevel::Off),
            "ERROR" => Ok(TraceLevel::Error),
            "WARNING" | "WARN" => Ok(TraceLevel::Warning),
            "INFO" => Ok(TraceLevel::Info),
            "DEBUG" => Ok(TraceLevel::Debug),
            "TRACE" => Ok(TraceLevel::Trace),
            _ => Err(ConfigurationError::engine_unavailable(format!(
                "invalid trace level '{}'",
                s
            ))),
        }
    }
}

/// How the engine drops references to finished transactions and dialogs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReleaseReferencesStrategy {
    #[default]
    Normal,
    Hard,
    None,
}

impl ReleaseReferencesStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseReferencesStrategy::Normal => "Normal",
            ReleaseReferencesStrategy::Hard => "Hard",
            ReleaseReferencesStrategy::None => "None",
        }
    }
}

impl fmt::Display for ReleaseReferencesStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReleaseReferencesStrategy {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Normal" => Ok(ReleaseReferencesStrategy::Normal),
            "Hard" => Ok(ReleaseReferencesStrategy::Hard),
            "None" => Ok(ReleaseReferencesStrategy::None),
            _ => Err(ConfigurationError::engine_unavailable(format!(
                "invalid release references strategy '{}'",
                s
            ))),
        }
    }
}

/// Options the signaling engine is configured from
///
/// Built once at process start and consumed by
/// [`StackConfigurator::configure`](crate::StackConfigurator::configure).
/// The dialog and NOTIFY policy fields are overridden by the configurator,
/// see [`EngineProperties::from_options`](crate::EngineProperties::from_options).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Local address the engine advertises and binds to
    pub listen_address: String,
    /// Enables debug diagnostics (turns off message-content logging)
    pub debug_logging: bool,
    /// Let the engine terminate dialogs on errors by itself
    pub auto_dialog_error_handling: bool,
    /// Check CANCEL against an existing client transaction
    pub cancel_transaction_checked: bool,
    /// Deliver NOTIFY requests without a matching subscription
    pub deliver_unsolicited_notify: bool,
    /// Deliver terminated events for transactions without a dialog
    pub deliver_terminated_event_for_null_dialog: bool,
    /// Cleanup strategy for finished transactions and dialogs
    pub release_references_strategy: ReleaseReferencesStrategy,
    /// Idle limit for TCP connections, 0 disables it
    pub keep_alive_timeout_secs: u64,
    /// Engine message tracing verbosity
    pub trace_level: TraceLevel,
}

impl EngineOptions {
    /// Options with the platform defaults for the given listen address
    pub fn new(listen_address: impl Into<String>) -> Self {
        Self {
            listen_address: listen_address.into(),
            debug_logging: false,
            auto_dialog_error_handling: false,
            cancel_transaction_checked: false,
            deliver_unsolicited_notify: true,
            deliver_terminated_event_for_null_dialog: true,
            release_references_strategy: ReleaseReferencesStrategy::Normal,
            keep_alive_timeout_secs: DEFAULT_KEEP_ALIVE_TIMEOUT_SECS,
            trace_level: TraceLevel::Error,
        }
    }

    pub fn with_debug_logging(mut self, enabled: bool) -> Self {
        self.debug_logging = enabled;
        self
    }

    pub fn with_keep_alive_timeout_secs(mut self, secs: u64) -> Self {
        self.keep_alive_timeout_secs = secs;
        self
    }

    pub fn with_trace_level(mut self, level: TraceLevel) -> Self {
        self.trace_level = level;
        self
    }

    pub fn with_release_references_strategy(mut self, strategy: ReleaseReferencesStrategy) -> Self {
        self.release_references_strategy = strategy;
        self
    }
}
