//! Property-style engine configuration
//!
//! The engine is configured from string key/value entries, the same way a
//! deployment would pass them through a properties file. [`EngineProperties`]
//! renders them from [`EngineOptions`] and applies the platform policy.

use std::collections::BTreeMap;
use std::fmt;

use crate::options::EngineOptions;

/// Name the engine instance is registered under
pub const GB28181_STACK_NAME: &str = "GB28181_SIP";

pub const STACK_NAME: &str = "sip.STACK_NAME";
pub const IP_ADDRESS: &str = "sip.IP_ADDRESS";
pub const LOG_MESSAGE_CONTENT: &str = "sip.stack.LOG_MESSAGE_CONTENT";
pub const DELIVER_UNSOLICITED_NOTIFY: &str = "sip.stack.DELIVER_UNSOLICITED_NOTIFY";
pub const AUTOMATIC_DIALOG_ERROR_HANDLING: &str = "sip.stack.AUTOMATIC_DIALOG_ERROR_HANDLING";
pub const CANCEL_CLIENT_TRANSACTION_CHECKED: &str = "sip.stack.CANCEL_CLIENT_TRANSACTION_CHECKED";
pub const DELIVER_TERMINATED_EVENT_FOR_NULL_DIALOG: &str =
    "sip.stack.DELIVER_TERMINATED_EVENT_FOR_NULL_DIALOG";
pub const RELEASE_REFERENCES_STRATEGY: &str = "sip.stack.RELEASE_REFERENCES_STRATEGY";
pub const RELIABLE_CONNECTION_KEEP_ALIVE_TIMEOUT: &str =
    "sip.stack.RELIABLE_CONNECTION_KEEP_ALIVE_TIMEOUT";
pub const TRACE_LEVEL: &str = "sip.stack.TRACE_LEVEL";

/// Ordered set of engine configuration entries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineProperties {
    entries: BTreeMap<String, String>,
}

impl EngineProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Renders the entries for `options`
    ///
    /// Regardless of what the options say, unsolicited NOTIFY and
    /// terminated events for null dialogs are delivered, while automatic
    /// dialog-error handling and CANCEL transaction checking stay off so the
    /// owning application manages dialog lifecycle itself.
    pub fn from_options(options: &EngineOptions) -> Self {
        let mut properties = Self::new();
        properties.set(STACK_NAME, GB28181_STACK_NAME);
        properties.set(IP_ADDRESS, options.listen_address.trim());

        if options.debug_logging {
            properties.set(LOG_MESSAGE_CONTENT, "false");
        }

        properties.set(DELIVER_UNSOLICITED_NOTIFY, "true");
        properties.set(AUTOMATIC_DIALOG_ERROR_HANDLING, "false");
        properties.set(CANCEL_CLIENT_TRANSACTION_CHECKED, "false");
        properties.set(DELIVER_TERMINATED_EVENT_FOR_NULL_DIALOG, "true");
        properties.set(RELEASE_REFERENCES_STRATEGY, options.release_references_strategy.as_str());
        properties.set(
            RELIABLE_CONNECTION_KEEP_ALIVE_TIMEOUT,
            options.keep_alive_timeout_secs.to_string(),
        );
        properties.set(TRACE_LEVEL, options.trace_level.as_str());

        properties
    }

    /// Sets an entry, replacing any previous value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for EngineProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in self.iter() {
            writeln!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}
