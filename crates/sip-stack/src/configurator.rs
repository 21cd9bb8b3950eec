//! Builds the single signaling engine of the process

use std::sync::OnceLock;

use tokio::runtime::Handle;
use tracing::{debug, error, info};

use crate::engine::EngineHandle;
use crate::error::ConfigurationError;
use crate::options::EngineOptions;
use crate::properties::EngineProperties;

static GLOBAL_CONFIGURATOR: OnceLock<StackConfigurator> = OnceLock::new();

/// Turns [`EngineOptions`] into the engine handle, at most once
///
/// Use [`StackConfigurator::global`] in a process; standalone instances are
/// for embedding and tests.
///
/// ```rust
/// use gbsip_sip_stack::{ConfigurationError, EngineOptions, StackConfigurator};
///
/// # tokio_test::block_on(async {
/// let configurator = StackConfigurator::new();
/// let engine = configurator
///     .configure(EngineOptions::new("127.0.0.1").with_debug_logging(true))
///     .expect("Failed to configure engine");
/// assert_eq!(engine.stack_name(), "GB28181_SIP");
///
/// let again = configurator.configure(EngineOptions::new("127.0.0.1"));
/// assert!(matches!(again, Err(ConfigurationError::AlreadyConfigured)));
/// # })
/// ```
#[derive(Debug, Default)]
pub struct StackConfigurator {
    engine: OnceLock<EngineHandle>,
}

impl StackConfigurator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide configurator
    pub fn global() -> &'static StackConfigurator {
        GLOBAL_CONFIGURATOR.get_or_init(StackConfigurator::new)
    }

    /// Configures the engine on the current tokio runtime
    pub fn configure(&self, options: EngineOptions) -> Result<EngineHandle, ConfigurationError> {
        let runtime = Handle::try_current().map_err(|e| {
            error!("[Sip Server] signaling engine needs an async runtime: {}", e);
            ConfigurationError::engine_unavailable(format!("no async runtime available: {}", e))
        })?;
        self.configure_with_runtime(options, runtime)
    }

    /// Configures the engine, running its event sources on `runtime`
    pub fn configure_with_runtime(
        &self,
        options: EngineOptions,
        runtime: Handle,
    ) -> Result<EngineHandle, ConfigurationError> {
        if self.engine.get().is_some() {
            return Err(ConfigurationError::AlreadyConfigured);
        }

        if options.listen_address.trim().is_empty() {
            return Err(ConfigurationError::InvalidListenAddress(options.listen_address));
        }

        let properties = EngineProperties::from_options(&options);
        debug!("Signaling engine properties:\n{}", properties);

        let engine = EngineHandle::with_runtime(&properties, runtime).inspect_err(|e| {
            error!("[Sip Server] cannot create signaling engine: {}", e);
        })?;

        // A concurrent caller may have won the race
        self.engine
            .set(engine.clone())
            .map_err(|_| ConfigurationError::AlreadyConfigured)?;

        info!(
            "[Sip Server] signaling engine {} configured on {}",
            engine.stack_name(),
            engine.settings().ip_address
        );
        Ok(engine)
    }

    /// The configured engine, if any
    pub fn engine(&self) -> Option<&EngineHandle> {
        self.engine.get()
    }

    pub fn is_configured(&self) -> bool {
        self.engine.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_configure_fails() {
        let configurator = StackConfigurator::new();
        let first = configurator.configure(EngineOptions::new("127.0.0.1")).unwrap();

        let second = configurator.configure(EngineOptions::new("127.0.0.1"));
        assert!(matches!(second, Err(ConfigurationError::AlreadyConfigured)));

        assert!(configurator.engine().unwrap().ptr_eq(&first));
        assert!(!first.is_shut_down());
    }

    #[tokio::test]
    async fn test_empty_listen_address() {
        let configurator = StackConfigurator::new();
        let result = configurator.configure(EngineOptions::new("  "));
        assert!(matches!(result, Err(ConfigurationError::InvalidListenAddress(_))));
        assert!(!configurator.is_configured());

        // A rejected attempt does not consume the single configuration
        assert!(configurator.configure(EngineOptions::new("127.0.0.1")).is_ok());
    }

    #[test]
    fn test_configure_without_runtime() {
        let configurator = StackConfigurator::new();
        let result = configurator.configure(EngineOptions::new("127.0.0.1"));
        assert!(matches!(result, Err(ConfigurationError::EngineUnavailable { .. })));
        assert!(!configurator.is_configured());
    }

    #[test]
    fn test_global_is_shared() {
        assert!(std::ptr::eq(StackConfigurator::global(), StackConfigurator::global()));
    }
}
