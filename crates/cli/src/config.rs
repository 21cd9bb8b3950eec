//! Server configuration: TOML file plus command-line overrides

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use gbsip_sip_stack::{EngineOptions, TraceLevel, TransportKind};

use crate::Args;

/// Whole configuration file
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub sip: SipSection,
    pub logging: LoggingSection,
}

/// `[sip]` section
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SipSection {
    /// Local address both transports bind to
    pub monitor_ip: String,
    pub port: u16,
    /// Transport names, started in this order
    pub transports: Vec<String>,
    pub keep_alive_timeout_secs: u64,
    pub trace_level: String,
    pub debug: bool,
}

impl Default for SipSection {
    fn default() -> Self {
        Self {
            monitor_ip: "0.0.0.0".to_string(),
            port: 5060,
            transports: TransportKind::ALL.iter().map(|k| k.as_str().to_string()).collect(),
            keep_alive_timeout_secs: 60,
            trace_level: TraceLevel::default().to_string(),
            debug: false,
        }
    }
}

/// `[logging]` section
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub json: bool,
    pub file_info: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file_info: false,
        }
    }
}

impl ServerConfig {
    /// Parses configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: ServerConfig = toml::from_str(text).context("Invalid configuration file")?;
        Ok(config)
    }

    /// Reads the file if given, applies the flags, then validates
    pub fn load(args: &Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Failed to load {}", path.display()))
    }

    /// Flags win over file values
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(ip) = &args.monitor_ip {
            self.sip.monitor_ip = ip.clone();
        }
        if let Some(port) = args.port {
            self.sip.port = port;
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if args.json_logs {
            self.logging.json = true;
        }
        if args.debug {
            self.sip.debug = true;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sip.monitor_ip.trim().is_empty() {
            bail!("sip.monitor_ip must not be empty");
        }
        if self.sip.port == 0 {
            bail!("sip.port must be between 1 and 65535");
        }
        if self.sip.transports.is_empty() {
            bail!("sip.transports must name at least one transport");
        }
        self.trace_level()?;
        Ok(())
    }

    pub fn trace_level(&self) -> Result<TraceLevel> {
        self.sip
            .trace_level
            .parse::<TraceLevel>()
            .with_context(|| format!("Invalid sip.trace_level '{}'", self.sip.trace_level))
    }

    /// Engine options for the configured server
    pub fn engine_options(&self) -> Result<EngineOptions> {
        Ok(EngineOptions::new(self.sip.monitor_ip.trim())
            .with_debug_logging(self.sip.debug)
            .with_keep_alive_timeout_secs(self.sip.keep_alive_timeout_secs)
            .with_trace_level(self.trace_level()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_toml("").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.sip.port, 5060);
        assert_eq!(config.sip.transports, vec!["TCP", "UDP"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_file() {
        let config = ServerConfig::from_toml(
            r#"
            [sip]
            monitor_ip = "192.168.1.20"
            port = 15060
            transports = ["udp"]
            keep_alive_timeout_secs = 0
            trace_level = "debug"
            debug = true

            [logging]
            level = "trace"
            json = true
            "#,
        )
        .unwrap();

        assert_eq!(config.sip.monitor_ip, "192.168.1.20");
        assert_eq!(config.sip.port, 15060);
        assert_eq!(config.sip.transports, vec!["udp"]);
        assert!(config.logging.json);
        assert!(!config.logging.file_info);

        let options = config.engine_options().unwrap();
        assert_eq!(options.listen_address, "192.168.1.20");
        assert!(options.debug_logging);
        assert_eq!(options.keep_alive_timeout_secs, 0);
        assert_eq!(options.trace_level, TraceLevel::Debug);
    }

    #[test]
    fn test_rejects_bad_values() {
        let zero_port = ServerConfig::from_toml("[sip]\nport = 0\n").unwrap();
        assert!(zero_port.validate().is_err());

        let empty_ip = ServerConfig::from_toml("[sip]\nmonitor_ip = \" \"\n").unwrap();
        assert!(empty_ip.validate().is_err());

        let no_transports = ServerConfig::from_toml("[sip]\ntransports = []\n").unwrap();
        assert!(no_transports.validate().is_err());

        let bad_trace = ServerConfig::from_toml("[sip]\ntrace_level = \"loud\"\n").unwrap();
        assert!(bad_trace.validate().is_err());

        assert!(ServerConfig::from_toml("[sip]\nport = 70000\n").is_err());
    }

    #[test]
    fn test_args_override_file() {
        let args = Args::parse_from([
            "gbsip",
            "--monitor-ip",
            "10.0.0.5",
            "--port",
            "5080",
            "--log-level",
            "debug",
            "--debug",
        ]);
        let mut config = ServerConfig::from_toml("[sip]\nmonitor_ip = \"127.0.0.1\"\nport = 5060\n").unwrap();
        config.apply_args(&args);

        assert_eq!(config.sip.monitor_ip, "10.0.0.5");
        assert_eq!(config.sip.port, 5080);
        assert_eq!(config.logging.level, "debug");
        assert!(config.sip.debug);
        assert!(!config.logging.json);
    }
}
