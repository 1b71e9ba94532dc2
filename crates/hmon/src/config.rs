// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Agent configuration.
//!
//! Loaded once from YAML by the binary and handed to the service processor at
//! construction. Every field has a default, so an empty file is a valid
//! configuration:
//!
//! ```yaml
//! global:
//!   port: 6556
//!   encrypted: true
//!   passphrase: secret
//!   only_from: [127.0.0.1, 10.1.2.3]
//!   sections: [check_mk, systemtime, uptime, mem]
//! realtime:
//!   enabled: true
//!   port: 6559
//!   timeout: 90
//!   encrypted: true
//!   sections: [mem, systemtime]
//! main:
//!   delay_ms: 1000
//! logging:
//!   level: info
//! ```

use crate::crypto::OVERHEAD;
use crate::transport::datagram::DATA_OFFSET;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default pull port.
pub const DEFAULT_PORT: u16 = 6556;

/// Default realtime target port on the station.
pub const DEFAULT_REALTIME_PORT: u16 = 6559;

/// Default realtime session lifetime without a new pull.
pub const DEFAULT_REALTIME_TIMEOUT_SECS: u64 = 90;

/// Longest realtime session lifetime accepted from a configuration (one day).
pub const MAX_REALTIME_TIMEOUT_SECS: u64 = 86_400;

/// Default realtime tick.
pub const DEFAULT_REALTIME_INTERVAL_MS: u64 = 500;

/// Largest datagram sent by default; larger ticks are dropped.
pub const DEFAULT_MAX_DATAGRAM: usize = 16_000;

/// Largest UDP payload over IPv4.
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Default collection period.
pub const DEFAULT_MAIN_DELAY_MS: u64 = 1000;

const LOG_LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete agent configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Pull channel and encryption.
    pub global: GlobalConfig,
    /// Push channel.
    pub realtime: RealtimeConfig,
    /// Collection timer.
    pub main: MainConfig,
    /// Log filtering.
    pub logging: LoggingConfig,
}

/// Pull channel settings.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Listening port, 0 disables the pull channel.
    pub port: u16,
    /// Listening address.
    pub bind_address: IpAddr,
    /// Peers allowed to pull; empty allows everyone.
    pub only_from: Vec<IpAddr>,
    /// Encrypt pull replies.
    pub encrypted: bool,
    /// Shared secret for both channels.
    pub passphrase: String,
    /// Sections in a pull reply, in order.
    pub sections: Vec<String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            only_from: Vec::new(),
            encrypted: false,
            passphrase: String::new(),
            sections: default_pull_sections(),
        }
    }
}

// passphrase must never reach a log line
impl fmt::Debug for GlobalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalConfig")
            .field("port", &self.port)
            .field("bind_address", &self.bind_address)
            .field("only_from", &self.only_from)
            .field("encrypted", &self.encrypted)
            .field("passphrase", &redact(&self.passphrase))
            .field("sections", &self.sections)
            .finish()
    }
}

impl GlobalConfig {
    /// Secret for pull replies, if encryption is on.
    pub fn secret(&self) -> Option<&str> {
        (self.encrypted && !self.passphrase.is_empty()).then_some(self.passphrase.as_str())
    }
}

/// Push channel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Arm the realtime device on start.
    pub enabled: bool,
    /// Station port datagrams are sent to.
    pub port: u16,
    /// Session lifetime in seconds after the last pull.
    #[serde(rename = "timeout")]
    pub timeout_secs: u64,
    /// Encrypt datagram bodies with the global passphrase.
    pub encrypted: bool,
    /// Sections in each datagram, in order.
    pub sections: Vec<String>,
    /// Tick period in milliseconds.
    pub interval_ms: u64,
    /// Largest datagram allowed on the wire.
    pub max_datagram: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: DEFAULT_REALTIME_PORT,
            timeout_secs: DEFAULT_REALTIME_TIMEOUT_SECS,
            encrypted: false,
            sections: vec!["mem".to_string(), "systemtime".to_string()],
            interval_ms: DEFAULT_REALTIME_INTERVAL_MS,
            max_datagram: DEFAULT_MAX_DATAGRAM,
        }
    }
}

impl RealtimeConfig {
    /// Tick period.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Session lifetime.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Collection timer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MainConfig {
    /// Collection period in milliseconds.
    pub delay_ms: u64,
}

impl Default for MainConfig {
    fn default() -> Self {
        Self {
            delay_ms: DEFAULT_MAIN_DELAY_MS,
        }
    }
}

impl MainConfig {
    /// Collection period.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Log filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level (off, error, warn, info, debug, trace).
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn default_pull_sections() -> Vec<String> {
    ["check_mk", "systemtime", "uptime", "mem"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        ""
    } else {
        "<redacted>"
    }
}

impl AgentConfig {
    /// Load and validate configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        // an empty document deserializes to unit, not to a mapping
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize back to YAML.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Copy with the passphrase masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.global.passphrase = redact(&self.global.passphrase).to_string();
        copy
    }

    /// Secret for realtime datagrams, if encryption is on.
    pub fn realtime_secret(&self) -> Option<&str> {
        (self.realtime.encrypted && !self.global.passphrase.is_empty())
            .then_some(self.global.passphrase.as_str())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.global.encrypted && self.global.passphrase.is_empty() {
            return Err(ConfigError::Invalid(
                "global.encrypted requires global.passphrase".into(),
            ));
        }
        check_section_names("global.sections", &self.global.sections)?;

        if self.main.delay_ms == 0 {
            return Err(ConfigError::Invalid("main.delay_ms must be > 0".into()));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "logging.level '{}' is not one of {:?}",
                self.logging.level, LOG_LEVELS
            )));
        }

        self.validate_realtime()
    }

    fn validate_realtime(&self) -> Result<(), ConfigError> {
        let rt = &self.realtime;
        if !rt.enabled {
            return Ok(());
        }
        if rt.port == 0 {
            return Err(ConfigError::Invalid("realtime.port must be > 0".into()));
        }
        if rt.timeout_secs == 0 || rt.timeout_secs > MAX_REALTIME_TIMEOUT_SECS {
            return Err(ConfigError::Invalid(format!(
                "realtime.timeout {} outside 1..={}",
                rt.timeout_secs, MAX_REALTIME_TIMEOUT_SECS
            )));
        }
        if rt.interval_ms == 0 {
            return Err(ConfigError::Invalid("realtime.interval_ms must be > 0".into()));
        }
        if rt.encrypted && self.global.passphrase.is_empty() {
            return Err(ConfigError::Invalid(
                "realtime.encrypted requires global.passphrase".into(),
            ));
        }

        let min = DATA_OFFSET + OVERHEAD + 1;
        if rt.max_datagram < min || rt.max_datagram > MAX_UDP_PAYLOAD {
            return Err(ConfigError::Invalid(format!(
                "realtime.max_datagram {} outside {}..={}",
                rt.max_datagram, min, MAX_UDP_PAYLOAD
            )));
        }
        if rt.sections.is_empty() {
            return Err(ConfigError::Invalid(
                "realtime.sections must not be empty".into(),
            ));
        }
        check_section_names("realtime.sections", &rt.sections)
    }
}

fn check_section_names(field: &str, names: &[String]) -> Result<(), ConfigError> {
    for name in names {
        if name.is_empty() || name.contains(|c: char| c.is_whitespace() || c == '<' || c == '>') {
            return Err(ConfigError::Invalid(format!(
                "{} contains invalid section name '{}'",
                field, name
            )));
        }
    }
    Ok(())
}
