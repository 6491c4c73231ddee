//! Layered configuration: a typed, `#[serde(default)]` TOML file shape
//! shared by both binaries, meant to be overridden field-by-field by CLI
//! flags in each binary's `main.rs` (file defaults, then CLI overrides).

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{CoreError, Result};

/// Timing/limits shared by the `[server]` and `[client]` sections so the
/// field definitions aren't duplicated.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub max_body_bytes: usize,
    pub in_flight_limit: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 20,
            heartbeat_timeout_secs: 60,
            request_timeout_secs: 30,
            max_body_bytes: 10 * 1024 * 1024,
            in_flight_limit: 128,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub control_port: u16,
    pub http_port: u16,
    pub no_ssl: bool,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub zone: String,
    /// Status page detail: redact reported client addresses to their
    /// /24 rather than printing them in full. Config-file only — there's
    /// no CLI flag for it.
    pub redact_client_ips: bool,
    #[serde(flatten)]
    pub timing: TimingConfig,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            control_port: 8000,
            http_port: 80,
            no_ssl: false,
            cert: None,
            key: None,
            zone: "localhost".to_string(),
            redact_client_ips: false,
            timing: TimingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientSection {
    pub server: String,
    pub server_port: u16,
    pub local: String,
    pub local_port: u16,
    pub subdomain: Option<String>,
    pub no_ssl: bool,
    pub insecure: bool,
    #[serde(flatten)]
    pub timing: TimingConfig,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            server: String::new(),
            server_port: 8000,
            local: "127.0.0.1".to_string(),
            local_port: 0,
            subdomain: None,
            no_ssl: false,
            insecure: false,
            timing: TimingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    pub server: ServerSection,
    pub client: ClientSection,
}

impl FileConfig {
    /// Load settings from an optional TOML config file. Absence of `path`
    /// yields all-defaults; an explicit path that doesn't parse is a config
    /// error (exit code 2).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Err(CoreError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CoreError::Config(format!("failed to parse config: {e}")))
    }
}
