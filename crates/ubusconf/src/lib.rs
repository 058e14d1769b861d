//! Configuration loading for iot-ubusd.
//!
//! The daemon and its client subcommands share one `UbusdConfig`. Values come
//! from compiled defaults, then config files, then environment variables. The
//! binary applies its command-line flags last.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/iot-ubusd/config.toml` (system)
//! 2. `~/.config/iot-ubusd/config.toml` (user)
//! 3. `./iot-ubusd.toml` (local override, replaced by `--config-file`)
//! 4. Environment variables (`IOT_UBUSD_*`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! objects_file = "/www/iot/etc/iot-ubusd.json"
//! callback_script = "/usr/share/iot/rpc/ubus/iot-ubusd.lua"
//!
//! [bus]
//! endpoint = "tcp://127.0.0.1:5590"
//!
//! [broker]
//! address = "mqtt://127.0.0.1:1883"
//! keepalive_secs = 6
//!
//! [backend]
//! mode = "remote"
//! remote_module = "ubus"
//! remote_function = "call"
//!
//! [telemetry]
//! log_level = "info"
//! ```

pub mod loader;
pub mod sections;

pub use loader::{discover_config_files_with_override, expand_path, ConfigSources};
pub use sections::{
    clamp_keepalive, BackendConfig, BackendMode, BrokerConfig, BusConfig, PathsConfig,
    TelemetryConfig, MIN_KEEPALIVE_SECS,
};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete iot-ubusd configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UbusdConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl UbusdConfig {
    /// Load configuration from all default sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, letting `config_path` replace the local override.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and report which files and variables contributed.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = UbusdConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            loader::overlay_file(&mut config, &path)?;
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);
        config.normalize();

        Ok((config, sources))
    }

    /// Enforce value floors. Call again after applying CLI overrides.
    pub fn normalize(&mut self) {
        self.broker.keepalive_secs = clamp_keepalive(self.broker.keepalive_secs);
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::from("# iot-ubusd configuration\n\n");
        match toml::to_string_pretty(self) {
            Ok(body) => output.push_str(&body),
            Err(e) => output.push_str(&format!("# failed to serialize: {}\n", e)),
        }
        output
    }
}
