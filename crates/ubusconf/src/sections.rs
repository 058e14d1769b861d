//! Configuration sections, one struct per TOML table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Keepalive values between 1 and this many seconds are raised to it.
pub const MIN_KEEPALIVE_SECS: u64 = 5;

/// Apply the keepalive floor. Zero keeps keepalive disabled.
pub fn clamp_keepalive(secs: u64) -> u64 {
    if secs == 0 {
        0
    } else {
        secs.max(MIN_KEEPALIVE_SECS)
    }
}

/// Files the daemon reads at startup and on every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// JSON document describing objects, methods and parameters.
    /// Default: /www/iot/etc/iot-ubusd.json
    #[serde(default = "PathsConfig::default_objects_file")]
    pub objects_file: PathBuf,

    /// Lua file serving ordinary object calls.
    /// Default: /usr/share/iot/rpc/ubus/iot-ubusd.lua
    #[serde(default = "PathsConfig::default_callback_script")]
    pub callback_script: PathBuf,

    /// Lua file serving `iot-ubusd iot-rpc` calls.
    /// Default: /www/iot/iot-rpc.lua
    #[serde(default = "PathsConfig::default_rpc_script")]
    pub rpc_script: PathBuf,
}

impl PathsConfig {
    fn default_objects_file() -> PathBuf {
        PathBuf::from("/www/iot/etc/iot-ubusd.json")
    }

    fn default_callback_script() -> PathBuf {
        PathBuf::from("/usr/share/iot/rpc/ubus/iot-ubusd.lua")
    }

    fn default_rpc_script() -> PathBuf {
        PathBuf::from("/www/iot/iot-rpc.lua")
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            objects_file: Self::default_objects_file(),
            callback_script: Self::default_callback_script(),
            rpc_script: Self::default_rpc_script(),
        }
    }
}

/// Local bus endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// ROUTER bind address.
    /// Default: tcp://127.0.0.1:5590
    #[serde(default = "BusConfig::default_endpoint")]
    pub endpoint: String,
}

impl BusConfig {
    fn default_endpoint() -> String {
        "tcp://127.0.0.1:5590".to_string()
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            endpoint: Self::default_endpoint(),
        }
    }
}

/// MQTT broker connection used by the remote backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker address, `mqtt://host:port` or `host:port`.
    #[serde(default = "BrokerConfig::default_address")]
    pub address: String,

    #[serde(default = "BrokerConfig::default_client_id")]
    pub client_id: String,

    /// Keepalive interval in seconds. 0 disables keepalive.
    #[serde(default = "BrokerConfig::default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Topic requests are published on.
    #[serde(default = "BrokerConfig::default_request_topic")]
    pub request_topic: String,

    /// Topic responses arrive on.
    #[serde(default = "BrokerConfig::default_response_topic")]
    pub response_topic: String,

    /// Last-will payload published by the broker if we vanish.
    #[serde(default = "BrokerConfig::default_will_message")]
    pub will_message: String,
}

impl BrokerConfig {
    fn default_address() -> String {
        "mqtt://127.0.0.1:1883".to_string()
    }

    fn default_client_id() -> String {
        "iot-ubusd".to_string()
    }

    fn default_keepalive_secs() -> u64 {
        6
    }

    fn default_request_topic() -> String {
        "mg/iot-ubusd/channel/iot-rpcd".to_string()
    }

    fn default_response_topic() -> String {
        "mg/iot-ubusd/channel".to_string()
    }

    fn default_will_message() -> String {
        "goodbye".to_string()
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: Self::default_address(),
            client_id: Self::default_client_id(),
            keepalive_secs: Self::default_keepalive_secs(),
            request_topic: Self::default_request_topic(),
            response_topic: Self::default_response_topic(),
            will_message: Self::default_will_message(),
        }
    }
}

/// Which backend serves ordinary object calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// In-process Lua callback script.
    #[default]
    Script,
    /// Remote peer reached through the MQTT broker.
    Remote,
}

impl BackendMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendMode::Script => "script",
            BackendMode::Remote => "remote",
        }
    }
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "script" | "lua" => Ok(BackendMode::Script),
            "remote" | "mqtt" => Ok(BackendMode::Remote),
            other => Err(format!("unknown backend '{}', expected script or remote", other)),
        }
    }
}

/// Backend selection and per-call limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub mode: BackendMode,

    /// First element of the normalized remote envelope's params.
    #[serde(default = "BackendConfig::default_remote_module")]
    pub remote_module: String,

    /// Second element of the normalized remote envelope's params.
    #[serde(default = "BackendConfig::default_remote_function")]
    pub remote_function: String,

    /// How long a remote call waits for its response.
    /// Default: 10000
    #[serde(default = "BackendConfig::default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Upper bound on a single script execution.
    /// Default: 30000
    #[serde(default = "BackendConfig::default_script_timeout_ms")]
    pub script_timeout_ms: u64,

    /// Strip file and process access from the Lua environment.
    #[serde(default)]
    pub sandbox: bool,
}

impl BackendConfig {
    fn default_remote_module() -> String {
        "ubus".to_string()
    }

    fn default_remote_function() -> String {
        "call".to_string()
    }

    fn default_call_timeout_ms() -> u64 {
        10_000
    }

    fn default_script_timeout_ms() -> u64 {
        30_000
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            mode: BackendMode::default(),
            remote_module: Self::default_remote_module(),
            remote_function: Self::default_remote_function(),
            call_timeout_ms: Self::default_call_timeout_ms(),
            script_timeout_ms: Self::default_script_timeout_ms(),
            sandbox: false,
        }
    }
}

/// Logging and OpenTelemetry export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter directive (trace, debug, info, warn, error).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,

    /// OTLP gRPC endpoint. Empty disables export.
    #[serde(default)]
    pub otlp_endpoint: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    /// The endpoint, if export is enabled.
    pub fn otlp(&self) -> Option<&str> {
        let endpoint = self.otlp_endpoint.trim();
        (!endpoint.is_empty()).then_some(endpoint)
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            otlp_endpoint: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_keepalive() {
        assert_eq!(clamp_keepalive(0), 0);
        assert_eq!(clamp_keepalive(1), MIN_KEEPALIVE_SECS);
        assert_eq!(clamp_keepalive(MIN_KEEPALIVE_SECS), MIN_KEEPALIVE_SECS);
        assert_eq!(clamp_keepalive(60), 60);
    }

    #[test]
    fn test_backend_mode_from_str() {
        assert_eq!("script".parse::<BackendMode>(), Ok(BackendMode::Script));
        assert_eq!("REMOTE".parse::<BackendMode>(), Ok(BackendMode::Remote));
        assert_eq!("mqtt".parse::<BackendMode>(), Ok(BackendMode::Remote));
        assert!("carrier-pigeon".parse::<BackendMode>().is_err());
    }

    #[test]
    fn test_otlp_disabled_when_blank() {
        let mut telemetry = TelemetryConfig::default();
        assert_eq!(telemetry.otlp(), None);
        telemetry.otlp_endpoint = " 127.0.0.1:4317 ".to_string();
        assert_eq!(telemetry.otlp(), Some("127.0.0.1:4317"));
    }
}
