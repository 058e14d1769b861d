//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, UbusdConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/iot-ubusd/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("iot-ubusd/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("iot-ubusd.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file and apply every key it sets onto `config`.
pub fn overlay_file(config: &mut UbusdConfig, path: &Path) -> Result<(), ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    overlay_toml(config, &contents, path)
}

/// Apply the keys present in `contents`. Absent keys keep their current value,
/// so successive files layer on top of each other.
fn overlay_toml(config: &mut UbusdConfig, contents: &str, path: &Path) -> Result<(), ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    if let Some(paths) = Section::get(&table, "paths", path)? {
        if let Some(v) = paths.str("objects_file")? {
            config.paths.objects_file = expand_path(v);
        }
        if let Some(v) = paths.str("callback_script")? {
            config.paths.callback_script = expand_path(v);
        }
        if let Some(v) = paths.str("rpc_script")? {
            config.paths.rpc_script = expand_path(v);
        }
    }

    if let Some(bus) = Section::get(&table, "bus", path)? {
        if let Some(v) = bus.str("endpoint")? {
            config.bus.endpoint = v.to_string();
        }
    }

    if let Some(broker) = Section::get(&table, "broker", path)? {
        if let Some(v) = broker.str("address")? {
            config.broker.address = v.to_string();
        }
        if let Some(v) = broker.str("client_id")? {
            config.broker.client_id = v.to_string();
        }
        if let Some(v) = broker.u64("keepalive_secs")? {
            config.broker.keepalive_secs = v;
        }
        if let Some(v) = broker.str("request_topic")? {
            config.broker.request_topic = v.to_string();
        }
        if let Some(v) = broker.str("response_topic")? {
            config.broker.response_topic = v.to_string();
        }
        if let Some(v) = broker.str("will_message")? {
            config.broker.will_message = v.to_string();
        }
    }

    if let Some(backend) = Section::get(&table, "backend", path)? {
        if let Some(v) = backend.str("mode")? {
            config.backend.mode = v.parse().map_err(|message| ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            })?;
        }
        if let Some(v) = backend.str("remote_module")? {
            config.backend.remote_module = v.to_string();
        }
        if let Some(v) = backend.str("remote_function")? {
            config.backend.remote_function = v.to_string();
        }
        if let Some(v) = backend.u64("call_timeout_ms")? {
            config.backend.call_timeout_ms = v;
        }
        if let Some(v) = backend.u64("script_timeout_ms")? {
            config.backend.script_timeout_ms = v;
        }
        if let Some(v) = backend.bool("sandbox")? {
            config.backend.sandbox = v;
        }
    }

    if let Some(telemetry) = Section::get(&table, "telemetry", path)? {
        if let Some(v) = telemetry.str("log_level")? {
            config.telemetry.log_level = v.to_string();
        }
        if let Some(v) = telemetry.str("otlp_endpoint")? {
            config.telemetry.otlp_endpoint = v.to_string();
        }
    }

    Ok(())
}

/// A `[table]` of a config file, with typed accessors that name the
/// offending key on mismatch.
struct Section<'a> {
    name: &'static str,
    table: &'a toml::Table,
    path: &'a Path,
}

impl<'a> Section<'a> {
    fn get(
        root: &'a toml::Table,
        name: &'static str,
        path: &'a Path,
    ) -> Result<Option<Self>, ConfigError> {
        match root.get(name) {
            None => Ok(None),
            Some(toml::Value::Table(table)) => Ok(Some(Section { name, table, path })),
            Some(_) => Err(ConfigError::Parse {
                path: path.to_path_buf(),
                message: format!("[{}] must be a table", name),
            }),
        }
    }

    fn mismatch(&self, key: &str, expected: &str) -> ConfigError {
        ConfigError::Parse {
            path: self.path.to_path_buf(),
            message: format!("{}.{} must be {}", self.name, key, expected),
        }
    }

    fn str(&self, key: &str) -> Result<Option<&'a str>, ConfigError> {
        match self.table.get(key) {
            None => Ok(None),
            Some(v) => v.as_str().map(Some).ok_or_else(|| self.mismatch(key, "a string")),
        }
    }

    fn u64(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        match self.table.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_integer()
                .and_then(|n| u64::try_from(n).ok())
                .map(Some)
                .ok_or_else(|| self.mismatch(key, "a non-negative integer")),
        }
    }

    fn bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.table.get(key) {
            None => Ok(None),
            Some(v) => v.as_bool().map(Some).ok_or_else(|| self.mismatch(key, "a boolean")),
        }
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut UbusdConfig, sources: &mut ConfigSources) {
    apply_overrides_from(config, sources, |key| env::var(key).ok());
}

/// Apply overrides using `lookup` as the environment.
pub fn apply_overrides_from<F>(config: &mut UbusdConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let mut take = |key: &str| {
        let value = lookup(key);
        if value.is_some() {
            sources.env_overrides.push(key.to_string());
        }
        value
    };

    if let Some(v) = take("IOT_UBUSD_OBJECTS_FILE") {
        config.paths.objects_file = expand_path(&v);
    }
    if let Some(v) = take("IOT_UBUSD_CALLBACK_SCRIPT") {
        config.paths.callback_script = expand_path(&v);
    }
    if let Some(v) = take("IOT_UBUSD_RPC_SCRIPT") {
        config.paths.rpc_script = expand_path(&v);
    }
    if let Some(v) = take("IOT_UBUSD_BUS_ENDPOINT") {
        config.bus.endpoint = v;
    }
    if let Some(v) = take("IOT_UBUSD_MQTT_ADDRESS") {
        config.broker.address = v;
    }
    if let Some(v) = take("IOT_UBUSD_MQTT_KEEPALIVE") {
        if let Ok(secs) = v.parse() {
            config.broker.keepalive_secs = secs;
        }
    }
    if let Some(v) = take("IOT_UBUSD_BACKEND") {
        if let Ok(mode) = v.parse() {
            config.backend.mode = mode;
        }
    }
    if let Some(v) = take("IOT_UBUSD_REMOTE_MODULE") {
        config.backend.remote_module = v;
    }
    if let Some(v) = take("IOT_UBUSD_REMOTE_FUNCTION") {
        config.backend.remote_function = v;
    }
    if let Some(v) = take("IOT_UBUSD_LOG_LEVEL") {
        config.telemetry.log_level = v;
    }
    // RUST_LOG wins over the crate-specific variable
    if let Some(v) = take("RUST_LOG") {
        config.telemetry.log_level = v;
    }
    if let Some(v) = take("OTEL_EXPORTER_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = v;
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(stripped);
        }
        PathBuf::from(path)
    } else if let Some(stripped) = path.strip_prefix('$') {
        // $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            match env::var(var_name) {
                Ok(value) => PathBuf::from(value).join(&stripped[slash_pos + 1..]),
                Err(_) => PathBuf::from(path),
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BackendMode;
    use std::collections::HashMap;
    use std::io::Write;

    fn parse(toml: &str) -> Result<UbusdConfig, ConfigError> {
        let mut config = UbusdConfig::default();
        overlay_toml(&mut config, toml, Path::new("test.toml"))?;
        Ok(config)
    }

    #[test]
    fn test_expand_path_tilde() {
        let expanded = expand_path("~/test/path");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.to_string_lossy().contains("test/path"));
    }

    #[test]
    fn test_expand_path_absolute() {
        let expanded = expand_path("/absolute/path");
        assert_eq!(expanded, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config = parse(
            r#"
[paths]
objects_file = "/etc/custom.json"
"#,
        )
        .unwrap();
        assert_eq!(config.paths.objects_file, PathBuf::from("/etc/custom.json"));
        // Other values should be defaults
        assert_eq!(config.bus.endpoint, "tcp://127.0.0.1:5590");
    }

    #[test]
    fn test_parse_full_toml() {
        let config = parse(
            r#"
[paths]
objects_file = "/data/objects.json"
callback_script = "/data/cb.lua"
rpc_script = "/data/rpc.lua"

[bus]
endpoint = "tcp://0.0.0.0:6000"

[broker]
address = "broker.lan:1883"
client_id = "gw-7"
keepalive_secs = 30
request_topic = "up"
response_topic = "down"

[backend]
mode = "remote"
remote_module = "gw"
remote_function = "invoke"
call_timeout_ms = 2500
sandbox = true

[telemetry]
log_level = "debug"
otlp_endpoint = "collector:4317"
"#,
        )
        .unwrap();

        assert_eq!(config.paths.callback_script, PathBuf::from("/data/cb.lua"));
        assert_eq!(config.paths.rpc_script, PathBuf::from("/data/rpc.lua"));
        assert_eq!(config.bus.endpoint, "tcp://0.0.0.0:6000");
        assert_eq!(config.broker.address, "broker.lan:1883");
        assert_eq!(config.broker.client_id, "gw-7");
        assert_eq!(config.broker.keepalive_secs, 30);
        assert_eq!(config.broker.request_topic, "up");
        assert_eq!(config.broker.response_topic, "down");
        assert_eq!(config.broker.will_message, "goodbye");
        assert_eq!(config.backend.mode, BackendMode::Remote);
        assert_eq!(config.backend.remote_module, "gw");
        assert_eq!(config.backend.remote_function, "invoke");
        assert_eq!(config.backend.call_timeout_ms, 2500);
        assert!(config.backend.sandbox);
        assert_eq!(config.telemetry.log_level, "debug");
        assert_eq!(config.telemetry.otlp(), Some("collector:4317"));
    }

    #[test]
    fn test_wrong_type_is_reported() {
        let err = parse("[broker]\nkeepalive_secs = \"soon\"\n").unwrap_err();
        assert!(err.to_string().contains("broker.keepalive_secs"), "{}", err);

        let err = parse("[backend]\nmode = \"telepathy\"\n").unwrap_err();
        assert!(err.to_string().contains("telepathy"), "{}", err);
    }

    #[test]
    fn test_later_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.toml");
        let second = dir.path().join("second.toml");
        std::fs::File::create(&first)
            .unwrap()
            .write_all(b"[broker]\naddress = \"a:1883\"\nclient_id = \"first\"\n")
            .unwrap();
        std::fs::File::create(&second)
            .unwrap()
            .write_all(b"[broker]\naddress = \"b:1883\"\n")
            .unwrap();

        let mut config = UbusdConfig::default();
        overlay_file(&mut config, &first).unwrap();
        overlay_file(&mut config, &second).unwrap();

        assert_eq!(config.broker.address, "b:1883");
        assert_eq!(config.broker.client_id, "first");
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let mut config = UbusdConfig::default();
        let err = overlay_file(&mut config, Path::new("/nonexistent/iot-ubusd.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { .. }));
    }

    #[test]
    fn test_env_overrides_recorded() {
        let env: HashMap<&str, &str> = [
            ("IOT_UBUSD_BACKEND", "remote"),
            ("IOT_UBUSD_MQTT_KEEPALIVE", "12"),
            ("IOT_UBUSD_REMOTE_MODULE", "edge"),
        ]
        .into_iter()
        .collect();

        let mut config = UbusdConfig::default();
        let mut sources = ConfigSources::default();
        apply_overrides_from(&mut config, &mut sources, |k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.backend.mode, BackendMode::Remote);
        assert_eq!(config.broker.keepalive_secs, 12);
        assert_eq!(config.backend.remote_module, "edge");
        assert_eq!(
            sources.env_overrides,
            vec![
                "IOT_UBUSD_MQTT_KEEPALIVE".to_string(),
                "IOT_UBUSD_BACKEND".to_string(),
                "IOT_UBUSD_REMOTE_MODULE".to_string(),
            ]
        );
    }
}
