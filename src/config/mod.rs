//! Configuration management.
//!
//! Engine configuration can come from:
//! - Config file (~/.config/stepwise/config.toml)
//! - Environment variables (STEPWISE_*)
//!
//! Every value has a default, so an absent file is not an error.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Defaults for `apiCall` steps
    #[serde(default)]
    pub http: HttpSettings,

    /// Defaults for `cliCommand` steps
    #[serde(default)]
    pub command: CommandSettings,

    /// Defaults for `fileOperation` steps
    #[serde(default)]
    pub files: FileSettings,

    /// Log output settings
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

/// HTTP defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpSettings {
    /// Request timeout in milliseconds when a step sets none
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_http_timeout_ms(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_http_timeout_ms() -> u64 {
    30_000
}

fn default_user_agent() -> String {
    format!("stepwise/{}", env!("CARGO_PKG_VERSION"))
}

/// Child process defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandSettings {
    /// Shell used to interpret commands
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Timeout in milliseconds when a step sets none
    #[serde(default = "default_command_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum bytes captured per stream before truncation
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            timeout_ms: default_command_timeout_ms(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

fn default_shell() -> String {
    if cfg!(windows) {
        "cmd".to_string()
    } else {
        "sh".to_string()
    }
}

fn default_command_timeout_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_max_output_bytes() -> usize {
    10 * 1024 * 1024
}

/// Filesystem defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileSettings {
    /// Largest file `read` will load into memory
    #[serde(default = "default_max_read_bytes")]
    pub max_read_bytes: u64,
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            max_read_bytes: default_max_read_bytes(),
        }
    }
}

fn default_max_read_bytes() -> u64 {
    10 * 1024 * 1024
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySettings {
    /// `EnvFilter` directive used when neither STEPWISE_LOG nor RUST_LOG is set
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

fn default_filter() -> String {
    "info".to_string()
}

impl EngineConfig {
    /// Load configuration from the default location, then apply env overrides.
    pub fn load() -> Self {
        let mut config = Self::default();

        let primary_path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&primary_path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides();
        config
    }

    /// Load configuration from an explicit file, then apply env overrides.
    ///
    /// Unlike [`EngineConfig::load`], a missing or malformed file is an error.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let partial: PartialConfig = toml::from_str(&content).map_err(|e| {
            Error::Config(format!("Invalid config file {}: {}", path.display(), e))
        })?;

        let mut config = Self::default();
        config.apply_partial(partial);
        config.apply_env_overrides();
        Ok(config)
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("stepwise"))
            .unwrap_or_else(|| PathBuf::from(".stepwise"))
    }

    fn apply_env_overrides(&mut self) {
        if let Some(ms) = env_parse::<u64>("STEPWISE_HTTP_TIMEOUT_MS") {
            self.http.timeout_ms = ms;
        }
        if let Ok(agent) = std::env::var("STEPWISE_HTTP_USER_AGENT") {
            self.http.user_agent = agent;
        }
        if let Ok(shell) = std::env::var("STEPWISE_SHELL") {
            self.command.shell = shell;
        }
        if let Some(ms) = env_parse::<u64>("STEPWISE_COMMAND_TIMEOUT_MS") {
            self.command.timeout_ms = ms;
        }
        if let Some(bytes) = env_parse::<usize>("STEPWISE_MAX_OUTPUT_BYTES") {
            self.command.max_output_bytes = bytes;
        }
        if let Some(bytes) = env_parse::<u64>("STEPWISE_MAX_READ_BYTES") {
            self.files.max_read_bytes = bytes;
        }
        if let Ok(json) = std::env::var("STEPWISE_LOG_JSON") {
            self.telemetry.json = json.eq_ignore_ascii_case("true");
        }
    }

    fn load_partial_from_path(path: &Path) -> std::result::Result<PartialConfig, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        toml::from_str(&content).map_err(|_| ())
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(http) = partial.http {
            self.http = http;
        }
        if let Some(command) = partial.command {
            self.command = command;
        }
        if let Some(files) = partial.files {
            self.files = files;
        }
        if let Some(telemetry) = partial.telemetry {
            self.telemetry = telemetry;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    http: Option<HttpSettings>,
    command: Option<CommandSettings>,
    files: Option<FileSettings>,
    telemetry: Option<TelemetrySettings>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.http.timeout_ms, 30_000);
        assert_eq!(config.command.max_output_bytes, 10 * 1024 * 1024);
        assert_eq!(config.files.max_read_bytes, 10 * 1024 * 1024);
        assert!(config.http.user_agent.starts_with("stepwise/"));
    }

    #[test]
    fn test_load_partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[command]
shell = "bash"
timeout_ms = 1000
"#
        )
        .unwrap();

        let config = EngineConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.command.shell, "bash");
        assert_eq!(config.command.timeout_ms, 1000);
        // Field missing from the table falls back to its default
        assert_eq!(config.command.max_output_bytes, 10 * 1024 * 1024);
        assert_eq!(config.http, HttpSettings::default());
    }

    #[test]
    fn test_load_from_missing_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = EngineConfig::load_from_path(&dir.path().join("nope.toml")).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_load_malformed_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[http\ntimeout_ms = ").unwrap();
        assert!(EngineConfig::load_from_path(file.path()).is_err());
    }
}
