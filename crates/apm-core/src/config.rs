//! Configuration for the APM agent
//!
//! Provides:
//! - Typed keys with documented defaults
//! - Config file discovery (explicit path, env var, standard paths)
//! - TOML parsing
//! - Environment variable overrides (`APM_*`)
//!
//! Lookups never fail: a missing key yields its default, and consumers fall
//! back to the default again when a configured value has the wrong shape.

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// URI reporting: only the path component
pub const URI_REPORTING_PATH_ONLY: &str = "path";
/// URI reporting: path and query string as received
pub const URI_REPORTING_FULL_PATH: &str = "full-path";
/// URI reporting: path and query string with sensitive parameters masked
pub const URI_REPORTING_FILTERED: &str = "filtered-params";

/// Query parameters masked by default under `filtered-params`
pub const DEFAULT_FILTERED_PARAMETERS: &[&str] = &[
    "access",
    "access_token",
    "api_key",
    "apikey",
    "auth",
    "auth_token",
    "card[number]",
    "certificate",
    "credentials",
    "crypt",
    "key",
    "mysql_pwd",
    "otp",
    "passwd",
    "password",
    "private",
    "protected",
    "salt",
    "secret",
    "ssn",
    "stripetoken",
    "token",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Bool,
    Integer,
    List,
    Text,
}

/// Known configuration keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    /// Whether request batches are sent at all
    Monitor,
    /// Application name
    Name,
    /// Account key
    Key,
    /// Log level: trace, debug, info, warn, error
    LogLevel,
    /// Host name reported with errors
    Hostname,
    /// Deployed revision reported with errors
    RevisionSha,
    /// One of `path`, `full-path`, `filtered-params`
    UriReporting,
    /// Query parameters masked under `filtered-params`
    UriFilteredParameters,
    /// Enable exception capture
    ErrorsEnabled,
    /// Exception class names never captured
    ErrorsIgnoredExceptions,
    /// Number of queued errors that triggers a flush
    ErrorsBatchSize,
    /// Request path prefixes that are not instrumented
    Ignore,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 12] = [
        ConfigKey::Monitor,
        ConfigKey::Name,
        ConfigKey::Key,
        ConfigKey::LogLevel,
        ConfigKey::Hostname,
        ConfigKey::RevisionSha,
        ConfigKey::UriReporting,
        ConfigKey::UriFilteredParameters,
        ConfigKey::ErrorsEnabled,
        ConfigKey::ErrorsIgnoredExceptions,
        ConfigKey::ErrorsBatchSize,
        ConfigKey::Ignore,
    ];

    /// Name used in config files
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigKey::Monitor => "monitor",
            ConfigKey::Name => "name",
            ConfigKey::Key => "key",
            ConfigKey::LogLevel => "log_level",
            ConfigKey::Hostname => "hostname",
            ConfigKey::RevisionSha => "revision_sha",
            ConfigKey::UriReporting => "uri_reporting",
            ConfigKey::UriFilteredParameters => "uri_filtered_parameters",
            ConfigKey::ErrorsEnabled => "errors_enabled",
            ConfigKey::ErrorsIgnoredExceptions => "errors_ignored_exceptions",
            ConfigKey::ErrorsBatchSize => "errors_batch_size",
            ConfigKey::Ignore => "ignore",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == name)
    }

    /// Environment variable overriding this key, e.g. `APM_ERRORS_ENABLED`
    pub fn env_var(self) -> String {
        format!("APM_{}", self.as_str().to_uppercase())
    }

    /// Documented default, `None` when the key is unset by default
    pub fn default_value(self) -> Option<Value> {
        match self {
            ConfigKey::Monitor => Some(json!(false)),
            ConfigKey::LogLevel => Some(json!("info")),
            ConfigKey::UriReporting => Some(json!(URI_REPORTING_FILTERED)),
            ConfigKey::UriFilteredParameters => Some(json!(DEFAULT_FILTERED_PARAMETERS)),
            ConfigKey::ErrorsEnabled => Some(json!(false)),
            ConfigKey::ErrorsIgnoredExceptions => Some(json!([])),
            ConfigKey::ErrorsBatchSize => Some(json!(5)),
            ConfigKey::Ignore => Some(json!([])),
            ConfigKey::Name | ConfigKey::Key | ConfigKey::Hostname | ConfigKey::RevisionSha => {
                None
            }
        }
    }

    fn kind(self) -> ValueKind {
        match self {
            ConfigKey::Monitor | ConfigKey::ErrorsEnabled => ValueKind::Bool,
            ConfigKey::ErrorsBatchSize => ValueKind::Integer,
            ConfigKey::UriFilteredParameters
            | ConfigKey::ErrorsIgnoredExceptions
            | ConfigKey::Ignore => ValueKind::List,
            ConfigKey::Name
            | ConfigKey::Key
            | ConfigKey::LogLevel
            | ConfigKey::Hostname
            | ConfigKey::RevisionSha
            | ConfigKey::UriReporting => ValueKind::Text,
        }
    }

    /// Coerce a raw environment string into the shape this key expects.
    /// Strings that don't parse are kept as-is for consumers to reject.
    fn coerce(self, raw: &str) -> Value {
        let trimmed = raw.trim();
        match self.kind() {
            ValueKind::Bool => match trimmed.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Value::Bool(true),
                "false" | "0" | "no" | "off" | "" => Value::Bool(false),
                _ => Value::String(raw.to_string()),
            },
            ValueKind::Integer => trimmed
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::String(raw.to_string())),
            ValueKind::List => {
                if trimmed.starts_with('[') {
                    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(raw.to_string()))
                } else {
                    Value::Array(
                        trimmed
                            .split(',')
                            .map(str::trim)
                            .filter(|item| !item.is_empty())
                            .map(|item| Value::String(item.to_string()))
                            .collect(),
                    )
                }
            }
            ValueKind::Text => Value::String(raw.to_string()),
        }
    }
}

/// Key/value configuration store
#[derive(Debug, Clone, Default)]
pub struct Config {
    values: HashMap<ConfigKey, Value>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from explicit pairs; later pairs win
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (ConfigKey, Value)>,
    {
        let mut config = Self::new();
        for (key, value) in pairs {
            config.set(key, value);
        }
        config
    }

    /// Parse a flat TOML table of `key = value` entries
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let table: toml::Table = toml::from_str(content)?;
        let mut config = Self::new();

        for (name, value) in table {
            match ConfigKey::from_name(&name) {
                Some(key) => {
                    let value = serde_json::to_value(value).map_err(|e| {
                        ConfigError::ValidationError(format!("Unreadable value for {}: {}", name, e))
                    })?;
                    config.set(key, value);
                }
                None => warn!("Ignoring unknown configuration key: {}", name),
            }
        }

        Ok(config)
    }

    pub fn set(&mut self, key: ConfigKey, value: Value) {
        self.values.insert(key, value);
    }

    /// Configured value, or the key's default
    pub fn get(&self, key: ConfigKey) -> Option<Value> {
        self.values
            .get(&key)
            .cloned()
            .or_else(|| key.default_value())
    }

    /// Configured value deserialized as `T`; `None` when unset or the wrong shape
    pub fn get_as<T: DeserializeOwned>(&self, key: ConfigKey) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    /// Like [`Config::get_as`], but falls back to the key's default when the
    /// configured value has the wrong shape
    pub fn get_or_default<T: DeserializeOwned>(&self, key: ConfigKey) -> Option<T> {
        self.get_as(key).or_else(|| {
            if self.values.contains_key(&key) {
                debug!("Malformed value for {}, using default", key.as_str());
            }
            key.default_value()
                .and_then(|v| serde_json::from_value(v).ok())
        })
    }

    /// Overlay `other` on top of this config
    pub fn merge(&mut self, other: Config) {
        self.values.extend(other.values);
    }

    /// Apply `APM_*` environment variables
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for key in ConfigKey::ALL {
            if let Some(raw) = lookup(&key.env_var()) {
                self.set(key, key.coerce(&raw));
            }
        }
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Explicit config path (e.g. passed by the host application)
    explicit_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self {
            explicit_path: None,
        }
    }

    /// Set an explicit config path
    pub fn with_path(mut self, path: Option<PathBuf>) -> Self {
        self.explicit_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. Environment variables (`APM_*`)
    /// 2. Config file: explicit path, `APM_CONFIG`,
    ///    `~/.config/apm-agent/config.toml`, `/etc/apm-agent/config.toml`
    /// 3. Default values
    pub fn load(&self) -> ConfigResult<Config> {
        let mut config = if let Some(path) = self.find_config_file() {
            info!("Loading configuration from: {}", path.display());
            self.load_from_file(&path)?
        } else {
            debug!("No config file found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();

        self.validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.explicit_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("Config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("APM_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("APM_CONFIG path does not exist: {}", env_path);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let path = config_dir.join("apm-agent").join("config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/apm-agent/config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Load configuration from a TOML file
    fn load_from_file(&self, path: &Path) -> ConfigResult<Config> {
        let content = std::fs::read_to_string(path)?;
        Config::from_toml_str(&content)
    }

    /// Reject settings that would break the agent itself. Shape problems in
    /// feature settings are left to consumers, which fall back to defaults.
    fn validate(&self, config: &Config) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if let Some(level) = config.get_as::<String>(ConfigKey::LogLevel) {
            if !valid_levels.contains(&level.to_lowercase().as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}. Must be one of: {:?}",
                    level, valid_levels
                )));
            }
        }

        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper module for platform-specific directories
mod dirs {
    use std::path::PathBuf;

    /// Get the user's config directory
    pub fn config_dir() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }

        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }

        #[cfg(target_os = "windows")]
        {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            None
        }
    }
}
