//! Storage proxy configuration.
//!
//! The proxy is configured from a single TOML file with kebab-case keys:
//!
//! ```toml
//! [storage-proxy]
//! node-id = "i-storage-01"
//! num-proc = 4
//! secret = "some-secret"
//! session-expire = "1d"
//!
//! [api.client]
//! service-addr = "0.0.0.0:6021"
//!
//! [api.manager]
//! service-addr = "127.0.0.1:6022"
//! secret = "manager-secret"
//!
//! [volume.local]
//! backend = "vfs"
//! path = "/vfroot/local"
//! ```
//!
//! Parsing only checks shape; [`Config::validate`] checks values.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use storage_proxy_volume::{KNOWN_BACKENDS, VolumeContext, VolumeInfo};

/// Environment variable overriding `logging.level`.
pub const LOG_LEVEL_ENV: &str = "STORAGE_PROXY_LOG";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("node-id must not be empty")]
    EmptyNodeId,

    #[error("node-id may only contain ASCII letters, digits, '.', '-' and '_', got {0:?}")]
    InvalidNodeId(String),

    #[error("secret must not be empty")]
    EmptySecret,

    #[error("num-proc must be between 1 and {max}, got {got}")]
    InvalidNumProc { got: usize, max: usize },

    #[error("max-upload-size must be greater than 0")]
    InvalidMaxUploadSize,

    #[error("session-expire must be greater than 0")]
    InvalidSessionExpire,

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("{section}: service-addr must be host:port, got {addr}")]
    InvalidServiceAddr { section: &'static str, addr: String },

    #[error("{0}: ssl-enabled requires both ssl-cert and ssl-privkey")]
    MissingSslFiles(&'static str),

    #[error("api.manager: secret must not be empty")]
    EmptyManagerSecret,

    #[error("at least one [volume.<name>] section is required")]
    NoVolumes,

    #[error("volume {name}: unknown backend {backend}")]
    UnknownBackend { name: String, backend: String },

    #[error("volume {name}: path must be absolute, got {path}")]
    RelativeVolumePath { name: String, path: String },

    #[error("volume {name}: fsprefix must be relative and must not contain '..', got {fsprefix}")]
    InvalidFsPrefix { name: String, fsprefix: String },
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Process-wide settings.
    pub storage_proxy: ProxyConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Listener settings, consumed by the transport layer.
    pub api: ApiConfig,

    /// Volume name → volume description.
    #[serde(default)]
    pub volume: BTreeMap<String, VolumeInfo>,

    #[serde(default)]
    pub debug: DebugConfig,
}

/// The `[storage-proxy]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ProxyConfig {
    /// Identity of this proxy node.
    pub node_id: String,

    /// Number of worker units (default: CPU count).
    #[serde(default = "default_num_proc")]
    pub num_proc: usize,

    /// Where to write the process id, if anywhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid_file: Option<PathBuf>,

    /// Maximum entries per directory scan (0 = unlimited).
    #[serde(default = "default_scandir_limit")]
    pub scandir_limit: usize,

    /// Maximum size of one uploaded file.
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: ByteSize,

    /// Token signing secret, used by the transport layer.
    pub secret: String,

    /// Idle lifetime of upload sessions.
    pub session_expire: HumanDuration,
}

/// The `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset.
    pub level: String,

    /// Output format.
    pub format: LogFormat,
}

/// Log line layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Full format with span context.
    #[default]
    Text,
    /// Compact single-line format.
    Compact,
}

/// The `[api]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    pub client: ApiEndpoint,
    pub manager: ManagerEndpoint,
}

/// One listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ApiEndpoint {
    /// `host:port`; a blank host binds every interface.
    pub service_addr: String,

    #[serde(default)]
    pub ssl_enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_cert: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_privkey: Option<PathBuf>,
}

/// The manager-facing listener, authenticated by a shared secret.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ManagerEndpoint {
    #[serde(flatten)]
    pub endpoint: ApiEndpoint,

    pub secret: String,
}

/// The `[debug]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Lower the default log level to `debug`.
    pub enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

fn default_num_proc() -> usize {
    max_num_proc()
}

fn default_scandir_limit() -> usize {
    1000
}

fn default_max_upload_size() -> ByteSize {
    ByteSize(100 * 1024 * 1024 * 1024) // 100g
}

/// Upper bound for `num-proc`.
pub fn max_num_proc() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Overrides present in the environment, as `(variable, value)` pairs.
///
/// Supported variables:
/// - STORAGE_PROXY_LOG: Override the log level
///
/// Loading runs before logging is up, so the binary reports these itself
/// once the subscriber is installed.
pub fn env_overrides() -> Vec<(&'static str, String)> {
    [LOG_LEVEL_ENV]
        .into_iter()
        .filter_map(|var| match std::env::var(var) {
            Ok(value) if !value.is_empty() => Some((var, value)),
            _ => None,
        })
        .collect()
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(&env_overrides());
    }

    /// Apply `(variable, value)` overrides; unknown variables are ignored.
    pub fn apply_overrides(&mut self, overrides: &[(&str, String)]) {
        for (var, value) in overrides {
            if *var == LOG_LEVEL_ENV {
                self.logging.level = value.clone();
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let proxy = &self.storage_proxy;
        if proxy.node_id.trim().is_empty() {
            return Err(ConfigError::EmptyNodeId);
        }
        // Used as a directory name on shared volumes
        let node_id_ok = proxy
            .node_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
        if !node_id_ok || proxy.node_id == "." || proxy.node_id == ".." {
            return Err(ConfigError::InvalidNodeId(proxy.node_id.clone()));
        }
        if proxy.secret.is_empty() {
            return Err(ConfigError::EmptySecret);
        }

        let max = max_num_proc();
        if proxy.num_proc < 1 || proxy.num_proc > max {
            return Err(ConfigError::InvalidNumProc {
                got: proxy.num_proc,
                max,
            });
        }
        if proxy.max_upload_size.0 == 0 {
            return Err(ConfigError::InvalidMaxUploadSize);
        }
        if proxy.session_expire.0.is_zero() {
            return Err(ConfigError::InvalidSessionExpire);
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        self.api.client.validate("api.client")?;
        self.api.manager.endpoint.validate("api.manager")?;
        if self.api.manager.secret.is_empty() {
            return Err(ConfigError::EmptyManagerSecret);
        }

        if self.volume.is_empty() {
            return Err(ConfigError::NoVolumes);
        }
        for (name, info) in &self.volume {
            validate_volume(name, info)?;
        }

        Ok(())
    }

    /// Load and validate configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config = Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.apply_env_overrides();
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no validation).
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// Settings every volume receives at construction.
    pub fn volume_context(&self) -> VolumeContext {
        VolumeContext {
            node_id: self.storage_proxy.node_id.clone(),
            scandir_limit: self.storage_proxy.scandir_limit,
            max_upload_size: self.storage_proxy.max_upload_size.0,
            session_expire: self.storage_proxy.session_expire.0,
        }
    }

    /// Volume name and description pairs, in name order.
    pub fn volume_infos(&self) -> Vec<(String, VolumeInfo)> {
        self.volume
            .iter()
            .map(|(name, info)| (name.clone(), info.clone()))
            .collect()
    }

    /// Level used when `RUST_LOG` is unset.
    pub fn default_log_level(&self) -> &str {
        if self.debug.enabled {
            "debug"
        } else {
            &self.logging.level
        }
    }
}

impl ApiEndpoint {
    fn validate(&self, section: &'static str) -> Result<(), ConfigError> {
        if parse_service_addr(&self.service_addr).is_none() {
            return Err(ConfigError::InvalidServiceAddr {
                section,
                addr: self.service_addr.clone(),
            });
        }
        if self.ssl_enabled && (self.ssl_cert.is_none() || self.ssl_privkey.is_none()) {
            return Err(ConfigError::MissingSslFiles(section));
        }
        Ok(())
    }
}

/// Split `host:port`. A blank host is allowed and means "all interfaces".
pub fn parse_service_addr(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    Some((host.to_string(), port))
}

fn validate_volume(name: &str, info: &VolumeInfo) -> Result<(), ConfigError> {
    if !KNOWN_BACKENDS.contains(&info.backend.as_str()) {
        return Err(ConfigError::UnknownBackend {
            name: name.to_string(),
            backend: info.backend.clone(),
        });
    }
    if !info.path.is_absolute() {
        return Err(ConfigError::RelativeVolumePath {
            name: name.to_string(),
            path: info.path.display().to_string(),
        });
    }
    if let Some(prefix) = &info.fsprefix {
        let bad = prefix
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if bad {
            return Err(ConfigError::InvalidFsPrefix {
                name: name.to_string(),
                fsprefix: prefix.display().to_string(),
            });
        }
    }
    Ok(())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

// ============================================================================
// Value types
// ============================================================================

/// A byte count written as an integer or with a binary suffix (`"100g"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawValue", into = "String")]
pub struct ByteSize(pub u64);

/// A duration written as seconds or with a unit suffix (`"1d"`, `"30m"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawValue", into = "String")]
pub struct HumanDuration(pub Duration);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawValue {
    Int(u64),
    Str(String),
}

/// Split `"100g"` into `(100, "g")`.
fn split_number(s: &str) -> Option<(u64, String)> {
    let s = s.trim();
    let digits = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let number = s[..digits].parse().ok()?;
    Some((number, s[digits..].trim().to_ascii_lowercase()))
}

impl ByteSize {
    /// Parse `<n>[k|m|g|t|p]`, optionally followed by `b` or `ib`.
    pub fn parse(s: &str) -> Option<Self> {
        let (number, unit) = split_number(s)?;
        let unit = unit
            .strip_suffix("ib")
            .or_else(|| unit.strip_suffix('b'))
            .unwrap_or(&unit);
        let shift = match unit {
            "" => 0,
            "k" => 10,
            "m" => 20,
            "g" => 30,
            "t" => 40,
            "p" => 50,
            _ => return None,
        };
        number.checked_mul(1u64 << shift).map(Self)
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(&str, u32); 5] = [("p", 50), ("t", 40), ("g", 30), ("m", 20), ("k", 10)];
        for (suffix, shift) in UNITS {
            let unit = 1u64 << shift;
            if self.0 >= unit && self.0 % unit == 0 {
                return write!(f, "{}{}", self.0 / unit, suffix);
            }
        }
        write!(f, "{}", self.0)
    }
}

impl TryFrom<RawValue> for ByteSize {
    type Error = String;

    fn try_from(raw: RawValue) -> Result<Self, Self::Error> {
        match raw {
            RawValue::Int(n) => Ok(Self(n)),
            RawValue::Str(s) => Self::parse(&s).ok_or_else(|| format!("invalid size: {s:?}")),
        }
    }
}

impl From<ByteSize> for String {
    fn from(size: ByteSize) -> Self {
        size.to_string()
    }
}

impl HumanDuration {
    /// Parse `<n>[s|m|h|d|w]`; a bare number is seconds.
    pub fn parse(s: &str) -> Option<Self> {
        let (number, unit) = split_number(s)?;
        let secs_per_unit: u64 = match unit.as_str() {
            "" | "s" => 1,
            "m" => 60,
            "h" => 60 * 60,
            "d" => 24 * 60 * 60,
            "w" => 7 * 24 * 60 * 60,
            _ => return None,
        };
        number
            .checked_mul(secs_per_unit)
            .map(|secs| Self(Duration::from_secs(secs)))
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        const UNITS: [(&str, u64); 4] = [
            ("w", 7 * 24 * 60 * 60),
            ("d", 24 * 60 * 60),
            ("h", 60 * 60),
            ("m", 60),
        ];
        for (suffix, unit) in UNITS {
            if secs >= unit && secs % unit == 0 {
                return write!(f, "{}{}", secs / unit, suffix);
            }
        }
        write!(f, "{secs}s")
    }
}

impl TryFrom<RawValue> for HumanDuration {
    type Error = String;

    fn try_from(raw: RawValue) -> Result<Self, Self::Error> {
        match raw {
            RawValue::Int(n) => Ok(Self(Duration::from_secs(n))),
            RawValue::Str(s) => Self::parse(&s).ok_or_else(|| format!("invalid duration: {s:?}")),
        }
    }
}

impl From<HumanDuration> for String {
    fn from(d: HumanDuration) -> Self {
        d.to_string()
    }
}
