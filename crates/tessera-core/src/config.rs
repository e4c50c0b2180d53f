//! Client configuration
//!
//! Loaded from `<config_dir>/config.toml` when present, then overridden from
//! `TESSERA_*` environment variables. Durations are written in seconds.

use crate::region::RegionStyle;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the upstream URI
pub const ENV_UPSTREAM: &str = "TESSERA_UPSTREAM";
/// Environment variable forcing offline mode
pub const ENV_OFFLINE_MODE: &str = "TESSERA_OFFLINE_MODE";
/// Environment variable overriding the auto-connect policy
pub const ENV_AUTO_CONNECT: &str = "TESSERA_AUTO_CONNECT";
/// Environment variable holding a forced key (`GUEST` for guest login)
pub const ENV_AUTH_KEY: &str = "TESSERA_AUTH_KEY";
/// Environment variable enabling communication output
pub const ENV_VERBOSE: &str = "TESSERA_VERBOSE";
/// Environment variable enabling developer output
pub const ENV_DEBUG: &str = "TESSERA_DEBUG";
/// Environment variable overriding the configuration directory
pub const ENV_CONFIG_DIR: &str = "TESSERA_CONFIG_DIR";
/// Environment variable overriding the initial chunk size
pub const ENV_TRANSFER_CHUNK_SIZE: &str = "TESSERA_TRANSFER_CHUNK_SIZE";
/// Environment variable overriding the default region style
pub const ENV_MEMORY_STYLE: &str = "TESSERA_MEMORY_STYLE";
/// Environment variable overriding where file-backed regions live
pub const ENV_FILEGRAPH_PATH: &str = "TESSERA_FILEGRAPH_PATH";

/// When to open the upstream connection without an explicit request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoConnect {
    /// Connect when credentials are already available
    #[default]
    Auto,
    /// Always connect, prompting for credentials if needed
    Always,
    /// Only connect on explicit request
    Off,
}

impl std::str::FromStr for AutoConnect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "always" => Ok(Self::Always),
            "off" | "never" | "false" => Ok(Self::Off),
            other => Err(Error::config(format!("Unknown auto-connect policy '{}'", other))),
        }
    }
}

/// Login and credential settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    /// Auto-connect policy
    pub auto_connect: AutoConnect,
    /// First port tried by the local auth callback listener
    pub auth_port_start: u16,
    /// Last port tried by the local auth callback listener
    pub auth_port_end: u16,
    /// How long the interactive login waits for the browser
    #[serde(with = "secs")]
    pub auth_timeout: Duration,
    /// Where refresh tokens are exchanged for bearer tokens
    pub token_endpoint: Option<String>,
    /// Page opened in the browser for interactive login
    pub login_page: Option<String>,
    /// Launch a browser for interactive login; the URL is logged either way
    pub open_browser: bool,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            auto_connect: AutoConnect::Auto,
            auth_port_start: 7000,
            auth_port_end: 9000,
            auth_timeout: Duration::from_secs(300),
            token_endpoint: None,
            login_page: None,
            open_browser: true,
        }
    }
}

/// Output switches
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Communication output
    pub verbose: bool,
    /// Developer output, including JSON dumps of outgoing messages
    pub debug: bool,
    /// Emit log lines as JSON
    pub json: bool,
}

/// Adaptive chunked-transfer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Initial chunk size in bytes
    pub size: usize,
    /// Floor for the chunk size in bytes
    pub min_size: usize,
    /// Maximum number of chunks in flight
    pub window: usize,
    /// Divisor applied to the timeout budget when judging round trips
    pub safety_factor: f64,
    /// Inactivity timeout of a single chunk
    #[serde(with = "secs")]
    pub timeout: Duration,
    /// Adapt the chunk size to observed round trips
    pub auto_adjust: bool,
    /// Window after which the transfer-speed accumulator is rescaled
    #[serde(with = "secs")]
    pub speed_window: Duration,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            size: 10 * 1024,
            min_size: 1024,
            window: 10,
            safety_factor: 5.0,
            timeout: Duration::from_secs(10),
            auto_adjust: true,
            speed_window: Duration::from_secs(300),
        }
    }
}

/// Graph synchronization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Attempts per `send_update`
    pub max_attempts: u32,
    /// Pause between attempts
    #[serde(with = "secs")]
    pub retry_backoff: Duration,
    /// Period of the background sync loop
    #[serde(with = "secs")]
    pub interval: Duration,
    /// Inactivity timeout for a whole update
    #[serde(with = "secs")]
    pub update_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            interval: Duration::from_secs(1),
            update_timeout: Duration::from_secs(60),
        }
    }
}

/// Region settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Style used when a graph is opened without an explicit one
    pub memory_style: Option<RegionStyle>,
    /// Directory holding file-backed regions
    pub filegraph_dir: Option<PathBuf>,
    /// Reserved address range per graph
    pub max_region_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            memory_style: None,
            filegraph_dir: None,
            max_region_size: crate::region::DEFAULT_MAX_REGION_SIZE,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Upstream URI; no upstream activity when unset
    pub upstream_uri: Option<String>,
    /// Disable all upstream activity
    pub offline_mode: bool,
    /// Directory for credentials and the forced key file
    pub config_dir: Option<PathBuf>,
    /// Default inactivity timeout for upstream requests
    #[serde(with = "secs")]
    pub generic_timeout: Duration,
    /// Wait after which an indefinite wait logs a one-time warning
    #[serde(with = "secs")]
    pub wait_grace_period: Duration,
    /// Login settings
    pub login: LoginConfig,
    /// Output switches
    pub logging: LoggingConfig,
    /// Chunked transfer settings
    pub chunking: ChunkingConfig,
    /// Sync settings
    pub sync: SyncConfig,
    /// Region settings
    pub storage: StorageConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            upstream_uri: None,
            offline_mode: false,
            config_dir: None,
            generic_timeout: Duration::from_secs(30),
            wait_grace_period: Duration::from_secs(3),
            login: LoginConfig::default(),
            logging: LoggingConfig::default(),
            chunking: ChunkingConfig::default(),
            sync: SyncConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load from a TOML file (default location when `None`), then apply
    /// environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path(),
        };

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)?;
            toml::from_str(&content)
                .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?
        } else {
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Default configuration file location
    pub fn default_path() -> PathBuf {
        default_config_dir().join("config.toml")
    }

    /// Apply `TESSERA_*` overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source
    pub fn apply_env_from<F>(&mut self, get: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(uri) = get(ENV_UPSTREAM) {
            self.upstream_uri = (!uri.is_empty()).then_some(uri);
        }
        if let Some(flag) = get(ENV_OFFLINE_MODE).and_then(|v| parse_bool(ENV_OFFLINE_MODE, &v)) {
            self.offline_mode = flag;
        }
        if let Some(policy) = get(ENV_AUTO_CONNECT) {
            match policy.parse() {
                Ok(policy) => self.login.auto_connect = policy,
                Err(e) => tracing::warn!("Ignoring {}: {}", ENV_AUTO_CONNECT, e),
            }
        }
        if let Some(flag) = get(ENV_VERBOSE).and_then(|v| parse_bool(ENV_VERBOSE, &v)) {
            self.logging.verbose = flag;
        }
        if let Some(flag) = get(ENV_DEBUG).and_then(|v| parse_bool(ENV_DEBUG, &v)) {
            self.logging.debug = flag;
        }
        if let Some(dir) = get(ENV_CONFIG_DIR).filter(|d| !d.is_empty()) {
            self.config_dir = Some(PathBuf::from(dir));
        }
        if let Some(size) = get(ENV_TRANSFER_CHUNK_SIZE) {
            match size.parse::<usize>() {
                Ok(size) => self.chunking.size = size,
                Err(_) => tracing::warn!("Ignoring {}='{}'", ENV_TRANSFER_CHUNK_SIZE, size),
            }
        }
        if let Some(style) = get(ENV_MEMORY_STYLE).filter(|s| !s.is_empty()) {
            match style.parse() {
                Ok(style) => self.storage.memory_style = Some(style),
                Err(_) => tracing::warn!(
                    "Don't understand {}='{}'. Using default",
                    ENV_MEMORY_STYLE,
                    style
                ),
            }
        }
        if let Some(dir) = get(ENV_FILEGRAPH_PATH).filter(|d| !d.is_empty()) {
            self.storage.filegraph_dir = Some(PathBuf::from(dir));
        }
    }

    /// Set the upstream URI
    pub fn with_upstream(mut self, uri: impl Into<String>) -> Self {
        self.upstream_uri = Some(uri.into());
        self
    }

    /// Set the configuration directory
    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    /// Set the auto-connect policy
    pub fn with_auto_connect(mut self, policy: AutoConnect) -> Self {
        self.login.auto_connect = policy;
        self
    }

    /// Enable/disable offline mode
    pub fn with_offline_mode(mut self, offline: bool) -> Self {
        self.offline_mode = offline;
        self
    }

    /// Directory holding credentials and the forced key file
    pub fn config_dir(&self) -> PathBuf {
        self.config_dir.clone().unwrap_or_else(default_config_dir)
    }

    /// Host portion of the upstream URI, used to scope stored credentials
    pub fn upstream_name(&self) -> String {
        match self.upstream_uri.as_deref() {
            None | Some("") => "LOCAL".to_string(),
            Some(uri) => {
                let rest = uri.split_once("//").map_or(uri, |(_, rest)| rest);
                rest.split('/').next().unwrap_or(rest).to_string()
            }
        }
    }

    /// Location of the forced key file
    pub fn forced_key_path(&self) -> PathBuf {
        self.config_dir().join("auth.key")
    }

    /// Location of the credentials file for the configured upstream
    pub fn credentials_path(&self) -> PathBuf {
        self.config_dir()
            .join(self.upstream_name())
            .join("credentials")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.login.auth_port_start > self.login.auth_port_end {
            return Err(Error::config("auth_port_start must not exceed auth_port_end"));
        }
        for (key, value) in [
            ("generic_timeout", self.generic_timeout),
            ("chunking.timeout", self.chunking.timeout),
            ("sync.update_timeout", self.sync.update_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::config(format!("{} must be greater than zero", key)));
            }
        }
        if self.chunking.min_size == 0 {
            return Err(Error::config("chunking.min_size must be at least 1"));
        }
        if self.chunking.window < 2 {
            return Err(Error::config("chunking.window must be at least 2"));
        }
        if self.chunking.safety_factor < 1.0 {
            return Err(Error::config("chunking.safety_factor must be at least 1"));
        }
        if self.sync.max_attempts == 0 {
            return Err(Error::config("sync.max_attempts must be at least 1"));
        }
        if self.storage.max_region_size == 0
            || self.storage.max_region_size % crate::region::PAGE_SIZE != 0
        {
            return Err(Error::config(
                "storage.max_region_size must be a positive multiple of the page size",
            ));
        }
        Ok(())
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tessera")
}

fn parse_bool(key: &str, value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "" | "0" | "false" | "no" | "off" => Some(false),
        other => {
            tracing::warn!("Ignoring {}='{}': not a boolean", key, other);
            None
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.login.auto_connect, AutoConnect::Auto);
        assert_eq!(config.chunking.size, 10 * 1024);
        assert_eq!(config.sync.max_attempts, 3);
        assert_eq!(config.upstream_name(), "LOCAL");
    }

    #[test]
    fn test_upstream_name_strips_scheme_and_path() {
        let config = ClientConfig::default().with_upstream("wss://hub.example.org:5323/ws");
        assert_eq!(config.upstream_name(), "hub.example.org:5323");

        let config = ClientConfig::default().with_upstream("hub.example.org/x");
        assert_eq!(config.upstream_name(), "hub.example.org");
    }

    #[test]
    fn test_credentials_path_scoped_by_host() {
        let config = ClientConfig::default()
            .with_config_dir("/tmp/tess")
            .with_upstream("tcp://sync.host:4000");
        assert_eq!(
            config.credentials_path(),
            PathBuf::from("/tmp/tess/sync.host:4000/credentials")
        );
        assert_eq!(config.forced_key_path(), PathBuf::from("/tmp/tess/auth.key"));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_UPSTREAM, "tcp://a:1"),
            (ENV_OFFLINE_MODE, "TRUE"),
            (ENV_AUTO_CONNECT, "always"),
            (ENV_VERBOSE, "1"),
            (ENV_TRANSFER_CHUNK_SIZE, "4096"),
            (ENV_MEMORY_STYLE, "file_backed"),
        ]
        .into_iter()
        .collect();

        let mut config = ClientConfig::default();
        config.apply_env_from(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.upstream_uri.as_deref(), Some("tcp://a:1"));
        assert!(config.offline_mode);
        assert_eq!(config.login.auto_connect, AutoConnect::Always);
        assert!(config.logging.verbose);
        assert!(!config.logging.debug);
        assert_eq!(config.chunking.size, 4096);
        assert_eq!(config.storage.memory_style, Some(RegionStyle::FileBacked));
    }

    #[test]
    fn test_bad_env_values_are_ignored() {
        let mut config = ClientConfig::default();
        config.apply_env_from(|k| match k {
            ENV_OFFLINE_MODE => Some("perhaps".into()),
            ENV_AUTO_CONNECT => Some("sometimes".into()),
            ENV_MEMORY_STYLE => Some("MALLOC".into()),
            _ => None,
        });
        assert!(!config.offline_mode);
        assert_eq!(config.login.auto_connect, AutoConnect::Auto);
        assert_eq!(config.storage.memory_style, None);
    }

    #[test]
    #[serial_test::serial]
    fn test_load_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
upstream_uri = "tcp://hub:9"
generic_timeout = 12.5

[login]
auto_connect = "off"
auth_port_start = 7100
auth_port_end = 7200

[chunking]
window = 4
timeout = 2
"#,
        )
        .unwrap();

        let config = ClientConfig::load(Some(&path)).unwrap();
        assert_eq!(config.upstream_uri.as_deref(), Some("tcp://hub:9"));
        assert_eq!(config.generic_timeout, Duration::from_millis(12_500));
        assert_eq!(config.login.auto_connect, AutoConnect::Off);
        assert_eq!(config.login.auth_port_start, 7100);
        assert_eq!(config.chunking.window, 4);
        assert_eq!(config.chunking.timeout, Duration::from_secs(2));
        assert_eq!(config.chunking.min_size, 1024);
    }

    #[test]
    fn test_validate_rejects_bad_ports() {
        let mut config = ClientConfig::default();
        config.login.auth_port_start = 9001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut config = ClientConfig::default();
        config.sync.update_timeout = Duration::ZERO;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = ClientConfig::default();
        config.chunking.timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
