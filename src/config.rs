// Configuration for the collector
//
// Configuration is loaded in order of precedence:
// 1. Environment variables (highest priority)
// 2. Config file (~/.config/logtrail/config.toml)
// 3. Built-in defaults (lowest priority)

use crate::batcher::BatcherConfig;
use crate::ingest::IngestConfig;
use crate::listener::ListenerConfig;
use crate::store::StoreOptions;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Gateway credentials. Loaded here so the whole config lives in one
/// file; enforcement belongs to whatever sits in front of the gateway.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub enabled: bool,
    pub user: String,
    pub password: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user: "admin".to_string(),
            password: String::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the syslog TCP listener binds to
    pub tcp_bind: SocketAddr,

    /// Address the HTTP gateway binds to
    pub http_bind: SocketAddr,

    /// SQLite database file path
    pub db_path: PathBuf,

    /// Records older than this are deleted on periodic cleanup (0 = keep forever)
    pub retention_days: u32,

    /// Upper bound on concurrent TCP connections
    pub max_connections: usize,

    /// Per-line byte cap
    pub max_line_length: usize,

    /// Write batch size
    pub batch_size: usize,

    /// Flush timer for partial batches, in milliseconds
    pub batch_timeout_ms: u64,

    /// Bounded write queue capacity
    pub queue_size: usize,

    /// Write-ahead logging for the store
    pub wal_enabled: bool,

    /// Reject invalid RFC5424 lines (true) or store them leniently (false)
    pub strict_mode: bool,

    /// Per-subscriber live delivery buffer
    pub subscriber_buffer: usize,

    /// Gateway auth settings (enforced by the layer in front of us)
    pub auth: AuthConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Auth settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
struct FileAuth {
    enabled: Option<bool>,
    user: Option<String>,
    password: Option<String>,
}

/// Logging settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
struct FileLogging {
    level: Option<String>,
}

/// Config file structure (everything optional; missing keys fall back)
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    tcp_bind: Option<String>,
    http_bind: Option<String>,
    db_path: Option<String>,
    retention_days: Option<u32>,
    max_connections: Option<usize>,
    max_line_length: Option<usize>,
    batch_size: Option<usize>,
    batch_timeout_ms: Option<u64>,
    queue_size: Option<usize>,
    wal_enabled: Option<bool>,
    strict_mode: Option<bool>,
    subscriber_buffer: Option<usize>,

    /// Optional [auth] section
    auth: Option<FileAuth>,

    /// Optional [logging] section
    logging: Option<FileLogging>,
}

impl Config {
    /// Get the config file path: ~/.config/logtrail/config.toml
    /// Uses Unix-style ~/.config on all platforms for consistency
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("logtrail").join("config.toml"))
    }

    /// Create config file with defaults if it doesn't exist
    /// Called during startup to help users discover configuration options
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };

        // Don't overwrite existing config
        if path.exists() {
            return;
        }

        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return; // Silently fail - config is optional
            }
        }

        // Use Config::default().to_toml() as single source of truth
        let _ = std::fs::write(&path, Self::default().to_toml());
    }

    /// Load file config if it exists
    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse {}: {}", path.display(), e);
                FileConfig::default()
            }),
            Err(_) => FileConfig::default(), // File doesn't exist, use defaults
        }
    }

    /// Serialize config to TOML string (single source of truth for format)
    pub fn to_toml(&self) -> String {
        format!(
            r#"# logtrail configuration

# Syslog TCP listener bind address
tcp_bind = "{tcp_bind}"

# HTTP gateway bind address
http_bind = "{http_bind}"

# SQLite database file
db_path = "{db_path}"

# Delete records older than this many days (0 = keep forever)
retention_days = {retention}

# Concurrent TCP connection cap
max_connections = {max_conns}

# Per-line byte cap; longer lines are rejected
max_line_length = {max_line}

# Write batching
batch_size = {batch_size}
batch_timeout_ms = {batch_timeout}
queue_size = {queue_size}
wal_enabled = {wal}

# Reject invalid RFC5424 lines (true) or store them leniently (false)
strict_mode = {strict}

# Per-subscriber live stream buffer
subscriber_buffer = {sub_buffer}

# Gateway authentication (enforced by the layer in front of the gateway)
[auth]
enabled = {auth_enabled}
user = "{auth_user}"
password = "{auth_password}"

# Logging configuration (RUST_LOG env var overrides)
[logging]
level = "{log_level}"
"#,
            tcp_bind = self.tcp_bind,
            http_bind = self.http_bind,
            db_path = self.db_path.display(),
            retention = self.retention_days,
            max_conns = self.max_connections,
            max_line = self.max_line_length,
            batch_size = self.batch_size,
            batch_timeout = self.batch_timeout_ms,
            queue_size = self.queue_size,
            wal = self.wal_enabled,
            strict = self.strict_mode,
            sub_buffer = self.subscriber_buffer,
            auth_enabled = self.auth.enabled,
            auth_user = self.auth.user,
            auth_password = self.auth.password,
            log_level = self.logging.level,
        )
    }

    /// Load configuration: file -> env vars -> defaults
    pub fn from_env() -> Self {
        let file = Self::load_file_config();
        let defaults = Self::default();

        // Bind addresses: env > file > default
        let tcp_bind = std::env::var("LOGTRAIL_TCP_BIND")
            .ok()
            .or(file.tcp_bind)
            .map(|s| s.parse().expect("Invalid tcp_bind address"))
            .unwrap_or(defaults.tcp_bind);

        let http_bind = std::env::var("LOGTRAIL_HTTP_BIND")
            .ok()
            .or(file.http_bind)
            .map(|s| s.parse().expect("Invalid http_bind address"))
            .unwrap_or(defaults.http_bind);

        // Database path: env > file > default
        let db_path = std::env::var("LOGTRAIL_DB_PATH")
            .ok()
            .or(file.db_path)
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        // Strict mode: env > file > default
        let strict_mode = std::env::var("LOGTRAIL_STRICT_MODE")
            .ok()
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .or(file.strict_mode)
            .unwrap_or(defaults.strict_mode);

        // Remaining knobs: file config only (env vars would be verbose)
        let auth_file = file.auth.unwrap_or_default();
        let auth = AuthConfig {
            enabled: auth_file.enabled.unwrap_or(defaults.auth.enabled),
            user: auth_file.user.unwrap_or(defaults.auth.user),
            password: auth_file.password.unwrap_or(defaults.auth.password),
        };

        let logging_file = file.logging.unwrap_or_default();
        let logging = LoggingConfig {
            level: logging_file.level.unwrap_or(defaults.logging.level),
        };

        Self {
            tcp_bind,
            http_bind,
            db_path,
            retention_days: file.retention_days.unwrap_or(defaults.retention_days),
            max_connections: file.max_connections.unwrap_or(defaults.max_connections),
            max_line_length: file.max_line_length.unwrap_or(defaults.max_line_length),
            batch_size: file.batch_size.unwrap_or(defaults.batch_size),
            batch_timeout_ms: file.batch_timeout_ms.unwrap_or(defaults.batch_timeout_ms),
            queue_size: file.queue_size.unwrap_or(defaults.queue_size),
            wal_enabled: file.wal_enabled.unwrap_or(defaults.wal_enabled),
            strict_mode,
            subscriber_buffer: file.subscriber_buffer.unwrap_or(defaults.subscriber_buffer),
            auth,
            logging,
        }
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            wal_enabled: self.wal_enabled,
        }
    }

    pub fn batcher_config(&self) -> BatcherConfig {
        BatcherConfig {
            queue_size: self.queue_size,
            batch_size: self.batch_size,
            batch_timeout: Duration::from_millis(self.batch_timeout_ms),
            retention_days: self.retention_days,
            ..Default::default()
        }
    }

    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            strict_mode: self.strict_mode,
            max_line_length: self.max_line_length,
            subscriber_buffer: self.subscriber_buffer,
        }
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            bind: self.tcp_bind,
            max_connections: self.max_connections,
            max_line_length: self.max_line_length,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcp_bind: "0.0.0.0:2253".parse().expect("default tcp_bind"),
            http_bind: "127.0.0.1:8080".parse().expect("default http_bind"),
            db_path: PathBuf::from("./data/logtrail.db"),
            retention_days: 30,
            max_connections: 1024,
            max_line_length: 8192,
            batch_size: 100,
            batch_timeout_ms: 10,
            queue_size: 10_000,
            wal_enabled: true,
            strict_mode: true,
            subscriber_buffer: 256,
            auth: AuthConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify that the serialized config can be parsed back. This
    /// catches TOML template mistakes when a new field is added.
    #[test]
    fn test_config_roundtrip_default() {
        let config = Config::default();
        let toml_str = config.to_toml();

        let parsed: Result<FileConfig, _> = toml::from_str(&toml_str);
        assert!(
            parsed.is_ok(),
            "Default config should round-trip.\nTOML:\n{}\nError: {:?}",
            toml_str,
            parsed.err()
        );

        let parsed = parsed.unwrap();
        assert_eq!(parsed.tcp_bind.as_deref(), Some("0.0.0.0:2253"));
        assert_eq!(parsed.batch_size, Some(100));
        assert_eq!(parsed.queue_size, Some(10_000));
        assert_eq!(parsed.strict_mode, Some(true));
        assert_eq!(
            parsed.logging.and_then(|l| l.level).as_deref(),
            Some("info")
        );
    }

    #[test]
    fn test_derived_component_configs() {
        let config = Config {
            batch_size: 50,
            batch_timeout_ms: 25,
            queue_size: 500,
            retention_days: 7,
            strict_mode: false,
            max_line_length: 4096,
            wal_enabled: false,
            ..Default::default()
        };

        let batcher = config.batcher_config();
        assert_eq!(batcher.batch_size, 50);
        assert_eq!(batcher.batch_timeout, Duration::from_millis(25));
        assert_eq!(batcher.queue_size, 500);
        assert_eq!(batcher.retention_days, 7);

        let ingest = config.ingest_config();
        assert!(!ingest.strict_mode);
        assert_eq!(ingest.max_line_length, 4096);

        assert!(!config.store_options().wal_enabled);
        assert_eq!(config.listener_config().max_line_length, 4096);
    }
}
