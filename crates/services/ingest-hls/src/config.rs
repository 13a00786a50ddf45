//! Configuration for the live ingest gateway
//!
//! Configuration can be loaded from a TOML file and/or environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::encoder::{RestartPolicy, SupervisorConfig};

/// Main configuration for the live ingest gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Where session artifacts live and how they are exposed
    #[serde(default)]
    pub storage: StorageConfig,

    /// Live encoder configuration
    #[serde(default)]
    pub encoder: EncoderConfig,

    /// Timelapse rendition configuration
    #[serde(default)]
    pub timelapse: TimelapseConfig,

    /// Session limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP/WebSocket port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Host used in segment URLs when a request carries no Host header
    #[serde(default = "default_public_host")]
    pub public_host: String,
}

fn default_http_port() -> u16 {
    3000
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_public_host() -> String {
    "localhost:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            host: default_host(),
            public_host: default_public_host(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory; each session gets `{streams_dir}/{key}/`
    #[serde(default = "default_streams_dir")]
    pub streams_dir: PathBuf,

    /// URL path prefix under which `streams_dir` is served
    #[serde(default = "default_public_prefix")]
    pub public_prefix: String,
}

fn default_streams_dir() -> PathBuf {
    PathBuf::from("./streams")
}

fn default_public_prefix() -> String {
    "streams".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            streams_dir: default_streams_dir(),
            public_prefix: default_public_prefix(),
        }
    }
}

/// Live encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// ffmpeg executable
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    /// Delay between session start and encoder spawn in milliseconds
    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,

    /// Restarts allowed after the first encoder failure
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Delay before a restart in milliseconds
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,

    /// Time a stopped encoder gets to exit before being killed, in milliseconds
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Target segment duration in seconds
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u32,

    /// Number of segments kept in the live window
    #[serde(default = "default_window_segments")]
    pub window_segments: u32,

    /// Seconds without new ingest bytes before the live encode ends
    #[serde(default = "default_input_idle_timeout")]
    pub input_idle_timeout_secs: u64,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_warmup_ms() -> u64 {
    5000
}

fn default_max_restarts() -> u32 {
    1
}

fn default_restart_backoff_ms() -> u64 {
    3000
}

fn default_stop_grace_ms() -> u64 {
    5000
}

fn default_segment_seconds() -> u32 {
    2
}

fn default_window_segments() -> u32 {
    10
}

fn default_input_idle_timeout() -> u64 {
    30
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            warmup_ms: default_warmup_ms(),
            max_restarts: default_max_restarts(),
            restart_backoff_ms: default_restart_backoff_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            segment_seconds: default_segment_seconds(),
            window_segments: default_window_segments(),
            input_idle_timeout_secs: default_input_idle_timeout(),
        }
    }
}

impl EncoderConfig {
    /// Supervisor settings derived from this configuration
    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            warmup: Duration::from_millis(self.warmup_ms),
            restart: RestartPolicy {
                max_restarts: self.max_restarts,
                backoff: Duration::from_millis(self.restart_backoff_ms),
            },
            stop_grace: Duration::from_millis(self.stop_grace_ms),
        }
    }
}

/// Timelapse configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelapseConfig {
    /// Speed-up factor
    #[serde(default = "default_factor")]
    pub factor: f64,

    /// Largest ratio a single tempo stage may apply
    #[serde(default = "default_max_tempo_ratio")]
    pub max_tempo_ratio: f64,

    /// How long the request that starts a job waits for it, in milliseconds
    #[serde(default = "default_initiator_wait_ms")]
    pub initiator_wait_ms: u64,
}

fn default_factor() -> f64 {
    60.0
}

fn default_max_tempo_ratio() -> f64 {
    2.0
}

fn default_initiator_wait_ms() -> u64 {
    10_000
}

impl Default for TimelapseConfig {
    fn default() -> Self {
        Self {
            factor: default_factor(),
            max_tempo_ratio: default_max_tempo_ratio(),
            initiator_wait_ms: default_initiator_wait_ms(),
        }
    }
}

impl TimelapseConfig {
    pub fn initiator_wait(&self) -> Duration {
        Duration::from_millis(self.initiator_wait_ms)
    }
}

/// Session and resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrent sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Maximum size of a control-channel message in bytes
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

fn default_max_sessions() -> usize {
    100
}

fn default_max_message_bytes() -> usize {
    16 * 1024 * 1024
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = Config::default();

        // Server
        if let Ok(port) = std::env::var("INGEST_HTTP_PORT") {
            if let Ok(p) = port.parse() {
                config.server.http_port = p;
            }
        }
        if let Ok(host) = std::env::var("INGEST_HOST") {
            config.server.host = host;
        }
        if let Ok(host) = std::env::var("INGEST_PUBLIC_HOST") {
            config.server.public_host = host;
        }

        // Storage
        if let Ok(dir) = std::env::var("INGEST_STREAMS_DIR") {
            config.storage.streams_dir = PathBuf::from(dir);
        }
        if let Ok(prefix) = std::env::var("INGEST_PUBLIC_PREFIX") {
            config.storage.public_prefix = prefix;
        }

        // Encoder
        if let Ok(path) = std::env::var("INGEST_FFMPEG_PATH") {
            config.encoder.ffmpeg_path = path;
        }
        if let Ok(ms) = std::env::var("INGEST_WARMUP_MS") {
            if let Ok(m) = ms.parse() {
                config.encoder.warmup_ms = m;
            }
        }
        if let Ok(max) = std::env::var("INGEST_MAX_RESTARTS") {
            if let Ok(m) = max.parse() {
                config.encoder.max_restarts = m;
            }
        }

        // Limits
        if let Ok(max) = std::env::var("INGEST_MAX_SESSIONS") {
            if let Ok(m) = max.parse() {
                config.limits.max_sessions = m;
            }
        }

        config
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        if let Some(p) = path {
            if p.as_ref().exists() {
                return Self::from_file(p);
            }
        }
        let config = Self::from_env();
        config.validate()?;
        Ok(config)
    }

    /// Reject values the services cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.timelapse.factor >= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "timelapse.factor must be >= 1, got {}",
                self.timelapse.factor
            )));
        }
        if !(self.timelapse.max_tempo_ratio > 1.0) {
            return Err(ConfigError::Invalid(format!(
                "timelapse.max_tempo_ratio must be > 1, got {}",
                self.timelapse.max_tempo_ratio
            )));
        }
        if self.encoder.segment_seconds == 0 {
            return Err(ConfigError::Invalid(
                "encoder.segment_seconds must be > 0".to_string(),
            ));
        }
        if self.storage.public_prefix.trim_matches('/').is_empty() {
            return Err(ConfigError::Invalid(
                "storage.public_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.http_port, 3000);
        assert_eq!(config.storage.public_prefix, "streams");
        assert_eq!(config.encoder.max_restarts, 1);
        assert_eq!(config.encoder.warmup_ms, 5000);
        assert_eq!(config.timelapse.factor, 60.0);
        assert_eq!(config.limits.max_sessions, 100);
        config.validate().unwrap();
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
[server]
http_port = 9090
public_host = "watch.example.com"

[storage]
streams_dir = "/var/lib/ingest"

[encoder]
ffmpeg_path = "/usr/local/bin/ffmpeg"
max_restarts = 3
restart_backoff_ms = 500

[timelapse]
factor = 30.0
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.http_port, 9090);
        assert_eq!(config.server.public_host, "watch.example.com");
        assert_eq!(config.storage.streams_dir, PathBuf::from("/var/lib/ingest"));
        assert_eq!(config.storage.public_prefix, "streams");
        assert_eq!(config.encoder.ffmpeg_path, "/usr/local/bin/ffmpeg");
        assert_eq!(config.timelapse.factor, 30.0);

        let supervisor = config.encoder.supervisor();
        assert_eq!(supervisor.restart.max_restarts, 3);
        assert_eq!(supervisor.restart.backoff, Duration::from_millis(500));
        assert_eq!(supervisor.warmup, Duration::from_millis(5000));
    }

    #[test]
    fn test_validate_rejects_slowdown_factor() {
        let mut config = Config::default();
        config.timelapse.factor = 0.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_from_file_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("ingest.toml");
        std::fs::write(&path, "[limits]\nmax_sessions = 7\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.limits.max_sessions, 7);
    }
}
