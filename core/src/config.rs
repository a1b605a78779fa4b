//! Gateway configuration.
//!
//! Everything is optional in the TOML file; missing keys fall back to the
//! defaults below. A handful of deployment-specific values can also be
//! overridden from the environment (see [`GatewayConfig::apply_env`]).

use serde::Deserialize;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const ENV_LISTEN: &str = "TERMGATE_LISTEN";
pub const ENV_SESSION_RECORD_URL: &str = "TERMGATE_SESSION_RECORD_URL";
pub const ENV_CONTEXT_URL: &str = "TERMGATE_CONTEXT_URL";
pub const ENV_RAG_URL: &str = "TERMGATE_RAG_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub ssh: SshConfig,
    pub websocket: WebSocketConfig,
    pub memory: MemoryConfig,
    pub buffer: BufferConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub services: ServicesConfig,
    pub log: LogConfig,
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `TERMGATE_*` overrides on top of the file values.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(listen) = lookup(ENV_LISTEN) {
            self.server.listen = listen
                .parse()
                .map_err(|err| ConfigError::invalid("server.listen", format!("{err}")))?;
        }
        if let Some(url) = lookup(ENV_SESSION_RECORD_URL) {
            self.services.session_record.base_url = url;
        }
        if let Some(url) = lookup(ENV_CONTEXT_URL) {
            self.services.context.base_url = url;
        }
        if let Some(url) = lookup(ENV_RAG_URL) {
            self.services.rag.base_url = url;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer.min_bytes == 0 {
            return Err(ConfigError::invalid("buffer.min_bytes", "must be positive"));
        }
        if self.buffer.min_bytes > self.buffer.max_bytes {
            return Err(ConfigError::invalid(
                "buffer.min_bytes",
                format!(
                    "{} exceeds buffer.max_bytes {}",
                    self.buffer.min_bytes, self.buffer.max_bytes
                ),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "breaker.failure_threshold",
                "must be at least 1",
            ));
        }
        if self.breaker.success_threshold == 0 {
            return Err(ConfigError::invalid(
                "breaker.success_threshold",
                "must be at least 1",
            ));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::invalid(
                "retry.initial_backoff_ms",
                "must not exceed retry.max_backoff_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.memory.threshold_fraction)
            || self.memory.threshold_fraction == 0.0
        {
            return Err(ConfigError::invalid(
                "memory.threshold_fraction",
                "must be in (0, 1]",
            ));
        }
        if self.ssh.default_cols == 0 || self.ssh.default_rows == 0 {
            return Err(ConfigError::invalid("ssh.default_cols", "geometry must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8090)),
            shutdown_grace_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub connect_timeout_secs: u64,
    pub default_term: String,
    pub default_cols: u32,
    pub default_rows: u32,
    pub keepalive_interval_secs: u64,
    /// Sessions with no input and no output for this long are terminated.
    /// Zero disables idle detection.
    pub idle_timeout_secs: u64,
    pub os_detect_timeout_ms: u64,
    /// Bound on each leg of a pause/resume handshake with the output pump.
    pub control_timeout_ms: u64,
    /// How long sessions that failed to connect stay listed.
    pub failed_retention_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            default_term: "xterm-256color".to_string(),
            default_cols: 80,
            default_rows: 24,
            keepalive_interval_secs: 30,
            idle_timeout_secs: 3_600,
            os_detect_timeout_ms: 2_000,
            control_timeout_ms: 2_000,
            failed_retention_secs: 3_600,
        }
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn os_detect_timeout(&self) -> Duration {
        Duration::from_millis(self.os_detect_timeout_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms.max(1))
    }

    pub fn failed_retention(&self) -> Duration {
        Duration::from_secs(self.failed_retention_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub write_deadline_ms: u64,
    /// Frames queued per viewer before writes start timing out.
    pub viewer_queue_depth: usize,
    /// A viewer that sends nothing (not even a pong) for this long is dropped.
    pub read_deadline_secs: u64,
    pub ping_interval_secs: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            write_deadline_ms: 5_000,
            viewer_queue_depth: 256,
            read_deadline_secs: 120,
            ping_interval_secs: 30,
        }
    }
}

impl WebSocketConfig {
    pub fn write_deadline(&self) -> Duration {
        Duration::from_millis(self.write_deadline_ms)
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_secs(self.read_deadline_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub limit_bytes: u64,
    pub threshold_fraction: f64,
    pub check_interval_secs: u64,
    pub periodic_cleanup_secs: u64,
    /// Cumulative processed bytes after which a cleanup is requested.
    pub max_buffer_bytes: u64,
    pub pool_buffer_capacity: usize,
    pub pool_max_idle: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            limit_bytes: 512 * 1024 * 1024,
            threshold_fraction: 0.8,
            check_interval_secs: 30,
            periodic_cleanup_secs: 600,
            max_buffer_bytes: 64 * 1024 * 1024,
            pool_buffer_capacity: 4 * 1024,
            pool_max_idle: 64,
        }
    }
}

impl MemoryConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn periodic_cleanup(&self) -> Duration {
        Duration::from_secs(self.periodic_cleanup_secs.max(1))
    }

    pub fn threshold_bytes(&self) -> u64 {
        (self.limit_bytes as f64 * self.threshold_fraction) as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub min_bytes: usize,
    pub max_bytes: usize,
    pub recompute_interval_secs: u64,
    pub recompute_after_bytes: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            min_bytes: 1024,
            max_bytes: 16 * 1024,
            recompute_interval_secs: 300,
            recompute_after_bytes: 1024 * 1024,
        }
    }
}

impl BufferConfig {
    pub fn recompute_interval(&self) -> Duration {
        Duration::from_secs(self.recompute_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub attempt_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
            attempt_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceEndpoint {
    pub base_url: String,
    /// Per-attempt timeout; falls back to `retry.attempt_timeout_ms`.
    pub timeout_ms: Option<u64>,
}

impl ServiceEndpoint {
    fn new(base_url: &str, timeout_ms: Option<u64>) -> Self {
        Self {
            base_url: base_url.to_string(),
            timeout_ms,
        }
    }
}

impl Default for ServiceEndpoint {
    fn default() -> Self {
        Self::new("http://localhost:8080", None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub session_record: ServiceEndpoint,
    pub context: ServiceEndpoint,
    pub rag: ServiceEndpoint,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            session_record: ServiceEndpoint::new("http://session-service:8080", None),
            context: ServiceEndpoint::new("http://mcp-service:8080", None),
            // Generation dominates query latency.
            rag: ServiceEndpoint::new("http://rag-service:8080", Some(60_000)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info,termgate_core=info,termgate_gateway=info".to_string(),
            format: LogFormat::Text,
        }
    }
}
