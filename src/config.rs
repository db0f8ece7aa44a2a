//! Configuration loading: TOML file, then `EDGEBOT_*` env overrides, then CLI
//! flags win (applied by `main.rs`). Shape mirrors spec §6.4 exactly.

use std::{env, fs, net::IpAddr, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::EdgeBotError;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub inputs: InputsConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Directory holding `spool.db`, `spool.db.lock`, and `dead/` (§6.5).
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port() }
    }
}

fn default_host() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}
fn default_port() -> u16 {
    9273
}

/// Per-listener enable flags. Protocol-specific options are out of scope
/// (spec §1); only the switches the supervisor needs to decide what to start.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InputsConfig {
    #[serde(default)]
    pub syslog_udp: ListenerToggle,
    #[serde(default)]
    pub file_tail: ListenerToggle,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ListenerToggle {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    pub primary: SinkConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    Http {
        url: String,
        #[serde(default)]
        auth_token: Option<String>,
        #[serde(default)]
        tls: TlsConfig,
        #[serde(default = "default_true")]
        compression: bool,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    File {
        url: String,
        #[serde(default = "default_true")]
        compression: bool,
    },
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TlsConfig {
    #[serde(default = "default_true")]
    pub verify: bool,
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_key: Option<PathBuf>,
    #[serde(default)]
    pub ca_bundle: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}
fn default_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchingConfig {
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_batch_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            max_bytes: default_max_bytes(),
            timeout_ms: default_batch_timeout_ms(),
        }
    }
}

fn default_max_size() -> usize {
    500
}
fn default_max_bytes() -> u64 {
    1_048_576
}
fn default_batch_timeout_ms() -> u64 {
    5_000
}

impl BatchingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BufferConfig {
    #[serde(default = "default_buffer_max_size")]
    pub max_size: u64,
    #[serde(default)]
    pub disk_buffer: bool,
    #[serde(default)]
    pub disk_buffer_path: Option<PathBuf>,
    #[serde(default = "default_disk_buffer_max_size")]
    pub disk_buffer_max_size: ByteSize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_size: default_buffer_max_size(),
            disk_buffer: true,
            disk_buffer_path: None,
            disk_buffer_max_size: default_disk_buffer_max_size(),
        }
    }
}

fn default_buffer_max_size() -> u64 {
    100_000
}
fn default_disk_buffer_max_size() -> ByteSize {
    ByteSize(100 * 1024 * 1024)
}

/// Accepts either an integer byte count or a suffixed string like `"100MB"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ByteSize(pub u64);

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Num(u64),
            Text(String),
        }
        let repr = Repr::deserialize(deserializer)?;
        match repr {
            Repr::Num(n) => Ok(ByteSize(n)),
            Repr::Text(s) => parse_byte_size(&s)
                .map(ByteSize)
                .map_err(serde::de::Error::custom),
        }
    }
}

fn parse_byte_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, suffix) = s.split_at(s.find(|c: char| c.is_alphabetic()).unwrap_or(s.len()));
    let base: f64 = digits.trim().parse().map_err(|_| format!("invalid byte size: {s}"))?;
    let mult: f64 = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1.0,
        "KB" | "K" => 1024.0,
        "MB" | "M" => 1024.0 * 1024.0,
        "GB" | "G" => 1024.0 * 1024.0 * 1024.0,
        other => return Err(format!("unknown byte size suffix: {other}")),
    };
    Ok((base * mult) as u64)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    200
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_jitter_factor() -> f64 {
    0.2
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_duration_sec")]
    pub open_duration_sec: u64,
    #[serde(default = "default_half_open_max_inflight")]
    pub half_open_max_inflight: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_duration_sec: default_open_duration_sec(),
            half_open_max_inflight: default_half_open_max_inflight(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_open_duration_sec() -> u64 {
    60
}
fn default_half_open_max_inflight() -> usize {
    2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitMode {
    Events,
    Bytes,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rl_mode")]
    pub mode: RateLimitMode,
    #[serde(default = "default_rl_capacity")]
    pub capacity: f64,
    #[serde(default = "default_rl_refill")]
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            mode: default_rl_mode(),
            capacity: default_rl_capacity(),
            refill_per_sec: default_rl_refill(),
        }
    }
}

fn default_rl_mode() -> RateLimitMode {
    RateLimitMode::Events
}
fn default_rl_capacity() -> f64 {
    1000.0
}
fn default_rl_refill() -> f64 {
    200.0
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_shutdown_grace_sec")]
    pub shutdown_grace_sec: u64,
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    #[serde(default = "default_restart_window_sec")]
    pub restart_window_sec: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_sec: default_shutdown_grace_sec(),
            max_restart_attempts: default_max_restart_attempts(),
            restart_window_sec: default_restart_window_sec(),
        }
    }
}

fn default_shutdown_grace_sec() -> u64 {
    30
}
fn default_max_restart_attempts() -> u32 {
    10
}
fn default_restart_window_sec() -> u64 {
    300
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}
fn default_log_format() -> LogFormat {
    LogFormat::Text
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/edgebot")
}

impl Config {
    /// Loads a TOML config file, then overlays `EDGEBOT_*` environment
    /// variables (spec §6.4). Does not apply CLI flags; the caller does that.
    pub fn load(path: &Path) -> Result<Config, EdgeBotError> {
        let text = fs::read_to_string(path)
            .map_err(|e| EdgeBotError::Config(format!("reading {}: {e}", path.display())))?;
        let mut cfg: Config = toml::from_str(&text)
            .map_err(|e| EdgeBotError::Config(format!("parsing {}: {e}", path.display())))?;
        apply_env_overrides(&mut cfg)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), EdgeBotError> {
        if self.batching.max_size == 0 {
            return Err(EdgeBotError::Config("batching.max_size must be > 0".into()));
        }
        match &self.output.primary {
            SinkConfig::Http { url, .. } => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(EdgeBotError::Config(format!("output.primary.url is not http(s): {url}")));
                }
            }
            SinkConfig::File { url, .. } => {
                if !url.starts_with("file://") {
                    return Err(EdgeBotError::Config(format!("output.primary.url is not file://: {url}")));
                }
            }
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(EdgeBotError::Config("retry.jitter_factor must be in [0,1]".into()));
        }
        Ok(())
    }

    /// Fields the supervisor is allowed to hot-reload on SIGHUP (spec §4.8):
    /// rate limit values, batch sizes, and log level/format. Listener
    /// endpoints and ports are intentionally excluded.
    pub fn apply_reloadable(&mut self, fresh: &Config) {
        self.rate_limit = fresh.rate_limit.clone();
        self.batching = fresh.batching.clone();
        self.log = fresh.log.clone();
    }
}

/// Applies `EDGEBOT_<UPPER_SNAKE>` environment overrides. Only the handful
/// of options called out by name in spec §6.4 are mapped; anything else in
/// the config file is left as loaded from TOML.
fn apply_env_overrides(cfg: &mut Config) -> Result<(), EdgeBotError> {
    if let Ok(url) = env::var("EDGEBOT_MOTHERSHIP_URL") {
        if let SinkConfig::Http { url: u, .. } = &mut cfg.output.primary {
            *u = url;
        }
    }
    if let Ok(token) = env::var("EDGEBOT_AUTH_TOKEN") {
        if let SinkConfig::Http { auth_token, .. } = &mut cfg.output.primary {
            *auth_token = Some(token);
        }
    }
    if let Ok(level) = env::var("EDGEBOT_LOG_LEVEL") {
        cfg.log.level = match level.to_ascii_lowercase().as_str() {
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            other => return Err(EdgeBotError::Config(format!("invalid EDGEBOT_LOG_LEVEL: {other}"))),
        };
    }
    if let Ok(dir) = env::var("EDGEBOT_STATE_DIR") {
        cfg.state_dir = PathBuf::from(dir);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_byte_size_suffixes() {
        assert_eq!(parse_byte_size("100MB").unwrap(), 100 * 1024 * 1024);
        assert_eq!(parse_byte_size("5KB").unwrap(), 5 * 1024);
        assert_eq!(parse_byte_size("42").unwrap(), 42);
    }

    #[test]
    fn rejects_bad_jitter_factor() {
        let cfg = Config {
            server: ServerConfig::default(),
            inputs: InputsConfig::default(),
            output: OutputConfig { primary: SinkConfig::File { url: "file:///tmp".into(), compression: true } },
            batching: BatchingConfig::default(),
            buffer: BufferConfig::default(),
            retry: RetryConfig { jitter_factor: 1.5, ..RetryConfig::default() },
            breaker: BreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            supervisor: SupervisorConfig::default(),
            log: LogConfig::default(),
            state_dir: default_state_dir(),
        };
        assert!(cfg.validate().is_err());
    }
}
