use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Pre-compiled regex for hostname validation (compiled once at first use)
static HOSTNAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][-a-zA-Z0-9\.]*[a-zA-Z0-9]$").unwrap());

/// Topic names double as spool directory names.
static TOPIC_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][-a-zA-Z0-9_\.]*$").unwrap());

pub const BROKER_SPOOL: &str = "spool";
pub const BROKER_MEMORY: &str = "memory";

#[derive(Debug, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub server: Option<ServerSection>,
    #[serde(default)]
    pub logging: Option<LoggingSection>,
    #[serde(default)]
    pub queue: Option<QueueSection>,
    #[serde(default)]
    pub workers: Option<WorkersSection>,
    #[serde(default)]
    pub grading: Option<GradingSection>,
    #[serde(default)]
    pub storage: Option<StorageSection>,
}

#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub json: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct QueueSection {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub broker: Option<String>,
    #[serde(default)]
    pub spool_dir: Option<String>,
    #[serde(default)]
    pub visibility_timeout_secs: Option<u64>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub prefetch: Option<usize>,
    #[serde(default)]
    pub reconnect_initial_ms: Option<u64>,
    #[serde(default)]
    pub reconnect_max_ms: Option<u64>,
    #[serde(default)]
    pub drain_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct WorkersSection {
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub retry_limit: Option<u32>,
    #[serde(default)]
    pub shutdown_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct GradingSection {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct StorageSection {
    #[serde(default)]
    pub artifacts_dir: Option<String>,
    #[serde(default)]
    pub state_dir: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Load a RawConfigFile from a path. The format is inferred from the extension: .toml, .yaml/.yml, .json
pub fn load_raw_from_file<P: AsRef<Path>>(path: P) -> Result<RawConfigFile, ConfigError> {
    let path = path.as_ref();
    let s = fs::read_to_string(path)?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase());
    parse_config_str(&s, ext.as_deref())
}

/// Parse configuration from a string with optional format hint
#[inline]
fn parse_config_str(s: &str, ext: Option<&str>) -> Result<RawConfigFile, ConfigError> {
    match ext {
        #[cfg(feature = "toml")]
        Some("toml") => toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string())),
        #[cfg(feature = "yaml")]
        Some("yaml" | "yml") => {
            serde_yaml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
        }
        #[cfg(feature = "json")]
        Some("json") => serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string())),
        _ => parse_config_auto(s),
    }
}

/// Try each enabled format in turn
#[inline]
fn parse_config_auto(s: &str) -> Result<RawConfigFile, ConfigError> {
    #[cfg(feature = "toml")]
    if let Ok(cfg) = toml::from_str(s) {
        return Ok(cfg);
    }

    #[cfg(feature = "yaml")]
    if let Ok(cfg) = serde_yaml::from_str(s) {
        return Ok(cfg);
    }

    #[cfg(feature = "json")]
    if let Ok(cfg) = serde_json::from_str(s) {
        return Ok(cfg);
    }

    #[cfg(any(feature = "yaml", feature = "toml", feature = "json"))]
    {
        Err(ConfigError::Parse(
            "failed to parse config as any supported format".into(),
        ))
    }

    #[cfg(not(any(feature = "yaml", feature = "toml", feature = "json")))]
    {
        let _ = s; // suppress unused warning
        Err(ConfigError::Parse("no config format enabled".into()))
    }
}

/// Concrete service configuration with defaults.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub queue: QueueConfig,
    pub workers: WorkersConfig,
    pub grading: GradingConfig,
    pub storage: StorageConfig,
}

/// Health endpoint bind address.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueConfig {
    pub topic: String,
    /// `spool` or `memory`.
    pub broker: String,
    pub spool_dir: String,
    pub visibility_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub prefetch: usize,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub drain_timeout_secs: u64,
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkersConfig {
    /// `0` lets the service pick a default from the host's parallelism.
    pub concurrency: usize,
    pub retry_limit: u32,
    pub shutdown_timeout_secs: u64,
}

impl WorkersConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradingConfig {
    /// External grader; the artifact path is appended to `args`.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl GradingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageConfig {
    pub artifacts_dir: String,
    pub state_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8090,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json: true,
            },
            queue: QueueConfig {
                topic: "grader-submissions".to_string(),
                broker: BROKER_SPOOL.to_string(),
                spool_dir: "./data/spool".to_string(),
                visibility_timeout_secs: 600,
                poll_interval_ms: 200,
                prefetch: 16,
                reconnect_initial_ms: 100,
                reconnect_max_ms: 10_000,
                drain_timeout_secs: 30,
            },
            workers: WorkersConfig {
                concurrency: 0,
                retry_limit: 3,
                shutdown_timeout_secs: 30,
            },
            grading: GradingConfig {
                command: None,
                args: Vec::new(),
                timeout_secs: 300,
            },
            storage: StorageConfig {
                artifacts_dir: "./data/artifacts".to_string(),
                state_dir: "./data/state".to_string(),
            },
        }
    }
}

#[inline]
fn parse_bool(s: &str) -> Result<bool, ()> {
    // Avoid allocation by checking bytes directly for common cases
    let bytes = s.as_bytes();
    match bytes {
        b"1" | b"true" | b"TRUE" | b"True" | b"yes" | b"YES" | b"Yes" | b"y" | b"Y" => Ok(true),
        b"0" | b"false" | b"FALSE" | b"False" | b"no" | b"NO" | b"No" | b"n" | b"N" => Ok(false),
        _ => match s.to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" => Ok(true),
            "false" | "no" | "n" => Ok(false),
            _ => Err(()),
        },
    }
}

#[inline]
fn split_csv(s: &str) -> Vec<String> {
    s.split(',')
        .filter_map(|p| {
            let trimmed = p.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}

/// Helper macro to apply optional value if present
macro_rules! apply_opt {
    ($target:expr, $source:expr) => {
        if let Some(v) = $source {
            $target = v;
        }
    };
    ($target:expr, $source:expr, wrap) => {
        if let Some(v) = $source {
            $target = Some(v);
        }
    };
}

/// Load concrete `Config` from optional file and environment variables.
/// Environment variables take precedence over file values and defaults.
pub fn load_config<P: AsRef<Path>>(path: Option<P>) -> Result<Config, ConfigError> {
    let mut cfg = Config::default();

    if let Some(p) = path {
        let raw = load_raw_from_file(p)?;
        apply_raw(&mut cfg, raw);
    }

    apply_env_overrides(&mut cfg)?;

    Ok(cfg)
}

fn apply_raw(cfg: &mut Config, raw: RawConfigFile) {
    if let Some(server) = raw.server {
        apply_opt!(cfg.server.host, server.host);
        apply_opt!(cfg.server.port, server.port);
    }
    if let Some(logging) = raw.logging {
        apply_opt!(cfg.logging.level, logging.level);
        apply_opt!(cfg.logging.json, logging.json);
    }
    if let Some(q) = raw.queue {
        apply_opt!(cfg.queue.topic, q.topic);
        apply_opt!(cfg.queue.broker, q.broker);
        apply_opt!(cfg.queue.spool_dir, q.spool_dir);
        apply_opt!(cfg.queue.visibility_timeout_secs, q.visibility_timeout_secs);
        apply_opt!(cfg.queue.poll_interval_ms, q.poll_interval_ms);
        apply_opt!(cfg.queue.prefetch, q.prefetch);
        apply_opt!(cfg.queue.reconnect_initial_ms, q.reconnect_initial_ms);
        apply_opt!(cfg.queue.reconnect_max_ms, q.reconnect_max_ms);
        apply_opt!(cfg.queue.drain_timeout_secs, q.drain_timeout_secs);
    }
    if let Some(w) = raw.workers {
        apply_opt!(cfg.workers.concurrency, w.concurrency);
        apply_opt!(cfg.workers.retry_limit, w.retry_limit);
        apply_opt!(cfg.workers.shutdown_timeout_secs, w.shutdown_timeout_secs);
    }
    if let Some(g) = raw.grading {
        apply_opt!(cfg.grading.command, g.command, wrap);
        apply_opt!(cfg.grading.args, g.args);
        apply_opt!(cfg.grading.timeout_secs, g.timeout_secs);
    }
    if let Some(s) = raw.storage {
        apply_opt!(cfg.storage.artifacts_dir, s.artifacts_dir);
        apply_opt!(cfg.storage.state_dir, s.state_dir);
    }
}

/// Helper to parse env var as a specific type
#[inline]
fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Parse(format!("invalid {}: {}", key, e))),
        Err(_) => Ok(None),
    }
}

/// Helper to parse env var as bool
#[inline]
fn env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    match env::var(key) {
        Ok(v) => parse_bool(&v)
            .map(Some)
            .map_err(|_| ConfigError::Parse(format!("invalid {}", key))),
        Err(_) => Ok(None),
    }
}

/// Helper to get env var as string
#[inline]
fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

/// Apply all environment variable overrides to config
fn apply_env_overrides(cfg: &mut Config) -> Result<(), ConfigError> {
    // Server
    if let Some(v) = env_str("GRADER_SERVER_HOST") {
        cfg.server.host = v;
    }
    if let Some(v) = env_parse::<u16>("GRADER_SERVER_PORT")? {
        cfg.server.port = v;
    }

    // Logging
    if let Some(v) = env_str("GRADER_LOG_LEVEL") {
        cfg.logging.level = v;
    }
    if let Some(v) = env_bool("GRADER_LOG_JSON")? {
        cfg.logging.json = v;
    }

    // Queue
    if let Some(v) = env_str("GRADER_QUEUE_TOPIC") {
        cfg.queue.topic = v;
    }
    if let Some(v) = env_str("GRADER_QUEUE_BROKER") {
        cfg.queue.broker = v;
    }
    if let Some(v) = env_str("GRADER_QUEUE_SPOOL_DIR") {
        cfg.queue.spool_dir = v;
    }
    if let Some(v) = env_parse::<u64>("GRADER_QUEUE_VISIBILITY_TIMEOUT_SECS")? {
        cfg.queue.visibility_timeout_secs = v;
    }
    if let Some(v) = env_parse::<u64>("GRADER_QUEUE_POLL_INTERVAL_MS")? {
        cfg.queue.poll_interval_ms = v;
    }
    if let Some(v) = env_parse::<usize>("GRADER_QUEUE_PREFETCH")? {
        cfg.queue.prefetch = v;
    }
    if let Some(v) = env_parse::<u64>("GRADER_QUEUE_RECONNECT_INITIAL_MS")? {
        cfg.queue.reconnect_initial_ms = v;
    }
    if let Some(v) = env_parse::<u64>("GRADER_QUEUE_RECONNECT_MAX_MS")? {
        cfg.queue.reconnect_max_ms = v;
    }
    if let Some(v) = env_parse::<u64>("GRADER_QUEUE_DRAIN_TIMEOUT_SECS")? {
        cfg.queue.drain_timeout_secs = v;
    }

    // Workers
    if let Some(v) = env_parse::<usize>("GRADER_WORKERS_CONCURRENCY")? {
        cfg.workers.concurrency = v;
    }
    if let Some(v) = env_parse::<u32>("GRADER_WORKERS_RETRY_LIMIT")? {
        cfg.workers.retry_limit = v;
    }
    if let Some(v) = env_parse::<u64>("GRADER_WORKERS_SHUTDOWN_TIMEOUT_SECS")? {
        cfg.workers.shutdown_timeout_secs = v;
    }

    // Grading
    if let Some(v) = env_str("GRADER_GRADING_COMMAND") {
        cfg.grading.command = Some(v);
    }
    if let Some(v) = env_str("GRADER_GRADING_ARGS") {
        cfg.grading.args = split_csv(&v);
    }
    if let Some(v) = env_parse::<u64>("GRADER_GRADING_TIMEOUT_SECS")? {
        cfg.grading.timeout_secs = v;
    }

    // Storage
    if let Some(v) = env_str("GRADER_ARTIFACTS_DIR") {
        cfg.storage.artifacts_dir = v;
    }
    if let Some(v) = env_str("GRADER_STATE_DIR") {
        cfg.storage.state_dir = v;
    }

    Ok(())
}

/// Validate higher-level constraints on the resolved configuration.
pub fn validate_config(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.server.port == 0 {
        return Err(ConfigError::Validation("server.port must be > 0".into()));
    }
    let host_ok = cfg.server.host.parse::<std::net::IpAddr>().is_ok()
        || HOSTNAME_REGEX.is_match(&cfg.server.host);
    if !host_ok {
        return Err(ConfigError::Validation(format!(
            "invalid server.host: {}",
            cfg.server.host
        )));
    }

    match cfg.queue.broker.as_str() {
        BROKER_SPOOL | BROKER_MEMORY => {}
        other => {
            return Err(ConfigError::Validation(format!(
                "unsupported queue broker: {}",
                other
            )))
        }
    }
    if !TOPIC_REGEX.is_match(&cfg.queue.topic) {
        return Err(ConfigError::Validation(format!(
            "invalid queue.topic: {}",
            cfg.queue.topic
        )));
    }
    if cfg.queue.broker == BROKER_SPOOL && cfg.queue.spool_dir.trim().is_empty() {
        return Err(ConfigError::Validation(
            "queue.spool_dir must be set for the spool broker".into(),
        ));
    }
    if cfg.queue.prefetch == 0 {
        return Err(ConfigError::Validation("queue.prefetch must be > 0".into()));
    }
    if cfg.queue.visibility_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "queue.visibility_timeout_secs must be > 0".into(),
        ));
    }
    if cfg.queue.reconnect_initial_ms > cfg.queue.reconnect_max_ms {
        return Err(ConfigError::Validation(
            "queue.reconnect_initial_ms must not exceed queue.reconnect_max_ms".into(),
        ));
    }

    if let Some(command) = &cfg.grading.command {
        if command.trim().is_empty() {
            return Err(ConfigError::Validation(
                "grading.command must not be empty".into(),
            ));
        }
    }
    if cfg.grading.timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "grading.timeout_secs must be > 0".into(),
        ));
    }
    // A claim must outlive the grading of the message it holds.
    if cfg.queue.broker == BROKER_SPOOL
        && cfg.queue.visibility_timeout_secs <= cfg.grading.timeout_secs
    {
        return Err(ConfigError::Validation(format!(
            "queue.visibility_timeout_secs ({}) must exceed grading.timeout_secs ({})",
            cfg.queue.visibility_timeout_secs, cfg.grading.timeout_secs
        )));
    }

    for (name, dir) in [
        ("storage.artifacts_dir", &cfg.storage.artifacts_dir),
        ("storage.state_dir", &cfg.storage.state_dir),
    ] {
        if dir.trim().is_empty() {
            return Err(ConfigError::Validation(format!("{name} must be set")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::{Builder, NamedTempFile};

    // Tests touching the process environment must not interleave.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env(keys: &[&str]) {
        for k in keys {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn parse_toml() {
        let f = Builder::new().suffix(".toml").tempfile().expect("tmpfile");
        std::fs::write(
            f.path(),
            r#"
[server]
host = "0.0.0.0"
port = 9100

[queue]
broker = "memory"
prefetch = 4

[grading]
command = "./grade.sh"
args = ["--strict"]
"#,
        )
        .unwrap();
        let raw = load_raw_from_file(f.path()).expect("load");
        let s = raw.server.unwrap();
        assert_eq!(s.host.unwrap(), "0.0.0.0");
        assert_eq!(s.port.unwrap(), 9100);
        let q = raw.queue.unwrap();
        assert_eq!(q.broker.unwrap(), "memory");
        assert_eq!(q.prefetch.unwrap(), 4);
        assert!(q.topic.is_none());
        assert_eq!(raw.grading.unwrap().args.unwrap(), vec!["--strict"]);
    }

    #[test]
    fn parse_yaml() {
        let f = NamedTempFile::new().expect("tmpfile");
        std::fs::write(
            f.path(),
            r#"
workers:
  concurrency: 8
  retry_limit: 5
storage:
  artifacts_dir: /srv/artifacts
"#,
        )
        .unwrap();
        let raw = load_raw_from_file(f.path()).expect("load");
        let w = raw.workers.unwrap();
        assert_eq!(w.concurrency.unwrap(), 8);
        assert_eq!(w.retry_limit.unwrap(), 5);
        assert_eq!(raw.storage.unwrap().artifacts_dir.unwrap(), "/srv/artifacts");
    }

    #[test]
    fn parse_json() {
        let f = Builder::new().suffix(".json").tempfile().expect("tmpfile");
        std::fs::write(
            f.path(),
            r#"{"logging": {"level": "debug", "json": false}, "unknown": 1}"#,
        )
        .unwrap();
        let raw = load_raw_from_file(f.path()).expect("load");
        let l = raw.logging.unwrap();
        assert_eq!(l.level.unwrap(), "debug");
        assert_eq!(l.json, Some(false));
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let _env = ENV_LOCK.lock().unwrap();
        let f = Builder::new().suffix(".toml").tempfile().expect("tmpfile");
        std::fs::write(
            f.path(),
            r#"
[workers]
retry_limit = 7

[queue]
drain_timeout_secs = 5
"#,
        )
        .unwrap();
        let cfg = load_config(Some(f.path())).expect("load config");
        assert_eq!(cfg.workers.retry_limit, 7);
        assert_eq!(cfg.queue.drain_timeout(), Duration::from_secs(5));
        // untouched values keep their defaults
        assert_eq!(cfg.workers.concurrency, 0);
        assert_eq!(cfg.queue.topic, "grader-submissions");
        assert_eq!(cfg.server.port, 8090);
        validate_config(&cfg).expect("valid");
    }

    #[test]
    fn env_overrides() {
        let _env = ENV_LOCK.lock().unwrap();
        let keys = [
            "GRADER_SERVER_PORT",
            "GRADER_LOG_JSON",
            "GRADER_QUEUE_BROKER",
            "GRADER_WORKERS_CONCURRENCY",
            "GRADER_GRADING_ARGS",
            "GRADER_STATE_DIR",
        ];
        clear_env(&keys);

        std::env::set_var("GRADER_SERVER_PORT", "1234");
        std::env::set_var("GRADER_LOG_JSON", "no");
        std::env::set_var("GRADER_QUEUE_BROKER", "memory");
        std::env::set_var("GRADER_WORKERS_CONCURRENCY", "6");
        std::env::set_var("GRADER_GRADING_ARGS", "--a, --b");
        std::env::set_var("GRADER_STATE_DIR", "/var/lib/grader");

        let cfg = load_config::<&Path>(None).expect("load config");
        clear_env(&keys);

        assert_eq!(cfg.server.port, 1234);
        assert!(!cfg.logging.json);
        assert_eq!(cfg.queue.broker, BROKER_MEMORY);
        assert_eq!(cfg.workers.concurrency, 6);
        assert_eq!(cfg.grading.args, vec!["--a", "--b"]);
        assert_eq!(cfg.storage.state_dir, "/var/lib/grader");
    }

    #[test]
    fn invalid_env_value_is_a_parse_error() {
        let _env = ENV_LOCK.lock().unwrap();
        std::env::set_var("GRADER_WORKERS_RETRY_LIMIT", "many");
        let result = load_config::<&Path>(None);
        std::env::remove_var("GRADER_WORKERS_RETRY_LIMIT");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn csv_split() {
        let parts = split_csv("--a, --b, , --c");
        assert_eq!(parts, vec!["--a", "--b", "--c"]);
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert!(validate_config(&Config::default()).is_ok());

        let mut cfg = Config::default();
        cfg.queue.broker = "kafka".into();
        assert!(matches!(
            validate_config(&cfg),
            Err(ConfigError::Validation(_))
        ));

        let mut cfg = Config::default();
        cfg.queue.topic = "../escape".into();
        assert!(validate_config(&cfg).is_err());

        let mut cfg = Config::default();
        cfg.queue.reconnect_initial_ms = 20_000;
        assert!(validate_config(&cfg).is_err());

        let mut cfg = Config::default();
        cfg.grading.command = Some("  ".into());
        assert!(validate_config(&cfg).is_err());

        let mut cfg = Config::default();
        cfg.server.host = "bad host!".into();
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn spool_visibility_must_outlast_grading() {
        let mut cfg = Config::default();
        assert!(cfg.queue.visibility_timeout_secs > cfg.grading.timeout_secs);

        cfg.grading.timeout_secs = cfg.queue.visibility_timeout_secs;
        let err = validate_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("visibility_timeout_secs"));

        // The memory broker has no visibility timeout.
        cfg.queue.broker = BROKER_MEMORY.into();
        assert!(validate_config(&cfg).is_ok());
    }
}
