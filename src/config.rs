//! # Worker Configuration
//!
//! ## Responsibility
//! Load worker configuration from environment variables, with an optional
//! dotenv-style `KEY=VALUE` file applied first. Every key has a documented
//! default so a worker can start against a local NATS with no configuration
//! at all.
//!
//! ## Guarantees
//! - Deterministic: the same environment always produces the same `Config`
//! - Forgiving: malformed numeric/duration values fall back to the default
//! - Self-contained: no TOML/YAML machinery, just `KEY=VALUE`
//!
//! ## NOT Responsible For
//! - Validating that the NATS server or model file actually exist
//!   (startup wiring does that)

use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read env file {path}: {source}")]
    EnvFile {
        path: String,
        source: std::io::Error,
    },
}

/// Complete worker configuration.
///
/// Serializable so the startup event can record the effective configuration
/// in full; there are no secrets here.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    // Messaging bus
    pub nats_url: String,
    pub stream: String,
    pub subject: String,
    pub durable: String,
    pub queue_group: String,
    pub response_prefix: String,
    pub max_msgs: i64,
    #[serde(skip)]
    pub max_age: Duration,
    #[serde(skip)]
    pub ack_wait: Duration,
    pub max_deliver: i64,
    pub max_ack_pending: i64,
    pub concurrency: usize,

    // HTTP
    pub http_addr: String,

    // Model
    pub model_name: String,
    pub model_url: String,
    pub model_path: String,
    pub model_format: String,
    pub threads: usize,
    pub ctx_size: usize,
    pub grammar_enabled: bool,

    // Backpressure / monitoring
    pub backpressure_threshold: i64,
    pub monitoring_topic: String,

    // Data & persistence
    pub data_dir: String,
    pub db_path: String,

    // Format-specific sub-map (e.g. harmony reasoning/identity/cutoff)
    pub format_config: HashMap<String, serde_json::Value>,
}

impl Config {
    /// Load configuration from the environment, optionally seeding the
    /// environment from a `KEY=VALUE` file first.
    ///
    /// A missing or unreadable env file is logged and ignored; an explicit
    /// path that cannot be read is not fatal because the environment may
    /// already carry everything needed.
    pub fn load(env_file: Option<&str>) -> Result<Self, ConfigError> {
        if let Some(path) = env_file {
            match load_dotenv(path) {
                Ok(n) => info!(file = path, entries = n, "environment loaded"),
                Err(e) => warn!(file = path, error = %e, "could not load env file"),
            }
        }

        let model_format = get_env("MODEL_FORMAT", "standard");

        Ok(Self {
            nats_url: get_env("NATS_URL", "nats://127.0.0.1:4222"),
            stream: get_env("STREAM_NAME", "INFER"),
            subject: get_env("SUBJECT", "inference.request.default"),
            durable: get_env("QUEUE_DURABLE", "infer-wq"),
            queue_group: get_env("QUEUE_GROUP", "workers"),
            response_prefix: get_env("RESPONSE_PREFIX", "inference.reply"),
            max_msgs: get_env_i64("QUEUE_MAX_MSGS", 2000),
            max_age: get_env_duration("QUEUE_MAX_AGE", Duration::from_secs(30)),
            ack_wait: get_env_duration("ACK_WAIT", Duration::from_secs(30)),
            max_deliver: get_env_i64("MAX_DELIVER", 5),
            max_ack_pending: get_env_i64("MAX_ACK_PENDING", 64),
            concurrency: get_env_usize("WORKER_CONCURRENCY", 2),
            http_addr: get_env("HTTP_ADDR", ":8081"),
            model_name: get_env("MODEL_NAME", "default"),
            model_url: get_env("MODEL_URL", ""),
            model_path: get_env("MODEL_PATH", "data/models/model.gguf"),
            model_format: model_format.clone(),
            threads: get_env_usize("MODEL_THREADS", 8),
            ctx_size: get_env_usize("CTX_SIZE", 4096),
            grammar_enabled: get_env_bool("GRAMMAR_ENABLED", true),
            backpressure_threshold: get_env_i64("BACKPRESSURE_THRESHOLD", 5),
            monitoring_topic: get_env("MONITORING_TOPIC", "monitoring.backpressure"),
            data_dir: get_env("DATA_DIR", "data"),
            db_path: get_env("DB_PATH", "data/worker.sqlite"),
            format_config: load_format_config(&model_format),
        })
    }

    /// Directory holding grammar files: `<data_dir>/grammars`.
    pub fn grammar_root(&self) -> std::path::PathBuf {
        Path::new(&self.data_dir).join("grammars")
    }

    /// The HTTP endpoint advertised in health snapshots.
    ///
    /// `HTTP_ADDR` is a bind address (`:8081` or `0.0.0.0:8081`); the
    /// advertised endpoint substitutes localhost for wildcard binds.
    pub fn http_endpoint(&self) -> String {
        let addr = self.http_addr.trim_start_matches("0.0.0.0");
        format!("http://localhost{addr}")
    }

    /// Bind address usable by a TCP listener (`:8081` → `0.0.0.0:8081`).
    pub fn http_bind_addr(&self) -> String {
        if self.http_addr.starts_with(':') {
            format!("0.0.0.0{}", self.http_addr)
        } else {
            self.http_addr.clone()
        }
    }
}

/// Seed the process environment from a `KEY=VALUE` file.
///
/// Blank lines and `#` comments are skipped. Returns the number of entries
/// applied.
fn load_dotenv(path: &str) -> Result<usize, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::EnvFile {
        path: path.to_string(),
        source,
    })?;

    let mut applied = 0;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            std::env::set_var(key.trim(), value.trim());
            applied += 1;
        }
    }
    Ok(applied)
}

fn get_env(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn get_env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => matches!(v.as_str(), "true" | "1" | "yes"),
        _ => default,
    }
}

fn get_env_duration(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_duration(&v))
        .unwrap_or(default)
}

/// Parse `"500ms"`, `"30s"`, `"5m"`, `"2h"`, or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(h) = s.strip_suffix('h') {
        return h.trim().parse::<u64>().ok().map(|v| Duration::from_secs(v * 3600));
    }
    if let Some(m) = s.strip_suffix('m') {
        return m.trim().parse::<u64>().ok().map(|v| Duration::from_secs(v * 60));
    }
    if let Some(sec) = s.strip_suffix('s') {
        return sec.trim().parse::<u64>().ok().map(Duration::from_secs);
    }
    s.parse::<u64>().ok().map(Duration::from_secs)
}

/// Assemble the format-specific sub-map from the environment.
///
/// Only the keys relevant to the active format are loaded, so an operator
/// setting `HARMONY_*` on a chatml worker gets no silent surprises.
fn load_format_config(model_format: &str) -> HashMap<String, serde_json::Value> {
    let mut config = HashMap::new();

    if model_format == "harmony" {
        config.insert(
            "reasoning_level".to_string(),
            serde_json::Value::String(get_env("HARMONY_REASONING_LEVEL", "medium")),
        );
        config.insert(
            "extract_final".to_string(),
            serde_json::Value::Bool(get_env_bool("HARMONY_EXTRACT_FINAL", true)),
        );
        config.insert(
            "model_identity".to_string(),
            serde_json::Value::String(get_env(
                "HARMONY_MODEL_IDENTITY",
                "ChatGPT, a large language model trained by OpenAI",
            )),
        );
        config.insert(
            "knowledge_cutoff".to_string(),
            serde_json::Value::String(get_env("HARMONY_KNOWLEDGE_CUTOFF", "2024-06")),
        );
    }

    if model_format == "chatml" {
        config.insert(
            "system_role".to_string(),
            serde_json::Value::String(get_env("CHATML_SYSTEM_ROLE", "system")),
        );
        config.insert(
            "user_role".to_string(),
            serde_json::Value::String(get_env("CHATML_USER_ROLE", "user")),
        );
        config.insert(
            "assistant_role".to_string(),
            serde_json::Value::String(get_env("CHATML_ASSISTANT_ROLE", "assistant")),
        );
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serialise tests that mutate the process environment.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults_applied_with_empty_env() {
        let _guard = ENV_MUTEX.lock().unwrap();
        for key in [
            "NATS_URL",
            "STREAM_NAME",
            "SUBJECT",
            "WORKER_CONCURRENCY",
            "BACKPRESSURE_THRESHOLD",
            "MODEL_FORMAT",
        ] {
            std::env::remove_var(key);
        }
        let cfg = Config::load(None).unwrap();
        assert_eq!(cfg.nats_url, "nats://127.0.0.1:4222");
        assert_eq!(cfg.stream, "INFER");
        assert_eq!(cfg.subject, "inference.request.default");
        assert_eq!(cfg.concurrency, 2);
        assert_eq!(cfg.backpressure_threshold, 5);
        assert_eq!(cfg.max_deliver, 5);
        assert_eq!(cfg.ack_wait, Duration::from_secs(30));
        assert!(cfg.grammar_enabled);
    }

    #[test]
    fn test_env_overrides_default() {
        let _guard = ENV_MUTEX.lock().unwrap();
        std::env::set_var("WORKER_CONCURRENCY", "7");
        std::env::set_var("MODEL_NAME", "qwen3-4b");
        let cfg = Config::load(None).unwrap();
        std::env::remove_var("WORKER_CONCURRENCY");
        std::env::remove_var("MODEL_NAME");
        assert_eq!(cfg.concurrency, 7);
        assert_eq!(cfg.model_name, "qwen3-4b");
    }

    #[test]
    fn test_malformed_int_falls_back_to_default() {
        let _guard = ENV_MUTEX.lock().unwrap();
        std::env::set_var("MAX_DELIVER", "not-a-number");
        let cfg = Config::load(None).unwrap();
        std::env::remove_var("MAX_DELIVER");
        assert_eq!(cfg.max_deliver, 5);
    }

    #[test]
    fn test_dotenv_file_seeds_environment() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.env");
        std::fs::write(
            &path,
            "# comment line\n\nSTREAM_NAME=AUDIO\nQUEUE_DURABLE = audio-wq\n",
        )
        .unwrap();

        let cfg = Config::load(path.to_str()).unwrap();
        std::env::remove_var("STREAM_NAME");
        std::env::remove_var("QUEUE_DURABLE");
        assert_eq!(cfg.stream, "AUDIO");
        assert_eq!(cfg.durable, "audio-wq");
    }

    #[test]
    fn test_missing_env_file_is_not_fatal() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let cfg = Config::load(Some("/nonexistent/path/worker.env"));
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("bogus"), None);
    }

    #[test]
    fn test_harmony_format_config_loaded_only_for_harmony() {
        let _guard = ENV_MUTEX.lock().unwrap();
        std::env::set_var("MODEL_FORMAT", "harmony");
        std::env::set_var("HARMONY_REASONING_LEVEL", "high");
        let cfg = Config::load(None).unwrap();
        std::env::remove_var("MODEL_FORMAT");
        std::env::remove_var("HARMONY_REASONING_LEVEL");
        assert_eq!(
            cfg.format_config.get("reasoning_level"),
            Some(&serde_json::Value::String("high".into()))
        );

        // Back on the default format, the harmony keys disappear.
        let cfg = Config::load(None).unwrap();
        assert!(cfg.format_config.get("reasoning_level").is_none());
    }

    #[test]
    fn test_http_endpoint_from_bare_port() {
        let _guard = ENV_MUTEX.lock().unwrap();
        std::env::remove_var("HTTP_ADDR");
        let cfg = Config::load(None).unwrap();
        assert_eq!(cfg.http_endpoint(), "http://localhost:8081");
        assert_eq!(cfg.http_bind_addr(), "0.0.0.0:8081");
    }
}
