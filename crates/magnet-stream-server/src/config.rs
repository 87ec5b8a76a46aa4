//! Configuration loading and parsing.
//!
//! Values are layered: built-in defaults, then the optional TOML file, then
//! environment overrides, then CLI flags (applied in `startup`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::session::acquisition::RetryPolicy;

const DEFAULT_BIND: &str = "0.0.0.0:3000";
const DEFAULT_CONTENT_DIR: &str = "downloads";
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 5_000;
const DEFAULT_CLEANUP_DELAY_MS: u64 = 120_000;
const DEFAULT_METADATA_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Top-level server configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address (host:port).
    pub bind: Option<String>,
    /// Directory holding one sub-directory per info hash.
    pub content_dir: Option<String>,
    /// Acquisition retries after the first failed attempt.
    pub max_retries: Option<u32>,
    /// Base delay for linear retry backoff.
    pub retry_base_delay_ms: Option<u64>,
    /// Idle time before an unused session is evicted.
    pub cleanup_delay_ms: Option<u64>,
    /// Per-attempt metadata timeout (default 60000); `0` disables it.
    pub metadata_timeout_ms: Option<u64>,
    /// Upper bound on session disposal at shutdown.
    pub shutdown_timeout_ms: Option<u64>,
    /// How often the local store checks for new content.
    pub poll_interval_ms: Option<u64>,
    /// Allowed CORS origins; empty or absent allows any origin.
    pub cors_allowed_origins: Option<Vec<String>>,
}

/// Resolved session lifecycle settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub cleanup_delay: Duration,
    pub metadata_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            cleanup_delay: Duration::from_millis(DEFAULT_CLEANUP_DELAY_MS),
            metadata_timeout: Some(Duration::from_millis(DEFAULT_METADATA_TIMEOUT_MS)),
        }
    }
}

impl SessionConfig {
    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.retry_base_delay,
            metadata_timeout: self.metadata_timeout,
        }
    }
}

impl ServerConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<ServerConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }

    /// Apply `MAX_RETRIES`-style overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = parse_override(&lookup, "MAX_RETRIES")? {
            self.max_retries = Some(v);
        }
        if let Some(v) = parse_override(&lookup, "RETRY_BASE_DELAY_MS")? {
            self.retry_base_delay_ms = Some(v);
        }
        if let Some(v) = parse_override(&lookup, "CLEANUP_DELAY_MS")? {
            self.cleanup_delay_ms = Some(v);
        }
        if let Some(v) = parse_override(&lookup, "METADATA_TIMEOUT_MS")? {
            self.metadata_timeout_ms = Some(v);
        }
        if let Some(dir) = lookup("CONTENT_DIR").filter(|s| !s.trim().is_empty()) {
            self.content_dir = Some(dir);
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        let defaults = SessionConfig::default();
        SessionConfig {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            retry_base_delay: self
                .retry_base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
            cleanup_delay: self
                .cleanup_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.cleanup_delay),
            metadata_timeout: match self.metadata_timeout_ms {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => defaults.metadata_timeout,
            },
        }
    }
}

fn parse_override<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let value = raw
        .trim()
        .parse::<T>()
        .with_context(|| format!("parse {key}={raw}"))?;
    Ok(Some(value))
}

/// Parse the bind address, falling back to the default port 3000.
pub fn bind_from_config(cfg: &ServerConfig) -> Result<SocketAddr> {
    let bind = cfg.bind.as_deref().unwrap_or(DEFAULT_BIND);
    bind.parse().with_context(|| format!("parse bind {bind}"))
}

pub fn content_dir_from_config(cfg: &ServerConfig) -> PathBuf {
    cfg.content_dir
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONTENT_DIR))
}

pub fn shutdown_timeout_from_config(cfg: &ServerConfig) -> Duration {
    Duration::from_millis(cfg.shutdown_timeout_ms.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_MS))
}

pub fn poll_interval_from_config(cfg: &ServerConfig) -> Duration {
    Duration::from_millis(cfg.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS).max(10))
}

/// Allowed CORS origins; `None` means any origin.
pub fn cors_origins_from_config(cfg: &ServerConfig) -> Option<Vec<String>> {
    cfg.cors_allowed_origins
        .clone()
        .filter(|origins| !origins.is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ServerConfig::default().session_config();
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.retry_base_delay, Duration::from_millis(5000));
        assert_eq!(cfg.cleanup_delay, Duration::from_millis(120_000));
        assert_eq!(cfg.metadata_timeout, Some(Duration::from_secs(60)));
        assert_eq!(
            bind_from_config(&ServerConfig::default()).unwrap(),
            "0.0.0.0:3000".parse().unwrap()
        );
    }

    #[test]
    fn toml_values_are_used() {
        let cfg: ServerConfig = toml::from_str(
            r#"
            bind = "127.0.0.1:9000"
            content_dir = "/srv/torrents"
            max_retries = 5
            cleanup_delay_ms = 1000
            metadata_timeout_ms = 0
            cors_allowed_origins = []
            "#,
        )
        .unwrap();
        let session = cfg.session_config();
        assert_eq!(session.max_retries, 5);
        assert_eq!(session.cleanup_delay, Duration::from_millis(1000));
        assert_eq!(session.metadata_timeout, None);
        assert_eq!(content_dir_from_config(&cfg), PathBuf::from("/srv/torrents"));
        assert_eq!(cors_origins_from_config(&cfg), None);
    }

    #[test]
    fn env_overrides_win_over_file() {
        let mut cfg = ServerConfig {
            max_retries: Some(5),
            ..ServerConfig::default()
        };
        let env: HashMap<&str, &str> = HashMap::from([
            ("MAX_RETRIES", "1"),
            ("RETRY_BASE_DELAY_MS", "250"),
            ("METADATA_TIMEOUT_MS", "30000"),
        ]);
        cfg.apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        let session = cfg.session_config();
        assert_eq!(session.max_retries, 1);
        assert_eq!(session.retry_base_delay, Duration::from_millis(250));
        assert_eq!(session.metadata_timeout, Some(Duration::from_secs(30)));
        assert_eq!(session.cleanup_delay, Duration::from_millis(120_000));
    }

    #[test]
    fn malformed_override_is_an_error() {
        let mut cfg = ServerConfig::default();
        let result = cfg.apply_overrides(|key| (key == "CLEANUP_DELAY_MS").then(|| "soon".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<ServerConfig>("media_dir = \"/music\"").is_err());
    }
}
