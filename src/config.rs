//! Worker configuration
//!
//! Built once at startup from the environment and handed to each component.
//! Nothing below `main` reads environment variables directly.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::cache::LineEndingPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("API_TOKEN is not set")]
    MissingApiToken,
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Broker connection settings
#[derive(Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub queue: String,
    /// AMQP heartbeat in seconds
    pub heartbeat_secs: u16,
    /// Fixed delay between reconnect attempts
    pub reconnect_delay: Duration,
}

/// Backend API settings
#[derive(Clone)]
pub struct BackendConfig {
    /// Base URI without the `/api/v1` suffix
    pub base_uri: String,
    pub api_token: String,
}

const REDACTED: &str = "<redacted>";

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &REDACTED)
            .field("queue", &self.queue)
            .field("heartbeat_secs", &self.heartbeat_secs)
            .field("reconnect_delay", &self.reconnect_delay)
            .finish()
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("base_uri", &self.base_uri)
            .field("api_token", &REDACTED)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub broker: BrokerConfig,
    pub backend: BackendConfig,
    pub cache_dir: PathBuf,
    pub eval_timeout: Duration,
    pub line_endings: LineEndingPolicy,
}

impl WorkerConfig {
    /// Load configuration from process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let api_token = lookup("API_TOKEN")
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingApiToken)?;

        let broker = BrokerConfig {
            host: get("RABBITMQ_HOST", "localhost"),
            port: parse_key(&lookup, "RABBITMQ_PORT", 5672)?,
            user: get("RABBITMQ_USER", "nsm"),
            password: get("RABBITMQ_PASS", "nsm_password"),
            queue: get("RABBITMQ_QUEUE", "evaluation_queue"),
            heartbeat_secs: parse_key(&lookup, "RABBITMQ_HEARTBEAT_SECS", 600)?,
            reconnect_delay: Duration::from_secs(parse_key(&lookup, "RECONNECT_DELAY_SECS", 5)?),
        };

        let backend = BackendConfig {
            base_uri: get("BACKEND_URI", "http://localhost:3000")
                .trim_end_matches('/')
                .to_string(),
            api_token,
        };

        Ok(Self {
            broker,
            backend,
            cache_dir: PathBuf::from(get("EVAL_CACHE_DIR", "/tmp/nsm-remote-eval-cache")),
            eval_timeout: Duration::from_secs(parse_key(&lookup, "EVAL_TIMEOUT_SECS", 300)?),
            line_endings: parse_key(&lookup, "EVAL_LINE_ENDINGS", LineEndingPolicy::TextOnly)?,
        })
    }
}

fn parse_key<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}
