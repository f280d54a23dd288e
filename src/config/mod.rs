//! Configuration for jobfleet.
//!
//! Everything is read from env vars. `./.env` is loaded via dotenvy first and
//! never overrides variables that are already set.

pub(crate) mod helpers;

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_bool_env, parse_optional_env, parse_string_env};
use crate::error::ConfigError;

/// Main configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub store: StoreConfig,
    pub monitor: MonitorConfig,
    pub webhook: WebhookConfig,
    pub dispatch: DispatchConfig,
}

impl Config {
    /// Load configuration from the environment (and `.env`, if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            store: StoreConfig::resolve()?,
            monitor: MonitorConfig::resolve()?,
            webhook: WebhookConfig::resolve()?,
            dispatch: DispatchConfig::resolve()?,
        })
    }
}

/// Where session state and the webhook outbox live on disk.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub state_file: PathBuf,
    pub outbox_file: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let base = data_dir().unwrap_or_else(|| PathBuf::from(".jobfleet"));
        Self {
            state_file: base.join("sessions.json"),
            outbox_file: base.join("webhook_outbox.json"),
        }
    }
}

impl StoreConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            state_file: optional_env("JOBFLEET_STATE_FILE")?
                .map(PathBuf::from)
                .unwrap_or(defaults.state_file),
            outbox_file: optional_env("JOBFLEET_OUTBOX_FILE")?
                .map(PathBuf::from)
                .unwrap_or(defaults.outbox_file),
        })
    }
}

/// `~/.jobfleet`, if a home directory can be determined.
pub fn data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".jobfleet"))
}

/// Background polling loop settings.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Time between poll cycles.
    pub poll_interval: Duration,
    /// Cap on bytes read from a single job's output during extraction.
    pub max_log_bytes: usize,
    /// Whether finished jobs past their TTL are removed during each cycle.
    pub collect_garbage: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_log_bytes: 256 * 1024,
            collect_garbage: true,
        }
    }
}

impl MonitorConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let poll_secs: u64 = parse_optional_env("MONITOR_POLL_INTERVAL_SECS", 10)?;
        if poll_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MONITOR_POLL_INTERVAL_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            poll_interval: Duration::from_secs(poll_secs),
            max_log_bytes: parse_optional_env("MONITOR_MAX_LOG_BYTES", 256 * 1024)?,
            collect_garbage: parse_bool_env("MONITOR_COLLECT_GARBAGE", true)?,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Outbound terminal-state notification settings.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Endpoint to POST payloads to. `None` disables delivery.
    pub url: Option<String>,
    /// Sent as `Authorization: Bearer <secret>` when set.
    pub secret: Option<SecretString>,
    /// Maximum concurrent deliveries.
    pub workers: usize,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Delivery attempts before an entry is left in the outbox for the next start.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles each retry.
    pub initial_backoff: Duration,
    /// Bounded queue between the monitor and the delivery workers.
    pub queue_capacity: usize,
    /// Tail of combined job output included as `podLogs`.
    pub pod_log_bytes: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            secret: None,
            workers: 5,
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            queue_capacity: 256,
            pod_log_bytes: 16 * 1024,
        }
    }
}

impl WebhookConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let url = optional_env("WEBHOOK_URL")?;
        if let Some(ref u) = url
            && !(u.starts_with("http://") || u.starts_with("https://"))
        {
            return Err(ConfigError::InvalidValue {
                key: "WEBHOOK_URL".to_string(),
                message: format!("'{}' is not an http(s) URL", u),
            });
        }

        let workers: usize = parse_optional_env("WEBHOOK_WORKERS", 5)?;
        let max_attempts: u32 = parse_optional_env("WEBHOOK_MAX_ATTEMPTS", 3)?;

        Ok(Self {
            url,
            secret: optional_env("WEBHOOK_SECRET")?.map(SecretString::from),
            workers: workers.max(1),
            timeout: Duration::from_secs(parse_optional_env("WEBHOOK_TIMEOUT_SECS", 30)?),
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::from_millis(parse_optional_env(
                "WEBHOOK_INITIAL_BACKOFF_MS",
                1000,
            )?),
            queue_capacity: parse_optional_env("WEBHOOK_QUEUE_CAPACITY", 256)?,
            pod_log_bytes: parse_optional_env("WEBHOOK_POD_LOG_BYTES", 16 * 1024)?,
        })
    }
}

/// Job construction defaults.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Container image every job runs.
    pub image: String,
    /// Prefix for job names. Must already be a valid DNS label fragment.
    pub name_prefix: String,
    /// Seconds a finished job is kept before garbage collection.
    pub ttl_after_finished_secs: u64,
    pub memory_limit_mb: u64,
    pub cpu_shares: u32,
    /// Model used when the request doesn't name one.
    pub default_model: String,
    /// Command that starts one agent run inside the container.
    pub agent_command: String,
    /// Directory inside the container for log and queue files.
    pub log_dir: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            image: "jobfleet-agent:latest".to_string(),
            name_prefix: "jobfleet".to_string(),
            ttl_after_finished_secs: 3600,
            memory_limit_mb: 2048,
            cpu_shares: 1024,
            default_model: "sonnet".to_string(),
            agent_command: "agent run".to_string(),
            log_dir: "/tmp/jobfleet".to_string(),
        }
    }
}

impl DispatchConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let name_prefix = parse_string_env("JOB_NAME_PREFIX", "jobfleet")?;
        let valid_prefix = !name_prefix.is_empty()
            && name_prefix.len() <= 20
            && name_prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !name_prefix.starts_with('-');
        if !valid_prefix {
            return Err(ConfigError::InvalidValue {
                key: "JOB_NAME_PREFIX".to_string(),
                message: "must be 1-20 chars of [a-z0-9-], not starting with '-'".to_string(),
            });
        }

        Ok(Self {
            image: parse_string_env("JOB_IMAGE", "jobfleet-agent:latest")?,
            name_prefix,
            ttl_after_finished_secs: parse_optional_env("JOB_TTL_SECS", 3600)?,
            memory_limit_mb: parse_optional_env("JOB_MEMORY_LIMIT_MB", 2048)?,
            cpu_shares: parse_optional_env("JOB_CPU_SHARES", 1024)?,
            default_model: parse_string_env("JOB_DEFAULT_MODEL", "sonnet")?,
            agent_command: parse_string_env("JOB_AGENT_COMMAND", "agent run")?,
            log_dir: parse_string_env("JOB_LOG_DIR", "/tmp/jobfleet")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.monitor.poll_interval, Duration::from_secs(10));
        assert_eq!(config.webhook.workers, 5);
        assert_eq!(config.webhook.timeout, Duration::from_secs(30));
        assert!(config.webhook.url.is_none());
        assert_eq!(config.dispatch.name_prefix, "jobfleet");
        assert!(config.store.state_file.ends_with("sessions.json"));
    }

    #[test]
    fn test_monitor_builder() {
        let config = MonitorConfig::default().with_poll_interval(Duration::from_millis(50));
        assert_eq!(config.poll_interval, Duration::from_millis(50));
    }
}
