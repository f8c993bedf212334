use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Engine configuration, loadable from a TOML file. Every field has a
/// default so a partial (or absent) file is fine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Attempts per step before the execution is marked failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff: BackoffConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub oauth: OAuthConfig,

    /// How many trailing log entries a status snapshot includes
    #[serde(default = "default_recent_log_limit")]
    pub recent_log_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Base retry delay; doubled per retry
    #[serde(default = "default_backoff_base_secs")]
    pub base_secs: u64,
    /// Upper bound on any single retry delay
    #[serde(default = "default_backoff_cap_secs")]
    pub cap_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long a claimed job may stay active before it is considered
    /// abandoned and redelivered
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Lifetime of an outstanding state correlation token
    #[serde(default = "default_state_ttl_secs")]
    pub state_ttl_secs: u64,
    /// Lifetime of a captured authorization code
    #[serde(default = "default_auth_code_ttl_secs")]
    pub auth_code_ttl_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_recent_log_limit() -> usize {
    20
}

fn default_backoff_base_secs() -> u64 {
    1
}

fn default_backoff_cap_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_visibility_timeout_secs() -> u64 {
    300
}

fn default_state_ttl_secs() -> u64 {
    600
}

fn default_auth_code_ttl_secs() -> u64 {
    60
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_secs: default_backoff_base_secs(),
            cap_secs: default_backoff_cap_secs(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
        }
    }
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            state_ttl_secs: default_state_ttl_secs(),
            auth_code_ttl_secs: default_auth_code_ttl_secs(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffConfig::default(),
            queue: QueueConfig::default(),
            oauth: OAuthConfig::default(),
            recent_log_limit: default_recent_log_limit(),
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file, falling back to defaults when the file does
    /// not exist. A present-but-invalid file is still an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Retry delay for a job that has already been retried `retry_count`
    /// times: `base * 2^retry_count`, capped. The shift is clamped so large
    /// retry counts cannot overflow.
    pub fn backoff_delay(&self, retry_count: u32) -> std::time::Duration {
        let factor = 1u64 << retry_count.min(20);
        let secs = self
            .backoff
            .base_secs
            .saturating_mul(factor)
            .min(self.backoff.cap_secs);
        std::time::Duration::from_secs(secs)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.queue.poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.queue.visibility_timeout_secs as i64)
    }

    pub fn oauth_state_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.oauth.state_ttl_secs as i64)
    }

    pub fn auth_code_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.oauth.auth_code_ttl_secs as i64)
    }
}
