//! Engine configuration
//!
//! Everything tunable lives here. The only required inputs are a database
//! URL and a provider API key; all timing and concurrency knobs have
//! production defaults.

use std::time::Duration;

use crate::error::{Error, Result};

/// Compaction tuning
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Compact when estimated session tokens exceed `trigger_ratio * max_context_tokens`
    pub trigger_ratio: f64,
    /// Model context window the budget is computed against
    pub max_context_tokens: i64,
    /// Stop compacting once the estimate drops below this
    pub target_tokens: i64,
    /// Messages inside this trailing token window are never compacted
    pub protected_tokens: i64,
    /// The last N messages are never compacted
    pub preserve_last_n: usize,
    /// Model used for the summarization phase
    pub summary_model: String,
    /// Run compaction automatically when a run completes
    pub auto_compact: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            trigger_ratio: 0.85,
            max_context_tokens: 200_000,
            target_tokens: 120_000,
            protected_tokens: 40_000,
            preserve_last_n: 10,
            summary_model: "claude-3-5-haiku-20241022".to_string(),
            auto_compact: true,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub api_key: String,
    /// Human-readable instance name (defaults to hostname-pid)
    pub instance_name: String,

    // Concurrency caps
    pub max_concurrent_runs: usize,
    pub max_concurrent_streaming_runs: usize,
    pub max_concurrent_tools: usize,
    /// Upper bound on rows taken per claim sweep
    pub claim_batch_size: i64,

    // Worker timing
    pub poll_interval: Duration,
    pub batch_poll_interval: Duration,
    pub min_batch_poll_gap: Duration,
    pub heartbeat_interval: Duration,
    pub instance_ttl: Duration,
    pub leader_ttl: Duration,
    pub rescue_timeout: Duration,
    pub max_rescue_attempts: i32,

    // Tool execution
    pub tool_execution_timeout: Duration,
    pub tool_max_attempts: i32,
    /// Jitter factor for retry backoff; 0 disables backoff entirely
    /// (failed attempts are retried immediately)
    pub tool_retry_jitter: f64,

    pub compaction: CompactionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            api_key: String::new(),
            instance_name: default_instance_name(),
            max_concurrent_runs: 10,
            max_concurrent_streaming_runs: 10,
            max_concurrent_tools: 20,
            claim_batch_size: 10,
            poll_interval: Duration::from_secs(1),
            batch_poll_interval: Duration::from_secs(30),
            min_batch_poll_gap: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(15),
            instance_ttl: Duration::from_secs(30),
            leader_ttl: Duration::from_secs(30),
            rescue_timeout: Duration::from_secs(300),
            max_rescue_attempts: 3,
            tool_execution_timeout: Duration::from_secs(60),
            tool_max_attempts: 3,
            tool_retry_jitter: 0.0,
            compaction: CompactionConfig::default(),
        }
    }
}

impl Config {
    /// Build a config from `DATABASE_URL` and `ANTHROPIC_API_KEY`
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| Error::Configuration("DATABASE_URL not set in environment".to_string()))?;
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| {
            Error::Configuration("ANTHROPIC_API_KEY not set in environment".to_string())
        })?;

        Ok(Self {
            database_url,
            api_key,
            ..Default::default()
        })
    }

    /// Validate knob sanity before start
    pub fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            return Err(Error::Configuration("database_url is required".to_string()));
        }
        if self.max_concurrent_runs == 0
            || self.max_concurrent_streaming_runs == 0
            || self.max_concurrent_tools == 0
        {
            return Err(Error::Configuration(
                "concurrency limits must be at least 1".to_string(),
            ));
        }
        if self.tool_max_attempts < 1 {
            return Err(Error::Configuration(
                "tool_max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.compaction.trigger_ratio) {
            return Err(Error::Configuration(
                "compaction.trigger_ratio must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_instance_name() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{}-{}", host, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("DATABASE_URL", "postgresql://localhost/emissary");
        std::env::set_var("ANTHROPIC_API_KEY", "test-key");
        let config = Config::from_env().unwrap();
        assert_eq!(config.database_url, "postgresql://localhost/emissary");
        assert_eq!(config.api_key, "test-key");
    }

    #[test]
    #[serial]
    fn test_from_env_missing_key() {
        std::env::set_var("DATABASE_URL", "postgresql://localhost/emissary");
        std::env::remove_var("ANTHROPIC_API_KEY");
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn test_defaults_are_valid() {
        let mut config = Config::default();
        config.database_url = "postgresql://localhost/test".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_database_url_rejected() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = Config::default();
        config.database_url = "postgresql://localhost/test".to_string();
        config.max_concurrent_tools = 0;
        assert!(config.validate().is_err());
    }
}
