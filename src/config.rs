use std::time::Duration;

use serde::Deserialize;

use crate::core::{CacheError, Result};
use crate::transaction::ParticipationMode;

/// Cache-wide transaction settings
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long a transaction may wait on other transactions
    pub transaction_timeout: Duration,

    /// Retries granted to `TransactionManager::execute` for retriable failures
    pub max_retries: u32,

    /// Base pause between retries, multiplied by the attempt number
    pub retry_backoff: Duration,

    /// Participation mode of newly started transactions
    pub participation: ParticipationMode,

    /// Upper bound of compare-and-set attempts per enrollment
    pub cas_attempts: usize,

    /// Refuse to wait when the wait chain leads back to the waiter
    pub detect_deadlocks: bool,
}

/// Millisecond-based document accepted by [`CacheConfig::from_json`]
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigDocument {
    transaction_timeout_ms: Option<u64>,
    max_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
    participation: Option<ParticipationMode>,
    cas_attempts: Option<usize>,
    detect_deadlocks: Option<bool>,
}

impl CacheConfig {
    pub fn new() -> Self {
        Self {
            transaction_timeout: Duration::from_secs(60),
            max_retries: 10,
            retry_backoff: Duration::from_millis(5),
            participation: ParticipationMode::ReadLocked,
            cas_attempts: 1024,
            detect_deadlocks: true,
        }
    }

    pub fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn participation(mut self, mode: ParticipationMode) -> Self {
        self.participation = mode;
        self
    }

    pub fn cas_attempts(mut self, attempts: usize) -> Self {
        self.cas_attempts = attempts;
        self
    }

    pub fn detect_deadlocks(mut self, enabled: bool) -> Self {
        self.detect_deadlocks = enabled;
        self
    }

    /// Parse a JSON document; absent fields keep their defaults.
    ///
    /// ```ignore
    /// let config = CacheConfig::from_json(
    ///     r#"{"transaction_timeout_ms": 2000, "participation": "optimistic_locking"}"#
    /// )?;
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let doc: ConfigDocument = serde_json::from_str(json)
            .map_err(|e| CacheError::Config(format!("invalid config document: {}", e)))?;

        let mut config = Self::new();
        if let Some(ms) = doc.transaction_timeout_ms {
            config.transaction_timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = doc.max_retries {
            config.max_retries = retries;
        }
        if let Some(ms) = doc.retry_backoff_ms {
            config.retry_backoff = Duration::from_millis(ms);
        }
        if let Some(mode) = doc.participation {
            config.participation = mode;
        }
        if let Some(attempts) = doc.cas_attempts {
            config.cas_attempts = attempts;
        }
        if let Some(enabled) = doc.detect_deadlocks {
            config.detect_deadlocks = enabled;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.transaction_timeout.is_zero() {
            return Err(CacheError::Config(
                "transaction_timeout must be > 0".to_string(),
            ));
        }

        if self.cas_attempts == 0 {
            return Err(CacheError::Config("cas_attempts must be > 0".to_string()));
        }

        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new()
    }
}
