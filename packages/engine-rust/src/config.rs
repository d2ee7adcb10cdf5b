//! Engine configuration.
//!
//! Every section has production defaults, and a partial JSON document only
//! overrides the fields it names.

use std::time::Duration;

use junction_core::ContextConfig;
use serde::Deserialize;

/// Top-level configuration for a [`RoutingEngine`](crate::RoutingEngine).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub fork_join: ForkJoinConfig,
    pub scheduler: SchedulerConfig,
    pub context: ContextConfig,
    pub transactions: TransactionConfig,
}

impl EngineConfig {
    /// Parses and validates a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and the matching
    /// validation error for out-of-range values.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.fork_join.validate()?;
        if self.scheduler.max_in_flight == 0 {
            return Err(ConfigError::ZeroInFlight);
        }
        if self.context.max_call_stack_depth == 0 {
            return Err(ConfigError::ZeroCallStackDepth);
        }
        if self.transactions.default_timeout_ms == 0 {
            return Err(ConfigError::ZeroTransactionTimeout);
        }
        Ok(())
    }
}

/// Fork-join strategy settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ForkJoinConfig {
    /// Routes allowed in flight at once. `1` runs routes inline, one after
    /// another; `usize::MAX` is unbounded.
    pub max_concurrency: usize,
    /// Run every route and report all failures together instead of failing on
    /// the first one.
    pub delay_errors: bool,
    /// Per-route timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl Default for ForkJoinConfig {
    fn default() -> Self {
        Self {
            max_concurrency: usize::MAX,
            delay_errors: true,
            timeout_ms: None,
        }
    }
}

impl ForkJoinConfig {
    #[must_use]
    pub fn sequential() -> Self {
        Self {
            max_concurrency: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    #[must_use]
    pub fn with_delay_errors(mut self, delay_errors: bool) -> Self {
        self.delay_errors = delay_errors;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroConcurrency`] when no route could ever run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(())
    }
}

/// Settings for the default Tokio-backed scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tasks the scheduler accepts before rejecting submissions.
    pub max_in_flight: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1000,
        }
    }
}

/// Resource manager settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Timeout of new transactions in milliseconds.
    pub default_timeout_ms: u64,
    /// How long `stop` waits for in-flight transactions. Defaults to twice
    /// the transaction timeout.
    pub shutdown_timeout_ms: Option<u64>,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 60_000,
            shutdown_timeout_ms: None,
        }
    }
}

impl TransactionConfig {
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(
            self.shutdown_timeout_ms
                .unwrap_or_else(|| self.default_timeout_ms.saturating_mul(2)),
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("fork_join.max_concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("scheduler.max_in_flight must be at least 1")]
    ZeroInFlight,
    #[error("context.max_call_stack_depth must be at least 1")]
    ZeroCallStackDepth,
    #[error("transactions.default_timeout_ms must be at least 1")]
    ZeroTransactionTimeout,
}
