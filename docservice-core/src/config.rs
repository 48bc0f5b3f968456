//! Service and transaction configuration.
//!
//! Both types deserialize with `serde`, so they can be embedded in an application's own
//! configuration file. Missing keys fall back to the defaults.
//!
//! ```ignore
//! let config: ServiceConfig = serde_json::from_str(r#"{ "retry": { "max_retries": 5 } }"#)?;
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a [`TransactionManager`](crate::transaction::TransactionManager) reacts to transient
/// failures.
///
/// The first attempt runs immediately. Each retry waits a backoff that doubles from
/// `backoff_ms` and never exceeds `backoff_cap_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries allowed after the first attempt. Zero runs the transaction once.
    pub max_retries: usize,
    /// Wait before the first retry, in milliseconds.
    pub backoff_ms: u64,
    /// Upper bound of any single wait, in milliseconds.
    pub backoff_cap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 10,
            backoff_cap_ms: 100,
        }
    }
}

impl RetryConfig {
    /// A policy that gives up on the first transient failure.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.backoff_ms = backoff_ms;
        self
    }

    pub fn with_backoff_cap_ms(mut self, backoff_cap_ms: u64) -> Self {
        self.backoff_cap_ms = backoff_cap_ms;
        self
    }

    /// The wait before retry number `retry`, counting from 1.
    pub fn backoff_before(&self, retry: usize) -> Duration {
        let doublings = u32::try_from(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        let factor = 2u64.checked_pow(doublings).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor).min(self.backoff_cap_ms))
    }
}

/// Per-service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Drop `null` fields from insert mappings instead of storing them.
    pub exclude_null_on_insert: bool,
    /// How many rule-driven deletes may nest inside one another before the outermost
    /// deletion fails with [`ServiceError::CascadeTooDeep`](crate::error::ServiceError::CascadeTooDeep).
    pub max_cascade_depth: usize,
    /// Retry policy for transactional writes.
    pub retry: RetryConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            exclude_null_on_insert: false,
            max_cascade_depth: 32,
            retry: RetryConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn with_exclude_null_on_insert(mut self, exclude: bool) -> Self {
        self.exclude_null_on_insert = exclude;
        self
    }

    pub fn with_max_cascade_depth(mut self, depth: usize) -> Self {
        self.max_cascade_depth = depth;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}
