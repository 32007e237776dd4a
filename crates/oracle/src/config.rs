//! Oracle configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{OracleError, OracleResult};

/// Configuration for payment reconciliation
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Interval between reconciliation passes (seconds)
    pub poll_interval_secs: u64,
    /// Number of recent signatures fetched per merchant address
    pub fetch_limit: usize,
    /// Relative amount tolerance when matching (0.05 = ±5%)
    pub amount_tolerance: f64,
    /// Absolute tolerance floor for near-zero amounts
    pub absolute_tolerance: f64,
    /// How far before intent creation a transaction may be timestamped (seconds)
    pub clock_skew_secs: u64,
    /// Maximum distance between intent creation and block time (seconds)
    pub match_window_secs: u64,
    /// Lifetime of a pending payment (seconds)
    pub payment_ttl_secs: u64,
    /// Timeout for a single transaction-source call (milliseconds)
    pub rpc_timeout_ms: u64,
    /// Attempts per transaction-source call
    pub max_retries: u32,
    /// Initial retry backoff, doubled per attempt (milliseconds)
    pub retry_backoff_ms: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            fetch_limit: 100,
            amount_tolerance: 0.05,
            absolute_tolerance: 0.000_001, // 1000 lamports
            clock_skew_secs: 300,          // 5 minutes
            match_window_secs: 86_400,     // 24 hours
            payment_ttl_secs: 3_600,       // 1 hour
            rpc_timeout_ms: 10_000,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl OracleConfig {
    /// Reject values the engine cannot run with
    pub fn validate(&self) -> OracleResult<()> {
        if self.poll_interval_secs == 0 {
            return Err(invalid("poll_interval_secs must be at least 1"));
        }
        if self.fetch_limit == 0 {
            return Err(invalid("fetch_limit must be at least 1"));
        }
        if !(self.amount_tolerance.is_finite() && self.amount_tolerance >= 0.0) {
            return Err(invalid("amount_tolerance must be a non-negative number"));
        }
        if !(self.absolute_tolerance.is_finite() && self.absolute_tolerance >= 0.0) {
            return Err(invalid("absolute_tolerance must be a non-negative number"));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(invalid("rpc_timeout_ms must be at least 1"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn payment_ttl_ms(&self) -> i64 {
        self.payment_ttl_secs as i64 * 1000
    }

    pub fn clock_skew_ms(&self) -> i64 {
        self.clock_skew_secs as i64 * 1000
    }

    pub fn match_window_ms(&self) -> i64 {
        self.match_window_secs as i64 * 1000
    }

    /// Set the polling interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_secs = interval.as_secs().max(1);
        self
    }

    /// Set the pending-payment lifetime
    pub fn with_payment_ttl(mut self, ttl: Duration) -> Self {
        self.payment_ttl_secs = ttl.as_secs();
        self
    }

    /// Set per-call timeout and retry policy
    pub fn with_retry(mut self, timeout: Duration, max_retries: u32, backoff: Duration) -> Self {
        self.rpc_timeout_ms = timeout.as_millis() as u64;
        self.max_retries = max_retries;
        self.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }
}

fn invalid(reason: &str) -> OracleError {
    OracleError::InvalidInput(format!("config: {}", reason))
}
