//! Process-wide timeout policy
//!
//! Built once at startup and threaded into every [`Q`](crate::Q) by value.

use std::time::Duration;

use crate::error::{DbError, Result};

/// Default deadline applied to every query that has no explicit context.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default `lock_timeout` applied to each transaction.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(15);

/// Default `idle_in_transaction_session_timeout` applied to each transaction.
pub const DEFAULT_IDLE_IN_TX_SESSION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Query deadline plus the per-transaction session guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    default_query_timeout: Duration,
    lock_timeout: Duration,
    idle_in_tx_session_timeout: Duration,
}

impl TimeoutPolicy {
    /// Build a policy, rejecting zero durations.
    ///
    /// Postgres reads `0` as "no timeout", which would silently unbound the
    /// very waits this policy exists to bound.
    pub fn new(
        default_query_timeout: Duration,
        lock_timeout: Duration,
        idle_in_tx_session_timeout: Duration,
    ) -> Result<Self> {
        for (name, value) in [
            ("default_query_timeout", default_query_timeout),
            ("lock_timeout", lock_timeout),
            ("idle_in_tx_session_timeout", idle_in_tx_session_timeout),
        ] {
            if value.as_millis() == 0 {
                return Err(DbError::InvalidPolicy {
                    reason: format!("{name} must be at least 1ms"),
                });
            }
        }
        Ok(Self {
            default_query_timeout,
            lock_timeout,
            idle_in_tx_session_timeout,
        })
    }

    pub fn default_query_timeout(&self) -> Duration {
        self.default_query_timeout
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn idle_in_tx_session_timeout(&self) -> Duration {
        self.idle_in_tx_session_timeout
    }

    /// Statement run right after BEGIN. `SET LOCAL` scopes both values to the
    /// transaction, so the pooled connection is unaffected afterwards.
    pub fn session_timeouts_sql(&self) -> String {
        format!(
            "SET LOCAL lock_timeout = {}; SET LOCAL idle_in_transaction_session_timeout = {};",
            self.lock_timeout.as_millis(),
            self.idle_in_tx_session_timeout.as_millis()
        )
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            default_query_timeout: DEFAULT_QUERY_TIMEOUT,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            idle_in_tx_session_timeout: DEFAULT_IDLE_IN_TX_SESSION_TIMEOUT,
        }
    }
}
