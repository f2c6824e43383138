// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Retry delay computation for failed refresh attempts.

use std::time::Duration;

use rand::Rng;

use crate::config::{DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CEILING, DEFAULT_RETRY_AFTER_FLOOR};

/// Source of bounded randomness for delays and thresholds.
pub trait Jitter: Send + Sync + 'static {
    /// Return a duration in `0..=upper`.
    fn sample(&self, upper: Duration) -> Duration;
}

/// Uniform jitter from the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadJitter;

impl Jitter for ThreadJitter {
    fn sample(&self, upper: Duration) -> Duration {
        let upper_ms = upper.as_millis() as u64;
        if upper_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=upper_ms))
    }
}

/// Exponential backoff with jitter, capped, with support for server hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub ceiling: Duration,
    /// Lower bound applied to a server-supplied `Retry-After`.
    pub retry_after_floor: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            ceiling: DEFAULT_BACKOFF_CEILING,
            retry_after_floor: DEFAULT_RETRY_AFTER_FLOOR,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based).
    ///
    /// A server hint replaces the exponential term entirely; both paths are
    /// bounded by `ceiling`.
    pub fn delay(&self, attempt: u32, server_hint_secs: Option<u64>, jitter: &dyn Jitter) -> Duration {
        if let Some(secs) = server_hint_secs {
            return Duration::from_secs(secs).max(self.retry_after_floor).min(self.ceiling);
        }
        self.exponential(attempt).saturating_add(jitter.sample(self.base)).min(self.ceiling)
    }

    /// The deterministic part of [`delay`](Self::delay): `base * 2^attempt`, capped.
    pub fn exponential(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.ceiling)
    }
}

#[cfg(test)]
#[path = "backoff_tests.rs"]
mod tests;
