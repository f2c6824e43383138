// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Compile-time tunables.
//!
//! There is no file or command-line configuration: every knob is a constant
//! below, gathered into [`SessionConfig::default`]. Tests and embedders may
//! build their own value (e.g. to shrink the retry ceiling).

use std::time::Duration;

use crate::backoff::BackoffPolicy;

/// How often the background timer re-evaluates the token.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Window in which repeated "tab became visible" signals collapse into one check.
pub const DEFAULT_VISIBILITY_DEBOUNCE: Duration = Duration::from_secs(1);

/// Refresh this long before the token expires.
pub const DEFAULT_REFRESH_THRESHOLD: Duration = Duration::from_secs(60);

/// Upper bound of the random extension added to the refresh threshold.
pub const DEFAULT_THRESHOLD_JITTER: Duration = Duration::from_secs(5);

/// Consecutive failed refresh attempts before the session is given up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Base delay for exponential retry backoff.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Maximum delay between retries, server hints included.
pub const DEFAULT_BACKOFF_CEILING: Duration = Duration::from_secs(30);

/// Minimum delay honoured when the server sends `Retry-After`.
pub const DEFAULT_RETRY_AFTER_FLOOR: Duration = Duration::from_secs(1);

/// Timeout for a single refresh or logout request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Name of the origin-scoped native broadcast channel.
pub const BROADCAST_CHANNEL_NAME: &str = "sessionkeeper-auth";

/// Key used as the signal carrier by the storage fallback transport.
pub const STORAGE_BROADCAST_KEY: &str = "sessionkeeper:auth-broadcast";

/// `refresh_error` value while the page is offline.
pub const OFFLINE_ERROR: &str = "offline: token refresh postponed until the network returns";

/// Path of the refresh endpoint relative to the API base URL.
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Path of the logout endpoint relative to the API base URL.
pub const LOGOUT_PATH: &str = "/auth/logout";

/// Tunables for one tab's token lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub refresh_interval: Duration,
    pub visibility_debounce: Duration,
    pub refresh_threshold: Duration,
    pub threshold_jitter: Duration,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub request_timeout: Duration,
    pub channel_name: String,
    pub storage_key: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            visibility_debounce: DEFAULT_VISIBILITY_DEBOUNCE,
            refresh_threshold: DEFAULT_REFRESH_THRESHOLD,
            threshold_jitter: DEFAULT_THRESHOLD_JITTER,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            channel_name: BROADCAST_CHANNEL_NAME.to_owned(),
            storage_key: STORAGE_BROADCAST_KEY.to_owned(),
        }
    }
}

/// Join an API base URL and an endpoint path without doubling slashes.
pub fn endpoint_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
