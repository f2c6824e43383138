// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Classification of refresh failures.
//!
//! Only [`RefreshFailure::Unauthorized`] ends a session. Everything else is
//! surfaced through `refresh_error` and left to the retry policy or the next
//! trigger: treating every non-2xx as a logout would destroy valid sessions
//! on ordinary transient errors.

use std::fmt;

use serde::Deserialize;

/// Maximum length of a raw response body quoted in an error message.
const MAX_BODY_EXCERPT: usize = 200;

/// Why a refresh attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    /// The refresh credential is invalid, expired, or revoked.
    Unauthorized(String),
    /// Permission-shaped rejection (e.g. anti-forgery token mismatch).
    Forbidden(String),
    /// Rate limited, optionally with a `Retry-After` hint in seconds.
    RateLimited { retry_after_secs: Option<u64>, message: String },
    /// The request never produced a response.
    Network(String),
    /// The request exceeded its timeout.
    Timeout,
    /// Any other non-success status.
    Server { status: u16, message: String },
    /// A success status with a body that is not a token grant.
    Malformed(String),
    /// The session was ended (logout) while the refresh was in flight; the
    /// new token was discarded.
    SessionEnded,
}

/// JSON error envelope; backends disagree on the field name.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl RefreshFailure {
    /// Classify a non-success refresh response.
    ///
    /// 401 is definitive, 403 is not. An OAuth-style `invalid_grant` body is
    /// treated as a 401 whatever the status.
    pub fn from_response(status: u16, retry_after_secs: Option<u64>, body: &str) -> Self {
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
        let invalid_grant = parsed.error.as_deref() == Some("invalid_grant");
        let message = parsed
            .error_description
            .or(parsed.detail)
            .or(parsed.message)
            .or(parsed.error)
            .unwrap_or_else(|| excerpt(body, status));

        match status {
            401 => Self::Unauthorized(message),
            _ if invalid_grant => Self::Unauthorized(message),
            403 => Self::Forbidden(message),
            429 => Self::RateLimited { retry_after_secs, message },
            _ => Self::Server { status, message },
        }
    }

    /// Whether this failure ends the session (clear state, broadcast logout).
    pub fn is_definitive(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    /// Whether the retry loop should try again after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Network(_)
                | Self::Timeout
                | Self::Server { .. }
                | Self::Malformed(_)
        )
    }

    /// Server-supplied retry hint, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs, .. } => *retry_after_secs,
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Network(_) => "NETWORK",
            Self::Timeout => "TIMEOUT",
            Self::Server { .. } => "SERVER",
            Self::Malformed(_) => "MALFORMED",
            Self::SessionEnded => "SESSION_ENDED",
        }
    }
}

impl fmt::Display for RefreshFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthorized(msg) | Self::Forbidden(msg) | Self::Network(msg) => {
                write!(f, "{}: {msg}", self.as_str())
            }
            Self::RateLimited { retry_after_secs: Some(secs), message } => {
                write!(f, "{}: {message} (retry after {secs}s)", self.as_str())
            }
            Self::RateLimited { retry_after_secs: None, message } => {
                write!(f, "{}: {message}", self.as_str())
            }
            Self::Timeout => f.write_str("TIMEOUT: refresh request timed out"),
            Self::Server { status, message } => write!(f, "{}: HTTP {status}: {message}", self.as_str()),
            Self::Malformed(msg) => write!(f, "{}: {msg}", self.as_str()),
            Self::SessionEnded => f.write_str("SESSION_ENDED: session ended during refresh"),
        }
    }
}

impl std::error::Error for RefreshFailure {}

fn excerpt(body: &str, status: u16) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return format!("HTTP {status}");
    }
    match trimmed.char_indices().nth(MAX_BODY_EXCERPT) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_owned(),
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
