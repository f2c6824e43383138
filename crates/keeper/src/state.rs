// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session state store: the one mutable record of this tab's auth status.
//!
//! Readers get snapshots or a `watch` subscription. Mutators are
//! crate-private and only called by the refresh coordinator, explicit
//! sign-in/logout, and the cross-tab receive handler.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::endpoint::TokenGrant;

/// User/session payload returned alongside a token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Fields this crate does not interpret, kept for the application.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Snapshot of a tab's auth status.
#[derive(Clone, Default, PartialEq)]
pub struct SessionState {
    pub access_token: Option<String>,
    /// Absolute expiry in epoch millis.
    pub token_expires_at: Option<u64>,
    /// In-memory fallback for the refresh credential. Never persisted.
    refresh_token: Option<String>,
    pub is_refreshing: bool,
    pub refresh_error: Option<String>,
    /// Epoch millis of the last successful refresh.
    pub last_refresh_at: Option<u64>,
    pub user: Option<UserProfile>,
    /// Bumped on every teardown so late refresh results can be discarded.
    epoch: u64,
    /// Outstanding refresh holders (retry loop, network call).
    refresh_holds: u32,
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.is_some()
    }

    /// Milliseconds until expiry, zero once expired.
    pub fn expires_in_ms(&self, now_ms: u64) -> Option<u64> {
        self.token_expires_at.map(|at| at.saturating_sub(now_ms))
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("token_expires_at", &self.token_expires_at)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("is_refreshing", &self.is_refreshing)
            .field("refresh_error", &self.refresh_error)
            .field("last_refresh_at", &self.last_refresh_at)
            .field("user", &self.user.as_ref().map(|u| &u.id))
            .finish()
    }
}

/// Owner of a tab's [`SessionState`].
pub struct SessionStore {
    tx: watch::Sender<SessionState>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::default());
        Self { tx }
    }

    pub fn snapshot(&self) -> SessionState {
        self.tx.borrow().clone()
    }

    /// Read-only subscription for UI layers.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    pub fn access_token(&self) -> Option<String> {
        self.tx.borrow().access_token.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.tx.borrow().is_authenticated()
    }

    pub(crate) fn refresh_token(&self) -> Option<String> {
        self.tx.borrow().refresh_token.clone()
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.tx.borrow().epoch
    }

    /// Record credentials issued by a login flow. Does not count as a refresh.
    pub(crate) fn sign_in(&self, grant: &TokenGrant, now_ms: u64) {
        self.tx.send_modify(|s| {
            s.access_token = Some(grant.access_token.clone());
            s.token_expires_at = Some(expiry(now_ms, grant.expires_in));
            s.refresh_token = grant.refresh_token.clone();
            s.user = grant.user.clone();
            s.refresh_error = None;
        });
    }

    /// Apply a successful refresh, unless the session was torn down since
    /// `epoch` was read. Returns whether the grant was applied.
    pub(crate) fn apply_grant(&self, epoch: u64, grant: &TokenGrant, now_ms: u64) -> bool {
        self.tx.send_if_modified(|s| {
            if s.epoch != epoch {
                return false;
            }
            s.access_token = Some(grant.access_token.clone());
            s.token_expires_at = Some(expiry(now_ms, grant.expires_in));
            if let Some(ref rotated) = grant.refresh_token {
                s.refresh_token = Some(rotated.clone());
            }
            if let Some(ref user) = grant.user {
                s.user = Some(user.clone());
            }
            s.refresh_error = None;
            s.last_refresh_at = Some(advance(s.last_refresh_at, now_ms));
            true
        })
    }

    /// Adopt a token refreshed by a sibling tab.
    pub(crate) fn apply_remote(&self, access_token: &str, expires_in_secs: u64, now_ms: u64) {
        self.tx.send_modify(|s| {
            s.access_token = Some(access_token.to_owned());
            s.token_expires_at = Some(expiry(now_ms, expires_in_secs));
            s.refresh_error = None;
            s.last_refresh_at = Some(advance(s.last_refresh_at, now_ms));
        });
    }

    /// Tear the session down: every field cleared, fallback token dropped.
    ///
    /// A refresh still on the wire keeps `is_refreshing` set until it ends.
    pub(crate) fn clear(&self) {
        self.tx.send_modify(|s| {
            let epoch = s.epoch.wrapping_add(1);
            let refresh_holds = s.refresh_holds;
            *s = SessionState {
                epoch,
                refresh_holds,
                is_refreshing: refresh_holds > 0,
                ..SessionState::default()
            };
        });
    }

    /// Mark a refresh as outstanding. Calls nest; each must be paired with
    /// [`end_refresh`](Self::end_refresh).
    pub(crate) fn begin_refresh(&self) {
        self.tx.send_if_modified(|s| {
            s.refresh_holds = s.refresh_holds.saturating_add(1);
            !std::mem::replace(&mut s.is_refreshing, true)
        });
    }

    /// [`begin_refresh`](Self::begin_refresh), released when the returned
    /// guard drops (including on panic).
    pub(crate) fn hold_refresh(self: &Arc<Self>) -> RefreshHold {
        self.begin_refresh();
        RefreshHold(Arc::clone(self))
    }

    pub(crate) fn end_refresh(&self) {
        self.tx.send_if_modified(|s| {
            s.refresh_holds = s.refresh_holds.saturating_sub(1);
            let refreshing = s.refresh_holds > 0;
            std::mem::replace(&mut s.is_refreshing, refreshing) != refreshing
        });
    }

    pub(crate) fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_if_modified(|s| {
            if s.refresh_error.as_deref() == Some(message.as_str()) {
                return false;
            }
            s.refresh_error = Some(message);
            true
        });
    }

    pub(crate) fn clear_error(&self) {
        self.tx.send_if_modified(|s| s.refresh_error.take().is_some());
    }
}

/// Keeps `is_refreshing` set while alive.
pub(crate) struct RefreshHold(Arc<SessionStore>);

impl Drop for RefreshHold {
    fn drop(&mut self) {
        self.0.end_refresh();
    }
}

fn expiry(now_ms: u64, expires_in_secs: u64) -> u64 {
    now_ms.saturating_add(expires_in_secs.saturating_mul(1000))
}

/// Next value of the success marker: strictly greater than the previous one.
fn advance(prev: Option<u64>, now_ms: u64) -> u64 {
    match prev {
        Some(p) if now_ms <= p => p + 1,
        _ => now_ms,
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
