// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Refresh coordinator: the only path from this tab to the refresh endpoint.
//!
//! Concurrent callers share one network call through a [`SingleFlight`]
//! slot. The outcome is written to the [`SessionStore`] and, on success or
//! definitive failure, announced to sibling tabs.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::crosstab::{BroadcastMessage, Broadcaster};
use crate::endpoint::AuthEndpoint;
use crate::error::RefreshFailure;
use crate::flight::SingleFlight;
use crate::state::SessionStore;

/// Single-flight refresh against an [`AuthEndpoint`].
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: Arc<dyn AuthEndpoint>,
    store: Arc<SessionStore>,
    broadcaster: Arc<Broadcaster>,
    clock: Arc<dyn Clock>,
    /// Upper bound on one refresh call, whatever the endpoint does.
    request_timeout: Duration,
    flight: SingleFlight<Result<String, RefreshFailure>>,
}

impl RefreshCoordinator {
    pub fn new(
        endpoint: Arc<dyn AuthEndpoint>,
        store: Arc<SessionStore>,
        broadcaster: Arc<Broadcaster>,
        clock: Arc<dyn Clock>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint,
                store,
                broadcaster,
                clock,
                request_timeout,
                flight: SingleFlight::new(),
            }),
        }
    }

    /// Refresh the access token, joining any refresh already in flight.
    pub async fn refresh(&self) -> Option<String> {
        self.refresh_outcome().await.ok()
    }

    /// Like [`refresh`](Self::refresh) but keeps the classified failure.
    pub async fn refresh_outcome(&self) -> Result<String, RefreshFailure> {
        let inner = Arc::clone(&self.inner);
        let (handle, started) = self.inner.flight.join(move || run(inner));
        if !started {
            debug!("joining in-flight refresh");
        }
        match handle.await {
            Ok(outcome) => outcome,
            Err(e) => Err(RefreshFailure::Network(format!("refresh task aborted: {e}"))),
        }
    }

    /// Whether a refresh call is currently outstanding.
    pub fn is_in_flight(&self) -> bool {
        self.inner.flight.is_in_flight()
    }

    /// Tear the local session down and tell sibling tabs.
    pub(crate) fn end_session(&self, reason: &str) {
        self.inner.end_session(reason);
    }
}

impl Inner {
    fn end_session(&self, reason: &str) {
        self.store.clear();
        self.broadcaster.broadcast(BroadcastMessage::Logout);
        info!(tab = %self.broadcaster.tab(), reason, "session ended");
    }
}

async fn run(inner: Arc<Inner>) -> Result<String, RefreshFailure> {
    let epoch = inner.store.epoch();
    let fallback = inner.store.refresh_token();

    let _hold = inner.store.hold_refresh();
    let call = inner.endpoint.refresh(fallback.as_deref());
    let outcome = match tokio::time::timeout(inner.request_timeout, call).await {
        Ok(outcome) => outcome,
        Err(_) => Err(RefreshFailure::Timeout),
    };

    match outcome {
        Ok(grant) => {
            let now = inner.clock.now_ms();
            if !inner.store.apply_grant(epoch, &grant, now) {
                debug!("session ended while refreshing, discarding token");
                return Err(RefreshFailure::SessionEnded);
            }
            inner.broadcaster.broadcast(BroadcastMessage::token_refreshed(&grant));
            info!(
                tab = %inner.broadcaster.tab(),
                expires_in = grant.expires_in,
                rotated = grant.refresh_token.is_some(),
                "access token refreshed"
            );
            Ok(grant.access_token)
        }
        Err(failure) if failure.is_definitive() => {
            error!(kind = failure.as_str(), error = %failure, "refresh credential rejected");
            inner.end_session(failure.as_str());
            Err(failure)
        }
        Err(failure) => {
            warn!(kind = failure.as_str(), error = %failure, "token refresh failed");
            inner.store.set_error(failure.to_string());
            Err(failure)
        }
    }
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;
