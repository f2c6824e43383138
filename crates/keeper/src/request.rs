// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bearer-authenticated requests that keep the token fresh on their own.

use std::sync::Arc;

use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::debug;

use crate::lifecycle::Inner;

/// HTTP client bound to one tab's session.
///
/// Refreshes before sending when the token is inside the refresh
/// threshold, and replays a request once after a 401 if a refresh
/// succeeds. Requests sent without a session are never refreshed. Obtained from [`crate::TokenLifecycle::authorized_client`].
#[derive(Clone)]
pub struct AuthorizedClient {
    http: reqwest::Client,
    lifecycle: Arc<Inner>,
}

impl AuthorizedClient {
    pub(crate) fn new(http: reqwest::Client, lifecycle: Arc<Inner>) -> Self {
        Self { http, lifecycle }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Build and send a request. `build` may be called twice, so it must
    /// produce the same request each time.
    pub async fn send<F>(&self, build: F) -> anyhow::Result<Response>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let token = self.current_token().await;
        let response = authorize(build(&self.http), token.as_deref()).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        if token.is_none() {
            debug!(url = %response.url(), "anonymous request unauthorized, not refreshing");
            return Ok(response);
        }

        debug!(url = %response.url(), "request unauthorized, refreshing once");
        match self.lifecycle.coordinator().refresh().await {
            Some(fresh) => Ok(authorize(build(&self.http), Some(&fresh)).send().await?),
            None => Ok(response),
        }
    }

    async fn current_token(&self) -> Option<String> {
        let state = self.lifecycle.store().snapshot();
        let due = state.is_authenticated()
            && state.token_expires_at.is_some_and(|at| self.lifecycle.is_due(at));
        if due {
            if let Some(fresh) = self.lifecycle.coordinator().refresh().await {
                return Some(fresh);
            }
        }
        state.access_token
    }
}

fn authorize(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

#[cfg(test)]
#[path = "request_tests.rs"]
mod tests;
