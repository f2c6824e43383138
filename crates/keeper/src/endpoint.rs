// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Backend auth endpoints (refresh and logout).
//!
//! [`AuthEndpoint`] is the seam the coordinator talks to; [`HttpEndpoint`] is
//! the reqwest implementation. The refresh credential normally travels as an
//! httpOnly cookie held in the client's cookie store; an in-memory fallback
//! token, when present, is sent in the JSON body as a second channel.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Once;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{endpoint_url, LOGOUT_PATH, REFRESH_PATH};
use crate::error::RefreshFailure;
use crate::state::UserProfile;

/// Boxed future returned by [`AuthEndpoint`] methods.
pub type EndpointFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Credentials returned by login or refresh.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// Lifetime of `access_token` in seconds.
    pub expires_in: u64,
    /// Rotated refresh credential, when the server hands one out in the body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserProfile>,
}

impl TokenGrant {
    pub fn new(access_token: impl Into<String>, expires_in: u64) -> Self {
        Self { access_token: access_token.into(), expires_in, refresh_token: None, user: None }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_user(mut self, user: UserProfile) -> Self {
        self.user = Some(user);
        self
    }
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("user", &self.user.as_ref().map(|u| &u.id))
            .finish()
    }
}

/// The backend's refresh and logout operations.
///
/// Object-safe for use as `Arc<dyn AuthEndpoint>`.
pub trait AuthEndpoint: Send + Sync + 'static {
    /// Exchange the refresh credential for a new access token.
    fn refresh<'a>(
        &'a self,
        fallback_refresh_token: Option<&'a str>,
    ) -> EndpointFuture<'a, Result<TokenGrant, RefreshFailure>>;

    /// Invalidate the session server-side. Best-effort.
    fn logout<'a>(
        &'a self,
        fallback_refresh_token: Option<&'a str>,
    ) -> EndpointFuture<'a, anyhow::Result<()>>;
}

#[derive(Serialize)]
struct CredentialBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<&'a str>,
}

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider for reqwest/rustls.
/// Idempotent; later calls are no-ops.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Refresh/logout over HTTP with a cookie-carrying reqwest client.
pub struct HttpEndpoint {
    client: reqwest::Client,
    refresh_url: String,
    logout_url: String,
}

impl HttpEndpoint {
    /// Build an endpoint with its own cookie store and request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        ensure_crypto();
        let client = reqwest::Client::builder().cookie_store(true).timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Use an existing client (sharing its cookie store with the rest of
    /// the application).
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            refresh_url: endpoint_url(base_url, REFRESH_PATH),
            logout_url: endpoint_url(base_url, LOGOUT_PATH),
        }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    async fn do_refresh(&self, fallback: Option<&str>) -> Result<TokenGrant, RefreshFailure> {
        debug!(url = %self.refresh_url, has_fallback = fallback.is_some(), "POST refresh");
        let resp = self
            .client
            .post(&self.refresh_url)
            .json(&CredentialBody { refresh_token: fallback })
            .send()
            .await
            .map_err(transport_failure)?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = resp.text().await.map_err(transport_failure)?;

        if !status.is_success() {
            return Err(RefreshFailure::from_response(status.as_u16(), retry_after, &body));
        }

        serde_json::from_str::<TokenGrant>(&body)
            .map_err(|e| RefreshFailure::Malformed(format!("parse refresh response: {e}")))
    }

    async fn do_logout(&self, fallback: Option<&str>) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(&self.logout_url)
            .json(&CredentialBody { refresh_token: fallback })
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("logout failed ({})", resp.status());
        }
        Ok(())
    }
}

impl AuthEndpoint for HttpEndpoint {
    fn refresh<'a>(
        &'a self,
        fallback_refresh_token: Option<&'a str>,
    ) -> EndpointFuture<'a, Result<TokenGrant, RefreshFailure>> {
        Box::pin(self.do_refresh(fallback_refresh_token))
    }

    fn logout<'a>(
        &'a self,
        fallback_refresh_token: Option<&'a str>,
    ) -> EndpointFuture<'a, anyhow::Result<()>> {
        Box::pin(self.do_logout(fallback_refresh_token))
    }
}

fn transport_failure(e: reqwest::Error) -> RefreshFailure {
    if e.is_timeout() {
        RefreshFailure::Timeout
    } else {
        RefreshFailure::Network(e.to_string())
    }
}

#[cfg(test)]
#[path = "endpoint_tests.rs"]
mod tests;
