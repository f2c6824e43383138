// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token lifecycle: decides when this tab refreshes.
//!
//! Triggers are a recurring timer, the page becoming visible (debounced),
//! connectivity returning, and explicit calls. Every trigger funnels into
//! [`TokenLifecycle::silent_refresh`], which checks the expiry threshold and
//! hands due refreshes to the retry loop. The retry loop is itself
//! single-flight, so overlapping triggers never stack retries.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::{Jitter, ThreadJitter};
use crate::clock::{Clock, SystemClock};
use crate::config::{SessionConfig, OFFLINE_ERROR};
use crate::coordinator::RefreshCoordinator;
use crate::crosstab::{self, Broadcaster, Inbox, Origin, TabId};
use crate::endpoint::{AuthEndpoint, TokenGrant};
use crate::flight::SingleFlight;
use crate::page::{Page, PageEvent, Visibility};
use crate::request::AuthorizedClient;
use crate::state::SessionStore;

/// Per-tab token manager.
///
/// Stopped until [`start`](Self::start); dropping it stops it. Share it
/// across the application with `Arc`.
pub struct TokenLifecycle {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    config: SessionConfig,
    store: Arc<SessionStore>,
    coordinator: RefreshCoordinator,
    broadcaster: Arc<Broadcaster>,
    endpoint: Arc<dyn AuthEndpoint>,
    page: Page,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn Jitter>,
    /// Present while started.
    run: Mutex<Option<CancellationToken>>,
    ever_started: AtomicBool,
    checks: AtomicU64,
    retries: SingleFlight<Option<String>>,
}

/// Builder for [`TokenLifecycle`].
pub struct LifecycleBuilder {
    endpoint: Arc<dyn AuthEndpoint>,
    origin: Origin,
    config: SessionConfig,
    page: Page,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn Jitter>,
    tab: TabId,
}

impl LifecycleBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn page(mut self, page: Page) -> Self {
        self.page = page;
        self
    }

    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn jitter(mut self, jitter: impl Jitter) -> Self {
        self.jitter = Arc::new(jitter);
        self
    }

    pub fn tab(mut self, tab: TabId) -> Self {
        self.tab = tab;
        self
    }

    pub fn build(self) -> TokenLifecycle {
        let store = Arc::new(SessionStore::new());
        let broadcaster = Arc::new(crosstab::connect(&self.origin, &self.config, self.tab));
        let coordinator = RefreshCoordinator::new(
            Arc::clone(&self.endpoint),
            Arc::clone(&store),
            Arc::clone(&broadcaster),
            Arc::clone(&self.clock),
            self.config.request_timeout,
        );
        TokenLifecycle {
            inner: Arc::new(Inner {
                config: self.config,
                store,
                coordinator,
                broadcaster,
                endpoint: self.endpoint,
                page: self.page,
                clock: self.clock,
                jitter: self.jitter,
                run: Mutex::new(None),
                ever_started: AtomicBool::new(false),
                checks: AtomicU64::new(0),
                retries: SingleFlight::new(),
            }),
        }
    }
}

impl TokenLifecycle {
    pub fn builder(endpoint: Arc<dyn AuthEndpoint>, origin: &Origin) -> LifecycleBuilder {
        LifecycleBuilder {
            endpoint,
            origin: origin.clone(),
            config: SessionConfig::default(),
            page: Page::new(),
            clock: Arc::new(SystemClock),
            jitter: Arc::new(ThreadJitter),
            tab: TabId::new(),
        }
    }

    /// Subscribe to page and cross-tab signals and arm the refresh timer.
    ///
    /// No-op when already started. The first start since construction also
    /// runs one [`silent_refresh`](Self::silent_refresh).
    pub fn start(&self) {
        let mut run = self.inner.run.lock();
        if run.is_some() {
            debug!(tab = %self.inner.tab(), "token lifecycle already started");
            return;
        }
        let cancel = CancellationToken::new();
        *run = Some(cancel.clone());

        // Subscribe before returning so no signal sent after start() is missed.
        let page_events = self.inner.page.subscribe();
        let inbox = self.inner.broadcaster.subscribe();
        tokio::spawn(run_timer(Arc::clone(&self.inner), cancel.clone()));
        tokio::spawn(run_page_listener(Arc::clone(&self.inner), page_events, cancel.clone()));
        tokio::spawn(run_inbox(Arc::clone(&self.inner), inbox, cancel));

        let first = !self.inner.ever_started.swap(true, Ordering::SeqCst);
        if first {
            self.inner.spawn_check("initial");
        }
        info!(
            tab = %self.inner.tab(),
            transport = self.inner.broadcaster.transport_name(),
            first,
            "token lifecycle started"
        );
    }

    /// Disarm the timer, the debounce, and all listeners. A refresh already
    /// on the wire still completes.
    pub fn stop(&self) {
        if let Some(cancel) = self.inner.run.lock().take() {
            cancel.cancel();
            info!(tab = %self.inner.tab(), "token lifecycle stopped");
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner.run.lock().is_some()
    }

    /// Refresh if the token is within the refresh threshold.
    ///
    /// Returns `false` when there is no session, when offline with a due
    /// token, or when the refresh ultimately failed; `true` otherwise.
    pub async fn silent_refresh(&self) -> bool {
        self.inner.silent_refresh().await
    }

    /// Refresh now, retrying transient failures with backoff. Exhausting
    /// the attempts ends the session.
    pub async fn refresh_with_retry(&self) -> Option<String> {
        self.inner.refresh_with_retry().await
    }

    /// Record credentials obtained by an external login flow.
    pub fn sign_in(&self, grant: &TokenGrant) {
        self.inner.store.sign_in(grant, self.inner.clock.now_ms());
        info!(
            tab = %self.inner.tab(),
            expires_in = grant.expires_in,
            user = grant.user.as_ref().map(|u| u.id.as_str()),
            "signed in"
        );
    }

    /// User-initiated logout. The server call is best-effort; the local
    /// session is cleared and sibling tabs told regardless.
    pub async fn logout(&self) {
        let fallback = self.inner.store.refresh_token();
        let call = self.inner.endpoint.logout(fallback.as_deref());
        match tokio::time::timeout(self.inner.config.request_timeout, call).await {
            Ok(Ok(())) => debug!("server session invalidated"),
            Ok(Err(e)) => warn!(err = %e, "logout request failed"),
            Err(_) => warn!("logout request timed out"),
        }
        self.inner.coordinator.end_session("user logout");
    }

    /// An HTTP client that attaches this tab's bearer token.
    pub fn authorized_client(&self, http: reqwest::Client) -> AuthorizedClient {
        AuthorizedClient::new(http, Arc::clone(&self.inner))
    }

    pub fn store(&self) -> &SessionStore {
        &self.inner.store
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.inner.coordinator
    }

    pub fn page(&self) -> &Page {
        &self.inner.page
    }

    pub fn tab(&self) -> TabId {
        self.inner.tab()
    }

    /// Number of [`silent_refresh`](Self::silent_refresh) evaluations so far,
    /// from any trigger.
    pub fn refresh_checks(&self) -> u64 {
        self.inner.checks.load(Ordering::SeqCst)
    }
}

impl Drop for TokenLifecycle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn tab(&self) -> TabId {
        self.broadcaster.tab()
    }

    pub(crate) fn store(&self) -> &SessionStore {
        &self.store
    }

    pub(crate) fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Whether a token expiring at `expires_at` falls inside the jittered
    /// refresh threshold. Expired tokens are always due.
    pub(crate) fn is_due(&self, expires_at: u64) -> bool {
        let threshold =
            self.config.refresh_threshold + self.jitter.sample(self.config.threshold_jitter);
        let now = self.clock.now_ms();
        now >= expires_at.saturating_sub(threshold.as_millis() as u64)
    }

    fn spawn_check(self: &Arc<Self>, trigger: &'static str) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            debug!(tab = %inner.tab(), trigger, "refresh check");
            inner.silent_refresh().await;
        });
    }

    /// A dropped broadcast may have been a logout or a rotation, so ask the
    /// server directly. A 401 ends the session like any other refresh.
    fn spawn_reconcile(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if !inner.store.is_authenticated() || !inner.page.is_online() {
                return;
            }
            inner.refresh_with_retry().await;
        });
    }

    async fn silent_refresh(self: &Arc<Self>) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let state = self.store.snapshot();
        if !state.is_authenticated() {
            return false;
        }
        let Some(expires_at) = state.token_expires_at else {
            return true;
        };
        if !self.is_due(expires_at) {
            return true;
        }
        if !self.page.is_online() {
            debug!(tab = %self.tab(), "token due but offline, postponing refresh");
            self.store.set_error(OFFLINE_ERROR);
            return false;
        }
        self.refresh_with_retry().await.is_some()
    }

    async fn refresh_with_retry(self: &Arc<Self>) -> Option<String> {
        let inner = Arc::clone(self);
        let (handle, _) = self.retries.join(move || async move {
            let _hold = inner.store.hold_refresh();
            inner.store.clear_error();
            inner.retry_until_settled().await
        });
        match handle.await {
            Ok(token) => token,
            Err(e) => {
                warn!(err = %e, "refresh retry task aborted");
                None
            }
        }
    }

    async fn retry_until_settled(&self) -> Option<String> {
        let mut failures = 0u32;
        loop {
            let failure = match self.coordinator.refresh_outcome().await {
                Ok(token) => return Some(token),
                Err(failure) => failure,
            };
            if !failure.is_retryable() {
                debug!(kind = failure.as_str(), "refresh failure not retryable");
                return None;
            }

            failures += 1;
            if failures >= self.config.max_attempts {
                error!(
                    attempts = failures,
                    kind = failure.as_str(),
                    "token refresh retries exhausted, logging out"
                );
                self.coordinator.end_session("retries exhausted");
                return None;
            }

            let delay =
                self.config.backoff.delay(failures - 1, failure.retry_after_secs(), self.jitter.as_ref());
            warn!(
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                kind = failure.as_str(),
                "retrying token refresh"
            );
            tokio::time::sleep(delay).await;

            // Another tab may have refreshed, or the user logged out, meanwhile.
            let state = self.store.snapshot();
            if !state.is_authenticated() {
                return None;
            }
            if let Some(expires_at) = state.token_expires_at {
                if !self.is_due(expires_at) {
                    debug!("token renewed while backing off");
                    return state.access_token;
                }
            }
        }
    }
}

async fn run_timer(inner: Arc<Inner>, cancel: CancellationToken) {
    let period = inner.config.refresh_interval;
    let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticks.tick() => {}
        }
        if inner.page.is_online() && inner.page.is_visible() {
            inner.spawn_check("timer");
        } else {
            debug!(tab = %inner.tab(), "page hidden or offline, skipping scheduled check");
        }
    }
}

async fn run_page_listener(
    inner: Arc<Inner>,
    mut events: broadcast::Receiver<PageEvent>,
    cancel: CancellationToken,
) {
    let debounce = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(debounce);
    let mut armed = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            () = &mut debounce, if armed => {
                armed = false;
                if inner.page.is_visible() {
                    inner.spawn_check("visible");
                }
            }
            event = events.recv() => match event {
                Ok(PageEvent::VisibilityChanged(Visibility::Visible)) => {
                    debounce.as_mut().reset(Instant::now() + inner.config.visibility_debounce);
                    armed = true;
                }
                Ok(PageEvent::VisibilityChanged(Visibility::Hidden)) => {}
                Ok(PageEvent::Online) => {
                    info!(tab = %inner.tab(), "back online");
                    inner.store.clear_error();
                    inner.spawn_check("online");
                }
                Ok(PageEvent::Offline) => {
                    info!(tab = %inner.tab(), "went offline");
                    inner.store.set_error(OFFLINE_ERROR);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "page listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

async fn run_inbox(inner: Arc<Inner>, mut inbox: Box<dyn Inbox>, cancel: CancellationToken) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return,
            message = inbox.recv() => message,
        };
        let Some(message) = message else {
            return;
        };
        debug!(tab = %inner.tab(), kind = message.kind(), "broadcast received");
        crosstab::apply_message(&inner.store, &message, inner.clock.now_ms());

        let skipped = inbox.take_lagged();
        if skipped > 0 {
            warn!(tab = %inner.tab(), skipped, "missed sibling broadcasts, reconciling with server");
            inner.spawn_reconcile();
        }
    }
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
