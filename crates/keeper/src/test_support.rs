// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: fake clock, jitter, endpoint, and assertion
//! helpers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backoff::Jitter;
use crate::clock::Clock;
use crate::endpoint::{AuthEndpoint, EndpointFuture, TokenGrant};
use crate::error::RefreshFailure;

/// Wall clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self { now: Arc::new(AtomicU64::new(start_ms)) }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Jitter that always returns the same amount, clamped to the bound.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(Duration);

impl FixedJitter {
    pub fn new(fixed: Duration) -> Self {
        Self(fixed)
    }

    pub fn zero() -> Self {
        Self(Duration::ZERO)
    }
}

impl Jitter for FixedJitter {
    fn sample(&self, upper: Duration) -> Duration {
        self.0.min(upper)
    }
}

/// Scripted [`AuthEndpoint`].
///
/// Scripted refresh results are served in order and the last one repeats.
/// With nothing scripted every call succeeds with `token-N` (N counting from
/// 1) valid for [`FakeEndpoint::DEFAULT_EXPIRES_IN`] seconds.
#[derive(Default)]
pub struct FakeEndpoint {
    script: Mutex<VecDeque<Result<TokenGrant, RefreshFailure>>>,
    last: Mutex<Option<Result<TokenGrant, RefreshFailure>>>,
    latency: Mutex<Option<Duration>>,
    refresh_calls: AtomicU32,
    logout_calls: AtomicU32,
    fail_logout: AtomicBool,
    seen_fallbacks: Mutex<Vec<Option<String>>>,
}

impl FakeEndpoint {
    pub const DEFAULT_EXPIRES_IN: u64 = 900;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Queue one refresh result.
    pub fn push(&self, result: Result<TokenGrant, RefreshFailure>) -> &Self {
        self.script.lock().push_back(result);
        self
    }

    /// Delay every call by `latency` (tokio time).
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = Some(latency);
        self
    }

    /// Change the delay for later calls.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    pub fn fail_logout(&self) {
        self.fail_logout.store(true, Ordering::SeqCst);
    }

    pub fn refresh_calls(&self) -> u32 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> u32 {
        self.logout_calls.load(Ordering::SeqCst)
    }

    /// Fallback refresh tokens passed to each refresh call, in order.
    pub fn seen_fallbacks(&self) -> Vec<Option<String>> {
        self.seen_fallbacks.lock().clone()
    }

    fn next_result(&self, call: u32) -> Result<TokenGrant, RefreshFailure> {
        let mut script = self.script.lock();
        let mut last = self.last.lock();
        if let Some(next) = script.pop_front() {
            *last = Some(next.clone());
            return next;
        }
        match last.as_ref() {
            Some(repeat) => repeat.clone(),
            None => Ok(TokenGrant::new(format!("token-{call}"), Self::DEFAULT_EXPIRES_IN)),
        }
    }

    async fn pause(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl AuthEndpoint for FakeEndpoint {
    fn refresh<'a>(
        &'a self,
        fallback_refresh_token: Option<&'a str>,
    ) -> EndpointFuture<'a, Result<TokenGrant, RefreshFailure>> {
        Box::pin(async move {
            let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.seen_fallbacks.lock().push(fallback_refresh_token.map(str::to_owned));
            self.pause().await;
            self.next_result(call)
        })
    }

    fn logout<'a>(
        &'a self,
        _fallback_refresh_token: Option<&'a str>,
    ) -> EndpointFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.logout_calls.fetch_add(1, Ordering::SeqCst);
            self.pause().await;
            if self.fail_logout.load(Ordering::SeqCst) {
                anyhow::bail!("logout failed (503 Service Unavailable)");
            }
            Ok(())
        })
    }
}

/// Assert that an expression evaluates to `Err` whose Display output
/// contains the given substring.
#[macro_export]
macro_rules! assert_err_contains {
    ($expr:expr, $substr:expr) => {{
        let result = $expr;
        let err = result.expect_err(concat!("expected Err for: ", stringify!($expr)));
        let msg = err.to_string();
        assert!(msg.contains($substr), "expected error containing {:?}, got: {msg:?}", $substr);
    }};
}
