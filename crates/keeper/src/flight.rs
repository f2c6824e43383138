// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single-flight slot: at most one instance of an operation runs at a time,
//! and every caller that arrives while it runs awaits the same result.
//!
//! The operation is spawned as its own task, so it always runs to completion
//! and clears the slot itself, even if every caller stops waiting. A caller
//! arriving after that starts a fresh run instead of seeing a stale result.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

/// Result of joining a flight. `Err` carries the reason the task died
/// (panic or runtime shutdown) instead of producing a value.
pub type FlightResult<T> = Result<T, String>;

/// Handle to a running (or just finished) flight.
pub type FlightHandle<T> = Shared<BoxFuture<'static, FlightResult<T>>>;

pub struct SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    slot: Arc<Mutex<Option<FlightHandle<T>>>>,
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self { slot: Arc::new(Mutex::new(None)) }
    }

    /// Join the running flight, or start one with `start`.
    ///
    /// Returns the handle and whether this call started the flight.
    pub fn join<F, Fut>(&self, start: F) -> (FlightHandle<T>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut slot = self.slot.lock();
        if let Some(handle) = slot.as_ref() {
            return (handle.clone(), false);
        }

        // The task clears the slot under the same lock we hold while
        // installing the handle, so it cannot clear before the install.
        let release = Release(Arc::clone(&self.slot));
        let operation = start();
        let task = tokio::spawn(async move {
            let _release = release;
            operation.await
        });
        let handle: FlightHandle<T> =
            async move { task.await.map_err(|e| e.to_string()) }.boxed().shared();
        *slot = Some(handle.clone());
        (handle, true)
    }

    /// Whether a flight is currently running.
    pub fn is_in_flight(&self) -> bool {
        self.slot.lock().is_some()
    }
}

/// Empties the slot when the flight's task finishes, panics, or is dropped.
struct Release<T>(Arc<Mutex<Option<FlightHandle<T>>>>)
where
    T: Clone + Send + Sync + 'static;

impl<T> Drop for Release<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}

#[cfg(test)]
#[path = "flight_tests.rs"]
mod tests;
