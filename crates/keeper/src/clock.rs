// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock source in epoch milliseconds.
///
/// Token expiry is an absolute instant, so it is measured against wall time
/// rather than [`std::time::Instant`]. Tests substitute
/// [`crate::test_support::ManualClock`].
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> u64;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        epoch_ms()
    }
}

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}
