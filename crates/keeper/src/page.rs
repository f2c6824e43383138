// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Host page signals: document visibility and network connectivity.
//!
//! The embedding application drives a [`Page`] from its platform hooks; the
//! lifecycle subscribes to it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageEvent {
    VisibilityChanged(Visibility),
    Online,
    Offline,
}

/// Visibility and connectivity of the hosting page.
#[derive(Clone)]
pub struct Page {
    inner: Arc<PageInner>,
}

struct PageInner {
    visible: AtomicBool,
    online: AtomicBool,
    events: broadcast::Sender<PageEvent>,
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl Page {
    /// A visible, online page.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(PageInner {
                visible: AtomicBool::new(true),
                online: AtomicBool::new(true),
                events,
            }),
        }
    }

    pub fn is_visible(&self) -> bool {
        self.inner.visible.load(Ordering::SeqCst)
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Record a visibility change. Emits even when the value is unchanged,
    /// matching hosts that fire the event on every transition attempt.
    pub fn set_visibility(&self, visibility: Visibility) {
        self.inner.visible.store(visibility == Visibility::Visible, Ordering::SeqCst);
        let _ = self.inner.events.send(PageEvent::VisibilityChanged(visibility));
    }

    /// Record a connectivity change. Emits only on an actual transition.
    pub fn set_online(&self, online: bool) {
        if self.inner.online.swap(online, Ordering::SeqCst) == online {
            return;
        }
        let event = if online { PageEvent::Online } else { PageEvent::Offline };
        let _ = self.inner.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PageEvent> {
        self.inner.events.subscribe()
    }
}

#[cfg(test)]
#[path = "page_tests.rs"]
mod tests;
