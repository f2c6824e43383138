// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Storage-backed fallback transport.
//!
//! [`SharedStorage`] behaves like an origin-wide key-value store with change
//! notifications: every mutation that changes a value emits a
//! [`StorageEvent`] tagged with the writing tab, and writing the value a key
//! already holds emits nothing. [`StorageChannel`] writes a message under
//! one key and deletes it straight away, so the same key carries every
//! message without sequence numbers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{BroadcastMessage, BroadcastTransport, Inbox, TabId};

const EVENT_CAPACITY: usize = 128;

/// A change to one key of [`SharedStorage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub old_value: Option<String>,
    /// `None` when the key was removed.
    pub new_value: Option<String>,
    pub writer: TabId,
}

/// Origin-wide key-value store shared by all tabs.
#[derive(Clone)]
pub struct SharedStorage {
    inner: Arc<StorageInner>,
}

struct StorageInner {
    entries: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
}

impl Default for SharedStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStorage {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { inner: Arc::new(StorageInner { entries: Mutex::new(HashMap::new()), events }) }
    }

    pub fn get_item(&self, key: &str) -> Option<String> {
        self.inner.entries.lock().get(key).cloned()
    }

    pub fn set_item(&self, writer: TabId, key: &str, value: &str) {
        let mut entries = self.inner.entries.lock();
        let old_value = entries.insert(key.to_owned(), value.to_owned());
        if old_value.as_deref() == Some(value) {
            return;
        }
        // Emitted under the lock so event order matches mutation order.
        let _ = self.inner.events.send(StorageEvent {
            key: key.to_owned(),
            old_value,
            new_value: Some(value.to_owned()),
            writer,
        });
    }

    pub fn remove_item(&self, writer: TabId, key: &str) {
        let mut entries = self.inner.entries.lock();
        let Some(old_value) = entries.remove(key) else {
            return;
        };
        let _ = self.inner.events.send(StorageEvent {
            key: key.to_owned(),
            old_value: Some(old_value),
            new_value: None,
            writer,
        });
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to change notifications, including the caller's own writes.
    pub fn events(&self) -> broadcast::Receiver<StorageEvent> {
        self.inner.events.subscribe()
    }
}

/// Broadcast transport over [`SharedStorage`].
pub struct StorageChannel {
    storage: SharedStorage,
    key: String,
    tab: TabId,
}

impl StorageChannel {
    pub fn new(storage: SharedStorage, key: &str, tab: TabId) -> Self {
        Self { storage, key: key.to_owned(), tab }
    }
}

impl BroadcastTransport for StorageChannel {
    fn name(&self) -> &'static str {
        "storage"
    }

    fn post(&self, message: &BroadcastMessage) -> anyhow::Result<()> {
        let payload = serde_json::to_string(message)?;
        self.storage.set_item(self.tab, &self.key, &payload);
        self.storage.remove_item(self.tab, &self.key);
        Ok(())
    }

    fn subscribe(&self) -> Box<dyn Inbox> {
        Box::new(StorageInbox {
            rx: self.storage.events(),
            key: self.key.clone(),
            tab: self.tab,
            lagged: 0,
        })
    }
}

struct StorageInbox {
    rx: broadcast::Receiver<StorageEvent>,
    key: String,
    tab: TabId,
    lagged: u64,
}

impl Inbox for StorageInbox {
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = Option<BroadcastMessage>> + Send + '_>> {
        Box::pin(async move {
            loop {
                let event = match self.rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(tab = %self.tab, skipped = n, "storage inbox lagged");
                        self.lagged = self.lagged.saturating_add(n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                };
                if event.writer == self.tab || event.key != self.key {
                    continue;
                }
                // The delete half of write-then-delete carries nothing.
                let Some(raw) = event.new_value else {
                    continue;
                };
                match serde_json::from_str::<BroadcastMessage>(&raw) {
                    Ok(message) => return Some(message),
                    Err(e) => {
                        debug!(tab = %self.tab, err = %e, "ignoring malformed broadcast payload");
                    }
                }
            }
        })
    }

    fn take_lagged(&mut self) -> u64 {
        std::mem::take(&mut self.lagged)
    }
}

#[cfg(test)]
#[path = "storage_tests.rs"]
mod tests;
