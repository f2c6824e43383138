// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Native named broadcast channels.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::warn;

use super::{BroadcastMessage, BroadcastTransport, Inbox, TabId};

/// Per-channel buffer; a tab that falls further behind skips the oldest.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
struct Delivery {
    sender: TabId,
    message: BroadcastMessage,
}

/// Registry of named channels for one origin.
#[derive(Clone, Default)]
pub struct ChannelHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Delivery>>>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (creating if needed) the channel `name` on behalf of `tab`.
    pub fn open(&self, name: &str, tab: TabId) -> NamedChannel {
        let tx = self
            .channels
            .lock()
            .entry(name.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        NamedChannel { name: name.to_owned(), tab, tx }
    }
}

/// One tab's end of a named channel.
pub struct NamedChannel {
    name: String,
    tab: TabId,
    tx: broadcast::Sender<Delivery>,
}

impl NamedChannel {
    pub fn channel_name(&self) -> &str {
        &self.name
    }
}

impl BroadcastTransport for NamedChannel {
    fn name(&self) -> &'static str {
        "broadcast-channel"
    }

    fn post(&self, message: &BroadcastMessage) -> anyhow::Result<()> {
        // No receivers just means no other tab is listening.
        let _ = self.tx.send(Delivery { sender: self.tab, message: message.clone() });
        Ok(())
    }

    fn subscribe(&self) -> Box<dyn Inbox> {
        Box::new(ChannelInbox { rx: self.tx.subscribe(), tab: self.tab, lagged: 0 })
    }
}

struct ChannelInbox {
    rx: broadcast::Receiver<Delivery>,
    tab: TabId,
    lagged: u64,
}

impl Inbox for ChannelInbox {
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = Option<BroadcastMessage>> + Send + '_>> {
        Box::pin(async move {
            loop {
                match self.rx.recv().await {
                    Ok(delivery) if delivery.sender == self.tab => continue,
                    Ok(delivery) => return Some(delivery.message),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(tab = %self.tab, skipped = n, "broadcast inbox lagged");
                        self.lagged = self.lagged.saturating_add(n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    fn take_lagged(&mut self) -> u64 {
        std::mem::take(&mut self.lagged)
    }
}

#[cfg(test)]
#[path = "channel_tests.rs"]
mod tests;
