// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cross-tab broadcast of `TOKEN_REFRESHED` and `LOGOUT`.
//!
//! Two transports implement [`BroadcastTransport`]: a native named channel
//! ([`channel::NamedChannel`]) and, for hosts without one, a shared key-value
//! store used as a write-then-delete signal carrier
//! ([`storage::StorageChannel`]). [`connect`] picks one from the host's
//! [`Origin`]; callers only see [`Broadcaster`]. Neither transport delivers
//! a tab's own messages back to it.

pub mod channel;
pub mod storage;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use crate::crosstab::channel::{ChannelHub, NamedChannel};
pub use crate::crosstab::storage::{SharedStorage, StorageChannel, StorageEvent};

use crate::config::SessionConfig;
use crate::endpoint::TokenGrant;
use crate::state::SessionStore;

/// Identity of one tab (one running instance of the application).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TabId(Uuid);

impl TabId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TabId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

/// Message exchanged between tabs.
///
/// Wire format: `{"type":"TOKEN_REFRESHED","data":{"accessToken":..,"expiresIn":..}}`
/// or `{"type":"LOGOUT"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BroadcastMessage {
    TokenRefreshed { data: RefreshedToken },
    Logout,
}

/// Payload of `TOKEN_REFRESHED`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshedToken {
    pub access_token: String,
    /// Seconds, relative to receipt.
    pub expires_in: u64,
}

impl fmt::Debug for RefreshedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshedToken")
            .field("access_token", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

impl BroadcastMessage {
    pub fn token_refreshed(grant: &TokenGrant) -> Self {
        Self::TokenRefreshed {
            data: RefreshedToken {
                access_token: grant.access_token.clone(),
                expires_in: grant.expires_in,
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::TokenRefreshed { .. } => "TOKEN_REFRESHED",
            Self::Logout => "LOGOUT",
        }
    }
}

/// A pub/sub transport between tabs of one origin.
pub trait BroadcastTransport: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Publish to every other subscribed tab.
    fn post(&self, message: &BroadcastMessage) -> anyhow::Result<()>;

    /// Start receiving messages posted by other tabs.
    fn subscribe(&self) -> Box<dyn Inbox>;
}

/// Receiving end of a [`BroadcastTransport`] subscription.
pub trait Inbox: Send + 'static {
    /// Next message from another tab, `None` once the transport is gone.
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = Option<BroadcastMessage>> + Send + '_>>;

    /// Messages dropped since the last call because this inbox fell behind.
    /// A dropped message may have been a logout, so callers must treat a
    /// non-zero count as "session state unknown".
    fn take_lagged(&mut self) -> u64 {
        0
    }
}

/// Host capabilities shared by every tab of one origin.
///
/// `channels` is `None` on hosts without a native broadcast channel, which
/// forces the storage fallback.
#[derive(Clone)]
pub struct Origin {
    channels: Option<ChannelHub>,
    storage: SharedStorage,
}

impl Default for Origin {
    fn default() -> Self {
        Self::new()
    }
}

impl Origin {
    pub fn new() -> Self {
        Self { channels: Some(ChannelHub::new()), storage: SharedStorage::new() }
    }

    /// An origin whose host lacks native broadcast channels.
    pub fn storage_only() -> Self {
        Self { channels: None, storage: SharedStorage::new() }
    }

    pub fn channels(&self) -> Option<&ChannelHub> {
        self.channels.as_ref()
    }

    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }
}

/// A tab's handle on the cross-tab channel.
pub struct Broadcaster {
    transport: Arc<dyn BroadcastTransport>,
    tab: TabId,
}

impl Broadcaster {
    pub fn new(transport: Arc<dyn BroadcastTransport>, tab: TabId) -> Self {
        Self { transport, tab }
    }

    /// Publish to sibling tabs. Delivery is best-effort; failures are logged.
    pub fn broadcast(&self, message: BroadcastMessage) {
        match self.transport.post(&message) {
            Ok(()) => {
                debug!(tab = %self.tab, kind = message.kind(), transport = self.transport.name(), "broadcast sent");
            }
            Err(e) => {
                warn!(tab = %self.tab, kind = message.kind(), err = %e, "broadcast failed");
            }
        }
    }

    pub fn subscribe(&self) -> Box<dyn Inbox> {
        self.transport.subscribe()
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    pub fn tab(&self) -> TabId {
        self.tab
    }
}

/// Pick the best transport the origin offers.
pub fn connect(origin: &Origin, config: &SessionConfig, tab: TabId) -> Broadcaster {
    let transport: Arc<dyn BroadcastTransport> = match origin.channels() {
        Some(hub) => Arc::new(hub.open(&config.channel_name, tab)),
        None => {
            debug!(%tab, "no native broadcast channel, using storage fallback");
            Arc::new(StorageChannel::new(origin.storage().clone(), &config.storage_key, tab))
        }
    };
    Broadcaster::new(transport, tab)
}

/// Apply a message from a sibling tab to the local store. Never touches the
/// network.
pub(crate) fn apply_message(store: &SessionStore, message: &BroadcastMessage, now_ms: u64) {
    match message {
        BroadcastMessage::TokenRefreshed { data } => {
            store.apply_remote(&data.access_token, data.expires_in, now_ms);
            debug!(expires_in = data.expires_in, "adopted token refreshed by another tab");
        }
        BroadcastMessage::Logout => {
            store.clear();
            info!("logged out by another tab");
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
