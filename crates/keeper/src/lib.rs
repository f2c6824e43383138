// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sessionkeeper: keeps a short-lived bearer token valid for one tab of a
//! multi-tab application.
//!
//! The [`TokenLifecycle`] decides *when* to refresh (timer, visibility,
//! connectivity), the [`RefreshCoordinator`] makes sure only one refresh is
//! on the wire per tab, and the [`Broadcaster`] tells sibling tabs about new
//! tokens and logouts so they do not have to ask the server themselves.

pub mod backoff;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod crosstab;
pub mod endpoint;
pub mod error;
pub mod flight;
pub mod lifecycle;
pub mod page;
pub mod request;
pub mod state;
pub mod test_support;

pub use crate::config::SessionConfig;
pub use crate::coordinator::RefreshCoordinator;
pub use crate::crosstab::{BroadcastMessage, Broadcaster, Origin, TabId};
pub use crate::endpoint::{AuthEndpoint, HttpEndpoint, TokenGrant};
pub use crate::error::RefreshFailure;
pub use crate::lifecycle::TokenLifecycle;
pub use crate::page::{Page, PageEvent, Visibility};
pub use crate::request::AuthorizedClient;
pub use crate::state::{SessionState, SessionStore, UserProfile};
