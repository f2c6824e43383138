// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Multi-tab scenarios over real HTTP against the mock auth server.

use std::time::Duration;

use sessionkeeper::{Origin, TokenGrant};
use sessionkeeper_specs::{eventually, AuthServer, Browser};

const PROPAGATION: Duration = Duration::from_secs(2);

fn origins() -> [(&'static str, Origin); 2] {
    [("broadcast-channel", Origin::new()), ("storage", Origin::storage_only())]
}

#[tokio::test]
async fn silent_refresh_rotates_cookie_credential() -> anyhow::Result<()> {
    let server = AuthServer::start().await?;
    let browser = Browser::new(&server, Origin::new())?;
    let tab = browser.open_tab();
    tab.sign_in(&browser.login().await?);

    assert!(tab.silent_refresh().await);
    assert_eq!(tab.store().access_token().as_deref(), Some("access-2"));
    assert!(tab.store().snapshot().has_refresh_token());

    // The rotated credential is the one presented next time.
    assert!(tab.silent_refresh().await);
    assert_eq!(tab.store().access_token().as_deref(), Some("access-3"));
    assert_eq!(server.refresh_calls(), 2);
    Ok(())
}

#[tokio::test]
async fn sibling_tabs_adopt_refreshed_token() -> anyhow::Result<()> {
    for (transport, origin) in origins() {
        let server = AuthServer::start().await?;
        let browser = Browser::new(&server, origin)?;
        let grant = browser.login().await?;
        let a = browser.open_tab();
        let b = browser.open_tab();
        a.sign_in(&grant);
        b.sign_in(&grant);
        b.start();
        // b's own initial check is due as well; let it settle first.
        assert!(eventually(PROPAGATION, || server.refresh_calls() == 1).await, "{transport}");
        assert!(eventually(PROPAGATION, || !b.coordinator().is_in_flight()).await);

        assert!(a.silent_refresh().await);

        assert!(
            eventually(PROPAGATION, || b.store().access_token() == a.store().access_token()).await,
            "{transport}"
        );
        assert_eq!(server.refresh_calls(), 2, "{transport}");
    }
    Ok(())
}

#[tokio::test]
async fn logout_in_one_tab_ends_every_tab() -> anyhow::Result<()> {
    for (transport, origin) in origins() {
        let server = AuthServer::start().await?;
        let browser = Browser::new(&server, origin)?;
        let grant = browser.login().await?;
        let long_lived = TokenGrant::new(grant.access_token, 3_600);
        let tabs: Vec<_> = (0..3).map(|_| browser.open_tab()).collect();
        for tab in &tabs {
            tab.sign_in(&long_lived);
        }
        for tab in &tabs[1..] {
            tab.start();
        }

        tabs[0].logout().await;

        assert_eq!(server.logout_calls(), 1);
        for tab in &tabs {
            assert!(eventually(PROPAGATION, || !tab.store().is_authenticated()).await, "{transport}");
        }
    }
    Ok(())
}

#[tokio::test]
async fn revoked_credential_logs_out_everywhere() -> anyhow::Result<()> {
    let server = AuthServer::start().await?;
    let browser = Browser::new(&server, Origin::new())?;
    let grant = browser.login().await?;
    let a = browser.open_tab();
    let b = browser.open_tab();
    a.sign_in(&grant);
    b.sign_in(&grant);
    b.start();
    assert!(eventually(PROPAGATION, || b.store().access_token().as_deref() == Some("access-2")).await);
    server.revoke();

    assert!(!a.silent_refresh().await);

    assert!(!a.store().is_authenticated());
    assert!(eventually(PROPAGATION, || !b.store().is_authenticated()).await);
    Ok(())
}

#[tokio::test]
async fn persistent_server_errors_exhaust_retries() -> anyhow::Result<()> {
    let server = AuthServer::start().await?;
    let browser = Browser::new(&server, Origin::new())?;
    let grant = browser.login().await?;
    let a = browser.open_tab();
    let b = browser.open_tab();
    a.sign_in(&grant);
    b.sign_in(&grant);
    b.start();
    assert!(eventually(PROPAGATION, || server.refresh_calls() == 1).await);
    assert!(eventually(PROPAGATION, || !b.coordinator().is_in_flight()).await);
    server.fail_next(&[503, 503, 503]);

    assert!(!a.silent_refresh().await);

    assert_eq!(server.refresh_calls(), 4);
    assert!(!a.store().is_authenticated());
    assert!(eventually(PROPAGATION, || !b.store().is_authenticated()).await);
    Ok(())
}

#[tokio::test]
async fn transient_error_recovers_on_retry() -> anyhow::Result<()> {
    let server = AuthServer::start().await?;
    let browser = Browser::new(&server, Origin::new())?;
    let tab = browser.open_tab();
    tab.sign_in(&browser.login().await?);
    server.fail_next(&[502]);

    assert!(tab.silent_refresh().await);

    assert_eq!(server.refresh_calls(), 2);
    let state = tab.store().snapshot();
    assert_eq!(state.access_token.as_deref(), Some("access-2"));
    assert_eq!(state.refresh_error, None);
    Ok(())
}

#[tokio::test]
async fn csrf_rejection_keeps_session() -> anyhow::Result<()> {
    let server = AuthServer::start().await?;
    let browser = Browser::new(&server, Origin::new())?;
    let tab = browser.open_tab();
    tab.sign_in(&browser.login().await?);
    server.fail_next(&[403]);

    assert!(!tab.silent_refresh().await);

    let state = tab.store().snapshot();
    assert_eq!(state.access_token.as_deref(), Some("access-1"));
    assert!(state.refresh_error.as_deref().is_some_and(|e| e.starts_with("FORBIDDEN")));
    assert_eq!(server.refresh_calls(), 1);

    // The next trigger tries again.
    assert!(tab.silent_refresh().await);
    assert_eq!(tab.store().access_token().as_deref(), Some("access-2"));
    Ok(())
}

#[tokio::test]
async fn concurrent_callers_share_one_http_refresh() -> anyhow::Result<()> {
    let server = AuthServer::start().await?;
    server.set_latency(Duration::from_millis(200));
    let browser = Browser::new(&server, Origin::new())?;
    let tab = browser.open_tab();
    tab.sign_in(&browser.login().await?);

    let calls = (0..5).map(|_| tab.coordinator().refresh());
    let tokens = futures_util::future::join_all(calls).await;

    assert_eq!(server.refresh_calls(), 1);
    assert!(tokens.iter().all(|t| t.as_deref() == Some("access-2")));
    Ok(())
}

#[tokio::test]
async fn authorized_client_recovers_from_401() -> anyhow::Result<()> {
    let server = AuthServer::start().await?;
    let browser = Browser::new(&server, Origin::new())?;
    let tab = browser.open_tab();
    let grant = browser.login().await?;
    // Long-lived locally so no pre-emptive refresh happens.
    tab.sign_in(&TokenGrant::new(grant.access_token, 3_600));
    server.expire_access();

    let client = tab.authorized_client(browser.client().clone());
    let me_url = browser.url("/api/me");
    let response = client.send(|http| http.get(&me_url)).await?;

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(server.refresh_calls(), 1);
    assert_eq!(tab.store().access_token().as_deref(), Some("access-2"));
    Ok(())
}
