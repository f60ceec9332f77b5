//! View guard and renewal protocol behaviour against a scripted server.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::*;
use rota_core::auth::{Credential, CredentialSlot, SessionError, SessionState, ViewGuard};

use SessionState::{Authorized, Checking, Unauthorized, Unknown};

#[tokio::test]
async fn test_guard_renews_expired_credential() {
    let h = Harness::signed_in(&token_expiring_in(-1), "renewal-token");
    let fresh = token_expiring_in(900);
    h.fake.push(RENEWAL_URL, Reply::renewed(&fresh));

    let mut guard = ViewGuard::new(h.authority.clone());
    assert_eq!(guard.state(), Unknown);

    let state = guard.mount().await;
    assert_eq!(state, Authorized);
    assert_eq!(guard.trail(), &[Unknown, Checking, Authorized]);
    assert_eq!(h.renewal_calls(), 1);
    assert_eq!(h.store.access(), Some(Credential::new(fresh)));
    assert_eq!(h.redirect_count(), 0);

    let sent = h.fake.requests(RENEWAL_URL);
    assert_eq!(
        sent[0].body,
        Some(serde_json::json!({ "refresh": "renewal-token" }))
    );
}

#[tokio::test]
async fn test_guard_valid_credential_makes_no_calls() {
    let h = Harness::signed_in(&token_expiring_in(600), "renewal-token");

    let mut guard = ViewGuard::new(h.authority.clone());
    let rendered = guard.render(|| "roster").await;

    assert_eq!(rendered, Some("roster"));
    assert_eq!(guard.trail(), &[Unknown, Checking, Authorized]);
    assert_eq!(h.fake.total_calls(), 0);
}

#[tokio::test]
async fn test_guard_fails_closed_on_malformed_credential() {
    for malformed in ["garbage", "a.b.c", "", "x.eyJ1c2VyX2lkIjogMX0.y"] {
        let h = Harness::signed_in(malformed, "renewal-token");
        h.fake.push(RENEWAL_URL, Reply::renewed(&token_expiring_in(900)));

        let mut guard = ViewGuard::new(h.authority.clone());
        let rendered = guard.render(|| ()).await;

        assert!(rendered.is_none(), "{malformed:?} must not render");
        assert_eq!(guard.state(), Unauthorized);
        assert_eq!(h.renewal_calls(), 0, "{malformed:?} must not renew");
        assert_eq!(h.redirect_count(), 1);
        assert!(h.store.is_empty());
    }
}

#[tokio::test]
async fn test_guard_without_credentials_redirects_without_network() {
    let h = Harness::new();

    let mut guard = ViewGuard::new(h.authority.clone());
    let mut rendered = false;
    let result = guard.render(|| rendered = true).await;

    assert!(result.is_none());
    assert!(!rendered);
    assert_eq!(guard.trail(), &[Unknown, Checking, Unauthorized]);
    assert_eq!(h.fake.total_calls(), 0);
    assert_eq!(h.redirect_count(), 1);
}

#[tokio::test]
async fn test_guard_expired_without_renewal_credential() {
    let h = Harness::new();
    h.store.set_access(&Credential::new(token_expiring_in(-60)));

    let mut guard = ViewGuard::new(h.authority.clone());
    assert_eq!(guard.mount().await, Unauthorized);
    assert_eq!(h.fake.total_calls(), 0);
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_guard_renewal_rejected_clears_everything() {
    let h = Harness::signed_in(&token_expiring_in(-5), "revoked");
    h.store.set(CredentialSlot::Identity, r#"{"username": "jdoe"}"#);
    h.fake.push(RENEWAL_URL, Reply::status(401));

    let mut guard = ViewGuard::new(h.authority.clone());
    assert_eq!(guard.mount().await, Unauthorized);

    assert_eq!(h.renewal_calls(), 1);
    for slot in CredentialSlot::ALL {
        assert!(h.store.get(slot).is_none(), "{} not cleared", slot.key());
    }
    assert_eq!(h.redirect_count(), 1);
}

#[tokio::test]
async fn test_guard_decision_is_final_for_mount() {
    let h = Harness::signed_in(&token_expiring_in(600), "renewal-token");

    let mut guard = ViewGuard::new(h.authority.clone());
    assert_eq!(guard.mount().await, Authorized);

    // Session ends elsewhere; this mount keeps its decision
    h.authority.logout();
    assert_eq!(guard.mount().await, Authorized);
    assert_eq!(guard.trail().len(), 3);

    // A fresh mount sees the new reality
    let mut next = ViewGuard::new(h.authority.clone());
    assert_eq!(next.mount().await, Unauthorized);
}

#[tokio::test]
async fn test_renewal_panic_denies_view_and_next_renewal_recovers() {
    let h = Harness::signed_in(&token_expiring_in(-1), "renewal-token");
    let fresh = token_expiring_in(900);
    h.fake.push(RENEWAL_URL, Reply::Panic);
    h.fake.push(RENEWAL_URL, Reply::renewed(&fresh));

    let mut guard = ViewGuard::new(h.authority.clone());
    assert!(guard.render(|| ()).await.is_none());
    assert_eq!(guard.trail(), &[Unknown, Checking, Unauthorized]);
    assert!(h.store.is_empty());
    assert_eq!(h.redirect_count(), 1);

    // Signing in again must not join the panicked flight
    h.store.set_pair(
        &Credential::new(token_expiring_in(-1)),
        &Credential::new("renewal-token"),
    );
    let mut next = ViewGuard::new(h.authority.clone());
    assert_eq!(next.mount().await, Authorized);
    assert_eq!(h.renewal_calls(), 2);
    assert_eq!(h.store.access(), Some(Credential::new(fresh)));
}

#[tokio::test]
async fn test_renewal_without_renewal_credential() {
    let h = Harness::new();
    let result = h.authority.renew().await;
    assert_eq!(result, Err(SessionError::NoRenewalCredential));
    assert_eq!(h.fake.total_calls(), 0);
}

#[tokio::test]
async fn test_renewal_transport_failure_is_rejection() {
    let h = Harness::signed_in(&token_expiring_in(-1), "renewal-token");
    h.fake.push(RENEWAL_URL, Reply::Fail);

    let result = h.authority.renew().await;
    assert!(matches!(result, Err(SessionError::RenewalRejected { .. })));
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_renewal_undecodable_response_is_rejection() {
    let h = Harness::signed_in(&token_expiring_in(-1), "renewal-token");
    h.fake.push(RENEWAL_URL, Reply::Status(200, "<html>".to_string()));

    let result = h.authority.renew().await;
    assert!(matches!(result, Err(SessionError::RenewalRejected { .. })));
    assert!(h.store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_renewal_timeout_is_rejection() {
    let h = Harness::with_timeout(Duration::from_secs(10));
    h.store.set_pair(
        &Credential::new(token_expiring_in(-1)),
        &Credential::new("renewal-token"),
    );
    h.fake.push(RENEWAL_URL, Reply::Hang);

    let result = h.authority.renew().await;
    match result {
        Err(SessionError::RenewalRejected { reason }) => assert!(reason.contains("10s")),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_renewal_stores_rotated_renewal_credential() {
    let h = Harness::signed_in(&token_expiring_in(-1), "old-renewal");
    let fresh = token_expiring_in(900);
    h.fake.push(
        RENEWAL_URL,
        Reply::json(200, serde_json::json!({ "access": fresh, "refresh": "new-renewal" })),
    );

    let renewed = h.authority.renew().await.expect("renewal should succeed");
    assert_eq!(renewed, Credential::new(fresh));
    assert_eq!(h.store.renewal(), Some(Credential::new("new-renewal")));
}

#[tokio::test]
async fn test_sequential_renewals_each_hit_the_endpoint() {
    let h = Harness::signed_in(&token_expiring_in(-1), "renewal-token");
    h.fake.push(RENEWAL_URL, Reply::renewed(&token_expiring_in(900)));

    h.authority.renew().await.expect("first renewal");
    h.authority.renew().await.expect("second renewal");
    assert_eq!(h.renewal_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_guards_share_one_renewal() {
    let h = Harness::signed_in(&token_expiring_in(-1), "renewal-token");
    h.fake.push(
        RENEWAL_URL,
        Reply::Delayed(
            Duration::from_millis(200),
            Box::new(Reply::renewed(&token_expiring_in(900))),
        ),
    );

    let mut guards: Vec<_> = (0..4).map(|_| ViewGuard::new(h.authority.clone())).collect();
    let states = futures::future::join_all(guards.iter_mut().map(|g| g.mount())).await;

    assert!(states.iter().all(|s| *s == Authorized));
    assert_eq!(h.renewal_calls(), 1);
}

#[tokio::test]
async fn test_login_logout_lifecycle() {
    let h = Harness::new();
    let access = token_expiring_in(300);
    h.fake.push(
        LOGIN_URL,
        Reply::json(200, serde_json::json!({ "access": access, "refresh": "renewal-token" })),
    );
    h.fake.push(
        PROFILE_URL,
        Reply::json(200, serde_json::json!({ "username": "jdoe", "first_name": "Jane" })),
    );

    h.gateway.login("jdoe", "hunter2").await.expect("login should succeed");

    let logins = h.fake.requests(LOGIN_URL);
    let login = &logins[0];
    assert_eq!(
        login.body,
        Some(serde_json::json!({ "username": "jdoe", "password": "hunter2" }))
    );
    assert!(login.bearer.is_none());
    assert_eq!(h.fake.requests(PROFILE_URL)[0].bearer.as_deref(), Some(access.as_str()));

    let status = h.authority.status();
    assert!(status.is_signed_in());
    assert_eq!(status.identity.map(|i| i.display_name()).as_deref(), Some("Jane"));
    let expires = status.access_expires_at.expect("expiry decoded");
    assert!(expires > Utc::now());

    h.authority.logout();
    assert!(h.store.is_empty());
    h.authority.logout();
    assert!(h.store.is_empty());
    assert!(!h.authority.status().is_signed_in());
}

#[tokio::test]
async fn test_login_rejected_leaves_store_empty() {
    let h = Harness::new();
    h.fake.push(LOGIN_URL, Reply::status(401));

    let err = h.gateway.login("jdoe", "wrong").await.unwrap_err();
    assert!(matches!(err, rota_core::ApiError::Unauthorized));
    assert!(h.store.is_empty());
    assert_eq!(h.fake.calls(PROFILE_URL), 0);
}

#[tokio::test]
async fn test_login_survives_profile_failure() {
    let h = Harness::new();
    h.fake.push(
        LOGIN_URL,
        Reply::json(200, serde_json::json!({ "access": token_expiring_in(300), "refresh": "r" })),
    );
    h.fake.push(PROFILE_URL, Reply::status(500));

    h.gateway.login("jdoe", "pw").await.expect("profile failure is not fatal");
    assert!(h.store.access().is_some());
    assert!(h.store.identity().is_none());
}
