//! The session authority: one injectable service that owns the credential
//! store, the renewal protocol and the route back to login.
//!
//! Both the request gateway and every view guard hold a clone of the same
//! `SessionAuthority`, so they share one store and one in-flight renewal.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::credential::Credential;
use super::error::SessionError;
use super::identity::IdentitySnapshot;
use super::navigator::Navigator;
use super::store::{lock, CredentialStore};
use crate::api::transport::{ApiRequest, Transport};
use crate::api::ApiError;
use crate::config::Config;

/// Renewal endpoint, relative to the auth base URL
const RENEWAL_PATH: &str = "token/refresh/";

/// Authentication endpoint, relative to the auth base URL
const AUTHENTICATE_PATH: &str = "token/";

#[derive(Debug, Deserialize)]
struct AuthenticateResponse {
    access: String,
    refresh: String,
}

#[derive(Debug, Deserialize)]
struct RenewalResponse {
    access: String,
    /// Present when the server rotates renewal credentials
    #[serde(default)]
    refresh: Option<String>,
}

type RenewalFlight = Shared<BoxFuture<'static, Result<Credential, SessionError>>>;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub auth_base_url: String,
    pub renewal_timeout: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            auth_base_url: config.auth_base_url.clone(),
            renewal_timeout: config.renewal_timeout(),
        }
    }
}

/// Summary of the stored session, for display.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub identity: Option<IdentitySnapshot>,
    pub access_expires_at: Option<DateTime<Utc>>,
    pub has_access: bool,
    pub has_renewal: bool,
}

impl SessionStatus {
    pub fn is_signed_in(&self) -> bool {
        self.has_access || self.has_renewal
    }

    /// Whether the access credential has expired. `None` when its expiry is
    /// unknown.
    pub fn access_expired_at(&self, now: DateTime<Utc>) -> Option<bool> {
        self.access_expires_at.map(|at| at <= now)
    }

    /// Minutes remaining until the access credential expires (for display)
    pub fn minutes_until_expiry(&self) -> Option<i64> {
        self.access_expires_at
            .map(|at| (at - Utc::now()).num_minutes().max(0))
    }
}

struct Inner<T> {
    store: CredentialStore,
    transport: Arc<T>,
    navigator: Arc<dyn Navigator>,
    settings: SessionSettings,
    in_flight: Mutex<Option<RenewalFlight>>,
}

pub struct SessionAuthority<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for SessionAuthority<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> SessionAuthority<T> {
    pub fn new(
        store: CredentialStore,
        transport: T,
        navigator: impl Navigator + 'static,
        settings: SessionSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                transport: Arc::new(transport),
                navigator: Arc::new(navigator),
                settings,
                in_flight: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }

    pub(crate) fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn access(&self) -> Option<Credential> {
        self.inner.store.access()
    }

    pub fn renewal(&self) -> Option<Credential> {
        self.inner.store.renewal()
    }

    pub fn set_access(&self, credential: &Credential) {
        self.inner.store.set_access(credential);
    }

    pub fn identity(&self) -> Option<IdentitySnapshot> {
        self.inner.store.identity()
    }

    pub fn clear(&self) {
        self.inner.store.clear();
    }

    pub fn redirect_to_login(&self) {
        info!("Redirecting to login");
        self.inner.navigator.redirect_to_login();
    }

    /// Exchange identity and secret for a fresh credential pair.
    #[tracing::instrument(skip(self, password))]
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<(), ApiError> {
        let url = join_url(&self.inner.settings.auth_base_url, AUTHENTICATE_PATH);
        let body = serde_json::json!({ "username": username, "password": password });

        let response = self.inner.transport.send(ApiRequest::post(url, body)).await?;
        if !response.is_success() {
            return Err(ApiError::from_status(response.status, &response.body));
        }
        let pair: AuthenticateResponse = response
            .json()
            .map_err(|e| ApiError::InvalidResponse(format!("authentication response: {}", e)))?;

        self.inner
            .store
            .set_pair(&Credential::new(pair.access), &Credential::new(pair.refresh));
        info!("Authenticated");
        Ok(())
    }

    /// Forget everything about the current session. Safe to call repeatedly.
    pub fn logout(&self) {
        self.inner.store.clear();
        info!("Logged out");
    }

    pub fn status(&self) -> SessionStatus {
        let access = self.inner.store.access();
        SessionStatus {
            identity: self.inner.store.identity(),
            access_expires_at: access
                .as_ref()
                .and_then(|c| c.claims().ok())
                .and_then(|claims| claims.expires_at()),
            has_access: access.is_some(),
            has_renewal: self.inner.store.renewal().is_some(),
        }
    }

    /// Run the renewal protocol, joining a renewal that is already in flight
    /// if there is one.
    pub async fn renew(&self) -> Result<Credential, SessionError> {
        let flight = {
            let mut slot = lock(&self.inner.in_flight);
            match slot.as_ref() {
                Some(flight) => {
                    debug!("Joining in-flight renewal");
                    flight.clone()
                }
                None => {
                    let flight = self.start_renewal();
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };

        let outcome = flight.clone().await;

        // Forget the finished flight so a later expiry renews again
        let mut slot = lock(&self.inner.in_flight);
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&flight)) {
            *slot = None;
        }
        outcome
    }

    fn start_renewal(&self) -> RenewalFlight {
        let store = self.inner.store.clone();
        let transport = Arc::clone(&self.inner.transport);
        let url = join_url(&self.inner.settings.auth_base_url, RENEWAL_PATH);
        let timeout = self.inner.settings.renewal_timeout;

        async move {
            let exchange = exchange_renewal(store.clone(), transport, url, timeout);
            match AssertUnwindSafe(exchange).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    // A panicked flight must still resolve for every joiner
                    warn!("Credential renewal panicked, clearing session");
                    store.clear();
                    Err(SessionError::rejected("renewal panicked"))
                }
            }
        }
        .boxed()
        .shared()
    }
}

async fn exchange_renewal<T: Transport>(
    store: CredentialStore,
    transport: Arc<T>,
    url: String,
    timeout: Duration,
) -> Result<Credential, SessionError> {
    let Some(renewal) = store.renewal() else {
        debug!("No renewal credential stored");
        return Err(SessionError::NoRenewalCredential);
    };

    debug!("Renewing access credential");
    let body = serde_json::json!({ "refresh": renewal.as_str() });
    let reason = match tokio::time::timeout(timeout, transport.send(ApiRequest::post(url, body))).await
    {
        Err(_) => format!("no response within {}s", timeout.as_secs()),
        Ok(Err(e)) => e.to_string(),
        Ok(Ok(response)) if response.is_success() => match response.json::<RenewalResponse>() {
            Ok(renewed) => {
                let access = Credential::new(renewed.access);
                store.set_access(&access);
                if let Some(rotated) = renewed.refresh {
                    store.set_renewal(&Credential::new(rotated));
                }
                info!("Access credential renewed");
                return Ok(access);
            }
            Err(e) => format!("undecodable renewal response: {}", e),
        },
        Ok(Ok(response)) => format!("renewal endpoint returned status {}", response.status),
    };

    warn!(reason = %reason, "Credential renewal failed, clearing session");
    store.clear();
    Err(SessionError::rejected(reason))
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
