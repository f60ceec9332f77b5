//! Authenticated, self-healing access to the membership API.
//!
//! Every form and listing goes through `Gateway::call` (or one of the JSON
//! helpers built on it). The gateway attaches the current access credential,
//! renews it at most once per call when the server answers 401, and backs off
//! when rate limited.

use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::transport::{ApiRequest, ApiResponse, Method, Transport};
use super::ApiError;
use crate::auth::authority::join_url;
use crate::auth::{Credential, IdentitySnapshot, SessionAuthority};

// ============================================================================
// Constants
// ============================================================================

/// Profile endpoint for the signed-in member
const PROFILE_PATH: &str = "members/me/";

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

const STATUS_UNAUTHORIZED: u16 = 401;
const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// Clone is cheap - the authority and base URL are shared.
pub struct Gateway<T: Transport> {
    authority: SessionAuthority<T>,
    api_base_url: Arc<str>,
}

impl<T: Transport> Clone for Gateway<T> {
    fn clone(&self) -> Self {
        Self {
            authority: self.authority.clone(),
            api_base_url: Arc::clone(&self.api_base_url),
        }
    }
}

impl<T: Transport> Gateway<T> {
    pub fn new(authority: SessionAuthority<T>, api_base_url: &str) -> Self {
        Self {
            authority,
            api_base_url: Arc::from(api_base_url),
        }
    }

    pub fn authority(&self) -> &SessionAuthority<T> {
        &self.authority
    }

    pub fn url(&self, path: &str) -> String {
        join_url(&self.api_base_url, path)
    }

    /// Issue a request with the current access credential.
    ///
    /// A 401 triggers one renewal and one re-issue; a second 401 is returned
    /// as-is. If renewal fails the session is cleared, the user is sent to
    /// login, and the renewal failure becomes the result. Any other status is
    /// returned unchanged.
    pub async fn call(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut renewed: Option<Credential> = None;
        let mut rate_limit_retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let retried = renewed.is_some();
            let mut attempt = request.clone();
            // After a renewal, send what it returned even if storing it failed
            attempt.bearer = match &renewed {
                Some(credential) => Some(credential.as_str().to_string()),
                None => self.authority.access().map(Credential::into_string),
            };

            debug!(method = ?attempt.method, url = %attempt.url, retried, "Gateway call");
            let response = self.authority.transport().send(attempt).await?;

            match response.status {
                STATUS_UNAUTHORIZED if !retried => {
                    debug!(url = %request.url, "Credential rejected, renewing");
                    match self.authority.renew().await {
                        Ok(credential) => renewed = Some(credential),
                        Err(e) => {
                            warn!(url = %request.url, error = %e, "Renewal failed during call");
                            self.authority.clear();
                            self.authority.redirect_to_login();
                            return Err(ApiError::Session(e));
                        }
                    }
                }
                STATUS_TOO_MANY_REQUESTS if rate_limit_retries < MAX_RATE_LIMIT_RETRIES => {
                    rate_limit_retries += 1;
                    warn!(
                        url = %request.url,
                        retry = rate_limit_retries,
                        backoff_ms = backoff_ms,
                        "Rate limited, backing off"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
                _ => return Ok(response),
            }
        }
    }

    /// Check if response is successful, returning an error with body if not.
    fn check_response(response: ApiResponse) -> Result<ApiResponse, ApiError> {
        if response.is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_status(response.status, &response.body))
        }
    }

    fn parse<R: DeserializeOwned>(response: ApiResponse, url: &str) -> Result<R, ApiError> {
        let response = Self::check_response(response)?;
        response.json().map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", url, e))
        })
    }

    async fn send_json<R, B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<R, ApiError>
    where
        R: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.url(path);
        let mut request = ApiRequest::new(method, url.clone());
        if let Some(body) = body {
            let value = serde_json::to_value(body)
                .map_err(|e| ApiError::InvalidResponse(format!("Unserializable body: {}", e)))?;
            request = request.with_body(value);
        }
        let response = self.call(request).await?;
        Self::parse(response, &url)
    }

    pub async fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R, ApiError> {
        self.send_json::<R, ()>(Method::Get, path, None).await
    }

    pub async fn post_json<R, B>(&self, path: &str, body: &B) -> Result<R, ApiError>
    where
        R: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send_json(Method::Post, path, Some(body)).await
    }

    pub async fn put_json<R, B>(&self, path: &str, body: &B) -> Result<R, ApiError>
    where
        R: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send_json(Method::Put, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        let response = self.call(ApiRequest::new(Method::Delete, self.url(path))).await?;
        Self::check_response(response)?;
        Ok(())
    }

    // ===== Session helpers =====

    /// Sign in and opportunistically cache the member's profile.
    pub async fn login(&self, username: &str, password: &str) -> Result<(), ApiError> {
        self.authority.authenticate(username, password).await?;
        if let Err(e) = self.refresh_identity().await {
            warn!(error = %e, "Signed in, but failed to fetch profile");
        }
        Ok(())
    }

    /// Fetch the signed-in member's profile and cache it for display.
    pub async fn refresh_identity(&self) -> Result<IdentitySnapshot, ApiError> {
        let snapshot: IdentitySnapshot = self.get_json(PROFILE_PATH).await?;
        self.authority.store().set_identity(&snapshot);
        debug!(username = %snapshot.username, "Identity snapshot refreshed");
        Ok(snapshot)
    }
}
