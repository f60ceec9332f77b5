//! Signed bearer credentials and their embedded claims.
//!
//! Credentials arrive in compact JWS form (`header.payload.signature`). The
//! client never verifies the signature - the server does that on every call -
//! it only reads the payload to learn when the credential expires.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use super::error::CredentialError;

/// Claims the client cares about. Anything else in the payload is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    /// Expiry, seconds since epoch
    pub exp: i64,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub user_id: Option<i64>,
}

impl Claims {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.exp, 0).single()
    }

    /// Expired means the expiry is not strictly in the future.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.exp <= now.timestamp()
    }
}

/// An opaque token string.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Decode the payload segment without checking the signature.
    pub fn claims(&self) -> Result<Claims, CredentialError> {
        let parts: Vec<&str> = self.0.split('.').collect();
        if parts.len() != 3 {
            return Err(CredentialError::Segments(parts.len()));
        }
        let payload = URL_SAFE_NO_PAD.decode(parts[1].trim_end_matches('='))?;
        Ok(serde_json::from_slice(&payload)?)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> Result<bool, CredentialError> {
        Ok(self.claims()?.is_expired_at(now))
    }
}

// Tokens never end up in logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(<{} bytes>)", self.0.len())
    }
}
