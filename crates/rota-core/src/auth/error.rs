use thiserror::Error;

/// Why a session could not be established or kept alive.
///
/// `Clone` because a single renewal outcome is handed to every caller that
/// waited on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("No renewal credential - please log in again")]
    NoRenewalCredential,

    #[error("Renewal rejected: {reason}")]
    RenewalRejected { reason: String },

    #[error("Access credential is malformed")]
    MalformedAccessCredential,
}

impl SessionError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        SessionError::RenewalRejected {
            reason: reason.into(),
        }
    }
}

/// Failure to decode the claims embedded in a credential.
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("expected 3 dot-separated segments, found {0}")]
    Segments(usize),

    #[error("payload is not base64url: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("payload is not a JSON claims object: {0}")]
    Claims(#[from] serde_json::Error),
}
