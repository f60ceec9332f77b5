//! Session authority: credentials, renewal and access decisions.
//!
//! This module provides:
//! - `CredentialStore`: durable slots for the access credential, renewal
//!   credential and identity snapshot (file, keychain or in-memory)
//! - `SessionAuthority`: the shared service owning the store and the
//!   single-flight renewal protocol
//! - `ViewGuard`: per-screen Unknown/Checking/Authorized/Unauthorized decision
//!
//! Outbound calls go through `api::Gateway`, which uses the same authority.

pub mod authority;
pub mod credential;
pub mod error;
pub mod guard;
pub mod identity;
pub mod navigator;
pub mod store;

pub use authority::{SessionAuthority, SessionSettings, SessionStatus};
pub use credential::{Claims, Credential};
pub use error::{CredentialError, SessionError};
pub use guard::{SessionState, ViewGuard};
pub use identity::IdentitySnapshot;
pub use navigator::Navigator;
pub use store::{
    CredentialSlot, CredentialStore, FileBackend, KeyringBackend, MemoryBackend, StoreBackend,
    StoreError,
};
