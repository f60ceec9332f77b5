//! Core library for rota: the session authority behind the membership client.
//!
//! A `SessionAuthority` owns the credential store and the renewal protocol.
//! Outbound calls go through `api::Gateway`; protected screens go through
//! `auth::ViewGuard`. Both share one authority, so they share one store and one
//! in-flight renewal.

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiError, Gateway, HttpTransport, Transport};
pub use auth::{
    CredentialStore, Navigator, SessionAuthority, SessionError, SessionSettings, SessionState,
    ViewGuard,
};
pub use config::{Config, StorageKind};
