//! Access control for protected screens.
//!
//! A `ViewGuard` is created per mount. It decides once, up front, whether the
//! stored access credential is good enough to show the screen, renewing it
//! first if it has expired. The decision is final for that mount.

use std::panic::AssertUnwindSafe;

use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::authority::SessionAuthority;
use crate::api::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SessionState {
    /// Not yet mounted; no decision made
    Unknown,
    Checking,
    Authorized,
    Unauthorized,
}

pub struct ViewGuard<T: Transport> {
    authority: SessionAuthority<T>,
    state: SessionState,
    trail: Vec<SessionState>,
}

impl<T: Transport> ViewGuard<T> {
    pub fn new(authority: SessionAuthority<T>) -> Self {
        Self {
            authority,
            state: SessionState::Unknown,
            trail: vec![SessionState::Unknown],
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state this guard has been in, oldest first.
    pub fn trail(&self) -> &[SessionState] {
        &self.trail
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "View guard transition");
        self.state = next;
        self.trail.push(next);
    }

    /// Decide access. Runs the check on the first call only; later calls
    /// return the decision already made.
    pub async fn mount(&mut self) -> SessionState {
        if self.state != SessionState::Unknown {
            return self.state;
        }
        self.transition(SessionState::Checking);

        let decision = self.check().await;
        if decision == SessionState::Unauthorized {
            // Leave no half-valid session behind
            self.authority.clear();
            self.authority.redirect_to_login();
        }
        self.transition(decision);
        decision
    }

    /// Mount, then produce the view only if access was granted.
    pub async fn render<R>(&mut self, view: impl FnOnce() -> R) -> Option<R> {
        match self.mount().await {
            SessionState::Authorized => Some(view()),
            _ => None,
        }
    }

    async fn check(&self) -> SessionState {
        let Some(access) = self.authority.access() else {
            debug!("No access credential");
            return SessionState::Unauthorized;
        };

        match access.is_expired_at(Utc::now()) {
            Err(e) => {
                warn!(error = %e, "Access credential is malformed");
                SessionState::Unauthorized
            }
            Ok(false) => SessionState::Authorized,
            Ok(true) => {
                debug!("Access credential expired, renewing before render");
                match AssertUnwindSafe(self.authority.renew()).catch_unwind().await {
                    Ok(Ok(_)) => SessionState::Authorized,
                    Ok(Err(e)) => {
                        info!(error = %e, "Renewal failed, denying view");
                        SessionState::Unauthorized
                    }
                    Err(_) => {
                        warn!("Renewal panicked, denying view");
                        SessionState::Unauthorized
                    }
                }
            }
        }
    }
}
