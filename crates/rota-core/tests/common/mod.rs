#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use rota_core::api::{ApiRequest, ApiResponse, Transport, TransportError};
use rota_core::auth::{Credential, CredentialStore, SessionAuthority, SessionSettings};
use rota_core::Gateway;

pub const AUTH_BASE: &str = "http://auth.test/api";
pub const API_BASE: &str = "http://api.test/api";
pub const RENEWAL_URL: &str = "http://auth.test/api/token/refresh/";
pub const LOGIN_URL: &str = "http://auth.test/api/token/";
pub const PROFILE_URL: &str = "http://api.test/api/members/me/";

/// A credential whose `exp` is `offset_secs` from now.
pub fn token_expiring_in(offset_secs: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(
        r#"{{"exp": {}, "user_id": 7}}"#,
        Utc::now().timestamp() + offset_secs
    ));
    format!("{}.{}.c2ln", header, payload)
}

#[derive(Clone)]
pub enum Reply {
    Status(u16, String),
    Fail,
    Hang,
    Delayed(Duration, Box<Reply>),
    /// Panic while the request is being polled
    Panic,
}

impl Reply {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Reply::Status(status, body.to_string())
    }

    pub fn status(status: u16) -> Self {
        Reply::Status(status, String::new())
    }

    pub fn renewed(access: &str) -> Self {
        Reply::json(200, serde_json::json!({ "access": access }))
    }
}

/// Scripted transport. Each URL has a queue of replies; the last reply in a
/// queue is repeated once the others are used up.
#[derive(Default)]
pub struct FakeTransport {
    routes: Mutex<HashMap<String, VecDeque<Reply>>>,
    log: Mutex<Vec<ApiRequest>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, url: &str, reply: Reply) {
        self.routes
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|r| r.url == url).count()
    }

    pub fn requests(&self, url: &str) -> Vec<ApiRequest> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url == url)
            .cloned()
            .collect()
    }

    pub fn total_calls(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    fn next_reply(&self, url: &str) -> Reply {
        let mut routes = self.routes.lock().unwrap();
        match routes.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ => Reply::status(404),
        }
    }
}

async fn resolve(reply: Reply) -> Result<ApiResponse, TransportError> {
    let mut reply = reply;
    loop {
        match reply {
            Reply::Status(status, body) => return Ok(ApiResponse::new(status, body)),
            Reply::Fail => return Err(TransportError::Network("connection refused".into())),
            Reply::Hang => futures::future::pending::<()>().await,
            Reply::Panic => panic!("scripted transport panic"),
            Reply::Delayed(delay, inner) => {
                tokio::time::sleep(delay).await;
                reply = *inner;
            }
        }
    }
}

/// Lets tests keep a handle on the fake after handing it to the authority.
pub struct SharedFake(pub Arc<FakeTransport>);

impl Transport for SharedFake {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let reply = self.0.next_reply(&request.url);
        self.0.log.lock().unwrap().push(request);
        resolve(reply).await
    }
}

pub struct Harness {
    pub fake: Arc<FakeTransport>,
    pub store: CredentialStore,
    pub redirects: Arc<AtomicUsize>,
    pub authority: SessionAuthority<SharedFake>,
    pub gateway: Gateway<SharedFake>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(10))
    }

    pub fn with_timeout(renewal_timeout: Duration) -> Self {
        Self::build(CredentialStore::in_memory(), renewal_timeout)
    }

    pub fn with_store(store: CredentialStore) -> Self {
        Self::build(store, Duration::from_secs(10))
    }

    fn build(store: CredentialStore, renewal_timeout: Duration) -> Self {
        let fake = FakeTransport::new();
        let redirects = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&redirects);
        let authority = SessionAuthority::new(
            store.clone(),
            SharedFake(Arc::clone(&fake)),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            SessionSettings {
                auth_base_url: AUTH_BASE.to_string(),
                renewal_timeout,
            },
        );
        let gateway = Gateway::new(authority.clone(), API_BASE);
        Self {
            fake,
            store,
            redirects,
            authority,
            gateway,
        }
    }

    pub fn signed_in(access: &str, renewal: &str) -> Self {
        let harness = Self::new();
        harness
            .store
            .set_pair(&Credential::new(access), &Credential::new(renewal));
        harness
    }

    pub fn redirect_count(&self) -> usize {
        self.redirects.load(Ordering::SeqCst)
    }

    pub fn renewal_calls(&self) -> usize {
        self.fake.calls(RENEWAL_URL)
    }
}
