//! Durable slots for the session's credentials.
//!
//! The store is deliberately dumb: it validates nothing and never fails from
//! the caller's point of view. Backend errors are logged and reads degrade to
//! "absent", which every caller already has to handle.

use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use keyring::Entry;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::credential::Credential;
use super::identity::IdentitySnapshot;

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// Keychain service name
const SERVICE_NAME: &str = "rota";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CredentialSlot {
    Access,
    Renewal,
    Identity,
}

impl CredentialSlot {
    pub const ALL: [CredentialSlot; 3] = [
        CredentialSlot::Access,
        CredentialSlot::Renewal,
        CredentialSlot::Identity,
    ];

    /// Persisted name of the slot.
    pub fn key(self) -> &'static str {
        match self {
            CredentialSlot::Access => "access_credential",
            CredentialSlot::Renewal => "renewal_credential",
            CredentialSlot::Identity => "identity_snapshot",
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt session file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),
}

/// Where slot values physically live.
pub trait StoreBackend: Send + Sync {
    fn load(&self, slot: CredentialSlot) -> Result<Option<String>, StoreError>;

    fn save(&self, slot: CredentialSlot, value: &str) -> Result<(), StoreError>;

    fn remove(&self, slot: CredentialSlot) -> Result<(), StoreError>;

    /// Write several slots as one operation. Backends that can do this in a
    /// single write should override it.
    fn save_many(&self, entries: &[(CredentialSlot, &str)]) -> Result<(), StoreError> {
        for (slot, value) in entries {
            self.save(*slot, value)?;
        }
        Ok(())
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Backends
// ============================================================================

/// In-process slots. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryBackend {
    slots: Mutex<HashMap<CredentialSlot, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreBackend for MemoryBackend {
    fn load(&self, slot: CredentialSlot) -> Result<Option<String>, StoreError> {
        Ok(lock(&self.slots).get(&slot).cloned())
    }

    fn save(&self, slot: CredentialSlot, value: &str) -> Result<(), StoreError> {
        lock(&self.slots).insert(slot, value.to_string());
        Ok(())
    }

    fn remove(&self, slot: CredentialSlot) -> Result<(), StoreError> {
        lock(&self.slots).remove(&slot);
        Ok(())
    }
}

/// All slots in one JSON document, rewritten whole on every change.
pub struct FileBackend {
    path: PathBuf,
    // Serializes read-modify-write cycles on the file
    guard: Mutex<()>,
}

impl FileBackend {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            path: cache_dir.join(SESSION_FILE),
            guard: Mutex::new(()),
        }
    }

    fn read(&self) -> Result<BTreeMap<String, String>, StoreError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn write(&self, slots: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if slots.is_empty() {
            if self.path.exists() {
                std::fs::remove_file(&self.path)?;
            }
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(slots)?;

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        // The mode only applies on creation; tighten files left by older runs
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(contents.as_bytes())?;
        Ok(())
    }
}

impl StoreBackend for FileBackend {
    fn load(&self, slot: CredentialSlot) -> Result<Option<String>, StoreError> {
        let _held = lock(&self.guard);
        Ok(self.read()?.remove(slot.key()))
    }

    fn save(&self, slot: CredentialSlot, value: &str) -> Result<(), StoreError> {
        self.save_many(&[(slot, value)])
    }

    fn remove(&self, slot: CredentialSlot) -> Result<(), StoreError> {
        let _held = lock(&self.guard);
        // A corrupt file is replaced rather than preserved
        let mut slots = self.read().unwrap_or_default();
        slots.remove(slot.key());
        self.write(&slots)
    }

    fn save_many(&self, entries: &[(CredentialSlot, &str)]) -> Result<(), StoreError> {
        let _held = lock(&self.guard);
        let mut slots = self.read().unwrap_or_default();
        for (slot, value) in entries {
            slots.insert(slot.key().to_string(), value.to_string());
        }
        self.write(&slots)
    }
}

/// One OS keychain entry per slot.
pub struct KeyringBackend {
    service: String,
}

impl KeyringBackend {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    fn entry(&self, slot: CredentialSlot) -> Result<Entry, StoreError> {
        Ok(Entry::new(&self.service, slot.key())?)
    }
}

impl Default for KeyringBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreBackend for KeyringBackend {
    fn load(&self, slot: CredentialSlot) -> Result<Option<String>, StoreError> {
        match self.entry(slot)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, slot: CredentialSlot, value: &str) -> Result<(), StoreError> {
        self.entry(slot)?.set_password(value)?;
        Ok(())
    }

    fn remove(&self, slot: CredentialSlot) -> Result<(), StoreError> {
        match self.entry(slot)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// Typed access to the three session slots.
/// Clone is cheap - all clones share one backend.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn StoreBackend>,
}

impl CredentialStore {
    pub fn new(backend: impl StoreBackend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }

    pub fn get(&self, slot: CredentialSlot) -> Option<String> {
        match self.backend.load(slot) {
            Ok(value) => value,
            Err(e) => {
                warn!(slot = slot.key(), error = %e, "Failed to read credential slot");
                None
            }
        }
    }

    pub fn set(&self, slot: CredentialSlot, value: &str) {
        if let Err(e) = self.backend.save(slot, value) {
            warn!(slot = slot.key(), error = %e, "Failed to write credential slot");
        }
    }

    pub fn access(&self) -> Option<Credential> {
        self.get(CredentialSlot::Access).map(Credential::new)
    }

    pub fn renewal(&self) -> Option<Credential> {
        self.get(CredentialSlot::Renewal).map(Credential::new)
    }

    pub fn set_access(&self, credential: &Credential) {
        self.set(CredentialSlot::Access, credential.as_str());
    }

    pub fn set_renewal(&self, credential: &Credential) {
        self.set(CredentialSlot::Renewal, credential.as_str());
    }

    /// Store a freshly issued credential pair. Any identity snapshot from a
    /// previous session is dropped.
    pub fn set_pair(&self, access: &Credential, renewal: &Credential) {
        self.remove(CredentialSlot::Identity);
        let entries = [
            (CredentialSlot::Access, access.as_str()),
            (CredentialSlot::Renewal, renewal.as_str()),
        ];
        if let Err(e) = self.backend.save_many(&entries) {
            warn!(error = %e, "Failed to write credential pair");
        }
    }

    pub fn identity(&self) -> Option<IdentitySnapshot> {
        let raw = self.get(CredentialSlot::Identity)?;
        match serde_json::from_str(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                debug!(error = %e, "Ignoring undecodable identity snapshot");
                None
            }
        }
    }

    pub fn set_identity(&self, snapshot: &IdentitySnapshot) {
        match serde_json::to_string(snapshot) {
            Ok(raw) => self.set(CredentialSlot::Identity, &raw),
            Err(e) => warn!(error = %e, "Failed to encode identity snapshot"),
        }
    }

    fn remove(&self, slot: CredentialSlot) {
        if let Err(e) = self.backend.remove(slot) {
            warn!(slot = slot.key(), error = %e, "Failed to clear credential slot");
        }
    }

    /// Wipe all three slots. Clearing an empty store is a no-op.
    pub fn clear(&self) {
        for slot in CredentialSlot::ALL {
            self.remove(slot);
        }
        debug!("Credential store cleared");
    }

    pub fn is_empty(&self) -> bool {
        CredentialSlot::ALL.iter().all(|slot| self.get(*slot).is_none())
    }
}
