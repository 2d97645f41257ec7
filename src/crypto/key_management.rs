//! Signing Key Management
//!
//! Holds the ledger's signing keys, tracks which one is active, and keeps
//! retired keys around so historical blocks stay verifiable after rotation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use secp256k1::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::signatures::SignatureManager;
use crate::error::{LedgerError, LedgerResult};

const KEYRING_VERSION: u32 = 1;

/// Source of signing and verification keys, injected into the Signer and Verifier
pub trait KeyProvider: Send + Sync {
    /// Id of the key new blocks must be signed with
    fn current_key_id(&self) -> LedgerResult<String>;

    /// Secret material for `key_id`
    fn signing_key(&self, key_id: &str) -> LedgerResult<SecretKey>;

    /// Public key for `key_id`, if that key is still trusted for verification
    fn public_key(&self, key_id: &str) -> Option<PublicKey>;
}

/// Key status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Retired,
    Revoked,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Retired => "retired",
            KeyStatus::Revoked => "revoked",
        }
    }
}

impl std::str::FromStr for KeyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(KeyStatus::Active),
            "retired" => Ok(KeyStatus::Retired),
            "revoked" => Ok(KeyStatus::Revoked),
            _ => Err(format!("Unknown key status: {}", s)),
        }
    }
}

/// Public description of a signing key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub key_id: String,
    pub public_key: String,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revocation_reason: Option<String>,
}

struct KeyEntry {
    metadata: KeyMetadata,
    public_key: PublicKey,
    secret_key: Option<SecretKey>,
}

#[derive(Default)]
struct KeyringState {
    keys: HashMap<String, KeyEntry>,
    active: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct KeyringFile {
    version: u32,
    active_key_id: Option<String>,
    keys: Vec<StoredKey>,
}

#[derive(Serialize, Deserialize)]
struct StoredKey {
    #[serde(flatten)]
    metadata: KeyMetadata,
    #[serde(default)]
    secret_key: Option<String>,
}

/// In-process keyring backed by a JSON file
pub struct KeyManager {
    signature_manager: SignatureManager,
    state: RwLock<KeyringState>,
}

impl KeyManager {
    /// Create an empty keyring with no active key
    pub fn new() -> Self {
        Self {
            signature_manager: SignatureManager::new(),
            state: RwLock::new(KeyringState::default()),
        }
    }

    /// Create a keyring holding one freshly generated active key
    pub fn generate() -> Self {
        let manager = Self::new();
        manager.rotate();
        manager
    }

    fn read(&self) -> RwLockReadGuard<'_, KeyringState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, KeyringState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn generate_key_id() -> String {
        format!(
            "ledger-{}-{:08x}",
            Utc::now().format("%Y%m%d%H%M%S"),
            rand::random::<u32>()
        )
    }

    /// Make a new key active, retiring the previous active key.
    ///
    /// Retired keys keep verifying the blocks they signed.
    pub fn rotate(&self) -> KeyMetadata {
        let (secret_key, public_key) = self.signature_manager.generate_keypair();
        let now = Utc::now();
        let metadata = KeyMetadata {
            key_id: Self::generate_key_id(),
            public_key: public_key.to_string(),
            status: KeyStatus::Active,
            created_at: now,
            retired_at: None,
            revocation_reason: None,
        };

        let mut state = self.write();
        if let Some(previous) = state.active.take() {
            if let Some(entry) = state.keys.get_mut(&previous) {
                entry.metadata.status = KeyStatus::Retired;
                entry.metadata.retired_at = Some(now);
            }
            info!("Retired signing key {}", previous);
        }

        state.keys.insert(
            metadata.key_id.clone(),
            KeyEntry {
                metadata: metadata.clone(),
                public_key,
                secret_key: Some(secret_key),
            },
        );
        state.active = Some(metadata.key_id.clone());

        info!("Activated signing key {}", metadata.key_id);
        metadata
    }

    /// Stop signing with a key while keeping it valid for verification
    pub fn retire(&self, key_id: &str) -> LedgerResult<()> {
        let mut state = self.write();
        let entry = state
            .keys
            .get_mut(key_id)
            .ok_or_else(|| LedgerError::NotFound(format!("signing key {}", key_id)))?;

        if entry.metadata.status == KeyStatus::Revoked {
            return Err(LedgerError::CryptoError(format!(
                "Key {} is revoked and cannot be retired",
                key_id
            )));
        }

        entry.metadata.status = KeyStatus::Retired;
        entry.metadata.retired_at.get_or_insert_with(Utc::now);

        if state.active.as_deref() == Some(key_id) {
            state.active = None;
            warn!("Retired the active signing key {}; signing is disabled until rotation", key_id);
        } else {
            info!("Retired signing key {}", key_id);
        }
        Ok(())
    }

    /// Distrust a key entirely. Blocks it signed no longer verify.
    pub fn revoke(&self, key_id: &str, reason: &str) -> LedgerResult<()> {
        let mut state = self.write();
        let entry = state
            .keys
            .get_mut(key_id)
            .ok_or_else(|| LedgerError::NotFound(format!("signing key {}", key_id)))?;

        entry.metadata.status = KeyStatus::Revoked;
        entry.metadata.retired_at.get_or_insert_with(Utc::now);
        entry.metadata.revocation_reason = Some(reason.to_string());
        entry.secret_key = None;

        if state.active.as_deref() == Some(key_id) {
            state.active = None;
        }

        warn!("Revoked signing key {} (reason: {})", key_id, reason);
        Ok(())
    }

    pub fn get_key_metadata(&self, key_id: &str) -> Option<KeyMetadata> {
        self.read().keys.get(key_id).map(|e| e.metadata.clone())
    }

    /// All keys, oldest first
    pub fn list(&self) -> Vec<KeyMetadata> {
        let mut keys: Vec<KeyMetadata> = self
            .read()
            .keys
            .values()
            .map(|e| e.metadata.clone())
            .collect();
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.key_id.cmp(&b.key_id)));
        keys
    }

    /// Load a keyring file
    pub fn load(path: &Path) -> LedgerResult<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            LedgerError::SigningKeyUnavailable(format!("Failed to read keyring {:?}: {}", path, e))
        })?;
        let file: KeyringFile = serde_json::from_str(&contents).map_err(|e| {
            LedgerError::SigningKeyUnavailable(format!("Failed to parse keyring {:?}: {}", path, e))
        })?;

        if file.version != KEYRING_VERSION {
            return Err(LedgerError::SigningKeyUnavailable(format!(
                "Unsupported keyring version {}",
                file.version
            )));
        }

        let manager = Self::new();
        {
            let mut state = manager.write();
            for stored in file.keys {
                let entry = manager.restore_entry(stored)?;
                state.keys.insert(entry.metadata.key_id.clone(), entry);
            }

            if let Some(active) = file.active_key_id {
                let usable = state
                    .keys
                    .get(&active)
                    .map(|e| e.metadata.status == KeyStatus::Active && e.secret_key.is_some())
                    .unwrap_or(false);
                if !usable {
                    return Err(LedgerError::SigningKeyUnavailable(format!(
                        "Active key {} is missing or has no secret material",
                        active
                    )));
                }
                state.active = Some(active);
            }
        }

        info!("Loaded {} signing keys from {:?}", manager.read().keys.len(), path);
        Ok(manager)
    }

    fn restore_entry(&self, stored: StoredKey) -> LedgerResult<KeyEntry> {
        let key_id = stored.metadata.key_id.clone();
        let public_key: PublicKey = stored.metadata.public_key.parse().map_err(|e| {
            LedgerError::SigningKeyUnavailable(format!("Invalid public key for {}: {}", key_id, e))
        })?;

        let secret_key = match stored.secret_key {
            Some(secret_hex) => {
                let raw = hex::decode(secret_hex).map_err(|e| {
                    LedgerError::SigningKeyUnavailable(format!("Invalid secret hex for {}: {}", key_id, e))
                })?;
                let secret = SecretKey::from_slice(&raw).map_err(|e| {
                    LedgerError::SigningKeyUnavailable(format!("Invalid secret key for {}: {}", key_id, e))
                })?;
                if self.signature_manager.public_key_from_secret(&secret) != public_key {
                    return Err(LedgerError::SigningKeyUnavailable(format!(
                        "Secret key for {} does not match its public key",
                        key_id
                    )));
                }
                Some(secret)
            }
            None => None,
        };

        Ok(KeyEntry {
            metadata: stored.metadata,
            public_key,
            secret_key,
        })
    }

    /// Write the keyring to `path`, replacing it atomically
    pub fn save(&self, path: &Path) -> LedgerResult<()> {
        let file = {
            let state = self.read();
            let mut keys: Vec<StoredKey> = state
                .keys
                .values()
                .map(|e| StoredKey {
                    metadata: e.metadata.clone(),
                    secret_key: e.secret_key.map(|s| hex::encode(s.secret_bytes())),
                })
                .collect();
            keys.sort_by(|a, b| a.metadata.created_at.cmp(&b.metadata.created_at));
            KeyringFile {
                version: KEYRING_VERSION,
                active_key_id: state.active.clone(),
                keys,
            }
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    LedgerError::ConfigError(format!("Failed to create keyring directory: {}", e))
                })?;
            }
        }

        let json = serde_json::to_string_pretty(&file)?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, json)
            .map_err(|e| LedgerError::ConfigError(format!("Failed to write keyring: {}", e)))?;
        fs::rename(&tmp_path, path)
            .map_err(|e| LedgerError::ConfigError(format!("Failed to replace keyring: {}", e)))?;

        info!("Saved keyring to {:?}", path);
        Ok(())
    }

    /// Replace every key with the contents of `path`.
    ///
    /// The file is parsed in full before anything is swapped, so a bad file
    /// leaves the current keys in place.
    pub fn reload(&self, path: &Path) -> LedgerResult<()> {
        let fresh = Self::load(path)?;
        let fresh_state = std::mem::take(&mut *fresh.write());

        let mut state = self.write();
        let previous = state.active.take();
        *state = fresh_state;

        match (&previous, &state.active) {
            (old, new) if old == new => debug!("Reloaded keyring {:?}", path),
            (_, Some(new)) => info!("Keyring reload switched the signing key to {}", new),
            (Some(old), None) => warn!(
                "Keyring reload left no active key (was {}); signing is disabled",
                old
            ),
            (None, None) => {}
        }
        Ok(())
    }

    /// Load the keyring, creating one with a fresh active key if allowed
    pub fn load_or_create(path: &Path, generate_if_missing: bool) -> LedgerResult<Self> {
        if path.exists() {
            return Self::load(path);
        }
        if !generate_if_missing {
            return Err(LedgerError::SigningKeyUnavailable(format!(
                "Keyring {:?} does not exist",
                path
            )));
        }
        warn!("Keyring {:?} not found, generating a new signing key", path);
        let manager = Self::generate();
        manager.save(path)?;
        Ok(manager)
    }
}

/// Modification time and size, enough to notice a replaced keyring file
fn keyring_fingerprint(path: &Path) -> Option<(SystemTime, u64)> {
    let metadata = fs::metadata(path).ok()?;
    Some((metadata.modified().ok()?, metadata.len()))
}

/// Poll the keyring file and reload `keys` whenever it changes, so rotations
/// and revocations made with the key manager reach a running service.
pub fn spawn_keyring_watcher(
    keys: Arc<KeyManager>,
    path: PathBuf,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut seen = keyring_fingerprint(&path);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let current = keyring_fingerprint(&path);
            if current.is_none() || current == seen {
                continue;
            }
            match keys.reload(&path) {
                Ok(()) => seen = current,
                Err(e) => warn!("Keeping current signing keys, reload of {:?} failed: {}", path, e),
            }
        }
        debug!("Stopped watching keyring {:?}", path);
    })
}

impl Default for KeyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyProvider for KeyManager {
    fn current_key_id(&self) -> LedgerResult<String> {
        self.read()
            .active
            .clone()
            .ok_or_else(|| LedgerError::SigningKeyUnavailable("No active signing key".to_string()))
    }

    fn signing_key(&self, key_id: &str) -> LedgerResult<SecretKey> {
        let state = self.read();
        let entry = state.keys.get(key_id).ok_or_else(|| {
            LedgerError::SigningKeyUnavailable(format!("Unknown signing key {}", key_id))
        })?;
        if entry.metadata.status == KeyStatus::Revoked {
            return Err(LedgerError::SigningKeyUnavailable(format!(
                "Signing key {} is revoked",
                key_id
            )));
        }
        entry.secret_key.ok_or_else(|| {
            LedgerError::SigningKeyUnavailable(format!("No secret material for key {}", key_id))
        })
    }

    fn public_key(&self, key_id: &str) -> Option<PublicKey> {
        self.read()
            .keys
            .get(key_id)
            .filter(|e| e.metadata.status != KeyStatus::Revoked)
            .map(|e| e.public_key)
    }
}
