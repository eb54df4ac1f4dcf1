//! Key store: namespaced key/value state for identity, prekeys, sessions and
//! trusted remote identities, mirrored to a durable [`Persistence`] backend.

mod memory;
mod records;

pub use memory::MemoryPersistence;
pub use records::{PreKeyRecord, SignedPreKeyRecord};

use crate::crypto::{IdentityKey, IdentityKeyPair, KeyPair};
use crate::error::StoreError;
use crate::types::{DeviceAddress, DeviceId, Jid};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

const IDENTITY_KEY_PAIR: &str = "identityKey";
const REGISTRATION_ID: &str = "registrationId";
const DEVICE_ID: &str = "deviceId";
const NEXT_PREKEY_ID: &str = "nextPreKeyId";
const PREKEY_PREFIX: &str = "25519KeypreKey";
const SIGNED_PREKEY_PREFIX: &str = "25519KeysignedKey";
const SESSION_PREFIX: &str = "session";
const TRUSTED_PREFIX: &str = "trustedIdentity";

/// Durable key/value backend the [`KeyStore`] mirrors its mutations to.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Write (or overwrite) one entry.
    async fn save(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Delete one entry. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`.
    async fn load_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Alias for a shared persistence backend.
pub type SharedPersistence = Arc<dyn Persistence>;

#[derive(Debug)]
enum Mutation {
    Put(String, Vec<u8>),
    Remove(String),
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Vec<u8>>,
    journal: Vec<Mutation>,
}

/// In-memory key store shared by every device session of one account.
///
/// All access goes through one coarse lock, so a mutation is never observed
/// half-applied. Mutations are journaled and written out by [`KeyStore::flush`].
pub struct KeyStore {
    namespace: String,
    inner: RwLock<Inner>,
    persistence: Option<SharedPersistence>,
    // held for a whole flush so journal slices reach persistence in order
    flushing: tokio::sync::Mutex<()>,
}

impl KeyStore {
    /// Memory-only store; nothing is journaled.
    pub fn new() -> Self {
        Self {
            namespace: String::new(),
            inner: RwLock::new(Inner::default()),
            persistence: None,
            flushing: tokio::sync::Mutex::new(()),
        }
    }

    /// Load every persisted entry under `namespace` and mirror future
    /// mutations back to `persistence`.
    pub async fn open(namespace: impl Into<String>, persistence: SharedPersistence) -> Result<Self> {
        let namespace = namespace.into();
        let prefix = format!("{}/", namespace);
        let mut entries = HashMap::new();
        for (key, value) in persistence.load_prefix(&prefix).await? {
            if let Some(k) = key.strip_prefix(&prefix) {
                entries.insert(k.to_string(), value);
            }
        }
        tracing::debug!(namespace = %namespace, entries = entries.len(), "key store loaded");
        Ok(Self {
            namespace,
            inner: RwLock::new(Inner {
                entries,
                journal: Vec::new(),
            }),
            persistence: Some(persistence),
            flushing: tokio::sync::Mutex::new(()),
        })
    }

    /// Write journaled mutations to the persistence backend, in order.
    ///
    /// On failure the unwritten mutations go back to the front of the
    /// journal, so the next flush resumes where this one stopped.
    pub async fn flush(&self) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        let _flushing = self.flushing.lock().await;
        let journal = std::mem::take(
            &mut self
                .inner
                .write()
                .map_err(|e| StoreError::Save(e.to_string()))?
                .journal,
        );
        let mut pending = journal.into_iter();
        while let Some(m) = pending.next() {
            let written = match &m {
                Mutation::Put(k, v) => {
                    persistence
                        .save(&format!("{}/{}", self.namespace, k), v)
                        .await
                }
                Mutation::Remove(k) => {
                    persistence
                        .delete(&format!("{}/{}", self.namespace, k))
                        .await
                }
            };
            if let Err(e) = written {
                let mut unwritten: Vec<Mutation> = std::iter::once(m).chain(pending).collect();
                let mut inner = self
                    .inner
                    .write()
                    .map_err(|e| StoreError::Save(e.to_string()))?;
                unwritten.append(&mut inner.journal);
                inner.journal = unwritten;
                tracing::warn!(pending = inner.journal.len(), error = %e, "key store flush failed");
                return Err(e);
            }
        }
        Ok(())
    }

    fn check_key(key: &str) -> Result<()> {
        if key.trim().is_empty() {
            return Err(StoreError::InvalidKey("empty key".into()).into());
        }
        Ok(())
    }

    /// Store `value` under `key`. Empty keys and empty values are `InvalidKey`.
    pub fn put(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<()> {
        Self::check_key(key)?;
        let value = value.into();
        if value.is_empty() {
            return Err(StoreError::InvalidKey(format!("empty value for {}", key)).into());
        }
        let mut inner = self
            .inner
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?;
        if self.persistence.is_some() {
            inner.journal.push(Mutation::Put(key.to_string(), value.clone()));
        }
        inner.entries.insert(key.to_string(), value);
        Ok(())
    }

    /// Value under `key`; an empty key is `InvalidKey`. `None` is the absent
    /// marker and callers decide whether that is fatal.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Self::check_key(key)?;
        let inner = self
            .inner
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?;
        Ok(inner.entries.get(key).cloned())
    }

    pub fn get_or(&self, key: &str, default: impl Into<Vec<u8>>) -> Result<Vec<u8>> {
        Ok(self.get(key)?.unwrap_or_else(|| default.into()))
    }

    /// Delete `key` if present; an empty key is `InvalidKey`.
    pub fn remove(&self, key: &str) -> Result<()> {
        Self::check_key(key)?;
        let mut inner = self
            .inner
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?;
        if inner.entries.remove(key).is_some() && self.persistence.is_some() {
            inner.journal.push(Mutation::Remove(key.to_string()));
        }
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let inner = self
            .inner
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?;
        Ok(inner
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    // Local identity.

    pub fn get_identity_key_pair(&self) -> Result<Option<IdentityKeyPair>> {
        self.get(IDENTITY_KEY_PAIR)?
            .map(|b| records::decode_identity(IDENTITY_KEY_PAIR, &b).map_err(Into::into))
            .transpose()
    }

    pub fn store_identity_key_pair(&self, pair: &IdentityKeyPair) -> Result<()> {
        self.put(IDENTITY_KEY_PAIR, records::encode_identity(pair))
    }

    pub fn get_local_registration_id(&self) -> Result<Option<u32>> {
        self.get_u32(REGISTRATION_ID)
    }

    pub fn store_local_registration_id(&self, id: u32) -> Result<()> {
        self.put(REGISTRATION_ID, id.to_be_bytes().to_vec())
    }

    pub fn get_device_id(&self) -> Result<Option<DeviceId>> {
        self.get_u32(DEVICE_ID)
    }

    pub fn store_device_id(&self, id: DeviceId) -> Result<()> {
        self.put(DEVICE_ID, id.to_be_bytes().to_vec())
    }

    /// Next unused one-time prekey id (0 when nothing was generated yet).
    pub fn next_prekey_id(&self) -> Result<u32> {
        Ok(self.get_u32(NEXT_PREKEY_ID)?.unwrap_or(0))
    }

    pub fn store_next_prekey_id(&self, id: u32) -> Result<()> {
        self.put(NEXT_PREKEY_ID, id.to_be_bytes().to_vec())
    }

    fn get_u32(&self, key: &str) -> Result<Option<u32>> {
        self.get(key)?
            .map(|b| records::decode_u32(key, &b).map_err(Into::into))
            .transpose()
    }

    // One-time prekeys.

    pub fn load_pre_key(&self, id: u32) -> Result<Option<PreKeyRecord>> {
        let key = format!("{}{}", PREKEY_PREFIX, id);
        self.get(&key)?
            .map(|b| {
                records::decode_key_pair(&key, &b)
                    .map(|r| PreKeyRecord {
                        id: r.id,
                        key_pair: r.key_pair,
                    })
                    .map_err(Into::into)
            })
            .transpose()
    }

    pub fn store_pre_key(&self, id: u32, key_pair: &KeyPair) -> Result<()> {
        self.put(
            &format!("{}{}", PREKEY_PREFIX, id),
            records::encode_key_pair(id, key_pair, &[]),
        )
    }

    pub fn remove_pre_key(&self, id: u32) -> Result<()> {
        self.remove(&format!("{}{}", PREKEY_PREFIX, id))
    }

    /// Ids of every one-time prekey still held, ascending.
    pub fn pre_key_ids(&self) -> Result<Vec<u32>> {
        let mut ids: Vec<u32> = self
            .keys_with_prefix(PREKEY_PREFIX)?
            .iter()
            .filter_map(|k| k[PREKEY_PREFIX.len()..].parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    // Signed prekeys.

    pub fn load_signed_pre_key(&self, id: u32) -> Result<Option<SignedPreKeyRecord>> {
        let key = format!("{}{}", SIGNED_PREKEY_PREFIX, id);
        self.get(&key)?
            .map(|b| records::decode_key_pair(&key, &b).map_err(Into::into))
            .transpose()
    }

    pub fn store_signed_pre_key(&self, id: u32, key_pair: &KeyPair, signature: &[u8]) -> Result<()> {
        self.put(
            &format!("{}{}", SIGNED_PREKEY_PREFIX, id),
            records::encode_key_pair(id, key_pair, signature),
        )
    }

    pub fn remove_signed_pre_key(&self, id: u32) -> Result<()> {
        self.remove(&format!("{}{}", SIGNED_PREKEY_PREFIX, id))
    }

    // Sessions. Records are opaque bytes owned by the ratchet.

    pub fn load_session(&self, address: &DeviceAddress) -> Result<Option<Vec<u8>>> {
        self.get(&format!("{}{}", SESSION_PREFIX, address))
    }

    pub fn has_session(&self, address: &DeviceAddress) -> Result<bool> {
        Ok(self.load_session(address)?.is_some())
    }

    pub fn store_session(&self, address: &DeviceAddress, record: Vec<u8>) -> Result<()> {
        self.put(&format!("{}{}", SESSION_PREFIX, address), record)
    }

    pub fn remove_session(&self, address: &DeviceAddress) -> Result<()> {
        self.remove(&format!("{}{}", SESSION_PREFIX, address))
    }

    /// Remove every session of every device of `jid`. Returns how many went.
    pub fn remove_all_sessions(&self, jid: &Jid) -> Result<usize> {
        let prefix = format!("{}{}.", SESSION_PREFIX, jid.to_bare());
        let keys: Vec<String> = self
            .keys_with_prefix(&prefix)?
            .into_iter()
            .filter(|k| k[prefix.len()..].parse::<DeviceId>().is_ok())
            .collect();
        for k in &keys {
            self.remove(k)?;
        }
        Ok(keys.len())
    }

    // Remote identities (trust on first use).

    /// True when nothing is recorded for `address` yet (the key is recorded
    /// now) or when the recorded key is identical. False on mismatch.
    pub fn is_trusted_identity(&self, address: &DeviceAddress, identity: &IdentityKey) -> Result<bool> {
        match self.load_identity_key(address)? {
            None => {
                self.save_identity(address, identity)?;
                Ok(true)
            }
            Some(known) => Ok(known == *identity),
        }
    }

    pub fn load_identity_key(&self, address: &DeviceAddress) -> Result<Option<IdentityKey>> {
        let key = format!("{}{}", TRUSTED_PREFIX, address);
        self.get(&key)?
            .map(|b| records::decode_identity_key(&key, &b).map_err(Into::into))
            .transpose()
    }

    /// Record `identity` for `address`; true when it replaced a different key.
    pub fn save_identity(&self, address: &DeviceAddress, identity: &IdentityKey) -> Result<bool> {
        let existing = self.load_identity_key(address)?;
        self.put(&format!("{}{}", TRUSTED_PREFIX, address), identity.to_bytes().to_vec())?;
        Ok(existing.is_some_and(|k| k != *identity))
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}
