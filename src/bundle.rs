//! Local publishable key material and the remote bundle form.

use crate::config::OmemoConfig;
use crate::crypto::{generate_registration_id, IdentityKey, IdentityKeyPair, KeyPair};
use crate::error::IdentityError;
use crate::ratchet::{PreKeyBundle, PreKeyPublic, SignedPreKeyPublic};
use crate::store::{KeyStore, PreKeyRecord, SignedPreKeyRecord};
use crate::types::DeviceId;
use crate::Result;
use rand::seq::SliceRandom;
use std::sync::Arc;

/// A device's published bundle: identity, signed prekey and the advertised
/// one-time prekeys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteBundle {
    pub signed_pre_key: SignedPreKeyPublic,
    pub identity_key: IdentityKey,
    pub pre_keys: Vec<PreKeyPublic>,
}

impl RemoteBundle {
    /// Pick one advertised one-time prekey uniformly at random. `None` when
    /// the bundle advertises none.
    pub fn choose(&self, device_id: DeviceId) -> Option<PreKeyBundle> {
        let pre_key = self.pre_keys.choose(&mut rand::thread_rng())?;
        Some(PreKeyBundle {
            device_id,
            identity_key: self.identity_key,
            signed_pre_key: self.signed_pre_key.clone(),
            pre_key: Some(pre_key.clone()),
        })
    }
}

/// Keys produced by [`IdentityBundle::generate_pre_keys`].
#[derive(Debug)]
pub struct GeneratedKeys {
    pub pre_keys: Vec<PreKeyRecord>,
    pub signed_pre_key: SignedPreKeyRecord,
}

/// Owner of the local identity and prekey pool.
pub struct IdentityBundle {
    store: Arc<KeyStore>,
    prekey_count: u32,
    min_prekeys: u32,
    signed_prekey_id: u32,
}

impl IdentityBundle {
    pub fn new(store: Arc<KeyStore>, config: &OmemoConfig) -> Self {
        Self {
            store,
            prekey_count: config.prekey_count,
            min_prekeys: config.min_prekeys,
            signed_prekey_id: config.signed_prekey_id,
        }
    }

    /// Generate and store the identity key pair and registration id.
    ///
    /// Refuses to run when an identity exists: replacing it invalidates every
    /// peer's trust record for this device.
    pub fn generate_identity(&self) -> Result<IdentityKey> {
        if self.store.get_identity_key_pair()?.is_some() {
            return Err(IdentityError::Exists.into());
        }
        let identity = IdentityKeyPair::generate()?;
        let registration_id = generate_registration_id();
        self.store.store_identity_key_pair(&identity)?;
        self.store.store_local_registration_id(registration_id)?;
        tracing::info!(registration_id, fingerprint = %identity.public().fingerprint(), "generated identity");
        Ok(identity.public())
    }

    /// Generate `count` one-time prekeys with fresh sequential ids and one
    /// signed prekey, storing all of them.
    pub fn generate_pre_keys(&self, count: u32) -> Result<GeneratedKeys> {
        let identity = self
            .store
            .get_identity_key_pair()?
            .ok_or(IdentityError::Missing)?;

        let pair = KeyPair::generate()?;
        let signature = identity.sign(&pair.public).to_vec();
        self.store
            .store_signed_pre_key(self.signed_prekey_id, &pair, &signature)?;
        let signed_pre_key = SignedPreKeyRecord {
            id: self.signed_prekey_id,
            key_pair: pair,
            signature,
        };

        let pre_keys = self.generate_one_time(count)?;
        Ok(GeneratedKeys {
            pre_keys,
            signed_pre_key,
        })
    }

    fn generate_one_time(&self, count: u32) -> Result<Vec<PreKeyRecord>> {
        let first = self.store.next_prekey_id()?.max(1);
        let end = first
            .checked_add(count)
            .ok_or_else(|| IdentityError::Generation("prekey ids exhausted".into()))?;
        let mut pre_keys = Vec::with_capacity(count as usize);
        for id in first..end {
            let key_pair = KeyPair::generate()?;
            self.store.store_pre_key(id, &key_pair)?;
            pre_keys.push(PreKeyRecord { id, key_pair });
        }
        self.store.store_next_prekey_id(end)?;
        Ok(pre_keys)
    }

    /// Make sure identity and prekeys exist. Returns true when anything was
    /// generated.
    pub fn load_or_generate(&self) -> Result<bool> {
        let mut generated = false;
        if self.store.get_identity_key_pair()?.is_none() {
            self.generate_identity()?;
            generated = true;
        }
        if self
            .store
            .load_signed_pre_key(self.signed_prekey_id)?
            .is_none()
        {
            self.generate_pre_keys(self.prekey_count)?;
            generated = true;
        }
        Ok(generated)
    }

    /// Top the one-time pool back up to the configured size once it fell
    /// below the threshold. Returns how many were generated.
    pub fn replenish(&self) -> Result<usize> {
        let held = self.store.pre_key_ids()?.len() as u32;
        if held >= self.min_prekeys {
            return Ok(0);
        }
        let fresh = self.generate_one_time(self.prekey_count.saturating_sub(held))?;
        tracing::debug!(held, generated = fresh.len(), "replenished prekeys");
        Ok(fresh.len())
    }

    pub fn identity_key(&self) -> Result<IdentityKey> {
        Ok(self
            .store
            .get_identity_key_pair()?
            .ok_or(IdentityError::Missing)?
            .public())
    }

    /// Public form of the current key material, for publication.
    pub fn public_bundle(&self) -> Result<RemoteBundle> {
        let identity_key = self.identity_key()?;
        let spk = self
            .store
            .load_signed_pre_key(self.signed_prekey_id)?
            .ok_or(IdentityError::Missing)?;
        let mut pre_keys = Vec::new();
        for id in self.store.pre_key_ids()? {
            if let Some(pk) = self.store.load_pre_key(id)? {
                pre_keys.push(PreKeyPublic {
                    id,
                    key: pk.key_pair.public,
                });
            }
        }
        Ok(RemoteBundle {
            signed_pre_key: SignedPreKeyPublic {
                id: spk.id,
                key: spk.key_pair.public,
                signature: spk.signature,
            },
            identity_key,
            pre_keys,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn bundle(count: u32) -> (Arc<KeyStore>, IdentityBundle) {
        let store = Arc::new(KeyStore::new());
        let config = OmemoConfig::default().with_prekey_count(count);
        (store.clone(), IdentityBundle::new(store, &config))
    }

    #[test]
    fn generates_identity_once() {
        let (store, b) = bundle(3);
        let ik = b.generate_identity().unwrap();
        assert_eq!(b.identity_key().unwrap(), ik);
        let reg = store.get_local_registration_id().unwrap().unwrap();
        assert!((1..=16380).contains(&reg));
        assert!(matches!(
            b.generate_identity(),
            Err(Error::Identity(IdentityError::Exists))
        ));
    }

    #[test]
    fn prekeys_need_identity() {
        let (_, b) = bundle(3);
        assert!(matches!(
            b.generate_pre_keys(3),
            Err(Error::Identity(IdentityError::Missing))
        ));
    }

    #[test]
    fn generated_prekeys_are_stored_and_signed() {
        let (store, b) = bundle(3);
        let ik = b.generate_identity().unwrap();
        let keys = b.generate_pre_keys(3).unwrap();
        let ids: Vec<u32> = keys.pre_keys.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(store.pre_key_ids().unwrap(), ids);
        assert!(ik.verify_signature(
            &keys.signed_pre_key.key_pair.public,
            &keys.signed_pre_key.signature
        ));

        // the next batch never reuses ids
        let more = b.generate_pre_keys(2).unwrap();
        let ids: Vec<u32> = more.pre_keys.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![4, 5]);
    }

    #[test]
    fn replenish_tops_up_with_new_ids() {
        let (store, b) = bundle(3);
        assert!(b.load_or_generate().unwrap());
        assert!(!b.load_or_generate().unwrap());
        assert_eq!(b.replenish().unwrap(), 0);

        store.remove_pre_key(2).unwrap();
        assert_eq!(b.replenish().unwrap(), 1);
        assert_eq!(store.pre_key_ids().unwrap(), vec![1, 3, 4]);
    }

    #[test]
    fn public_bundle_and_choice() {
        let (_, b) = bundle(4);
        b.load_or_generate().unwrap();
        let public = b.public_bundle().unwrap();
        assert_eq!(public.pre_keys.len(), 4);
        assert_eq!(public.identity_key, b.identity_key().unwrap());

        let chosen = public.choose(9).unwrap();
        assert_eq!(chosen.device_id, 9);
        assert!(public.pre_keys.contains(chosen.pre_key.as_ref().unwrap()));

        let empty = RemoteBundle {
            pre_keys: Vec::new(),
            ..public
        };
        assert!(empty.choose(9).is_none());
    }
}
