//! X3DH session agreement followed by a double ratchet.
//!
//! Identity and prekeys are X25519; signed prekeys carry an Ed25519
//! signature by the identity. Chain keys advance with HMAC-SHA256, message
//! keys expand through HKDF into an AES-256-GCM key and IV.

use super::proto::{session_structure, PreKeyWhisperMessage, SessionStructure, WhisperMessage};
use super::{MessageKind, PreKeyBundle, Ratchet, RatchetMessage};
use crate::crypto::{aead_open, aead_seal, IdentityKey, IdentityKeyPair, KeyPair, IV_LEN};
use crate::error::{IdentityError, SessionError};
use crate::store::KeyStore;
use crate::types::DeviceAddress;
use crate::Result;
use async_trait::async_trait;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use prost::Message;
use sha2::Sha256;
use zeroize::Zeroize;

/// Maximum number of message keys kept for out-of-order delivery.
const MAX_SKIP: u32 = 1000;

const X3DH_INFO: &[u8] = b"OMEMO X3DH";
const ROOT_INFO: &[u8] = b"OMEMO Root Chain";
const MESSAGE_KEY_INFO: &[u8] = b"OMEMO Message Key Material";

type HmacSha256 = Hmac<Sha256>;

fn malformed(what: impl Into<String>) -> SessionError {
    SessionError::Malformed(what.into())
}

fn key32(bytes: &[u8], what: &str) -> Result<[u8; 32]> {
    <[u8; 32]>::try_from(bytes)
        .map_err(|_| malformed(format!("{} is {} bytes", what, bytes.len())).into())
}

fn kdf_x3dh(dhs: &[[u8; 32]]) -> Result<[u8; 32]> {
    let mut ikm = Vec::with_capacity(32 * (dhs.len() + 1));
    ikm.extend_from_slice(&[0xffu8; 32]);
    for dh in dhs {
        ikm.extend_from_slice(dh);
    }
    let hk = Hkdf::<Sha256>::new(Some(&[0u8; 32]), &ikm);
    let mut okm = [0u8; 32];
    hk.expand(X3DH_INFO, &mut okm)
        .map_err(|e| anyhow::anyhow!("x3dh expand: {e}"))?;
    ikm.zeroize();
    Ok(okm)
}

/// Root KDF: returns (new root key, new chain key).
fn kdf_rk(root_key: &[u8; 32], dh_out: &[u8; 32]) -> Result<([u8; 32], [u8; 32])> {
    let hk = Hkdf::<Sha256>::new(Some(root_key), dh_out);
    let mut okm = [0u8; 64];
    hk.expand(ROOT_INFO, &mut okm)
        .map_err(|e| anyhow::anyhow!("root expand: {e}"))?;
    let mut rk = [0u8; 32];
    let mut ck = [0u8; 32];
    rk.copy_from_slice(&okm[..32]);
    ck.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok((rk, ck))
}

fn hmac(key: &[u8; 32], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| anyhow::anyhow!("chain key: {e}"))?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Chain KDF: returns (next chain key, message key).
fn kdf_ck(chain_key: &[u8; 32]) -> Result<([u8; 32], [u8; 32])> {
    Ok((hmac(chain_key, &[0x02])?, hmac(chain_key, &[0x01])?))
}

fn message_key_material(message_key: &[u8; 32]) -> Result<([u8; 32], [u8; IV_LEN])> {
    let hk = Hkdf::<Sha256>::new(None, message_key);
    let mut okm = [0u8; 32 + IV_LEN];
    hk.expand(MESSAGE_KEY_INFO, &mut okm)
        .map_err(|e| anyhow::anyhow!("message key expand: {e}"))?;
    let mut key = [0u8; 32];
    let mut iv = [0u8; IV_LEN];
    key.copy_from_slice(&okm[..32]);
    iv.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok((key, iv))
}

fn associated_data(
    sender: &IdentityKey,
    receiver: &IdentityKey,
    ratchet_key: &[u8; 32],
    counter: u32,
    previous_counter: u32,
) -> Vec<u8> {
    let mut ad = Vec::with_capacity(64 * 2 + 32 + 8);
    ad.extend_from_slice(&sender.to_bytes());
    ad.extend_from_slice(&receiver.to_bytes());
    ad.extend_from_slice(ratchet_key);
    ad.extend_from_slice(&counter.to_be_bytes());
    ad.extend_from_slice(&previous_counter.to_be_bytes());
    ad
}

fn open(message_key: &[u8; 32], ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let (mut key, iv) = message_key_material(message_key)?;
    let out = aead_open(&key, &iv, ad, ciphertext);
    key.zeroize();
    out
}

struct Chain {
    key: [u8; 32],
    index: u32,
}

struct Skipped {
    ratchet_key: [u8; 32],
    index: u32,
    message_key: [u8; 32],
}

struct PendingPreKey {
    pre_key_id: Option<u32>,
    signed_pre_key_id: u32,
    base_key: [u8; 32],
}

/// Decoded session record. Always mutated on a fresh copy loaded from the
/// store and written back only when the operation succeeded.
struct SessionState {
    local_identity: IdentityKey,
    remote_identity: IdentityKey,
    root_key: [u8; 32],
    previous_counter: u32,
    ratchet: KeyPair,
    remote_ratchet: Option<[u8; 32]>,
    sending: Option<Chain>,
    receiving: Option<Chain>,
    skipped: Vec<Skipped>,
    pending: Option<PendingPreKey>,
    base_key: [u8; 32],
    local_registration_id: u32,
    remote_registration_id: u32,
}

impl SessionState {
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<WhisperMessage> {
        let chain = self
            .sending
            .as_mut()
            .ok_or_else(|| malformed("session has no sending chain"))?;
        let (next, message_key) = kdf_ck(&chain.key)?;
        let counter = chain.index;
        chain.key = next;
        chain.index += 1;

        let ad = associated_data(
            &self.local_identity,
            &self.remote_identity,
            &self.ratchet.public,
            counter,
            self.previous_counter,
        );
        let (mut key, iv) = message_key_material(&message_key)?;
        let ciphertext = aead_seal(&key, &iv, &ad, plaintext);
        key.zeroize();
        Ok(WhisperMessage {
            ratchet_key: self.ratchet.public.to_vec(),
            counter,
            previous_counter: self.previous_counter,
            ciphertext: ciphertext?,
        })
    }

    fn decrypt(&mut self, msg: &WhisperMessage) -> Result<Vec<u8>> {
        let their = key32(&msg.ratchet_key, "ratchet key")?;
        let ad = associated_data(
            &self.remote_identity,
            &self.local_identity,
            &their,
            msg.counter,
            msg.previous_counter,
        );

        if let Some(pos) = self
            .skipped
            .iter()
            .position(|s| s.ratchet_key == their && s.index == msg.counter)
        {
            let skipped = self.skipped.remove(pos);
            return open(&skipped.message_key, &ad, &msg.ciphertext);
        }

        if self.remote_ratchet != Some(their) {
            self.skip_to(msg.previous_counter)?;
            self.dh_ratchet(their)?;
        }
        self.skip_to(msg.counter)?;

        let chain = self
            .receiving
            .as_mut()
            .ok_or_else(|| malformed("session has no receiving chain"))?;
        if msg.counter < chain.index {
            return Err(SessionError::Decryption(format!(
                "message {} already received",
                msg.counter
            ))
            .into());
        }
        let (next, message_key) = kdf_ck(&chain.key)?;
        chain.key = next;
        chain.index += 1;
        open(&message_key, &ad, &msg.ciphertext)
    }

    /// Store message keys of the current receiving chain up to `until`.
    fn skip_to(&mut self, until: u32) -> Result<()> {
        let (Some(remote), Some(chain)) = (self.remote_ratchet, self.receiving.as_mut()) else {
            return Ok(());
        };
        if until > chain.index.saturating_add(MAX_SKIP) {
            return Err(SessionError::Decryption(format!(
                "{} skipped messages exceed the limit",
                until - chain.index
            ))
            .into());
        }
        while chain.index < until {
            let (next, message_key) = kdf_ck(&chain.key)?;
            self.skipped.push(Skipped {
                ratchet_key: remote,
                index: chain.index,
                message_key,
            });
            chain.key = next;
            chain.index += 1;
        }
        let excess = self.skipped.len().saturating_sub(MAX_SKIP as usize);
        self.skipped.drain(..excess);
        Ok(())
    }

    fn dh_ratchet(&mut self, their: [u8; 32]) -> Result<()> {
        self.previous_counter = self.sending.as_ref().map_or(0, |c| c.index);
        self.remote_ratchet = Some(their);
        let (root_key, receiving) = kdf_rk(&self.root_key, &self.ratchet.agree(&their))?;
        self.receiving = Some(Chain {
            key: receiving,
            index: 0,
        });
        self.ratchet = KeyPair::generate()?;
        let (root_key, sending) = kdf_rk(&root_key, &self.ratchet.agree(&their))?;
        self.root_key = root_key;
        self.sending = Some(Chain {
            key: sending,
            index: 0,
        });
        Ok(())
    }

    fn encode(&self) -> Vec<u8> {
        let chain = |c: &Chain| session_structure::Chain {
            key: c.key.to_vec(),
            index: c.index,
        };
        SessionStructure {
            local_identity: self.local_identity.to_bytes().to_vec(),
            remote_identity: self.remote_identity.to_bytes().to_vec(),
            root_key: self.root_key.to_vec(),
            previous_counter: self.previous_counter,
            ratchet_private: self.ratchet.private_bytes().to_vec(),
            remote_ratchet_key: self.remote_ratchet.map(|k| k.to_vec()),
            sender_chain: self.sending.as_ref().map(chain),
            receiver_chain: self.receiving.as_ref().map(chain),
            skipped_keys: self
                .skipped
                .iter()
                .map(|s| session_structure::SkippedKey {
                    ratchet_key: s.ratchet_key.to_vec(),
                    index: s.index,
                    message_key: s.message_key.to_vec(),
                })
                .collect(),
            pending_pre_key: self
                .pending
                .as_ref()
                .map(|p| session_structure::PendingPreKey {
                    pre_key_id: p.pre_key_id,
                    signed_pre_key_id: p.signed_pre_key_id,
                    base_key: p.base_key.to_vec(),
                }),
            alice_base_key: self.base_key.to_vec(),
            local_registration_id: self.local_registration_id,
            remote_registration_id: self.remote_registration_id,
        }
        .encode_to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let s = SessionStructure::decode(bytes)
            .map_err(|e| malformed(format!("session record: {e}")))?;
        let identity = |b: &[u8], what: &str| {
            IdentityKey::from_bytes(b).ok_or_else(|| malformed(format!("{what} identity key")))
        };
        let chain = |c: Option<session_structure::Chain>| -> Result<Option<Chain>> {
            c.map(|c| {
                Ok(Chain {
                    key: key32(&c.key, "chain key")?,
                    index: c.index,
                })
            })
            .transpose()
        };
        Ok(Self {
            local_identity: identity(&s.local_identity, "local")?,
            remote_identity: identity(&s.remote_identity, "remote")?,
            root_key: key32(&s.root_key, "root key")?,
            previous_counter: s.previous_counter,
            ratchet: KeyPair::from_private(key32(&s.ratchet_private, "ratchet key")?),
            remote_ratchet: s
                .remote_ratchet_key
                .as_deref()
                .map(|k| key32(k, "remote ratchet key"))
                .transpose()?,
            sending: chain(s.sender_chain)?,
            receiving: chain(s.receiver_chain)?,
            skipped: s
                .skipped_keys
                .iter()
                .map(|k| {
                    Ok(Skipped {
                        ratchet_key: key32(&k.ratchet_key, "skipped ratchet key")?,
                        index: k.index,
                        message_key: key32(&k.message_key, "skipped message key")?,
                    })
                })
                .collect::<Result<_>>()?,
            pending: s
                .pending_pre_key
                .map(|p| -> Result<PendingPreKey> {
                    Ok(PendingPreKey {
                        pre_key_id: p.pre_key_id,
                        signed_pre_key_id: p.signed_pre_key_id,
                        base_key: key32(&p.base_key, "base key")?,
                    })
                })
                .transpose()?,
            base_key: key32(&s.alice_base_key, "base key")?,
            local_registration_id: s.local_registration_id,
            remote_registration_id: s.remote_registration_id,
        })
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        for c in self.sending.iter_mut().chain(self.receiving.iter_mut()) {
            c.key.zeroize();
        }
        for s in &mut self.skipped {
            s.message_key.zeroize();
        }
    }
}

fn local_identity(store: &KeyStore) -> Result<IdentityKeyPair> {
    store
        .get_identity_key_pair()?
        .ok_or_else(|| IdentityError::Missing.into())
}

fn load_state(store: &KeyStore, address: &DeviceAddress) -> Result<Option<SessionState>> {
    store
        .load_session(address)?
        .map(|b| SessionState::decode(&b))
        .transpose()
}

/// Built-in [`Ratchet`] implementation.
#[derive(Clone, Copy, Debug, Default)]
pub struct SignalRatchet;

impl SignalRatchet {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Ratchet for SignalRatchet {
    async fn process_pre_key(
        &self,
        store: &KeyStore,
        address: &DeviceAddress,
        bundle: &PreKeyBundle,
    ) -> Result<()> {
        let identity = bundle.identity_key;
        let spk = bundle.signed_pre_key.key;
        if !identity.verify_signature(&spk, &bundle.signed_pre_key.signature) {
            return Err(SessionError::InvalidSignature.into());
        }
        if store.load_identity_key(address)?.is_some_and(|known| known != identity) {
            return Err(SessionError::TrustViolation(address.clone()).into());
        }
        let ours = local_identity(store)?;

        let base = KeyPair::generate()?;
        let mut dhs = vec![
            ours.dh.agree(&spk),
            base.agree(&identity.dh),
            base.agree(&spk),
        ];
        if let Some(pk) = &bundle.pre_key {
            dhs.push(base.agree(&pk.key));
        }
        let shared = kdf_x3dh(&dhs);
        dhs.zeroize();
        let mut shared = shared?;

        let ratchet = KeyPair::generate()?;
        let (root_key, sending) = kdf_rk(&shared, &ratchet.agree(&spk))?;
        shared.zeroize();

        let state = SessionState {
            local_identity: ours.public(),
            remote_identity: identity,
            root_key,
            previous_counter: 0,
            ratchet,
            remote_ratchet: Some(spk),
            sending: Some(Chain {
                key: sending,
                index: 0,
            }),
            receiving: None,
            skipped: Vec::new(),
            pending: Some(PendingPreKey {
                pre_key_id: bundle.pre_key.as_ref().map(|p| p.id),
                signed_pre_key_id: bundle.signed_pre_key.id,
                base_key: base.public,
            }),
            base_key: base.public,
            local_registration_id: store.get_local_registration_id()?.unwrap_or(0),
            remote_registration_id: 0,
        };
        store.store_session(address, state.encode())?;
        store.save_identity(address, &identity)?;
        tracing::debug!(%address, pre_key_id = ?bundle.pre_key.as_ref().map(|p| p.id), "session opened from bundle");
        Ok(())
    }

    async fn encrypt(
        &self,
        store: &KeyStore,
        address: &DeviceAddress,
        plaintext: &[u8],
    ) -> Result<RatchetMessage> {
        let mut state =
            load_state(store, address)?.ok_or_else(|| SessionError::NoSession(address.clone()))?;
        let whisper = state.encrypt(plaintext)?;
        let message = match &state.pending {
            Some(p) => RatchetMessage {
                kind: MessageKind::PreKey,
                body: PreKeyWhisperMessage {
                    registration_id: state.local_registration_id,
                    pre_key_id: p.pre_key_id,
                    signed_pre_key_id: p.signed_pre_key_id,
                    base_key: p.base_key.to_vec(),
                    identity_key: state.local_identity.to_bytes().to_vec(),
                    message: whisper.encode_to_vec(),
                }
                .encode_to_vec(),
            },
            None => RatchetMessage {
                kind: MessageKind::Whisper,
                body: whisper.encode_to_vec(),
            },
        };
        store.store_session(address, state.encode())?;
        Ok(message)
    }

    async fn decrypt_pre_key_message(
        &self,
        store: &KeyStore,
        address: &DeviceAddress,
        body: &[u8],
    ) -> Result<Vec<u8>> {
        let msg = PreKeyWhisperMessage::decode(body)
            .map_err(|e| malformed(format!("prekey message: {e}")))?;
        let remote_identity = IdentityKey::from_bytes(&msg.identity_key)
            .ok_or_else(|| malformed("prekey message identity key"))?;
        let base_key = key32(&msg.base_key, "base key")?;
        let inner = WhisperMessage::decode(msg.message.as_slice())
            .map_err(|e| malformed(format!("inner message: {e}")))?;

        if store
            .load_identity_key(address)?
            .is_some_and(|known| known != remote_identity)
        {
            return Err(SessionError::TrustViolation(address.clone()).into());
        }

        if let Some(mut state) = load_state(store, address)? {
            // Repeated prekey messages of the session we already accepted.
            if state.base_key != base_key || state.remote_identity != remote_identity {
                return Err(SessionError::Conflict(address.clone()).into());
            }
            let plaintext = state.decrypt(&inner)?;
            store.store_session(address, state.encode())?;
            return Ok(plaintext);
        }
        let ours = local_identity(store)?;
        let spk = store
            .load_signed_pre_key(msg.signed_pre_key_id)?
            .ok_or(SessionError::UnknownSignedPreKey(msg.signed_pre_key_id))?;
        let pre_key = match msg.pre_key_id {
            Some(id) => Some(
                store
                    .load_pre_key(id)?
                    .ok_or(SessionError::UnknownPreKey(id))?,
            ),
            None => None,
        };

        let mut dhs = vec![
            spk.key_pair.agree(&remote_identity.dh),
            ours.dh.agree(&base_key),
            spk.key_pair.agree(&base_key),
        ];
        if let Some(pk) = &pre_key {
            dhs.push(pk.key_pair.agree(&base_key));
        }
        let shared = kdf_x3dh(&dhs);
        dhs.zeroize();

        let mut state = SessionState {
            local_identity: ours.public(),
            remote_identity,
            root_key: shared?,
            previous_counter: 0,
            ratchet: spk.key_pair.clone(),
            remote_ratchet: None,
            sending: None,
            receiving: None,
            skipped: Vec::new(),
            pending: None,
            base_key,
            local_registration_id: store.get_local_registration_id()?.unwrap_or(0),
            remote_registration_id: msg.registration_id,
        };
        let plaintext = state.decrypt(&inner)?;

        if let Some(pk) = pre_key {
            store.remove_pre_key(pk.id)?;
        }
        store.save_identity(address, &remote_identity)?;
        store.store_session(address, state.encode())?;
        tracing::debug!(%address, pre_key_id = ?msg.pre_key_id, "session opened from prekey message");
        Ok(plaintext)
    }

    async fn decrypt_message(
        &self,
        store: &KeyStore,
        address: &DeviceAddress,
        body: &[u8],
    ) -> Result<Vec<u8>> {
        let mut state =
            load_state(store, address)?.ok_or_else(|| SessionError::NoSession(address.clone()))?;
        let msg = WhisperMessage::decode(body).map_err(|e| malformed(format!("message: {e}")))?;
        let plaintext = state.decrypt(&msg)?;
        state.pending = None;
        store.store_session(address, state.encode())?;
        Ok(plaintext)
    }
}
