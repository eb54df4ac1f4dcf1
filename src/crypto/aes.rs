//! AES-GCM helpers.
//!
//! The message payload is sealed once with a fresh AES-128-GCM key. The
//! 16-byte tag is split off the ciphertext and travels with the key, so
//! every recipient device receives `key || tag` through its ratchet session.

use crate::error::{EnvelopeError, SessionError};
use crate::Result;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use rand::RngCore;

const PAYLOAD_KEY_LEN: usize = 16;
const TAG_LEN: usize = 16;

/// IV length for payload and ratchet message encryption.
pub const IV_LEN: usize = 12;

/// Length of the key material wrapped for each device (`key || tag`).
pub const KEY_DATA_LEN: usize = PAYLOAD_KEY_LEN + TAG_LEN;

/// Output of [`encrypt_payload`].
#[derive(Clone, Debug)]
pub struct SealedPayload {
    /// `key || tag`, to be wrapped per recipient device.
    pub key_data: Vec<u8>,
    pub iv: [u8; IV_LEN],
    /// Ciphertext without the tag.
    pub payload: Vec<u8>,
}

/// Encrypt a message body once under a fresh content key.
pub fn encrypt_payload(plaintext: &[u8]) -> Result<SealedPayload> {
    let mut key = [0u8; PAYLOAD_KEY_LEN];
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    rand::thread_rng().fill_bytes(&mut iv);

    let cipher = Aes128Gcm::new_from_slice(&key)
        .map_err(|e| anyhow::anyhow!("payload key: {e}"))?;
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| anyhow::anyhow!("payload encryption failed"))?;
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    let mut key_data = Vec::with_capacity(KEY_DATA_LEN);
    key_data.extend_from_slice(&key);
    key_data.extend_from_slice(&tag);
    Ok(SealedPayload {
        key_data,
        iv,
        payload: sealed,
    })
}

/// Open a payload with the unwrapped `key || tag`.
pub fn decrypt_payload(key_data: &[u8], iv: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    if key_data.len() < PAYLOAD_KEY_LEN {
        return Err(EnvelopeError::Malformed(format!(
            "wrapped key is {} bytes",
            key_data.len()
        ))
        .into());
    }
    let (key, tag) = key_data.split_at(PAYLOAD_KEY_LEN);
    if tag.len() < TAG_LEN {
        return Err(EnvelopeError::TruncatedCiphertext(tag.len()).into());
    }
    if iv.len() != IV_LEN {
        return Err(EnvelopeError::Malformed(format!("iv is {} bytes", iv.len())).into());
    }

    let mut sealed = Vec::with_capacity(payload.len() + TAG_LEN);
    sealed.extend_from_slice(payload);
    sealed.extend_from_slice(&tag[..TAG_LEN]);

    let cipher = Aes128Gcm::new_from_slice(key)
        .map_err(|e| anyhow::anyhow!("payload key: {e}"))?;
    cipher
        .decrypt(Nonce::from_slice(iv), sealed.as_slice())
        .map_err(|_| EnvelopeError::Authentication.into())
}

/// AES-256-GCM seal used for ratchet messages.
pub fn aead_seal(key: &[u8; 32], iv: &[u8; IV_LEN], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow::anyhow!("message key: {e}"))?;
    cipher
        .encrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| anyhow::anyhow!("message encryption failed").into())
}

/// Inverse of [`aead_seal`]. Authentication failure is a decryption error.
pub fn aead_open(key: &[u8; 32], iv: &[u8; IV_LEN], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow::anyhow!("message key: {e}"))?;
    cipher
        .decrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| SessionError::Decryption("message authentication failed".into()).into())
}
