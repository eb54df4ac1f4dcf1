//! Key material: X25519 key pairs, the Ed25519-signing identity, signed
//! prekey signatures and fingerprints.

mod aes;

pub use aes::{
    aead_open, aead_seal, decrypt_payload, encrypt_payload, SealedPayload, IV_LEN, KEY_DATA_LEN,
};

use crate::error::IdentityError;
use crate::Result;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Serialized length of a public [`IdentityKey`].
pub const IDENTITY_KEY_LEN: usize = 64;

/// Signature length of a signed prekey.
pub const SIGNATURE_LEN: usize = 64;

/// Upper bound of registration ids (14 bits).
const MAX_REGISTRATION_ID: u32 = 16380;

fn random_bytes() -> Result<[u8; 32]> {
    let mut out = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut out)
        .map_err(|e| IdentityError::Generation(e.to_string()))?;
    Ok(out)
}

/// X25519 key pair used for prekeys, signed prekeys and ratchet keys.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    #[zeroize(skip)]
    pub public: [u8; 32],
    private: [u8; 32],
}

impl KeyPair {
    pub fn generate() -> Result<Self> {
        Ok(Self::from_private(random_bytes()?))
    }

    pub fn from_private(private: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret).to_bytes();
        Self { public, private }
    }

    pub fn private_bytes(&self) -> &[u8; 32] {
        &self.private
    }

    pub fn agree(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let secret = StaticSecret::from(self.private);
        secret
            .diffie_hellman(&PublicKey::from(*their_public))
            .to_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

/// Public identity of one device: X25519 agreement key and Ed25519 verify key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub dh: [u8; 32],
    pub verify: [u8; 32],
}

impl IdentityKey {
    pub fn to_bytes(&self) -> [u8; IDENTITY_KEY_LEN] {
        let mut out = [0u8; IDENTITY_KEY_LEN];
        out[..32].copy_from_slice(&self.dh);
        out[32..].copy_from_slice(&self.verify);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != IDENTITY_KEY_LEN {
            return None;
        }
        let mut dh = [0u8; 32];
        let mut verify = [0u8; 32];
        dh.copy_from_slice(&bytes[..32]);
        verify.copy_from_slice(&bytes[32..]);
        Some(Self { dh, verify })
    }

    /// Check an Ed25519 signature made by the matching [`IdentityKeyPair`].
    pub fn verify_signature(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.verify) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; SIGNATURE_LEN]>::try_from(signature) else {
            return false;
        };
        key.verify(message, &Signature::from_bytes(&sig_bytes))
            .is_ok()
    }

    /// Hex SHA-256 of the serialized key, for out-of-band comparison.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.to_bytes()))
    }
}

/// Long-term identity of the local device.
#[derive(Clone)]
pub struct IdentityKeyPair {
    pub dh: KeyPair,
    signing: [u8; 32],
}

impl IdentityKeyPair {
    pub fn generate() -> Result<Self> {
        Ok(Self {
            dh: KeyPair::generate()?,
            signing: random_bytes()?,
        })
    }

    pub fn from_parts(dh_private: [u8; 32], signing: [u8; 32]) -> Self {
        Self {
            dh: KeyPair::from_private(dh_private),
            signing,
        }
    }

    pub fn signing_bytes(&self) -> &[u8; 32] {
        &self.signing
    }

    pub fn public(&self) -> IdentityKey {
        IdentityKey {
            dh: self.dh.public,
            verify: SigningKey::from_bytes(&self.signing)
                .verifying_key()
                .to_bytes(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        SigningKey::from_bytes(&self.signing)
            .sign(message)
            .to_bytes()
    }
}

impl Drop for IdentityKeyPair {
    fn drop(&mut self) {
        self.signing.zeroize();
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public())
            .finish_non_exhaustive()
    }
}

/// Random registration id in `[1, 16380]`.
pub fn generate_registration_id() -> u32 {
    rand::thread_rng().gen_range(1..=MAX_REGISTRATION_ID)
}
