//! Ratchet primitive: session agreement from a prekey bundle and per-message
//! encryption for one remote device.
//!
//! The coordinator only relies on the [`Ratchet`] contract. [`SignalRatchet`]
//! is the built-in implementation; any other implementation operating on the
//! same [`KeyStore`] can be swapped in.

mod proto;
mod signal;

pub use signal::SignalRatchet;

use crate::crypto::IdentityKey;
use crate::store::KeyStore;
use crate::types::{DeviceAddress, DeviceId};
use crate::Result;
use async_trait::async_trait;

/// Wire type of prekey messages.
pub const PREKEY_MESSAGE_TYPE: u8 = 3;

/// Wire type of ordinary ratchet messages.
pub const WHISPER_MESSAGE_TYPE: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// Carries the key agreement; sent until the peer has replied once.
    PreKey,
    Whisper,
}

impl MessageKind {
    pub fn is_prekey(self) -> bool {
        self == Self::PreKey
    }

    pub fn wire_type(self) -> u8 {
        match self {
            Self::PreKey => PREKEY_MESSAGE_TYPE,
            Self::Whisper => WHISPER_MESSAGE_TYPE,
        }
    }
}

/// Output of [`Ratchet::encrypt`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RatchetMessage {
    pub kind: MessageKind,
    pub body: Vec<u8>,
}

/// Public half of a one-time prekey.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreKeyPublic {
    pub id: u32,
    pub key: [u8; 32],
}

/// Public half of a signed prekey with the identity's signature over `key`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedPreKeyPublic {
    pub id: u32,
    pub key: [u8; 32],
    pub signature: Vec<u8>,
}

/// Everything needed to open a session with one device: its identity, its
/// signed prekey and the one-time prekey the initiator picked.
#[derive(Clone, Debug)]
pub struct PreKeyBundle {
    pub device_id: DeviceId,
    pub identity_key: IdentityKey,
    pub signed_pre_key: SignedPreKeyPublic,
    pub pre_key: Option<PreKeyPublic>,
}

/// Session agreement and message encryption for one address.
///
/// Implementations persist their session state in the [`KeyStore`]. Callers
/// serialize calls per address.
#[async_trait]
pub trait Ratchet: Send + Sync {
    /// Start a session as initiator from a remote bundle.
    async fn process_pre_key(
        &self,
        store: &KeyStore,
        address: &DeviceAddress,
        bundle: &PreKeyBundle,
    ) -> Result<()>;

    /// Encrypt with the established session, advancing the sending chain.
    async fn encrypt(
        &self,
        store: &KeyStore,
        address: &DeviceAddress,
        plaintext: &[u8],
    ) -> Result<RatchetMessage>;

    /// Decrypt a prekey message, creating the responder session if needed.
    async fn decrypt_pre_key_message(
        &self,
        store: &KeyStore,
        address: &DeviceAddress,
        body: &[u8],
    ) -> Result<Vec<u8>>;

    /// Decrypt an ordinary message with the existing session.
    async fn decrypt_message(
        &self,
        store: &KeyStore,
        address: &DeviceAddress,
        body: &[u8],
    ) -> Result<Vec<u8>>;
}
