use crate::types::DeviceAddress;
use thiserror::Error;

/// Library result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the OMEMO core.
#[derive(Error, Debug)]
pub enum Error {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("identity: {0}")]
    Identity(#[from] IdentityError),

    #[error("session: {0}")]
    Session(#[from] SessionError),

    #[error("envelope: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("stanza: {0}")]
    Stanza(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Failures that only concern one remote device. A fan-out drops that
    /// device and keeps going.
    pub fn is_device_scoped(&self) -> bool {
        match self {
            Self::Session(SessionError::TrustViolation(_)) => false,
            Self::Session(_) | Self::Transport(_) => true,
            _ => false,
        }
    }

    /// Trust violations have to reach the user layer.
    pub fn is_trust_violation(&self) -> bool {
        matches!(self, Self::Session(SessionError::TrustViolation(_)))
    }
}

/// Key store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid key or value: {0}")]
    InvalidKey(String),

    #[error("save failed: {0}")]
    Save(String),

    #[error("load failed: {0}")]
    Load(String),

    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Local identity errors. These halt the encryption subsystem for the account.
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("identity generation failed: {0}")]
    Generation(String),

    #[error("no local identity key pair")]
    Missing,

    #[error("local identity already exists")]
    Exists,
}

/// Per-device session errors.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("bundle unavailable for {address}: {reason}")]
    BundleUnavailable {
        address: DeviceAddress,
        reason: String,
    },

    #[error("no session for {0}")]
    NoSession(DeviceAddress),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("session already established for {0}")]
    AlreadyEstablished(DeviceAddress),

    #[error("identity key changed for {0}")]
    TrustViolation(DeviceAddress),

    #[error("invalid signed prekey signature")]
    InvalidSignature,

    #[error("unknown prekey id {0}")]
    UnknownPreKey(u32),

    #[error("unknown signed prekey id {0}")]
    UnknownSignedPreKey(u32),

    #[error("prekey message from {0} conflicts with the established session")]
    Conflict(DeviceAddress),

    #[error("malformed ratchet message: {0}")]
    Malformed(String),
}

/// Inbound/outbound envelope errors.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("no key for device {0}")]
    NotForThisDevice(u32),

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("authentication tag too short ({0} bytes)")]
    TruncatedCiphertext(usize),

    #[error("payload authentication failed")]
    Authentication,

    #[error("no recipient device could be encrypted for")]
    NoRecipients,
}

/// Transport collaborator errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("timeout")]
    Timeout,

    #[error("unavailable: {0}")]
    Unavailable(String),
}
