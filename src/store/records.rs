//! Persisted forms of local key material.

use crate::crypto::{IdentityKey, IdentityKeyPair, KeyPair};
use crate::error::StoreError;
use prost::Message;

#[derive(Clone, PartialEq, ::prost::Message)]
pub(crate) struct IdentityKeyPairStructure {
    #[prost(bytes = "vec", tag = "1")]
    pub dh_private: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub signing_private: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub(crate) struct KeyPairStructure {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub public_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub private_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}

/// One-time prekey held locally.
#[derive(Clone, Debug)]
pub struct PreKeyRecord {
    pub id: u32,
    pub key_pair: KeyPair,
}

/// Signed prekey held locally; the signature is over `key_pair.public`.
#[derive(Clone, Debug)]
pub struct SignedPreKeyRecord {
    pub id: u32,
    pub key_pair: KeyPair,
    pub signature: Vec<u8>,
}

fn corrupt(key: &str, reason: impl ToString) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn to_key32(key: &str, bytes: &[u8]) -> Result<[u8; 32], StoreError> {
    <[u8; 32]>::try_from(bytes).map_err(|_| corrupt(key, format!("expected 32 bytes, got {}", bytes.len())))
}

pub(crate) fn encode_identity(pair: &IdentityKeyPair) -> Vec<u8> {
    IdentityKeyPairStructure {
        dh_private: pair.dh.private_bytes().to_vec(),
        signing_private: pair.signing_bytes().to_vec(),
    }
    .encode_to_vec()
}

pub(crate) fn decode_identity(key: &str, bytes: &[u8]) -> Result<IdentityKeyPair, StoreError> {
    let s = IdentityKeyPairStructure::decode(bytes).map_err(|e| corrupt(key, e))?;
    Ok(IdentityKeyPair::from_parts(
        to_key32(key, &s.dh_private)?,
        to_key32(key, &s.signing_private)?,
    ))
}

pub(crate) fn encode_key_pair(id: u32, pair: &KeyPair, signature: &[u8]) -> Vec<u8> {
    KeyPairStructure {
        id,
        public_key: pair.public.to_vec(),
        private_key: pair.private_bytes().to_vec(),
        signature: signature.to_vec(),
    }
    .encode_to_vec()
}

pub(crate) fn decode_key_pair(key: &str, bytes: &[u8]) -> Result<SignedPreKeyRecord, StoreError> {
    let s = KeyPairStructure::decode(bytes).map_err(|e| corrupt(key, e))?;
    let key_pair = KeyPair::from_private(to_key32(key, &s.private_key)?);
    if key_pair.public.as_slice() != s.public_key.as_slice() {
        return Err(corrupt(key, "public key does not match private key"));
    }
    Ok(SignedPreKeyRecord {
        id: s.id,
        key_pair,
        signature: s.signature,
    })
}

pub(crate) fn decode_identity_key(key: &str, bytes: &[u8]) -> Result<IdentityKey, StoreError> {
    IdentityKey::from_bytes(bytes).ok_or_else(|| corrupt(key, "bad identity key length"))
}

pub(crate) fn decode_u32(key: &str, bytes: &[u8]) -> Result<u32, StoreError> {
    <[u8; 4]>::try_from(bytes)
        .map(u32::from_be_bytes)
        .map_err(|_| corrupt(key, "expected 4 bytes"))
}
