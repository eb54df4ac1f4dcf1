//! One remote (or own) device endpoint and the registry that hands out a
//! single instance per address.

use crate::error::SessionError;
use crate::ratchet::{PreKeyBundle, Ratchet};
use crate::store::KeyStore;
use crate::transport::SharedTransport;
use crate::types::{DeviceAddress, DeviceId, Jid};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    NoSession,
    AwaitingBundle,
    Established,
}

/// Key material wrapped for one device by [`DeviceSession::encrypt`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedKey {
    pub device_id: DeviceId,
    pub is_prekey: bool,
    pub ciphertext: Vec<u8>,
}

/// Collaborators every device session of one account shares.
#[derive(Clone)]
pub struct SessionContext {
    pub store: Arc<KeyStore>,
    pub ratchet: Arc<dyn Ratchet>,
    pub transport: SharedTransport,
    pub bundle_fetch_timeout: Duration,
}

/// Ratchet session with one device.
///
/// Every operation that can advance the ratchet holds the session lock for
/// its whole duration, so there is at most one in flight per address.
pub struct DeviceSession {
    address: DeviceAddress,
    ctx: SessionContext,
    state: Mutex<SessionState>,
}

impl DeviceSession {
    fn new(address: DeviceAddress, ctx: SessionContext) -> Self {
        Self {
            address,
            ctx,
            state: Mutex::new(SessionState::NoSession),
        }
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn device_id(&self) -> DeviceId {
        self.address.device_id
    }

    /// True iff the key store holds a session record for this address.
    pub fn has_session(&self) -> Result<bool> {
        self.ctx.store.has_session(&self.address)
    }

    pub async fn state(&self) -> Result<SessionState> {
        let mut state = self.state.lock().await;
        self.sync(&mut state)?;
        Ok(*state)
    }

    /// The store is the source of truth; sessions can be restored from
    /// persistence or removed in bulk behind our back.
    fn sync(&self, state: &mut SessionState) -> Result<()> {
        *state = if self.has_session()? {
            SessionState::Established
        } else {
            SessionState::NoSession
        };
        Ok(())
    }

    fn unavailable(&self, reason: impl Into<String>) -> SessionError {
        SessionError::BundleUnavailable {
            address: self.address.clone(),
            reason: reason.into(),
        }
    }

    /// Fetch the device's bundle and pick one of its one-time prekeys.
    pub async fn fetch_bundle(&self) -> Result<PreKeyBundle> {
        let fetch = self
            .ctx
            .transport
            .fetch_bundle(&self.address.jid, self.address.device_id);
        let remote = match tokio::time::timeout(self.ctx.bundle_fetch_timeout, fetch).await {
            Ok(Ok(remote)) => remote,
            Ok(Err(e)) => return Err(self.unavailable(e.to_string()).into()),
            Err(_) => return Err(self.unavailable("bundle fetch timed out").into()),
        };
        if remote.signed_pre_key.signature.is_empty() {
            return Err(self.unavailable("no usable signed prekey").into());
        }
        remote
            .choose(self.address.device_id)
            .ok_or_else(|| self.unavailable("no one-time prekeys").into())
    }

    /// Open the session from `bundle`. An established session is never
    /// replaced; call [`remove_session`](Self::remove_session) first.
    pub async fn establish_session(&self, bundle: &PreKeyBundle) -> Result<()> {
        let mut state = self.state.lock().await;
        self.establish_locked(&mut state, bundle).await
    }

    async fn establish_locked(&self, state: &mut SessionState, bundle: &PreKeyBundle) -> Result<()> {
        if self.has_session()? {
            *state = SessionState::Established;
            return Err(SessionError::AlreadyEstablished(self.address.clone()).into());
        }
        self.ctx
            .ratchet
            .process_pre_key(&self.ctx.store, &self.address, bundle)
            .await?;
        *state = SessionState::Established;
        tracing::debug!(address = %self.address, "session established");
        Ok(())
    }

    /// Encrypt `plaintext` for this device, fetching a bundle and opening the
    /// session first when there is none.
    ///
    /// Advances the ratchet; a failed call must not be retried blindly.
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedKey> {
        let mut state = self.state.lock().await;
        self.sync(&mut state)?;
        if *state != SessionState::Established {
            *state = SessionState::AwaitingBundle;
            let result = match self.fetch_bundle().await {
                Ok(bundle) => self.establish_locked(&mut state, &bundle).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                *state = SessionState::NoSession;
                return Err(e);
            }
        }
        let message = self
            .ctx
            .ratchet
            .encrypt(&self.ctx.store, &self.address, plaintext)
            .await?;
        Ok(EncryptedKey {
            device_id: self.address.device_id,
            is_prekey: message.kind.is_prekey(),
            ciphertext: message.body,
        })
    }

    /// Decrypt a wrapped key from this device.
    pub async fn decrypt(&self, ciphertext: &[u8], is_prekey: bool) -> Result<Vec<u8>> {
        let mut state = self.state.lock().await;
        self.sync(&mut state)?;
        let ratchet = &self.ctx.ratchet;
        let plaintext = if is_prekey {
            ratchet
                .decrypt_pre_key_message(&self.ctx.store, &self.address, ciphertext)
                .await?
        } else {
            if *state != SessionState::Established {
                return Err(SessionError::NoSession(self.address.clone()).into());
            }
            ratchet
                .decrypt_message(&self.ctx.store, &self.address, ciphertext)
                .await?
        };
        *state = SessionState::Established;
        Ok(plaintext)
    }

    /// Drop the session. The next encrypt performs a fresh handshake.
    pub async fn remove_session(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ctx.store.remove_session(&self.address)?;
        *state = SessionState::NoSession;
        tracing::info!(address = %self.address, "session removed");
        Ok(())
    }
}

/// Hands out exactly one [`DeviceSession`] per address, so every caller
/// shares its lock.
pub struct SessionRegistry {
    ctx: SessionContext,
    sessions: RwLock<HashMap<DeviceAddress, Arc<DeviceSession>>>,
}

impl SessionRegistry {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            ctx,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, address: &DeviceAddress) -> Option<Arc<DeviceSession>> {
        self.sessions.read().await.get(address).cloned()
    }

    pub async fn get_or_create(&self, address: DeviceAddress) -> Arc<DeviceSession> {
        if let Some(session) = self.get(&address).await {
            return session;
        }
        let mut sessions = self.sessions.write().await;
        Arc::clone(
            sessions
                .entry(address.clone())
                .or_insert_with(|| Arc::new(DeviceSession::new(address, self.ctx.clone()))),
        )
    }

    /// Every known session of the devices of `jid`.
    pub async fn sessions_of(&self, jid: &Jid) -> Vec<Arc<DeviceSession>> {
        let jid = jid.to_bare();
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.address().jid == jid)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
