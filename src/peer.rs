//! Multi-device fan-out for one contact.

use crate::crypto::{decrypt_payload, encrypt_payload};
use crate::device::{DeviceSession, SessionRegistry};
use crate::error::EnvelopeError;
use crate::stanza::{Envelope, WrappedKey};
use crate::transport::SharedTransport;
use crate::types::{DeviceAddress, DeviceId, Jid};
use crate::Result;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// A device left out of an outgoing envelope.
#[derive(Clone, Debug)]
pub struct SkippedDevice {
    pub address: DeviceAddress,
    pub reason: String,
    pub trust_violation: bool,
}

/// Result of [`PeerSessionGroup::encrypt_message`].
#[derive(Clone, Debug)]
pub struct EncryptedMessage {
    pub envelope: Envelope,
    pub skipped: Vec<SkippedDevice>,
}

/// Result of [`PeerSessionGroup::decrypt_message`].
#[derive(Clone, Debug)]
pub struct DecryptedMessage {
    pub sender: DeviceAddress,
    pub plaintext: Vec<u8>,
    pub pre_key: bool,
}

type DeviceMap = BTreeMap<DeviceId, Arc<DeviceSession>>;

/// Every device of one contact plus the local account's other devices.
pub struct PeerSessionGroup {
    jid: Jid,
    local: DeviceAddress,
    registry: Arc<SessionRegistry>,
    transport: SharedTransport,
    discovery_timeout: Duration,
    devices: RwLock<DeviceMap>,
    own_devices: RwLock<DeviceMap>,
    /// Set once a published device list of the contact was fetched or
    /// received. Senders learned from envelopes do not count.
    list_known: AtomicBool,
}

impl PeerSessionGroup {
    pub fn new(
        jid: Jid,
        local: DeviceAddress,
        registry: Arc<SessionRegistry>,
        transport: SharedTransport,
        discovery_timeout: Duration,
    ) -> Self {
        Self {
            jid: jid.to_bare(),
            local,
            registry,
            transport,
            discovery_timeout,
            devices: RwLock::new(BTreeMap::new()),
            own_devices: RwLock::new(BTreeMap::new()),
            list_known: AtomicBool::new(false),
        }
    }

    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    fn is_own_account(&self) -> bool {
        self.jid == self.local.jid
    }

    async fn merge(&self, map: &RwLock<DeviceMap>, jid: &Jid, ids: &[DeviceId]) -> usize {
        let mut added = 0;
        for &id in ids {
            if *jid == self.local.jid && id == self.local.device_id {
                continue;
            }
            if map.read().await.contains_key(&id) {
                continue;
            }
            let session = self
                .registry
                .get_or_create(DeviceAddress::new(jid.clone(), id))
                .await;
            if map.write().await.insert(id, session).is_none() {
                added += 1;
            }
        }
        added
    }

    /// Merge the contact's published device list; known devices keep their
    /// session.
    pub async fn update_devices(&self, ids: &[DeviceId]) -> usize {
        self.list_known.store(true, Ordering::Release);
        let added = self.merge(&self.devices, &self.jid, ids).await;
        if added > 0 {
            tracing::debug!(jid = %self.jid, added, "contact devices updated");
        }
        added
    }

    /// Merge the local account's device ids (the local device is ignored).
    pub async fn update_own_devices(&self, ids: &[DeviceId]) -> usize {
        let jid = self.local.jid.clone();
        self.merge(&self.own_devices, &jid, ids).await
    }

    pub async fn device_ids(&self) -> Vec<DeviceId> {
        self.devices.read().await.keys().copied().collect()
    }

    pub async fn own_device_ids(&self) -> Vec<DeviceId> {
        self.own_devices.read().await.keys().copied().collect()
    }

    /// Whether a device list of the contact has been seen.
    pub fn device_list_known(&self) -> bool {
        self.list_known.load(Ordering::Acquire)
    }

    async fn discover(&self) {
        let request = self.transport.request_device_list(&self.jid);
        match tokio::time::timeout(self.discovery_timeout, request).await {
            Ok(Ok(ids)) => {
                self.update_devices(&ids).await;
            }
            Ok(Err(e)) => tracing::warn!(jid = %self.jid, error = %e, "device discovery failed"),
            Err(_) => tracing::warn!(jid = %self.jid, "device discovery timed out"),
        }
    }

    /// Encrypt `plaintext` once and wrap its key for every contact device and
    /// every other own device. Devices that fail are skipped individually.
    pub async fn encrypt_message(&self, plaintext: &[u8]) -> Result<EncryptedMessage> {
        if !self.device_list_known() && !self.is_own_account() {
            self.discover().await;
        }

        let sealed = encrypt_payload(plaintext)?;

        let mut targets: BTreeMap<DeviceAddress, Arc<DeviceSession>> = BTreeMap::new();
        for map in [&self.devices, &self.own_devices] {
            for session in map.read().await.values() {
                targets.insert(session.address().clone(), Arc::clone(session));
            }
        }

        let results = join_all(targets.into_values().map(|session| {
            let key_data = &sealed.key_data;
            async move {
                let result = session.encrypt(key_data).await;
                (session, result)
            }
        }))
        .await;

        let mut keys = Vec::with_capacity(results.len());
        let mut skipped = Vec::new();
        for (session, result) in results {
            match result {
                Ok(wrapped) => keys.push(WrappedKey {
                    device_id: wrapped.device_id,
                    is_prekey: wrapped.is_prekey,
                    data: wrapped.ciphertext,
                }),
                Err(e) if e.is_device_scoped() || e.is_trust_violation() => {
                    tracing::warn!(address = %session.address(), error = %e, "device skipped");
                    skipped.push(SkippedDevice {
                        address: session.address().clone(),
                        reason: e.to_string(),
                        trust_violation: e.is_trust_violation(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        if keys.is_empty() {
            return Err(EnvelopeError::NoRecipients.into());
        }
        Ok(EncryptedMessage {
            envelope: Envelope {
                sid: self.local.device_id,
                keys,
                iv: sealed.iv.to_vec(),
                payload: sealed.payload,
            },
            skipped,
        })
    }

    /// Decrypt an envelope sent by a device of this group's account.
    pub async fn decrypt_message(&self, envelope: &Envelope, local_device_id: DeviceId) -> Result<DecryptedMessage> {
        let mut matching = envelope.keys_for(local_device_id);
        let key = match (matching.next(), matching.next()) {
            (Some(key), None) => key,
            (None, _) => return Err(EnvelopeError::NotForThisDevice(local_device_id).into()),
            (Some(_), Some(_)) => {
                return Err(EnvelopeError::Malformed(format!(
                    "several keys for device {}",
                    local_device_id
                ))
                .into())
            }
        };

        let sender = DeviceAddress::new(self.jid.clone(), envelope.sid);
        if sender == self.local {
            return Err(EnvelopeError::Malformed("envelope claims to be from this device".into()).into());
        }
        let session = self.registry.get_or_create(sender.clone()).await;
        let key_data = session.decrypt(&key.data, key.is_prekey).await?;
        let plaintext = decrypt_payload(&key_data, &envelope.iv, &envelope.payload)?;

        // answer the sender on later messages even if its list never reached us
        if self.is_own_account() {
            self.update_own_devices(&[envelope.sid]).await;
        } else {
            self.merge(&self.devices, &self.jid, &[envelope.sid]).await;
        }

        Ok(DecryptedMessage {
            sender,
            plaintext,
            pre_key: key.is_prekey,
        })
    }

    /// Every session currently in the group (contact devices first).
    pub async fn sessions(&self) -> Vec<Arc<DeviceSession>> {
        let mut out: Vec<_> = self.devices.read().await.values().cloned().collect();
        out.extend(self.own_devices.read().await.values().cloned());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::account;
    use crate::transport::{MemoryDirectory, Transport};
    use crate::Error;

    fn jid(local: &str) -> Jid {
        Jid::new(local, "example.org")
    }

    async fn group_for(
        dir: &Arc<MemoryDirectory>,
        registry: SessionRegistry,
        peer: &str,
        timeout: Duration,
    ) -> PeerSessionGroup {
        PeerSessionGroup::new(
            jid(peer),
            DeviceAddress::new(jid("alice"), 7),
            Arc::new(registry),
            Arc::new(dir.connect(jid("alice"))),
            timeout,
        )
    }

    #[tokio::test]
    async fn fan_out_skips_failing_device() {
        let dir = MemoryDirectory::new();
        let alice = account(&dir, "alice", 7).await;
        let bob11 = account(&dir, "bob", 11).await;
        account(&dir, "bob", 12).await;
        dir.set_unavailable(&jid("bob"), 12).await;

        let group = group_for(&dir, alice.registry, "bob", Duration::from_secs(1)).await;
        assert_eq!(group.update_devices(&[11, 12]).await, 2);

        let out = group.encrypt_message(b"hi").await.unwrap();
        assert_eq!(out.envelope.sid, 7);
        assert_eq!(out.envelope.recipients(), vec![11]);
        assert_eq!(out.skipped.len(), 1);
        assert_eq!(out.skipped[0].address.device_id, 12);
        assert!(!out.skipped[0].trust_violation);

        // bob's device 11 reads it
        let bob_group = PeerSessionGroup::new(
            jid("alice"),
            DeviceAddress::new(jid("bob"), 11),
            Arc::new(bob11.registry),
            Arc::new(dir.connect(jid("bob"))),
            Duration::from_secs(1),
        );
        let msg = bob_group.decrypt_message(&out.envelope, 11).await.unwrap();
        assert_eq!(msg.plaintext, b"hi");
        assert!(msg.pre_key);
        assert_eq!(msg.sender, DeviceAddress::new(jid("alice"), 7));
        assert_eq!(bob_group.device_ids().await, vec![7]);
    }

    #[tokio::test]
    async fn reply_reaches_every_published_device() {
        let dir = MemoryDirectory::new();
        let alice = account(&dir, "alice", 7).await;
        account(&dir, "alice", 8).await;
        let bob = account(&dir, "bob", 11).await;
        dir.connect(jid("alice")).publish_device_list(&[7, 8]).await.unwrap();

        let group = group_for(&dir, alice.registry, "bob", Duration::from_secs(1)).await;
        group.update_devices(&[11]).await;
        let envelope = group.encrypt_message(b"hello").await.unwrap().envelope;

        let bob_group = PeerSessionGroup::new(
            jid("alice"),
            DeviceAddress::new(jid("bob"), 11),
            Arc::new(bob.registry),
            Arc::new(dir.connect(jid("bob"))),
            Duration::from_secs(1),
        );
        bob_group.decrypt_message(&envelope, 11).await.unwrap();
        assert_eq!(bob_group.device_ids().await, vec![7]);
        assert!(!bob_group.device_list_known());

        // the sender alone is not alice's device list; the reply discovers it
        let reply = bob_group.encrypt_message(b"hey").await.unwrap();
        let mut recipients = reply.envelope.recipients();
        recipients.sort();
        assert_eq!(recipients, vec![7, 8]);
        assert!(bob_group.device_list_known());
    }

    #[tokio::test]
    async fn includes_own_other_devices_but_not_self() {
        let dir = MemoryDirectory::new();
        let alice = account(&dir, "alice", 7).await;
        account(&dir, "alice", 8).await;
        account(&dir, "bob", 11).await;

        let group = group_for(&dir, alice.registry, "bob", Duration::from_secs(1)).await;
        group.update_devices(&[11]).await;
        assert_eq!(group.update_own_devices(&[7, 8]).await, 1);
        assert_eq!(group.own_device_ids().await, vec![8]);

        let out = group.encrypt_message(b"hi").await.unwrap();
        let mut recipients = out.envelope.recipients();
        recipients.sort();
        assert_eq!(recipients, vec![8, 11]);
    }

    #[tokio::test]
    async fn update_devices_keeps_existing_sessions() {
        let dir = MemoryDirectory::new();
        let alice = account(&dir, "alice", 7).await;
        account(&dir, "bob", 11).await;
        let group = group_for(&dir, alice.registry, "bob", Duration::from_secs(1)).await;
        group.update_devices(&[11]).await;
        let first = group.encrypt_message(b"one").await.unwrap();
        assert!(first.envelope.keys[0].is_prekey);

        assert_eq!(group.update_devices(&[11, 11]).await, 0);
        let sessions = group.sessions().await;
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].has_session().unwrap());
    }

    #[tokio::test]
    async fn unknown_contact_triggers_discovery() {
        let dir = MemoryDirectory::new();
        let alice = account(&dir, "alice", 7).await;
        account(&dir, "bob", 11).await;
        dir.connect(jid("bob")).publish_device_list(&[11]).await.unwrap();

        let group = group_for(&dir, alice.registry, "bob", Duration::from_secs(1)).await;
        let out = group.encrypt_message(b"hi").await.unwrap();
        assert_eq!(out.envelope.recipients(), vec![11]);
    }

    #[tokio::test]
    async fn discovery_timeout_does_not_block() {
        let dir = MemoryDirectory::new();
        let alice = account(&dir, "alice", 7).await;
        dir.set_device_list_delay(Duration::from_secs(5)).await;

        let group = group_for(&dir, alice.registry, "bob", Duration::from_millis(20)).await;
        let started = std::time::Instant::now();
        let err = group.encrypt_message(b"hi").await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(err, Error::Envelope(EnvelopeError::NoRecipients)));
    }

    #[tokio::test]
    async fn decrypt_rejects_zero_or_duplicate_matches() {
        let dir = MemoryDirectory::new();
        let alice = account(&dir, "alice", 7).await;
        let bob = account(&dir, "bob", 11).await;
        let group = group_for(&dir, alice.registry, "bob", Duration::from_secs(1)).await;
        group.update_devices(&[11]).await;
        let mut envelope = group.encrypt_message(b"hi").await.unwrap().envelope;

        let bob_group = PeerSessionGroup::new(
            jid("alice"),
            DeviceAddress::new(jid("bob"), 11),
            Arc::new(bob.registry),
            Arc::new(dir.connect(jid("bob"))),
            Duration::from_secs(1),
        );
        assert!(matches!(
            bob_group.decrypt_message(&envelope, 99).await,
            Err(Error::Envelope(EnvelopeError::NotForThisDevice(99)))
        ));

        let dup = envelope.keys[0].clone();
        envelope.keys.push(dup);
        assert!(matches!(
            bob_group.decrypt_message(&envelope, 11).await,
            Err(Error::Envelope(EnvelopeError::Malformed(_)))
        ));
        // nothing was processed
        assert!(!bob.store.has_session(&DeviceAddress::new(jid("alice"), 7)).unwrap());
    }

    #[tokio::test]
    async fn short_key_material_is_truncated_ciphertext() {
        let dir = MemoryDirectory::new();
        let alice = account(&dir, "alice", 7).await;
        let bob = account(&dir, "bob", 11).await;

        // wrap only 20 bytes: 16 key bytes and a 4 byte tag
        let to_bob = alice
            .registry
            .get_or_create(DeviceAddress::new(jid("bob"), 11))
            .await;
        let wrapped = to_bob.encrypt(&[1u8; 20]).await.unwrap();
        let envelope = Envelope {
            sid: 7,
            keys: vec![WrappedKey {
                device_id: 11,
                is_prekey: wrapped.is_prekey,
                data: wrapped.ciphertext,
            }],
            iv: vec![0; 12],
            payload: vec![0; 8],
        };
        let bob_group = PeerSessionGroup::new(
            jid("alice"),
            DeviceAddress::new(jid("bob"), 11),
            Arc::new(bob.registry),
            Arc::new(dir.connect(jid("bob"))),
            Duration::from_secs(1),
        );
        assert!(matches!(
            bob_group.decrypt_message(&envelope, 11).await,
            Err(Error::Envelope(EnvelopeError::TruncatedCiphertext(4)))
        ));
    }

    #[tokio::test]
    async fn changed_identity_is_reported_not_fatal() {
        let dir = MemoryDirectory::new();
        let alice = account(&dir, "alice", 7).await;
        account(&dir, "bob", 11).await;
        account(&dir, "bob", 12).await;
        let group = group_for(&dir, alice.registry, "bob", Duration::from_secs(1)).await;
        group.update_devices(&[11, 12]).await;
        group.encrypt_message(b"first").await.unwrap();

        // device 12 reinstalls with a new identity
        for session in group.sessions().await {
            if session.device_id() == 12 {
                session.remove_session().await.unwrap();
            }
        }
        account(&dir, "bob", 12).await;

        let out = group.encrypt_message(b"second").await.unwrap();
        assert_eq!(out.envelope.recipients(), vec![11]);
        assert!(out.skipped[0].trust_violation);
    }
}
