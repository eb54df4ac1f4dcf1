//! Per-account coordinator.

mod send;

use crate::bundle::IdentityBundle;
use crate::config::OmemoConfig;
use crate::device::{SessionContext, SessionRegistry};
use crate::error::{Error, TransportError};
use crate::events::{Event, MessageEvent};
use crate::peer::{DecryptedMessage, EncryptedMessage, PeerSessionGroup};
use crate::ratchet::{Ratchet, SignalRatchet};
use crate::stanza::{parse_device_list, Envelope, Node};
use crate::store::{KeyStore, SharedPersistence};
use crate::transport::SharedTransport;
use crate::types::{DeviceAddress, DeviceId, Jid, MAX_DEVICE_ID};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;

pub use send::{generate_message_id, SendRequestExtra, SendResponse};

/// Type alias for event handlers so the coordinator field is not overly complex and is Send + Sync.
type EventHandler = Box<dyn Fn(Event) + Send + Sync>;

/// Random device id in `[1, 2^31 - 1]`.
pub fn generate_device_id() -> DeviceId {
    rand::thread_rng().gen_range(1..=MAX_DEVICE_ID)
}

/// Descend through message and pubsub wrappers to the OMEMO element.
fn omemo_element(node: &Node) -> Option<&Node> {
    match node.tag.as_str() {
        "list" | "encrypted" => Some(node),
        "message" | "event" | "items" | "item" => node.get_children().iter().find_map(omemo_element),
        _ => None,
    }
}

/// OMEMO controller for one local account device.
///
/// Owns the key store, the identity bundle and one [`PeerSessionGroup`] per
/// contact. Inbound stanzas go to [`handle_node`](Self::handle_node);
/// results and failures that concern the user are delivered as [`Event`]s.
pub struct OmemoCoordinator {
    local: DeviceAddress,
    config: OmemoConfig,
    store: Arc<KeyStore>,
    bundle: IdentityBundle,
    registry: Arc<SessionRegistry>,
    transport: SharedTransport,
    peers: RwLock<HashMap<Jid, Arc<PeerSessionGroup>>>,
    own_devices: RwLock<Vec<DeviceId>>,
    handlers: Arc<RwLock<Vec<EventHandler>>>,
}

impl OmemoCoordinator {
    /// Open the coordinator with the built-in ratchet.
    pub async fn open(
        jid: Jid,
        store: Arc<KeyStore>,
        transport: SharedTransport,
        config: OmemoConfig,
    ) -> crate::Result<Self> {
        Self::with_ratchet(jid, store, transport, Arc::new(SignalRatchet::new()), config).await
    }

    /// Restore the key store from `persistence` under the configured
    /// namespace, then open.
    pub async fn restore(
        jid: Jid,
        persistence: SharedPersistence,
        transport: SharedTransport,
        config: OmemoConfig,
    ) -> crate::Result<Self> {
        let store = Arc::new(KeyStore::open(config.namespace.clone(), persistence).await?);
        Self::open(jid, store, transport, config).await
    }

    /// Open the coordinator: reuse the stored device id and identity or
    /// generate and persist them.
    pub async fn with_ratchet(
        jid: Jid,
        store: Arc<KeyStore>,
        transport: SharedTransport,
        ratchet: Arc<dyn Ratchet>,
        config: OmemoConfig,
    ) -> crate::Result<Self> {
        let jid = jid.to_bare();
        let device_id = match store.get_device_id()? {
            Some(id) => id,
            None => {
                let id = generate_device_id();
                store.store_device_id(id)?;
                store.flush().await?;
                tracing::info!(jid = %jid, device_id = id, "generated device id");
                id
            }
        };

        let bundle = IdentityBundle::new(Arc::clone(&store), &config);
        if bundle.load_or_generate()? {
            tracing::info!(jid = %jid, device_id, "generated key material");
        }
        store.flush().await?;

        let registry = Arc::new(SessionRegistry::new(SessionContext {
            store: Arc::clone(&store),
            ratchet,
            transport: Arc::clone(&transport),
            bundle_fetch_timeout: config.bundle_fetch_timeout,
        }));

        Ok(Self {
            local: DeviceAddress::new(jid, device_id),
            config,
            store,
            bundle,
            registry,
            transport,
            peers: RwLock::new(HashMap::new()),
            own_devices: RwLock::new(Vec::new()),
            handlers: Arc::new(RwLock::new(Vec::new())),
        })
    }

    pub fn jid(&self) -> &Jid {
        &self.local.jid
    }

    pub fn device_id(&self) -> DeviceId {
        self.local.device_id
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.local
    }

    pub fn store(&self) -> &Arc<KeyStore> {
        &self.store
    }

    /// Fingerprint of the local identity key.
    pub fn fingerprint(&self) -> crate::Result<String> {
        Ok(self.bundle.identity_key()?.fingerprint())
    }

    /// Add an event handler (called for every event).
    pub async fn add_event_handler<F>(&self, f: F)
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.handlers.write().await.push(Box::new(f));
    }

    async fn dispatch_event(&self, evt: Event) {
        let handlers = self.handlers.read().await;
        for f in handlers.iter() {
            f(evt.clone());
        }
    }

    /// Write pending key store mutations to persistence.
    pub async fn flush(&self) -> crate::Result<()> {
        self.store.flush().await
    }

    /// Session group of `jid`, created on first use.
    pub async fn peer(&self, jid: &Jid) -> Arc<PeerSessionGroup> {
        let jid = jid.to_bare();
        if let Some(group) = self.peers.read().await.get(&jid) {
            return Arc::clone(group);
        }
        let mut peers = self.peers.write().await;
        if let Some(group) = peers.get(&jid) {
            return Arc::clone(group);
        }
        // read under the peers lock: apply_own_devices updates every group
        // it can see after replacing the list
        let own = self.own_devices.read().await.clone();
        let group = Arc::new(PeerSessionGroup::new(
            jid.clone(),
            self.local.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.transport),
            self.config.discovery_timeout,
        ));
        group.update_own_devices(&own).await;
        peers.insert(jid, Arc::clone(&group));
        group
    }

    /// Publish the bundle of the local device.
    pub async fn publish_bundle(&self) -> crate::Result<()> {
        let bundle = self.bundle.public_bundle()?;
        self.transport
            .publish_bundle(self.local.device_id, &bundle)
            .await?;
        tracing::info!(device_id = self.local.device_id, pre_keys = bundle.pre_keys.len(), "bundle published");
        self.dispatch_event(Event::BundlePublished {
            device_id: self.local.device_id,
            pre_keys: bundle.pre_keys.len(),
        })
        .await;
        Ok(())
    }

    /// Make the local device visible: add it to the own device list when it
    /// is missing, then publish the bundle.
    pub async fn announce(&self) -> crate::Result<()> {
        let request = self.transport.request_device_list(&self.local.jid);
        let ids = tokio::time::timeout(self.config.discovery_timeout, request)
            .await
            .map_err(|_| TransportError::Timeout)??;
        self.apply_own_devices(ids).await?;
        self.publish_bundle().await
    }

    /// Record the own device list; republish it when the local device is
    /// missing. Returns true when it was republished.
    async fn apply_own_devices(&self, mut ids: Vec<DeviceId>) -> crate::Result<bool> {
        let missing = !ids.contains(&self.local.device_id);
        if missing {
            ids.push(self.local.device_id);
            self.transport.publish_device_list(&ids).await?;
        }
        *self.own_devices.write().await = ids.clone();

        let groups: Vec<_> = self.peers.read().await.values().cloned().collect();
        for group in groups {
            group.update_own_devices(&ids).await;
        }

        if missing {
            tracing::info!(device_id = self.local.device_id, "device published");
            self.dispatch_event(Event::DevicePublished {
                device_id: self.local.device_id,
            })
            .await;
        }
        Ok(missing)
    }

    /// Encrypt for every device of `to` and every other own device.
    pub async fn encrypt_message(&self, to: &Jid, plaintext: &[u8]) -> crate::Result<EncryptedMessage> {
        let group = self.peer(to).await;
        let result = group.encrypt_message(plaintext).await;
        self.store.flush().await?;
        let out = result?;
        for skipped in &out.skipped {
            let evt = if skipped.trust_violation {
                Event::TrustViolation {
                    address: skipped.address.clone(),
                }
            } else {
                Event::DeviceSkipped {
                    address: skipped.address.clone(),
                    reason: skipped.reason.clone(),
                }
            };
            self.dispatch_event(evt).await;
        }
        Ok(out)
    }

    /// Encrypt and hand the envelope to the transport.
    pub async fn send_message(
        &self,
        to: &Jid,
        plaintext: &[u8],
        extra: Option<SendRequestExtra>,
    ) -> crate::Result<SendResponse> {
        let out = self.encrypt_message(to, plaintext).await?;
        self.transport
            .send_envelope(&to.to_bare(), &out.envelope)
            .await?;
        let id = extra
            .and_then(|e| e.id)
            .unwrap_or_else(generate_message_id);
        tracing::debug!(to = %to, id = %id, recipients = out.envelope.keys.len(), "message sent");
        Ok(SendResponse {
            timestamp: SystemTime::now(),
            id,
            recipients: out.envelope.recipients(),
            skipped: out.skipped,
            sender: self.local.clone(),
        })
    }

    /// Decrypt an envelope from `from`. Failures are also reported as events.
    pub async fn decrypt_envelope(&self, from: &Jid, envelope: &Envelope) -> crate::Result<DecryptedMessage> {
        let from = from.to_bare();
        let group = self.peer(&from).await;
        let result = group.decrypt_message(envelope, self.local.device_id).await;
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                self.report_decrypt_failure(&from, envelope.sid, &e).await;
                return Err(e);
            }
        };

        if msg.pre_key {
            self.replenish().await;
        }
        if let Err(e) = self.store.flush().await {
            tracing::warn!(error = %e, "key store flush failed");
        }
        self.dispatch_event(Event::Message(MessageEvent {
            from: msg.sender.clone(),
            plaintext: msg.plaintext.clone(),
            pre_key: msg.pre_key,
        }))
        .await;
        Ok(msg)
    }

    async fn report_decrypt_failure(&self, from: &Jid, sid: DeviceId, e: &Error) {
        if e.is_trust_violation() {
            let address = DeviceAddress::new(from.clone(), sid);
            tracing::warn!(address = %address, "identity key changed");
            self.dispatch_event(Event::TrustViolation { address }).await;
        } else {
            tracing::warn!(from = %from, sid, error = %e, "envelope dropped");
            self.dispatch_event(Event::DecryptionFailed {
                from: from.clone(),
                sid,
                reason: e.to_string(),
            })
            .await;
        }
    }

    /// A consumed one-time prekey is gone; top the pool up and republish.
    async fn replenish(&self) {
        match self.bundle.replenish() {
            Ok(0) => {}
            Ok(_) => {
                if let Err(e) = self.publish_bundle().await {
                    tracing::warn!(error = %e, "bundle republish failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "prekey replenishment failed"),
        }
    }

    /// Route one inbound stanza. Parse failures are logged and the stanza is
    /// dropped; nothing here fails the coordinator.
    pub async fn handle_node(&self, from: &Jid, node: &Node) {
        let from = from.to_bare();
        let Some(element) = omemo_element(node) else {
            tracing::debug!(from = %from, tag = %node.tag, "ignoring stanza");
            return;
        };
        match element.tag.as_str() {
            "list" => match parse_device_list(element) {
                Ok(ids) if from == self.local.jid => match self.apply_own_devices(ids).await {
                    Ok(true) => {
                        if let Err(e) = self.publish_bundle().await {
                            tracing::warn!(error = %e, "bundle republish failed");
                        }
                    }
                    Ok(false) => {}
                    Err(e) => tracing::warn!(error = %e, "device list republish failed"),
                },
                Ok(ids) => {
                    self.peer(&from).await.update_devices(&ids).await;
                }
                Err(e) => self.drop_event(&from, &e).await,
            },
            _ => match Envelope::from_node(element) {
                // failures are reported through events
                Ok(envelope) => {
                    let _ = self.decrypt_envelope(&from, &envelope).await;
                }
                Err(e) => self.drop_event(&from, &e).await,
            },
        }
    }

    /// Decode a binary-framed stanza and route it.
    pub async fn handle_raw(&self, from: &Jid, data: &[u8]) {
        match Node::decode(data) {
            Ok(node) => self.handle_node(from, &node).await,
            Err(e) => self.drop_event(&from.to_bare(), &e).await,
        }
    }

    async fn drop_event(&self, from: &Jid, e: &Error) {
        tracing::warn!(from = %from, error = %e, "inbound event dropped");
        self.dispatch_event(Event::EventDropped {
            from: from.clone(),
            reason: e.to_string(),
        })
        .await;
    }

    /// Remove every session with the devices of `jid`. The next message to
    /// them performs a fresh handshake. Returns how many were removed.
    pub async fn remove_sessions(&self, jid: &Jid) -> crate::Result<usize> {
        let jid = jid.to_bare();
        let mut removed = 0;
        for session in self.registry.sessions_of(&jid).await {
            if session.has_session()? {
                session.remove_session().await?;
                removed += 1;
            }
        }
        // sessions restored from persistence that were never used this run
        removed += self.store.remove_all_sessions(&jid)?;
        self.store.flush().await?;
        tracing::info!(jid = %jid, removed, "sessions removed");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EnvelopeError;
    use crate::stanza::device_list_node;
    use crate::store::MemoryPersistence;
    use crate::transport::{MemoryDirectory, Transport};
    use std::sync::Mutex;

    fn jid(local: &str) -> Jid {
        Jid::new(local, "example.org")
    }

    fn config() -> OmemoConfig {
        OmemoConfig::default().with_prekey_count(5)
    }

    async fn device(dir: &Arc<MemoryDirectory>, local: &str, device_id: DeviceId) -> OmemoCoordinator {
        let store = Arc::new(KeyStore::new());
        store.store_device_id(device_id).unwrap();
        let c = OmemoCoordinator::open(jid(local), store, Arc::new(dir.connect(jid(local))), config())
            .await
            .unwrap();
        c.announce().await.unwrap();
        c
    }

    async fn deliver(dir: &Arc<MemoryDirectory>, to: &OmemoCoordinator) {
        for (from, node) in dir.take_inbox(to.jid()).await {
            to.handle_node(&from, &node).await;
        }
    }

    async fn record(c: &OmemoCoordinator) -> Arc<Mutex<Vec<Event>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        c.add_event_handler(move |evt| sink.lock().unwrap().push(evt))
            .await;
        events
    }

    fn messages(events: &Arc<Mutex<Vec<Event>>>) -> Vec<Vec<u8>> {
        events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::Message(m) => Some(m.plaintext.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn device_id_in_range() {
        for _ in 0..1000 {
            let id = generate_device_id();
            assert!((1..=MAX_DEVICE_ID).contains(&id));
        }
    }

    #[tokio::test]
    async fn device_id_and_identity_survive_restart() {
        let dir = MemoryDirectory::new();
        let backend = Arc::new(MemoryPersistence::new());
        let first = OmemoCoordinator::restore(
            jid("alice"),
            backend.clone(),
            Arc::new(dir.connect(jid("alice"))),
            config(),
        )
        .await
        .unwrap();
        assert!((1..=MAX_DEVICE_ID).contains(&first.device_id()));
        assert!(!backend.is_empty());

        let second = OmemoCoordinator::restore(
            jid("alice"),
            backend.clone(),
            Arc::new(dir.connect(jid("alice"))),
            config(),
        )
        .await
        .unwrap();
        assert_eq!(second.device_id(), first.device_id());
        assert_eq!(second.fingerprint().unwrap(), first.fingerprint().unwrap());

        // another namespace is another account
        let other = OmemoCoordinator::restore(
            jid("alice"),
            backend,
            Arc::new(dir.connect(jid("alice"))),
            config().with_namespace("second"),
        )
        .await
        .unwrap();
        assert_ne!(other.fingerprint().unwrap(), first.fingerprint().unwrap());
    }

    #[tokio::test]
    async fn announce_adds_device_once() {
        let dir = MemoryDirectory::new();
        let alice = device(&dir, "alice", 7).await;
        assert_eq!(dir.device_list(&jid("alice")).await, vec![7]);
        let events = record(&alice).await;

        alice.announce().await.unwrap();
        assert_eq!(dir.device_list(&jid("alice")).await, vec![7]);
        let events = events.lock().unwrap();
        assert!(!events.iter().any(|e| matches!(e, Event::DevicePublished { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::BundlePublished { device_id: 7, pre_keys: 5 })));
    }

    #[tokio::test]
    async fn send_skips_device_with_unavailable_bundle() {
        let dir = MemoryDirectory::new();
        let alice = device(&dir, "alice", 7).await;
        let bob11 = device(&dir, "bob", 11).await;
        device(&dir, "bob", 12).await;
        assert_eq!(dir.device_list(&jid("bob")).await, vec![11, 12]);
        dir.set_unavailable(&jid("bob"), 12).await;

        let alice_events = record(&alice).await;
        let sent = alice
            .send_message(&jid("bob"), b"hi", None)
            .await
            .unwrap();
        assert_eq!(sent.recipients, vec![11]);
        assert_eq!(sent.sender.device_id, 7);
        assert_eq!(sent.skipped.len(), 1);
        assert!(alice_events.lock().unwrap().iter().any(|e| matches!(
            e,
            Event::DeviceSkipped { address, .. } if address.device_id == 12
        )));

        let bob_events = record(&bob11).await;
        deliver(&dir, &bob11).await;
        assert_eq!(messages(&bob_events), vec![b"hi".to_vec()]);
    }

    #[tokio::test]
    async fn conversation_and_own_device_copy() {
        let dir = MemoryDirectory::new();
        let alice7 = device(&dir, "alice", 7).await;
        let alice8 = device(&dir, "alice", 8).await;
        let bob = device(&dir, "bob", 11).await;
        // alice7 learns about device 8 the way a pubsub notification would arrive
        alice7
            .handle_node(&jid("alice"), &device_list_node(dir.device_list(&jid("alice")).await))
            .await;

        let sent = alice7.send_message(&jid("bob"), b"hello", None).await.unwrap();
        let mut recipients = sent.recipients.clone();
        recipients.sort();
        assert_eq!(recipients, vec![8, 11]);

        let bob_events = record(&bob).await;
        deliver(&dir, &bob).await;
        assert_eq!(messages(&bob_events), vec![b"hello".to_vec()]);

        let copy_events = record(&alice8).await;
        deliver(&dir, &alice8).await;
        assert_eq!(messages(&copy_events), vec![b"hello".to_vec()]);

        // bob answers; both of alice's devices can read it
        bob.send_message(&jid("alice"), b"hey", None).await.unwrap();
        let reply_events = record(&alice7).await;
        let inbox = dir.take_inbox(&jid("alice")).await;
        for (from, node) in &inbox {
            alice7.handle_node(from, node).await;
            alice8.handle_node(from, node).await;
        }
        assert_eq!(messages(&reply_events), vec![b"hey".to_vec()]);
        assert_eq!(messages(&copy_events), vec![b"hello".to_vec(), b"hey".to_vec()]);

        // after the reply alice no longer sends prekey messages to bob
        let out = alice7.encrypt_message(&jid("bob"), b"again").await.unwrap();
        let to_bob = out.envelope.keys_for(11).next().unwrap();
        assert!(!to_bob.is_prekey);
    }

    #[tokio::test]
    async fn prekey_message_replenishes_and_republishes() {
        let dir = MemoryDirectory::new();
        let alice = device(&dir, "alice", 7).await;
        let bob = device(&dir, "bob", 11).await;

        alice.send_message(&jid("bob"), b"hi", None).await.unwrap();
        deliver(&dir, &bob).await;

        let ids = bob.store().pre_key_ids().unwrap();
        assert_eq!(ids.len(), 5);
        assert_eq!(ids.last(), Some(&6));
        let published = dir
            .connect(jid("carol"))
            .fetch_bundle(&jid("bob"), 11)
            .await
            .unwrap();
        let published_ids: Vec<u32> = published.pre_keys.iter().map(|p| p.id).collect();
        assert_eq!(published_ids, ids);
    }

    #[tokio::test]
    async fn own_list_without_local_device_is_republished() {
        let dir = MemoryDirectory::new();
        let alice = device(&dir, "alice", 7).await;
        let events = record(&alice).await;

        alice
            .handle_node(&jid("alice"), &device_list_node([8]))
            .await;
        assert_eq!(dir.device_list(&jid("alice")).await, vec![8, 7]);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, Event::DevicePublished { device_id: 7 })));
        assert_eq!(alice.peer(&jid("bob")).await.own_device_ids().await, vec![8]);
    }

    #[tokio::test]
    async fn groups_created_during_own_list_update_see_it() {
        let dir = MemoryDirectory::new();
        let alice = device(&dir, "alice", 7).await;
        let list = device_list_node([7, 8]);
        let contacts: Vec<Jid> = (0..20).map(|i| Jid::new(format!("c{}", i), "example.org")).collect();

        let alice_jid = jid("alice");
        let (_, groups) = tokio::join!(
            alice.handle_node(&alice_jid, &list),
            futures::future::join_all(contacts.iter().map(|c| alice.peer(c))),
        );
        for group in groups {
            assert_eq!(group.own_device_ids().await, vec![8]);
        }
    }

    #[tokio::test]
    async fn peer_device_list_updates_group() {
        let dir = MemoryDirectory::new();
        let alice = device(&dir, "alice", 7).await;
        let wrapped = Node::new("message").with_children(vec![Node::new("event").with_children(vec![
            Node::new("items")
                .with_attr("node", crate::stanza::NODE_DEVICES)
                .with_children(vec![Node::new("item").with_children(vec![device_list_node([11, 12])])]),
        ])]);
        alice.handle_node(&jid("bob"), &wrapped).await;
        assert_eq!(alice.peer(&jid("bob")).await.device_ids().await, vec![11, 12]);
    }

    #[tokio::test]
    async fn malformed_input_is_dropped() {
        let dir = MemoryDirectory::new();
        let alice = device(&dir, "alice", 7).await;
        let events = record(&alice).await;

        alice.handle_raw(&jid("bob"), b"\xf8\x09garbage").await;
        alice
            .handle_node(&jid("bob"), &Node::new("encrypted").with_text("nope"))
            .await;
        alice
            .handle_node(&jid("bob"), &Node::new("list").with_children(vec![Node::new("device")]))
            .await;
        alice.handle_node(&jid("bob"), &Node::new("presence")).await;

        let dropped = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, Event::EventDropped { .. }))
            .count();
        assert_eq!(dropped, 3);
    }

    #[tokio::test]
    async fn envelope_for_other_device_is_reported() {
        let dir = MemoryDirectory::new();
        let alice = device(&dir, "alice", 7).await;
        let bob = device(&dir, "bob", 11).await;
        let out = alice.encrypt_message(&jid("bob"), b"hi").await.unwrap();

        let mut envelope = out.envelope;
        envelope.keys.retain(|k| k.device_id != 11);
        envelope.keys.push(crate::stanza::WrappedKey {
            device_id: 99,
            is_prekey: false,
            data: vec![1],
        });
        let events = record(&bob).await;
        let err = bob.decrypt_envelope(&jid("alice"), &envelope).await.unwrap_err();
        assert!(matches!(err, Error::Envelope(EnvelopeError::NotForThisDevice(11))));
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, Event::DecryptionFailed { sid: 7, .. })));
    }

    #[tokio::test]
    async fn changed_sender_identity_is_a_trust_violation() {
        let dir = MemoryDirectory::new();
        let alice = device(&dir, "alice", 7).await;
        device(&dir, "bob", 11).await;
        alice.send_message(&jid("bob"), b"hi", None).await.unwrap();

        // bob's device 11 is reinstalled with fresh keys and writes first
        let bob_again = device(&dir, "bob", 11).await;
        dir.take_inbox(&jid("bob")).await;
        bob_again
            .send_message(&jid("alice"), b"it's me", None)
            .await
            .unwrap();

        let events = record(&alice).await;
        deliver(&dir, &alice).await;
        let events = events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::TrustViolation { address } if address.device_id == 11
        )));
        assert!(!events.iter().any(|e| matches!(e, Event::Message(_))));
    }

    #[tokio::test]
    async fn removed_sessions_handshake_again() {
        let dir = MemoryDirectory::new();
        let alice = device(&dir, "alice", 7).await;
        let bob = device(&dir, "bob", 11).await;

        alice.send_message(&jid("bob"), b"one", None).await.unwrap();
        deliver(&dir, &bob).await;
        bob.send_message(&jid("alice"), b"two", None).await.unwrap();
        deliver(&dir, &alice).await;
        let out = alice.encrypt_message(&jid("bob"), b"three").await.unwrap();
        assert!(!out.envelope.keys[0].is_prekey);

        assert_eq!(alice.remove_sessions(&jid("bob")).await.unwrap(), 1);
        let out = alice.encrypt_message(&jid("bob"), b"four").await.unwrap();
        assert!(out.envelope.keys[0].is_prekey);
    }

    #[tokio::test]
    async fn message_to_nobody_fails() {
        let dir = MemoryDirectory::new();
        let alice = device(&dir, "alice", 7).await;
        let err = alice
            .send_message(&jid("nobody"), b"hi", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Envelope(EnvelopeError::NoRecipients)));
    }
}
