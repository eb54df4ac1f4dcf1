use super::Transport;
use crate::bundle::RemoteBundle;
use crate::error::TransportError;
use crate::stanza::{Envelope, Node};
use crate::types::{DeviceId, Jid};
use crate::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    device_lists: HashMap<Jid, Vec<DeviceId>>,
    bundles: HashMap<(Jid, DeviceId), RemoteBundle>,
    unavailable: HashSet<(Jid, DeviceId)>,
    inboxes: HashMap<Jid, Vec<(Jid, Node)>>,
    list_delay: Option<Duration>,
}

/// In-memory stand-in for the server side: pubsub nodes and message
/// delivery shared by every [`MemoryTransport`] connected to it (for testing
/// or demos; not durable).
#[derive(Default)]
pub struct MemoryDirectory {
    state: RwLock<State>,
}

impl MemoryDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport acting for the account `jid`.
    pub fn connect(self: &Arc<Self>, jid: Jid) -> MemoryTransport {
        MemoryTransport {
            directory: Arc::clone(self),
            jid: jid.to_bare(),
        }
    }

    /// Make bundle fetches for one device fail.
    pub async fn set_unavailable(&self, jid: &Jid, device_id: DeviceId) {
        self.state
            .write()
            .await
            .unavailable
            .insert((jid.to_bare(), device_id));
    }

    /// Delay every device-list request.
    pub async fn set_device_list_delay(&self, delay: Duration) {
        self.state.write().await.list_delay = Some(delay);
    }

    pub async fn device_list(&self, jid: &Jid) -> Vec<DeviceId> {
        self.state
            .read()
            .await
            .device_lists
            .get(&jid.to_bare())
            .cloned()
            .unwrap_or_default()
    }

    /// Drain the stanzas delivered to `jid`, as (sender, node) pairs.
    pub async fn take_inbox(&self, jid: &Jid) -> Vec<(Jid, Node)> {
        self.state
            .write()
            .await
            .inboxes
            .remove(&jid.to_bare())
            .unwrap_or_default()
    }
}

/// [`Transport`] bound to one account of a [`MemoryDirectory`].
#[derive(Clone)]
pub struct MemoryTransport {
    directory: Arc<MemoryDirectory>,
    jid: Jid,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn fetch_bundle(&self, jid: &Jid, device_id: DeviceId) -> Result<RemoteBundle> {
        let state = self.directory.state.read().await;
        let key = (jid.to_bare(), device_id);
        if state.unavailable.contains(&key) {
            return Err(TransportError::Unavailable(format!("bundle of {}.{}", jid, device_id)).into());
        }
        // published bundles travel as nodes; parse like a real transport would
        let node = state
            .bundles
            .get(&key)
            .map(RemoteBundle::to_node)
            .ok_or_else(|| TransportError::Unavailable(format!("no bundle for {}.{}", jid, device_id)))?;
        RemoteBundle::from_node(&node)
    }

    async fn request_device_list(&self, jid: &Jid) -> Result<Vec<DeviceId>> {
        let delay = self.directory.state.read().await.list_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.directory.device_list(jid).await)
    }

    async fn publish_device_list(&self, devices: &[DeviceId]) -> Result<()> {
        self.directory
            .state
            .write()
            .await
            .device_lists
            .insert(self.jid.clone(), devices.to_vec());
        Ok(())
    }

    async fn publish_bundle(&self, device_id: DeviceId, bundle: &RemoteBundle) -> Result<()> {
        self.directory
            .state
            .write()
            .await
            .bundles
            .insert((self.jid.clone(), device_id), bundle.clone());
        Ok(())
    }

    async fn send_envelope(&self, to: &Jid, envelope: &Envelope) -> Result<()> {
        let node = envelope.to_node();
        let mut state = self.directory.state.write().await;
        state
            .inboxes
            .entry(to.to_bare())
            .or_default()
            .push((self.jid.clone(), node.clone()));
        // carbon copy for the sender's other devices
        if to.to_bare() != self.jid {
            state
                .inboxes
                .entry(self.jid.clone())
                .or_default()
                .push((self.jid.clone(), node));
        }
        Ok(())
    }
}
