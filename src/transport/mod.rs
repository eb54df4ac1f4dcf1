//! Transport collaborator: bundle and device-list retrieval, publication and
//! envelope delivery.
//!
//! Implement [`Transport`] over an XMPP connection (pubsub plus message
//! stanzas) or anything else that can move [`Node`](crate::stanza::Node)s.
//! Inbound stanzas are fed to
//! [`OmemoCoordinator::handle_node`](crate::OmemoCoordinator::handle_node) by
//! whatever task reads from the connection.

mod memory;

pub use memory::{MemoryDirectory, MemoryTransport};

use crate::bundle::RemoteBundle;
use crate::stanza::Envelope;
use crate::types::{DeviceId, Jid};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Published bundle of one device of `jid`.
    async fn fetch_bundle(&self, jid: &Jid, device_id: DeviceId) -> Result<RemoteBundle>;

    /// Published device list of `jid`.
    async fn request_device_list(&self, jid: &Jid) -> Result<Vec<DeviceId>>;

    /// Replace the local account's published device list.
    async fn publish_device_list(&self, devices: &[DeviceId]) -> Result<()>;

    /// Publish the bundle of the local device.
    async fn publish_bundle(&self, device_id: DeviceId, bundle: &RemoteBundle) -> Result<()>;

    /// Deliver an encrypted envelope to `to`.
    async fn send_envelope(&self, to: &Jid, envelope: &Envelope) -> Result<()>;
}

/// Alias for a shared transport.
pub type SharedTransport = Arc<dyn Transport>;
