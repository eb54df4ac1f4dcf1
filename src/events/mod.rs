//! Event types emitted by the coordinator.

use crate::types::{DeviceAddress, DeviceId, Jid};

/// Events emitted by [OmemoCoordinator](crate::OmemoCoordinator) to registered handlers.
#[derive(Clone, Debug)]
pub enum Event {
    /// Inbound message decrypted.
    Message(MessageEvent),

    /// A device presented an identity key different from the recorded one.
    /// Never resolved automatically.
    TrustViolation { address: DeviceAddress },

    /// A device was left out of an outgoing message (bundle unavailable,
    /// session failure).
    DeviceSkipped { address: DeviceAddress, reason: String },

    /// An inbound envelope could not be decrypted for this device.
    DecryptionFailed {
        from: Jid,
        sid: DeviceId,
        reason: String,
    },

    /// An inbound stanza could not be parsed and was dropped.
    EventDropped { from: Jid, reason: String },

    /// The local device id was added to the published device list.
    DevicePublished { device_id: DeviceId },

    /// The local bundle was (re)published.
    BundlePublished { device_id: DeviceId, pre_keys: usize },
}

#[derive(Clone, Debug)]
pub struct MessageEvent {
    pub from: DeviceAddress,
    pub plaintext: Vec<u8>,
    /// The envelope bootstrapped a new session (consumed one of our prekeys).
    pub pre_key: bool,
}
