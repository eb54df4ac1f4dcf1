//! Send message types.

use crate::peer::SkippedDevice;
use crate::types::{DeviceAddress, DeviceId, MessageId};
use std::time::SystemTime;

/// Response from sending a message.
#[derive(Clone, Debug)]
pub struct SendResponse {
    pub timestamp: SystemTime,
    pub id: MessageId,
    /// Devices a key was wrapped for.
    pub recipients: Vec<DeviceId>,
    pub skipped: Vec<SkippedDevice>,
    pub sender: DeviceAddress,
}

/// Optional parameters for [`send_message`](super::OmemoCoordinator::send_message).
#[derive(Clone, Debug, Default)]
pub struct SendRequestExtra {
    pub id: Option<MessageId>,
}

/// Random stanza id for an outgoing message.
pub fn generate_message_id() -> MessageId {
    uuid::Uuid::new_v4().to_string()
}
