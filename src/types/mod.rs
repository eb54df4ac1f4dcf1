mod jid;

pub use jid::{Jid, JidParseError};

use std::fmt;

/// OMEMO device id. Valid ids are in `[1, 2^31 - 1]`.
pub type DeviceId = u32;

/// Largest valid device id.
pub const MAX_DEVICE_ID: DeviceId = (1 << 31) - 1;

/// Stanza id of an outgoing message.
pub type MessageId = String;

/// One endpoint: a bare JID plus one of its device ids.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct DeviceAddress {
    pub jid: Jid,
    pub device_id: DeviceId,
}

impl DeviceAddress {
    /// The JID is always stored bare.
    pub fn new(jid: Jid, device_id: DeviceId) -> Self {
        Self {
            jid: jid.to_bare(),
            device_id,
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.jid, self.device_id)
    }
}
