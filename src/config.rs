//! Tunables for one account's OMEMO coordinator.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Number of one-time prekeys kept published.
pub const DEFAULT_PREKEY_COUNT: u32 = 100;

/// Id of the first signed prekey.
pub const DEFAULT_SIGNED_PREKEY_ID: u32 = 1;

/// Default wait for a remote bundle before the device is skipped.
pub const DEFAULT_BUNDLE_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default wait for a contact's device list when none is known yet.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default prefix for keys written to durable persistence.
pub const DEFAULT_NAMESPACE: &str = "omemo";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OmemoConfig {
    pub prekey_count: u32,
    /// Replenish once fewer than this many one-time prekeys remain.
    pub min_prekeys: u32,
    pub signed_prekey_id: u32,
    #[serde(with = "duration_ms")]
    pub bundle_fetch_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub discovery_timeout: Duration,
    pub namespace: String,
}

impl Default for OmemoConfig {
    fn default() -> Self {
        Self {
            prekey_count: DEFAULT_PREKEY_COUNT,
            min_prekeys: DEFAULT_PREKEY_COUNT,
            signed_prekey_id: DEFAULT_SIGNED_PREKEY_ID,
            bundle_fetch_timeout: DEFAULT_BUNDLE_FETCH_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl OmemoConfig {
    /// Sets the pool size; the replenish threshold follows it.
    pub fn with_prekey_count(mut self, count: u32) -> Self {
        self.prekey_count = count;
        self.min_prekeys = count;
        self
    }

    pub fn with_min_prekeys(mut self, min: u32) -> Self {
        self.min_prekeys = min;
        self
    }

    pub fn with_bundle_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.bundle_fetch_timeout = timeout;
        self
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
