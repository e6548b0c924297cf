use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Tunables for device bootstrap, prekey maintenance and ratchet limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// One-time prekeys generated on every `init_device`.
    pub one_time_prekey_batch: u32,
    /// Replenish when the directory holds fewer unconsumed prekeys than this.
    pub replenish_threshold: u32,
    /// One-time prekeys submitted per replenishment.
    pub replenish_batch: u32,
    /// Device index used for every peer address (one device per user).
    pub peer_device_index: u32,
    /// Upper bound on stored message keys for out-of-order delivery.
    pub max_skipped_message_keys: u32,
    /// Signed prekeys kept locally after rotation.
    pub signed_prekey_retention: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            one_time_prekey_batch: 20,
            replenish_threshold: 5,
            replenish_batch: 20,
            peer_device_index: 1,
            max_skipped_message_keys: 1000,
            signed_prekey_retention: 3,
        }
    }
}

impl SignalConfig {
    /// Parse a config document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
