//! Port to the remote key directory.
//!
//! The directory stores each device's public bundle and hands out one-time
//! prekeys. Calls are made on behalf of the signed-in user; the transport
//! (HTTP, in-process, ...) lives behind the [`Directory`] trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::SignalError;
use crate::signal::prekeys::{OneTimePreKeyPublic, PreKeyBundle, SignedPreKeyPublic};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// The peer never published a bundle (or does not exist).
    #[error("not found")]
    NotFound,

    #[error("peer has no registered device")]
    NoDevice,

    #[error("peer device has no signed prekey")]
    NoSignedPreKey,

    #[error("peer has no one-time prekeys left")]
    NoPreKeys,

    /// The directory answered with a non-success status.
    #[error("request rejected with status {status}")]
    Rejected { status: u16 },

    #[error("transport failure: {0}")]
    Transport(String),
}

impl From<DirectoryError> for SignalError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::NotFound | DirectoryError::NoSignedPreKey => Self::NoBundle,
            DirectoryError::NoDevice => Self::NoDevice,
            DirectoryError::NoPreKeys => Self::NoPreKeys,
            other => Self::Directory(other.to_string()),
        }
    }
}

/// `POST /devices/register` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeviceRequest {
    pub device_id: String,
    pub registration_id: u32,
    #[serde(with = "crate::serde_b64")]
    pub identity_key_public: Vec<u8>,
    pub signed_pre_key: SignedPreKeyPublic,
    pub one_time_pre_keys: Vec<OneTimePreKeyPublic>,
}

/// `POST /prekeys/replenish` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplenishRequest {
    pub device_id: String,
    pub one_time_pre_keys: Vec<OneTimePreKeyPublic>,
}

/// `GET /users/{peer}/identity` response. Fetching it consumes nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerIdentity {
    pub user_id: String,
    pub device_id: String,
    pub registration_id: u32,
    #[serde(with = "crate::serde_b64")]
    pub identity_key_public: Vec<u8>,
}

#[async_trait]
pub trait Directory: Send + Sync {
    /// Publish (or republish) this user's device bundle.
    async fn register_device(&self, request: &RegisterDeviceRequest) -> Result<(), DirectoryError>;

    /// Unconsumed one-time prekeys the directory holds for `device_id`.
    async fn prekey_count(&self, device_id: &str) -> Result<u32, DirectoryError>;

    /// Extend the device's one-time prekey pool.
    async fn replenish_prekeys(&self, request: &ReplenishRequest) -> Result<(), DirectoryError>;

    /// The peer's bundle. Atomically consumes the returned one-time prekey.
    async fn fetch_bundle(&self, peer: &str) -> Result<PreKeyBundle, DirectoryError>;

    async fn fetch_identity(&self, peer: &str) -> Result<PeerIdentity, DirectoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_material_maps_to_peer_errors() {
        assert!(matches!(SignalError::from(DirectoryError::NotFound), SignalError::NoBundle));
        assert!(matches!(
            SignalError::from(DirectoryError::NoSignedPreKey),
            SignalError::NoBundle
        ));
        assert!(matches!(SignalError::from(DirectoryError::NoDevice), SignalError::NoDevice));
        assert!(matches!(SignalError::from(DirectoryError::NoPreKeys), SignalError::NoPreKeys));

        let err = SignalError::from(DirectoryError::Rejected { status: 503 });
        assert!(err.is_retryable());
        assert!(!err.is_peer_not_ready());
    }

    #[test]
    fn register_request_uses_wire_field_names() {
        let request = RegisterDeviceRequest {
            device_id: "d1".into(),
            registration_id: 9,
            identity_key_public: vec![1; 32],
            signed_pre_key: SignedPreKeyPublic {
                key_id: 1,
                public_key: vec![2; 32],
                signature: vec![3; 64],
            },
            one_time_pre_keys: vec![OneTimePreKeyPublic {
                key_id: 1000,
                public_key: vec![4; 32],
            }],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["deviceId"], "d1");
        assert!(json["identityKeyPublic"].is_string());
        assert_eq!(json["oneTimePreKeys"][0]["keyId"], 1000);
        assert!(json["signedPreKey"]["signature"].is_string());
    }
}
