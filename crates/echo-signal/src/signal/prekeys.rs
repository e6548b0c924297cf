//! Prekey generation, local prekey records and the published bundle format.
//!
//! A device publishes one signed prekey and a pool of one-time prekeys. A
//! peer fetching the bundle gets the signed prekey plus exactly one one-time
//! prekey, which the directory marks consumed.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, SignalError};
use crate::identity::IdentityKeyPair;

/// A one-time prekey as kept in the local store.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct OneTimePreKeyRecord {
    pub key_id: u32,
    #[serde(with = "crate::serde_b64")]
    pub public_key: Vec<u8>,
    #[serde(with = "crate::serde_b64")]
    secret_key: Vec<u8>,
}

impl OneTimePreKeyRecord {
    pub fn generate(key_id: u32) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self {
            key_id,
            public_key: X25519Public::from(&secret).as_bytes().to_vec(),
            secret_key: secret.to_bytes().to_vec(),
        }
    }

    pub fn secret(&self) -> Result<StaticSecret> {
        x25519_secret(&self.secret_key, "one-time prekey")
    }

    pub fn to_public(&self) -> OneTimePreKeyPublic {
        OneTimePreKeyPublic {
            key_id: self.key_id,
            public_key: self.public_key.clone(),
        }
    }
}

/// A signed prekey as kept in the local store.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SignedPreKeyRecord {
    pub key_id: u32,
    #[serde(with = "crate::serde_b64")]
    pub public_key: Vec<u8>,
    #[serde(with = "crate::serde_b64")]
    secret_key: Vec<u8>,
    /// Identity signature over `public_key`.
    #[serde(with = "crate::serde_b64")]
    pub signature: Vec<u8>,
    /// Generation time, used to prune old signed prekeys.
    pub created_at_ms: u64,
}

impl SignedPreKeyRecord {
    /// Generate a signed prekey and sign its public half with `identity`.
    pub fn generate(identity: &IdentityKeyPair, key_id: u32) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self {
            key_id,
            public_key: public.as_bytes().to_vec(),
            secret_key: secret.to_bytes().to_vec(),
            signature: identity.sign(public.as_bytes()),
            created_at_ms: now_ms(),
        }
    }

    pub fn secret(&self) -> Result<StaticSecret> {
        x25519_secret(&self.secret_key, "signed prekey")
    }

    pub fn to_public(&self) -> SignedPreKeyPublic {
        SignedPreKeyPublic {
            key_id: self.key_id,
            public_key: self.public_key.clone(),
            signature: self.signature.clone(),
        }
    }
}

/// Public half of a signed prekey, as published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyPublic {
    pub key_id: u32,
    #[serde(rename = "public", with = "crate::serde_b64")]
    pub public_key: Vec<u8>,
    #[serde(with = "crate::serde_b64")]
    pub signature: Vec<u8>,
}

/// Public half of a one-time prekey, as published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimePreKeyPublic {
    pub key_id: u32,
    #[serde(rename = "public", with = "crate::serde_b64")]
    pub public_key: Vec<u8>,
}

/// A peer's key bundle as served by the directory. Fetching one consumes
/// the contained one-time prekey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyBundle {
    pub user_id: String,
    pub device_id: String,
    pub registration_id: u32,
    /// Ed25519 identity public key.
    #[serde(with = "crate::serde_b64")]
    pub identity_key_public: Vec<u8>,
    pub signed_pre_key: SignedPreKeyPublic,
    pub one_time_pre_key: OneTimePreKeyPublic,
}

fn x25519_secret(bytes: &[u8], what: &str) -> Result<StaticSecret> {
    let bytes = <[u8; 32]>::try_from(bytes)
        .map_err(|_| SignalError::InvalidKey(format!("{what} wrong length")))?;
    Ok(StaticSecret::from(bytes))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
