use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SignalError};
use crate::keystore::{KeyStore, NS_PEER_IDENTITY};
use crate::signal::address::ProtocolAddress;

/// How a peer identity key is judged before a session uses it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustPolicy {
    /// Accept any key and overwrite the cached one.
    AlwaysTrust,
    /// Accept the first key seen; refuse a different key afterwards.
    #[default]
    PinOnFirstUse,
    /// Refuse every key the user has not explicitly verified.
    ManualVerification,
}

#[derive(Serialize, Deserialize)]
struct TrustedIdentity {
    #[serde(with = "crate::serde_b64")]
    identity_key: Vec<u8>,
    verified: bool,
}

/// Cache of peer identity keys, keyed by protocol address.
#[derive(Clone)]
pub struct TrustStore {
    kv: Arc<dyn KeyStore>,
    policy: TrustPolicy,
}

impl TrustStore {
    pub fn new(kv: Arc<dyn KeyStore>, policy: TrustPolicy) -> Self {
        Self { kv, policy }
    }

    pub fn policy(&self) -> TrustPolicy {
        self.policy
    }

    /// The identity key recorded for `address`, if any.
    pub fn load(&self, address: &ProtocolAddress) -> Result<Option<Vec<u8>>> {
        Ok(self.load_entry(address)?.map(|entry| entry.identity_key))
    }

    pub fn is_verified(&self, address: &ProtocolAddress) -> Result<bool> {
        Ok(self.load_entry(address)?.is_some_and(|entry| entry.verified))
    }

    /// Decide whether `identity_key` may be used for `address`.
    pub fn check(&self, address: &ProtocolAddress, identity_key: &[u8]) -> Result<()> {
        let known = self.load_entry(address)?;
        let trusted = match (self.policy, known) {
            (TrustPolicy::AlwaysTrust, _) | (TrustPolicy::PinOnFirstUse, None) => true,
            (TrustPolicy::PinOnFirstUse, Some(entry)) => entry.identity_key == identity_key,
            (TrustPolicy::ManualVerification, Some(entry)) => {
                entry.verified && entry.identity_key == identity_key
            }
            (TrustPolicy::ManualVerification, None) => false,
        };

        if trusted {
            Ok(())
        } else {
            tracing::warn!(%address, policy = ?self.policy, "refusing untrusted identity key");
            Err(SignalError::UntrustedIdentity(address.to_string()))
        }
    }

    /// Record `identity_key` as the key for `address`. A changed key loses
    /// its verified flag.
    pub fn save(&self, address: &ProtocolAddress, identity_key: &[u8]) -> Result<()> {
        let verified = self
            .load_entry(address)?
            .is_some_and(|entry| entry.verified && entry.identity_key == identity_key);
        self.store_entry(address, identity_key, verified)
    }

    /// Record `identity_key` as verified out of band (e.g. by comparing
    /// safety numbers).
    pub fn mark_verified(&self, address: &ProtocolAddress, identity_key: &[u8]) -> Result<()> {
        tracing::info!(%address, "identity key marked verified");
        self.store_entry(address, identity_key, true)
    }

    /// Forget every cached peer identity.
    pub fn clear(&self) -> Result<()> {
        for key in self.kv.keys(NS_PEER_IDENTITY)? {
            self.kv.remove(NS_PEER_IDENTITY, &key)?;
        }
        Ok(())
    }

    fn load_entry(&self, address: &ProtocolAddress) -> Result<Option<TrustedIdentity>> {
        self.kv
            .get(NS_PEER_IDENTITY, &address.to_string())?
            .map(|raw| serde_json::from_slice(&raw).map_err(SignalError::from))
            .transpose()
    }

    fn store_entry(&self, address: &ProtocolAddress, identity_key: &[u8], verified: bool) -> Result<()> {
        let entry = TrustedIdentity {
            identity_key: identity_key.to_vec(),
            verified,
        };
        self.kv
            .put(NS_PEER_IDENTITY, &address.to_string(), &serde_json::to_vec(&entry)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryKeyStore;

    fn store(policy: TrustPolicy) -> TrustStore {
        TrustStore::new(Arc::new(MemoryKeyStore::new()), policy)
    }

    #[test]
    fn pin_on_first_use_rejects_changed_key() {
        let trust = store(TrustPolicy::PinOnFirstUse);
        let addr = ProtocolAddress::new("u2", 1);

        trust.check(&addr, &[1u8; 32]).unwrap();
        trust.save(&addr, &[1u8; 32]).unwrap();
        trust.check(&addr, &[1u8; 32]).unwrap();

        assert!(matches!(
            trust.check(&addr, &[2u8; 32]),
            Err(SignalError::UntrustedIdentity(_))
        ));
    }

    #[test]
    fn always_trust_accepts_rotation() {
        let trust = store(TrustPolicy::AlwaysTrust);
        let addr = ProtocolAddress::new("u2", 1);
        trust.save(&addr, &[1u8; 32]).unwrap();
        trust.check(&addr, &[2u8; 32]).unwrap();
        trust.save(&addr, &[2u8; 32]).unwrap();
        assert_eq!(trust.load(&addr).unwrap().unwrap(), vec![2u8; 32]);
    }

    #[test]
    fn manual_verification_requires_marked_key() {
        let trust = store(TrustPolicy::ManualVerification);
        let addr = ProtocolAddress::new("u2", 1);

        assert!(trust.check(&addr, &[1u8; 32]).is_err());
        trust.mark_verified(&addr, &[1u8; 32]).unwrap();
        trust.check(&addr, &[1u8; 32]).unwrap();
        assert!(trust.check(&addr, &[3u8; 32]).is_err());

        // Saving a different key drops the verified flag.
        trust.save(&addr, &[3u8; 32]).unwrap();
        assert!(!trust.is_verified(&addr).unwrap());
    }

    #[test]
    fn clear_forgets_everything() {
        let trust = store(TrustPolicy::PinOnFirstUse);
        let addr = ProtocolAddress::new("u2", 1);
        trust.save(&addr, &[1u8; 32]).unwrap();
        trust.clear().unwrap();
        assert!(trust.load(&addr).unwrap().is_none());
        trust.check(&addr, &[9u8; 32]).unwrap();
    }
}
