use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::error::Result;

/// Persistence port for local key material.
///
/// Values are opaque bytes and must round-trip exactly. Every repository in
/// [`crate::signal::store`] owns one namespace, so keys from different
/// repositories never collide. Implementations never touch the network.
pub trait KeyStore: Send + Sync {
    /// Insert or overwrite a value.
    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()>;

    /// Fetch a value, `None` if absent.
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete a value. Deleting a missing key is not an error.
    fn remove(&self, namespace: &str, key: &str) -> Result<()>;

    /// All keys in a namespace, sorted.
    fn keys(&self, namespace: &str) -> Result<Vec<String>>;

    fn contains(&self, namespace: &str, key: &str) -> Result<bool> {
        Ok(self.get(namespace, key)?.is_some())
    }
}

// Namespace and key constants.

/// Device-level singletons: device id, identity, registration id, id counters.
pub const NS_DEVICE: &str = "device";
/// One-time prekey records, keyed by decimal key id.
pub const NS_PREKEY: &str = "prekey";
/// Signed prekey records, keyed by decimal key id.
pub const NS_SIGNED_PREKEY: &str = "signed_prekey";
/// Session records, keyed by protocol address.
pub const NS_SESSION: &str = "session";
/// Cached peer identity keys, keyed by protocol address.
pub const NS_PEER_IDENTITY: &str = "peer_identity";

pub const KEY_DEVICE_ID: &str = "device_id";
pub const KEY_IDENTITY_SECRET: &str = "identity_secret";
pub const KEY_REGISTRATION_ID: &str = "registration_id";
pub const KEY_NEXT_PREKEY_ID: &str = "next_prekey_id";
pub const KEY_NEXT_SIGNED_PREKEY_ID: &str = "next_signed_prekey_id";

/// In-memory key store.
///
/// Suitable for tests and throwaway devices; contents are lost on drop.
#[derive(Default)]
pub struct MemoryKeyStore {
    entries: Mutex<BTreeMap<(String, String), Vec<u8>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .lock()
            .insert((namespace.to_string(), key.to_string()), value.to_vec());
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .entries
            .lock()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<()> {
        self.entries
            .lock()
            .remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, key)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_values_roundtrip_exactly() {
        let store = MemoryKeyStore::new();
        let value: Vec<u8> = (0..=255).collect();
        store.put(NS_SESSION, "peer.1", &value).unwrap();
        assert_eq!(store.get(NS_SESSION, "peer.1").unwrap(), Some(value));
    }

    #[test]
    fn namespaces_do_not_collide() {
        let store = MemoryKeyStore::new();
        store.put(NS_PREKEY, "7", b"one-time").unwrap();
        store.put(NS_SIGNED_PREKEY, "7", b"signed").unwrap();

        assert_eq!(store.get(NS_PREKEY, "7").unwrap().unwrap(), b"one-time");
        assert_eq!(store.keys(NS_SIGNED_PREKEY).unwrap(), vec!["7".to_string()]);

        store.remove(NS_PREKEY, "7").unwrap();
        assert!(!store.contains(NS_PREKEY, "7").unwrap());
        assert!(store.contains(NS_SIGNED_PREKEY, "7").unwrap());
    }

    #[test]
    fn remove_missing_key_is_ok() {
        let store = MemoryKeyStore::new();
        assert!(store.remove(NS_DEVICE, KEY_DEVICE_ID).is_ok());
        assert!(store.get(NS_DEVICE, KEY_DEVICE_ID).unwrap().is_none());
    }
}
