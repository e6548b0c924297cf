use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;

use crate::error::{Result, SignalError};
use crate::identity::IdentityKeyPair;
use crate::keystore::{
    KeyStore, MemoryKeyStore, KEY_DEVICE_ID, KEY_IDENTITY_SECRET, KEY_NEXT_PREKEY_ID,
    KEY_NEXT_SIGNED_PREKEY_ID, KEY_REGISTRATION_ID, NS_DEVICE, NS_PREKEY, NS_SESSION,
    NS_SIGNED_PREKEY,
};
use crate::signal::address::ProtocolAddress;
use crate::signal::locks::AddressLocks;
use crate::signal::prekeys::{OneTimePreKeyRecord, SignedPreKeyRecord};
use crate::signal::ratchet::SessionState;
use crate::signal::trust::{TrustPolicy, TrustStore};

/// Highest prekey id before the counter wraps back to 1.
const MAX_PREKEY_ID: u32 = 0x00FF_FFFF;

/// Registration ids fit in 14 bits, as in Signal.
const MAX_REGISTRATION_ID: u32 = 0x3FFC;

/// Device singletons: device id, identity key pair and registration id.
#[derive(Clone)]
pub struct IdentityStore {
    kv: Arc<dyn KeyStore>,
}

impl IdentityStore {
    pub fn new(kv: Arc<dyn KeyStore>) -> Self {
        Self { kv }
    }

    pub fn device_id(&self) -> Result<Option<String>> {
        self.kv
            .get(NS_DEVICE, KEY_DEVICE_ID)?
            .map(|raw| {
                String::from_utf8(raw)
                    .map_err(|_| SignalError::StorageCorruption("device id is not UTF-8".into()))
            })
            .transpose()
    }

    pub fn set_device_id(&self, device_id: &str) -> Result<()> {
        self.kv.put(NS_DEVICE, KEY_DEVICE_ID, device_id.as_bytes())
    }

    /// The local identity, `None` before first bootstrap.
    pub fn load_identity_key_pair(&self) -> Result<Option<IdentityKeyPair>> {
        self.kv
            .get(NS_DEVICE, KEY_IDENTITY_SECRET)?
            .map(|secret| {
                IdentityKeyPair::from_secret_slice(&secret)
                    .map_err(|_| SignalError::StorageCorruption("identity secret is malformed".into()))
            })
            .transpose()
    }

    /// The local identity; its absence is corruption once the device exists.
    pub fn identity_key_pair(&self) -> Result<IdentityKeyPair> {
        self.load_identity_key_pair()?
            .ok_or_else(|| SignalError::StorageCorruption("identity key pair missing".into()))
    }

    pub fn store_identity(&self, identity: &IdentityKeyPair) -> Result<()> {
        self.kv
            .put(NS_DEVICE, KEY_IDENTITY_SECRET, identity.secret_key_bytes())
    }

    pub fn load_registration_id(&self) -> Result<Option<u32>> {
        self.kv
            .get(NS_DEVICE, KEY_REGISTRATION_ID)?
            .map(|raw| read_u32(&raw, "registration id"))
            .transpose()
    }

    pub fn registration_id(&self) -> Result<u32> {
        self.load_registration_id()?
            .ok_or_else(|| SignalError::StorageCorruption("registration id missing".into()))
    }

    pub fn set_registration_id(&self, registration_id: u32) -> Result<()> {
        self.kv
            .put(NS_DEVICE, KEY_REGISTRATION_ID, &registration_id.to_le_bytes())
    }

    /// A fresh random registration id in `1..=0x3FFC`.
    pub fn generate_registration_id() -> u32 {
        rand::rngs::OsRng.gen_range(1..=MAX_REGISTRATION_ID)
    }
}

/// Local one-time prekey records.
#[derive(Clone)]
pub struct PreKeyStore {
    kv: Arc<dyn KeyStore>,
    counter: Arc<Mutex<()>>,
}

impl PreKeyStore {
    pub fn new(kv: Arc<dyn KeyStore>) -> Self {
        Self {
            kv,
            counter: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self, record: &OneTimePreKeyRecord) -> Result<()> {
        self.kv
            .put(NS_PREKEY, &record.key_id.to_string(), &serde_json::to_vec(record)?)
    }

    pub fn load(&self, key_id: u32) -> Result<Option<OneTimePreKeyRecord>> {
        self.kv
            .get(NS_PREKEY, &key_id.to_string())?
            .map(|raw| decode_record(&raw, "one-time prekey"))
            .transpose()
    }

    /// Load and delete a one-time prekey that must exist.
    pub fn take(&self, key_id: u32) -> Result<OneTimePreKeyRecord> {
        let record = self
            .load(key_id)?
            .ok_or_else(|| SignalError::StorageCorruption(format!("one-time prekey {key_id} missing")))?;
        self.remove(key_id)?;
        Ok(record)
    }

    pub fn remove(&self, key_id: u32) -> Result<()> {
        self.kv.remove(NS_PREKEY, &key_id.to_string())
    }

    pub fn ids(&self) -> Result<Vec<u32>> {
        let mut ids: Vec<u32> = self
            .kv
            .keys(NS_PREKEY)?
            .iter()
            .filter_map(|key| key.parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Reserve `count` ids that no earlier batch has used.
    pub fn allocate_ids(&self, count: u32) -> Result<Vec<u32>> {
        let _counter = self.counter.lock();
        let mut next = next_counter(self.kv.as_ref(), KEY_NEXT_PREKEY_ID)?;
        let mut ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            ids.push(next);
            next = wrap_id(next);
        }
        self.kv
            .put(NS_DEVICE, KEY_NEXT_PREKEY_ID, &next.to_le_bytes())?;
        Ok(ids)
    }

    /// Generate, persist and return `count` fresh one-time prekeys.
    pub fn generate_batch(&self, count: u32) -> Result<Vec<OneTimePreKeyRecord>> {
        self.allocate_ids(count)?
            .into_iter()
            .map(|key_id| {
                let record = OneTimePreKeyRecord::generate(key_id);
                self.store(&record)?;
                Ok(record)
            })
            .collect()
    }
}

/// Local signed prekey records. Several are kept after rotation so
/// in-flight handshake messages still decrypt.
#[derive(Clone)]
pub struct SignedPreKeyStore {
    kv: Arc<dyn KeyStore>,
    counter: Arc<Mutex<()>>,
}

impl SignedPreKeyStore {
    pub fn new(kv: Arc<dyn KeyStore>) -> Self {
        Self {
            kv,
            counter: Arc::new(Mutex::new(())),
        }
    }

    pub fn next_id(&self) -> Result<u32> {
        let _counter = self.counter.lock();
        let id = next_counter(self.kv.as_ref(), KEY_NEXT_SIGNED_PREKEY_ID)?;
        self.kv
            .put(NS_DEVICE, KEY_NEXT_SIGNED_PREKEY_ID, &wrap_id(id).to_le_bytes())?;
        Ok(id)
    }

    pub fn store(&self, record: &SignedPreKeyRecord) -> Result<()> {
        self.kv.put(
            NS_SIGNED_PREKEY,
            &record.key_id.to_string(),
            &serde_json::to_vec(record)?,
        )
    }

    /// A signed prekey, `None` once pruned.
    pub fn get(&self, key_id: u32) -> Result<Option<SignedPreKeyRecord>> {
        self.kv
            .get(NS_SIGNED_PREKEY, &key_id.to_string())?
            .map(|raw| decode_record(&raw, "signed prekey"))
            .transpose()
    }

    /// A signed prekey that must exist.
    pub fn load(&self, key_id: u32) -> Result<SignedPreKeyRecord> {
        self.get(key_id)?
            .ok_or_else(|| SignalError::StorageCorruption(format!("signed prekey {key_id} missing")))
    }

    /// All stored signed prekeys, oldest first.
    pub fn all(&self) -> Result<Vec<SignedPreKeyRecord>> {
        let mut records = self
            .kv
            .keys(NS_SIGNED_PREKEY)?
            .iter()
            .filter_map(|key| key.parse::<u32>().ok())
            .map(|key_id| self.load(key_id))
            .collect::<Result<Vec<_>>>()?;
        records.sort_by_key(|r| (r.created_at_ms, r.key_id));
        Ok(records)
    }

    pub fn remove(&self, key_id: u32) -> Result<()> {
        self.kv.remove(NS_SIGNED_PREKEY, &key_id.to_string())
    }

    /// Delete all but the `retain` newest signed prekeys. Returns the
    /// removed ids.
    pub fn prune(&self, retain: usize) -> Result<Vec<u32>> {
        let records = self.all()?;
        let excess = records.len().saturating_sub(retain.max(1));
        let mut removed = Vec::with_capacity(excess);
        for record in records.iter().take(excess) {
            self.remove(record.key_id)?;
            removed.push(record.key_id);
        }
        Ok(removed)
    }
}

/// Session records, one per peer address.
#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn KeyStore>,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KeyStore>) -> Self {
        Self { kv }
    }

    pub fn load(&self, address: &ProtocolAddress) -> Result<Option<SessionState>> {
        let key = address.to_string();
        let Some(raw) = self.kv.get(NS_SESSION, &key)? else {
            return Ok(None);
        };
        let state = SessionState::from_bytes(&raw)?;
        if state.address() != key {
            return Err(SignalError::StorageCorruption(format!(
                "session stored under {key} belongs to {}",
                state.address()
            )));
        }
        Ok(Some(state))
    }

    pub fn store(&self, address: &ProtocolAddress, state: &SessionState) -> Result<()> {
        self.kv.put(NS_SESSION, &address.to_string(), &state.to_bytes()?)
    }

    pub fn contains(&self, address: &ProtocolAddress) -> Result<bool> {
        self.kv.contains(NS_SESSION, &address.to_string())
    }

    pub fn remove(&self, address: &ProtocolAddress) -> Result<()> {
        self.kv.remove(NS_SESSION, &address.to_string())
    }

    /// Keys of every stored session, in `name.device` form.
    pub fn addresses(&self) -> Result<Vec<String>> {
        self.kv.keys(NS_SESSION)
    }

    pub fn clear(&self) -> Result<()> {
        for key in self.kv.keys(NS_SESSION)? {
            self.kv.remove(NS_SESSION, &key)?;
        }
        Ok(())
    }
}

/// Every typed repository over one [`KeyStore`], plus the session locks.
///
/// Clones share the locks, so all components built from one store
/// serialize their session updates against each other.
#[derive(Clone)]
pub struct SignalStore {
    pub identity: IdentityStore,
    pub prekeys: PreKeyStore,
    pub signed_prekeys: SignedPreKeyStore,
    pub sessions: SessionStore,
    pub trust: TrustStore,
    locks: AddressLocks,
}

impl SignalStore {
    pub fn new(kv: Arc<dyn KeyStore>, policy: TrustPolicy) -> Self {
        Self {
            identity: IdentityStore::new(Arc::clone(&kv)),
            prekeys: PreKeyStore::new(Arc::clone(&kv)),
            signed_prekeys: SignedPreKeyStore::new(Arc::clone(&kv)),
            sessions: SessionStore::new(Arc::clone(&kv)),
            trust: TrustStore::new(kv, policy),
            locks: AddressLocks::new(),
        }
    }

    pub fn locks(&self) -> &AddressLocks {
        &self.locks
    }

    /// A throwaway store with the default trust policy.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKeyStore::new()), TrustPolicy::default())
    }

    /// Drop every session and cached peer identity. The local identity
    /// and prekeys survive, so peers can still open new sessions.
    ///
    /// Waits for in-flight session updates to finish first.
    pub async fn reset_all_sessions(&self) -> Result<()> {
        let _all = self.locks.lock_all().await;
        self.sessions.clear()?;
        self.trust.clear()?;
        tracing::info!("all sessions reset");
        Ok(())
    }
}

fn decode_record<T: serde::de::DeserializeOwned>(raw: &[u8], what: &str) -> Result<T> {
    serde_json::from_slice(raw)
        .map_err(|e| SignalError::StorageCorruption(format!("{what} record: {e}")))
}

fn read_u32(raw: &[u8], what: &str) -> Result<u32> {
    let bytes = <[u8; 4]>::try_from(raw)
        .map_err(|_| SignalError::StorageCorruption(format!("{what} is malformed")))?;
    Ok(u32::from_le_bytes(bytes))
}

fn next_counter(kv: &dyn KeyStore, key: &str) -> Result<u32> {
    match kv.get(NS_DEVICE, key)? {
        Some(raw) => read_u32(&raw, key),
        None => Ok(1),
    }
}

fn wrap_id(id: u32) -> u32 {
    if id >= MAX_PREKEY_ID {
        1
    } else {
        id + 1
    }
}
