//! In-process key directory.
//!
//! Behaves like the remote directory: register upserts, bundle fetches
//! consume one prekey atomically, identity fetches consume nothing. Used by
//! tests and the simulator.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::signal::directory::{
    Directory, DirectoryError, PeerIdentity, RegisterDeviceRequest, ReplenishRequest,
};
use crate::signal::prekeys::{OneTimePreKeyPublic, PreKeyBundle, SignedPreKeyPublic};

const STATUS_BAD_REQUEST: u16 = 400;
const STATUS_FORBIDDEN: u16 = 403;
const STATUS_SERVER_ERROR: u16 = 500;

struct PublishedPreKey {
    public_key: Vec<u8>,
    consumed: bool,
}

struct DeviceEntry {
    owner: String,
    registration_id: u32,
    identity_key_public: Vec<u8>,
    created: u64,
    /// Signed prekeys keyed by id, with their insertion sequence.
    signed_prekeys: HashMap<u32, (u64, SignedPreKeyPublic)>,
    prekeys: BTreeMap<u32, PublishedPreKey>,
}

impl DeviceEntry {
    fn newest_signed_prekey(&self) -> Option<&SignedPreKeyPublic> {
        self.signed_prekeys
            .values()
            .max_by_key(|(seq, _)| *seq)
            .map(|(_, spk)| spk)
    }

    fn unconsumed(&self) -> usize {
        self.prekeys.values().filter(|p| !p.consumed).count()
    }
}

#[derive(Default)]
struct DirectoryState {
    users: BTreeSet<String>,
    devices: HashMap<String, DeviceEntry>,
    sequence: u64,
    reject_registrations: bool,
}

impl DirectoryState {
    fn next_seq(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn newest_device(&self, user: &str) -> Result<(&String, &DeviceEntry), DirectoryError> {
        if !self.users.contains(user) {
            return Err(DirectoryError::NotFound);
        }
        self.devices
            .iter()
            .filter(|(_, device)| device.owner == user)
            .max_by_key(|(_, device)| device.created)
            .ok_or(DirectoryError::NoDevice)
    }

    fn owned_device(&mut self, user: &str, device_id: &str) -> Result<&mut DeviceEntry, DirectoryError> {
        self.devices
            .get_mut(device_id)
            .filter(|device| device.owner == user)
            .ok_or(DirectoryError::Rejected { status: STATUS_FORBIDDEN })
    }
}

/// Shared directory state. Clones see the same data.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A [`Directory`] acting as signed-in `user`. Creates the account on
    /// first use.
    pub fn for_user(&self, user: impl Into<String>) -> UserDirectory {
        let user = user.into();
        self.state.lock().users.insert(user.clone());
        UserDirectory {
            user,
            state: Arc::clone(&self.state),
        }
    }

    /// Unconsumed one-time prekeys on `user`'s newest device.
    pub fn remaining_prekeys(&self, user: &str) -> Result<u32, DirectoryError> {
        let state = self.state.lock();
        let (_, device) = state.newest_device(user)?;
        Ok(u32::try_from(device.unconsumed()).unwrap_or(u32::MAX))
    }

    /// Mark all but `keep` of `user`'s unconsumed prekeys as consumed.
    pub fn drain_prekeys(&self, user: &str, keep: usize) -> Result<(), DirectoryError> {
        let mut state = self.state.lock();
        let device_id = state.newest_device(user)?.0.clone();
        if let Some(device) = state.devices.get_mut(&device_id) {
            let mut left = device.unconsumed();
            for prekey in device.prekeys.values_mut().filter(|p| !p.consumed) {
                if left <= keep {
                    break;
                }
                prekey.consumed = true;
                left -= 1;
            }
        }
        Ok(())
    }

    /// Make every registration fail with a server error, until switched off.
    pub fn set_reject_registrations(&self, reject: bool) {
        self.state.lock().reject_registrations = reject;
    }
}

/// One user's view of a [`MemoryDirectory`].
#[derive(Clone)]
pub struct UserDirectory {
    user: String,
    state: Arc<Mutex<DirectoryState>>,
}

impl UserDirectory {
    pub fn user(&self) -> &str {
        &self.user
    }
}

#[async_trait]
impl Directory for UserDirectory {
    async fn register_device(&self, request: &RegisterDeviceRequest) -> Result<(), DirectoryError> {
        let mut state = self.state.lock();
        if state.reject_registrations {
            return Err(DirectoryError::Rejected { status: STATUS_SERVER_ERROR });
        }
        if request.device_id.is_empty()
            || request.registration_id == 0
            || request.identity_key_public.is_empty()
            || request.signed_pre_key.public_key.is_empty()
            || request.signed_pre_key.signature.is_empty()
        {
            return Err(DirectoryError::Rejected { status: STATUS_BAD_REQUEST });
        }
        if state
            .devices
            .get(&request.device_id)
            .is_some_and(|device| device.owner != self.user)
        {
            return Err(DirectoryError::Rejected { status: STATUS_FORBIDDEN });
        }

        let created = state.next_seq();
        let spk_seq = state.next_seq();
        let device = state
            .devices
            .entry(request.device_id.clone())
            .or_insert_with(|| DeviceEntry {
                owner: self.user.clone(),
                registration_id: 0,
                identity_key_public: Vec::new(),
                created,
                signed_prekeys: HashMap::new(),
                prekeys: BTreeMap::new(),
            });
        device.registration_id = request.registration_id;
        device.identity_key_public.clone_from(&request.identity_key_public);

        let spk = &request.signed_pre_key;
        device
            .signed_prekeys
            .entry(spk.key_id)
            .and_modify(|(_, existing)| *existing = spk.clone())
            .or_insert_with(|| (spk_seq, spk.clone()));

        // Registration refreshes key material but leaves consumption alone.
        for prekey in &request.one_time_pre_keys {
            device
                .prekeys
                .entry(prekey.key_id)
                .and_modify(|existing| existing.public_key.clone_from(&prekey.public_key))
                .or_insert_with(|| PublishedPreKey {
                    public_key: prekey.public_key.clone(),
                    consumed: false,
                });
        }
        Ok(())
    }

    async fn prekey_count(&self, device_id: &str) -> Result<u32, DirectoryError> {
        let mut state = self.state.lock();
        let device = state.owned_device(&self.user, device_id)?;
        Ok(u32::try_from(device.unconsumed()).unwrap_or(u32::MAX))
    }

    async fn replenish_prekeys(&self, request: &ReplenishRequest) -> Result<(), DirectoryError> {
        if request.device_id.is_empty() {
            return Err(DirectoryError::Rejected { status: STATUS_BAD_REQUEST });
        }
        let mut state = self.state.lock();
        let device = state.owned_device(&self.user, &request.device_id)?;
        for prekey in &request.one_time_pre_keys {
            device.prekeys.insert(
                prekey.key_id,
                PublishedPreKey {
                    public_key: prekey.public_key.clone(),
                    consumed: false,
                },
            );
        }
        Ok(())
    }

    async fn fetch_bundle(&self, peer: &str) -> Result<PreKeyBundle, DirectoryError> {
        let mut state = self.state.lock();
        let device_id = state.newest_device(peer)?.0.clone();
        let device = state
            .devices
            .get_mut(&device_id)
            .ok_or(DirectoryError::NoDevice)?;

        let signed_pre_key = device
            .newest_signed_prekey()
            .cloned()
            .ok_or(DirectoryError::NoSignedPreKey)?;
        let (key_id, prekey) = device
            .prekeys
            .iter_mut()
            .find(|(_, p)| !p.consumed)
            .ok_or(DirectoryError::NoPreKeys)?;
        prekey.consumed = true;

        Ok(PreKeyBundle {
            user_id: peer.to_string(),
            device_id,
            registration_id: device.registration_id,
            identity_key_public: device.identity_key_public.clone(),
            signed_pre_key,
            one_time_pre_key: OneTimePreKeyPublic {
                key_id: *key_id,
                public_key: prekey.public_key.clone(),
            },
        })
    }

    async fn fetch_identity(&self, peer: &str) -> Result<PeerIdentity, DirectoryError> {
        let state = self.state.lock();
        let (device_id, device) = state.newest_device(peer)?;
        Ok(PeerIdentity {
            user_id: peer.to_string(),
            device_id: device_id.clone(),
            registration_id: device.registration_id,
            identity_key_public: device.identity_key_public.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(device_id: &str, spk_id: u32, prekey_ids: std::ops::Range<u32>) -> RegisterDeviceRequest {
        RegisterDeviceRequest {
            device_id: device_id.into(),
            registration_id: 7,
            identity_key_public: vec![1; 32],
            signed_pre_key: SignedPreKeyPublic {
                key_id: spk_id,
                public_key: vec![spk_id as u8; 32],
                signature: vec![3; 64],
            },
            one_time_pre_keys: prekey_ids
                .map(|key_id| OneTimePreKeyPublic {
                    key_id,
                    public_key: vec![4; 32],
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn bundle_fetch_consumes_one_prekey() {
        let directory = MemoryDirectory::new();
        let alice = directory.for_user("alice");
        let bob = directory.for_user("bob");
        alice.register_device(&request("a1", 1, 1..21)).await.unwrap();

        let bundle = bob.fetch_bundle("alice").await.unwrap();
        assert_eq!(bundle.one_time_pre_key.key_id, 1);
        assert_eq!(alice.prekey_count("a1").await.unwrap(), 19);

        let next = bob.fetch_bundle("alice").await.unwrap();
        assert_ne!(next.one_time_pre_key.key_id, bundle.one_time_pre_key.key_id);
    }

    #[tokio::test]
    async fn missing_material_is_distinguishable() {
        let directory = MemoryDirectory::new();
        let bob = directory.for_user("bob");
        assert_eq!(bob.fetch_bundle("nobody").await.unwrap_err(), DirectoryError::NotFound);

        let alice = directory.for_user("alice");
        assert_eq!(bob.fetch_bundle("alice").await.unwrap_err(), DirectoryError::NoDevice);
        assert_eq!(bob.fetch_identity("alice").await.unwrap_err(), DirectoryError::NoDevice);

        alice.register_device(&request("a1", 1, 0..0)).await.unwrap();
        assert_eq!(bob.fetch_bundle("alice").await.unwrap_err(), DirectoryError::NoPreKeys);
    }

    #[tokio::test]
    async fn identity_fetch_consumes_nothing() {
        let directory = MemoryDirectory::new();
        let alice = directory.for_user("alice");
        let bob = directory.for_user("bob");
        alice.register_device(&request("a1", 1, 1..3)).await.unwrap();

        for _ in 0..3 {
            let identity = bob.fetch_identity("alice").await.unwrap();
            assert_eq!(identity.device_id, "a1");
        }
        assert_eq!(directory.remaining_prekeys("alice").unwrap(), 2);
    }

    #[tokio::test]
    async fn newest_device_and_signed_prekey_win() {
        let directory = MemoryDirectory::new();
        let alice = directory.for_user("alice");
        let bob = directory.for_user("bob");
        alice.register_device(&request("a1", 1, 1..3)).await.unwrap();
        alice.register_device(&request("a1", 2, 3..5)).await.unwrap();

        let bundle = bob.fetch_bundle("alice").await.unwrap();
        assert_eq!(bundle.signed_pre_key.key_id, 2);

        alice.register_device(&request("a2", 9, 1..2)).await.unwrap();
        assert_eq!(bob.fetch_identity("alice").await.unwrap().device_id, "a2");
    }

    #[tokio::test]
    async fn replenish_extends_and_requires_ownership() {
        let directory = MemoryDirectory::new();
        let alice = directory.for_user("alice");
        let mallory = directory.for_user("mallory");
        alice.register_device(&request("a1", 1, 1..5)).await.unwrap();

        let more = ReplenishRequest {
            device_id: "a1".into(),
            one_time_pre_keys: (100..120)
                .map(|key_id| OneTimePreKeyPublic {
                    key_id,
                    public_key: vec![5; 32],
                })
                .collect(),
        };
        alice.replenish_prekeys(&more).await.unwrap();
        assert_eq!(alice.prekey_count("a1").await.unwrap(), 24);

        assert_eq!(
            mallory.replenish_prekeys(&more).await.unwrap_err(),
            DirectoryError::Rejected { status: STATUS_FORBIDDEN }
        );
        assert!(mallory.prekey_count("a1").await.is_err());
        assert!(mallory.register_device(&request("a1", 3, 0..0)).await.is_err());
    }

    #[tokio::test]
    async fn rejection_switch_fails_registration() {
        let directory = MemoryDirectory::new();
        let alice = directory.for_user("alice");
        directory.set_reject_registrations(true);
        assert!(matches!(
            alice.register_device(&request("a1", 1, 1..2)).await,
            Err(DirectoryError::Rejected { status: 500 })
        ));
        directory.set_reject_registrations(false);
        alice.register_device(&request("a1", 1, 1..2)).await.unwrap();
    }

    #[tokio::test]
    async fn drain_leaves_requested_count() {
        let directory = MemoryDirectory::new();
        let alice = directory.for_user("alice");
        alice.register_device(&request("a1", 1, 1..21)).await.unwrap();
        directory.drain_prekeys("alice", 4).unwrap();
        assert_eq!(alice.prekey_count("a1").await.unwrap(), 4);
    }
}
