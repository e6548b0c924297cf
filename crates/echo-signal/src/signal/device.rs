use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::config::SignalConfig;
use crate::error::{Result, SignalError};
use crate::identity::IdentityKeyPair;
use crate::signal::directory::{Directory, RegisterDeviceRequest, ReplenishRequest};
use crate::signal::prekeys::SignedPreKeyRecord;
use crate::signal::store::{IdentityStore, SignalStore};

/// What `init_device` published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRegistration {
    pub device_id: String,
    pub registration_id: u32,
    pub signed_prekey_id: u32,
    pub one_time_prekey_ids: Vec<u32>,
}

/// Result of a best-effort replenishment pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplenishOutcome {
    /// The directory still holds `remaining` prekeys, at or above threshold.
    NotNeeded { remaining: u32 },
    /// `submitted` new prekeys were appended to the pool.
    Replenished { submitted: u32 },
    /// This installation has not been initialised yet.
    NoDevice,
    /// The count query or the submission failed; nothing to do until next time.
    Failed(String),
}

/// Device bootstrap and prekey pool maintenance.
#[derive(Clone)]
pub struct DeviceManager {
    store: SignalStore,
    directory: Arc<dyn Directory>,
    config: SignalConfig,
}

impl DeviceManager {
    pub fn new(store: SignalStore, directory: Arc<dyn Directory>, config: SignalConfig) -> Self {
        Self {
            store,
            directory,
            config,
        }
    }

    /// Idempotent device bootstrap.
    ///
    /// The device id and identity are created once and never replaced. Each
    /// call rotates the signed prekey, adds a fresh batch of one-time prekeys
    /// and republishes the bundle. Keys generated before a failed publish are
    /// kept, so a retry is harmless.
    pub async fn init_device(&self) -> Result<DeviceRegistration> {
        let device_id = match self.store.identity.device_id()? {
            Some(id) => id,
            None => {
                let id = generate_device_id();
                self.store.identity.set_device_id(&id)?;
                id
            }
        };

        let identity = match self.store.identity.load_identity_key_pair()? {
            Some(identity) => identity,
            None => {
                let identity = IdentityKeyPair::generate();
                self.store.identity.store_identity(&identity)?;
                self.store
                    .identity
                    .set_registration_id(IdentityStore::generate_registration_id())?;
                tracing::info!(%device_id, "generated device identity");
                identity
            }
        };
        let registration_id = match self.store.identity.load_registration_id()? {
            Some(id) => id,
            None => {
                let id = IdentityStore::generate_registration_id();
                self.store.identity.set_registration_id(id)?;
                id
            }
        };

        let signed_prekey_id = self.store.signed_prekeys.next_id()?;
        let signed_prekey = SignedPreKeyRecord::generate(&identity, signed_prekey_id);
        self.store.signed_prekeys.store(&signed_prekey)?;
        let pruned = self
            .store
            .signed_prekeys
            .prune(self.config.signed_prekey_retention)?;
        if !pruned.is_empty() {
            tracing::debug!(?pruned, "pruned old signed prekeys");
        }

        let one_time = self
            .store
            .prekeys
            .generate_batch(self.config.one_time_prekey_batch)?;

        let request = RegisterDeviceRequest {
            device_id: device_id.clone(),
            registration_id,
            identity_key_public: identity.public_key_bytes().to_vec(),
            signed_pre_key: signed_prekey.to_public(),
            one_time_pre_keys: one_time.iter().map(|k| k.to_public()).collect(),
        };
        self.directory
            .register_device(&request)
            .await
            .map_err(|e| SignalError::RegistrationFailed(e.to_string()))?;

        tracing::info!(
            %device_id,
            signed_prekey_id,
            prekeys = one_time.len(),
            "device bundle published"
        );

        Ok(DeviceRegistration {
            device_id,
            registration_id,
            signed_prekey_id,
            one_time_prekey_ids: one_time.iter().map(|k| k.key_id).collect(),
        })
    }

    /// Top up the directory's one-time prekey pool when it runs low.
    ///
    /// Never fails: errors are logged and reported as [`ReplenishOutcome::Failed`].
    pub async fn replenish_if_needed(&self, threshold: u32, batch_size: u32) -> ReplenishOutcome {
        match self.try_replenish(threshold, batch_size).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, "prekey replenishment failed");
                ReplenishOutcome::Failed(e.to_string())
            }
        }
    }

    /// [`Self::replenish_if_needed`] with the configured threshold and batch.
    pub async fn replenish(&self) -> ReplenishOutcome {
        self.replenish_if_needed(self.config.replenish_threshold, self.config.replenish_batch)
            .await
    }

    async fn try_replenish(&self, threshold: u32, batch_size: u32) -> Result<ReplenishOutcome> {
        let Some(device_id) = self.store.identity.device_id()? else {
            return Ok(ReplenishOutcome::NoDevice);
        };

        let remaining = self.directory.prekey_count(&device_id).await?;
        if remaining >= threshold {
            return Ok(ReplenishOutcome::NotNeeded { remaining });
        }

        let batch = self.store.prekeys.generate_batch(batch_size)?;
        let request = ReplenishRequest {
            device_id,
            one_time_pre_keys: batch.iter().map(|k| k.to_public()).collect(),
        };
        self.directory.replenish_prekeys(&request).await?;

        tracing::info!(remaining, submitted = batch_size, "replenished one-time prekeys");
        Ok(ReplenishOutcome::Replenished {
            submitted: batch_size,
        })
    }
}

/// Opaque random device id: 16 random bytes, hex encoded.
fn generate_device_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::memory_directory::MemoryDirectory;

    fn manager(directory: &MemoryDirectory, user: &str) -> (DeviceManager, SignalStore) {
        let store = SignalStore::in_memory();
        let manager = DeviceManager::new(
            store.clone(),
            Arc::new(directory.for_user(user)),
            SignalConfig::default(),
        );
        (manager, store)
    }

    #[tokio::test]
    async fn init_publishes_full_batch() {
        let directory = MemoryDirectory::new();
        let (alice, store) = manager(&directory, "alice");

        let registration = alice.init_device().await.unwrap();
        assert_eq!(registration.device_id.len(), 32);
        assert_eq!(registration.one_time_prekey_ids.len(), 20);
        assert_eq!(directory.remaining_prekeys("alice").unwrap(), 20);
        assert_eq!(store.prekeys.ids().unwrap().len(), 20);
        assert!((1..=0x3FFC).contains(&registration.registration_id));
    }

    #[tokio::test]
    async fn failed_publish_keeps_local_keys() {
        let directory = MemoryDirectory::new();
        let (alice, store) = manager(&directory, "alice");
        directory.set_reject_registrations(true);

        let err = alice.init_device().await.unwrap_err();
        assert!(matches!(err, SignalError::RegistrationFailed(_)));
        assert!(err.is_retryable());
        let identity = store.identity.identity_key_pair().unwrap().public_key_bytes();

        directory.set_reject_registrations(false);
        alice.init_device().await.unwrap();
        assert_eq!(
            store.identity.identity_key_pair().unwrap().public_key_bytes(),
            identity
        );
    }

    #[tokio::test]
    async fn replenish_skips_when_pool_is_healthy() {
        let directory = MemoryDirectory::new();
        let (alice, _) = manager(&directory, "alice");
        assert_eq!(alice.replenish_if_needed(5, 20).await, ReplenishOutcome::NoDevice);

        alice.init_device().await.unwrap();
        assert_eq!(
            alice.replenish_if_needed(5, 20).await,
            ReplenishOutcome::NotNeeded { remaining: 20 }
        );
    }

    #[tokio::test]
    async fn replenish_swallows_directory_errors() {
        let directory = MemoryDirectory::new();
        let (alice, store) = manager(&directory, "alice");
        // A device id the directory has never seen is refused.
        store.identity.set_device_id("unregistered").unwrap();

        assert!(matches!(
            alice.replenish_if_needed(5, 20).await,
            ReplenishOutcome::Failed(_)
        ));
    }
}
