use std::sync::Arc;

use crate::config::SignalConfig;
use crate::error::Result;
use crate::safety::SafetyNumbers;
use crate::signal::{
    DeviceManager, DeviceRegistration, Directory, MessageCipher, ProtocolAddress,
    ReplenishOutcome, SessionEstablisher, SignalStore,
};

/// One device's end-to-end messaging stack over a shared store and directory.
#[derive(Clone)]
pub struct DmClient {
    store: SignalStore,
    devices: DeviceManager,
    sessions: SessionEstablisher,
    cipher: MessageCipher,
    safety: SafetyNumbers,
}

impl DmClient {
    pub fn new(store: SignalStore, directory: Arc<dyn Directory>, config: SignalConfig) -> Self {
        let devices = DeviceManager::new(store.clone(), Arc::clone(&directory), config.clone());
        let sessions = SessionEstablisher::new(store.clone(), Arc::clone(&directory), config);
        let cipher = MessageCipher::new(sessions.clone());
        let safety = SafetyNumbers::new(store.clone(), directory);
        Self {
            store,
            devices,
            sessions,
            cipher,
            safety,
        }
    }

    pub fn store(&self) -> &SignalStore {
        &self.store
    }

    pub async fn init_device(&self) -> Result<DeviceRegistration> {
        self.devices.init_device().await
    }

    /// Best-effort top-up with the configured threshold and batch size.
    pub async fn replenish(&self) -> ReplenishOutcome {
        self.devices.replenish().await
    }

    pub async fn replenish_if_needed(&self, threshold: u32, batch_size: u32) -> ReplenishOutcome {
        self.devices.replenish_if_needed(threshold, batch_size).await
    }

    pub async fn ensure_session_with_peer(&self, peer: &str) -> Result<ProtocolAddress> {
        self.sessions.ensure_session_with_peer(peer).await
    }

    pub async fn encrypt_for_peer(&self, peer: &str, plaintext: &[u8]) -> Result<String> {
        self.cipher.encrypt_for_peer(peer, plaintext).await
    }

    pub async fn send_text(&self, peer: &str, text: &str) -> Result<String> {
        self.cipher.encrypt_for_peer(peer, text.as_bytes()).await
    }

    pub async fn decrypt_from_peer(&self, peer: &str, envelope: &str) -> Result<Vec<u8>> {
        self.cipher.decrypt_from_peer(peer, envelope).await
    }

    /// Decrypted text, or the placeholder for an undecryptable message.
    pub async fn read_text(&self, peer: &str, envelope: &str) -> Result<String> {
        self.cipher.decrypt_or_placeholder(peer, envelope).await
    }

    pub async fn safety_number(&self, peer: &str) -> Result<String> {
        self.safety.for_peer(peer).await
    }

    /// Accept `peer`'s current identity key as verified out of band.
    pub async fn mark_verified(&self, peer: &str) -> Result<()> {
        let identity = self.sessions.directory().fetch_identity(peer).await?;
        let address = self.sessions.peer_address(&identity.user_id);
        self.store
            .trust
            .mark_verified(&address, &identity.identity_key_public)
    }

    pub async fn reset_all_sessions(&self) -> Result<()> {
        self.store.reset_all_sessions().await
    }
}
