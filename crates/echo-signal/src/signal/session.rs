//! X3DH session establishment, both directions.
//!
//! The initiator runs the handshake against a fetched bundle and stores a
//! session whose messages carry the handshake parameters. The responder
//! repeats the agreement from those parameters when the first message
//! arrives.

use std::sync::Arc;

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::config::SignalConfig;
use crate::error::{Result, SignalError};
use crate::identity::IdentityKeyPair;
use crate::signal::address::ProtocolAddress;
use crate::signal::directory::Directory;
use crate::signal::envelope::PreKeyMessage;
use crate::signal::locks::AddressLocks;
use crate::signal::prekeys::PreKeyBundle;
use crate::signal::ratchet::{kdf_x3dh, PendingPreKey, SessionInit, SessionState};
use crate::signal::store::SignalStore;

#[derive(Clone)]
pub struct SessionEstablisher {
    store: SignalStore,
    directory: Arc<dyn Directory>,
    config: SignalConfig,
}

impl SessionEstablisher {
    pub fn new(store: SignalStore, directory: Arc<dyn Directory>, config: SignalConfig) -> Self {
        Self {
            store,
            directory,
            config,
        }
    }

    pub fn store(&self) -> &SignalStore {
        &self.store
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    /// Session locks of the underlying store.
    pub fn locks(&self) -> &AddressLocks {
        self.store.locks()
    }

    /// Session address for a peer user id. One device per peer.
    pub fn peer_address(&self, user_id: &str) -> ProtocolAddress {
        ProtocolAddress::new(user_id, self.config.peer_device_index)
    }

    /// Fetch `peer`'s bundle (consuming one of its one-time prekeys) and
    /// start a fresh session, replacing any existing one.
    pub async fn ensure_session_with_peer(&self, peer: &str) -> Result<ProtocolAddress> {
        let bundle = self.directory.fetch_bundle(peer).await?;
        let address = self.peer_address(&bundle.user_id);

        let _guard = self.locks().lock(&address).await;
        self.establish_from_bundle(&address, &bundle)?;
        Ok(address)
    }

    /// Initiator-side X3DH. The caller holds the address lock.
    pub(crate) fn establish_from_bundle(
        &self,
        address: &ProtocolAddress,
        bundle: &PreKeyBundle,
    ) -> Result<SessionState> {
        let spk = &bundle.signed_pre_key;
        IdentityKeyPair::verify(&bundle.identity_key_public, &spk.public_key, &spk.signature)
            .map_err(|e| match e {
                SignalError::InvalidKey(reason) => SignalError::SessionEstablishmentFailed(reason),
                other => other,
            })?;
        self.store.trust.check(address, &bundle.identity_key_public)?;

        let identity = self.store.identity.identity_key_pair()?;
        let remote_identity = key32(&bundle.identity_key_public, "identity key")?;
        let their_identity = IdentityKeyPair::peer_x25519_public(&remote_identity)?;
        let their_signed_prekey = key32(&spk.public_key, "signed prekey")?;
        let their_one_time = key32(&bundle.one_time_pre_key.public_key, "one-time prekey")?;

        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let base_key = X25519Public::from(&ephemeral).to_bytes();
        let spk_public = X25519Public::from(their_signed_prekey);

        let dh1 = identity.to_x25519_secret().diffie_hellman(&spk_public);
        let dh2 = ephemeral.diffie_hellman(&their_identity);
        let dh3 = ephemeral.diffie_hellman(&spk_public);
        let dh4 = ephemeral.diffie_hellman(&X25519Public::from(their_one_time));
        let shared_secret = kdf_x3dh(&[dh1.as_bytes(), dh2.as_bytes(), dh3.as_bytes(), dh4.as_bytes()])?;

        let init = SessionInit {
            address: address.to_string(),
            remote_identity,
            remote_registration_id: bundle.registration_id,
            associated_data: associated_data(&identity.public_key_bytes(), &remote_identity),
            base_key,
            shared_secret,
        };
        let pending = PendingPreKey {
            signed_prekey_id: spk.key_id,
            one_time_prekey_id: Some(bundle.one_time_pre_key.key_id),
        };
        let state = SessionState::initiator(init, their_signed_prekey, pending)?;

        self.store.sessions.store(address, &state)?;
        self.store.trust.save(address, &bundle.identity_key_public)?;
        tracing::info!(
            %address,
            signed_prekey_id = spk.key_id,
            one_time_prekey_id = bundle.one_time_pre_key.key_id,
            "session established"
        );
        Ok(state)
    }

    /// Responder side: decrypt a handshake-carrying message, creating the
    /// session on first receipt. The caller holds the address lock.
    ///
    /// Nothing is persisted unless decryption succeeds; the one-time prekey
    /// is deleted at that point. A handshake with a new base key replaces
    /// any existing session, so two peers that initiate at the same time
    /// overwrite each other until one side re-establishes.
    ///
    /// Prekey ids come from the peer: one that no longer exists here
    /// (pruned, or already consumed) fails this message only.
    pub(crate) fn process_prekey_message(
        &self,
        address: &ProtocolAddress,
        message: &PreKeyMessage,
    ) -> Result<Vec<u8>> {
        let max_skip = self.config.max_skipped_message_keys;

        // The initiator repeats the handshake until we reply.
        if let Some(mut existing) = self.store.sessions.load(address)? {
            if existing.base_key() == &message.base_key {
                let plaintext = existing.decrypt(&message.message, max_skip)?;
                self.store.sessions.store(address, &existing)?;
                return Ok(plaintext);
            }
        }

        self.store.trust.check(address, &message.identity_key)?;

        let identity = self.store.identity.identity_key_pair()?;
        let signed_prekey = self
            .store
            .signed_prekeys
            .get(message.signed_prekey_id)?
            .ok_or_else(|| {
                SignalError::DecryptionFailed(format!(
                    "unknown signed prekey {}",
                    message.signed_prekey_id
                ))
            })?
            .secret()?;
        let one_time = match message.one_time_prekey_id {
            Some(key_id) => {
                let record = self.store.prekeys.load(key_id)?.ok_or_else(|| {
                    SignalError::DecryptionFailed(format!("unknown one-time prekey {key_id}"))
                })?;
                Some(record.secret()?)
            }
            None => None,
        };

        let their_identity = IdentityKeyPair::peer_x25519_public(&message.identity_key)?;
        let their_base = X25519Public::from(message.base_key);

        let dh1 = signed_prekey.diffie_hellman(&their_identity);
        let dh2 = identity.to_x25519_secret().diffie_hellman(&their_base);
        let dh3 = signed_prekey.diffie_hellman(&their_base);
        let dh4 = one_time.as_ref().map(|secret| secret.diffie_hellman(&their_base));

        let mut outputs = vec![dh1.as_bytes(), dh2.as_bytes(), dh3.as_bytes()];
        if let Some(dh4) = &dh4 {
            outputs.push(dh4.as_bytes());
        }
        let shared_secret = kdf_x3dh(&outputs)?;

        let init = SessionInit {
            address: address.to_string(),
            remote_identity: message.identity_key,
            remote_registration_id: message.registration_id,
            associated_data: associated_data(&message.identity_key, &identity.public_key_bytes()),
            base_key: message.base_key,
            shared_secret,
        };
        let mut state = SessionState::responder(init, &signed_prekey);
        let plaintext = state.decrypt(&message.message, max_skip)?;

        self.store.sessions.store(address, &state)?;
        if let Some(key_id) = message.one_time_prekey_id {
            self.store.prekeys.take(key_id)?;
        }
        self.store.trust.save(address, &message.identity_key)?;
        tracing::info!(
            %address,
            signed_prekey_id = message.signed_prekey_id,
            one_time_prekey_id = ?message.one_time_prekey_id,
            "session accepted"
        );
        Ok(plaintext)
    }
}

/// Initiator identity || responder identity.
fn associated_data(initiator: &[u8; 32], responder: &[u8; 32]) -> [u8; 64] {
    let mut ad = [0u8; 64];
    ad[..32].copy_from_slice(initiator);
    ad[32..].copy_from_slice(responder);
    ad
}

fn key32(bytes: &[u8], what: &str) -> Result<[u8; 32]> {
    <[u8; 32]>::try_from(bytes)
        .map_err(|_| SignalError::SessionEstablishmentFailed(format!("{what} must be 32 bytes")))
}
