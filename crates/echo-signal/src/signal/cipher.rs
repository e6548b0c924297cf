use crate::error::{Result, SignalError};
use crate::signal::address::ProtocolAddress;
use crate::signal::directory::DirectoryError;
use crate::signal::envelope::{CiphertextEnvelope, EnvelopeKind, PreKeyMessage, RatchetMessage};
use crate::signal::session::SessionEstablisher;

/// Shown in place of a message that cannot be decrypted.
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "unable to decrypt";

/// Plaintext <-> envelope strings, advancing the ratchet on each call.
#[derive(Clone)]
pub struct MessageCipher {
    sessions: SessionEstablisher,
}

impl MessageCipher {
    pub fn new(sessions: SessionEstablisher) -> Self {
        Self { sessions }
    }

    /// Encrypt `plaintext` for `peer`, establishing a session first if
    /// none exists.
    ///
    /// Until the peer replies, the envelope carries the handshake
    /// (`"3:..."`); afterwards it is a plain ratchet message (`"1:..."`).
    /// A peer without published key material yields
    /// [`SignalError::PeerNotReady`].
    pub async fn encrypt_for_peer(&self, peer: &str, plaintext: &[u8]) -> Result<String> {
        let directory = self.sessions.directory();
        let identity = directory.fetch_identity(peer).await.map_err(peer_not_ready)?;
        let address = self.sessions.peer_address(&identity.user_id);

        let _guard = self.sessions.locks().lock(&address).await;
        let store = self.sessions.store();
        let mut state = match store.sessions.load(&address)? {
            Some(state) => state,
            None => {
                let bundle = directory.fetch_bundle(peer).await.map_err(peer_not_ready)?;
                self.sessions.establish_from_bundle(&address, &bundle)?
            }
        };

        let message = state.encrypt(plaintext)?;
        let envelope = match state.pending_prekey() {
            Some(pending) => CiphertextEnvelope {
                kind: EnvelopeKind::PreKey,
                payload: PreKeyMessage {
                    registration_id: store.identity.registration_id()?,
                    identity_key: store.identity.identity_key_pair()?.public_key_bytes(),
                    base_key: *state.base_key(),
                    signed_prekey_id: pending.signed_prekey_id,
                    one_time_prekey_id: pending.one_time_prekey_id,
                    message,
                }
                .to_bytes(),
            },
            None => CiphertextEnvelope {
                kind: EnvelopeKind::Ratchet,
                payload: message.to_bytes(),
            },
        };
        store.sessions.store(&address, &state)?;

        tracing::debug!(%address, kind = ?envelope.kind, "encrypted message");
        Ok(envelope.encode())
    }

    /// Decrypt an envelope received from `peer`.
    ///
    /// Handshake envelopes create the session as a side effect. Malformed
    /// input, a missing session and authentication failures are all
    /// [`SignalError::DecryptionFailed`]; the session is left untouched.
    pub async fn decrypt_from_peer(&self, peer: &str, envelope: &str) -> Result<Vec<u8>> {
        let envelope: CiphertextEnvelope = envelope.parse()?;
        let identity = self.sessions.directory().fetch_identity(peer).await?;
        let address = self.sessions.peer_address(&identity.user_id);

        let _guard = self.sessions.locks().lock(&address).await;
        let plaintext = match envelope.kind {
            EnvelopeKind::PreKey => {
                let message = PreKeyMessage::from_bytes(&envelope.payload)?;
                if message.identity_key.as_slice() != identity.identity_key_public.as_slice() {
                    return Err(SignalError::DecryptionFailed(
                        "sender identity does not match directory".into(),
                    ));
                }
                self.sessions.process_prekey_message(&address, &message)?
            }
            EnvelopeKind::Ratchet => self.decrypt_ratchet(&address, &envelope.payload)?,
        };

        tracing::debug!(%address, kind = ?envelope.kind, "decrypted message");
        Ok(plaintext)
    }

    /// Like [`Self::decrypt_from_peer`] for display: text out, with
    /// [`UNDECRYPTABLE_PLACEHOLDER`] standing in for a message that fails to
    /// decrypt. Other errors still propagate.
    pub async fn decrypt_or_placeholder(&self, peer: &str, envelope: &str) -> Result<String> {
        match self.decrypt_from_peer(peer, envelope).await {
            Ok(plaintext) => Ok(String::from_utf8_lossy(&plaintext).into_owned()),
            Err(SignalError::DecryptionFailed(reason)) => {
                tracing::warn!(peer, %reason, "message could not be decrypted");
                Ok(UNDECRYPTABLE_PLACEHOLDER.to_string())
            }
            Err(e) => Err(e),
        }
    }

    fn decrypt_ratchet(&self, address: &ProtocolAddress, payload: &[u8]) -> Result<Vec<u8>> {
        let message = RatchetMessage::from_bytes(payload)?;
        let store = self.sessions.store();
        let mut state = store
            .sessions
            .load(address)?
            .ok_or_else(|| SignalError::DecryptionFailed(format!("no session with {address}")))?;
        let plaintext = state.decrypt(&message, self.sessions.config().max_skipped_message_keys)?;
        store.sessions.store(address, &state)?;
        Ok(plaintext)
    }
}

/// Missing peer material during a send is reported as a single user-facing error.
fn peer_not_ready(e: DirectoryError) -> SignalError {
    let e = SignalError::from(e);
    if e.is_peer_not_ready() {
        SignalError::PeerNotReady
    } else {
        e
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::SignalConfig;
    use crate::signal::device::DeviceManager;
    use crate::signal::directory::Directory;
    use crate::signal::memory_directory::MemoryDirectory;
    use crate::signal::store::SignalStore;

    async fn cipher(directory: &MemoryDirectory, user: &str) -> (MessageCipher, SignalStore) {
        let store = SignalStore::in_memory();
        let dir: Arc<dyn Directory> = Arc::new(directory.for_user(user));
        let config = SignalConfig::default();
        DeviceManager::new(store.clone(), Arc::clone(&dir), config.clone())
            .init_device()
            .await
            .unwrap();
        let sessions = SessionEstablisher::new(store.clone(), dir, config);
        (MessageCipher::new(sessions), store)
    }

    #[tokio::test]
    async fn handshake_envelopes_until_first_reply() {
        let directory = MemoryDirectory::new();
        let (alice, _) = cipher(&directory, "alice").await;
        let (bob, _) = cipher(&directory, "bob").await;

        let first = alice.encrypt_for_peer("bob", b"one").await.unwrap();
        let second = alice.encrypt_for_peer("bob", b"two").await.unwrap();
        assert!(first.starts_with("3:"));
        assert!(second.starts_with("3:"));
        // Only the first send fetched a bundle.
        assert_eq!(directory.remaining_prekeys("bob").unwrap(), 19);

        assert_eq!(bob.decrypt_from_peer("alice", &first).await.unwrap(), b"one");
        assert_eq!(bob.decrypt_from_peer("alice", &second).await.unwrap(), b"two");

        let reply = bob.encrypt_for_peer("alice", b"ack").await.unwrap();
        assert!(reply.starts_with("1:"));
        assert_eq!(alice.decrypt_from_peer("bob", &reply).await.unwrap(), b"ack");

        let third = alice.encrypt_for_peer("bob", b"three").await.unwrap();
        assert!(third.starts_with("1:"));
        assert_eq!(bob.decrypt_from_peer("alice", &third).await.unwrap(), b"three");
    }

    #[tokio::test]
    async fn unknown_peer_is_not_ready() {
        let directory = MemoryDirectory::new();
        let (alice, _) = cipher(&directory, "alice").await;
        let _carol = directory.for_user("carol");

        for peer in ["nobody", "carol"] {
            let err = alice.encrypt_for_peer(peer, b"hi").await.unwrap_err();
            assert!(matches!(err, SignalError::PeerNotReady), "{peer}: {err:?}");
        }
    }

    #[tokio::test]
    async fn ratchet_message_without_session_fails_cleanly() {
        let directory = MemoryDirectory::new();
        let (alice, _) = cipher(&directory, "alice").await;
        let (bob, _) = cipher(&directory, "bob").await;
        let (carol, _) = cipher(&directory, "carol").await;

        let first = alice.encrypt_for_peer("bob", b"hi").await.unwrap();
        bob.decrypt_from_peer("alice", &first).await.unwrap();
        let reply = bob.encrypt_for_peer("alice", b"ratchet").await.unwrap();

        // Carol never talked to Bob.
        let err = carol.decrypt_from_peer("bob", &reply).await.unwrap_err();
        assert!(matches!(err, SignalError::DecryptionFailed(_)));
        assert_eq!(
            carol.decrypt_or_placeholder("bob", &reply).await.unwrap(),
            UNDECRYPTABLE_PLACEHOLDER
        );
    }

    #[tokio::test]
    async fn impersonated_handshake_is_rejected() {
        let directory = MemoryDirectory::new();
        let (alice, _) = cipher(&directory, "alice").await;
        let (bob, bob_store) = cipher(&directory, "bob").await;
        let _mallory = cipher(&directory, "mallory").await;

        let first = alice.encrypt_for_peer("bob", b"from alice").await.unwrap();
        // Claimed to come from mallory, but the key inside is alice's.
        let err = bob.decrypt_from_peer("mallory", &first).await.unwrap_err();
        assert!(matches!(err, SignalError::DecryptionFailed(_)));
        assert!(bob_store.sessions.addresses().unwrap().is_empty());
    }
}
