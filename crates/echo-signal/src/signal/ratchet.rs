//! Session record: X3DH output plus Double Ratchet state.
//!
//! Every message key comes from a symmetric chain that is advanced and
//! discarded after use; every change of speaker runs a DH ratchet step that
//! re-seeds both chains from fresh X25519 output. Message keys for skipped
//! counters are kept (bounded) so out-of-order delivery still decrypts.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, SignalError};
use crate::signal::envelope::RatchetMessage;

const RECORD_VERSION: u8 = 1;

const ROOT_KDF_INFO: &[u8] = b"EchoRatchetRoot";
const MSG_KEY_INFO: &[u8] = b"EchoMsgKey";
const CHAIN_KEY_INFO: &[u8] = b"EchoChainKey";
const AEAD_KEY_INFO: &[u8] = b"EchoMessageKeys";

/// Prekeys the initiator used; repeated in every message until the peer replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Zeroize)]
pub struct PendingPreKey {
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
}

#[derive(Clone, Zeroize)]
struct SkippedKey {
    ratchet_key: [u8; 32],
    counter: u32,
    message_key: [u8; 32],
}

/// Parameters fixed at session creation.
pub(crate) struct SessionInit {
    pub address: String,
    pub remote_identity: [u8; 32],
    pub remote_registration_id: u32,
    /// Initiator identity || responder identity.
    pub associated_data: [u8; 64],
    /// The initiator's X3DH ephemeral public key.
    pub base_key: [u8; 32],
    pub shared_secret: [u8; 32],
}

/// Everything needed to keep talking to one peer address.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionState {
    address: String,
    remote_identity: [u8; 32],
    remote_registration_id: u32,
    associated_data: [u8; 64],
    base_key: [u8; 32],
    root_key: [u8; 32],
    dh_self_secret: [u8; 32],
    dh_remote: Option<[u8; 32]>,
    sending_chain_key: Option<[u8; 32]>,
    receiving_chain_key: Option<[u8; 32]>,
    send_counter: u32,
    recv_counter: u32,
    previous_send_counter: u32,
    skipped: Vec<SkippedKey>,
    pending_prekey: Option<PendingPreKey>,
}

impl SessionState {
    /// Initiator side: we already know the responder's signed prekey, so the
    /// sending chain exists immediately.
    pub(crate) fn initiator(
        init: SessionInit,
        their_signed_prekey: [u8; 32],
        pending: PendingPreKey,
    ) -> Result<Self> {
        let dh_self = StaticSecret::random_from_rng(OsRng);
        let dh_out = dh_self.diffie_hellman(&X25519Public::from(their_signed_prekey));
        let (root_key, sending_chain_key) = kdf_root(&init.shared_secret, dh_out.as_bytes())?;

        Ok(Self {
            address: init.address.clone(),
            remote_identity: init.remote_identity,
            remote_registration_id: init.remote_registration_id,
            associated_data: init.associated_data,
            base_key: init.base_key,
            root_key,
            dh_self_secret: dh_self.to_bytes(),
            dh_remote: Some(their_signed_prekey),
            sending_chain_key: Some(sending_chain_key),
            receiving_chain_key: None,
            send_counter: 0,
            recv_counter: 0,
            previous_send_counter: 0,
            skipped: Vec::new(),
            pending_prekey: Some(pending),
        })
    }

    /// Responder side: our signed prekey doubles as the first ratchet key.
    /// Chains appear on the first received message.
    pub(crate) fn responder(init: SessionInit, our_signed_prekey: &StaticSecret) -> Self {
        Self {
            address: init.address.clone(),
            remote_identity: init.remote_identity,
            remote_registration_id: init.remote_registration_id,
            associated_data: init.associated_data,
            base_key: init.base_key,
            root_key: init.shared_secret,
            dh_self_secret: our_signed_prekey.to_bytes(),
            dh_remote: None,
            sending_chain_key: None,
            receiving_chain_key: None,
            send_counter: 0,
            recv_counter: 0,
            previous_send_counter: 0,
            skipped: Vec::new(),
            pending_prekey: None,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn remote_identity(&self) -> &[u8; 32] {
        &self.remote_identity
    }

    pub fn remote_registration_id(&self) -> u32 {
        self.remote_registration_id
    }

    pub fn base_key(&self) -> &[u8; 32] {
        &self.base_key
    }

    /// `Some` until the peer's first reply confirms the handshake.
    pub fn pending_prekey(&self) -> Option<PendingPreKey> {
        self.pending_prekey
    }

    /// Encrypt under the next sending message key.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetMessage> {
        let chain_key = self
            .sending_chain_key
            .ok_or_else(|| SignalError::EncryptionFailed("no sending chain".into()))?;
        let (message_key, next_chain_key) = kdf_chain(&chain_key)?;

        let mut message = RatchetMessage {
            ratchet_key: X25519Public::from(&StaticSecret::from(self.dh_self_secret)).to_bytes(),
            previous_counter: self.previous_send_counter,
            counter: self.send_counter,
            ciphertext: Vec::new(),
        };
        let ad = self.message_ad(&message);
        message.ciphertext = seal(&message_key, &ad, plaintext)?;

        self.sending_chain_key = Some(next_chain_key);
        self.send_counter = self
            .send_counter
            .checked_add(1)
            .ok_or_else(|| SignalError::EncryptionFailed("sending chain exhausted".into()))?;
        Ok(message)
    }

    /// Decrypt a received message, running a DH ratchet step when the
    /// sender's ratchet key changed.
    ///
    /// Mutates the state even on failure; callers decrypt on a copy and only
    /// persist it on success.
    pub fn decrypt(&mut self, message: &RatchetMessage, max_skip: u32) -> Result<Vec<u8>> {
        let ad = self.message_ad(message);

        if let Some(pos) = self
            .skipped
            .iter()
            .position(|k| k.ratchet_key == message.ratchet_key && k.counter == message.counter)
        {
            let skipped = self.skipped.remove(pos);
            let plaintext = open(&skipped.message_key, &ad, &message.ciphertext)?;
            self.pending_prekey = None;
            return Ok(plaintext);
        }

        if self.dh_remote != Some(message.ratchet_key) {
            self.skip_message_keys(message.previous_counter, max_skip)?;
            self.dh_ratchet(message.ratchet_key)?;
        } else if message.counter < self.recv_counter {
            return Err(SignalError::DecryptionFailed(
                "duplicate or expired message".into(),
            ));
        }

        self.skip_message_keys(message.counter, max_skip)?;

        let chain_key = self
            .receiving_chain_key
            .ok_or_else(|| SignalError::DecryptionFailed("no receiving chain".into()))?;
        let (message_key, next_chain_key) = kdf_chain(&chain_key)?;
        let plaintext = open(&message_key, &ad, &message.ciphertext)?;

        self.receiving_chain_key = Some(next_chain_key);
        self.recv_counter = self.recv_counter.saturating_add(1);
        self.pending_prekey = None;
        Ok(plaintext)
    }

    fn dh_ratchet(&mut self, their_ratchet_key: [u8; 32]) -> Result<()> {
        let their_public = X25519Public::from(their_ratchet_key);

        self.previous_send_counter = self.send_counter;
        self.send_counter = 0;
        self.recv_counter = 0;
        self.dh_remote = Some(their_ratchet_key);

        let dh_out = StaticSecret::from(self.dh_self_secret).diffie_hellman(&their_public);
        let (root_key, receiving_chain_key) = kdf_root(&self.root_key, dh_out.as_bytes())?;

        let next_self = StaticSecret::random_from_rng(OsRng);
        let dh_out = next_self.diffie_hellman(&their_public);
        let (root_key, sending_chain_key) = kdf_root(&root_key, dh_out.as_bytes())?;

        self.root_key = root_key;
        self.receiving_chain_key = Some(receiving_chain_key);
        self.sending_chain_key = Some(sending_chain_key);
        self.dh_self_secret = next_self.to_bytes();
        Ok(())
    }

    fn skip_message_keys(&mut self, until: u32, max_skip: u32) -> Result<()> {
        let (Some(mut chain_key), Some(remote)) = (self.receiving_chain_key, self.dh_remote) else {
            return Ok(());
        };
        if until > self.recv_counter.saturating_add(max_skip) {
            return Err(SignalError::DecryptionFailed(
                "too many skipped messages".into(),
            ));
        }

        let limit = usize::try_from(max_skip).unwrap_or(usize::MAX);
        while self.recv_counter < until {
            let (message_key, next_chain_key) = kdf_chain(&chain_key)?;
            self.skipped.push(SkippedKey {
                ratchet_key: remote,
                counter: self.recv_counter,
                message_key,
            });
            if self.skipped.len() > limit {
                self.skipped.remove(0);
            }
            chain_key = next_chain_key;
            self.recv_counter += 1;
        }
        self.receiving_chain_key = Some(chain_key);
        Ok(())
    }

    fn message_ad(&self, message: &RatchetMessage) -> Vec<u8> {
        let mut ad = Vec::with_capacity(64 + RatchetMessage::HEADER_LEN);
        ad.extend_from_slice(&self.associated_data);
        ad.extend_from_slice(&message.header_bytes());
        ad
    }

    /// Binary record for the session store.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(512);
        data.push(RECORD_VERSION);
        let address_len = u32::try_from(self.address.len())
            .map_err(|_| SignalError::Serialization("address too long".into()))?;
        data.extend_from_slice(&address_len.to_le_bytes());
        data.extend_from_slice(self.address.as_bytes());
        data.extend_from_slice(&self.remote_identity);
        data.extend_from_slice(&self.remote_registration_id.to_le_bytes());
        data.extend_from_slice(&self.associated_data);
        data.extend_from_slice(&self.base_key);
        data.extend_from_slice(&self.root_key);
        data.extend_from_slice(&self.dh_self_secret);
        put_optional_key(&mut data, self.dh_remote.as_ref());
        put_optional_key(&mut data, self.sending_chain_key.as_ref());
        put_optional_key(&mut data, self.receiving_chain_key.as_ref());
        data.extend_from_slice(&self.send_counter.to_le_bytes());
        data.extend_from_slice(&self.recv_counter.to_le_bytes());
        data.extend_from_slice(&self.previous_send_counter.to_le_bytes());

        let skipped_len = u32::try_from(self.skipped.len())
            .map_err(|_| SignalError::Serialization("too many skipped keys".into()))?;
        data.extend_from_slice(&skipped_len.to_le_bytes());
        for key in &self.skipped {
            data.extend_from_slice(&key.ratchet_key);
            data.extend_from_slice(&key.counter.to_le_bytes());
            data.extend_from_slice(&key.message_key);
        }

        match self.pending_prekey {
            Some(pending) => {
                data.push(1);
                data.extend_from_slice(&pending.signed_prekey_id.to_le_bytes());
                match pending.one_time_prekey_id {
                    Some(id) => {
                        data.push(1);
                        data.extend_from_slice(&id.to_le_bytes());
                    }
                    None => data.push(0),
                }
            }
            None => data.push(0),
        }
        Ok(data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = RecordReader { data, pos: 0 };
        if r.u8()? != RECORD_VERSION {
            return Err(corrupt("unknown session record version"));
        }
        let address_len = usize::try_from(r.u32()?).map_err(|_| corrupt("address length"))?;
        let address = String::from_utf8(r.take(address_len)?.to_vec())
            .map_err(|_| corrupt("address is not UTF-8"))?;
        let remote_identity = r.array32()?;
        let remote_registration_id = r.u32()?;
        let mut associated_data = [0u8; 64];
        associated_data.copy_from_slice(r.take(64)?);
        let base_key = r.array32()?;
        let root_key = r.array32()?;
        let dh_self_secret = r.array32()?;
        let dh_remote = r.optional_key()?;
        let sending_chain_key = r.optional_key()?;
        let receiving_chain_key = r.optional_key()?;
        let send_counter = r.u32()?;
        let recv_counter = r.u32()?;
        let previous_send_counter = r.u32()?;

        let skipped_len = r.u32()?;
        let mut skipped = Vec::new();
        for _ in 0..skipped_len {
            skipped.push(SkippedKey {
                ratchet_key: r.array32()?,
                counter: r.u32()?,
                message_key: r.array32()?,
            });
        }

        let pending_prekey = match r.u8()? {
            0 => None,
            1 => {
                let signed_prekey_id = r.u32()?;
                let one_time_prekey_id = match r.u8()? {
                    0 => None,
                    1 => Some(r.u32()?),
                    _ => return Err(corrupt("bad one-time prekey flag")),
                };
                Some(PendingPreKey {
                    signed_prekey_id,
                    one_time_prekey_id,
                })
            }
            _ => return Err(corrupt("bad pending prekey flag")),
        };

        if r.pos != data.len() {
            return Err(corrupt("trailing bytes"));
        }

        Ok(Self {
            address,
            remote_identity,
            remote_registration_id,
            associated_data,
            base_key,
            root_key,
            dh_self_secret,
            dh_remote,
            sending_chain_key,
            receiving_chain_key,
            send_counter,
            recv_counter,
            previous_send_counter,
            skipped,
            pending_prekey,
        })
    }
}

/// X3DH output -> 32-byte shared secret.
pub(crate) fn kdf_x3dh(dh_outputs: &[&[u8; 32]]) -> Result<[u8; 32]> {
    // 0xFF prefix separates X25519 agreement from other uses of the curve.
    let mut ikm = Vec::with_capacity(32 * (dh_outputs.len() + 1));
    ikm.extend_from_slice(&[0xFF; 32]);
    for dh in dh_outputs {
        ikm.extend_from_slice(dh.as_slice());
    }
    let hk = Hkdf::<Sha256>::new(Some(&[0u8; 32][..]), &ikm);
    ikm.zeroize();

    let mut shared = [0u8; 32];
    hk.expand(b"EchoX3DH", &mut shared)
        .map_err(|e| SignalError::SessionEstablishmentFailed(format!("HKDF expand failed: {e}")))?;
    Ok(shared)
}

fn kdf_root(root_key: &[u8; 32], dh_out: &[u8; 32]) -> Result<([u8; 32], [u8; 32])> {
    let hk = Hkdf::<Sha256>::new(Some(root_key.as_slice()), dh_out);
    let mut okm = [0u8; 64];
    hk.expand(ROOT_KDF_INFO, &mut okm)
        .map_err(|e| SignalError::SessionEstablishmentFailed(format!("HKDF: {e}")))?;

    let mut next_root = [0u8; 32];
    let mut chain_key = [0u8; 32];
    next_root.copy_from_slice(&okm[..32]);
    chain_key.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok((next_root, chain_key))
}

/// Chain key -> (message key, next chain key).
fn kdf_chain(chain_key: &[u8; 32]) -> Result<([u8; 32], [u8; 32])> {
    let hk = Hkdf::<Sha256>::new(None, chain_key);
    let mut message_key = [0u8; 32];
    let mut next_chain_key = [0u8; 32];
    hk.expand(MSG_KEY_INFO, &mut message_key)
        .map_err(|e| SignalError::EncryptionFailed(format!("HKDF: {e}")))?;
    hk.expand(CHAIN_KEY_INFO, &mut next_chain_key)
        .map_err(|e| SignalError::EncryptionFailed(format!("HKDF: {e}")))?;
    Ok((message_key, next_chain_key))
}

/// Expand a message key into an AES-256 key and a 96-bit nonce.
fn aead_keys(message_key: &[u8; 32]) -> Result<(Aes256Gcm, [u8; 12])> {
    let hk = Hkdf::<Sha256>::new(None, message_key);
    let mut okm = [0u8; 44];
    hk.expand(AEAD_KEY_INFO, &mut okm)
        .map_err(|e| SignalError::EncryptionFailed(format!("HKDF: {e}")))?;
    let cipher = Aes256Gcm::new_from_slice(&okm[..32])
        .map_err(|e| SignalError::EncryptionFailed(e.to_string()))?;
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok((cipher, nonce))
}

fn seal(message_key: &[u8; 32], ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let (cipher, nonce) = aead_keys(message_key)?;
    cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: ad })
        .map_err(|e| SignalError::EncryptionFailed(e.to_string()))
}

fn open(message_key: &[u8; 32], ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let (cipher, nonce) = aead_keys(message_key)
        .map_err(|e| SignalError::DecryptionFailed(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad: ad })
        .map_err(|_| SignalError::DecryptionFailed("authentication tag mismatch".into()))
}

fn put_optional_key(data: &mut Vec<u8>, key: Option<&[u8; 32]>) {
    match key {
        Some(key) => {
            data.push(1);
            data.extend_from_slice(key);
        }
        None => data.push(0),
    }
}

fn corrupt(reason: &str) -> SignalError {
    SignalError::StorageCorruption(format!("session record: {reason}"))
}

struct RecordReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| corrupt("truncated"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn array32(&mut self) -> Result<[u8; 32]> {
        let mut out = [0u8; 32];
        out.copy_from_slice(self.take(32)?);
        Ok(out)
    }

    fn optional_key(&mut self) -> Result<Option<[u8; 32]>> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.array32()?)),
            _ => Err(corrupt("bad optional key flag")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_SKIP: u32 = 1000;

    /// Initiator and responder states sharing a secret, without X3DH.
    fn session_pair() -> (SessionState, SessionState) {
        let bob_spk = StaticSecret::random_from_rng(OsRng);
        let bob_spk_public = X25519Public::from(&bob_spk).to_bytes();
        let init = |address: &str| SessionInit {
            address: address.into(),
            remote_identity: [7u8; 32],
            remote_registration_id: 9,
            associated_data: [3u8; 64],
            base_key: [4u8; 32],
            shared_secret: [5u8; 32],
        };
        let pending = PendingPreKey {
            signed_prekey_id: 1,
            one_time_prekey_id: Some(1000),
        };

        let alice = SessionState::initiator(init("bob.1"), bob_spk_public, pending).unwrap();
        let bob = SessionState::responder(init("alice.1"), &bob_spk);
        (alice, bob)
    }

    #[test]
    fn conversation_in_both_directions() {
        let (mut alice, mut bob) = session_pair();

        for round in 0..3u8 {
            let m = alice.encrypt(&[round; 10]).unwrap();
            assert_eq!(bob.decrypt(&m, MAX_SKIP).unwrap(), vec![round; 10]);

            let r = bob.encrypt(b"ack").unwrap();
            assert_eq!(alice.decrypt(&r, MAX_SKIP).unwrap(), b"ack");
        }
        assert!(alice.pending_prekey().is_none());
    }

    #[test]
    fn message_keys_never_repeat() {
        let (mut alice, _) = session_pair();
        let m1 = alice.encrypt(b"same").unwrap();
        let m2 = alice.encrypt(b"same").unwrap();
        assert_ne!(m1.ciphertext, m2.ciphertext);
        assert_eq!(m2.counter, m1.counter + 1);
    }

    #[test]
    fn out_of_order_delivery_uses_skipped_keys() {
        let (mut alice, mut bob) = session_pair();
        let m0 = alice.encrypt(b"zero").unwrap();
        let m1 = alice.encrypt(b"one").unwrap();
        let m2 = alice.encrypt(b"two").unwrap();

        assert_eq!(bob.decrypt(&m2, MAX_SKIP).unwrap(), b"two");
        assert_eq!(bob.decrypt(&m0, MAX_SKIP).unwrap(), b"zero");
        assert_eq!(bob.decrypt(&m1, MAX_SKIP).unwrap(), b"one");
        // Each skipped key is usable once.
        assert!(bob.decrypt(&m1, MAX_SKIP).is_err());
    }

    #[test]
    fn skip_limit_enforced() {
        let (mut alice, mut bob) = session_pair();
        let mut last = alice.encrypt(b"first").unwrap();
        for _ in 0..5 {
            last = alice.encrypt(b"later").unwrap();
        }
        assert!(matches!(
            bob.decrypt(&last, 3),
            Err(SignalError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn tampered_header_fails_authentication() {
        let (mut alice, mut bob) = session_pair();
        let mut m = alice.encrypt(b"hello").unwrap();
        m.previous_counter = 42;
        assert!(matches!(
            bob.decrypt(&m, MAX_SKIP),
            Err(SignalError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn record_roundtrip_preserves_ratchet_position() {
        let (mut alice, mut bob) = session_pair();
        let m0 = alice.encrypt(b"zero").unwrap();
        let m1 = alice.encrypt(b"one").unwrap();
        bob.decrypt(&m1, MAX_SKIP).unwrap();

        let mut restored = SessionState::from_bytes(&bob.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.address(), "alice.1");
        assert_eq!(restored.decrypt(&m0, MAX_SKIP).unwrap(), b"zero");

        let alice_restored = SessionState::from_bytes(&alice.to_bytes().unwrap()).unwrap();
        assert_eq!(alice_restored.pending_prekey(), alice.pending_prekey());
    }

    #[test]
    fn truncated_record_is_storage_corruption() {
        let (alice, _) = session_pair();
        let bytes = alice.to_bytes().unwrap();
        assert!(matches!(
            SessionState::from_bytes(&bytes[..bytes.len() - 3]),
            Err(SignalError::StorageCorruption(_))
        ));
    }
}
