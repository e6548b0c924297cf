//! Wire formats: the `"<type>:<base64>"` envelope and the two message
//! bodies it can carry.
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SignalError};
use crate::serde_b64;

const MESSAGE_VERSION: u8 = 1;

/// AES-GCM tag length; every ciphertext is at least this long.
const TAG_LEN: usize = 16;

/// Which decryption path an envelope needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// Ratchet message on an established session.
    Ratchet,
    /// Carries the X3DH handshake; establishes the session on receipt.
    PreKey,
}

impl EnvelopeKind {
    pub fn discriminator(self) -> u8 {
        match self {
            Self::Ratchet => 1,
            Self::PreKey => 3,
        }
    }

    fn from_discriminator(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Ratchet),
            3 => Some(Self::PreKey),
            _ => None,
        }
    }
}

/// Self-describing ciphertext, opaque to everything outside this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiphertextEnvelope {
    pub kind: EnvelopeKind,
    pub payload: Vec<u8>,
}

impl CiphertextEnvelope {
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CiphertextEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.kind.discriminator(),
            serde_b64::encode(&self.payload)
        )
    }
}

impl FromStr for CiphertextEnvelope {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, payload) = s
            .split_once(':')
            .ok_or_else(|| malformed("missing type discriminator"))?;
        let kind = kind
            .parse::<u8>()
            .ok()
            .and_then(EnvelopeKind::from_discriminator)
            .ok_or_else(|| malformed("unknown message type"))?;
        let payload = serde_b64::decode(payload).map_err(|_| malformed("payload is not base64"))?;
        if payload.is_empty() {
            return Err(malformed("empty payload"));
        }
        Ok(Self { kind, payload })
    }
}

/// A Double Ratchet message: header plus AEAD ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetMessage {
    /// Sender's current ratchet public key.
    pub ratchet_key: [u8; 32],
    /// Length of the sender's previous sending chain.
    pub previous_counter: u32,
    /// Position in the current sending chain.
    pub counter: u32,
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    pub const HEADER_LEN: usize = 40;

    /// Header bytes, authenticated as associated data.
    pub fn header_bytes(&self) -> [u8; Self::HEADER_LEN] {
        let mut header = [0u8; Self::HEADER_LEN];
        header[..32].copy_from_slice(&self.ratchet_key);
        header[32..36].copy_from_slice(&self.previous_counter.to_le_bytes());
        header[36..].copy_from_slice(&self.counter.to_le_bytes());
        header
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + Self::HEADER_LEN + self.ciphertext.len());
        out.push(MESSAGE_VERSION);
        out.extend_from_slice(&self.header_bytes());
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        reader.version()?;
        let ratchet_key = reader.array32()?;
        let previous_counter = reader.u32()?;
        let counter = reader.u32()?;
        let ciphertext = reader.rest();
        if ciphertext.len() < TAG_LEN {
            return Err(malformed("ciphertext truncated"));
        }
        Ok(Self {
            ratchet_key,
            previous_counter,
            counter,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// First messages of a session: the X3DH parameters the responder needs,
/// wrapped around an ordinary ratchet message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyMessage {
    pub registration_id: u32,
    /// Initiator's Ed25519 identity key.
    pub identity_key: [u8; 32],
    /// Initiator's X3DH ephemeral key.
    pub base_key: [u8; 32],
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
    pub message: RatchetMessage,
}

impl PreKeyMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let inner = self.message.to_bytes();
        let mut out = Vec::with_capacity(78 + inner.len());
        out.push(MESSAGE_VERSION);
        out.extend_from_slice(&self.registration_id.to_le_bytes());
        out.extend_from_slice(&self.identity_key);
        out.extend_from_slice(&self.base_key);
        out.extend_from_slice(&self.signed_prekey_id.to_le_bytes());
        match self.one_time_prekey_id {
            Some(id) => {
                out.push(1);
                out.extend_from_slice(&id.to_le_bytes());
            }
            None => {
                out.push(0);
                out.extend_from_slice(&0u32.to_le_bytes());
            }
        }
        out.extend_from_slice(&inner);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        reader.version()?;
        let registration_id = reader.u32()?;
        let identity_key = reader.array32()?;
        let base_key = reader.array32()?;
        let signed_prekey_id = reader.u32()?;
        let has_one_time = reader.u8()?;
        let one_time_id = reader.u32()?;
        let one_time_prekey_id = match has_one_time {
            0 => None,
            1 => Some(one_time_id),
            _ => return Err(malformed("bad one-time prekey flag")),
        };
        let message = RatchetMessage::from_bytes(reader.rest())?;
        Ok(Self {
            registration_id,
            identity_key,
            base_key,
            signed_prekey_id,
            one_time_prekey_id,
            message,
        })
    }
}

fn malformed(reason: &str) -> SignalError {
    SignalError::DecryptionFailed(format!("malformed message: {reason}"))
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| malformed("truncated"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn array32(&mut self) -> Result<[u8; 32]> {
        let mut out = [0u8; 32];
        out.copy_from_slice(self.take(32)?);
        Ok(out)
    }

    fn version(&mut self) -> Result<()> {
        match self.u8()? {
            MESSAGE_VERSION => Ok(()),
            v => Err(malformed(&format!("unsupported version {v}"))),
        }
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }
}
