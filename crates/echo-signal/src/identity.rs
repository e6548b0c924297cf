use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::ZeroizeOnDrop;

use crate::error::{Result, SignalError};

/// A device's long-term identity key.
///
/// The Ed25519 key signs prekeys; its X25519 form (same scalar, mapped to
/// Montgomery form) takes part in X3DH. Only the public half ever leaves
/// the device.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore an identity from its 32-byte secret.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Restore from a stored secret of unchecked length.
    pub fn from_secret_slice(bytes: &[u8]) -> Result<Self> {
        let secret = <[u8; 32]>::try_from(bytes)
            .map_err(|_| SignalError::InvalidKey("identity secret wrong length".into()))?;
        Ok(Self::from_secret_bytes(&secret))
    }

    /// Public key bytes. This is what peers see and what safety numbers hash.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Secret key bytes, for the local key store only.
    pub fn secret_key_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    /// Verify `signature` over `message` against a peer's public identity.
    pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
        let key = verifying_key(public_key)?;
        let signature = Signature::from_slice(signature)
            .map_err(|e| SignalError::InvalidKey(format!("malformed signature: {e}")))?;
        key.verify_strict(message, &signature)
            .map_err(|e| SignalError::SessionEstablishmentFailed(format!("bad signature: {e}")))
    }

    /// X25519 secret derived from the Ed25519 scalar.
    ///
    /// Matches `peer_x25519_public` applied to our own public key.
    pub fn to_x25519_secret(&self) -> x25519_dalek::StaticSecret {
        x25519_dalek::StaticSecret::from(self.signing_key.to_scalar_bytes())
    }

    /// Map a peer's Ed25519 public key to X25519 (RFC 7748 birational map).
    pub fn peer_x25519_public(ed25519_public: &[u8]) -> Result<x25519_dalek::PublicKey> {
        let montgomery = verifying_key(ed25519_public)?.to_montgomery();
        Ok(x25519_dalek::PublicKey::from(montgomery.to_bytes()))
    }
}

fn verifying_key(bytes: &[u8]) -> Result<VerifyingKey> {
    let bytes = <[u8; 32]>::try_from(bytes)
        .map_err(|_| SignalError::InvalidKey("identity key wrong length".into()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| SignalError::InvalidKey(format!("invalid Ed25519 public key: {e}")))
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let identity = IdentityKeyPair::generate();
        let signature = identity.sign(b"signed prekey");
        assert!(IdentityKeyPair::verify(&identity.public_key_bytes(), b"signed prekey", &signature).is_ok());

        let other = IdentityKeyPair::generate();
        let err = IdentityKeyPair::verify(&other.public_key_bytes(), b"signed prekey", &signature)
            .unwrap_err();
        assert!(matches!(err, SignalError::SessionEstablishmentFailed(_)));
    }

    #[test]
    fn roundtrip_secret_bytes() {
        let identity = IdentityKeyPair::generate();
        let restored = IdentityKeyPair::from_secret_slice(identity.secret_key_bytes()).unwrap();
        assert_eq!(identity.public_key_bytes(), restored.public_key_bytes());
        assert!(IdentityKeyPair::from_secret_slice(&[1u8; 31]).is_err());
    }

    #[test]
    fn peer_x25519_matches_own_derivation() {
        let identity = IdentityKeyPair::generate();
        let from_secret = x25519_dalek::PublicKey::from(&identity.to_x25519_secret());
        let from_public = IdentityKeyPair::peer_x25519_public(&identity.public_key_bytes()).unwrap();
        assert_eq!(from_secret.as_bytes(), from_public.as_bytes());
    }

    #[test]
    fn x25519_agreement_between_identities() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();

        let bob_public = IdentityKeyPair::peer_x25519_public(&bob.public_key_bytes()).unwrap();
        let alice_public = IdentityKeyPair::peer_x25519_public(&alice.public_key_bytes()).unwrap();

        let shared_a = alice.to_x25519_secret().diffie_hellman(&bob_public);
        let shared_b = bob.to_x25519_secret().diffie_hellman(&alice_public);
        assert_eq!(shared_a.as_bytes(), shared_b.as_bytes());
    }
}
