//! Safety numbers: a short fingerprint of two identity keys that both
//! parties can compare out of band.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::signal::directory::Directory;
use crate::signal::store::SignalStore;

const GROUPS: usize = 10;
const GROUP_LEN: usize = 4;

/// Fingerprint of two identity public keys.
///
/// The keys are sorted by their raw bytes before hashing, so both sides
/// compute the same string whichever key is "local". Output is the first
/// 40 hex digits of the SHA-256 digest in groups of four.
pub fn compute_safety_number(local_identity: &[u8], peer_identity: &[u8]) -> String {
    let (first, second) = if local_identity <= peer_identity {
        (local_identity, peer_identity)
    } else {
        (peer_identity, local_identity)
    };

    let mut hasher = Sha256::new();
    hasher.update(first);
    hasher.update(second);
    let digest = hex::encode(hasher.finalize());

    digest
        .as_bytes()
        .chunks(GROUP_LEN)
        .take(GROUPS)
        .map(|group| String::from_utf8_lossy(group).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Safety numbers against the directory's view of a peer.
#[derive(Clone)]
pub struct SafetyNumbers {
    store: SignalStore,
    directory: Arc<dyn Directory>,
}

impl SafetyNumbers {
    pub fn new(store: SignalStore, directory: Arc<dyn Directory>) -> Self {
        Self { store, directory }
    }

    /// Fetch `peer`'s identity once and fingerprint it with ours.
    pub async fn for_peer(&self, peer: &str) -> Result<String> {
        let local = self.store.identity.identity_key_pair()?.public_key_bytes();
        let remote = self.directory.fetch_identity(peer).await?;
        Ok(compute_safety_number(&local, &remote.identity_key_public))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_agree() {
        let a = [0x11u8; 32];
        let b = [0xEEu8; 32];
        assert_eq!(compute_safety_number(&a, &b), compute_safety_number(&b, &a));
    }

    #[test]
    fn format_is_ten_groups_of_four_hex() {
        let number = compute_safety_number(&[1u8; 32], &[2u8; 32]);
        let groups: Vec<&str> = number.split(' ').collect();
        assert_eq!(groups.len(), 10);
        assert!(groups
            .iter()
            .all(|g| g.len() == 4 && g.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())));
    }

    #[test]
    fn matches_digest_of_sorted_keys() {
        let low = [0x00u8; 32];
        let high = [0xFFu8; 32];
        let mut concat = low.to_vec();
        concat.extend_from_slice(&high);
        let expected = hex::encode(Sha256::digest(&concat));

        let number = compute_safety_number(&high, &low).replace(' ', "");
        assert_eq!(number, expected[..40]);
    }

    #[test]
    fn different_keys_give_different_numbers() {
        assert_ne!(
            compute_safety_number(&[1u8; 32], &[2u8; 32]),
            compute_safety_number(&[1u8; 32], &[3u8; 32])
        );
    }
}
