use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("device registration failed: {0}")]
    RegistrationFailed(String),

    #[error("peer has not published a key bundle")]
    NoBundle,

    #[error("peer has no registered device")]
    NoDevice,

    #[error("peer has no one-time prekeys left")]
    NoPreKeys,

    #[error("peer is not ready for encrypted messages")]
    PeerNotReady,

    #[error("session establishment failed: {0}")]
    SessionEstablishmentFailed(String),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("missing local key material: {0}")]
    StorageCorruption(String),

    #[error("key storage error: {0}")]
    Storage(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("identity key for {0} is not trusted")]
    UntrustedIdentity(String),

    #[error("directory error: {0}")]
    Directory(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl SignalError {
    /// The peer has not published enough key material to start a session.
    pub fn is_peer_not_ready(&self) -> bool {
        matches!(
            self,
            Self::NoBundle | Self::NoDevice | Self::NoPreKeys | Self::PeerNotReady
        )
    }

    /// Whether the caller may simply try the same operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RegistrationFailed(_) | Self::Directory(_))
    }
}

impl From<serde_json::Error> for SignalError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<rusqlite::Error> for SignalError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

pub type Result<T, E = SignalError> = std::result::Result<T, E>;
