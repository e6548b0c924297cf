pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod keystore;
pub mod safety;
pub(crate) mod serde_b64;
pub mod signal;
pub mod sqlite_store;

pub use client::DmClient;
pub use config::SignalConfig;
pub use error::{Result, SignalError};
pub use identity::IdentityKeyPair;
pub use keystore::{KeyStore, MemoryKeyStore};
pub use safety::{compute_safety_number, SafetyNumbers};
pub use signal::{
    Directory, DirectoryError, MemoryDirectory, MessageCipher, ProtocolAddress, SignalStore,
    TrustPolicy, UNDECRYPTABLE_PLACEHOLDER,
};
pub use sqlite_store::SqliteKeyStore;
