pub mod address;
pub mod cipher;
pub mod device;
pub mod directory;
pub mod envelope;
pub mod locks;
pub mod memory_directory;
pub mod prekeys;
pub mod ratchet;
pub mod session;
pub mod store;
pub mod trust;

pub use address::ProtocolAddress;
pub use cipher::{MessageCipher, UNDECRYPTABLE_PLACEHOLDER};
pub use device::{DeviceManager, DeviceRegistration, ReplenishOutcome};
pub use directory::{
    Directory, DirectoryError, PeerIdentity, RegisterDeviceRequest, ReplenishRequest,
};
pub use envelope::{CiphertextEnvelope, EnvelopeKind};
pub use locks::{AddressGuard, AddressLocks};
pub use memory_directory::{MemoryDirectory, UserDirectory};
pub use prekeys::PreKeyBundle;
pub use session::SessionEstablisher;
pub use store::SignalStore;
pub use trust::{TrustPolicy, TrustStore};
