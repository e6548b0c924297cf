use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{
    Mutex as AsyncMutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock,
};

use crate::signal::address::ProtocolAddress;

/// One async mutex per peer address, plus a store-wide gate.
///
/// Establish, encrypt and decrypt each hold an [`AddressGuard`] across their
/// whole load-modify-store of a session record. Different addresses never
/// block each other. [`AddressLocks::lock_all`] waits for every held address
/// guard and keeps new ones out until it is dropped.
#[derive(Clone, Default)]
pub struct AddressLocks {
    gate: Arc<RwLock<()>>,
    locks: Arc<Mutex<HashMap<ProtocolAddress, Arc<AsyncMutex<()>>>>>,
}

/// Exclusive access to one address's session record.
pub struct AddressGuard {
    _address: OwnedMutexGuard<()>,
    _gate: OwnedRwLockReadGuard<()>,
}

impl AddressLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, address: &ProtocolAddress) -> AddressGuard {
        let gate = Arc::clone(&self.gate).read_owned().await;
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(
                locks
                    .entry(address.clone())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        AddressGuard {
            _address: lock.lock_owned().await,
            _gate: gate,
        }
    }

    /// Exclusive access to every address at once.
    pub async fn lock_all(&self) -> OwnedRwLockWriteGuard<()> {
        Arc::clone(&self.gate).write_owned().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_address_is_serialized() {
        let locks = AddressLocks::new();
        let addr = ProtocolAddress::new("bob", 1);

        let guard = locks.lock(&addr).await;
        let contender = {
            let locks = locks.clone();
            let addr = addr.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&addr).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn different_addresses_do_not_block() {
        let locks = AddressLocks::new();
        let _bob = locks.lock(&ProtocolAddress::new("bob", 1)).await;
        let carol = tokio::time::timeout(
            Duration::from_millis(100),
            locks.lock(&ProtocolAddress::new("carol", 1)),
        )
        .await;
        assert!(carol.is_ok());
    }

    #[tokio::test]
    async fn lock_all_waits_for_held_addresses() {
        let locks = AddressLocks::new();
        let bob = locks.lock(&ProtocolAddress::new("bob", 1)).await;

        let all = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _all = locks.lock_all().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!all.is_finished());

        drop(bob);
        all.await.unwrap();
    }

    #[tokio::test]
    async fn lock_all_keeps_new_guards_out() {
        let locks = AddressLocks::new();
        let all = locks.lock_all().await;

        let carol = tokio::time::timeout(
            Duration::from_millis(20),
            locks.lock(&ProtocolAddress::new("carol", 1)),
        )
        .await;
        assert!(carol.is_err());

        drop(all);
        let _carol = locks.lock(&ProtocolAddress::new("carol", 1)).await;
    }
}
