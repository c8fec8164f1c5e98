use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use shared::domain::ConnectionId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug)]
struct Slot {
    lock: Arc<AsyncMutex<()>>,
    /// Holders plus waiters, including waiters whose acquire is still pending.
    users: usize,
}

/// Serializes dispatch chains per connection. Chains for different
/// connections never wait on each other.
#[derive(Debug, Default)]
pub(crate) struct ConnectionLocks {
    slots: Mutex<HashMap<ConnectionId, Slot>>,
}

impl ConnectionLocks {
    fn slots(&self) -> MutexGuard<'_, HashMap<ConnectionId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) async fn acquire(self: &Arc<Self>, id: &ConnectionId) -> ConnectionGuard {
        let (lock, lease) = {
            let mut slots = self.slots();
            let slot = slots.entry(id.clone()).or_insert_with(|| Slot {
                lock: Arc::default(),
                users: 0,
            });
            slot.users += 1;
            let lease = Lease {
                locks: self.clone(),
                id: id.clone(),
            };
            (slot.lock.clone(), lease)
        };
        // A cancelled acquire drops `lease` here and releases its share of the slot.
        let guard = lock.lock_owned().await;
        ConnectionGuard {
            _guard: guard,
            _lease: lease,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots().len()
    }
}

struct Lease {
    locks: Arc<ConnectionLocks>,
    id: ConnectionId,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut slots = self.locks.slots();
        if let Some(slot) = slots.get_mut(&self.id) {
            slot.users -= 1;
            if slot.users == 0 {
                slots.remove(&self.id);
            }
        }
    }
}

/// Fields drop in order: the mutex is released before the lease.
pub(crate) struct ConnectionGuard {
    _guard: OwnedMutexGuard<()>,
    _lease: Lease,
}
