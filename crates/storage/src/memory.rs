use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::domain::{ConnectionId, ConnectionInfo};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::{
    BackendConfig, ModuleStates, SessionStore, StateFactory, StoreError, MAX_CONNECTION_TTL,
};

struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Default)]
struct Entries {
    connections: HashMap<ConnectionId, Expiring<DateTime<Utc>>>,
    states: HashMap<(ConnectionId, String), Expiring<Value>>,
}

impl Entries {
    /// Looks up a live connection marker, dropping it if it has lapsed.
    fn live_connection(
        &mut self,
        id: &ConnectionId,
        now: Instant,
    ) -> Result<&mut Expiring<DateTime<Utc>>, StoreError> {
        if self.connections.get(id).is_some_and(|c| !c.is_live(now)) {
            self.connections.remove(id);
        }
        self.connections
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownConnection(id.clone()))
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.connections.len() + self.states.len();
        self.connections.retain(|_, c| c.is_live(now));
        self.states.retain(|_, s| s.is_live(now));
        before - (self.connections.len() + self.states.len())
    }
}

struct Inner {
    entries: Mutex<Entries>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Process-local backend. Keys expire individually; expired keys are
/// invisible immediately and reclaimed by the optional sweep task.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
    ttl: Duration,
}

impl MemoryStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(Entries::default()),
            }),
            ttl,
        }
    }

    /// Like [`MemoryStore::new`], plus a background task removing expired keys
    /// every `check_expired_interval`. Must be called within a tokio runtime.
    /// The task ends once the last clone of the store is dropped.
    pub fn with_sweep(ttl: Duration, check_expired_interval: Duration) -> Self {
        let store = Self::new(ttl);
        spawn_sweeper(Arc::downgrade(&store.inner), check_expired_interval);
        store
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        match config.check_expired_interval {
            Some(every) if !every.is_zero() => Self::with_sweep(config.connection_ttl, every),
            _ => Self::new(config.connection_ttl),
        }
    }

    /// Removes every expired key now and returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        self.inner.lock().sweep(Instant::now())
    }

    /// Number of keys held, live or not yet swept.
    pub fn key_count(&self) -> usize {
        let entries = self.inner.lock();
        entries.connections.len() + entries.states.len()
    }

    fn deadline(&self, now: Instant) -> Instant {
        now.checked_add(self.ttl).unwrap_or_else(|| now + MAX_CONNECTION_TTL)
    }
}

fn spawn_sweeper(inner: Weak<Inner>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let removed = inner.lock().sweep(Instant::now());
            if removed > 0 {
                debug!(removed, "swept expired session keys");
            }
        }
    });
}

#[async_trait]
impl SessionStore for MemoryStore {
    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn new_connection(&self) -> Result<ConnectionId, StoreError> {
        let id = ConnectionId::generate();
        let now = Instant::now();
        self.inner.lock().connections.insert(
            id.clone(),
            Expiring {
                value: Utc::now(),
                expires_at: self.deadline(now),
            },
        );
        Ok(id)
    }

    async fn connection_info(&self, id: &ConnectionId) -> Result<ConnectionInfo, StoreError> {
        let mut entries = self.inner.lock();
        let connection = entries.live_connection(id, Instant::now())?;
        Ok(ConnectionInfo {
            id: id.clone(),
            created_at: connection.value,
        })
    }

    async fn renew_connection(
        &self,
        id: &ConnectionId,
        module_names: &[String],
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        let deadline = self.deadline(now);
        let mut entries = self.inner.lock();
        entries.live_connection(id, now)?.expires_at = deadline;
        for module_name in module_names {
            let key = (id.clone(), module_name.clone());
            match entries.states.get(&key).map(|s| s.is_live(now)) {
                Some(true) => {
                    if let Some(state) = entries.states.get_mut(&key) {
                        state.expires_at = deadline;
                    }
                }
                Some(false) => {
                    entries.states.remove(&key);
                }
                None => {}
            }
        }
        Ok(())
    }

    async fn get_state(
        &self,
        id: &ConnectionId,
        module_name: &str,
        initial: StateFactory<'_>,
    ) -> Result<Value, StoreError> {
        let now = Instant::now();
        let mut entries = self.inner.lock();
        entries.live_connection(id, now)?;
        let key = (id.clone(), module_name.to_string());
        if let Some(state) = entries.states.get(&key).filter(|s| s.is_live(now)) {
            return Ok(state.value.clone());
        }
        let value = initial();
        entries.states.insert(
            key,
            Expiring {
                value: value.clone(),
                expires_at: self.deadline(now),
            },
        );
        Ok(value)
    }

    async fn update_state(
        &self,
        id: &ConnectionId,
        states: &ModuleStates,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        let deadline = self.deadline(now);
        let mut entries = self.inner.lock();
        entries.live_connection(id, now)?;
        for (module_name, value) in states {
            entries.states.insert(
                (id.clone(), module_name.clone()),
                Expiring {
                    value: value.clone(),
                    expires_at: deadline,
                },
            );
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/memory_tests.rs"]
mod tests;
