use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{json, Value};
use shared::domain::{ConnectionId, ConnectionInfo};
use storage::{MemoryStore, ModuleStates, SessionStore, StateFactory, StoreError};

use crate::{ActionContext, ModuleDefinition};

/// Memory store that counts reads and records every batch written.
pub(crate) struct CountingStore {
    inner: MemoryStore,
    pub(crate) loads: AtomicUsize,
    pub(crate) batches: Mutex<Vec<ModuleStates>>,
}

impl CountingStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(Duration::from_secs(60)),
            loads: AtomicUsize::new(0),
            batches: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub(crate) fn batches(&self) -> Vec<ModuleStates> {
        self.batches.lock().expect("batches").clone()
    }
}

#[async_trait]
impl SessionStore for CountingStore {
    fn ttl(&self) -> Duration {
        self.inner.ttl()
    }

    async fn new_connection(&self) -> Result<ConnectionId, StoreError> {
        self.inner.new_connection().await
    }

    async fn connection_info(&self, id: &ConnectionId) -> Result<ConnectionInfo, StoreError> {
        self.inner.connection_info(id).await
    }

    async fn renew_connection(
        &self,
        id: &ConnectionId,
        module_names: &[String],
    ) -> Result<(), StoreError> {
        self.inner.renew_connection(id, module_names).await
    }

    async fn get_state(
        &self,
        id: &ConnectionId,
        module_name: &str,
        initial: StateFactory<'_>,
    ) -> Result<Value, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.get_state(id, module_name, initial).await
    }

    async fn update_state(
        &self,
        id: &ConnectionId,
        states: &ModuleStates,
    ) -> Result<(), StoreError> {
        self.batches.lock().expect("batches").push(states.clone());
        self.inner.update_state(id, states).await
    }
}

/// `{counter: n}` with `setCounter` (adds the payload), `increment` (commits
/// it and returns the payload) and `explode` (commits, then fails).
pub(crate) fn counter_module() -> ModuleDefinition {
    ModuleDefinition::builder("counter")
        .state(|| json!({ "counter": 0 }))
        .mutation("setCounter", |state, payload| {
            let by = payload.as_i64().ok_or_else(|| anyhow!("expected a number"))?;
            let current = state["counter"].as_i64().unwrap_or_default();
            state["counter"] = json!(current + by);
            Ok(())
        })
        .action("increment", |ctx: ActionContext, payload: Value| async move {
            ctx.commit("setCounter", payload.clone())?;
            Ok::<_, anyhow::Error>(payload)
        })
        .action("explode", |ctx: ActionContext, payload: Value| async move {
            ctx.commit("setCounter", payload)?;
            Err::<Value, anyhow::Error>(anyhow!("boom"))
        })
        .getter("doubled", |state, _| {
            json!(state["counter"].as_i64().unwrap_or_default() * 2)
        })
        .build()
        .expect("counter module")
}
