use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use serde_json::Value;
use shared::domain::{CommitRecord, ConnectionId};
use storage::{ModuleStates, SessionStore};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    context::{RequestContext, ResponseSlot},
    error::{CallbackFailure, DispatchError},
    registry::{ModuleDefinition, Registry},
    runner,
    tracker::CommitTracker,
};

/// The one in-memory state object of a module within a chain.
pub type SharedState = Arc<RwLock<Value>>;

fn read_state(state: &SharedState) -> Value {
    state.read().unwrap_or_else(PoisonError::into_inner).clone()
}

struct CachedModule {
    definition: Arc<ModuleDefinition>,
    state: SharedState,
}

struct ChainInner {
    registry: Arc<Registry>,
    store: Arc<dyn SessionStore>,
    connection_id: ConnectionId,
    request: RequestContext,
    modules: Mutex<HashMap<String, CachedModule>>,
    tracker: CommitTracker,
}

/// Request-scoped execution spanning one root action and every nested
/// dispatch it triggers. Owns the module state cache and the commit tracker.
#[derive(Clone)]
pub struct DispatchChain {
    inner: Arc<ChainInner>,
}

impl DispatchChain {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn SessionStore>,
        connection_id: ConnectionId,
        request: RequestContext,
    ) -> Self {
        Self {
            inner: Arc::new(ChainInner {
                registry,
                store,
                connection_id,
                request,
                modules: Mutex::new(HashMap::new()),
                tracker: CommitTracker::default(),
            }),
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.inner.connection_id
    }

    pub fn request(&self) -> &RequestContext {
        &self.inner.request
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Loads `name` into this chain. The store is consulted at most once per
    /// module; later calls return handles on the same cached state object.
    pub async fn load_module(&self, name: &str) -> Result<ModuleHandle, DispatchError> {
        let definition = self
            .inner
            .registry
            .module(name)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownModule(name.to_string()))?;

        let mut modules = self.inner.modules.lock().await;
        if let Some(cached) = modules.get(name) {
            return Ok(self.handle(cached));
        }

        let initial = || definition.initial_state();
        let value = self
            .inner
            .store
            .get_state(&self.inner.connection_id, name, &initial)
            .await?;
        debug!(connection = %self.inner.connection_id, module = name, "module loaded into chain");

        let cached = CachedModule {
            definition,
            state: Arc::new(RwLock::new(value)),
        };
        let handle = self.handle(&cached);
        modules.insert(name.to_string(), cached);
        Ok(handle)
    }

    fn handle(&self, cached: &CachedModule) -> ModuleHandle {
        ModuleHandle {
            definition: cached.definition.clone(),
            state: cached.state.clone(),
            chain: self.clone(),
        }
    }

    /// Commit records appended so far, in append order.
    pub fn mutations(&self) -> Vec<CommitRecord> {
        self.inner.tracker.snapshot()
    }

    fn commit(&self, record: CommitRecord) {
        self.inner.tracker.push(record);
    }

    /// Plays every commit record back against the cached states, in append
    /// order, then persists the states of all touched modules in one batch.
    ///
    /// Must only be called once the root action has succeeded. Nothing is
    /// persisted if a mutation fails.
    pub async fn apply_mutations(self) -> Result<Vec<CommitRecord>, DispatchError> {
        let records = self.inner.tracker.snapshot();
        let modules = self.inner.modules.lock().await;

        let mut touched = BTreeSet::new();
        for record in &records {
            let cached = modules
                .get(&record.module_name)
                .ok_or_else(|| DispatchError::UnknownModule(record.module_name.clone()))?;
            let mutation = cached.definition.mutation(&record.mutation).ok_or_else(|| {
                DispatchError::UnknownMutation {
                    module: record.module_name.clone(),
                    mutation: record.mutation.clone(),
                }
            })?;
            {
                let mut state = cached.state.write().unwrap_or_else(PoisonError::into_inner);
                mutation(&mut *state, &record.payload).map_err(|error| {
                    DispatchError::MutationFailed {
                        module: record.module_name.clone(),
                        mutation: record.mutation.clone(),
                        source: CallbackFailure::new(error),
                    }
                })?;
            }
            touched.insert(record.module_name.as_str());
        }

        let states: ModuleStates = touched
            .into_iter()
            .filter_map(|name| {
                modules
                    .get(name)
                    .map(|cached| (name.to_string(), read_state(&cached.state)))
            })
            .collect();
        self.inner
            .store
            .update_state(&self.inner.connection_id, &states)
            .await?;
        debug!(
            connection = %self.inner.connection_id,
            commits = records.len(),
            modules = states.len(),
            "chain mutations applied"
        );
        Ok(records)
    }
}

impl fmt::Debug for DispatchChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchChain")
            .field("connection_id", &self.inner.connection_id)
            .field("commits", &self.inner.tracker.len())
            .finish()
    }
}

/// Derived values of one module, recomputed against the cached state on every access.
#[derive(Clone)]
pub struct Getters {
    definition: Arc<ModuleDefinition>,
    state: SharedState,
}

impl Getters {
    pub fn get(&self, name: &str) -> Result<Value, DispatchError> {
        let getter = self
            .definition
            .getter(name)
            .ok_or_else(|| DispatchError::UnknownGetter {
                module: self.definition.name().to_string(),
                getter: name.to_string(),
            })?;
        let snapshot = read_state(&self.state);
        Ok(getter(&snapshot, self))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.definition.getter_names()
    }
}

/// Read-only view of a module loaded in a chain: state, getters and dispatch.
#[derive(Clone, Debug)]
pub struct ModuleHandle {
    definition: Arc<ModuleDefinition>,
    state: SharedState,
    chain: DispatchChain,
}

impl ModuleHandle {
    pub fn name(&self) -> &str {
        self.definition.name()
    }

    /// Current value of the chain's cached state for this module.
    pub fn state(&self) -> Value {
        read_state(&self.state)
    }

    pub fn shared_state(&self) -> &SharedState {
        &self.state
    }

    pub fn getters(&self) -> Getters {
        Getters {
            definition: self.definition.clone(),
            state: self.state.clone(),
        }
    }

    /// Runs `action` of this module within the same chain, hooks included.
    pub async fn dispatch(&self, action: &str, payload: Value) -> Result<Value, DispatchError> {
        runner::run_action(self.clone(), action.to_string(), payload).await
    }

    pub(crate) fn definition(&self) -> &Arc<ModuleDefinition> {
        &self.definition
    }

    pub(crate) fn chain(&self) -> &DispatchChain {
        &self.chain
    }

    pub(crate) fn action_context(&self) -> ActionContext {
        ActionContext {
            module: self.clone(),
        }
    }
}

/// What an action body sees: its module's state and getters, `commit`,
/// self-dispatch, cross-module `load_module`, and the request passthrough.
#[derive(Clone)]
pub struct ActionContext {
    module: ModuleHandle,
}

impl ActionContext {
    pub fn module_name(&self) -> &str {
        self.module.name()
    }

    pub fn state(&self) -> Value {
        self.module.state()
    }

    pub fn shared_state(&self) -> &SharedState {
        self.module.shared_state()
    }

    pub fn getters(&self) -> Getters {
        self.module.getters()
    }

    /// Records a mutation for the end of the chain. State is not touched now.
    pub fn commit(&self, mutation: &str, payload: impl Into<Value>) -> Result<(), DispatchError> {
        let module = self.module.name();
        if self.module.definition.mutation(mutation).is_none() {
            return Err(DispatchError::UnknownMutation {
                module: module.to_string(),
                mutation: mutation.to_string(),
            });
        }
        self.module
            .chain
            .commit(CommitRecord::new(module, mutation, payload.into()));
        Ok(())
    }

    pub async fn dispatch(&self, action: &str, payload: Value) -> Result<Value, DispatchError> {
        self.module.dispatch(action, payload).await
    }

    pub async fn load_module(&self, name: &str) -> Result<ModuleHandle, DispatchError> {
        self.module.chain.load_module(name).await
    }

    pub fn request(&self) -> &RequestContext {
        self.module.chain.request()
    }

    pub fn is_ssr(&self) -> bool {
        self.request().is_ssr()
    }

    pub fn response(&self) -> &ResponseSlot {
        self.request().response()
    }
}

#[cfg(test)]
#[path = "tests/chain_tests.rs"]
mod tests;
