use std::{ops::Deref, sync::Arc};

use serde_json::Value;
use shared::domain::{CommitRecord, ConnectionId};
use storage::SessionStore;
use tracing::{info_span, warn, Instrument};

use crate::{
    chain::DispatchChain,
    connection_lock::{ConnectionGuard, ConnectionLocks},
    context::RequestContext,
    error::DispatchError,
    registry::Registry,
};

/// One inbound call: run `module/action` with `payload` for a connection.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub connection_id: ConnectionId,
    pub module: String,
    pub action: String,
    pub payload: Value,
    pub context: RequestContext,
}

impl DispatchRequest {
    pub fn new(
        connection_id: ConnectionId,
        module: impl Into<String>,
        action: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            connection_id,
            module: module.into(),
            action: action.into(),
            payload,
            context: RequestContext::default(),
        }
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub action_result: Value,
    /// Every mutation applied by the chain, in append order.
    pub mutations: Vec<CommitRecord>,
}

/// Entry point for the transport layer: owns the registry and the store.
#[derive(Clone)]
pub struct DispatchEngine {
    registry: Arc<Registry>,
    store: Arc<dyn SessionStore>,
    locks: Option<Arc<ConnectionLocks>>,
}

impl DispatchEngine {
    /// Chains for the same connection are serialized by default.
    pub fn new(registry: Arc<Registry>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            registry,
            store,
            locks: Some(Arc::new(ConnectionLocks::default())),
        }
    }

    /// Without serialization, overlapping chains on one connection may
    /// overwrite each other's writes.
    pub fn with_connection_serialization(mut self, enabled: bool) -> Self {
        self.locks = enabled.then(|| Arc::new(ConnectionLocks::default()));
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub async fn new_connection(&self) -> Result<ConnectionId, DispatchError> {
        Ok(self.store.new_connection().await?)
    }

    /// Extends the connection and the state of every registered module.
    pub async fn renew(&self, id: &ConnectionId) -> Result<(), DispatchError> {
        let modules = self.registry.module_names();
        Ok(self.store.renew_connection(id, &modules).await?)
    }

    /// A chain for callers that drive modules themselves, e.g. server-side rendering.
    ///
    /// The chain does not take the connection's serialization slot, so it may
    /// race a concurrent [`dispatch`](Self::dispatch). Use
    /// [`start_serialized_chain`](Self::start_serialized_chain) when it persists.
    pub fn start_chain(&self, id: ConnectionId, request: RequestContext) -> DispatchChain {
        DispatchChain::new(self.registry.clone(), self.store.clone(), id, request)
    }

    /// Like [`start_chain`](Self::start_chain), but waits for the connection's
    /// slot and holds it until the chain is applied or dropped.
    pub async fn start_serialized_chain(
        &self,
        id: ConnectionId,
        request: RequestContext,
    ) -> SerializedChain {
        let guard = match &self.locks {
            Some(locks) => Some(locks.acquire(&id).await),
            None => None,
        };
        SerializedChain {
            chain: self.start_chain(id, request),
            _guard: guard,
        }
    }

    /// Runs one root action and, if it succeeds, applies and persists every
    /// mutation committed within its chain.
    pub async fn dispatch(
        &self,
        request: DispatchRequest,
    ) -> Result<DispatchOutcome, DispatchError> {
        let span = info_span!(
            "dispatch",
            connection = %request.connection_id,
            module = %request.module,
            action = %request.action,
        );
        async move {
            let definition = self
                .registry
                .module(&request.module)
                .ok_or_else(|| DispatchError::UnknownModule(request.module.clone()))?;
            if definition.action(&request.action).is_none() {
                return Err(DispatchError::UnknownAction {
                    module: request.module,
                    action: request.action,
                });
            }

            let chain = self
                .start_serialized_chain(request.connection_id, request.context)
                .await;
            let module = chain.load_module(&request.module).await?;
            let action_result = match module.dispatch(&request.action, request.payload).await {
                Ok(result) => result,
                Err(error) => {
                    warn!(error = %error, "action failed, nothing persisted");
                    return Err(error);
                }
            };
            let mutations = chain.apply_mutations().await?;

            Ok(DispatchOutcome {
                action_result,
                mutations,
            })
        }
        .instrument(span)
        .await
    }
}

/// A [`DispatchChain`] holding its connection's serialization slot.
pub struct SerializedChain {
    chain: DispatchChain,
    _guard: Option<ConnectionGuard>,
}

impl SerializedChain {
    /// Applies and persists the chain, then releases the slot.
    pub async fn apply_mutations(self) -> Result<Vec<CommitRecord>, DispatchError> {
        self.chain.apply_mutations().await
    }
}

impl Deref for SerializedChain {
    type Target = DispatchChain;

    fn deref(&self) -> &DispatchChain {
        &self.chain
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
