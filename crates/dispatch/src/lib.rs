//! Action dispatch over per-connection module state.
//!
//! A [`DispatchEngine`] runs one *dispatch chain* per inbound call: the
//! target module is loaded from the [`storage::SessionStore`], its action runs
//! inside the global/module hook pipeline, and every mutation committed along
//! the way (including by nested cross-module dispatches) is recorded rather
//! than applied. Only when the root action settles successfully are the
//! records played back against the chain's cached states and persisted in one
//! batch. A failing chain persists nothing.

mod chain;
mod connection_lock;
mod context;
mod engine;
mod error;
mod registry;
mod runner;
mod tracker;

#[cfg(test)]
mod test_support;

pub use chain::{ActionContext, DispatchChain, Getters, ModuleHandle, SharedState};
pub use context::{EarlyResponse, RequestContext, ResponseSlot};
pub use engine::{DispatchEngine, DispatchOutcome, DispatchRequest, SerializedChain};
pub use error::{CallbackFailure, DispatchError, HookExecutionError, RegistryError};
pub use registry::{
    ActionFn, GetterFn, HookFn, HookName, HookPhase, HookSet, HookTarget, ModuleBuilder,
    ModuleDefinition, MutationFn, Registry, RegistryBuilder, StateFn,
};
pub use runner::{HookContext, HookEvent, HookMetadata};
pub use shared::domain::{CommitRecord, ConnectionId};
