use futures::{future::BoxFuture, FutureExt};
use serde_json::Value;
use shared::domain::CommitRecord;
use tracing::{debug, warn};

use crate::{
    chain::{DispatchChain, ModuleHandle},
    context::{RequestContext, ResponseSlot},
    error::{CallbackFailure, DispatchError, HookExecutionError},
    registry::{HookFn, HookPhase, HookTarget},
};

/// Which hook is running, on behalf of which action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookMetadata {
    pub module_name: String,
    pub action_name: String,
    /// `before`, `after` or `error` for global hooks, otherwise the module
    /// slot name such as `before:all` or `error:increment`.
    pub hook_name: String,
}

#[derive(Debug, Clone)]
pub enum HookEvent {
    Before,
    After {
        action_result: Value,
        mutations: Vec<CommitRecord>,
    },
    Error {
        error: CallbackFailure,
    },
}

/// Argument passed to every hook.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub metadata: HookMetadata,
    pub event: HookEvent,
    chain: DispatchChain,
}

impl HookContext {
    pub fn request(&self) -> &RequestContext {
        self.chain.request()
    }

    pub fn is_ssr(&self) -> bool {
        self.chain.request().is_ssr()
    }

    pub fn response(&self) -> &ResponseSlot {
        self.chain.request().response()
    }

    pub async fn load_module(&self, name: &str) -> Result<ModuleHandle, DispatchError> {
        self.chain.load_module(name).await
    }

    pub fn action_result(&self) -> Option<&Value> {
        match &self.event {
            HookEvent::After { action_result, .. } => Some(action_result),
            _ => None,
        }
    }

    /// Mutations recorded in the chain up to the end of the action.
    pub fn mutations(&self) -> &[CommitRecord] {
        match &self.event {
            HookEvent::After { mutations, .. } => mutations,
            _ => &[],
        }
    }

    pub fn error(&self) -> Option<&CallbackFailure> {
        match &self.event {
            HookEvent::Error { error } => Some(error),
            _ => None,
        }
    }
}

struct Pipeline {
    module: ModuleHandle,
    action: String,
}

impl Pipeline {
    fn metadata(&self, hook_name: String) -> HookMetadata {
        HookMetadata {
            module_name: self.module.name().to_string(),
            action_name: self.action.clone(),
            hook_name,
        }
    }

    /// Global hook of `phase` from every set, then the module's `phase:all`
    /// and `phase:{action}` slots.
    fn hooks(&self, phase: HookPhase) -> Vec<(String, HookFn)> {
        let registry = self.module.chain().registry();
        let definition = self.module.definition();

        let mut hooks: Vec<(String, HookFn)> = registry
            .global_hooks()
            .iter()
            .filter_map(|set| set.get(phase))
            .map(|hook| (phase.as_str().to_string(), hook.clone()))
            .collect();
        for target in [HookTarget::All, HookTarget::Action(self.action.clone())] {
            if let Some(hook) = definition.hook(phase, target.clone()) {
                let name = match target {
                    HookTarget::All => format!("{}:all", phase.as_str()),
                    HookTarget::Action(action) => format!("{}:{action}", phase.as_str()),
                };
                hooks.push((name, hook.clone()));
            }
        }
        hooks
    }

    async fn run_hooks(&self, phase: HookPhase, event: &HookEvent) -> anyhow::Result<()> {
        for (name, hook) in self.hooks(phase) {
            hook(HookContext {
                metadata: self.metadata(name),
                event: event.clone(),
                chain: self.module.chain().clone(),
            })
            .await?;
        }
        Ok(())
    }

    async fn run_success_path(&self, payload: Value) -> anyhow::Result<Value> {
        self.run_hooks(HookPhase::Before, &HookEvent::Before).await?;

        let action = self
            .module
            .definition()
            .action(&self.action)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownAction {
                module: self.module.name().to_string(),
                action: self.action.clone(),
            })?;
        let action_result = action(self.module.action_context(), payload).await?;

        let event = HookEvent::After {
            action_result: action_result.clone(),
            mutations: self.module.chain().mutations(),
        };
        self.run_hooks(HookPhase::After, &event).await?;
        Ok(action_result)
    }

    /// Error hooks are isolated from each other; a failing one is logged and
    /// the next one still runs.
    async fn run_error_hooks(&self, error: &CallbackFailure) {
        let event = HookEvent::Error {
            error: error.clone(),
        };
        for (name, hook) in self.hooks(HookPhase::Error) {
            let metadata = self.metadata(name);
            let outcome = hook(HookContext {
                metadata: metadata.clone(),
                event: event.clone(),
                chain: self.module.chain().clone(),
            })
            .await;
            if let Err(source) = outcome {
                let failure = HookExecutionError {
                    metadata,
                    source: CallbackFailure::new(source),
                };
                warn!(error = %failure, cause = %failure.source, "error hook failed");
            }
        }
    }
}

/// Runs `action` of `module` through the hook pipeline.
///
/// Boxed so that actions may dispatch further actions on the same chain.
pub(crate) fn run_action(
    module: ModuleHandle,
    action: String,
    payload: Value,
) -> BoxFuture<'static, Result<Value, DispatchError>> {
    async move {
        if module.definition().action(&action).is_none() {
            return Err(DispatchError::UnknownAction {
                module: module.name().to_string(),
                action,
            });
        }

        let pipeline = Pipeline { module, action };
        debug!(module = pipeline.module.name(), action = %pipeline.action, "running action");
        match pipeline.run_success_path(payload).await {
            Ok(result) => Ok(result),
            Err(error) => {
                let failure = CallbackFailure::new(error);
                pipeline.run_error_hooks(&failure).await;
                Err(DispatchError::ActionExecution {
                    module: pipeline.module.name().to_string(),
                    action: pipeline.action,
                    source: failure,
                })
            }
        }
    }
    .boxed()
}

#[cfg(test)]
#[path = "tests/runner_tests.rs"]
mod tests;
