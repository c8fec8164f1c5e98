use std::{fmt, sync::Arc};

use shared::domain::ConnectionId;
use storage::StoreError;
use thiserror::Error;

use crate::runner::HookMetadata;

/// Error returned by user code (action, hook or mutation), shared so that
/// error hooks can observe the exact value that is later returned to the caller.
#[derive(Clone)]
pub struct CallbackFailure(Arc<anyhow::Error>);

impl CallbackFailure {
    pub fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }
}

impl fmt::Debug for CallbackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for CallbackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for CallbackFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid {kind} name '{name}'")]
    InvalidName { kind: &'static str, name: String },
    #[error("duplicate {kind} '{name}' in module '{module}'")]
    Duplicate {
        module: String,
        kind: &'static str,
        name: String,
    },
    #[error("module '{0}' is registered twice")]
    DuplicateModule(String),
    #[error("invalid hook '{hook}' in module '{module}': {reason}")]
    InvalidHook {
        module: String,
        hook: String,
        reason: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("unknown module '{0}'")]
    UnknownModule(String),
    #[error("unknown action '{module}/{action}'")]
    UnknownAction { module: String, action: String },
    #[error("unknown mutation '{module}/{mutation}'")]
    UnknownMutation { module: String, mutation: String },
    #[error("unknown getter '{module}/{getter}'")]
    UnknownGetter { module: String, getter: String },
    #[error("action '{module}/{action}' failed")]
    ActionExecution {
        module: String,
        action: String,
        #[source]
        source: CallbackFailure,
    },
    #[error("mutation '{module}/{mutation}' failed")]
    MutationFailed {
        module: String,
        mutation: String,
        #[source]
        source: CallbackFailure,
    },
    #[error(transparent)]
    Store(StoreError),
}

impl DispatchError {
    pub fn is_unknown_connection(&self) -> bool {
        matches!(self, Self::UnknownConnection(_))
    }

    /// The error raised by user code at the bottom of a (possibly nested)
    /// action failure, unchanged.
    pub fn original_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::ActionExecution { source, .. } => {
                let inner = source.inner();
                match inner.downcast_ref::<DispatchError>() {
                    Some(nested @ DispatchError::ActionExecution { .. }) => nested.original_error(),
                    _ => Some(inner),
                }
            }
            _ => None,
        }
    }
}

impl From<StoreError> for DispatchError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::UnknownConnection(id) => Self::UnknownConnection(id),
            other => Self::Store(other),
        }
    }
}

/// A failure inside an error hook. Logged, never returned to the caller.
#[derive(Debug, Error)]
#[error("hook '{}' for '{}/{}' failed", .metadata.hook_name, .metadata.module_name, .metadata.action_name)]
pub struct HookExecutionError {
    pub metadata: HookMetadata,
    #[source]
    pub source: CallbackFailure,
}
