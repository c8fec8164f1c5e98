use std::sync::Arc;

use anyhow::anyhow;
use dispatch::{ActionContext, HookContext, HookSet, ModuleDefinition, Registry, RegistryError};
use serde_json::{json, Value};
use tracing::{info, warn};

/// `counter` keeps `{counter: n}`; `increment` commits `setCounter` with its payload.
pub fn counter() -> Result<ModuleDefinition, RegistryError> {
    ModuleDefinition::builder("counter")
        .state(|| json!({ "counter": 0 }))
        .mutation("setCounter", |state, payload| {
            let by = payload
                .as_i64()
                .ok_or_else(|| anyhow!("setCounter expects an integer, got {payload}"))?;
            let current = state["counter"].as_i64().unwrap_or_default();
            state["counter"] = json!(current + by);
            Ok(())
        })
        .action("increment", |ctx: ActionContext, payload: Value| async move {
            let by = if payload.is_null() { json!(1) } else { payload };
            ctx.commit("setCounter", by)?;
            Ok::<_, anyhow::Error>(json!({ "before": ctx.state()["counter"] }))
        })
        .getter("doubled", |state, _| {
            json!(state["counter"].as_i64().unwrap_or_default() * 2)
        })
        .build()
}

fn logged_failures() -> HookSet {
    HookSet::new().error(|ctx: HookContext| async move {
        if let Some(error) = ctx.error() {
            warn!(
                module = %ctx.metadata.module_name,
                action = %ctx.metadata.action_name,
                %error,
                "action failed"
            );
        }
        Ok::<(), anyhow::Error>(())
    })
}

pub fn registry() -> Result<Arc<Registry>, RegistryError> {
    let registry = Registry::builder()
        .module(counter()?)
        .global_hooks(logged_failures())
        .build()?;
    info!(modules = ?registry.module_names(), "modules registered");
    Ok(registry)
}
