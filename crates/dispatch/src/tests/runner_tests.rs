use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use serde_json::json;
use shared::domain::ConnectionId;

use super::*;
use crate::{
    chain::ActionContext,
    engine::{DispatchEngine, DispatchRequest},
    registry::{HookSet, ModuleDefinition, Registry},
    test_support::CountingStore,
};

type Log = Arc<Mutex<Vec<String>>>;

fn record(log: &Log, entry: impl Into<String>) {
    log.lock().expect("log").push(entry.into());
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().expect("log").clone()
}

fn logging_hook(
    log: &Log,
    label: &'static str,
) -> impl Fn(HookContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static {
    let log = log.clone();
    move |ctx: HookContext| {
        let log = log.clone();
        async move {
            record(&log, format!("{label}:{}", ctx.metadata.hook_name));
            Ok::<(), anyhow::Error>(())
        }
        .boxed()
    }
}

fn failing_hook(
    log: &Log,
    label: &'static str,
) -> impl Fn(HookContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static {
    let log = log.clone();
    move |ctx: HookContext| {
        let log = log.clone();
        async move {
            record(&log, format!("{label}:{}", ctx.metadata.hook_name));
            Err::<(), anyhow::Error>(anyhow!("hook failure"))
        }
        .boxed()
    }
}

fn counter(log: &Log) -> crate::registry::ModuleBuilder {
    let on_increment = log.clone();
    let on_explode = log.clone();
    ModuleDefinition::builder("counter")
        .state(|| json!({ "counter": 0 }))
        .mutation("setCounter", |state, payload| {
            let current = state["counter"].as_i64().unwrap_or_default();
            state["counter"] = json!(current + payload.as_i64().unwrap_or_default());
            Ok(())
        })
        .action("increment", move |ctx: ActionContext, payload: Value| {
            let log = on_increment.clone();
            async move {
                record(&log, "action:increment");
                ctx.commit("setCounter", payload.clone())?;
                Ok::<_, anyhow::Error>(payload)
            }
        })
        .action("explode", move |_ctx: ActionContext, _payload: Value| {
            let log = on_explode.clone();
            async move {
                record(&log, "action:explode");
                Err::<Value, anyhow::Error>(anyhow!("boom"))
            }
        })
}

async fn engine_with(module: ModuleDefinition, globals: HookSet) -> (DispatchEngine, ConnectionId) {
    let registry = Registry::builder()
        .module(module)
        .global_hooks(globals)
        .build()
        .expect("registry");
    let engine = DispatchEngine::new(registry, CountingStore::new());
    let id = engine.new_connection().await.expect("connection");
    (engine, id)
}

#[tokio::test]
async fn hooks_run_in_pipeline_order_on_success() {
    let log = Log::default();
    let module = counter(&log)
        .hook("before:all", logging_hook(&log, "module"))
        .hook("before:increment", logging_hook(&log, "module"))
        .hook("after:all", logging_hook(&log, "module"))
        .hook("after:increment", logging_hook(&log, "module"))
        .hook("error:all", logging_hook(&log, "module"))
        .build()
        .expect("module");
    let globals = HookSet::new()
        .before(logging_hook(&log, "global"))
        .after(logging_hook(&log, "global"))
        .error(logging_hook(&log, "global"));
    let (engine, id) = engine_with(module, globals).await;

    engine
        .dispatch(DispatchRequest::new(id, "counter", "increment", json!(1)))
        .await
        .expect("dispatch");

    assert_eq!(
        entries(&log),
        [
            "global:before",
            "module:before:all",
            "module:before:increment",
            "action:increment",
            "global:after",
            "module:after:all",
            "module:after:increment",
        ]
    );
}

#[tokio::test]
async fn action_failure_runs_error_hooks_and_skips_after_hooks() {
    let log = Log::default();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observed = seen.clone();
    let module = counter(&log)
        .hook("after:all", logging_hook(&log, "module"))
        .hook("error:all", logging_hook(&log, "module"))
        .hook("error:explode", move |ctx: HookContext| {
            let observed = observed.clone();
            async move {
                let error = ctx.error().expect("error event").to_string();
                observed.lock().expect("seen").push(error);
                Ok::<(), anyhow::Error>(())
            }
        })
        .build()
        .expect("module");
    let globals = HookSet::new().error(logging_hook(&log, "global"));
    let (engine, id) = engine_with(module, globals).await;

    let err = engine
        .dispatch(DispatchRequest::new(id, "counter", "explode", json!(1)))
        .await
        .expect_err("action fails");

    assert!(matches!(err, DispatchError::ActionExecution { ref action, .. } if action == "explode"));
    assert_eq!(err.original_error().expect("original").to_string(), "boom");
    assert_eq!(
        entries(&log),
        ["action:explode", "global:error", "module:error:all"]
    );
    assert_eq!(*seen.lock().expect("seen"), ["boom"]);
}

#[tokio::test]
async fn failing_error_hook_does_not_stop_the_others_or_mask_the_error() {
    let log = Log::default();
    let module = counter(&log)
        .hook("error:all", failing_hook(&log, "module"))
        .hook("error:explode", logging_hook(&log, "module"))
        .build()
        .expect("module");
    let globals = HookSet::new().error(failing_hook(&log, "global"));
    let (engine, id) = engine_with(module, globals).await;

    let err = engine
        .dispatch(DispatchRequest::new(id, "counter", "explode", Value::Null))
        .await
        .expect_err("action fails");

    assert_eq!(err.original_error().expect("original").to_string(), "boom");
    assert_eq!(
        entries(&log),
        [
            "action:explode",
            "global:error",
            "module:error:all",
            "module:error:explode",
        ]
    );
}

#[tokio::test]
async fn before_hook_failure_skips_the_action() {
    let log = Log::default();
    let module = counter(&log)
        .hook("before:increment", failing_hook(&log, "module"))
        .hook("error:increment", logging_hook(&log, "module"))
        .build()
        .expect("module");
    let (engine, id) = engine_with(module, HookSet::new()).await;

    let err = engine
        .dispatch(DispatchRequest::new(id.clone(), "counter", "increment", json!(3)))
        .await
        .expect_err("before hook fails");

    assert_eq!(err.original_error().expect("original").to_string(), "hook failure");
    assert_eq!(
        entries(&log),
        ["module:before:increment", "module:error:increment"]
    );
    let state = engine
        .store()
        .get_state(&id, "counter", &|| json!({ "counter": 0 }))
        .await
        .expect("state");
    assert_eq!(state, json!({ "counter": 0 }));
}

#[tokio::test]
async fn after_hook_failure_fails_the_action() {
    let log = Log::default();
    let module = counter(&log)
        .hook("after:all", failing_hook(&log, "module"))
        .hook("error:all", logging_hook(&log, "module"))
        .build()
        .expect("module");
    let (engine, id) = engine_with(module, HookSet::new()).await;

    let err = engine
        .dispatch(DispatchRequest::new(id, "counter", "increment", json!(1)))
        .await
        .expect_err("after hook fails");

    assert!(matches!(err, DispatchError::ActionExecution { .. }));
    assert_eq!(
        entries(&log),
        ["action:increment", "module:after:all", "module:error:all"]
    );
}

#[tokio::test]
async fn after_hooks_see_result_and_recorded_mutations() {
    let log = Log::default();
    let seen = Arc::new(Mutex::new(None));
    let observed = seen.clone();
    let module = counter(&log)
        .hook("after:increment", move |ctx: HookContext| {
            let observed = observed.clone();
            async move {
                let result = ctx.action_result().cloned();
                let mutations = ctx.mutations().to_vec();
                *observed.lock().expect("seen") = Some((result, mutations));
                Ok::<(), anyhow::Error>(())
            }
        })
        .build()
        .expect("module");
    let (engine, id) = engine_with(module, HookSet::new()).await;

    engine
        .dispatch(DispatchRequest::new(id, "counter", "increment", json!(4)))
        .await
        .expect("dispatch");

    let (result, mutations) = seen.lock().expect("seen").clone().expect("after hook ran");
    assert_eq!(result, Some(json!(4)));
    assert_eq!(mutations, [CommitRecord::new("counter", "setCounter", json!(4))]);
}

#[tokio::test]
async fn nested_dispatch_runs_hooks_for_the_inner_action() {
    let log = Log::default();
    let module = counter(&log)
        .action("incrementTwice", |ctx: ActionContext, payload: Value| async move {
            ctx.dispatch("increment", payload.clone()).await?;
            ctx.dispatch("increment", payload).await
                .map_err(anyhow::Error::from)
        })
        .hook("before:all", logging_hook(&log, "module"))
        .build()
        .expect("module");
    let (engine, id) = engine_with(module, HookSet::new()).await;

    let outcome = engine
        .dispatch(DispatchRequest::new(id, "counter", "incrementTwice", json!(2)))
        .await
        .expect("dispatch");

    assert_eq!(outcome.action_result, json!(2));
    assert_eq!(outcome.mutations.len(), 2);
    assert_eq!(
        entries(&log),
        [
            "module:before:all",
            "module:before:all",
            "action:increment",
            "module:before:all",
            "action:increment",
        ]
    );
}

#[tokio::test]
async fn unknown_action_fails_without_running_hooks() {
    let log = Log::default();
    let module = counter(&log)
        .hook("error:all", logging_hook(&log, "module"))
        .build()
        .expect("module");
    let (engine, id) = engine_with(module, HookSet::new().before(logging_hook(&log, "global"))).await;

    let chain = engine.start_chain(id, Default::default());
    let handle = chain.load_module("counter").await.expect("counter");
    let err = handle.dispatch("missing", Value::Null).await.expect_err("unknown action");

    assert!(matches!(err, DispatchError::UnknownAction { ref action, .. } if action == "missing"));
    assert!(entries(&log).is_empty());
}
