use serde_json::json;

use super::*;

fn noop_action(_ctx: ActionContext, payload: Value) -> BoxFuture<'static, anyhow::Result<Value>> {
    async move { Ok(payload) }.boxed()
}

fn noop_hook(_ctx: HookContext) -> BoxFuture<'static, anyhow::Result<()>> {
    async { Ok(()) }.boxed()
}

#[test]
fn hook_names_parse_and_display() {
    let name = HookName::parse("before:all").expect("before:all");
    assert_eq!(name, HookName::new(HookPhase::Before, HookTarget::All));
    assert_eq!(name.to_string(), "before:all");

    let name = HookName::parse("error:increment").expect("error:increment");
    assert_eq!(name.phase, HookPhase::Error);
    assert_eq!(name.target, HookTarget::Action("increment".into()));
    assert_eq!(name.to_string(), "error:increment");

    assert!(HookName::parse("before").is_none());
    assert!(HookName::parse("during:all").is_none());
    assert!(HookName::parse("after:not-valid").is_none());
}

#[test]
fn module_without_state_factory_starts_empty() {
    let module = ModuleDefinition::builder("empty").build().expect("module");
    assert_eq!(module.initial_state(), json!({}));
    assert_eq!(module.action_names().count(), 0);
}

#[test]
fn initial_state_is_fresh_on_every_call() {
    let module = ModuleDefinition::builder("list")
        .state(|| json!({ "items": [] }))
        .build()
        .expect("module");
    let mut first = module.initial_state();
    first["items"] = json!([1]);
    assert_eq!(module.initial_state(), json!({ "items": [] }));
}

#[test]
fn rejects_invalid_names() {
    let err = ModuleDefinition::builder("bad name").build().expect_err("module name");
    assert!(matches!(err, RegistryError::InvalidName { kind: "module", .. }));

    let err = ModuleDefinition::builder("ok")
        .action("2fast", noop_action)
        .build()
        .expect_err("action name");
    assert!(matches!(err, RegistryError::InvalidName { kind: "action", .. }));

    let err = ModuleDefinition::builder("ok")
        .mutation("set-value", |_, _| Ok(()))
        .build()
        .expect_err("mutation name");
    assert!(matches!(err, RegistryError::InvalidName { kind: "mutation", .. }));
}

#[test]
fn rejects_duplicate_members() {
    let err = ModuleDefinition::builder("counter")
        .action("increment", noop_action)
        .action("increment", noop_action)
        .build()
        .expect_err("duplicate action");
    assert!(matches!(
        err,
        RegistryError::Duplicate { kind: "action", ref name, .. } if name == "increment"
    ));
}

#[test]
fn validates_hook_slots() {
    let err = ModuleDefinition::builder("counter")
        .hook("before:missing", noop_hook)
        .build()
        .expect_err("hook for unknown action");
    assert!(matches!(err, RegistryError::InvalidHook { reason: "no such action", .. }));

    let err = ModuleDefinition::builder("counter")
        .hook("around:all", noop_hook)
        .build()
        .expect_err("unknown phase");
    assert!(matches!(err, RegistryError::InvalidHook { .. }));

    let err = ModuleDefinition::builder("counter")
        .hook("after:all", noop_hook)
        .hook("after:all", noop_hook)
        .build()
        .expect_err("duplicate slot");
    assert!(matches!(err, RegistryError::InvalidHook { reason: "declared twice", .. }));

    let module = ModuleDefinition::builder("counter")
        .action("increment", noop_action)
        .hook("before:increment", noop_hook)
        .hook("error:all", noop_hook)
        .build()
        .expect("module");
    assert!(module
        .hook(HookPhase::Before, HookTarget::Action("increment".into()))
        .is_some());
    assert!(module.hook(HookPhase::Error, HookTarget::All).is_some());
    assert!(module.hook(HookPhase::After, HookTarget::All).is_none());
}

#[test]
fn registry_rejects_duplicate_modules() {
    let err = Registry::builder()
        .module(ModuleDefinition::builder("a").build().expect("a"))
        .module(ModuleDefinition::builder("a").build().expect("a"))
        .build()
        .expect_err("duplicate module");
    assert!(matches!(err, RegistryError::DuplicateModule(ref name) if name == "a"));

    let registry = Registry::builder()
        .module(ModuleDefinition::builder("b").build().expect("b"))
        .module(ModuleDefinition::builder("a").build().expect("a"))
        .global_hooks(HookSet::new().before(noop_hook))
        .build()
        .expect("registry");
    assert_eq!(registry.module_names(), ["a", "b"]);
    assert!(registry.module("missing").is_none());
    assert_eq!(registry.global_hooks().len(), 1);
}
