use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    future::Future,
    sync::{Arc, OnceLock},
};

use futures::{future::BoxFuture, FutureExt};
use regex::Regex;
use serde_json::{Map, Value};

use crate::{
    chain::{ActionContext, Getters},
    error::RegistryError,
    runner::HookContext,
};

pub type StateFn = Arc<dyn Fn() -> Value + Send + Sync>;
pub type MutationFn = Arc<dyn Fn(&mut Value, &Value) -> anyhow::Result<()> + Send + Sync>;
pub type ActionFn =
    Arc<dyn Fn(ActionContext, Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
pub type GetterFn = Arc<dyn Fn(&Value, &Getters) -> Value + Send + Sync>;
pub type HookFn = Arc<dyn Fn(HookContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

fn valid_name(name: &str) -> bool {
    static NAME: OnceLock<Regex> = OnceLock::new();
    NAME.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"))
        .is_match(name)
}

fn check_name(kind: &'static str, name: &str) -> Result<(), RegistryError> {
    if valid_name(name) {
        Ok(())
    } else {
        Err(RegistryError::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    Before,
    After,
    Error,
}

impl HookPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::After => "after",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookTarget {
    All,
    Action(String),
}

/// A module hook slot such as `before:all` or `error:increment`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HookName {
    pub phase: HookPhase,
    pub target: HookTarget,
}

impl HookName {
    pub fn new(phase: HookPhase, target: HookTarget) -> Self {
        Self { phase, target }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let (phase, target) = raw.split_once(':')?;
        let phase = match phase {
            "before" => HookPhase::Before,
            "after" => HookPhase::After,
            "error" => HookPhase::Error,
            _ => return None,
        };
        let target = match target {
            "all" => HookTarget::All,
            action if valid_name(action) => HookTarget::Action(action.to_string()),
            _ => return None,
        };
        Some(Self { phase, target })
    }
}

impl fmt::Display for HookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            HookTarget::All => write!(f, "{}:all", self.phase.as_str()),
            HookTarget::Action(action) => write!(f, "{}:{action}", self.phase.as_str()),
        }
    }
}

/// Hooks applied to every action of every module, ahead of module hooks of
/// the same phase.
#[derive(Clone, Default)]
pub struct HookSet {
    pub(crate) before: Option<HookFn>,
    pub(crate) after: Option<HookFn>,
    pub(crate) error: Option<HookFn>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.before = Some(box_hook(hook));
        self
    }

    pub fn after<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.after = Some(box_hook(hook));
        self
    }

    pub fn error<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.error = Some(box_hook(hook));
        self
    }

    pub(crate) fn get(&self, phase: HookPhase) -> Option<&HookFn> {
        match phase {
            HookPhase::Before => self.before.as_ref(),
            HookPhase::After => self.after.as_ref(),
            HookPhase::Error => self.error.as_ref(),
        }
    }
}

fn box_hook<F, Fut>(hook: F) -> HookFn
where
    F: Fn(HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| hook(ctx).boxed())
}

/// A validated module: state factory, mutations, actions, getters and hooks.
pub struct ModuleDefinition {
    name: String,
    state: Option<StateFn>,
    mutations: HashMap<String, MutationFn>,
    actions: HashMap<String, ActionFn>,
    getters: HashMap<String, GetterFn>,
    hooks: HashMap<HookName, HookFn>,
}

impl ModuleDefinition {
    pub fn builder(name: impl Into<String>) -> ModuleBuilder {
        ModuleBuilder {
            name: name.into(),
            state: None,
            mutations: Vec::new(),
            actions: Vec::new(),
            getters: Vec::new(),
            hooks: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fresh initial state; `{}` for modules without a state factory.
    pub fn initial_state(&self) -> Value {
        match &self.state {
            Some(factory) => factory(),
            None => Value::Object(Map::new()),
        }
    }

    pub fn mutation(&self, name: &str) -> Option<&MutationFn> {
        self.mutations.get(name)
    }

    pub fn action(&self, name: &str) -> Option<&ActionFn> {
        self.actions.get(name)
    }

    pub fn getter(&self, name: &str) -> Option<&GetterFn> {
        self.getters.get(name)
    }

    pub fn hook(&self, phase: HookPhase, target: HookTarget) -> Option<&HookFn> {
        self.hooks.get(&HookName { phase, target })
    }

    pub fn action_names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }

    pub fn getter_names(&self) -> impl Iterator<Item = &str> {
        self.getters.keys().map(String::as_str)
    }
}

impl fmt::Debug for ModuleDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDefinition")
            .field("name", &self.name)
            .field("mutations", &self.mutations.keys().collect::<Vec<_>>())
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("getters", &self.getters.keys().collect::<Vec<_>>())
            .field("hooks", &self.hooks.keys().map(ToString::to_string).collect::<Vec<_>>())
            .finish()
    }
}

pub struct ModuleBuilder {
    name: String,
    state: Option<StateFn>,
    mutations: Vec<(String, MutationFn)>,
    actions: Vec<(String, ActionFn)>,
    getters: Vec<(String, GetterFn)>,
    hooks: Vec<(String, HookFn)>,
}

impl ModuleBuilder {
    pub fn state<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.state = Some(Arc::new(factory));
        self
    }

    pub fn mutation<F>(mut self, name: impl Into<String>, mutation: F) -> Self
    where
        F: Fn(&mut Value, &Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.mutations.push((name.into(), Arc::new(mutation)));
        self
    }

    pub fn action<F, Fut>(mut self, name: impl Into<String>, action: F) -> Self
    where
        F: Fn(ActionContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let action: ActionFn = Arc::new(move |ctx, payload| action(ctx, payload).boxed());
        self.actions.push((name.into(), action));
        self
    }

    pub fn getter<F>(mut self, name: impl Into<String>, getter: F) -> Self
    where
        F: Fn(&Value, &Getters) -> Value + Send + Sync + 'static,
    {
        self.getters.push((name.into(), Arc::new(getter)));
        self
    }

    /// Attaches a hook by slot name: `before:all`, `before:{action}`,
    /// `after:all`, `after:{action}`, `error:all` or `error:{action}`.
    pub fn hook<F, Fut>(mut self, name: impl Into<String>, hook: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.push((name.into(), box_hook(hook)));
        self
    }

    pub fn build(self) -> Result<ModuleDefinition, RegistryError> {
        check_name("module", &self.name)?;
        let module = self.name;
        let mutations = collect_unique(&module, "mutation", self.mutations)?;
        let actions = collect_unique(&module, "action", self.actions)?;
        let getters = collect_unique(&module, "getter", self.getters)?;

        let mut hooks = HashMap::new();
        for (raw, hook) in self.hooks {
            let invalid = |reason| RegistryError::InvalidHook {
                module: module.clone(),
                hook: raw.clone(),
                reason,
            };
            let name = HookName::parse(&raw)
                .ok_or_else(|| invalid("expected {before|after|error}:{all|action}"))?;
            if let HookTarget::Action(action) = &name.target {
                if !actions.contains_key(action) {
                    return Err(invalid("no such action"));
                }
            }
            if hooks.insert(name, hook).is_some() {
                return Err(invalid("declared twice"));
            }
        }

        Ok(ModuleDefinition {
            name: module,
            state: self.state,
            mutations,
            actions,
            getters,
            hooks,
        })
    }
}

fn collect_unique<T>(
    module: &str,
    kind: &'static str,
    entries: Vec<(String, T)>,
) -> Result<HashMap<String, T>, RegistryError> {
    let mut out = HashMap::with_capacity(entries.len());
    for (name, value) in entries {
        check_name(kind, &name)?;
        if out.contains_key(&name) {
            return Err(RegistryError::Duplicate {
                module: module.to_string(),
                kind,
                name,
            });
        }
        out.insert(name, value);
    }
    Ok(out)
}

/// Read-only set of module definitions and global hooks, built once at startup.
pub struct Registry {
    modules: BTreeMap<String, Arc<ModuleDefinition>>,
    global_hooks: Vec<HookSet>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn module(&self, name: &str) -> Option<&Arc<ModuleDefinition>> {
        self.modules.get(name)
    }

    pub fn module_names(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }

    pub fn global_hooks(&self) -> &[HookSet] {
        &self.global_hooks
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("modules", &self.modules.values().collect::<Vec<_>>())
            .field("global_hooks", &self.global_hooks.len())
            .finish()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    modules: Vec<ModuleDefinition>,
    global_hooks: Vec<HookSet>,
}

impl RegistryBuilder {
    pub fn module(mut self, module: ModuleDefinition) -> Self {
        self.modules.push(module);
        self
    }

    /// Appends a global hook set. Sets run in the order they were added.
    pub fn global_hooks(mut self, hooks: HookSet) -> Self {
        self.global_hooks.push(hooks);
        self
    }

    pub fn build(self) -> Result<Arc<Registry>, RegistryError> {
        let mut modules = BTreeMap::new();
        for module in self.modules {
            let name = module.name().to_string();
            if modules.insert(name.clone(), Arc::new(module)).is_some() {
                return Err(RegistryError::DuplicateModule(name));
            }
        }
        Ok(Arc::new(Registry {
            modules,
            global_hooks: self.global_hooks,
        }))
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
