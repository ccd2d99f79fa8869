//! Policy engine
//!
//! Decision logic for the three guarded capabilities and the guard
//! implementations the interceptor swaps into the [`CapabilityTable`]:
//! - module resolution: trusted callers and allow-listed modules pass,
//!   silenced identifiers resolve to nil, everything else is denied
//! - file handles: always denied
//! - dynamic evaluation: only trusted callers

use mlua::{Lua, MultiValue, Value};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};

use crate::sandbox::capability::{
    CallerOrigin, CapabilityTable, EvalRequest, Evaluator, FileOpener, ModuleResolver,
};
use crate::sandbox::error::{CapabilityDenied, CapabilityKind};

/// Ordered set of module identifiers a plugin may resolve
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllowList(Vec<String>);

impl AllowList {
    pub fn new<I, S>(modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        modules.into_iter().collect()
    }

    pub fn contains(&self, module: &str) -> bool {
        self.0.iter().any(|allowed| allowed == module)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for AllowList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut modules: Vec<String> = Vec::new();
        for module in iter {
            let module = module.into();
            if !modules.contains(&module) {
                modules.push(module);
            }
        }
        AllowList(modules)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportDecision {
    Delegate,
    Silence,
    Deny,
}

#[derive(Debug, Clone, Default)]
pub struct Policy {
    allow_list: AllowList,
    silenced: Vec<String>,
}

impl Policy {
    pub fn new(allow_list: AllowList, silenced: Vec<String>) -> Self {
        Self {
            allow_list,
            silenced,
        }
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    pub fn import_decision(&self, origin: &CallerOrigin, module: &str) -> ImportDecision {
        if origin.is_trusted() {
            return ImportDecision::Delegate;
        }
        if self.silenced.iter().any(|silenced| silenced == module) {
            return ImportDecision::Silence;
        }
        if self.allow_list.contains(module) {
            ImportDecision::Delegate
        } else {
            ImportDecision::Deny
        }
    }

    pub fn eval_permitted(&self, origin: &CallerOrigin) -> bool {
        origin.is_trusted()
    }
}

/// Allow-list guard around the real resolver
pub struct GuardedResolver {
    real: Arc<dyn ModuleResolver>,
    policy: Arc<Policy>,
    table: Weak<CapabilityTable>,
}

impl GuardedResolver {
    pub fn new(
        real: Arc<dyn ModuleResolver>,
        policy: Arc<Policy>,
        table: Weak<CapabilityTable>,
    ) -> Self {
        Self {
            real,
            policy,
            table,
        }
    }

    /// Run the real resolver with the real resolver back in the table, so
    /// resolutions it triggers internally are not subject to this guard
    fn delegate(&self, lua: &Lua, origin: &CallerOrigin, module: &str) -> mlua::Result<Value> {
        let _reentry = self.table.upgrade().map(|table| {
            let guarded = table.replace_resolver(Arc::clone(&self.real));
            ResolverReentry {
                table,
                guarded: Some(guarded),
            }
        });
        self.real.resolve(lua, origin, module)
    }
}

impl ModuleResolver for GuardedResolver {
    fn resolve(&self, lua: &Lua, origin: &CallerOrigin, module: &str) -> mlua::Result<Value> {
        match self.policy.import_decision(origin, module) {
            ImportDecision::Delegate => self.delegate(lua, origin, module),
            ImportDecision::Silence => {
                crate::log_debug!("Silenced require('{}') from {}", module, origin);
                Ok(Value::Nil)
            }
            ImportDecision::Deny => {
                crate::log_debug!("Denied require('{}') from {}", module, origin);
                Err(CapabilityDenied::new(CapabilityKind::Import, module).into_lua())
            }
        }
    }
}

/// Puts the guard back in the resolver slot when the delegated call ends
struct ResolverReentry {
    table: Arc<CapabilityTable>,
    guarded: Option<Arc<dyn ModuleResolver>>,
}

impl Drop for ResolverReentry {
    fn drop(&mut self) {
        if let Some(guarded) = self.guarded.take() {
            self.table.replace_resolver(guarded);
        }
    }
}

/// Refuses every file handle
pub struct DenyAllOpener;

impl FileOpener for DenyAllOpener {
    fn open(
        &self,
        _lua: &Lua,
        origin: &CallerOrigin,
        path: &str,
        mode: Option<&str>,
    ) -> mlua::Result<MultiValue> {
        crate::log_debug!("Denied io.open('{}') from {}", path, origin);
        let detail = format!("{} (mode {})", path, mode.unwrap_or("r"));
        Err(CapabilityDenied::new(CapabilityKind::FileOpen, detail).into_lua())
    }
}

/// Lets only trusted callers evaluate source
pub struct GuardedEvaluator {
    real: Arc<dyn Evaluator>,
    policy: Arc<Policy>,
}

impl GuardedEvaluator {
    pub fn new(real: Arc<dyn Evaluator>, policy: Arc<Policy>) -> Self {
        Self { real, policy }
    }
}

impl Evaluator for GuardedEvaluator {
    fn evaluate(
        &self,
        lua: &Lua,
        origin: &CallerOrigin,
        request: EvalRequest,
    ) -> mlua::Result<MultiValue> {
        if self.policy.eval_permitted(origin) {
            return self.real.evaluate(lua, origin, request);
        }

        crate::log_debug!("Denied load() from {}", origin);
        let detail = match request.chunk_name {
            Some(name) => format!("load('{}') called from {}", name, origin),
            None => format!("load() called from {}", origin),
        };
        Err(CapabilityDenied::new(CapabilityKind::DynamicEval, detail).into_lua())
    }
}
