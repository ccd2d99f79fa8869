//! Plugin host
//!
//! Owns the interpreter every plugin runs in, the [`CapabilityTable`] its
//! globals dispatch through, and the interceptor. Anything that runs plugin
//! code goes through [`PluginHost::sandboxed`], which serializes runs,
//! intercepts capabilities and arms the execution budget.

use mlua::{FromLuaMulti, Function, IntoLuaMulti, Lua, Table};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::config::SandboxConfig;
use crate::sandbox::budget::ExecutionBudget;
use crate::sandbox::capability::{CallerOrigin, CapabilityTable, bind_entry_points};
use crate::sandbox::error::{InterceptorError, LoadError};
use crate::sandbox::interceptor::Interceptor;
use crate::sandbox::policy::Policy;
use crate::sandbox::unit::ExecutionUnit;

pub struct PluginHost {
    lua: Lua,
    table: Arc<CapabilityTable>,
    policy: Arc<Policy>,
    interceptor: Interceptor,
    budget: Option<Duration>,
    slot: RunSlot,
}

impl PluginHost {
    /// Create a host with a fresh interpreter configured from `config`
    pub fn new(config: &SandboxConfig) -> mlua::Result<Self> {
        let lua = Lua::new();
        if config.memory_limit > 0 {
            lua.set_memory_limit(config.memory_limit)?;
        }
        Self::with_lua(lua, config)
    }

    /// Wrap an existing interpreter, rewiring its `require`, `io.open` and
    /// `load` to go through the capability table
    pub fn with_lua(lua: Lua, config: &SandboxConfig) -> mlua::Result<Self> {
        let table = Arc::new(CapabilityTable::from_lua(&lua)?);

        let entry = bind_entry_points(&lua, &table, CallerOrigin::Trusted)?;
        let globals = lua.globals();
        let io: Table = globals.get("io")?;
        io.set("open", entry.open)?;
        globals.set("require", entry.require)?;
        globals.set("load", entry.load)?;

        let policy = Arc::new(config.policy());
        let interceptor = Interceptor::new(Arc::clone(&table), Arc::clone(&policy));

        crate::log_debug!(
            "Plugin host ready (allow list: [{}])",
            policy.allow_list().iter().collect::<Vec<_>>().join(", ")
        );

        Ok(Self {
            lua,
            table,
            policy,
            interceptor,
            budget: config.budget(),
            slot: RunSlot::default(),
        })
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn capabilities(&self) -> &Arc<CapabilityTable> {
        &self.table
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Register a host library plugins can `require` once allow-listed
    ///
    /// The library runs in the host environment, so its own `require` and
    /// `load` calls are made with the trusted origin.
    pub fn register_module(&self, name: &str, source: &str) -> mlua::Result<()> {
        let package: Table = self.lua.globals().get("package")?;
        let preload: Table = package.get("preload")?;
        let loader = self
            .lua
            .load(source)
            .set_name(format!("=host:{}", name))
            .into_function()?;
        preload.set(name, loader)
    }

    /// Create an unloaded unit for `path` bound to this host's capabilities
    pub fn create_unit(
        &self,
        path: impl Into<std::path::PathBuf>,
    ) -> Result<ExecutionUnit, LoadError> {
        ExecutionUnit::new(&self.lua, &self.table, path)
    }

    /// Execute a unit's top-level code with capabilities intercepted
    pub fn execute(&self, unit: &mut ExecutionUnit, source: &str) -> Result<(), LoadError> {
        let result = self.sandboxed(|| unit.execute(&self.lua, source));
        if result.is_err() {
            unit.mark_failed();
        }
        result
    }

    /// Call a function a loaded plugin exported, with capabilities intercepted
    pub fn invoke<R: FromLuaMulti>(
        &self,
        unit: &ExecutionUnit,
        function: &str,
        args: impl IntoLuaMulti,
    ) -> Result<R, LoadError> {
        let function: Function = unit.namespace().raw_get(function)?;
        self.sandboxed(|| function.call::<R>(args))
    }

    /// Run `f` as plugin code: one run at a time, capabilities intercepted,
    /// execution budget armed. Everything is undone on every exit path.
    fn sandboxed<T>(&self, f: impl FnOnce() -> mlua::Result<T>) -> Result<T, LoadError> {
        let _ticket = self.slot.acquire()?;
        let _scope = self.interceptor.scope()?;
        let _budget = ExecutionBudget::arm(&self.lua, self.budget)?;
        f().map_err(LoadError::from)
    }
}

/// Serializes sandboxed runs across threads and rejects nested runs on the
/// thread that already holds the slot
#[derive(Default)]
struct RunSlot {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
}

impl RunSlot {
    fn acquire(&self) -> Result<RunTicket<'_>, InterceptorError> {
        let current = thread::current().id();
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match *owner {
                None => break,
                Some(holder) if holder == current => {
                    return Err(InterceptorError::AlreadyIntercepted);
                }
                Some(_) => {
                    owner = self
                        .released
                        .wait(owner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        *owner = Some(current);
        Ok(RunTicket { slot: self })
    }
}

struct RunTicket<'a> {
    slot: &'a RunSlot,
}

impl Drop for RunTicket<'_> {
    fn drop(&mut self) {
        let mut owner = self.slot.owner.lock().unwrap_or_else(PoisonError::into_inner);
        *owner = None;
        self.slot.released.notify_one();
    }
}
