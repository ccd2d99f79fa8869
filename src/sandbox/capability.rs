//! Capability table
//!
//! The three host operations a plugin can reach for (module resolution,
//! file handle creation and dynamic source evaluation) are held here as
//! swappable slots. Every Lua-visible entry point (`require`, `io.open`,
//! `load`) is a small dispatcher bound to a [`CallerOrigin`] that forwards to
//! whatever implementation currently occupies the slot, so replacing a slot
//! changes behaviour for every caller on this host at once.

use mlua::{Function, Lua, MultiValue, Table, Value};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::sandbox::error::{CapabilityDenied, CapabilityKind};

/// Trust boundary marker bound into each entry point when it is created
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallerOrigin {
    /// Host infrastructure: host globals and host-provided libraries
    Trusted,
    /// Code belonging to the plugin unit with this identifier
    Plugin(String),
}

impl CallerOrigin {
    pub fn is_trusted(&self) -> bool {
        matches!(self, CallerOrigin::Trusted)
    }
}

impl fmt::Display for CallerOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallerOrigin::Trusted => f.write_str("host"),
            CallerOrigin::Plugin(id) => write!(f, "plugin '{}'", id),
        }
    }
}

/// Arguments of a `load` call
#[derive(Debug, Clone)]
pub struct EvalRequest {
    pub chunk: Value,
    pub chunk_name: Option<String>,
    pub env: Option<Table>,
}

pub trait ModuleResolver: Send + Sync {
    fn resolve(&self, lua: &Lua, origin: &CallerOrigin, name: &str) -> mlua::Result<Value>;
}

pub trait FileOpener: Send + Sync {
    fn open(
        &self,
        lua: &Lua,
        origin: &CallerOrigin,
        path: &str,
        mode: Option<&str>,
    ) -> mlua::Result<MultiValue>;
}

pub trait Evaluator: Send + Sync {
    fn evaluate(
        &self,
        lua: &Lua,
        origin: &CallerOrigin,
        request: EvalRequest,
    ) -> mlua::Result<MultiValue>;
}

/// The interpreter's own `require`
pub struct LuaRequire {
    require: Function,
}

impl ModuleResolver for LuaRequire {
    fn resolve(&self, _lua: &Lua, _origin: &CallerOrigin, name: &str) -> mlua::Result<Value> {
        self.require.call::<Value>(name)
    }
}

/// The interpreter's own `io.open`
pub struct LuaOpen {
    open: Function,
}

impl FileOpener for LuaOpen {
    fn open(
        &self,
        _lua: &Lua,
        _origin: &CallerOrigin,
        path: &str,
        mode: Option<&str>,
    ) -> mlua::Result<MultiValue> {
        self.open.call::<MultiValue>((path, mode))
    }
}

/// The interpreter's own `load`, restricted to text chunks
pub struct LuaLoad {
    load: Function,
}

impl Evaluator for LuaLoad {
    fn evaluate(
        &self,
        _lua: &Lua,
        _origin: &CallerOrigin,
        request: EvalRequest,
    ) -> mlua::Result<MultiValue> {
        // Passing an explicit nil env would detach the chunk from any env
        match request.env {
            Some(env) => self
                .load
                .call::<MultiValue>((request.chunk, request.chunk_name, "t", env)),
            None => self
                .load
                .call::<MultiValue>((request.chunk, request.chunk_name, "t")),
        }
    }
}

pub(crate) struct Slots {
    pub(crate) resolver: Arc<dyn ModuleResolver>,
    pub(crate) opener: Arc<dyn FileOpener>,
    pub(crate) evaluator: Arc<dyn Evaluator>,
    pub(crate) intercepted: bool,
}

impl Slots {
    /// Plugin origins only reach a capability while the guards are installed.
    /// Finalizers and exported functions called after a run are refused.
    fn admit(
        &self,
        origin: &CallerOrigin,
        kind: CapabilityKind,
        detail: &str,
    ) -> mlua::Result<()> {
        if self.intercepted || origin.is_trusted() {
            return Ok(());
        }
        crate::log_debug!("Denied {} from {} outside a sandboxed run", kind, origin);
        let detail = format!("{} (called from {} outside a sandboxed run)", detail, origin);
        Err(CapabilityDenied::new(kind, detail).into_lua())
    }
}

/// Swappable capability implementations shared by every entry point of a host
pub struct CapabilityTable {
    slots: Mutex<Slots>,
}

impl CapabilityTable {
    pub fn new(
        resolver: Arc<dyn ModuleResolver>,
        opener: Arc<dyn FileOpener>,
        evaluator: Arc<dyn Evaluator>,
    ) -> Self {
        Self {
            slots: Mutex::new(Slots {
                resolver,
                opener,
                evaluator,
                intercepted: false,
            }),
        }
    }

    /// Capture `require`, `io.open` and `load` from the interpreter's globals
    ///
    /// Must run before [`bind_entry_points`] rewires those globals.
    pub fn from_lua(lua: &Lua) -> mlua::Result<Self> {
        let globals = lua.globals();
        let io: Table = globals.get("io")?;

        Ok(Self::new(
            Arc::new(LuaRequire {
                require: globals.get("require")?,
            }),
            Arc::new(LuaOpen {
                open: io.get("open")?,
            }),
            Arc::new(LuaLoad {
                load: globals.get("load")?,
            }),
        ))
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn resolve(&self, lua: &Lua, origin: &CallerOrigin, name: &str) -> mlua::Result<Value> {
        let resolver = {
            let slots = self.lock();
            slots.admit(origin, CapabilityKind::Import, name)?;
            Arc::clone(&slots.resolver)
        };
        resolver.resolve(lua, origin, name)
    }

    pub fn open(
        &self,
        lua: &Lua,
        origin: &CallerOrigin,
        path: &str,
        mode: Option<&str>,
    ) -> mlua::Result<MultiValue> {
        let opener = {
            let slots = self.lock();
            slots.admit(origin, CapabilityKind::FileOpen, path)?;
            Arc::clone(&slots.opener)
        };
        opener.open(lua, origin, path, mode)
    }

    pub fn evaluate(
        &self,
        lua: &Lua,
        origin: &CallerOrigin,
        request: EvalRequest,
    ) -> mlua::Result<MultiValue> {
        let evaluator = {
            let slots = self.lock();
            slots.admit(origin, CapabilityKind::DynamicEval, "load()")?;
            Arc::clone(&slots.evaluator)
        };
        evaluator.evaluate(lua, origin, request)
    }

    /// Put `resolver` in the resolver slot, returning the previous occupant
    pub(crate) fn replace_resolver(
        &self,
        resolver: Arc<dyn ModuleResolver>,
    ) -> Arc<dyn ModuleResolver> {
        std::mem::replace(&mut self.lock().resolver, resolver)
    }

    pub fn is_intercepted(&self) -> bool {
        self.lock().intercepted
    }

    pub fn snapshot(&self) -> CapabilitySnapshot {
        let slots = self.lock();
        CapabilitySnapshot {
            resolver: Arc::clone(&slots.resolver),
            opener: Arc::clone(&slots.opener),
            evaluator: Arc::clone(&slots.evaluator),
            intercepted: slots.intercepted,
        }
    }
}

/// Point-in-time view of a [`CapabilityTable`], equal only when every slot
/// holds the very same implementation
#[derive(Clone)]
pub struct CapabilitySnapshot {
    resolver: Arc<dyn ModuleResolver>,
    opener: Arc<dyn FileOpener>,
    evaluator: Arc<dyn Evaluator>,
    intercepted: bool,
}

impl PartialEq for CapabilitySnapshot {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.resolver, &other.resolver)
            && Arc::ptr_eq(&self.opener, &other.opener)
            && Arc::ptr_eq(&self.evaluator, &other.evaluator)
            && self.intercepted == other.intercepted
    }
}

impl fmt::Debug for CapabilitySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilitySnapshot")
            .field("resolver", &Arc::as_ptr(&self.resolver))
            .field("opener", &Arc::as_ptr(&self.opener))
            .field("evaluator", &Arc::as_ptr(&self.evaluator))
            .field("intercepted", &self.intercepted)
            .finish()
    }
}

/// `load(chunk [, chunkname [, mode [, env]]])`; the mode is always forced to text
type LoadArgs = (Value, Option<String>, Option<String>, Option<Table>);

/// Lua functions dispatching through a [`CapabilityTable`] on behalf of one origin
pub struct EntryPoints {
    pub require: Function,
    pub open: Function,
    pub load: Function,
}

pub fn bind_entry_points(
    lua: &Lua,
    table: &Arc<CapabilityTable>,
    origin: CallerOrigin,
) -> mlua::Result<EntryPoints> {
    let require = {
        let table = Arc::clone(table);
        let origin = origin.clone();
        lua.create_function(move |lua, name: String| table.resolve(lua, &origin, &name))?
    };

    let open = {
        let table = Arc::clone(table);
        let origin = origin.clone();
        lua.create_function(move |lua, (path, mode): (String, Option<String>)| {
            table.open(lua, &origin, &path, mode.as_deref())
        })?
    };

    let load = {
        let table = Arc::clone(table);
        lua.create_function(move |lua, (chunk, chunk_name, _mode, env): LoadArgs| {
            let request = EvalRequest {
                chunk,
                chunk_name,
                env,
            };
            table.evaluate(lua, &origin, request)
        })?
    };

    Ok(EntryPoints {
        require,
        open,
        load,
    })
}
