//! Execution units
//!
//! An [`ExecutionUnit`] is the private namespace one plugin file runs in: a
//! fresh Lua table used as the chunk environment. It never sees the host
//! globals directly, only a curated set of base functions, private copies of
//! `string` and `table`, and capability entry points bound to the unit's own
//! [`CallerOrigin`].

use mlua::{Function, Lua, MultiValue, ObjectLike, Table, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::sandbox::api::register_logging_api;
use crate::sandbox::budget::protected_calls;
use crate::sandbox::capability::{CallerOrigin, CapabilityTable, EvalRequest, bind_entry_points};
use crate::sandbox::error::LoadError;
use crate::sandbox::metadata::PluginMetadata;

/// Base functions copied from the host globals as-is
const SAFE_GLOBALS: &[&str] = &[
    "_VERSION",
    "assert",
    "error",
    "ipairs",
    "next",
    "pairs",
    "rawequal",
    "rawget",
    "rawlen",
    "rawset",
    "select",
    "setmetatable",
    "tonumber",
    "tostring",
    "type",
];

/// Libraries each unit gets its own shallow copy of
const COPIED_LIBRARIES: &[&str] = &["string", "table"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Unloaded,
    Executing,
    Loaded,
    Failed,
}

#[derive(Debug)]
pub struct ExecutionUnit {
    id: String,
    path: PathBuf,
    origin: CallerOrigin,
    namespace: Table,
    state: UnitState,
}

impl ExecutionUnit {
    /// Create an unloaded unit for `path`, named after the file stem
    pub fn new(
        lua: &Lua,
        table: &Arc<CapabilityTable>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, LoadError> {
        let path = path.into();
        let id = unit_id(&path)?;
        let origin = CallerOrigin::Plugin(id.clone());
        let namespace = build_namespace(lua, table, &origin)?;

        Ok(Self {
            id,
            path,
            origin,
            namespace,
            state: UnitState::Unloaded,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn origin(&self) -> &CallerOrigin {
        &self.origin
    }

    pub fn namespace(&self) -> &Table {
        &self.namespace
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    /// Run the plugin's top-level code into the namespace
    ///
    /// Callers are expected to have capabilities intercepted around this.
    pub(crate) fn execute(&mut self, lua: &Lua, source: &str) -> mlua::Result<()> {
        self.state = UnitState::Executing;

        let result = lua
            .load(source)
            .set_name(format!("@{}", self.path.display()))
            .set_environment(self.namespace.clone())
            .exec();

        self.state = if result.is_ok() {
            UnitState::Loaded
        } else {
            UnitState::Failed
        };
        result
    }

    pub(crate) fn mark_failed(&mut self) {
        self.state = UnitState::Failed;
    }

    /// Look up a global the plugin defined
    pub fn attribute(&self, name: &str) -> mlua::Result<Value> {
        self.namespace.raw_get(name)
    }

    /// Read `NAME` and `AUTHOR`, falling back to the unit id and an empty author
    pub fn metadata(&self, lua: &Lua) -> Result<PluginMetadata, LoadError> {
        let name = coerce_attribute(lua, &self.namespace, "NAME")?
            .unwrap_or_else(|| self.id.clone());
        let author = coerce_attribute(lua, &self.namespace, "AUTHOR")?.unwrap_or_default();
        Ok(PluginMetadata::new(name, author))
    }
}

fn unit_id(path: &Path) -> Result<String, LoadError> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .map(str::to_string)
        .ok_or_else(|| LoadError::InvalidPath(path.to_path_buf()))
}

/// Render an attribute the way `tostring` would, as long as that runs no
/// plugin code: tables carrying a `__tostring` metamethod are rejected
fn coerce_attribute(
    lua: &Lua,
    namespace: &Table,
    attribute: &'static str,
) -> Result<Option<String>, LoadError> {
    let value: Value = namespace.raw_get(attribute)?;
    if let Value::Table(table) = &value {
        if has_tostring(table)? {
            return Err(LoadError::Metadata {
                attribute,
                type_name: value.type_name(),
            });
        }
    }

    let text = match value {
        Value::Nil => return Ok(None),
        Value::Boolean(flag) => flag.to_string(),
        Value::String(_) | Value::Integer(_) | Value::Number(_) => {
            let type_name = value.type_name();
            match lua.coerce_string(value)? {
                Some(text) => String::from(&*text.to_str()?),
                None => return Err(LoadError::Metadata { attribute, type_name }),
            }
        }
        other => {
            let tostring: Function = lua.globals().get("tostring")?;
            tostring.call::<String>(other)?
        }
    };
    Ok(Some(text.trim().to_string()))
}

fn has_tostring(table: &Table) -> mlua::Result<bool> {
    match table.metatable() {
        Some(metatable) => Ok(!metatable.raw_get::<Value>("__tostring")?.is_nil()),
        None => Ok(false),
    }
}

fn shallow_copy(lua: &Lua, source: &Table) -> mlua::Result<Table> {
    let copy = lua.create_table()?;
    source.for_each(|key: Value, value: Value| copy.raw_set(key, value))?;
    Ok(copy)
}

fn build_namespace(
    lua: &Lua,
    table: &Arc<CapabilityTable>,
    origin: &CallerOrigin,
) -> mlua::Result<Table> {
    let globals = lua.globals();
    let namespace = lua.create_table()?;

    for name in SAFE_GLOBALS {
        namespace.raw_set(*name, globals.get::<Value>(*name)?)?;
    }

    for name in COPIED_LIBRARIES {
        let library: Table = globals.get(*name)?;
        namespace.raw_set(*name, shallow_copy(lua, &library)?)?;
    }

    let (pcall, xpcall) = protected_calls(lua)?;
    namespace.raw_set("pcall", pcall)?;
    namespace.raw_set("xpcall", xpcall)?;

    let entry = bind_entry_points(lua, table, origin.clone())?;
    let io = lua.create_table()?;
    io.raw_set("open", entry.open)?;
    namespace.raw_set("io", io)?;
    namespace.raw_set("require", isolated_require(lua, entry.require)?)?;
    namespace.raw_set("load", entry.load)?;

    bind_file_loaders(lua, table, origin, &namespace)?;

    let id = match origin {
        CallerOrigin::Plugin(id) => id.as_str(),
        CallerOrigin::Trusted => "host",
    };
    register_logging_api(lua, &namespace, id)?;

    namespace.raw_set("_G", namespace.clone())?;
    Ok(namespace)
}

/// Wrap `require` so module tables reach the unit as its own shallow copies,
/// one per module name. Every call still goes through the capability check.
fn isolated_require(lua: &Lua, require: Function) -> mlua::Result<Function> {
    let copies = lua.create_table()?;
    lua.create_function(move |lua, name: String| {
        let module = match require.call::<Value>(name.as_str())? {
            Value::Table(module) => module,
            other => return Ok(other),
        };
        if let Some(copy) = copies.raw_get::<Option<Table>>(name.as_str())? {
            return Ok(Value::Table(copy));
        }
        let copy = shallow_copy(lua, &module)?;
        copies.raw_set(name, copy.clone())?;
        Ok(Value::Table(copy))
    })
}

/// `loadfile` and `dofile` need both a file handle and an evaluation, so
/// they go through both capability checks
fn bind_file_loaders(
    lua: &Lua,
    table: &Arc<CapabilityTable>,
    origin: &CallerOrigin,
    namespace: &Table,
) -> mlua::Result<()> {
    let loadfile = {
        let table = Arc::clone(table);
        let origin = origin.clone();
        let env = namespace.clone();
        lua.create_function(move |lua, path: String| {
            load_file(lua, &table, &origin, &env, &path)
        })?
    };

    let dofile = {
        let table = Arc::clone(table);
        let origin = origin.clone();
        let env = namespace.clone();
        lua.create_function(move |lua, path: String| {
            load_file(lua, &table, &origin, &env, &path)?.call::<MultiValue>(())
        })?
    };

    namespace.raw_set("loadfile", loadfile)?;
    namespace.raw_set("dofile", dofile)?;
    Ok(())
}

fn load_file(
    lua: &Lua,
    table: &CapabilityTable,
    origin: &CallerOrigin,
    env: &Table,
    path: &str,
) -> mlua::Result<Function> {
    let mut opened = table.open(lua, origin, path, Some("r"))?.into_iter();
    let source: String = match opened.next() {
        Some(Value::UserData(handle)) => {
            let source = handle.call_method("read", "a")?;
            handle.call_method::<()>("close", ())?;
            source
        }
        _ => {
            let reason = match opened.next() {
                Some(Value::String(message)) => message.to_string_lossy().to_string(),
                _ => "unknown error".to_string(),
            };
            return Err(mlua::Error::runtime(format!("cannot open {}: {}", path, reason)));
        }
    };

    let request = EvalRequest {
        chunk: Value::String(lua.create_string(&source)?),
        chunk_name: Some(format!("@{}", path)),
        env: Some(env.clone()),
    };
    let mut loaded = table.evaluate(lua, origin, request)?.into_iter();
    match loaded.next() {
        Some(Value::Function(chunk)) => Ok(chunk),
        _ => Err(mlua::Error::runtime(format!("cannot load {}", path))),
    }
}
