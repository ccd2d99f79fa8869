//! Plugin-provided APIs
//!
//! Plugins get no stdout of their own: `print` and the `log_*` functions
//! forward to the host logger, tagged with the unit identifier.

use mlua::{Function, Lua, Table, Value, Variadic};

/// Log target of everything plugins emit
pub(crate) const TARGET: &str = module_path!();

/// Register `print`, `log_info`, `log_warn` and `log_error` into a plugin namespace
pub fn register_logging_api(lua: &Lua, namespace: &Table, unit_id: &str) -> mlua::Result<()> {
    let id = unit_id.to_string();
    let log_info_fn = lua.create_function(move |_lua, msg: String| {
        crate::log_info!("[plugin {}] {}", id, msg);
        Ok(())
    })?;

    let id = unit_id.to_string();
    let log_warn_fn = lua.create_function(move |_lua, msg: String| {
        crate::log_warn!("[plugin {}] {}", id, msg);
        Ok(())
    })?;

    let id = unit_id.to_string();
    let log_error_fn = lua.create_function(move |_lua, msg: String| {
        crate::log_error!("[plugin {}] {}", id, msg);
        Ok(())
    })?;

    // Same separator rules as the stock print
    let tostring: Function = lua.globals().get("tostring")?;
    let id = unit_id.to_string();
    let print_fn = lua.create_function(move |_lua, args: Variadic<Value>| {
        let mut parts = Vec::with_capacity(args.len());
        for arg in args {
            parts.push(tostring.call::<String>(arg)?);
        }
        crate::log_info!("[plugin {}] {}", id, parts.join("\t"));
        Ok(())
    })?;

    namespace.set("log_info", log_info_fn)?;
    namespace.set("log_warn", log_warn_fn)?;
    namespace.set("log_error", log_error_fn)?;
    namespace.set("print", print_fn)?;

    Ok(())
}
