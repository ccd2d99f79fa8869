//! Execution budget
//!
//! A wall-clock limit on one sandboxed run, checked from a count hook every
//! [`BUDGET_CHECK_INTERVAL`] VM instructions. The deadline of the run in
//! progress is kept in the interpreter's app data so the protected-call
//! wrappers handed to plugins can refuse to swallow it.

use mlua::{Function, HookTriggers, Lua, VmState};
use std::time::{Duration, Instant};

use crate::config::BUDGET_CHECK_INTERVAL;
use crate::sandbox::error::BudgetExceeded;

/// Deadline of the sandboxed run currently executing
#[derive(Debug, Clone, Copy)]
struct RunDeadline {
    started: Instant,
    limit: Duration,
}

impl RunDeadline {
    fn check(&self) -> mlua::Result<()> {
        if self.started.elapsed() > self.limit {
            Err(mlua::Error::external(BudgetExceeded(self.limit)))
        } else {
            Ok(())
        }
    }
}

/// Fails with [`BudgetExceeded`] once the current run is past its deadline
fn check_deadline(lua: &Lua) -> mlua::Result<()> {
    let deadline = lua.app_data_ref::<RunDeadline>().map(|deadline| *deadline);
    match deadline {
        Some(deadline) => deadline.check(),
        None => Ok(()),
    }
}

/// Armed for the lifetime of one sandboxed run; removes the hook on drop
pub(crate) struct ExecutionBudget<'a> {
    lua: &'a Lua,
    armed: bool,
}

impl<'a> ExecutionBudget<'a> {
    pub(crate) fn arm(lua: &'a Lua, budget: Option<Duration>) -> mlua::Result<Self> {
        let Some(limit) = budget else {
            return Ok(Self { lua, armed: false });
        };

        let deadline = RunDeadline {
            started: Instant::now(),
            limit,
        };
        lua.set_app_data(deadline);
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(BUDGET_CHECK_INTERVAL),
            move |_lua, _debug| deadline.check().map(|()| VmState::Continue),
        )?;

        Ok(Self { lua, armed: true })
    }
}

impl Drop for ExecutionBudget<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.lua.remove_hook();
            self.lua.remove_app_data::<RunDeadline>();
        }
    }
}

// Failed calls consult the deadline; an exhausted budget is raised again
// instead of being returned as `false, err`
const PROTECTED_CALLS: &str = r#"
local pcall, xpcall, check_deadline = ...

local function settle(ok, ...)
    if not ok then
        check_deadline()
    end
    return ok, ...
end

return function(f, ...)
    return settle(pcall(f, ...))
end, function(f, handler, ...)
    return settle(xpcall(f, handler, ...))
end
"#;

/// `pcall` and `xpcall` for plugin namespaces that cannot catch a spent budget
pub(crate) fn protected_calls(lua: &Lua) -> mlua::Result<(Function, Function)> {
    let globals = lua.globals();
    let pcall: Function = globals.get("pcall")?;
    let xpcall: Function = globals.get("xpcall")?;
    let check = lua.create_function(|lua, ()| check_deadline(lua))?;

    lua.load(PROTECTED_CALLS)
        .set_name("=protected_calls")
        .call((pcall, xpcall, check))
}
