//! Hook installation and global-primitive interposition.
//!
//! A refcounted stack of activation modes drives installation: the first
//! push captures the originals of `error`, `assert`, `debug.traceback` and
//! the coroutine constructors into a restore token, swaps in the debugger's
//! replacements and installs the line hook on the main task and every
//! registered coroutine; the last pop restores every site. Only the
//! top-of-stack mode decides whether the error-family overrides are active:
//! Function mode assumes the caller already runs under a protected-call
//! trap and leaves the globals alone.

use crate::command_loop::{self, StopParams};
use crate::controller::ThreadLiveness;
use crate::evaluator::{self, EvalTarget};
use crate::introspect::DebugLib;
use crate::threads::MAIN_THREAD_ID;
use crate::EngineState;
use lldbg_core::protocol::BreakType;
use lldbg_sourcemap::{path, remap_positions, SourceMapStore};
use mlua::{Function, Lua, MultiValue, RegistryKey, Table, Thread, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Hook activation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookMode {
    /// Line hook plus error/assert/traceback interposition
    Global,
    /// Line hook only; the caller supplies the protected-call trap
    Function,
}

/// Restore token holding every captured original
pub(crate) struct Originals {
    error: RegistryKey,
    assert: RegistryKey,
    traceback: RegistryKey,
    co_create: RegistryKey,
    co_wrap: RegistryKey,
    /// Whether the error-family overrides are currently swapped in
    overrides_active: bool,
}

/// Push one hook activation; installs everything on the first push
pub(crate) fn push_hook(
    state: &Arc<EngineState>,
    lua: &Lua,
    mode: HookMode,
) -> mlua::Result<()> {
    let first = {
        let mut stack = state.hook_stack.lock();
        let first = stack.is_empty();
        stack.push(mode);
        first
    };
    if first {
        if let Err(e) = install_base(state, lua) {
            // Partial setup must be reversible
            let _ = uninstall_base(state, lua);
            state.hook_stack.lock().clear();
            return Err(e);
        }
    }
    reconcile_overrides(state, lua)
}

/// Pop one hook activation; restores everything when the stack empties
pub(crate) fn pop_hook(state: &Arc<EngineState>, lua: &Lua) -> mlua::Result<()> {
    let empty = {
        let mut stack = state.hook_stack.lock();
        stack.pop();
        stack.is_empty()
    };
    if empty {
        uninstall_base(state, lua)
    } else {
        reconcile_overrides(state, lua)
    }
}

/// Drop every activation and restore all sites
pub(crate) fn clear_hooks(state: &Arc<EngineState>, lua: &Lua) -> mlua::Result<()> {
    state.hook_stack.lock().clear();
    uninstall_base(state, lua)
}

fn install_base(state: &Arc<EngineState>, lua: &Lua) -> mlua::Result<()> {
    debug!("installing debug hooks");
    let globals = lua.globals();
    let debug_table: Table = globals.get("debug")?;
    let coroutine_table: Table = globals.get("coroutine")?;

    let originals = Originals {
        error: lua.create_registry_value(globals.get::<_, Function>("error")?)?,
        assert: lua.create_registry_value(globals.get::<_, Function>("assert")?)?,
        traceback: lua.create_registry_value(debug_table.get::<_, Function>("traceback")?)?,
        co_create: lua.create_registry_value(coroutine_table.get::<_, Function>("create")?)?,
        co_wrap: lua.create_registry_value(coroutine_table.get::<_, Function>("wrap")?)?,
        overrides_active: false,
    };
    *state.originals.lock() = Some(originals);

    // The line hook itself
    let hook_state = Arc::clone(state);
    let hook = lua.create_function(move |lua, (_event, line): (String, Option<u32>)| {
        hook_event(&hook_state, lua, line.unwrap_or(0))
    })?;
    *state.hook_fn.lock() = Some(lua.create_registry_value(hook.clone())?);

    let dbg = DebugLib::fetch(lua)?;
    dbg.set_line_hook(None, &hook)?;
    let ids = state.threads.lock().ids();
    for id in ids {
        if let Some(thread) = state.threads.lock().thread_by_id(lua, id) {
            dbg.set_line_hook(Some(&thread), &hook)?;
        }
    }

    install_coroutine_overrides(state, lua, &coroutine_table)?;
    Ok(())
}

fn uninstall_base(state: &Arc<EngineState>, lua: &Lua) -> mlua::Result<()> {
    debug!("removing debug hooks and restoring globals");
    let dbg = DebugLib::fetch(lua)?;
    let globals = lua.globals();

    if let Some(originals) = state.originals.lock().take() {
        let debug_table: Table = globals.get("debug")?;
        let coroutine_table: Table = globals.get("coroutine")?;
        if originals.overrides_active {
            restore_error_family(lua, &globals, &debug_table, &originals)?;
        }
        coroutine_table.set(
            "create",
            lua.registry_value::<Function>(&originals.co_create)?,
        )?;
        coroutine_table.set("wrap", lua.registry_value::<Function>(&originals.co_wrap)?)?;
        let Originals {
            error,
            assert,
            traceback,
            co_create,
            co_wrap,
            ..
        } = originals;
        for key in [error, assert, traceback, co_create, co_wrap] {
            lua.remove_registry_value(key)?;
        }
    }

    dbg.clear_hook(None)?;
    let ids = state.threads.lock().ids();
    for id in ids {
        if let Some(thread) = state.threads.lock().thread_by_id(lua, id) {
            let _ = dbg.clear_hook(Some(&thread));
        }
    }

    if let Some(key) = state.hook_fn.lock().take() {
        lua.remove_registry_value(key)?;
    }
    Ok(())
}

fn restore_error_family(
    lua: &Lua,
    globals: &Table,
    debug_table: &Table,
    originals: &Originals,
) -> mlua::Result<()> {
    globals.set("error", lua.registry_value::<Function>(&originals.error)?)?;
    globals.set("assert", lua.registry_value::<Function>(&originals.assert)?)?;
    debug_table.set(
        "traceback",
        lua.registry_value::<Function>(&originals.traceback)?,
    )?;
    Ok(())
}

/// Swap the error-family overrides in or out to match the top-of-stack mode
fn reconcile_overrides(state: &Arc<EngineState>, lua: &Lua) -> mlua::Result<()> {
    let want_active = matches!(state.hook_stack.lock().last(), Some(HookMode::Global));
    let mut originals_slot = state.originals.lock();
    let Some(originals) = originals_slot.as_mut() else {
        return Ok(());
    };
    if originals.overrides_active == want_active {
        return Ok(());
    }

    let globals = lua.globals();
    let debug_table: Table = globals.get("debug")?;
    if want_active {
        globals.set("error", make_error_override(state, lua)?)?;
        globals.set("assert", make_assert_override(state, lua)?)?;
        debug_table.set("traceback", make_traceback_override(state, lua)?)?;
        debug!("error/assert/traceback overrides installed");
    } else {
        restore_error_family(lua, &globals, &debug_table, originals)?;
        debug!("error/assert/traceback overrides removed");
    }
    originals.overrides_active = want_active;
    Ok(())
}

/// Register a coroutine and attach the line hook to it
pub(crate) fn attach_thread(
    state: &Arc<EngineState>,
    lua: &Lua,
    thread: &Thread,
) -> mlua::Result<u64> {
    let id = state.threads.lock().register(lua, thread)?;
    let hook_key = state.hook_fn.lock();
    if let Some(key) = hook_key.as_ref() {
        let hook: Function = lua.registry_value(key)?;
        DebugLib::fetch(lua)?.set_line_hook(Some(thread), &hook)?;
    }
    Ok(id)
}

fn install_coroutine_overrides(
    state: &Arc<EngineState>,
    lua: &Lua,
    coroutine_table: &Table,
) -> mlua::Result<()> {
    let create_state = Arc::clone(state);
    let create = lua.create_function(move |lua, f: Function| {
        let original = original_fn(&create_state, lua, |o| &o.co_create)?;
        let thread: Thread = original.call(f)?;
        attach_thread(&create_state, lua, &thread)?;
        Ok(thread)
    })?;

    let wrap_state = Arc::clone(state);
    let wrap = lua.create_function(move |lua, f: Function| {
        // Build on `create` so the thread handle is registrable, then
        // forward resume results the way the original `wrap` does
        let original = original_fn(&wrap_state, lua, |o| &o.co_create)?;
        let thread: Thread = original.call(f)?;
        attach_thread(&wrap_state, lua, &thread)?;
        let thread_key = lua.create_registry_value(thread)?;
        lua.create_function(move |lua, args: MultiValue| {
            let thread: Thread = lua.registry_value(&thread_key)?;
            thread.resume::<_, MultiValue>(args)
        })
    })?;

    coroutine_table.set("create", create)?;
    coroutine_table.set("wrap", wrap)?;
    Ok(())
}

fn original_fn<'lua>(
    state: &Arc<EngineState>,
    lua: &'lua Lua,
    pick: impl FnOnce(&Originals) -> &RegistryKey,
) -> mlua::Result<Function<'lua>> {
    let originals = state.originals.lock();
    let originals = originals
        .as_ref()
        .ok_or_else(|| mlua::Error::RuntimeError("debugger not installed".to_string()))?;
    lua.registry_value(pick(originals))
}

fn make_error_override<'lua>(
    state: &Arc<EngineState>,
    lua: &'lua Lua,
) -> mlua::Result<Function<'lua>> {
    let state = Arc::clone(state);
    lua.create_function(move |lua, (message, level): (Value, Option<i64>)| {
        let text = match &message {
            Value::String(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        };
        let mapped = text
            .as_deref()
            .map(|t| remap_positions(t, &state.config.script_roots));

        if !state.in_break.load(Ordering::SeqCst) {
            let shown = mapped
                .clone()
                .unwrap_or_else(|| crate::output::lua_tostring(lua, &message));
            break_from_here(&state, lua, shown, BreakType::Error)?;
            state.break_state.lock().set_skip_next_traceback();
        }

        // Delegate so stack unwinding proceeds unchanged; one level deeper
        // to account for this wrapper frame
        let original = original_fn(&state, lua, |o| &o.error)?;
        let bumped = level.unwrap_or(1);
        let bumped = if bumped > 0 { bumped + 1 } else { bumped };
        let raised: Value = match mapped {
            Some(text) => Value::String(lua.create_string(&text)?),
            None => message,
        };
        original.call::<_, ()>((raised, bumped))?;
        Ok(())
    })
}

fn make_assert_override<'lua>(
    state: &Arc<EngineState>,
    lua: &'lua Lua,
) -> mlua::Result<Function<'lua>> {
    let state = Arc::clone(state);
    lua.create_function(move |lua, args: MultiValue| {
        let first = args.iter().next().cloned().unwrap_or(Value::Nil);
        if !matches!(first, Value::Nil | Value::Boolean(false)) {
            return Ok(args);
        }

        if !state.in_break.load(Ordering::SeqCst) {
            let message = match args.iter().nth(1) {
                Some(Value::String(s)) => remap_positions(
                    &s.to_string_lossy(),
                    &state.config.script_roots,
                ),
                Some(other) => crate::output::lua_tostring(lua, other),
                None => "assertion failed!".to_string(),
            };
            break_from_here(&state, lua, message, BreakType::Error)?;
            state.break_state.lock().set_skip_next_traceback();
        }

        let original = original_fn(&state, lua, |o| &o.assert)?;
        original.call::<_, MultiValue>(args)
    })
}

fn make_traceback_override<'lua>(
    state: &Arc<EngineState>,
    lua: &'lua Lua,
) -> mlua::Result<Function<'lua>> {
    let state = Arc::clone(state);
    lua.create_function(move |lua, args: MultiValue| {
        let original = original_fn(&state, lua, |o| &o.traceback)?;
        let result: Value = original.call(args)?;
        let mapped = match &result {
            Value::String(s) => Value::String(lua.create_string(&remap_positions(
                &s.to_string_lossy(),
                &state.config.script_roots,
            ))?),
            _ => result,
        };

        // An implicit invocation comes from the interpreter's uncaught-error
        // path (a C caller or no caller at all); user code calling traceback
        // for its own purposes never halts.
        let dbg = DebugLib::fetch(lua)?;
        let implicit = dbg
            .frame_info(None, 2)?
            .map_or(true, |info| info.what == "C");

        if implicit && !state.in_break.load(Ordering::SeqCst) {
            if state.break_state.lock().consume_skip_next_traceback() {
                trace!("traceback break suppressed by one-shot flag");
            } else {
                let message = match &mapped {
                    Value::String(s) => s.to_string_lossy().into_owned(),
                    _ => "error".to_string(),
                };
                break_from_here(&state, lua, message, BreakType::Error)?;
            }
        }
        Ok(mapped)
    })
}

/// Emit a `debugBreak` and run the command loop from the current call site
pub(crate) fn break_from_here(
    state: &Arc<EngineState>,
    lua: &Lua,
    message: String,
    break_type: BreakType,
) -> mlua::Result<()> {
    let dbg = DebugLib::fetch(lua)?;
    let Some(base) = dbg.find_base_level()? else {
        return Ok(());
    };
    let info = dbg.frame_info(None, base)?;
    let (source, line) = info.map_or_else(
        || (String::new(), 0),
        |i| (path::format(&i.source), i.current_line.unwrap_or(0)),
    );
    let (_, thread_id) = state.threads.lock().current(lua)?;
    let depth = dbg.stack_depth(None, base)?;
    command_loop::stop(
        state,
        lua,
        &dbg,
        StopParams {
            base_level: base,
            thread_id,
            depth,
            source,
            line,
            message,
            break_type,
        },
    )
}

/// One line event from the interpreter
fn hook_event(state: &Arc<EngineState>, lua: &Lua, line: u32) -> mlua::Result<()> {
    // The interpreter masks hook delivery while a hook runs, so a second
    // concurrent activation indicates a host bug
    let previous = state.hook_entries.fetch_add(1, Ordering::SeqCst);
    debug_assert_eq!(previous, 0, "line hook re-entered");
    let result = if previous == 0 {
        hook_event_inner(state, lua, line)
    } else {
        Ok(())
    };
    state.hook_entries.fetch_sub(1, Ordering::SeqCst);
    result
}

fn hook_event_inner(state: &Arc<EngineState>, lua: &Lua, line: u32) -> mlua::Result<()> {
    if state.in_break.load(Ordering::SeqCst) || state.hook_stack.lock().is_empty() {
        return Ok(());
    }

    let dbg = DebugLib::fetch(lua)?;
    let Some(base) = dbg.find_base_level()? else {
        return Ok(());
    };
    let Some(info) = dbg.frame_info(None, base)? else {
        return Ok(());
    };
    if info.is_off_limits() || info.what == "C" {
        return Ok(());
    }

    let line = if line > 0 {
        line
    } else {
        info.current_line.unwrap_or(0)
    };
    let source_path = path::format(&info.source);
    let (_, thread_id) = state.threads.lock().current(lua)?;
    let depth = dbg.stack_depth(None, base)?;

    // Step decision comes before breakpoint matching; the scoped thread's
    // liveness is resolved outside the break-state lock
    let scoped = state.break_state.lock().break_in_thread();
    let liveness = match scoped {
        Some(id) if id != thread_id && id != MAIN_THREAD_ID => {
            match state.threads.lock().status(lua, id) {
                Some(status) if status != "dead" => ThreadLiveness::Alive,
                // Swept or dead either way
                _ => ThreadLiveness::Dead,
            }
        }
        _ => ThreadLiveness::Alive,
    };
    let step_halt = state
        .break_state
        .lock()
        .step_decision(thread_id, depth, |_| liveness);

    let mut halt: Option<(BreakType, String)> = None;
    if step_halt {
        halt = Some((BreakType::Step, "step".to_string()));
    } else {
        let skip = {
            let mut bs = state.break_state.lock();
            let skip = bs.consume_breakpoint_skip(&source_path, line);
            if !skip {
                bs.clear_breakpoint_skip();
            }
            skip
        };
        if !skip && !state.breakpoints.read().is_empty() {
            let map = SourceMapStore::get(&source_path, &state.config.script_roots);
            let condition = {
                let table = state.breakpoints.read();
                table
                    .match_at(&source_path, line, map.as_deref())
                    .map(|bp| bp.condition.clone())
            };
            if let Some(condition) = condition {
                let fire = match condition {
                    None => true,
                    Some(expression) => {
                        condition_holds(lua, &dbg, base, &expression, map.as_deref())
                    }
                };
                if fire {
                    halt = Some((
                        BreakType::Breakpoint,
                        format!("breakpoint hit: {source_path}:{line}"),
                    ));
                }
            }
        }
    }

    let Some((break_type, message)) = halt else {
        return Ok(());
    };
    state.threads.lock().sweep(lua);
    trace!(source = %source_path, line, ?break_type, "halting");
    command_loop::stop(
        state,
        lua,
        &dbg,
        StopParams {
            base_level: base,
            thread_id,
            depth,
            source: source_path,
            line,
            message,
            break_type,
        },
    )
}

/// Evaluate a breakpoint condition at the stop frame; errors never halt
fn condition_holds(
    lua: &Lua,
    dbg: &DebugLib,
    base: i64,
    expression: &str,
    map: Option<&lldbg_sourcemap::SourceMap>,
) -> bool {
    let target = EvalTarget {
        thread: None,
        level: base,
    };
    let source = format!("return {expression}");
    match evaluator::execute(lua, dbg, &target, &source, map) {
        Ok(Ok(values)) => !matches!(
            values.iter().next(),
            None | Some(Value::Nil | Value::Boolean(false))
        ),
        Ok(Err(message)) => {
            warn!(expression, message, "breakpoint condition failed");
            false
        }
        Err(e) => {
            warn!(expression, error = %e, "breakpoint condition raised");
            false
        }
    }
}
