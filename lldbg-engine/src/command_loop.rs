//! The interactive command loop driven while the debuggee is stopped.
//!
//! One `debugBreak` is always followed by at least one adapter command; the
//! loop blocks on the input sink, answers every command with exactly one
//! structured event, and returns once a resume verb has updated the break
//! state. Thread and frame selection live only for the duration of a stop:
//! switching to an inactive thread zeroes the frame offset, switching back
//! reverts to the offset captured at stop time.

use crate::evaluator::{self, EvalTarget, SlotKind, MAIN_THREAD_UNAVAILABLE};
use crate::introspect::DebugLib;
use crate::output;
use crate::threads::MAIN_THREAD_ID;
use crate::EngineState;
use lldbg_core::commands::{help_text, BreakSpec, Command, PropsKind};
use lldbg_core::protocol::{
    BreakType, Frame, LengthField, MappedLocation, Message, ThreadInfo, ValueInfo, Variable,
};
use lldbg_sourcemap::SourceMapStore;
use mlua::{Lua, Table, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Everything the loop knows about the stop position
pub(crate) struct StopParams {
    /// Stack level of the user's stop frame in the active thread
    pub base_level: i64,
    /// Id of the thread the event came from
    pub thread_id: u64,
    /// User-visible stack depth at the stop
    pub depth: u32,
    /// Canonical emitted source of the stop frame
    pub source: String,
    pub line: u32,
    pub message: String,
    pub break_type: BreakType,
}

struct BreakGuard<'a>(&'a AtomicBool);

impl<'a> BreakGuard<'a> {
    fn engage(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for BreakGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One frame of a listed stack
struct FrameEntry {
    source_path: String,
    line: u32,
    name: Option<String>,
}

/// Emit the break event and drive the command loop until resumed
pub(crate) fn stop(
    state: &Arc<EngineState>,
    lua: &Lua,
    dbg: &DebugLib<'_>,
    params: StopParams,
) -> mlua::Result<()> {
    let _guard = BreakGuard::engage(&state.in_break);
    debug!(
        source = %params.source,
        line = params.line,
        thread = params.thread_id,
        ?params.break_type,
        "entering command loop"
    );
    state.send(&Message::DebugBreak {
        message: params.message.clone(),
        break_type: params.break_type,
        thread_id: params.thread_id,
    });

    let mut selected_thread = params.thread_id;
    let mut selected_frame = 0usize;

    loop {
        let Some(input) = state.read_line() else {
            // Input sink closed: detach and run free
            state.break_state.lock().on_continue();
            return Ok(());
        };
        let command = match Command::parse(&input) {
            Ok(command) => command,
            Err(e) => {
                state.send(&Message::error(e.to_string()));
                continue;
            }
        };
        trace!(?command, "adapter command");

        match command {
            Command::Quit => std::process::exit(0),
            Command::Continue => {
                state.break_state.lock().on_continue();
                return Ok(());
            }
            Command::AutoContinue => {
                state
                    .break_state
                    .lock()
                    .on_auto_continue(params.source.clone(), params.line);
                return Ok(());
            }
            Command::Step => {
                state
                    .break_state
                    .lock()
                    .on_step(params.depth, params.thread_id);
                return Ok(());
            }
            Command::StepIn => {
                state.break_state.lock().on_step_in();
                return Ok(());
            }
            Command::StepOut => {
                state
                    .break_state
                    .lock()
                    .on_step_out(params.depth, params.thread_id);
                return Ok(());
            }
            Command::Stack => {
                let entries = frame_entries(state, lua, dbg, &params, selected_thread)?;
                state.send(&stack_message(
                    &entries,
                    selected_frame,
                    selected_thread,
                    &params,
                    &state.config.script_roots,
                ));
            }
            Command::Frame(n) => {
                let entries = frame_entries(state, lua, dbg, &params, selected_thread)?;
                if n <= entries.len() {
                    selected_frame = n - 1;
                    state.send(&stack_message(
                        &entries,
                        selected_frame,
                        selected_thread,
                        &params,
                        &state.config.script_roots,
                    ));
                } else {
                    state.send(&Message::error(format!("bad frame index {n}")));
                }
            }
            Command::Locals => {
                handle_variables(state, lua, dbg, &params, selected_thread, selected_frame, false)?;
            }
            Command::Ups => {
                handle_variables(state, lua, dbg, &params, selected_thread, selected_frame, true)?;
            }
            Command::Globals => {
                handle_globals(state, lua, dbg, &params, selected_thread, selected_frame)?;
            }
            Command::Props {
                expression,
                kind,
                start,
                count,
            } => {
                handle_props(
                    state,
                    lua,
                    dbg,
                    &params,
                    selected_thread,
                    selected_frame,
                    &expression,
                    kind,
                    start,
                    count,
                )?;
            }
            Command::Eval(expression) => {
                handle_eval(state, lua, dbg, &params, selected_thread, selected_frame, &expression)?;
            }
            Command::Exec(statement) => {
                handle_exec(state, lua, dbg, &params, selected_thread, selected_frame, &statement)?;
            }
            Command::BreakSet { spec, condition } => {
                state.breakpoints.write().add(
                    &spec.file,
                    spec.line,
                    condition,
                    &state.config.script_roots,
                );
                send_breakpoints(state);
            }
            Command::BreakDelete(spec) => {
                breakpoint_edit(state, &spec, |table, spec| table.remove(&spec.file, spec.line));
            }
            Command::BreakDisable(spec) => {
                breakpoint_edit(state, &spec, |table, spec| {
                    table.set_enabled(&spec.file, spec.line, false)
                });
            }
            Command::BreakEnable(spec) => {
                breakpoint_edit(state, &spec, |table, spec| {
                    table.set_enabled(&spec.file, spec.line, true)
                });
            }
            Command::BreakList => send_breakpoints(state),
            Command::BreakClear => {
                state.breakpoints.write().clear();
                send_breakpoints(state);
            }
            Command::Threads => {
                state.send(&threads_message(state, lua, &params, selected_thread));
            }
            Command::Thread(id) => {
                let known = id == MAIN_THREAD_ID
                    || state.threads.lock().thread_by_id(lua, id).is_some();
                if known {
                    selected_thread = id;
                    selected_frame = 0;
                    state.send(&threads_message(state, lua, &params, selected_thread));
                } else {
                    state.send(&Message::error(format!("bad thread id {id}")));
                }
            }
            Command::Help => {
                state.send(&Message::Result {
                    results: vec![ValueInfo {
                        value_type: "string".to_string(),
                        value: help_text(),
                    }],
                });
            }
        }
    }
}

fn breakpoint_edit(
    state: &Arc<EngineState>,
    spec: &BreakSpec,
    edit: impl FnOnce(&mut crate::breakpoints::BreakpointTable, &BreakSpec) -> bool,
) {
    let changed = edit(&mut state.breakpoints.write(), spec);
    if changed {
        send_breakpoints(state);
    } else {
        state.send(&Message::error(format!(
            "no breakpoint at {}:{}",
            spec.file, spec.line
        )));
    }
}

fn send_breakpoints(state: &Arc<EngineState>) {
    let breakpoints = state.breakpoints.read().infos();
    state.send(&Message::Breakpoints { breakpoints });
}

/// Frames of the selected thread, outermost call last
fn frame_entries(
    state: &Arc<EngineState>,
    lua: &Lua,
    dbg: &DebugLib<'_>,
    params: &StopParams,
    selected_thread: u64,
) -> mlua::Result<Vec<FrameEntry>> {
    let mut entries = Vec::new();
    if selected_thread == params.thread_id {
        let mut level = params.base_level;
        while let Some(info) = dbg.frame_info(None, level)? {
            entries.push(FrameEntry {
                source_path: lldbg_sourcemap::path::format(&info.source),
                line: info.current_line.unwrap_or(0),
                name: info.name,
            });
            level += 1;
        }
    } else if selected_thread != MAIN_THREAD_ID {
        // Walking the main task from a coroutine is not possible; any other
        // registered coroutine can be inspected while suspended
        let thread = state.threads.lock().thread_by_id(lua, selected_thread);
        if let Some(thread) = thread {
            let mut level = 0;
            while let Some(info) = dbg.frame_info(Some(&thread), level)? {
                entries.push(FrameEntry {
                    source_path: lldbg_sourcemap::path::format(&info.source),
                    line: info.current_line.unwrap_or(0),
                    name: info.name,
                });
                level += 1;
            }
        }
    }
    Ok(entries)
}

fn stack_message(
    entries: &[FrameEntry],
    selected_frame: usize,
    selected_thread: u64,
    params: &StopParams,
    script_roots: &[String],
) -> Message {
    if entries.is_empty() && selected_thread != params.thread_id {
        // Stub frame so the stack view has something to show
        let label = if selected_thread == MAIN_THREAD_ID {
            MAIN_THREAD_UNAVAILABLE
        } else {
            "thread has not been started"
        };
        return Message::Stack {
            frames: vec![Frame {
                source: format!("thread {selected_thread}"),
                line: 0,
                func: Some(label.to_string()),
                active: Some(true),
                mapped_location: None,
            }],
        };
    }

    let frames = entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let mapped_location = SourceMapStore::get(&entry.source_path, script_roots)
                .and_then(|map| {
                    map.mapping_for_line(entry.line).and_then(|m| {
                        map.source_path(m).map(|source| MappedLocation {
                            source: source.to_string(),
                            line: m.source_line,
                            column: m.source_column,
                        })
                    })
                });
            Frame {
                source: entry.source_path.clone(),
                line: entry.line,
                func: entry.name.clone(),
                active: (index == selected_frame).then_some(true),
                mapped_location,
            }
        })
        .collect();
    Message::Stack { frames }
}

fn threads_message(
    state: &Arc<EngineState>,
    lua: &Lua,
    params: &StopParams,
    selected_thread: u64,
) -> Message {
    let registry = state.threads.lock();
    let threads = registry
        .alive(lua, params.thread_id)
        .into_iter()
        .map(|(id, _status)| {
            let name = if id == MAIN_THREAD_ID {
                "main thread".to_string()
            } else {
                registry.thread_by_id(lua, id).map_or_else(
                    || format!("thread {id}"),
                    |t| output::lua_tostring(lua, &Value::Thread(t)),
                )
            };
            ThreadInfo {
                id,
                name,
                active: (id == selected_thread).then_some(true),
            }
        })
        .collect();
    Message::Threads { threads }
}

/// Frame the evaluator should address, honouring thread selection
fn eval_target<'lua>(
    state: &Arc<EngineState>,
    lua: &'lua Lua,
    params: &StopParams,
    selected_thread: u64,
    selected_frame: usize,
) -> Result<EvalTarget<'lua>, String> {
    if selected_thread == params.thread_id {
        Ok(EvalTarget {
            thread: None,
            level: params.base_level + selected_frame as i64,
        })
    } else if selected_thread == MAIN_THREAD_ID {
        Err(MAIN_THREAD_UNAVAILABLE.to_string())
    } else {
        state
            .threads
            .lock()
            .thread_by_id(lua, selected_thread)
            .map(|thread| EvalTarget {
                thread: Some(thread),
                level: selected_frame as i64,
            })
            .ok_or_else(|| format!("bad thread id {selected_thread}"))
    }
}

/// Source map of the selected frame's file, for name-mapped evaluation
fn frame_map(
    state: &Arc<EngineState>,
    lua: &Lua,
    dbg: &DebugLib<'_>,
    params: &StopParams,
    selected_thread: u64,
    selected_frame: usize,
) -> mlua::Result<Option<std::sync::Arc<lldbg_sourcemap::SourceMap>>> {
    let entries = frame_entries(state, lua, dbg, params, selected_thread)?;
    Ok(entries.get(selected_frame).and_then(|entry| {
        SourceMapStore::get(&entry.source_path, &state.config.script_roots)
    }))
}

fn handle_variables(
    state: &Arc<EngineState>,
    lua: &Lua,
    dbg: &DebugLib<'_>,
    params: &StopParams,
    selected_thread: u64,
    selected_frame: usize,
    upvalues: bool,
) -> mlua::Result<()> {
    let target = match eval_target(state, lua, params, selected_thread, selected_frame) {
        Ok(target) => target,
        Err(message) => {
            state.send(&Message::error(message));
            return Ok(());
        }
    };

    let mut variables: Vec<Variable> = Vec::new();
    if upvalues {
        if let Some(func) = dbg.frame_function(target.thread.as_ref(), target.level)? {
            let nups = dbg.frame_nups(target.thread.as_ref(), target.level)?;
            for var in evaluator::harvest_upvalues(dbg, &func, nups)? {
                variables.push(output::variable(lua, var.name, &var.value));
            }
        }
    } else {
        for var in evaluator::harvest_locals(dbg, &target)? {
            if matches!(var.kind, SlotKind::Local | SlotKind::Vararg) {
                variables.push(output::variable(lua, var.name, &var.value));
            }
        }
    }
    variables.sort_by(|a, b| a.name.cmp(&b.name));
    state.send(&Message::Variables { variables });
    Ok(())
}

fn handle_globals(
    state: &Arc<EngineState>,
    lua: &Lua,
    dbg: &DebugLib<'_>,
    params: &StopParams,
    selected_thread: u64,
    selected_frame: usize,
) -> mlua::Result<()> {
    let target = match eval_target(state, lua, params, selected_thread, selected_frame) {
        Ok(target) => target,
        Err(message) => {
            state.send(&Message::error(message));
            return Ok(());
        }
    };

    let func = dbg.frame_function(target.thread.as_ref(), target.level)?;
    let nups = dbg.frame_nups(target.thread.as_ref(), target.level)?;
    let fenv = evaluator::frame_environment(lua, dbg, func.as_ref(), nups)?;

    // The environment chain: the table itself, then a table-valued __index
    // of its metatable, one level per visited table, cycle-guarded
    let mut variables: Vec<Variable> = Vec::new();
    let mut seen_names: HashSet<String> = HashSet::new();
    let mut visited: HashSet<usize> = HashSet::new();
    let mut current = Some(fenv);
    while let Some(table) = current {
        if !visited.insert(table.to_pointer() as usize) {
            break;
        }
        for pair in table.clone().pairs::<Value, Value>() {
            let Ok((key, value)) = pair else { continue };
            let name = match &key {
                Value::String(s) => s.to_string_lossy().into_owned(),
                other => output::lua_tostring(lua, other),
            };
            if seen_names.insert(name.clone()) {
                variables.push(output::variable(lua, name, &value));
            }
        }
        current = table.get_metatable().and_then(|mt| {
            match mt.raw_get::<_, Value>("__index") {
                Ok(Value::Table(next)) => Some(next),
                _ => None,
            }
        });
    }
    variables.sort_by(|a, b| a.name.cmp(&b.name));
    state.send(&Message::Variables { variables });
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn handle_props(
    state: &Arc<EngineState>,
    lua: &Lua,
    dbg: &DebugLib<'_>,
    params: &StopParams,
    selected_thread: u64,
    selected_frame: usize,
    expression: &str,
    kind: PropsKind,
    start: Option<i64>,
    count: Option<i64>,
) -> mlua::Result<()> {
    let target = match eval_target(state, lua, params, selected_thread, selected_frame) {
        Ok(target) => target,
        Err(message) => {
            state.send(&Message::error(message));
            return Ok(());
        }
    };
    let map = frame_map(state, lua, dbg, params, selected_thread, selected_frame)?;

    let value = match evaluator::evaluate_expression(lua, dbg, &target, expression, map.as_deref())?
    {
        Ok(values) => values.iter().next().cloned().unwrap_or(Value::Nil),
        Err(message) => {
            state.send(&Message::error(message));
            return Ok(());
        }
    };
    let Value::Table(table) = value else {
        state.send(&Message::error(format!(
            "cannot expand properties of {}",
            value.type_name()
        )));
        return Ok(());
    };

    let raw_len = table.raw_len() as i64;
    let mut properties: Vec<Variable> = Vec::new();
    match kind {
        PropsKind::All | PropsKind::Named => {
            for pair in table.clone().pairs::<Value, Value>() {
                let Ok((key, value)) = pair else { continue };
                if kind == PropsKind::Named {
                    if let Value::Integer(i) = key {
                        // Named view skips the array part
                        if (1..=raw_len).contains(&i) {
                            continue;
                        }
                    }
                }
                let name = match &key {
                    Value::String(s) => s.to_string_lossy().into_owned(),
                    other => output::lua_tostring(lua, other),
                };
                properties.push(output::variable(lua, name, &value));
            }
            properties.sort_by(|a, b| a.name.cmp(&b.name));
        }
        PropsKind::Indexed => {
            let first = start.unwrap_or(1);
            let span = count.unwrap_or_else(|| (raw_len - first + 1).max(0));
            for index in first..first + span {
                let value: Value = table.get(index)?;
                properties.push(output::variable(lua, index.to_string(), &value));
            }
        }
    }

    let metatable = table
        .get_metatable()
        .map(|mt| output::value_info(lua, &Value::Table(mt)));
    let length = Some(table_length(lua, &table, raw_len));
    state.send(&Message::Properties {
        properties,
        metatable,
        length,
    });
    Ok(())
}

/// Length of an expanded table, honouring a `__len` metamethod
fn table_length(lua: &Lua, table: &Table, raw_len: i64) -> LengthField {
    let len_fn = table
        .get_metatable()
        .and_then(|mt| match mt.raw_get::<_, Value>("__len") {
            Ok(Value::Function(f)) => Some(f),
            _ => None,
        });
    let Some(len_fn) = len_fn else {
        return LengthField::Count(raw_len.max(0) as u64);
    };
    match len_fn.call::<_, Value>(table.clone()) {
        Ok(Value::Integer(i)) => LengthField::Count(i.max(0) as u64),
        Ok(Value::Number(n)) if n >= 0.0 => LengthField::Count(n as u64),
        Ok(other) => LengthField::Value {
            value_type: other.type_name().to_string(),
            value: output::describe(lua, &other),
        },
        Err(e) => LengthField::Error {
            value_type: "table".to_string(),
            error: e.to_string(),
        },
    }
}

fn handle_eval(
    state: &Arc<EngineState>,
    lua: &Lua,
    dbg: &DebugLib<'_>,
    params: &StopParams,
    selected_thread: u64,
    selected_frame: usize,
    expression: &str,
) -> mlua::Result<()> {
    let target = match eval_target(state, lua, params, selected_thread, selected_frame) {
        Ok(target) => target,
        Err(message) => {
            state.send(&Message::error(message));
            return Ok(());
        }
    };
    let map = frame_map(state, lua, dbg, params, selected_thread, selected_frame)?;
    match evaluator::evaluate_expression(lua, dbg, &target, expression, map.as_deref())? {
        Ok(values) => {
            let first = values.iter().next().cloned().unwrap_or(Value::Nil);
            state.send(&Message::Result {
                results: vec![output::value_info(lua, &first)],
            });
        }
        Err(message) => state.send(&Message::error(message)),
    }
    Ok(())
}

fn handle_exec(
    state: &Arc<EngineState>,
    lua: &Lua,
    dbg: &DebugLib<'_>,
    params: &StopParams,
    selected_thread: u64,
    selected_frame: usize,
    statement: &str,
) -> mlua::Result<()> {
    let target = match eval_target(state, lua, params, selected_thread, selected_frame) {
        Ok(target) => target,
        Err(message) => {
            state.send(&Message::error(message));
            return Ok(());
        }
    };
    let map = frame_map(state, lua, dbg, params, selected_thread, selected_frame)?;
    match evaluator::execute(lua, dbg, &target, statement, map.as_deref())? {
        Ok(values) => {
            // A trailing return may be multi-valued; only the first value
            // travels in the result message
            let results = values
                .iter()
                .next()
                .map(|value| vec![output::value_info(lua, value)])
                .unwrap_or_default();
            state.send(&Message::Result { results });
        }
        Err(message) => state.send(&Message::error(message)),
    }
    Ok(())
}
