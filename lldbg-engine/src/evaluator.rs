//! Expression and statement evaluation inside an arbitrary stack frame.
//!
//! A user chunk runs under a synthetic environment: reads resolve against
//! the frame's named locals, then its upvalues, then the function
//! environment; writes to known slots are captured and written back through
//! `debug.setlocal`/`setupvalue` after a successful run, everything else
//! falls through to the function environment.

use crate::introspect::{DebugLib, CHUNK_MARKER};
use lldbg_sourcemap::SourceMap;
use mlua::{Function, Lua, MultiValue, Table, Thread, Value};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Message returned when a coroutine asks for a main-task frame
pub const MAIN_THREAD_UNAVAILABLE: &str =
    "unable to access main thread while running in a coroutine";

/// Which interpreter slot a harvested variable lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Named local; positive `debug.getlocal` index
    Local,
    /// Vararg; negative `debug.getlocal` index
    Vararg,
    /// Upvalue of the frame function; positive `debug.getupvalue` index
    Upvalue,
}

/// One harvested variable with its write-back slot
#[derive(Debug, Clone)]
pub struct HarvestedVar<'lua> {
    pub name: String,
    pub value: Value<'lua>,
    pub kind: SlotKind,
    pub index: i64,
}

/// The frame a chunk should run in
pub struct EvalTarget<'lua> {
    /// `None` evaluates in the active thread, `Some` in a suspended one
    pub thread: Option<Thread<'lua>>,
    /// `debug` stack level of the frame within that thread
    pub level: i64,
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Sanitise a reported slot name into an identifier, suffixing underscores
/// until it does not collide with an already-harvested name
fn display_name(raw: &str, taken: &HashMap<String, usize>) -> String {
    let mut name: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if name.is_empty() || name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    while taken.contains_key(&name) {
        name.push('_');
    }
    name
}

/// Harvest named locals and varargs of a frame
pub fn harvest_locals<'lua>(
    dbg: &DebugLib<'lua>,
    target: &EvalTarget<'lua>,
) -> mlua::Result<Vec<HarvestedVar<'lua>>> {
    let mut vars: Vec<HarvestedVar<'lua>> = Vec::new();
    let mut taken: HashMap<String, usize> = HashMap::new();

    // Named locals occupy slots 1.. until the interpreter reports no name
    let mut slot = 1i64;
    loop {
        let (name, value) = dbg.get_local(target.thread.as_ref(), target.level, slot)?;
        let Some(name) = name else { break };
        // Internal slots like "(temporary)" are not addressable by name
        if is_identifier(&name) {
            // A rebound name shadows the earlier slot
            if let Some(&existing) = taken.get(&name) {
                vars[existing] = HarvestedVar {
                    name,
                    value,
                    kind: SlotKind::Local,
                    index: slot,
                };
            } else {
                taken.insert(name.clone(), vars.len());
                vars.push(HarvestedVar {
                    name,
                    value,
                    kind: SlotKind::Local,
                    index: slot,
                });
            }
        }
        slot += 1;
    }

    // Varargs sit at negative slots with a non-identifier reported name
    let mut slot = -1i64;
    loop {
        let (name, value) = dbg.get_local(target.thread.as_ref(), target.level, slot)?;
        if name.is_none() {
            break;
        }
        let display = display_name(&name.unwrap_or_default(), &taken);
        taken.insert(display.clone(), vars.len());
        vars.push(HarvestedVar {
            name: display,
            value,
            kind: SlotKind::Vararg,
            index: slot,
        });
        slot -= 1;
    }

    Ok(vars)
}

/// Harvest the upvalues of a frame's function
pub fn harvest_upvalues<'lua>(
    dbg: &DebugLib<'lua>,
    func: &Function<'lua>,
    nups: u32,
) -> mlua::Result<Vec<HarvestedVar<'lua>>> {
    let mut vars = Vec::new();
    for slot in 1..=i64::from(nups) {
        let (name, value) = dbg.get_upvalue(func, slot)?;
        let Some(name) = name else { break };
        vars.push(HarvestedVar {
            name,
            value,
            kind: SlotKind::Upvalue,
            index: slot,
        });
    }
    Ok(vars)
}

/// The frame function's environment: its `_ENV` upvalue when present,
/// otherwise the process globals
pub fn frame_environment<'lua>(
    lua: &'lua Lua,
    dbg: &DebugLib<'lua>,
    func: Option<&Function<'lua>>,
    nups: u32,
) -> mlua::Result<Table<'lua>> {
    if let Some(func) = func {
        for slot in 1..=i64::from(nups) {
            let (name, value) = dbg.get_upvalue(func, slot)?;
            match (name.as_deref(), value) {
                (Some("_ENV"), Value::Table(env)) => return Ok(env),
                (None, _) => break,
                _ => {}
            }
        }
    }
    Ok(lua.globals())
}

const ENV_FACTORY: &str = r"
local slots, values, modified, fenv = ...
return setmetatable({}, {
    __index = function(_, key)
        if slots[key] ~= nil then
            return values[key]
        end
        return fenv[key]
    end,
    __newindex = function(_, key, value)
        if slots[key] ~= nil then
            values[key] = value
            modified[key] = true
        else
            fenv[key] = value
        end
    end,
})
";

/// Run `source` in the frame named by `target`, writing slot mutations back
///
/// Returns the chunk's values on success and the host error text on failure.
/// When `map` carries identifier mappings, the source is rewritten from
/// original to emitted names before compilation.
pub fn execute<'lua>(
    lua: &'lua Lua,
    dbg: &DebugLib<'lua>,
    target: &EvalTarget<'lua>,
    source: &str,
    map: Option<&SourceMap>,
) -> mlua::Result<Result<MultiValue<'lua>, String>> {
    let func = dbg.frame_function(target.thread.as_ref(), target.level)?;
    let nups = dbg.frame_nups(target.thread.as_ref(), target.level)?;

    let mut vars = harvest_locals(dbg, target)?;
    if let Some(func) = &func {
        vars.extend(harvest_upvalues(dbg, func, nups)?);
    }
    let fenv = frame_environment(lua, dbg, func.as_ref(), nups)?;

    // Slot metadata and current values live in Lua tables so nil-valued
    // variables still shadow the function environment
    let slots = lua.create_table()?;
    let values = lua.create_table()?;
    let modified = lua.create_table()?;
    for (position, var) in vars.iter().enumerate() {
        slots.set(var.name.as_str(), position + 1)?;
        values.set(var.name.as_str(), var.value.clone())?;
    }

    let env: Table = lua
        .load(ENV_FACTORY)
        .set_name(CHUNK_MARKER)
        .call((slots, values.clone(), modified.clone(), fenv))?;

    let rewritten = match map.filter(|m| m.has_mapped_names()) {
        Some(m) => rewrite_expression(source, m),
        None => source.to_string(),
    };
    trace!(source = %rewritten, level = target.level, "evaluating chunk");

    let chunk = lua
        .load(&rewritten)
        .set_name(CHUNK_MARKER)
        .set_environment(env);
    let results = match chunk.call::<_, MultiValue>(()) {
        Ok(values) => values,
        Err(e) => return Ok(Err(e.to_string())),
    };

    // Write modified slots back through the interpreter
    for pair in modified.pairs::<String, bool>() {
        let Ok((name, flagged)) = pair else { continue };
        if !flagged {
            continue;
        }
        let Some(var) = vars.iter().find(|v| v.name == name) else {
            continue;
        };
        let new_value: Value = values.get(name.as_str())?;
        match var.kind {
            SlotKind::Local | SlotKind::Vararg => {
                dbg.set_local(target.thread.as_ref(), target.level, var.index, new_value)?;
            }
            SlotKind::Upvalue => {
                if let Some(func) = &func {
                    dbg.set_upvalue(func, var.index, new_value)?;
                }
            }
        }
        debug!(name, "wrote back frame variable");
    }

    Ok(Ok(results))
}

/// Evaluate an expression, preferring `return <expr>` and falling back to
/// the raw text when the prefixed form does not compile
pub fn evaluate_expression<'lua>(
    lua: &'lua Lua,
    dbg: &DebugLib<'lua>,
    target: &EvalTarget<'lua>,
    expression: &str,
    map: Option<&SourceMap>,
) -> mlua::Result<Result<MultiValue<'lua>, String>> {
    let prefixed = format!("return {expression}");
    if lua
        .load(&prefixed)
        .set_name(CHUNK_MARKER)
        .into_function()
        .is_ok()
    {
        execute(lua, dbg, target, &prefixed, map)
    } else {
        execute(lua, dbg, target, expression, map)
    }
}

/// Rewrite identifiers from original to emitted names
///
/// String literals are left untouched; a backslash suppresses the following
/// quote once. Identifiers preceded by `.` are property accesses: they keep
/// the original name (bracket-indexed when it is not a plain identifier).
#[must_use]
pub fn rewrite_expression(source: &str, map: &SourceMap) -> String {
    let mut out = String::with_capacity(source.len());
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    let mut in_string: Option<char> = None;
    let mut escaped = false;
    let mut previous_significant: Option<char> = None;

    while i < chars.len() {
        let c = chars[i];
        if let Some(quote) = in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                in_string = None;
            }
            i += 1;
            continue;
        }
        if c == '\'' || c == '"' {
            in_string = Some(c);
            out.push(c);
            previous_significant = Some(c);
            i += 1;
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();
            if previous_significant == Some('.') {
                if is_identifier(&ident) {
                    out.push_str(&ident);
                } else {
                    // Replace the '.' we already emitted with bracket indexing
                    out.pop();
                    out.push_str(&format!("[\"{ident}\"]"));
                }
            } else {
                match map.emitted_name(&ident) {
                    Some(emitted) => out.push_str(emitted),
                    None => out.push_str(&ident),
                }
            }
            previous_significant = Some('i');
            continue;
        }
        out.push(c);
        if !c.is_whitespace() {
            previous_significant = Some(c);
        }
        i += 1;
    }
    out
}
