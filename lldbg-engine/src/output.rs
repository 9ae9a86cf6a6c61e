//! Lua value rendering for protocol messages.
//!
//! Scalars render through the interpreter's own `tostring` so numeric and
//! userdata formatting match what the script would print. Tables are
//! pretty-printed with two-space indents; a visited set breaks cycles by
//! rendering any revisited table as its default stringification.

use lldbg_core::protocol::{ValueInfo, Variable};
use mlua::{Lua, Table, Value};
use std::collections::HashSet;
use std::fmt::Write as _;

/// Type tag of a value as the host names it
#[must_use]
pub fn type_of(value: &Value) -> &'static str {
    value.type_name()
}

/// The host's `tostring` rendering of a value
#[must_use]
pub fn lua_tostring(lua: &Lua, value: &Value) -> String {
    lua.globals()
        .get::<_, mlua::Function>("tostring")
        .and_then(|f| f.call::<_, String>(value.clone()))
        .unwrap_or_else(|_| value.type_name().to_string())
}

/// Escape a string for embedding in rendered table output
#[must_use]
pub fn escape_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    for c in raw.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

/// Length reported alongside a value, when it has one
#[must_use]
pub fn length_of(value: &Value) -> Option<u64> {
    match value {
        Value::Table(t) => Some(t.raw_len() as u64),
        Value::String(s) => Some(s.as_bytes().len() as u64),
        _ => None,
    }
}

/// Render a value for display; tables expand, everything else `tostring`s
#[must_use]
pub fn describe(lua: &Lua, value: &Value) -> String {
    let mut visited = HashSet::new();
    describe_inner(lua, value, &mut visited, 0, false)
}

fn describe_inner(
    lua: &Lua,
    value: &Value,
    visited: &mut HashSet<usize>,
    indent: usize,
    quote_strings: bool,
) -> String {
    match value {
        Value::String(s) if quote_strings => {
            format!("\"{}\"", escape_string(&s.to_string_lossy()))
        }
        Value::Table(t) => describe_table(lua, t, visited, indent),
        other => lua_tostring(lua, other),
    }
}

fn describe_table(
    lua: &Lua,
    table: &Table,
    visited: &mut HashSet<usize>,
    indent: usize,
) -> String {
    let pointer = table.to_pointer() as usize;
    if !visited.insert(pointer) {
        // Cycle: fall back to the default stringification
        return lua_tostring(lua, &Value::Table(table.clone()));
    }

    let mut integer_keys: Vec<(i64, Value)> = Vec::new();
    let mut string_keys: Vec<(String, Value)> = Vec::new();
    let mut other_keys: Vec<(String, Value)> = Vec::new();
    for pair in table.clone().pairs::<Value, Value>() {
        let Ok((key, value)) = pair else { continue };
        match key {
            Value::Integer(i) => integer_keys.push((i, value)),
            Value::String(s) => string_keys.push((s.to_string_lossy().into_owned(), value)),
            other => other_keys.push((lua_tostring(lua, &other), value)),
        }
    }
    integer_keys.sort_by_key(|(i, _)| *i);
    string_keys.sort_by(|(a, _), (b, _)| a.cmp(b));
    other_keys.sort_by(|(a, _), (b, _)| a.cmp(b));

    if integer_keys.is_empty() && string_keys.is_empty() && other_keys.is_empty() {
        visited.remove(&pointer);
        return "{}".to_string();
    }

    let inner_pad = "  ".repeat(indent + 1);
    let close_pad = "  ".repeat(indent);
    let mut out = String::from("{\n");
    for (key, value) in integer_keys {
        let rendered = describe_inner(lua, &value, visited, indent + 1, true);
        let _ = writeln!(out, "{inner_pad}[{key}] = {rendered},");
    }
    for (key, value) in string_keys {
        let rendered = describe_inner(lua, &value, visited, indent + 1, true);
        if is_identifier(&key) {
            let _ = writeln!(out, "{inner_pad}{key} = {rendered},");
        } else {
            let _ = writeln!(out, "{inner_pad}[\"{}\"] = {rendered},", escape_string(&key));
        }
    }
    for (key, value) in other_keys {
        let rendered = describe_inner(lua, &value, visited, indent + 1, true);
        let _ = writeln!(out, "{inner_pad}[{key}] = {rendered},");
    }
    let _ = write!(out, "{close_pad}}}");
    visited.remove(&pointer);
    out
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Build a protocol variable record for a named value
#[must_use]
pub fn variable(lua: &Lua, name: impl Into<String>, value: &Value) -> Variable {
    Variable {
        name: name.into(),
        value_type: type_of(value).to_string(),
        value: describe(lua, value),
        length: length_of(value),
    }
}

/// Build an anonymous value record (evaluation results, metatables)
#[must_use]
pub fn value_info(lua: &Lua, value: &Value) -> ValueInfo {
    ValueInfo {
        value_type: type_of(value).to_string(),
        value: describe(lua, value),
    }
}
