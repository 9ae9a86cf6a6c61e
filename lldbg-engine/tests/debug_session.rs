//! End-to-end debug sessions over scripted adapter input.
//!
//! Each test wires a `Debugger` to an in-memory command script and a capture
//! buffer, runs a chunk under the hook, and asserts on the framed protocol
//! events plus the side effects the script left in the Lua state.

use anyhow::Context;
use lldbg_core::DebugConfig;
use lldbg_engine::Debugger;
use mlua::{Function, Lua, MultiValue};
use serial_test::serial;
use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
struct CaptureSink(Arc<Mutex<Vec<u8>>>);

impl Write for CaptureSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn debugger_with_commands(commands: &str) -> (Debugger, Arc<Mutex<Vec<u8>>>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let debugger = Debugger::with_io(
        DebugConfig::default(),
        Box::new(Cursor::new(commands.to_string())),
        Box::new(CaptureSink(Arc::clone(&buffer))),
    );
    (debugger, buffer)
}

fn events(buffer: &Arc<Mutex<Vec<u8>>>) -> Vec<serde_json::Value> {
    let data = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
    let mut out = Vec::new();
    let mut rest = data.as_str();
    while let Some(start) = rest.find("@lldbg|") {
        let after = &rest[start + "@lldbg|".len()..];
        let end = after.find("|lldbg@").expect("unterminated frame");
        out.push(serde_json::from_str(&after[..end]).expect("frame is JSON"));
        rest = &after[end + "|lldbg@".len()..];
    }
    out
}

fn load_named<'lua>(lua: &'lua Lua, name: &str, code: &str) -> Function<'lua> {
    lua.load(code)
        .set_name(format!("@{name}"))
        .into_function()
        .unwrap()
}

fn breaks(events: &[serde_json::Value]) -> Vec<serde_json::Value> {
    events
        .iter()
        .filter(|e| e["type"] == "debugBreak")
        .cloned()
        .collect()
}

#[test]
fn break_and_continue() {
    let lua = unsafe { Lua::unsafe_new() };
    let (debugger, buffer) = debugger_with_commands("cont\n");
    debugger.set_breakpoint("scripts/simple.lua", 3, None);

    let func = load_named(
        &lua,
        "scripts/simple.lua",
        "local t = {}\nt.x = 1\nt.x = 2\nresult = t.x",
    );
    debugger
        .call(&lua, func, false, MultiValue::new())
        .unwrap();

    let all = events(&buffer);
    let stops = breaks(&all);
    assert_eq!(stops.len(), 1, "events: {all:?}");
    assert_eq!(stops[0]["tag"], "$luaDebug");
    assert_eq!(stops[0]["breakType"], "breakpoint");
    assert_eq!(stops[0]["threadId"], 1);

    // Execution completed after resume
    let result: i64 = lua.globals().get("result").unwrap();
    assert_eq!(result, 2);
}

#[test]
fn break_on_entry_halts_first_line() {
    let lua = unsafe { Lua::unsafe_new() };
    let (debugger, buffer) = debugger_with_commands("cont\n");

    let func = load_named(&lua, "scripts/entry.lua", "entry_ran = true");
    debugger.call(&lua, func, true, MultiValue::new()).unwrap();

    let stops = breaks(&events(&buffer));
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0]["breakType"], "step");
    let ran: bool = lua.globals().get("entry_ran").unwrap();
    assert!(ran);
}

#[test]
fn step_over_skips_the_callee() {
    let lua = unsafe { Lua::unsafe_new() };
    let (debugger, buffer) = debugger_with_commands("step\nstack\ncont\n");
    debugger.set_breakpoint("scripts/stepover.lua", 4, None);

    let code = "local function f()\n  return 1\nend\nlocal x = f()\nresult = x";
    let func = load_named(&lua, "scripts/stepover.lua", code);
    debugger
        .call(&lua, func, false, MultiValue::new())
        .unwrap();

    let all = events(&buffer);
    let stops = breaks(&all);
    assert_eq!(stops.len(), 2, "events: {all:?}");
    assert_eq!(stops[0]["breakType"], "breakpoint");
    assert_eq!(stops[1]["breakType"], "step");

    // The stack listed at the step stop shows line 5, not the callee body
    let stack = all.iter().find(|e| e["type"] == "stack").unwrap();
    assert_eq!(stack["frames"][0]["line"], 5);
    assert_eq!(stack["frames"][0]["active"], true);

    let result: i64 = lua.globals().get("result").unwrap();
    assert_eq!(result, 1);
}

#[test]
fn step_into_enters_the_callee() {
    let lua = unsafe { Lua::unsafe_new() };
    let (debugger, buffer) = debugger_with_commands("stepin\nstack\ncont\n");
    debugger.set_breakpoint("scripts/stepin.lua", 4, None);

    let code = "local function f()\n  return 1\nend\nlocal x = f()\nresult = x";
    let func = load_named(&lua, "scripts/stepin.lua", code);
    debugger
        .call(&lua, func, false, MultiValue::new())
        .unwrap();

    let all = events(&buffer);
    let stops = breaks(&all);
    assert_eq!(stops.len(), 2);
    assert_eq!(stops[1]["breakType"], "step");
    let stack = all.iter().find(|e| e["type"] == "stack").unwrap();
    // Halted inside f, with the call site below it
    assert_eq!(stack["frames"][0]["line"], 2);
    assert_eq!(stack["frames"][1]["line"], 4);
}

#[test]
fn step_out_returns_to_the_caller() {
    let lua = unsafe { Lua::unsafe_new() };
    let (debugger, buffer) = debugger_with_commands("stepout\nstack\ncont\n");
    debugger.set_breakpoint("scripts/stepout.lua", 3, None);

    let code = "local function g()\n  local a = 1\n  a = a + 1\n  return a\nend\nresult = g()\ndone = true";
    let func = load_named(&lua, "scripts/stepout.lua", code);
    debugger
        .call(&lua, func, false, MultiValue::new())
        .unwrap();

    let all = events(&buffer);
    let stops = breaks(&all);
    assert_eq!(stops.len(), 2, "events: {all:?}");
    assert_eq!(stops[1]["breakType"], "step");
    let stack = all.iter().find(|e| e["type"] == "stack").unwrap();
    assert_eq!(stack["frames"][0]["line"], 7);

    let done: bool = lua.globals().get("done").unwrap();
    assert!(done);
}

#[test]
fn conditional_breakpoint_fires_once() {
    let lua = unsafe { Lua::unsafe_new() };
    let (debugger, buffer) = debugger_with_commands("eval i\ncont\n");
    debugger.set_breakpoint("scripts/cond.lua", 3, Some("i == 7".to_string()));

    let code = "count = 0\nfor i = 1, 10 do\n  count = count + i\nend\nresult = count";
    let func = load_named(&lua, "scripts/cond.lua", code);
    debugger
        .call(&lua, func, false, MultiValue::new())
        .unwrap();

    let all = events(&buffer);
    let stops = breaks(&all);
    assert_eq!(stops.len(), 1, "condition must fire exactly once: {all:?}");

    let result_event = all.iter().find(|e| e["type"] == "result").unwrap();
    assert_eq!(result_event["results"][0]["value"], "7");

    let count: i64 = lua.globals().get("result").unwrap();
    assert_eq!(count, 55);
}

#[test]
fn locals_listing_and_write_back() {
    let lua = unsafe { Lua::unsafe_new() };
    let (debugger, buffer) =
        debugger_with_commands("locals\nexec x = 99\ncont\n");
    debugger.set_breakpoint("scripts/locals.lua", 3, None);

    let code = "local function f()\n  local x = 5\n  marker = x\n  result = x\nend\nf()";
    let func = load_named(&lua, "scripts/locals.lua", code);
    debugger
        .call(&lua, func, false, MultiValue::new())
        .unwrap();

    let all = events(&buffer);
    let variables = all.iter().find(|e| e["type"] == "variables").unwrap();
    let listed: Vec<&str> = variables["variables"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["name"].as_str().unwrap())
        .collect();
    assert!(listed.contains(&"x"), "locals: {listed:?}");

    // exec wrote the local back into the frame
    let result: i64 = lua.globals().get("result").unwrap();
    assert_eq!(result, 99);
}

#[test]
fn exec_keeps_only_the_first_returned_value() {
    let lua = unsafe { Lua::unsafe_new() };
    let (debugger, buffer) =
        debugger_with_commands("exec flag = true\nexec return 1, 2, 3\ncont\n");
    debugger.set_breakpoint("scripts/execmulti.lua", 2, None);

    let code = "local a = 1\nresult = a";
    let func = load_named(&lua, "scripts/execmulti.lua", code);
    debugger
        .call(&lua, func, false, MultiValue::new())
        .unwrap();

    let all = events(&buffer);
    let results: Vec<_> = all.iter().filter(|e| e["type"] == "result").collect();
    assert_eq!(results.len(), 2, "events: {all:?}");
    // A statement with no trailing return produces no values
    assert_eq!(results[0]["results"].as_array().unwrap().len(), 0);
    // A multi-valued return is truncated to its first value
    let truncated = results[1]["results"].as_array().unwrap();
    assert_eq!(truncated.len(), 1, "results: {truncated:?}");
    assert_eq!(truncated[0]["value"], "1");

    let flag: bool = lua.globals().get("flag").unwrap();
    assert!(flag);
}

#[test]
fn eval_reads_upvalues_and_globals() {
    let lua = unsafe { Lua::unsafe_new() };
    let (debugger, buffer) = debugger_with_commands("eval x + up + glob\ncont\n");
    debugger.set_breakpoint("scripts/evalscope.lua", 5, None);

    let code = "glob = 100\nlocal up = 10\nlocal function f()\n  local x = 5\n  marker = x + up\nend\nf()";
    let func = load_named(&lua, "scripts/evalscope.lua", code);
    debugger
        .call(&lua, func, false, MultiValue::new())
        .unwrap();

    let all = events(&buffer);
    let result_event = all.iter().find(|e| e["type"] == "result").unwrap();
    assert_eq!(result_event["results"][0]["value"], "115");
}

#[test]
fn coroutine_step_in_and_thread_listing() {
    let lua = unsafe { Lua::unsafe_new() };
    let (debugger, buffer) = debugger_with_commands("stepin\nthreads\ncont\ncont\n");
    debugger.set_breakpoint("scripts/coro.lua", 6, None);

    let code = "local co = coroutine.create(function(a)\n  local y = a + 1\n  coroutine.yield(y)\n  return y\nend)\ncoroutine.resume(co, 1)\ncoroutine.resume(co)\nresult = true";
    let func = load_named(&lua, "scripts/coro.lua", code);
    debugger
        .call(&lua, func, false, MultiValue::new())
        .unwrap();

    let all = events(&buffer);
    let stops = breaks(&all);
    assert!(stops.len() >= 2, "events: {all:?}");
    assert_eq!(stops[0]["breakType"], "breakpoint");
    assert_eq!(stops[0]["threadId"], 1);
    // Step-in crossed into the coroutine
    assert_eq!(stops[1]["breakType"], "step");
    let coroutine_id = stops[1]["threadId"].as_u64().unwrap();
    assert!(coroutine_id > 1, "halted in a coroutine: {stops:?}");

    let threads = all.iter().find(|e| e["type"] == "threads").unwrap();
    let listed = threads["threads"].as_array().unwrap();
    assert!(listed.len() >= 2, "threads: {listed:?}");
    assert!(listed.iter().any(|t| t["id"] == 1));
    let active: Vec<_> = listed
        .iter()
        .filter(|t| t["active"] == true)
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["id"].as_u64().unwrap(), coroutine_id);

    let result: bool = lua.globals().get("result").unwrap();
    assert!(result);
}

#[test]
fn wrapped_coroutine_forwards_results() {
    let lua = unsafe { Lua::unsafe_new() };
    let (debugger, _buffer) = debugger_with_commands("");

    let code = "local gen = coroutine.wrap(function()\n  coroutine.yield(1)\n  coroutine.yield(2)\nend)\nresult = gen() + gen()";
    let func = load_named(&lua, "scripts/wrap.lua", code);
    debugger
        .call(&lua, func, false, MultiValue::new())
        .unwrap();

    let result: i64 = lua.globals().get("result").unwrap();
    assert_eq!(result, 3);
}

#[test]
fn uncaught_error_surfaces_as_error_break() {
    let lua = unsafe { Lua::unsafe_new() };
    let (debugger, buffer) = debugger_with_commands("cont\n");

    let func = load_named(&lua, "scripts/boom.lua", "local x = 1\nerror(\"boom\")");
    let outcome = debugger.call(&lua, func, false, MultiValue::new());

    let stops = breaks(&events(&buffer));
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0]["breakType"], "error");
    assert!(
        stops[0]["message"].as_str().unwrap().contains("boom"),
        "message: {:?}",
        stops[0]["message"]
    );

    // The process-level outcome is a failure, so the host exits non-zero
    let err = outcome.expect_err("chunk raised");
    assert!(err.to_string().contains("boom"));
}

#[test]
fn global_mode_error_override_breaks_once() {
    let lua = unsafe { Lua::unsafe_new() };
    let (debugger, buffer) = debugger_with_commands("cont\n");

    debugger.start(&lua, false).unwrap();
    let outcome = lua
        .load("local function fail()\n  error(\"kaput\")\nend\nfail()")
        .set_name("@scripts/global_err.lua")
        .exec();
    debugger.stop(&lua).unwrap();

    assert!(outcome.is_err());
    let stops = breaks(&events(&buffer));
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0]["breakType"], "error");
    assert!(stops[0]["message"].as_str().unwrap().contains("kaput"));
}

#[test]
fn overridden_globals_are_restored() {
    let lua = unsafe { Lua::unsafe_new() };
    let (debugger, _buffer) = debugger_with_commands("");

    let original_error: Function = lua.globals().get("error").unwrap();
    let original_assert: Function = lua.globals().get("assert").unwrap();
    let debug_table: mlua::Table = lua.globals().get("debug").unwrap();
    let original_traceback: Function = debug_table.get("traceback").unwrap();

    debugger.start(&lua, false).unwrap();
    let replaced: Function = lua.globals().get("error").unwrap();
    assert_ne!(replaced, original_error, "error must be interposed");

    debugger.stop(&lua).unwrap();
    let restored_error: Function = lua.globals().get("error").unwrap();
    let restored_assert: Function = lua.globals().get("assert").unwrap();
    let restored_traceback: Function = debug_table.get("traceback").unwrap();
    assert_eq!(restored_error, original_error);
    assert_eq!(restored_assert, original_assert);
    assert_eq!(restored_traceback, original_traceback);
}

#[test]
fn nested_hook_levels_restore_only_at_zero() {
    let lua = unsafe { Lua::unsafe_new() };
    let (debugger, _buffer) = debugger_with_commands("");

    let original_error: Function = lua.globals().get("error").unwrap();
    debugger.start(&lua, false).unwrap();
    debugger.start(&lua, false).unwrap();

    debugger.finish(&lua).unwrap();
    let still_replaced: Function = lua.globals().get("error").unwrap();
    assert_ne!(still_replaced, original_error);

    debugger.finish(&lua).unwrap();
    let restored: Function = lua.globals().get("error").unwrap();
    assert_eq!(restored, original_error);
}

#[test]
fn breakpoint_commands_round_trip() {
    let lua = unsafe { Lua::unsafe_new() };
    let commands = "break set scripts/cmd.lua:2 x > 1\nbreak list\nbreak dis scripts/cmd.lua:2\nbreak en scripts/cmd.lua:2\nbreak del scripts/cmd.lua:2\nbreak list\ncont\n";
    let (debugger, buffer) = debugger_with_commands(commands);

    let func = load_named(&lua, "scripts/cmd.lua", "local a = 1\na = a + 1\nresult = a");
    debugger.call(&lua, func, true, MultiValue::new()).unwrap();

    let all = events(&buffer);
    let listings: Vec<_> = all.iter().filter(|e| e["type"] == "breakpoints").collect();
    // set, list, dis, en, del, list
    assert_eq!(listings.len(), 6, "events: {all:?}");
    assert_eq!(listings[0]["breakpoints"][0]["line"], 2);
    assert_eq!(listings[0]["breakpoints"][0]["condition"], "x > 1");
    assert_eq!(listings[2]["breakpoints"][0]["enabled"], false);
    assert_eq!(listings[3]["breakpoints"][0]["enabled"], true);
    assert_eq!(listings[5]["breakpoints"].as_array().unwrap().len(), 0);
}

#[test]
fn unknown_command_reports_bad_command() {
    let lua = unsafe { Lua::unsafe_new() };
    let (debugger, buffer) = debugger_with_commands("florp\ncont\n");

    let func = load_named(&lua, "scripts/bad.lua", "result = 1");
    debugger.call(&lua, func, true, MultiValue::new()).unwrap();

    let all = events(&buffer);
    let errors: Vec<_> = all.iter().filter(|e| e["type"] == "error").collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["error"], "Bad command");
}

#[test]
fn autocont_resumes_like_continue() {
    let lua = unsafe { Lua::unsafe_new() };
    // Breakpoint changes are processed atomically within the stop, so
    // autocont only needs to resume without re-checking the stop line
    let (debugger, buffer) = debugger_with_commands("autocont\ncont\n");
    debugger.set_breakpoint("scripts/auto.lua", 2, None);

    let func = load_named(&lua, "scripts/auto.lua", "local a = 1\nresult = a + 1");
    debugger.call(&lua, func, true, MultiValue::new()).unwrap();

    let all = events(&buffer);
    let stops = breaks(&all);
    // The entry stop answered with autocont, then the line-2 breakpoint
    assert_eq!(stops.len(), 2, "events: {all:?}");
    assert_eq!(stops[0]["breakType"], "step");
    assert_eq!(stops[1]["breakType"], "breakpoint");
    let result: i64 = lua.globals().get("result").unwrap();
    assert_eq!(result, 2);
}

#[test]
#[serial]
fn source_mapped_breakpoint_and_stack_location() -> anyhow::Result<()> {
    lldbg_sourcemap::SourceMapStore::clear_cache();
    let dir = tempfile::tempdir().context("creating fixture directory")?;

    // Emitted file whose line 17 maps to main.ts:5
    let mut code = String::new();
    for _ in 0..16 {
        code.push_str("-- generated\n");
    }
    code.push_str("result = 42\n");
    let emitted = dir.path().join("out.lua");
    std::fs::write(&emitted, &code).context("writing emitted fixture")?;

    let mut mappings = ";".repeat(16);
    let mut segment = String::new();
    for value in [0i64, 0, 4, 2] {
        lldbg_sourcemap::vlq::encode(value, &mut segment);
    }
    mappings.push_str(&segment);
    std::fs::write(
        dir.path().join("out.lua.map"),
        format!(r#"{{"sources":["main.ts"],"mappings":"{mappings}"}}"#),
    )
    .context("writing sidecar map fixture")?;

    let lua = unsafe { Lua::unsafe_new() };
    let (debugger, buffer) = debugger_with_commands("stack\ncont\n");
    let original = format!("{}/main.ts", dir.path().to_string_lossy());
    debugger.set_breakpoint(&original, 5, None);

    let emitted_str = emitted.to_string_lossy().into_owned();
    debugger
        .run_file(&lua, &emitted_str, false, MultiValue::new())
        .context("running the emitted file under the debugger")?;

    let all = events(&buffer);
    let stops = breaks(&all);
    assert_eq!(stops.len(), 1, "events: {all:?}");
    assert_eq!(stops[0]["breakType"], "breakpoint");

    let stack = all.iter().find(|e| e["type"] == "stack").unwrap();
    let frame = &stack["frames"][0];
    assert_eq!(frame["line"], 17);
    let mapped = &frame["mappedLocation"];
    assert!(
        mapped["source"].as_str().unwrap().ends_with("main.ts"),
        "frame: {frame:?}"
    );
    assert_eq!(mapped["line"], 5);

    let result: i64 = lua.globals().get("result")?;
    assert_eq!(result, 42);
    lldbg_sourcemap::SourceMapStore::clear_cache();
    Ok(())
}

#[test]
fn props_expands_tables() {
    let lua = unsafe { Lua::unsafe_new() };
    let (debugger, buffer) =
        debugger_with_commands("props t all\nprops t named\nprops t indexed 1 2\ncont\n");
    debugger.set_breakpoint("scripts/props.lua", 3, None);

    let code = "local t = { 10, 20, 30, name = \"x\" }\nlocal probe = t\nmarker = probe\nresult = t[1]";
    let func = load_named(&lua, "scripts/props.lua", code);
    debugger.call(&lua, func, false, MultiValue::new()).unwrap();

    let all = events(&buffer);
    let props: Vec<_> = all.iter().filter(|e| e["type"] == "properties").collect();
    assert_eq!(props.len(), 3, "events: {all:?}");

    let all_props = props[0]["properties"].as_array().unwrap();
    assert_eq!(all_props.len(), 4);
    assert_eq!(props[0]["length"], 3);

    let named = props[1]["properties"].as_array().unwrap();
    assert_eq!(named.len(), 1);
    assert_eq!(named[0]["name"], "name");

    let indexed = props[2]["properties"].as_array().unwrap();
    assert_eq!(indexed.len(), 2);
    assert_eq!(indexed[0]["value"], "10");
    assert_eq!(indexed[1]["value"], "20");
}

#[test]
fn frame_switch_changes_eval_scope() {
    let lua = unsafe { Lua::unsafe_new() };
    let (debugger, buffer) = debugger_with_commands("eval v\nframe 2\neval v\ncont\n");
    debugger.set_breakpoint("scripts/frames.lua", 3, None);

    let code = "local function inner()\n  local v = \"inner\"\n  marker = v\nend\nlocal function outer()\n  local v = \"outer\"\n  inner()\nend\nouter()";
    let func = load_named(&lua, "scripts/frames.lua", code);
    debugger.call(&lua, func, false, MultiValue::new()).unwrap();

    let all = events(&buffer);
    let results: Vec<_> = all.iter().filter(|e| e["type"] == "result").collect();
    assert_eq!(results.len(), 2, "events: {all:?}");
    assert_eq!(results[0]["results"][0]["value"], "inner");
    assert_eq!(results[1]["results"][0]["value"], "outer");
}
