//! In-process source-level debugger engine for Lua 5.4.
//!
//! The engine is loaded into the debuggee process and drives breakpoint and
//! step control from the interpreter's per-line hook, evaluates expressions
//! in arbitrary stack frames, and speaks a framed JSON text protocol with an
//! out-of-process debug adapter over stdio or a configured file sink.
//!
//! ```no_run
//! use lldbg_engine::Debugger;
//! use mlua::Lua;
//!
//! # fn main() -> lldbg_core::Result<()> {
//! let lua = Lua::new();
//! let debugger = Debugger::from_env()?;
//! debugger.run_file(&lua, "main.lua", true, mlua::MultiValue::new())?;
//! # Ok(())
//! # }
//! ```

pub mod breakpoints;
pub mod controller;
pub mod evaluator;
pub mod hooks;
pub mod introspect;
pub mod output;
pub mod threads;

mod command_loop;

pub use hooks::HookMode;
pub use lldbg_core::{DebugConfig, DebugError, Result};

use breakpoints::BreakpointTable;
use controller::BreakState;
use hooks::Originals;
use lldbg_core::protocol::{BreakType, Message, ProtocolWriter};
use lldbg_sourcemap::remap_positions;
use mlua::{Function, Lua, MultiValue, RegistryKey, Value};
use parking_lot::{Mutex, RwLock};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use threads::ThreadRegistry;
use tracing::warn;

/// Shared engine state, reachable from every installed callback
pub(crate) struct EngineState {
    pub(crate) config: DebugConfig,
    pub(crate) writer: Mutex<ProtocolWriter<Box<dyn Write + Send>>>,
    pub(crate) input: Mutex<Box<dyn BufRead + Send>>,
    pub(crate) breakpoints: RwLock<BreakpointTable>,
    pub(crate) threads: Mutex<ThreadRegistry>,
    pub(crate) break_state: Mutex<BreakState>,
    pub(crate) hook_stack: Mutex<Vec<HookMode>>,
    pub(crate) originals: Mutex<Option<Originals>>,
    pub(crate) hook_fn: Mutex<Option<RegistryKey>>,
    /// Line-hook activation counter; at most one at a time
    pub(crate) hook_entries: AtomicU32,
    /// Set while the command loop runs, so reentrant events never break
    pub(crate) in_break: AtomicBool,
}

impl EngineState {
    /// Write one protocol message; sink failures are logged, not fatal
    pub(crate) fn send(&self, message: &Message) {
        if let Err(e) = self.writer.lock().send(message) {
            warn!(error = %e, "failed to write protocol message");
        }
    }

    /// Blocking read of one command line; `None` once the sink closes
    pub(crate) fn read_line(&self) -> Option<String> {
        let mut buffer = String::new();
        match self.input.lock().read_line(&mut buffer) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(buffer),
        }
    }
}

/// The in-debuggee debugger
///
/// One `Debugger` owns the protocol sink, the breakpoint table, the thread
/// registry and the break state. It installs and removes the interpreter
/// hooks through [`Debugger::start`]/[`Debugger::stop`] or scoped around
/// [`Debugger::run_file`]/[`Debugger::call`].
pub struct Debugger {
    state: Arc<EngineState>,
}

impl Debugger {
    /// Build a debugger with the given configuration
    ///
    /// # Errors
    ///
    /// Fails when the configured output file cannot be opened; the sink is
    /// required for the whole session.
    pub fn new(config: DebugConfig) -> Result<Self> {
        let sink: Box<dyn Write + Send> = match &config.output_file {
            Some(path) => Box::new(File::create(path).map_err(|e| DebugError::OutputSink {
                message: format!("cannot open {path}: {e}"),
            })?),
            None => Box::new(std::io::stdout()),
        };
        let input: Box<dyn BufRead + Send> = Box::new(BufReader::new(std::io::stdin()));
        Ok(Self::with_io(config, input, sink))
    }

    /// Build a debugger from the `LOCAL_LUA_DEBUGGER_*` environment
    ///
    /// # Errors
    ///
    /// Fails when the configured output file cannot be opened.
    pub fn from_env() -> Result<Self> {
        Self::new(DebugConfig::from_env())
    }

    /// Build a debugger over explicit input/output sinks
    #[must_use]
    pub fn with_io(
        config: DebugConfig,
        input: Box<dyn BufRead + Send>,
        output: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            state: Arc::new(EngineState {
                config,
                writer: Mutex::new(ProtocolWriter::new(output)),
                input: Mutex::new(input),
                breakpoints: RwLock::new(BreakpointTable::new()),
                threads: Mutex::new(ThreadRegistry::new()),
                break_state: Mutex::new(BreakState::new()),
                hook_stack: Mutex::new(Vec::new()),
                originals: Mutex::new(None),
                hook_fn: Mutex::new(None),
                hook_entries: AtomicU32::new(0),
                in_break: AtomicBool::new(false),
            }),
        }
    }

    /// Install the hooks in Global mode
    ///
    /// # Errors
    ///
    /// Fails when the host lacks the `debug` library or installation fails
    /// partway (in which case every touched site has been restored).
    pub fn start(&self, lua: &Lua, break_immediately: bool) -> Result<()> {
        hooks::push_hook(&self.state, lua, HookMode::Global).map_err(lua_failure)?;
        if break_immediately || self.state.config.break_on_entry {
            self.request_break();
        }
        Ok(())
    }

    /// Remove every hook level and restore all overridden globals
    ///
    /// # Errors
    ///
    /// Fails when the restore itself fails.
    pub fn stop(&self, lua: &Lua) -> Result<()> {
        hooks::clear_hooks(&self.state, lua).map_err(lua_failure)
    }

    /// Pop one hook level (the counterpart of one `start`/`run_file`/`call`)
    ///
    /// # Errors
    ///
    /// Fails when the restore fails while the stack empties.
    pub fn finish(&self, lua: &Lua) -> Result<()> {
        hooks::pop_hook(&self.state, lua).map_err(lua_failure)
    }

    /// Arm an asynchronous break before the next executed line
    pub fn request_break(&self) {
        self.state.break_state.lock().trigger_break();
    }

    /// Set a breakpoint programmatically (the adapter path is `break set`)
    pub fn set_breakpoint(&self, file: &str, line: u32, condition: Option<String>) {
        self.state
            .breakpoints
            .write()
            .add(file, line, condition, &self.state.config.script_roots);
    }

    /// Remove a breakpoint; returns false when none matched
    pub fn remove_breakpoint(&self, file: &str, line: u32) -> bool {
        self.state.breakpoints.write().remove(file, line)
    }

    /// Drop every breakpoint
    pub fn clear_breakpoints(&self) {
        self.state.breakpoints.write().clear();
    }

    /// Load and execute a file under a Function-mode hook
    ///
    /// The chunk runs under a protected call whose handler surfaces an
    /// uncaught error as an `error` break before unwinding.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or compiled, or when the chunk
    /// raises; the error text has source positions remapped.
    pub fn run_file<'lua>(
        &self,
        lua: &'lua Lua,
        path: &str,
        break_immediately: bool,
        args: MultiValue<'lua>,
    ) -> Result<MultiValue<'lua>> {
        let source = std::fs::read_to_string(path)?;
        let chunk_name = format!("@{path}");
        let func = lua
            .load(&source)
            .set_name(chunk_name)
            .into_function()
            .map_err(lua_failure)?;
        self.call(lua, func, break_immediately, args)
    }

    /// Execute a function under a Function-mode hook
    ///
    /// # Errors
    ///
    /// Fails when the function raises; the error text has source positions
    /// remapped.
    pub fn call<'lua>(
        &self,
        lua: &'lua Lua,
        func: Function<'lua>,
        break_immediately: bool,
        args: MultiValue<'lua>,
    ) -> Result<MultiValue<'lua>> {
        hooks::push_hook(&self.state, lua, HookMode::Function).map_err(lua_failure)?;
        if break_immediately || self.state.config.break_on_entry {
            self.request_break();
        }
        let result = self.protected_run(lua, func, args);
        if let Err(e) = hooks::pop_hook(&self.state, lua) {
            warn!(error = %e, "failed to remove debug hooks");
        }
        result
    }

    /// Run `func` under `xpcall` with a handler that breaks on uncaught
    /// errors while the failing stack is still live
    fn protected_run<'lua>(
        &self,
        lua: &'lua Lua,
        func: Function<'lua>,
        args: MultiValue<'lua>,
    ) -> Result<MultiValue<'lua>> {
        let state = Arc::clone(&self.state);
        let handler = lua
            .create_function(move |lua, message: Value| {
                let text = match &message {
                    Value::String(s) => s.to_string_lossy().into_owned(),
                    other => output::lua_tostring(lua, other),
                };
                let mapped = remap_positions(&text, &state.config.script_roots);
                // An `error`/`assert` override already reported this one
                let suppressed = state.break_state.lock().consume_skip_next_traceback();
                if !suppressed && !state.in_break.load(Ordering::SeqCst) {
                    hooks::break_from_here(&state, lua, mapped.clone(), BreakType::Error)?;
                }
                lua.create_string(&mapped).map(Value::String)
            })
            .map_err(lua_failure)?;

        let xpcall: Function = lua.globals().get("xpcall").map_err(lua_failure)?;
        let results: MultiValue = xpcall
            .call((func, handler, args))
            .map_err(lua_failure)?;

        let mut values = results.into_iter();
        match values.next() {
            Some(Value::Boolean(true)) => Ok(values.collect()),
            _ => {
                let message = values
                    .next()
                    .map_or_else(|| "unknown error".to_string(), |v| describe_error(lua, &v));
                Err(DebugError::script(message))
            }
        }
    }
}

fn describe_error(lua: &Lua, value: &Value) -> String {
    match value {
        Value::String(s) => s.to_string_lossy().into_owned(),
        other => output::lua_tostring(lua, other),
    }
}

fn lua_failure(e: mlua::Error) -> DebugError {
    DebugError::script(e.to_string())
}
