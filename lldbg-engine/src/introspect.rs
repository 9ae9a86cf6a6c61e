//! Access to the host's `debug` library.
//!
//! Everything the engine knows about live frames comes through
//! `debug.getinfo`/`getlocal`/`getupvalue` and their setters, fetched from
//! globals and invoked as Lua functions. Level arithmetic is never
//! hard-coded: [`DebugLib::find_base_level`] scans for the first frame that
//! does not belong to the debugger, so the same code works from the line
//! hook, the error overrides and the protected-call handler.

use mlua::{Function, Lua, Table, Thread, Value};

/// Chunk name suffix marking every chunk the debugger compiles
pub const CHUNK_MARKER: &str = "[lldbg]";

/// Chunk-name prefix of host built-ins the hook must never debug
pub const BUILTIN_PREFIX: &str = "[builtin:";

/// Upper bound when scanning stack levels
const MAX_STACK_SCAN: i64 = 250;

/// Basic fields of one `debug.getinfo` result
#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub source: String,
    pub what: String,
    pub name: Option<String>,
    pub current_line: Option<u32>,
}

impl FrameInfo {
    fn from_table(info: &Table) -> mlua::Result<Self> {
        let current_line = info
            .get::<_, Option<i64>>("currentline")?
            .filter(|l| *l > 0)
            .map(|l| l as u32);
        Ok(Self {
            source: info.get::<_, Option<String>>("source")?.unwrap_or_default(),
            what: info
                .get::<_, Option<String>>("what")?
                .unwrap_or_else(|| "?".to_string()),
            name: info.get::<_, Option<String>>("name")?,
            current_line,
        })
    }

    /// Whether this frame belongs to the debugger or a host built-in
    #[must_use]
    pub fn is_off_limits(&self) -> bool {
        self.source.ends_with(CHUNK_MARKER) || self.source.starts_with(BUILTIN_PREFIX)
    }
}

/// Handles to the `debug` library functions used by the engine
pub struct DebugLib<'lua> {
    getinfo: Function<'lua>,
    getlocal: Function<'lua>,
    setlocal: Function<'lua>,
    getupvalue: Function<'lua>,
    setupvalue: Function<'lua>,
    sethook: Function<'lua>,
}

impl<'lua> DebugLib<'lua> {
    /// Fetch the library from globals
    ///
    /// # Errors
    ///
    /// Fails when the host was built without the `debug` library.
    pub fn fetch(lua: &'lua Lua) -> mlua::Result<Self> {
        let debug: Table = lua.globals().get("debug")?;
        Ok(Self {
            getinfo: debug.get("getinfo")?,
            getlocal: debug.get("getlocal")?,
            setlocal: debug.get("setlocal")?,
            getupvalue: debug.get("getupvalue")?,
            setupvalue: debug.get("setupvalue")?,
            sethook: debug.get("sethook")?,
        })
    }

    /// `debug.getinfo`, optionally thread-qualified
    pub fn info(
        &self,
        thread: Option<&Thread<'lua>>,
        level: i64,
        what: &str,
    ) -> mlua::Result<Option<Table<'lua>>> {
        let value: Value = match thread {
            Some(t) => self.getinfo.call((t.clone(), level, what))?,
            None => self.getinfo.call((level, what))?,
        };
        Ok(match value {
            Value::Table(t) => Some(t),
            _ => None,
        })
    }

    /// Basic frame fields at a level
    pub fn frame_info(
        &self,
        thread: Option<&Thread<'lua>>,
        level: i64,
    ) -> mlua::Result<Option<FrameInfo>> {
        self.info(thread, level, "nSl")?
            .as_ref()
            .map(FrameInfo::from_table)
            .transpose()
    }

    /// The frame's function object
    pub fn frame_function(
        &self,
        thread: Option<&Thread<'lua>>,
        level: i64,
    ) -> mlua::Result<Option<Function<'lua>>> {
        Ok(self
            .info(thread, level, "f")?
            .and_then(|t| t.get::<_, Option<Function>>("func").ok().flatten()))
    }

    /// Number of upvalues of the frame's function
    pub fn frame_nups(&self, thread: Option<&Thread<'lua>>, level: i64) -> mlua::Result<u32> {
        Ok(self
            .info(thread, level, "u")?
            .and_then(|t| t.get::<_, Option<u32>>("nups").ok().flatten())
            .unwrap_or(0))
    }

    /// `debug.getlocal`; slot may be negative for varargs
    pub fn get_local(
        &self,
        thread: Option<&Thread<'lua>>,
        level: i64,
        slot: i64,
    ) -> mlua::Result<(Option<String>, Value<'lua>)> {
        match thread {
            Some(t) => self.getlocal.call((t.clone(), level, slot)),
            None => self.getlocal.call((level, slot)),
        }
    }

    /// `debug.setlocal`; returns the slot name, `None` when out of range
    pub fn set_local(
        &self,
        thread: Option<&Thread<'lua>>,
        level: i64,
        slot: i64,
        value: Value<'lua>,
    ) -> mlua::Result<Option<String>> {
        match thread {
            Some(t) => self.setlocal.call((t.clone(), level, slot, value)),
            None => self.setlocal.call((level, slot, value)),
        }
    }

    /// `debug.getupvalue`
    pub fn get_upvalue(
        &self,
        func: &Function<'lua>,
        slot: i64,
    ) -> mlua::Result<(Option<String>, Value<'lua>)> {
        self.getupvalue.call((func.clone(), slot))
    }

    /// `debug.setupvalue`
    pub fn set_upvalue(
        &self,
        func: &Function<'lua>,
        slot: i64,
        value: Value<'lua>,
    ) -> mlua::Result<Option<String>> {
        self.setupvalue.call((func.clone(), slot, value))
    }

    /// Install a line hook on the current task or a coroutine
    pub fn set_line_hook(
        &self,
        thread: Option<&Thread<'lua>>,
        hook: &Function<'lua>,
    ) -> mlua::Result<()> {
        match thread {
            Some(t) => self.sethook.call((t.clone(), hook.clone(), "l")),
            None => self.sethook.call((hook.clone(), "l")),
        }
    }

    /// Remove the hook from the current task or a coroutine
    pub fn clear_hook(&self, thread: Option<&Thread<'lua>>) -> mlua::Result<()> {
        match thread {
            Some(t) => self.sethook.call(t.clone()),
            None => self.sethook.call(()),
        }
    }

    /// First stack level that is not debugger plumbing
    ///
    /// Skips the contiguous run of C frames on top of the stack (the hook or
    /// override trampoline the engine entered through) and any chunk carrying
    /// the debugger marker. Returns the level of the first frame below them.
    pub fn find_base_level(&self) -> mlua::Result<Option<i64>> {
        for level in 1..MAX_STACK_SCAN {
            let Some(info) = self.frame_info(None, level)? else {
                return Ok(None);
            };
            if info.what == "C" || info.source.ends_with(CHUNK_MARKER) {
                continue;
            }
            return Ok(Some(level));
        }
        Ok(None)
    }

    /// Number of frames at or below `base` (the user-visible stack depth)
    pub fn stack_depth(&self, thread: Option<&Thread<'lua>>, base: i64) -> mlua::Result<u32> {
        let mut depth = 0u32;
        let mut level = base;
        while level < MAX_STACK_SCAN {
            if self.info(thread, level, "S")?.is_none() {
                break;
            }
            depth += 1;
            level += 1;
        }
        Ok(depth)
    }
}
