//! Cooperative thread registry.
//!
//! Every coroutine the debugger sees is assigned a stable integer id; the
//! main task is id 1 and its entry is permanent. Coroutine handles are kept
//! in the Lua registry, so the registry sweeps entries whose status reports
//! `"dead"` during hook events instead of relying on weak references.

use mlua::{Function, Lua, RegistryKey, Table, Thread};
use tracing::{debug, trace};

/// Id of the interpreter's root execution context
pub const MAIN_THREAD_ID: u64 = 1;

/// The task currently executing, as seen from inside a callback
pub enum ActiveThread<'lua> {
    Main,
    Coroutine(Thread<'lua>),
}

struct ThreadEntry {
    id: u64,
    key: RegistryKey,
}

/// Registry of cooperative tasks with monotonically increasing ids
pub struct ThreadRegistry {
    entries: Vec<ThreadEntry>,
    next_id: u64,
}

impl ThreadRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: MAIN_THREAD_ID + 1,
        }
    }

    /// Register a coroutine, returning its id; idempotent per handle
    pub fn register(&mut self, lua: &Lua, thread: &Thread) -> mlua::Result<u64> {
        if let Some(id) = self.lookup(lua, thread) {
            return Ok(id);
        }
        let id = self.next_id;
        self.next_id += 1;
        let key = lua.create_registry_value(thread.clone())?;
        self.entries.push(ThreadEntry { id, key });
        debug!(thread_id = id, "registered coroutine");
        Ok(id)
    }

    /// Id of an already-registered coroutine
    #[must_use]
    pub fn lookup(&self, lua: &Lua, thread: &Thread) -> Option<u64> {
        self.entries.iter().find_map(|entry| {
            lua.registry_value::<Thread>(&entry.key)
                .ok()
                .filter(|stored| stored == thread)
                .map(|_| entry.id)
        })
    }

    /// Handle of a registered coroutine by id
    #[must_use]
    pub fn thread_by_id<'lua>(&self, lua: &'lua Lua, id: u64) -> Option<Thread<'lua>> {
        self.entries
            .iter()
            .find(|entry| entry.id == id)
            .and_then(|entry| lua.registry_value::<Thread>(&entry.key).ok())
    }

    /// `coroutine.status` of a registered coroutine; `None` once swept
    #[must_use]
    pub fn status(&self, lua: &Lua, id: u64) -> Option<String> {
        let thread = self.thread_by_id(lua, id)?;
        coroutine_status(lua, &thread).ok()
    }

    /// Drop entries whose coroutine has died
    pub fn sweep(&mut self, lua: &Lua) {
        self.entries.retain(|entry| {
            let alive = lua
                .registry_value::<Thread>(&entry.key)
                .and_then(|t| coroutine_status(lua, &t))
                .map_or(false, |status| status != "dead");
            if !alive {
                trace!(thread_id = entry.id, "sweeping dead coroutine");
            }
            alive
        });
        lua.expire_registry_values();
    }

    /// Alive entries as `(id, status)`, main task first
    ///
    /// Main reports `"running"` when it is the active task and `"normal"`
    /// otherwise; coroutines report their `coroutine.status`.
    #[must_use]
    pub fn alive(&self, lua: &Lua, active_id: u64) -> Vec<(u64, String)> {
        let main_status = if active_id == MAIN_THREAD_ID {
            "running"
        } else {
            "normal"
        };
        let mut list = vec![(MAIN_THREAD_ID, main_status.to_string())];
        for entry in &self.entries {
            if let Ok(thread) = lua.registry_value::<Thread>(&entry.key) {
                if let Ok(status) = coroutine_status(lua, &thread) {
                    if status != "dead" {
                        list.push((entry.id, status));
                    }
                }
            }
        }
        list
    }

    /// Ids of every registered (possibly dead) coroutine
    #[must_use]
    pub fn ids(&self) -> Vec<u64> {
        self.entries.iter().map(|e| e.id).collect()
    }

    /// Resolve the running task and its id, registering unseen coroutines
    pub fn current<'lua>(&mut self, lua: &'lua Lua) -> mlua::Result<(ActiveThread<'lua>, u64)> {
        let coroutine: Table = lua.globals().get("coroutine")?;
        let running: Function = coroutine.get("running")?;
        let (thread, is_main): (Thread, bool) = running.call(())?;
        if is_main {
            Ok((ActiveThread::Main, MAIN_THREAD_ID))
        } else {
            let id = self.register(lua, &thread)?;
            Ok((ActiveThread::Coroutine(thread), id))
        }
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// `coroutine.status` for a handle
pub fn coroutine_status(lua: &Lua, thread: &Thread) -> mlua::Result<String> {
    let coroutine: Table = lua.globals().get("coroutine")?;
    let status: Function = coroutine.get("status")?;
    status.call(thread.clone())
}
