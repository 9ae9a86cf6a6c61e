//! Step/breakpoint break state and the halt decision.
//!
//! The controller owns the three-integer break state of the engine:
//! the depth threshold for stepping, the thread a step is scoped to, and the
//! one-shot traceback suppression used by the error-path intercepts. The
//! halt decision itself is pure so it can be exercised without a running
//! interpreter; the hook supplies thread liveness through a callback.

use tracing::debug;

/// Depth threshold under which the next line halts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakDepth {
    /// Stepping disabled
    Disabled,
    /// Halt when the current depth is at or under this value
    Depth(u32),
    /// Halt on the very next line anywhere
    Infinite,
}

/// Liveness of the thread a step is scoped to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadLiveness {
    Alive,
    Dead,
}

/// Mutable break state, updated by resume verbs and consulted per line event
#[derive(Debug)]
pub struct BreakState {
    break_at_depth: BreakDepth,
    break_in_thread: Option<u64>,
    skip_next_traceback: bool,
    /// One-shot suppression of breakpoint checks at a position (`autocont`)
    skip_breakpoints_at: Option<(String, u32)>,
}

impl BreakState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            break_at_depth: BreakDepth::Disabled,
            break_in_thread: None,
            skip_next_traceback: false,
            skip_breakpoints_at: None,
        }
    }

    // ===== Resume-verb transitions =====

    /// `continue`: stepping off
    pub fn on_continue(&mut self) {
        self.break_at_depth = BreakDepth::Disabled;
        self.break_in_thread = None;
    }

    /// `autocont`: stepping off, breakpoints suppressed once at `position`
    pub fn on_auto_continue(&mut self, source: String, line: u32) {
        self.on_continue();
        self.skip_breakpoints_at = Some((source, line));
    }

    /// `step` (step-over): halt at or above the current depth, this thread
    pub fn on_step(&mut self, current_depth: u32, thread: u64) {
        self.break_at_depth = BreakDepth::Depth(current_depth);
        self.break_in_thread = Some(thread);
        debug!(depth = current_depth, thread, "step over armed");
    }

    /// `stepin`: halt on the next line anywhere
    pub fn on_step_in(&mut self) {
        self.break_at_depth = BreakDepth::Infinite;
        self.break_in_thread = None;
        debug!("step in armed");
    }

    /// `stepout`: halt strictly above the current depth, this thread
    pub fn on_step_out(&mut self, current_depth: u32, thread: u64) {
        self.break_at_depth = match current_depth.checked_sub(1) {
            Some(depth) => BreakDepth::Depth(depth),
            // Top frame of the main task: nothing above to return to
            None => BreakDepth::Disabled,
        };
        self.break_in_thread = Some(thread);
        debug!(depth = current_depth, thread, "step out armed");
    }

    /// External `requestBreak()`: halt at the next line
    pub fn trigger_break(&mut self) {
        self.break_at_depth = BreakDepth::Infinite;
        self.break_in_thread = None;
    }

    // ===== Per-event queries =====

    /// Step decision for one line event; consulted before breakpoints
    ///
    /// `liveness` resolves the scoped thread's status; it is only invoked
    /// when the event comes from a different thread than the scoped one.
    pub fn step_decision(
        &self,
        active_thread: u64,
        current_depth: u32,
        liveness: impl FnOnce(u64) -> ThreadLiveness,
    ) -> bool {
        let threshold = match self.break_at_depth {
            BreakDepth::Disabled => return false,
            BreakDepth::Infinite => return true,
            BreakDepth::Depth(d) => d,
        };
        match self.break_in_thread {
            None => true,
            Some(scoped) if scoped == active_thread => current_depth <= threshold,
            // The step target finished while another thread runs
            Some(scoped) => liveness(scoped) == ThreadLiveness::Dead,
        }
    }

    /// Consume the one-shot breakpoint suppression if it covers `position`
    pub fn consume_breakpoint_skip(&mut self, source: &str, line: u32) -> bool {
        if self
            .skip_breakpoints_at
            .as_ref()
            .is_some_and(|(s, l)| s == source && *l == line)
        {
            self.skip_breakpoints_at = None;
            true
        } else {
            false
        }
    }

    /// Clear a stale suppression once execution left the recorded position
    pub fn clear_breakpoint_skip(&mut self) {
        self.skip_breakpoints_at = None;
    }

    /// Arm the one-shot traceback suppression (set after an `error` break)
    pub fn set_skip_next_traceback(&mut self) {
        self.skip_next_traceback = true;
    }

    /// Consume the traceback suppression flag
    pub fn consume_skip_next_traceback(&mut self) -> bool {
        std::mem::take(&mut self.skip_next_traceback)
    }

    #[must_use]
    pub const fn break_at_depth(&self) -> BreakDepth {
        self.break_at_depth
    }

    #[must_use]
    pub const fn break_in_thread(&self) -> Option<u64> {
        self.break_in_thread
    }
}

impl Default for BreakState {
    fn default() -> Self {
        Self::new()
    }
}
