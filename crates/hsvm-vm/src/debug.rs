//! Debug support for the dispatch loop.
//!
//! Provides breakpoints, stepping, execution control and per-instruction
//! coverage for [`Vm::execute_debug`](crate::machine::Vm::execute_debug).

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::library::LibraryId;

/// Debug execution mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DebugMode {
    /// Run until breakpoint or completion.
    Running,
    /// Paused, waiting for command.
    Paused,
    /// Execute one instruction then pause.
    StepInto,
    /// Execute until call depth decreases (exit current call).
    StepOut,
    /// Execute until same or lower call depth (step over calls).
    StepOver,
}

/// Event that caused execution to pause.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DebugEvent {
    /// Hit a breakpoint at this instruction.
    Breakpoint { library: LibraryId, ip: usize },
    /// Completed a step operation.
    Step,
    /// Started in paused mode.
    Paused,
}

/// Debug state for controlling execution.
#[derive(Debug)]
pub struct DebugState {
    /// Breakpoints by library and instruction offset.
    breakpoints: HashSet<(LibraryId, usize)>,

    /// Current execution mode.
    mode: DebugMode,

    /// For step-out: target call depth to reach.
    step_out_depth: Option<usize>,

    /// For step-over: call depth when step started.
    step_over_depth: Option<usize>,

    /// Track if we've executed at least one instruction since last pause.
    executed_since_pause: bool,

    /// Location where we last paused (to avoid re-triggering the same breakpoint).
    last_pause: Option<(LibraryId, usize, usize)>,

    /// Executed instruction offsets per library.
    coverage: HashMap<LibraryId, BTreeSet<usize>>,
}

impl DebugState {
    /// Create a new debug state in running mode.
    pub fn new() -> Self {
        Self {
            breakpoints: HashSet::new(),
            mode: DebugMode::Running,
            step_out_depth: None,
            step_over_depth: None,
            executed_since_pause: true,
            last_pause: None,
            coverage: HashMap::new(),
        }
    }

    /// Create a new debug state that starts paused.
    pub fn paused() -> Self {
        Self {
            mode: DebugMode::Paused,
            executed_since_pause: false,
            ..Self::new()
        }
    }

    pub fn add_breakpoint(&mut self, library: LibraryId, ip: usize) {
        self.breakpoints.insert((library, ip));
    }

    pub fn remove_breakpoint(&mut self, library: LibraryId, ip: usize) {
        self.breakpoints.remove(&(library, ip));
    }

    pub fn has_breakpoint(&self, library: LibraryId, ip: usize) -> bool {
        self.breakpoints.contains(&(library, ip))
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = (LibraryId, usize)> + '_ {
        self.breakpoints.iter().copied()
    }

    pub fn clear_breakpoints(&mut self) {
        self.breakpoints.clear();
    }

    pub fn mode(&self) -> DebugMode {
        self.mode
    }

    /// Continue running until next breakpoint.
    pub fn continue_running(&mut self) {
        self.mode = DebugMode::Running;
        self.executed_since_pause = false;
        self.step_out_depth = None;
        self.step_over_depth = None;
    }

    /// Step into the next instruction.
    pub fn step_into(&mut self) {
        self.mode = DebugMode::StepInto;
        self.executed_since_pause = false;
        self.step_out_depth = None;
        self.step_over_depth = None;
    }

    /// Step over the current instruction (don't descend into calls).
    pub fn step_over(&mut self, current_depth: usize) {
        self.mode = DebugMode::StepOver;
        self.step_over_depth = Some(current_depth);
        self.executed_since_pause = false;
        self.step_out_depth = None;
    }

    /// Step out of the current call.
    pub fn step_out(&mut self, current_depth: usize) {
        self.mode = DebugMode::StepOut;
        self.step_out_depth = Some(current_depth.saturating_sub(1));
        self.executed_since_pause = false;
        self.step_over_depth = None;
    }

    /// Check if we should pause before executing the instruction at `ip`.
    ///
    /// Returns `Some(event)` if we should pause, `None` to continue.
    pub fn check(&mut self, library: LibraryId, ip: usize, call_depth: usize) -> Option<DebugEvent> {
        let location = (library, ip, call_depth);
        match self.mode {
            DebugMode::Paused => {
                if !self.executed_since_pause {
                    self.last_pause = Some(location);
                    return Some(DebugEvent::Paused);
                }
                None
            }

            DebugMode::Running => {
                let same_location = self.last_pause == Some(location);
                if self.breakpoints.contains(&(library, ip)) && !same_location {
                    self.pause_at(location);
                    Some(DebugEvent::Breakpoint { library, ip })
                } else {
                    if !same_location {
                        self.last_pause = None;
                    }
                    None
                }
            }

            DebugMode::StepInto => {
                if self.executed_since_pause {
                    self.pause_at(location);
                    Some(DebugEvent::Step)
                } else {
                    None
                }
            }

            DebugMode::StepOver => match self.step_over_depth {
                Some(target) if self.executed_since_pause && call_depth <= target => {
                    self.step_over_depth = None;
                    self.pause_at(location);
                    Some(DebugEvent::Step)
                }
                _ => None,
            },

            DebugMode::StepOut => match self.step_out_depth {
                Some(target) if self.executed_since_pause && call_depth <= target => {
                    self.step_out_depth = None;
                    self.pause_at(location);
                    Some(DebugEvent::Step)
                }
                _ => None,
            },
        }
    }

    fn pause_at(&mut self, location: (LibraryId, usize, usize)) {
        self.mode = DebugMode::Paused;
        self.executed_since_pause = false;
        self.last_pause = Some(location);
    }

    /// Mark that an instruction was executed. Call after each instruction.
    pub fn mark_executed(&mut self, library: LibraryId, ip: usize) {
        self.executed_since_pause = true;
        self.coverage.entry(library).or_default().insert(ip);
    }

    /// Executed instruction offsets of a library, in ascending order.
    pub fn coverage(&self, library: LibraryId) -> impl Iterator<Item = usize> + '_ {
        self.coverage.get(&library).into_iter().flatten().copied()
    }

    pub fn is_covered(&self, library: LibraryId, ip: usize) -> bool {
        self.coverage.get(&library).is_some_and(|set| set.contains(&ip))
    }

    pub fn clear_coverage(&mut self) {
        self.coverage.clear();
    }
}

impl Default for DebugState {
    fn default() -> Self {
        Self::new()
    }
}
