//! Execution state and call frames.
//!
//! Every call-like control transfer is an explicit frame on the call stack, so
//! the only native recursion of the dispatch loop is the host's call into it.
//! The frame kind decides what happens when the frame is popped.

use std::fmt;
use std::rc::Rc;
use std::time::Instant;

use crate::error::{Trap, VmError};
use crate::group::VmId;
use crate::library::Library;
use crate::machine::Vm;

/// Position of the dispatch loop.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InstructionPointer {
    /// Fetch the instruction at this offset of the current library's code.
    Code(usize),
    /// No instruction to run; the loop must pop a frame first.
    AwaitingFramePop,
}

/// The currently active position.
#[derive(Clone, Debug)]
pub struct ExecutionState {
    pub library: Option<Rc<Library>>,
    pub function: u32,
    pub ip: InstructionPointer,
}

impl ExecutionState {
    /// State of a VM that is not running anything.
    pub fn idle() -> Self {
        Self {
            library: None,
            function: 0,
            ip: InstructionPointer::AwaitingFramePop,
        }
    }

    /// Offset of the running code, if there is one.
    pub fn code_offset(&self) -> Option<usize> {
        match (&self.library, self.ip) {
            (Some(_), InstructionPointer::Code(ip)) => Some(ip),
            _ => None,
        }
    }
}

/// Deferred call run when its frame is popped, with the current unwind status.
pub type TailCallback = Box<dyn FnOnce(&mut Vm, bool) -> Result<(), Trap>>;

/// What popping a frame does.
pub enum FrameKind {
    /// A language-level call.
    Return,
    /// Boundary the dispatch loop never runs past.
    StopExecute,
    /// Control moves to another VM of the group.
    SwitchToOtherVm(VmId),
    /// A cross-VM call finished; control returns to the calling VM.
    ReturnToOtherVm { target: VmId, returns_value: bool },
    /// Placeholder that only restores state.
    Dummy,
    /// Restores state and discards one operand.
    PopVariable,
    /// Restores state, then runs the callback.
    TailCall(TailCallback),
}

impl FrameKind {
    pub fn name(&self) -> &'static str {
        match self {
            FrameKind::Return => "Return",
            FrameKind::StopExecute => "StopExecute",
            FrameKind::SwitchToOtherVm(_) => "SwitchToOtherVm",
            FrameKind::ReturnToOtherVm { .. } => "ReturnToOtherVm",
            FrameKind::Dummy => "Dummy",
            FrameKind::PopVariable => "PopVariable",
            FrameKind::TailCall(_) => "TailCall",
        }
    }
}

impl fmt::Debug for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::SwitchToOtherVm(id) => write!(f, "SwitchToOtherVm({})", id),
            FrameKind::ReturnToOtherVm { target, .. } => write!(f, "ReturnToOtherVm({})", target),
            other => f.write_str(other.name()),
        }
    }
}

/// Snapshot of the execution state taken when a frame is pushed.
#[derive(Debug)]
pub struct CallStackElement {
    pub kind: FrameKind,
    pub state: ExecutionState,
    pub base: usize,
    /// Set for `Return` frames when profiling is enabled.
    pub entered: Option<Instant>,
}

/// Result of popping a frame, as seen by the dispatch loop.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameAction {
    Continue,
    Stop,
    SwitchVm(VmId),
}

/// Bounded stack of call frames.
#[derive(Debug)]
pub struct CallStack {
    frames: Vec<CallStackElement>,
    max_depth: usize,
}

impl CallStack {
    pub fn new(max_depth: usize) -> Self {
        Self {
            frames: Vec::new(),
            max_depth,
        }
    }

    pub fn push(&mut self, element: CallStackElement) -> Result<(), VmError> {
        if self.frames.len() >= self.max_depth {
            return Err(VmError::CallDepthExceeded(self.max_depth));
        }
        self.frames.push(element);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<CallStackElement> {
        self.frames.pop()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames from the innermost outwards.
    pub fn iter_innermost(&self) -> impl Iterator<Item = &CallStackElement> {
        self.frames.iter().rev()
    }
}
