//! Async stack traces.
//!
//! When work is scheduled to continue later (an async continuation or a
//! cross-VM call), the live call stack is captured as a segment linked to the
//! segment that was current when it was captured. Chains of continuations can
//! grow without bound, so every Nth segment links to its parent weakly: once
//! nothing else holds the older segments they are freed, and walking the chain
//! stops at the dead link.

use std::fmt;
use std::rc::{Rc, Weak};

use crate::library::LibraryId;

/// One captured call frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AsyncTraceEntry {
    pub library: LibraryId,
    pub function: u32,
    pub ip: usize,
}

impl fmt::Display for AsyncTraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.library, self.function, self.ip)
    }
}

#[derive(Debug)]
enum ParentLink {
    None,
    Strong(Rc<AsyncStackTrace>),
    Weak(Weak<AsyncStackTrace>),
}

/// A captured segment of an async call chain.
#[derive(Debug)]
pub struct AsyncStackTrace {
    entries: Vec<AsyncTraceEntry>,
    depth: u32,
    parent: ParentLink,
}

impl AsyncStackTrace {
    /// Capture a segment. Segments whose depth is a multiple of `weak_period`
    /// hold their parent weakly.
    pub fn new(entries: Vec<AsyncTraceEntry>, parent: Option<Rc<AsyncStackTrace>>, weak_period: u32) -> Rc<Self> {
        let (depth, parent) = match parent {
            None => (1, ParentLink::None),
            Some(parent) => {
                let depth = parent.depth + 1;
                if weak_period > 0 && depth % weak_period == 0 {
                    (depth, ParentLink::Weak(Rc::downgrade(&parent)))
                } else {
                    (depth, ParentLink::Strong(parent))
                }
            }
        };
        Rc::new(Self { entries, depth, parent })
    }

    /// Position of this segment in its chain, starting at 1.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Frames of this segment, innermost first.
    pub fn entries(&self) -> &[AsyncTraceEntry] {
        &self.entries
    }

    /// The parent segment, if it is still alive.
    pub fn parent(&self) -> Option<Rc<AsyncStackTrace>> {
        match &self.parent {
            ParentLink::None => None,
            ParentLink::Strong(parent) => Some(parent.clone()),
            ParentLink::Weak(parent) => parent.upgrade(),
        }
    }

    pub fn is_weakly_linked(&self) -> bool {
        matches!(self.parent, ParentLink::Weak(_))
    }

    /// This segment and its reachable ancestors, newest first.
    pub fn walk(self: &Rc<Self>) -> Vec<Rc<AsyncStackTrace>> {
        let mut segments = vec![self.clone()];
        let mut current = self.parent();
        while let Some(segment) = current {
            current = segment.parent();
            segments.push(segment);
        }
        segments
    }
}
