//! The shared abort/yield signal.
//!
//! A scheduler (or any other thread) sets the signal; the dispatch loop polls it
//! at its checkpoints. Setting is a single atomic store and safe from any context.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Why the dispatch loop must stop.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum AbortReason {
    /// Give up the processor; execution continues later.
    Yield = 1,
    Timeout = 2,
    /// The client that requested the work went away.
    Disconnect = 3,
    ManualAbort = 4,
    /// Stop without reporting an error.
    SilentTerminate = 5,
}

impl AbortReason {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Yield),
            2 => Some(Self::Timeout),
            3 => Some(Self::Disconnect),
            4 => Some(Self::ManualAbort),
            5 => Some(Self::SilentTerminate),
            _ => None,
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Yield => "yield",
            Self::Timeout => "timeout",
            Self::Disconnect => "disconnect",
            Self::ManualAbort => "manual abort",
            Self::SilentTerminate => "silent terminate",
        };
        f.write_str(name)
    }
}

/// Cloneable handle to the group's abort flag.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal {
    flag: Arc<AtomicU8>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, reason: AbortReason) {
        self.flag.store(reason as u8, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.flag.store(0, Ordering::SeqCst);
    }

    /// Current reason, if the signal is set.
    pub fn get(&self) -> Option<AbortReason> {
        AbortReason::from_u8(self.flag.load(Ordering::SeqCst))
    }

    pub fn is_set(&self) -> bool {
        self.get().is_some()
    }
}
