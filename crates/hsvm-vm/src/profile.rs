//! Per-function call statistics.

use std::collections::HashMap;
use std::time::Duration;

use crate::library::LibraryId;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FunctionProfile {
    pub calls: u64,
    pub total: Duration,
}

/// Call counts and accumulated wall time, recorded when a `Return` frame is popped.
#[derive(Clone, Debug, Default)]
pub struct ProfileData {
    functions: HashMap<(LibraryId, u32), FunctionProfile>,
}

impl ProfileData {
    pub fn record(&mut self, library: LibraryId, function: u32, elapsed: Duration) {
        let entry = self.functions.entry((library, function)).or_default();
        entry.calls += 1;
        entry.total += elapsed;
    }

    pub fn get(&self, library: LibraryId, function: u32) -> Option<&FunctionProfile> {
        self.functions.get(&(library, function))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(LibraryId, u32), &FunctionProfile)> {
        self.functions.iter()
    }

    pub fn clear(&mut self) {
        self.functions.clear();
    }
}
