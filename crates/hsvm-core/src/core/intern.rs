use std::collections::HashMap;

/// An interned member or cell name.
///
/// Names in the managed language are case-insensitive; the interner stores the
/// upper-cased spelling, so `foo` and `FOO` map to the same id.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NameId(u32);

impl NameId {
    /// Create a name id from a raw u32 value.
    ///
    /// Only meaningful for ids previously produced by the same interner.
    pub fn from_raw(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// Case-insensitive string interner for member and cell names.
#[derive(Clone, Debug, Default)]
pub struct Interner {
    to_name: HashMap<String, NameId>,
    to_string: Vec<String>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a name, returning its id.
    pub fn intern(&mut self, s: &str) -> NameId {
        let canonical = s.to_uppercase();
        if let Some(&name) = self.to_name.get(&canonical) {
            return name;
        }

        let name = NameId(self.to_string.len() as u32);
        self.to_string.push(canonical.clone());
        self.to_name.insert(canonical, name);
        name
    }

    /// Look up a name without interning it.
    pub fn get(&self, s: &str) -> Option<NameId> {
        self.to_name.get(&s.to_uppercase()).copied()
    }

    /// Resolve a name id to its canonical (upper-case) spelling.
    pub fn resolve(&self, name: NameId) -> &str {
        &self.to_string[name.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.to_string.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_string.is_empty()
    }
}
