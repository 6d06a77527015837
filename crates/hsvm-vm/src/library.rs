//! Resolved libraries.
//!
//! A library is produced by the loader/linker (or by [`LibraryBuilder`]) and
//! is immutable once loaded. Its code is one buffer shared by all functions,
//! so instruction offsets are unique across the library and the unwind table
//! can be keyed by them.
//!
//! [`LibraryBuilder`]: crate::builder::LibraryBuilder

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use hsvm_core::{NameId, SourcePosition, VariableType};

use crate::error::VmError;

/// Identity of a loaded library within a VM group.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct LibraryId(pub u32);

impl fmt::Display for LibraryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Declared parameter of a function.
#[derive(Clone, Debug)]
pub struct ParamDef {
    pub name: String,
    pub ty: VariableType,
    /// Marshalled default value, if the parameter is optional.
    pub default: Option<Rc<[u8]>>,
}

/// Where a function's implementation lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FunctionBody {
    /// Bytecode starting at this offset.
    Code { entry: usize },
    /// Host function registered under this name.
    External(String),
}

/// A resolved function definition.
#[derive(Clone, Debug)]
pub struct FunctionDef {
    pub name: String,
    /// Parameters; for vararg functions the last one is the rest array.
    pub params: Vec<ParamDef>,
    pub return_type: VariableType,
    pub vararg: bool,
    /// Types of the local variables following the parameters.
    pub locals: Vec<VariableType>,
    /// Frames of this function never appear in exception traces.
    pub skip_trace: bool,
    /// The function body is a generator and its returns complete the generator.
    pub generator: bool,
    pub body: FunctionBody,
    /// Source positions keyed by instruction offset, sorted by offset.
    pub positions: Vec<(usize, SourcePosition)>,
}

impl FunctionDef {
    /// Parameters bound positionally (everything but the rest array).
    pub fn fixed_params(&self) -> &[ParamDef] {
        if self.vararg && !self.params.is_empty() {
            &self.params[..self.params.len() - 1]
        } else {
            &self.params
        }
    }

    /// Element type of the rest array of a vararg function.
    pub fn vararg_element(&self) -> Option<VariableType> {
        if !self.vararg {
            return None;
        }
        self.params
            .last()
            .and_then(|p| p.ty.element_type())
            .or(Some(VariableType::Variant))
    }

    /// Source position of the instruction at `offset`.
    pub fn position_at(&self, offset: usize) -> SourcePosition {
        match self.positions.partition_point(|(ip, _)| *ip <= offset) {
            0 => SourcePosition::unknown(),
            n => self.positions[n - 1].1,
        }
    }

    /// Human-readable signature, e.g. `FUNCTION ADD(INTEGER a, INTEGER b DEFAULTS ...) RETURNS INTEGER`.
    pub fn signature(&self) -> String {
        let kind = if self.return_type == VariableType::NoReturn {
            "MACRO"
        } else {
            "FUNCTION"
        };
        let mut out = format!("{} {}(", kind, self.name);
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(param.ty.name());
            out.push(' ');
            out.push_str(&param.name);
            if param.default.is_some() {
                out.push_str(" DEFAULTS ...");
            }
        }
        if self.vararg {
            out.push_str(" ...");
        }
        out.push(')');
        if self.return_type != VariableType::NoReturn {
            out.push_str(" RETURNS ");
            out.push_str(self.return_type.name());
        }
        out
    }
}

/// One catch range of the unwind table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnwindEntry {
    /// First covered instruction offset.
    pub start: usize,
    /// One past the last covered instruction offset.
    pub end: usize,
    /// Offset of the catch handler.
    pub target: usize,
    /// Operand stack size (relative to the frame base) when the handler starts.
    pub stack_size: usize,
}

/// Per-library mapping from faulting instruction offsets to catch handlers.
#[derive(Clone, Debug, Default)]
pub struct UnwindTable {
    entries: Vec<UnwindEntry>,
}

impl UnwindTable {
    pub fn new(mut entries: Vec<UnwindEntry>) -> Self {
        entries.sort_by_key(|e| (e.start, e.end));
        Self { entries }
    }

    /// Innermost catch range covering `offset`.
    pub fn find(&self, offset: usize) -> Option<&UnwindEntry> {
        self.entries
            .iter()
            .filter(|e| e.start <= offset && offset < e.end)
            .min_by_key(|e| e.end - e.start)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What a fragment member contributes to a vtable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FragmentMemberKind {
    Member(VariableType),
    /// Method implemented by a function of the fragment's library.
    Method(u32),
    Property {
        getter: Option<NameId>,
        setter: Option<NameId>,
    },
}

/// One member declaration of an object-definition fragment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentMember {
    pub name: NameId,
    pub private: bool,
    /// Redefines a member that already exists in the base type.
    pub update: bool,
    pub kind: FragmentMemberKind,
}

/// An object-definition fragment, the unit of runtime type extension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectFragment {
    pub name: String,
    /// Objects of this type reject dynamic member insertion and deletion.
    pub is_static: bool,
    pub members: Vec<FragmentMember>,
}

/// A loaded library.
#[derive(Debug)]
pub struct Library {
    pub id: LibraryId,
    pub name: String,
    /// Source file name used in exception traces.
    pub filename: String,
    pub code: Rc<[u8]>,
    pub functions: Vec<FunctionDef>,
    /// Marshalled constant pool.
    pub constants: Vec<Rc<[u8]>>,
    /// Names referenced by member/cell instructions.
    pub names: Vec<NameId>,
    pub fragments: Vec<Rc<ObjectFragment>>,
    pub unwind: UnwindTable,
    /// Function to run when the VM's call stack empties after a host call.
    pub deinit: Option<u32>,
}

impl Library {
    pub fn function(&self, index: u32) -> Result<&FunctionDef, VmError> {
        self.functions
            .get(index as usize)
            .ok_or_else(|| VmError::MissingFunction {
                library: self.name.clone(),
                function: index.to_string(),
            })
    }

    /// Find a function by name (case-insensitive).
    pub fn find_function(&self, name: &str) -> Option<u32> {
        self.functions
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name))
            .map(|i| i as u32)
    }

    pub fn name_id(&self, index: i32) -> Result<NameId, VmError> {
        self.names
            .get(index as usize)
            .copied()
            .ok_or(VmError::MissingName(index as u32))
    }

    pub fn constant(&self, index: i32) -> Result<&Rc<[u8]>, VmError> {
        self.constants
            .get(index as usize)
            .ok_or(VmError::MissingConstant(index as u32))
    }

    pub fn fragment(&self, index: i32) -> Result<&Rc<ObjectFragment>, VmError> {
        self.fragments
            .get(index as usize)
            .ok_or(VmError::MissingFragment(index as u32))
    }
}

/// Group-wide table of loaded libraries.
#[derive(Debug, Default)]
pub struct LibraryRegistry {
    libraries: Vec<Rc<Library>>,
    by_name: HashMap<String, LibraryId>,
}

impl LibraryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity the next added library will receive.
    pub fn next_id(&self) -> LibraryId {
        LibraryId(self.libraries.len() as u32)
    }

    pub fn add(&mut self, library: Library) -> Result<Rc<Library>, VmError> {
        let key = library.name.to_uppercase();
        if self.by_name.contains_key(&key) {
            return Err(VmError::DuplicateLibrary(library.name));
        }
        let library = Rc::new(library);
        self.by_name.insert(key, library.id);
        self.libraries.push(library.clone());
        Ok(library)
    }

    pub fn get(&self, id: LibraryId) -> Result<Rc<Library>, VmError> {
        self.libraries
            .get(id.0 as usize)
            .cloned()
            .ok_or_else(|| VmError::UnknownLibrary(id.to_string()))
    }

    pub fn by_name(&self, name: &str) -> Option<Rc<Library>> {
        let id = self.by_name.get(&name.to_uppercase())?;
        self.libraries.get(id.0 as usize).cloned()
    }

    /// Libraries in load order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Rc<Library>> {
        self.libraries.iter()
    }
}
