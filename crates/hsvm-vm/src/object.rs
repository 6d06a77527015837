//! Objects and runtime-composed object types.
//!
//! An object's type is an [`ObjectTypeDef`] composed by extending a base type
//! (possibly none) with object-definition fragments. Compositions are memoized
//! in the group's [`TypeCache`], so extending the same base with the same
//! fragment always yields the same `Rc` and type identity is pointer equality.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use hsvm_core::{ErrorCode, Interner, NameId, VariableType};
use indexmap::IndexMap;
use log::{debug, trace};

use crate::error::RuntimeError;
use crate::generator::GeneratorContext;
use crate::library::{FragmentMemberKind, FunctionDef, Library, LibraryId, ObjectFragment};
use crate::value::Value;

/// A method implementation.
#[derive(Clone)]
pub struct MethodRef {
    pub library: Rc<Library>,
    pub function: u32,
}

impl MethodRef {
    pub fn def(&self) -> Option<&FunctionDef> {
        self.library.functions.get(self.function as usize)
    }
}

impl fmt::Debug for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.library.name, self.function)
    }
}

/// What a vtable entry resolves to.
#[derive(Clone, Debug)]
pub enum EntryKind {
    Member(VariableType),
    Method(MethodRef),
    /// Redirects reads and writes to other entries.
    Property {
        getter: Option<NameId>,
        setter: Option<NameId>,
    },
}

#[derive(Clone, Debug)]
pub struct VTableEntry {
    pub name: NameId,
    pub private: bool,
    pub kind: EntryKind,
}

/// A composed object type.
#[derive(Debug)]
pub struct ObjectTypeDef {
    pub name: String,
    /// Contributing fragments, base first.
    pub fragments: Vec<Rc<ObjectFragment>>,
    pub entries: IndexMap<NameId, VTableEntry>,
    pub is_static: bool,
}

impl ObjectTypeDef {
    /// Type with plain public members, used for engine-provided objects.
    pub fn with_members(name: &str, members: &[(NameId, VariableType)], is_static: bool) -> Self {
        let entries = members
            .iter()
            .map(|&(name, ty)| {
                let entry = VTableEntry {
                    name,
                    private: false,
                    kind: EntryKind::Member(ty),
                };
                (name, entry)
            })
            .collect();
        Self {
            name: name.to_string(),
            fragments: Vec::new(),
            entries,
            is_static,
        }
    }

    pub fn entry(&self, name: NameId) -> Option<&VTableEntry> {
        self.entries.get(&name)
    }
}

/// Instance data of an object.
pub struct ObjectData {
    pub(crate) type_def: Option<Rc<ObjectTypeDef>>,
    /// Storage of vtable members and dynamically inserted members.
    pub(crate) members: IndexMap<NameId, Value>,
    /// Reserved context slot of generator objects.
    pub(crate) generator: Option<GeneratorContext>,
}

impl ObjectData {
    /// New instance with all typed members at their defaults.
    pub fn new(type_def: Option<Rc<ObjectTypeDef>>) -> Self {
        let mut data = Self {
            type_def: None,
            members: IndexMap::new(),
            generator: None,
        };
        data.set_type(type_def);
        data
    }

    /// Switch to a (usually extended) type, adding storage for new members.
    pub(crate) fn set_type(&mut self, type_def: Option<Rc<ObjectTypeDef>>) {
        if let Some(def) = &type_def {
            for entry in def.entries.values() {
                if let EntryKind::Member(ty) = entry.kind {
                    self.members
                        .entry(entry.name)
                        .or_insert_with(|| Value::default_for(ty));
                }
            }
        }
        self.type_def = type_def;
    }

    pub fn type_def(&self) -> Option<&Rc<ObjectTypeDef>> {
        self.type_def.as_ref()
    }

    pub fn type_name(&self) -> &str {
        self.type_def.as_ref().map_or("OBJECT", |t| t.name.as_str())
    }

    /// Raw member storage, bypassing the vtable.
    pub fn member(&self, name: NameId) -> Option<&Value> {
        self.members.get(&name)
    }

    pub(crate) fn member_mut(&mut self, name: NameId) -> Option<&mut Value> {
        self.members.get_mut(&name)
    }

    pub fn is_generator(&self) -> bool {
        self.generator.is_some()
    }
}

impl fmt::Debug for ObjectData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectData")
            .field("type", &self.type_name())
            .field("members", &self.members.len())
            .field("generator", &self.generator.is_some())
            .finish()
    }
}

/// Memo of type compositions, keyed by (base type identity, fragment identity).
#[derive(Debug, Default)]
pub struct TypeCache {
    types: HashMap<(usize, LibraryId, u32), Rc<ObjectTypeDef>>,
}

impl TypeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compose `base` with a fragment of `library`, reusing an earlier composition.
    pub fn extend(
        &mut self,
        base: Option<&Rc<ObjectTypeDef>>,
        library: &Rc<Library>,
        fragment: u32,
        interner: &Interner,
    ) -> Result<Rc<ObjectTypeDef>, RuntimeError> {
        // Every type reachable as a base is owned by this cache, so its address
        // stays unique for as long as the key exists.
        let base_key = base.map_or(0, |b| Rc::as_ptr(b) as usize);
        let key = (base_key, library.id, fragment);
        if let Some(existing) = self.types.get(&key) {
            trace!("type cache hit for fragment {} of {}", fragment, library.name);
            return Ok(existing.clone());
        }

        let Some(frag) = library.fragments.get(fragment as usize) else {
            return Err(RuntimeError::new(
                ErrorCode::MemberNotFound,
                [format!("fragment {}", fragment)],
            ));
        };
        let composed = Rc::new(compose(base, library, frag, interner)?);
        debug!(
            "extended type {} with fragment {} ({} entries)",
            base.map_or("<none>", |b| b.name.as_str()),
            composed.name,
            composed.entries.len()
        );
        self.types.insert(key, composed.clone());
        Ok(composed)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }
}

fn compose(
    base: Option<&Rc<ObjectTypeDef>>,
    library: &Rc<Library>,
    fragment: &Rc<ObjectFragment>,
    interner: &Interner,
) -> Result<ObjectTypeDef, RuntimeError> {
    let mut entries = base.map(|b| b.entries.clone()).unwrap_or_default();
    let mut fragments = base.map(|b| b.fragments.clone()).unwrap_or_default();
    fragments.push(fragment.clone());

    for member in &fragment.members {
        let kind = match &member.kind {
            FragmentMemberKind::Member(ty) => EntryKind::Member(*ty),
            FragmentMemberKind::Method(function) => EntryKind::Method(MethodRef {
                library: library.clone(),
                function: *function,
            }),
            FragmentMemberKind::Property { getter, setter } => EntryKind::Property {
                getter: *getter,
                setter: *setter,
            },
        };
        let entry = VTableEntry {
            name: member.name,
            private: member.private,
            kind,
        };
        let name = interner.resolve(member.name);

        match entries.get(&member.name) {
            None if member.update => {
                return Err(RuntimeError::new(ErrorCode::NoMemberToUpdate, [name]));
            }
            None => {}
            Some(_) if !member.update => {
                return Err(RuntimeError::new(ErrorCode::MemberAlreadyExists, [name]));
            }
            Some(old) => {
                if let Err(reason) = check_override(old, &entry) {
                    return Err(RuntimeError::new(
                        ErrorCode::IncompatibleOverride,
                        [name.to_string(), reason],
                    ));
                }
            }
        }
        entries.insert(member.name, entry);
    }

    for entry in entries.values() {
        if let EntryKind::Property { getter, setter } = &entry.kind {
            for target in [getter, setter].into_iter().flatten() {
                let valid = matches!(
                    entries.get(target).map(|e| &e.kind),
                    Some(EntryKind::Member(_)) | Some(EntryKind::Method(_))
                );
                if !valid {
                    return Err(RuntimeError::new(
                        ErrorCode::PropertyTargetMissing,
                        [interner.resolve(entry.name), interner.resolve(*target)],
                    ));
                }
            }
        }
    }

    Ok(ObjectTypeDef {
        name: fragment.name.clone(),
        fragments,
        entries,
        is_static: fragment.is_static || base.is_some_and(|b| b.is_static),
    })
}

/// An override must be usable everywhere the original was.
fn check_override(old: &VTableEntry, new: &VTableEntry) -> Result<(), String> {
    match (&old.kind, &new.kind) {
        (EntryKind::Member(a), EntryKind::Member(b)) => {
            if a != b {
                return Err(format!("member type changes from {} to {}", a, b));
            }
            Ok(())
        }
        (EntryKind::Property { .. }, EntryKind::Property { .. }) => Ok(()),
        (EntryKind::Method(a), EntryKind::Method(b)) => {
            let (Some(old_def), Some(new_def)) = (a.def(), b.def()) else {
                return Err("method implementation is missing".to_string());
            };
            check_method_override(old_def, new_def)
        }
        _ => Err("the kind of member changes".to_string()),
    }
}

fn check_method_override(old: &FunctionDef, new: &FunctionDef) -> Result<(), String> {
    if old.return_type != new.return_type {
        return Err(format!(
            "return type changes from {} to {}",
            old.return_type, new.return_type
        ));
    }
    if old.vararg != new.vararg {
        return Err("vararg declaration differs".to_string());
    }
    if new.params.len() < old.params.len() {
        return Err(format!(
            "parameter count drops from {} to {}",
            old.params.len(),
            new.params.len()
        ));
    }
    for (i, (o, n)) in old.params.iter().zip(&new.params).enumerate() {
        if o.ty != n.ty {
            return Err(format!("parameter {} changes type from {} to {}", i + 1, o.ty, n.ty));
        }
        if o.default.is_some() && n.default.is_none() {
            return Err(format!("parameter {} loses its default", i + 1));
        }
    }
    if let Some(i) = (old.params.len()..new.params.len()).find(|&i| new.params[i].default.is_none()) {
        return Err(format!("added parameter {} has no default", i + 1));
    }
    Ok(())
}
