//! Programmatic library construction.
//!
//! Hosts and tests assemble libraries here instead of going through the
//! compiler and linker. Names and constants are resolved against the group's
//! interner when the library is loaded.

use std::collections::HashMap;
use std::rc::Rc;

use hsvm_core::{Interner, SourcePosition, VariableType};

use crate::bytecode::{FLAG_VIA_THIS, Opcode, write_i32};
use crate::error::VmError;
use crate::generator::ResumeKind;
use crate::library::{
    FragmentMember, FragmentMemberKind, FunctionBody, FunctionDef, Library, LibraryId, ObjectFragment,
    ParamDef, UnwindEntry, UnwindTable,
};
use crate::marshal::marshal;
use crate::value::Value;

/// Declaration of a function.
#[derive(Clone, Debug)]
pub struct FunctionSpec {
    name: String,
    params: Vec<(String, VariableType, Option<Value>)>,
    return_type: VariableType,
    vararg: bool,
    locals: Vec<VariableType>,
    skip_trace: bool,
    generator: bool,
}

impl FunctionSpec {
    /// A function without parameters that returns nothing.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            params: Vec::new(),
            return_type: VariableType::NoReturn,
            vararg: false,
            locals: Vec::new(),
            skip_trace: false,
            generator: false,
        }
    }

    pub fn param(mut self, name: &str, ty: VariableType) -> Self {
        self.params.push((name.to_string(), ty, None));
        self
    }

    pub fn param_default(mut self, name: &str, ty: VariableType, default: Value) -> Self {
        self.params.push((name.to_string(), ty, Some(default)));
        self
    }

    /// Collect surplus arguments into a trailing array parameter.
    pub fn vararg(mut self, name: &str, array_type: VariableType) -> Self {
        self.params.push((name.to_string(), array_type, None));
        self.vararg = true;
        self
    }

    pub fn returns(mut self, ty: VariableType) -> Self {
        self.return_type = ty;
        self
    }

    /// Local variables following the parameters, initialized to their defaults.
    pub fn locals(mut self, types: &[VariableType]) -> Self {
        self.locals.extend_from_slice(types);
        self
    }

    pub fn skip_trace(mut self) -> Self {
        self.skip_trace = true;
        self
    }

    pub fn generator(mut self) -> Self {
        self.generator = true;
        self
    }
}

#[derive(Clone, Debug)]
enum MemberSpecKind {
    Member(VariableType),
    Method(u32),
    Property(Option<String>, Option<String>),
}

#[derive(Clone, Debug)]
struct MemberSpec {
    name: String,
    private: bool,
    update: bool,
    kind: MemberSpecKind,
}

/// Declaration of an object-definition fragment.
#[derive(Clone, Debug)]
pub struct FragmentSpec {
    name: String,
    is_static: bool,
    members: Vec<MemberSpec>,
}

impl FragmentSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_static: false,
            members: Vec::new(),
        }
    }

    pub fn static_type(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn member(self, name: &str, ty: VariableType) -> Self {
        self.with(name, MemberSpecKind::Member(ty))
    }

    /// Method implemented by a function of the same library. The function
    /// receives the object as its first argument.
    pub fn method(self, name: &str, function: u32) -> Self {
        self.with(name, MemberSpecKind::Method(function))
    }

    pub fn property(self, name: &str, getter: Option<&str>, setter: Option<&str>) -> Self {
        self.with(
            name,
            MemberSpecKind::Property(getter.map(str::to_string), setter.map(str::to_string)),
        )
    }

    /// Mark the last added member private.
    pub fn private(mut self) -> Self {
        if let Some(member) = self.members.last_mut() {
            member.private = true;
        }
        self
    }

    /// Mark the last added member as an update of an inherited one.
    pub fn update(mut self) -> Self {
        if let Some(member) = self.members.last_mut() {
            member.update = true;
        }
        self
    }

    fn with(mut self, name: &str, kind: MemberSpecKind) -> Self {
        self.members.push(MemberSpec {
            name: name.to_string(),
            private: false,
            update: false,
            kind,
        });
        self
    }
}

#[derive(Debug)]
enum PendingBody {
    Code(usize),
    External(String),
}

#[derive(Debug)]
struct PendingFunction {
    spec: FunctionSpec,
    body: Option<PendingBody>,
    positions: Vec<(usize, SourcePosition)>,
}

/// Assembles a library.
#[derive(Debug)]
pub struct LibraryBuilder {
    name: String,
    filename: String,
    code: Vec<u8>,
    functions: Vec<PendingFunction>,
    constants: Vec<Value>,
    names: Vec<String>,
    name_index: HashMap<String, i32>,
    fragments: Vec<FragmentSpec>,
    unwind: Vec<UnwindEntry>,
    deinit: Option<u32>,
    errors: Vec<String>,
}

impl LibraryBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            filename: format!("{}.whlib", name),
            code: Vec::new(),
            functions: Vec::new(),
            constants: Vec::new(),
            names: Vec::new(),
            name_index: HashMap::new(),
            fragments: Vec::new(),
            unwind: Vec::new(),
            deinit: None,
            errors: Vec::new(),
        }
    }

    pub fn filename(mut self, filename: &str) -> Self {
        self.filename = filename.to_string();
        self
    }

    /// Declare a function so it can be referenced before its body is defined.
    pub fn declare(&mut self, spec: FunctionSpec) -> u32 {
        self.functions.push(PendingFunction {
            spec,
            body: None,
            positions: Vec::new(),
        });
        (self.functions.len() - 1) as u32
    }

    /// Emit the body of a declared function.
    pub fn define<F>(&mut self, function: u32, body: F)
    where
        F: FnOnce(&mut CodeBuilder<'_>),
    {
        if self.functions.get(function as usize).is_none() {
            self.errors.push(format!("function {} is not declared", function));
            return;
        }
        let entry = self.code.len();
        let mut code = CodeBuilder {
            code: &mut self.code,
            constants: &mut self.constants,
            names: &mut self.names,
            name_index: &mut self.name_index,
            unwind: &mut self.unwind,
            positions: Vec::new(),
            labels: Vec::new(),
            patches: Vec::new(),
            catches: Vec::new(),
        };
        body(&mut code);
        let positions = match code.resolve() {
            Ok(positions) => positions,
            Err(reason) => {
                self.errors.push(reason);
                Vec::new()
            }
        };
        if let Some(pending) = self.functions.get_mut(function as usize) {
            pending.body = Some(PendingBody::Code(entry));
            pending.positions = positions;
        }
    }

    /// Declare and define a bytecode function.
    pub fn function<F>(&mut self, spec: FunctionSpec, body: F) -> u32
    where
        F: FnOnce(&mut CodeBuilder<'_>),
    {
        let index = self.declare(spec);
        self.define(index, body);
        index
    }

    /// A function implemented by the builtin registered as `builtin`.
    pub fn external(&mut self, spec: FunctionSpec, builtin: &str) -> u32 {
        let index = self.declare(spec);
        if let Some(pending) = self.functions.get_mut(index as usize) {
            pending.body = Some(PendingBody::External(builtin.to_string()));
        }
        index
    }

    pub fn constant(&mut self, value: Value) -> i32 {
        self.constants.push(value);
        (self.constants.len() - 1) as i32
    }

    pub fn name(&mut self, name: &str) -> i32 {
        name_slot(&mut self.names, &mut self.name_index, name)
    }

    pub fn fragment(&mut self, fragment: FragmentSpec) -> i32 {
        self.fragments.push(fragment);
        (self.fragments.len() - 1) as i32
    }

    /// Function run when the VM finishes its work.
    pub fn deinit(&mut self, function: u32) {
        self.deinit = Some(function);
    }

    /// Resolve names and constants and produce the loadable library.
    pub fn finish(self, id: LibraryId, interner: &mut Interner) -> Result<Library, VmError> {
        let invalid = |reason: String| VmError::InvalidLibrary {
            library: self.name.clone(),
            reason,
        };
        if let Some(reason) = self.errors.first() {
            return Err(invalid(reason.clone()));
        }

        let constants = self
            .constants
            .iter()
            .map(|value| marshal(value, interner).map(Rc::from))
            .collect::<Result<Vec<Rc<[u8]>>, _>>()?;

        let mut functions = Vec::with_capacity(self.functions.len());
        for pending in &self.functions {
            let spec = &pending.spec;
            let body = match &pending.body {
                Some(PendingBody::Code(entry)) => FunctionBody::Code { entry: *entry },
                Some(PendingBody::External(name)) => FunctionBody::External(name.clone()),
                None => {
                    return Err(VmError::MissingFunction {
                        library: self.name.clone(),
                        function: spec.name.clone(),
                    });
                }
            };
            let mut params = Vec::with_capacity(spec.params.len());
            for (name, ty, default) in &spec.params {
                let default = match default {
                    Some(value) => Some(Rc::from(marshal(value, interner)?)),
                    None => None,
                };
                params.push(ParamDef {
                    name: name.clone(),
                    ty: *ty,
                    default,
                });
            }
            functions.push(FunctionDef {
                name: spec.name.clone(),
                params,
                return_type: spec.return_type,
                vararg: spec.vararg,
                locals: spec.locals.clone(),
                skip_trace: spec.skip_trace,
                generator: spec.generator,
                body,
                positions: pending.positions.clone(),
            });
        }

        let names = self.names.iter().map(|n| interner.intern(n)).collect();

        let mut fragments = Vec::with_capacity(self.fragments.len());
        for fragment in &self.fragments {
            let mut members = Vec::with_capacity(fragment.members.len());
            for member in &fragment.members {
                let kind = match &member.kind {
                    MemberSpecKind::Member(ty) => FragmentMemberKind::Member(*ty),
                    MemberSpecKind::Method(function) => {
                        if *function as usize >= functions.len() {
                            return Err(invalid(format!(
                                "method {} refers to missing function {}",
                                member.name, function
                            )));
                        }
                        FragmentMemberKind::Method(*function)
                    }
                    MemberSpecKind::Property(getter, setter) => FragmentMemberKind::Property {
                        getter: getter.as_deref().map(|n| interner.intern(n)),
                        setter: setter.as_deref().map(|n| interner.intern(n)),
                    },
                };
                members.push(FragmentMember {
                    name: interner.intern(&member.name),
                    private: member.private,
                    update: member.update,
                    kind,
                });
            }
            fragments.push(Rc::new(ObjectFragment {
                name: fragment.name.clone(),
                is_static: fragment.is_static,
                members,
            }));
        }

        Ok(Library {
            id,
            name: self.name.clone(),
            filename: self.filename.clone(),
            code: Rc::from(self.code.as_slice()),
            functions,
            constants,
            names,
            fragments,
            unwind: UnwindTable::new(self.unwind.clone()),
            deinit: self.deinit,
        })
    }
}

fn name_slot(names: &mut Vec<String>, index: &mut HashMap<String, i32>, name: &str) -> i32 {
    let key = name.to_uppercase();
    if let Some(&slot) = index.get(&key) {
        return slot;
    }
    names.push(name.to_string());
    let slot = (names.len() - 1) as i32;
    index.insert(key, slot);
    slot
}

/// Jump target inside a function body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label(usize);

/// Emits the code of one function.
pub struct CodeBuilder<'a> {
    code: &'a mut Vec<u8>,
    constants: &'a mut Vec<Value>,
    names: &'a mut Vec<String>,
    name_index: &'a mut HashMap<String, i32>,
    unwind: &'a mut Vec<UnwindEntry>,
    positions: Vec<(usize, SourcePosition)>,
    labels: Vec<Option<usize>>,
    /// Offsets of jump immediates and the labels they target.
    patches: Vec<(usize, Label)>,
    catches: Vec<(Label, Label, Label, usize)>,
}

impl CodeBuilder<'_> {
    /// Emit an instruction with its immediates.
    pub fn emit(&mut self, op: Opcode, args: &[i32]) -> &mut Self {
        self.code.push(op.as_byte());
        for &arg in args {
            write_i32(arg, self.code);
        }
        self
    }

    /// Emit an instruction without immediates.
    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.emit(op, &[])
    }

    /// Offset of the next instruction.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Source position of the following instructions.
    pub fn position(&mut self, line: u32, column: u32) -> &mut Self {
        self.positions.push((self.code.len(), SourcePosition::new(line, column)));
        self
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Place a label at the current offset.
    pub fn bind(&mut self, label: Label) -> &mut Self {
        if let Some(slot) = self.labels.get_mut(label.0) {
            *slot = Some(self.code.len());
        }
        self
    }

    pub fn jump(&mut self, op: Opcode, target: Label) -> &mut Self {
        self.code.push(op.as_byte());
        self.patches.push((self.code.len(), target));
        write_i32(0, self.code);
        self
    }

    /// Protect `[start, end)` with a handler. The handler starts with the
    /// exception on top of `stack_size` operands above the frame base.
    pub fn try_catch(&mut self, start: Label, end: Label, handler: Label, stack_size: usize) -> &mut Self {
        self.catches.push((start, end, handler, stack_size));
        self
    }

    pub fn load_int(&mut self, value: i32) -> &mut Self {
        self.emit(Opcode::LoadI, &[value])
    }

    pub fn load_bool(&mut self, value: bool) -> &mut Self {
        self.emit(Opcode::LoadB, &[i32::from(value)])
    }

    /// Add a constant to the pool and load it.
    pub fn load_const(&mut self, value: Value) -> &mut Self {
        self.constants.push(value);
        let index = (self.constants.len() - 1) as i32;
        self.emit(Opcode::LoadC, &[index])
    }

    pub fn load_local(&mut self, slot: i32) -> &mut Self {
        self.emit(Opcode::LoadS, &[slot])
    }

    pub fn store_local(&mut self, slot: i32) -> &mut Self {
        self.emit(Opcode::StoreS, &[slot])
    }

    pub fn call(&mut self, function: u32, args: i32) -> &mut Self {
        self.emit(Opcode::Call, &[function as i32, args])
    }

    pub fn ret(&mut self) -> &mut Self {
        self.op(Opcode::Return)
    }

    fn name(&mut self, name: &str) -> i32 {
        name_slot(self.names, self.name_index, name)
    }

    pub fn discard(&mut self) -> &mut Self {
        self.op(Opcode::Drop)
    }

    pub fn record_new(&mut self) -> &mut Self {
        self.op(Opcode::RecordNew)
    }

    pub fn record_set(&mut self, cell: &str) -> &mut Self {
        let name = self.name(cell);
        self.emit(Opcode::RecordSet, &[name])
    }

    pub fn record_get(&mut self, cell: &str) -> &mut Self {
        let name = self.name(cell);
        self.emit(Opcode::RecordGet, &[name])
    }

    pub fn array_new(&mut self, element: VariableType, count: i32) -> &mut Self {
        self.emit(Opcode::ArrayNew, &[i32::from(element.as_byte()), count])
    }

    /// Empty dynamic object.
    pub fn obj_new(&mut self) -> &mut Self {
        self.op(Opcode::ObjNew)
    }

    pub fn obj_new_typed(&mut self, fragment: i32) -> &mut Self {
        self.emit(Opcode::ObjNewTyped, &[fragment])
    }

    pub fn obj_extend(&mut self, fragment: i32) -> &mut Self {
        self.emit(Opcode::ObjExtend, &[fragment])
    }

    pub fn obj_get(&mut self, member: &str) -> &mut Self {
        let name = self.name(member);
        self.emit(Opcode::ObjGet, &[name, 0])
    }

    /// Member read through `this`, which may see private members.
    pub fn this_get(&mut self, member: &str) -> &mut Self {
        let name = self.name(member);
        self.emit(Opcode::ObjGet, &[name, FLAG_VIA_THIS])
    }

    pub fn obj_set(&mut self, member: &str) -> &mut Self {
        let name = self.name(member);
        self.emit(Opcode::ObjSet, &[name, 0])
    }

    pub fn this_set(&mut self, member: &str) -> &mut Self {
        let name = self.name(member);
        self.emit(Opcode::ObjSet, &[name, FLAG_VIA_THIS])
    }

    pub fn obj_insert(&mut self, member: &str) -> &mut Self {
        let name = self.name(member);
        self.emit(Opcode::ObjInsert, &[name, 0])
    }

    pub fn obj_delete(&mut self, member: &str) -> &mut Self {
        let name = self.name(member);
        self.emit(Opcode::ObjDelete, &[name, 0])
    }

    pub fn obj_call(&mut self, member: &str, args: i32) -> &mut Self {
        let name = self.name(member);
        self.emit(Opcode::ObjCall, &[name, args, 0])
    }

    pub fn this_call(&mut self, member: &str, args: i32) -> &mut Self {
        let name = self.name(member);
        self.emit(Opcode::ObjCall, &[name, args, FLAG_VIA_THIS])
    }

    pub fn make_fptr(&mut self, function: u32) -> &mut Self {
        self.emit(Opcode::MakeFptr, &[function as i32])
    }

    pub fn invoke_fptr(&mut self, args: i32) -> &mut Self {
        self.emit(Opcode::InvokeFptr, &[args])
    }

    /// Rebind the function pointer below the rebind tables on the stack.
    pub fn rebind_fptr(&mut self) -> &mut Self {
        self.op(Opcode::RebindFptr)
    }

    pub fn async_mark(&mut self) -> &mut Self {
        self.op(Opcode::AsyncMark)
    }

    pub fn throw(&mut self) -> &mut Self {
        self.op(Opcode::Throw)
    }

    pub fn rethrow(&mut self) -> &mut Self {
        self.op(Opcode::Rethrow)
    }

    pub fn gen_init(&mut self, slot: i32) -> &mut Self {
        self.emit(Opcode::GenInit, &[slot, 0])
    }

    /// Initialize a generator that treats its first resume like a resume after a yield.
    pub fn gen_init_suspended(&mut self, slot: i32) -> &mut Self {
        self.emit(Opcode::GenInit, &[slot, 1])
    }

    pub fn gen_yield(&mut self, slot: i32) -> &mut Self {
        self.emit(Opcode::GenYield, &[slot])
    }

    pub fn gen_resume(&mut self, kind: ResumeKind) -> &mut Self {
        let raw = match kind {
            ResumeKind::Next => 0,
            ResumeKind::Throw => 1,
            ResumeKind::Return => 2,
        };
        self.emit(Opcode::GenResume, &[raw])
    }

    fn target(&self, label: Label) -> Result<usize, String> {
        self.labels
            .get(label.0)
            .copied()
            .flatten()
            .ok_or_else(|| format!("label {} is never bound", label.0))
    }

    /// Patch jumps and register catch ranges.
    fn resolve(self) -> Result<Vec<(usize, SourcePosition)>, String> {
        for &(at, label) in &self.patches {
            let target = self.target(label)?;
            self.code[at..at + 4].copy_from_slice(&(target as i32).to_le_bytes());
        }
        for &(start, end, handler, stack_size) in &self.catches {
            self.unwind.push(UnwindEntry {
                start: self.target(start)?,
                end: self.target(end)?,
                target: self.target(handler)?,
                stack_size,
            });
        }
        Ok(self.positions)
    }
}
