//! Object member access.
//!
//! Names resolve through the object's vtable first, then its dynamically
//! inserted members, then the catch-all member `^` of its type. Properties
//! redirect to another vtable entry: a plain member is accessed directly, a
//! method is called as getter or setter.

use std::rc::Rc;

use hsvm_core::{ErrorCode, NameId, VariableType};
use log::trace;

use crate::error::{RuntimeError, Trap, VmError};
use crate::frame::{FrameKind, InstructionPointer};
use crate::funcptr::expect_function_ptr;
use crate::machine::{SyncCall, Vm};
use crate::object::{EntryKind, MethodRef, VTableEntry};
use crate::stack::Args;
use crate::value::{ObjectRef, Value};

/// Prefix of names that are never routed to the catch-all member and may be
/// inserted into static objects.
const DYNAMIC_PREFIX: char = '^';

enum Lookup {
    Entry(VTableEntry),
    Dynamic,
    /// The catch-all entry, to be called with the requested name.
    CatchAll(VTableEntry),
}

fn member_error(code: ErrorCode, name: &str) -> Trap {
    RuntimeError::new(code, [name]).into()
}

impl Vm {
    fn object_ref(&self, object: &Value, name: NameId) -> Result<ObjectRef, Trap> {
        match object {
            Value::Object(Some(obj)) => Ok(obj.clone()),
            Value::Object(None) => Err(member_error(ErrorCode::MemberNotFound, &self.shared.name(name))),
            other => Err(member_error(ErrorCode::NotAnObject, other.variable_type().name())),
        }
    }

    fn lookup(&self, obj: &ObjectRef, name: NameId, via_this: bool) -> Result<Lookup, Trap> {
        let data = obj.borrow();
        if let Some(entry) = data.type_def().and_then(|t| t.entry(name)) {
            if entry.private && !via_this {
                return Err(member_error(ErrorCode::PrivateMemberAccess, &self.shared.name(name)));
            }
            return Ok(Lookup::Entry(entry.clone()));
        }
        if data.member(name).is_some() {
            return Ok(Lookup::Dynamic);
        }
        let spelled = self.shared.name(name);
        if !spelled.starts_with(DYNAMIC_PREFIX)
            && let Some(entry) = data.type_def().and_then(|t| t.entry(self.shared.names.catch_all))
            && !matches!(entry.kind, EntryKind::Member(_))
        {
            return Ok(Lookup::CatchAll(entry.clone()));
        }
        Err(member_error(ErrorCode::MemberNotFound, &spelled))
    }

    fn method_target(&self, obj: &ObjectRef, target: NameId) -> Result<EntryKind, Trap> {
        obj.borrow()
            .type_def()
            .and_then(|t| t.entry(target))
            .map(|e| e.kind.clone())
            .ok_or_else(|| member_error(ErrorCode::MemberNotFound, &self.shared.name(target)))
    }

    /// A property may only redirect to a member or a method.
    fn property_target_missing(&self, property: NameId, target: NameId) -> Trap {
        RuntimeError::new(
            ErrorCode::PropertyTargetMissing,
            [self.shared.name(property), self.shared.name(target)],
        )
        .into()
    }

    fn stored(&self, obj: &ObjectRef, name: NameId) -> Value {
        obj.borrow()
            .member(name)
            .cloned()
            .unwrap_or(Value::Object(None))
    }

    fn store(&self, obj: &ObjectRef, name: NameId, value: Value) {
        obj.borrow_mut().members.insert(name, value);
    }

    /// Leading arguments of accessor methods: the object, plus the requested
    /// name when reached through the catch-all member.
    fn accessor_args(&self, obj: &ObjectRef, name: NameId, catch_all: bool) -> Args {
        let mut args = Args::new();
        args.push(Value::Object(Some(obj.clone())));
        if catch_all {
            args.push(Value::string(&self.shared.name(name)));
        }
        args
    }

    /// Start reading a member; its value ends up on the stack, possibly after
    /// a getter call finishes.
    pub(crate) fn push_member(&mut self, object: &Value, name: NameId, via_this: bool) -> Result<(), Trap> {
        let obj = self.object_ref(object, name)?;
        let (entry, catch_all) = match self.lookup(&obj, name, via_this)? {
            Lookup::Dynamic => {
                let value = self.stored(&obj, name);
                self.stack.push(value)?;
                return Ok(());
            }
            Lookup::Entry(entry) => (entry, false),
            Lookup::CatchAll(entry) => (entry, true),
        };
        match entry.kind {
            EntryKind::Member(_) => {
                let value = self.stored(&obj, name);
                self.stack.push(value)?;
                Ok(())
            }
            EntryKind::Method(_) => Err(member_error(ErrorCode::MethodNotValue, &self.shared.name(entry.name))),
            EntryKind::Property { getter: None, .. } => {
                Err(member_error(ErrorCode::WriteOnlyProperty, &self.shared.name(name)))
            }
            EntryKind::Property { getter: Some(target), .. } => match self.method_target(&obj, target)? {
                EntryKind::Method(method) => {
                    trace!("getter {} for {}", self.shared.name(target), self.shared.name(name));
                    let args = self.accessor_args(&obj, name, catch_all);
                    self.enter_function(&method.library, method.function, args, FrameKind::Return)
                }
                EntryKind::Member(_) => {
                    let value = self.stored(&obj, target);
                    self.stack.push(value)?;
                    Ok(())
                }
                EntryKind::Property { .. } => {
                    Err(self.property_target_missing(name, target))
                }
            },
        }
    }

    /// Write a member.
    pub(crate) fn set_member(&mut self, object: &Value, name: NameId, value: Value, via_this: bool) -> Result<(), Trap> {
        let obj = self.object_ref(object, name)?;
        let (entry, catch_all) = match self.lookup(&obj, name, via_this)? {
            Lookup::Dynamic => {
                self.store(&obj, name, value);
                return Ok(());
            }
            Lookup::Entry(entry) => (entry, false),
            Lookup::CatchAll(entry) => (entry, true),
        };
        match entry.kind {
            EntryKind::Member(ty) => {
                let value = value.cast_to(ty)?;
                self.store(&obj, name, value);
                Ok(())
            }
            EntryKind::Method(_) => Err(member_error(ErrorCode::MethodNotValue, &self.shared.name(entry.name))),
            EntryKind::Property { setter: None, .. } => {
                Err(member_error(ErrorCode::ReadOnlyProperty, &self.shared.name(name)))
            }
            EntryKind::Property { setter: Some(target), .. } => match self.method_target(&obj, target)? {
                EntryKind::Method(method) => {
                    let mut args = self.accessor_args(&obj, name, catch_all);
                    args.push(value);
                    self.call_setter(&method, args)
                }
                EntryKind::Member(ty) => {
                    let value = value.cast_to(ty)?;
                    self.store(&obj, target, value);
                    Ok(())
                }
                EntryKind::Property { .. } => {
                    Err(self.property_target_missing(name, target))
                }
            },
        }
    }

    /// A setter's result, if it has one, is discarded by a `PopVariable` frame.
    fn call_setter(&mut self, method: &MethodRef, args: Args) -> Result<(), Trap> {
        let returns_value = method
            .def()
            .is_some_and(|def| def.return_type != VariableType::NoReturn);
        if returns_value {
            self.push_frame(FrameKind::PopVariable)?;
            self.state.ip = InstructionPointer::AwaitingFramePop;
        }
        self.enter_function(&method.library, method.function, args, FrameKind::Return)
    }

    /// Add a dynamic member.
    pub(crate) fn insert_member(&mut self, object: &Value, name: NameId, value: Value) -> Result<(), Trap> {
        let obj = self.object_ref(object, name)?;
        let spelled = self.shared.name(name);
        let mut data = obj.borrow_mut();
        let (is_static, in_type) = data
            .type_def()
            .map_or((false, false), |t| (t.is_static, t.entry(name).is_some()));
        if is_static && !spelled.starts_with(DYNAMIC_PREFIX) {
            return Err(member_error(ErrorCode::StaticObjectInsert, &spelled));
        }
        if in_type || data.members.contains_key(&name) {
            return Err(member_error(ErrorCode::MemberAlreadyExists, &spelled));
        }
        data.members.insert(name, value);
        Ok(())
    }

    /// Remove a dynamic member.
    pub(crate) fn delete_member(&mut self, object: &Value, name: NameId) -> Result<(), Trap> {
        let obj = self.object_ref(object, name)?;
        let spelled = self.shared.name(name);
        let mut data = obj.borrow_mut();
        let (is_static, in_type) = data
            .type_def()
            .map_or((false, false), |t| (t.is_static, t.entry(name).is_some()));
        if is_static && !spelled.starts_with(DYNAMIC_PREFIX) {
            return Err(member_error(ErrorCode::StaticObjectDelete, &spelled));
        }
        if in_type {
            return Err(member_error(ErrorCode::TypeMemberDelete, &spelled));
        }
        match data.members.shift_remove(&name) {
            Some(_) => Ok(()),
            None => Err(member_error(ErrorCode::MemberNotFound, &spelled)),
        }
    }

    /// Call a method, or a function pointer stored in a member.
    pub(crate) fn call_member(&mut self, object: &Value, name: NameId, args: Args, via_this: bool) -> Result<(), Trap> {
        let obj = self.object_ref(object, name)?;
        let (entry, catch_all) = match self.lookup(&obj, name, via_this)? {
            Lookup::Dynamic => {
                let value = self.stored(&obj, name);
                return self.invoke_value(&value, args);
            }
            Lookup::Entry(entry) => (entry, false),
            Lookup::CatchAll(entry) => (entry, true),
        };
        match entry.kind {
            EntryKind::Method(method) if catch_all => {
                let mut call_args = self.accessor_args(&obj, name, true);
                call_args.push(Value::array(VariableType::Variant, args.into_vec()));
                self.enter_function(&method.library, method.function, call_args, FrameKind::Return)
            }
            EntryKind::Method(method) => {
                let ptr = self
                    .make_function_ptr(&method.library, method.function)?
                    .with_receiver(Value::Object(Some(obj.clone())));
                self.invoke_ptr(&ptr, args)
            }
            EntryKind::Member(_) => {
                let value = self.stored(&obj, name);
                self.invoke_value(&value, args)
            }
            EntryKind::Property { getter: None, .. } => {
                Err(member_error(ErrorCode::WriteOnlyProperty, &self.shared.name(name)))
            }
            EntryKind::Property { getter: Some(target), .. } => match self.method_target(&obj, target)? {
                EntryKind::Method(method) => {
                    let getter_args = self.accessor_args(&obj, name, catch_all);
                    let value = self.read_through_getter(&method, getter_args)?;
                    self.invoke_value(&value, args)
                }
                EntryKind::Member(_) => {
                    let value = self.stored(&obj, target);
                    self.invoke_value(&value, args)
                }
                EntryKind::Property { .. } => {
                    Err(self.property_target_missing(name, target))
                }
            },
        }
    }

    /// Run a getter to completion before the member's value can be called.
    fn read_through_getter(&mut self, method: &MethodRef, args: Args) -> Result<Value, Trap> {
        let library = Rc::clone(&method.library);
        let function = method.function;
        let call = self.run_nested(move |vm| vm.enter_function(&library, function, args, FrameKind::Return))?;
        match call {
            SyncCall::Returned(value) => Ok(value.unwrap_or(Value::FunctionPtr(None))),
            SyncCall::Unwinding => Err(Trap::Unwind),
            SyncCall::Aborted => Err(self.take_pending_error().unwrap_or(VmError::NoCode).into()),
        }
    }

    fn invoke_value(&mut self, value: &Value, args: Args) -> Result<(), Trap> {
        let ptr = expect_function_ptr(value)?;
        self.invoke_ptr(&ptr, args)
    }
}
