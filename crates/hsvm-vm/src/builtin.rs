//! Host functions callable from bytecode.
//!
//! Functions whose body is [`FunctionBody::External`] are resolved by name in
//! the group's [`BuiltinRegistry`] at call time.
//!
//! [`FunctionBody::External`]: crate::library::FunctionBody::External

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::error::RuntimeError;
use crate::machine::Vm;
use crate::value::Value;

type MacroFn = dyn Fn(&[Value]) -> Result<(), RuntimeError>;
type FunctionFn = dyn Fn(&[Value]) -> Result<Value, RuntimeError>;
type VmMacroFn = dyn Fn(&mut Vm, &[Value]) -> Result<(), RuntimeError>;
type VmFunctionFn = dyn Fn(&mut Vm, &[Value]) -> Result<Value, RuntimeError>;

/// The four call-out shapes.
///
/// The `Vm*` variants receive the running VM and may re-enter it through
/// [`Vm::call_sync`]. If such a nested call leaves an exception pending, the
/// builtin's own result is ignored and unwinding continues.
#[derive(Clone)]
pub enum Builtin {
    /// Procedure without a result.
    Macro(Rc<MacroFn>),
    /// Function with a result.
    Function(Rc<FunctionFn>),
    VmMacro(Rc<VmMacroFn>),
    VmFunction(Rc<VmFunctionFn>),
}

impl Builtin {
    pub fn macro_fn(f: impl Fn(&[Value]) -> Result<(), RuntimeError> + 'static) -> Self {
        Builtin::Macro(Rc::new(f))
    }

    pub fn function(f: impl Fn(&[Value]) -> Result<Value, RuntimeError> + 'static) -> Self {
        Builtin::Function(Rc::new(f))
    }

    pub fn vm_macro(f: impl Fn(&mut Vm, &[Value]) -> Result<(), RuntimeError> + 'static) -> Self {
        Builtin::VmMacro(Rc::new(f))
    }

    pub fn vm_function(f: impl Fn(&mut Vm, &[Value]) -> Result<Value, RuntimeError> + 'static) -> Self {
        Builtin::VmFunction(Rc::new(f))
    }

    /// Run the builtin. Macros produce no value.
    pub fn invoke(&self, vm: &mut Vm, args: &[Value]) -> Result<Option<Value>, RuntimeError> {
        match self {
            Builtin::Macro(f) => f(args).map(|()| None),
            Builtin::Function(f) => f(args).map(Some),
            Builtin::VmMacro(f) => f(vm, args).map(|()| None),
            Builtin::VmFunction(f) => f(vm, args).map(Some),
        }
    }
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = match self {
            Builtin::Macro(_) => "Macro",
            Builtin::Function(_) => "Function",
            Builtin::VmMacro(_) => "VmMacro",
            Builtin::VmFunction(_) => "VmFunction",
        };
        write!(f, "Builtin::{}", shape)
    }
}

/// Registry of host functions, keyed by upper-cased name.
#[derive(Debug, Default)]
pub struct BuiltinRegistry {
    builtins: HashMap<String, Builtin>,
}

impl BuiltinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a builtin, replacing any previous one with the same name.
    pub fn add(&mut self, name: &str, builtin: Builtin) {
        self.builtins.insert(name.to_uppercase(), builtin);
    }

    pub fn get(&self, name: &str) -> Option<Builtin> {
        self.builtins.get(&name.to_uppercase()).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builtins.contains_key(&name.to_uppercase())
    }
}
