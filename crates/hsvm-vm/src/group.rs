//! VM groups.
//!
//! A group owns a set of VMs that share interned names, loaded libraries, the
//! type-extension memo, registered builtins and one abort signal. At most one
//! VM of a group runs at a time; cross-VM function pointer calls move the
//! "current" designation between them.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use hsvm_core::{Interner, NameId, VariableType};
use log::{debug, trace};

use crate::async_trace::AsyncStackTrace;
use crate::builder::LibraryBuilder;
use crate::builtin::{Builtin, BuiltinRegistry};
use crate::config::VmConfig;
use crate::error::VmError;
use crate::execute::{ExecuteOutcome, RunOptions};
use crate::library::{Library, LibraryRegistry};
use crate::machine::Vm;
use crate::object::{ObjectTypeDef, TypeCache};
use crate::signal::{AbortReason, AbortSignal};
use crate::value::Value;

/// Identity of a VM within its group.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct VmId(pub u32);

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm{}", self.0)
    }
}

/// Names the engine itself reads or writes.
#[derive(Clone, Copy, Debug)]
pub(crate) struct WellKnownNames {
    pub done: NameId,
    pub value: NameId,
    pub what: NameId,
    pub code: NameId,
    pub trace: NameId,
    pub filename: NameId,
    pub function: NameId,
    pub line: NameId,
    pub col: NameId,
    /// The catch-all member `^`.
    pub catch_all: NameId,
}

impl WellKnownNames {
    fn new(interner: &mut Interner) -> Self {
        Self {
            done: interner.intern("done"),
            value: interner.intern("value"),
            what: interner.intern("what"),
            code: interner.intern("code"),
            trace: interner.intern("trace"),
            filename: interner.intern("filename"),
            function: interner.intern("function"),
            line: interner.intern("line"),
            col: interner.intern("col"),
            catch_all: interner.intern("^"),
        }
    }
}

/// Group-scoped caches, shared by every VM of the group.
pub(crate) struct GroupShared {
    pub interner: RefCell<Interner>,
    pub libraries: RefCell<LibraryRegistry>,
    pub types: RefCell<TypeCache>,
    pub builtins: RefCell<BuiltinRegistry>,
    pub signal: AbortSignal,
    pub names: WellKnownNames,
    pub exception_type: Rc<ObjectTypeDef>,
    pub generator_type: Rc<ObjectTypeDef>,
}

impl GroupShared {
    pub fn new() -> Self {
        let mut interner = Interner::new();
        let names = WellKnownNames::new(&mut interner);
        let exception_type = ObjectTypeDef::with_members(
            "EXCEPTION",
            &[
                (names.what, VariableType::String),
                (names.code, VariableType::String),
                (names.trace, VariableType::RecordArray),
            ],
            false,
        );
        Self {
            interner: RefCell::new(interner),
            libraries: RefCell::new(LibraryRegistry::new()),
            types: RefCell::new(TypeCache::new()),
            builtins: RefCell::new(BuiltinRegistry::new()),
            signal: AbortSignal::new(),
            names,
            exception_type: Rc::new(exception_type),
            generator_type: Rc::new(ObjectTypeDef::with_members("GENERATOR", &[], true)),
        }
    }

    /// Canonical spelling of a name.
    pub fn name(&self, name: NameId) -> String {
        self.interner.borrow().resolve(name).to_string()
    }
}

/// A value moving between two VMs.
pub(crate) enum Transfer {
    /// Marshalled `[argument array, function pointer]` for the target VM.
    Call {
        target: VmId,
        payload: Vec<u8>,
        context: Option<Rc<AsyncStackTrace>>,
    },
    /// Marshalled result (if the function returns one) for the calling VM.
    Return { target: VmId, payload: Option<Vec<u8>> },
}

/// Outcome of a host call-in.
#[derive(Debug)]
pub enum RunResult {
    /// The call completed, with its result if the function returns one.
    Finished(Option<Value>),
    /// The abort signal was observed in a suspendable run; call
    /// [`VmGroup::resume`] to continue.
    Blocked(AbortReason),
    /// The call failed. The VMs involved are reset.
    Aborted(VmError),
}

/// A set of cooperating VMs.
pub struct VmGroup {
    shared: Rc<GroupShared>,
    config: VmConfig,
    vms: Vec<Vm>,
    current: Option<VmId>,
    options: RunOptions,
}

impl VmGroup {
    pub fn new(config: VmConfig) -> Self {
        Self {
            shared: Rc::new(GroupShared::new()),
            config,
            vms: Vec::new(),
            current: None,
            options: RunOptions::default(),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Add a VM to the group.
    pub fn create_vm(&mut self) -> VmId {
        let id = VmId(self.vms.len() as u32);
        self.vms.push(Vm::new(id, self.shared.clone(), &self.config));
        debug!("created {}", id);
        id
    }

    pub fn vm(&self, id: VmId) -> Result<&Vm, VmError> {
        self.vms.get(id.0 as usize).ok_or(VmError::UnknownVm(id))
    }

    pub fn vm_mut(&mut self, id: VmId) -> Result<&mut Vm, VmError> {
        self.vms.get_mut(id.0 as usize).ok_or(VmError::UnknownVm(id))
    }

    /// Resolve a built library against the group's name table and load it.
    pub fn load_library(&mut self, builder: LibraryBuilder) -> Result<Rc<Library>, VmError> {
        let id = self.shared.libraries.borrow().next_id();
        let library = builder.finish(id, &mut self.shared.interner.borrow_mut())?;
        debug!("loaded library {} as {}", library.name, id);
        self.shared.libraries.borrow_mut().add(library)
    }

    pub fn library(&self, name: &str) -> Option<Rc<Library>> {
        self.shared.libraries.borrow().by_name(name)
    }

    pub fn register_builtin(&self, name: &str, builtin: Builtin) {
        self.shared.builtins.borrow_mut().add(name, builtin);
    }

    pub fn intern(&self, name: &str) -> NameId {
        self.shared.interner.borrow_mut().intern(name)
    }

    pub fn resolve_name(&self, name: NameId) -> String {
        self.shared.name(name)
    }

    /// Handle to the group's abort/yield signal.
    pub fn signal(&self) -> AbortSignal {
        self.shared.signal.clone()
    }

    /// Number of distinct composed object types.
    pub fn type_count(&self) -> usize {
        self.shared.types.borrow().len()
    }

    /// The VM that runs (or last ran) the current host call.
    pub fn current(&self) -> Option<VmId> {
        self.current
    }

    /// Call a function by name and run until finished, blocked or aborted.
    pub fn call(
        &mut self,
        vm: VmId,
        library: &Rc<Library>,
        function: &str,
        args: Vec<Value>,
    ) -> RunResult {
        self.call_with(vm, library, function, args, RunOptions::default())
    }

    pub fn call_with(
        &mut self,
        vm: VmId,
        library: &Rc<Library>,
        function: &str,
        args: Vec<Value>,
        options: RunOptions,
    ) -> RunResult {
        let Some(index) = library.find_function(function) else {
            return RunResult::Aborted(VmError::MissingFunction {
                library: library.name.clone(),
                function: function.to_string(),
            });
        };
        let started = self.vm_mut(vm).and_then(|v| v.begin_call(library, index, args));
        if let Err(e) = started {
            self.reset_all();
            return RunResult::Aborted(e);
        }
        self.current = Some(vm);
        self.options = options;
        self.run()
    }

    /// Continue a blocked call.
    pub fn resume(&mut self) -> RunResult {
        if self.current.is_none() {
            return RunResult::Aborted(VmError::NoCode);
        }
        self.run()
    }

    fn run(&mut self) -> RunResult {
        loop {
            let Some(id) = self.current else {
                return RunResult::Aborted(VmError::NoCode);
            };
            let options = self.options;
            let outcome = match self.vm_mut(id) {
                Ok(vm) => vm.execute(options),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(ExecuteOutcome::Completed) => {
                    let result = self.vm_mut(id).ok().and_then(Vm::take_result);
                    return RunResult::Finished(result);
                }
                Ok(ExecuteOutcome::Suspended(reason)) => {
                    debug!("{} blocked: {}", id, reason);
                    return RunResult::Blocked(reason);
                }
                Ok(ExecuteOutcome::SwitchVm(target)) => {
                    if let Err(e) = self.transfer(id, target) {
                        self.reset_all();
                        return RunResult::Aborted(e);
                    }
                    self.current = Some(target);
                }
                Ok(ExecuteOutcome::Debug(event)) => {
                    trace!("ignoring debug event {:?} outside a debug run", event);
                }
                Err(e) => {
                    self.reset_all();
                    return RunResult::Aborted(e);
                }
            }
        }
    }

    /// Move the pending transfer of `from` into `to`.
    fn transfer(&mut self, from: VmId, to: VmId) -> Result<(), VmError> {
        let transfer = self
            .vm_mut(from)?
            .take_outbound()
            .ok_or(VmError::MissingTransfer(from))?;
        debug!("switching from {} to {}", from, to);
        match transfer {
            Transfer::Call { target, payload, context } if target == to => {
                self.vm_mut(to)?.accept_call(from, &payload, context)
            }
            Transfer::Return { target, payload } if target == to => {
                self.vm_mut(to)?.accept_return(payload.as_deref())
            }
            _ => Err(VmError::MissingTransfer(to)),
        }
    }

    fn reset_all(&mut self) {
        for vm in &mut self.vms {
            vm.reset();
        }
        self.current = None;
    }
}
