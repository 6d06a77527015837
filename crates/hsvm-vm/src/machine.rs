//! The virtual machine: execution state, call stack and operand stack.
//!
//! Calls never recurse natively. Every call-like transfer pushes a frame whose
//! kind decides what happens when it is popped; functions that finish set the
//! instruction pointer to [`InstructionPointer::AwaitingFramePop`] and the
//! dispatch loop pops the frame.

use std::rc::Rc;
use std::time::Instant;

use hsvm_core::{ErrorCode, VariableType};
use log::{debug, trace};

use crate::async_trace::{AsyncStackTrace, AsyncTraceEntry};
use crate::config::VmConfig;
use crate::error::{RuntimeError, Trap, VmError};
use crate::execute::{ExecuteOutcome, RunOptions};
use crate::exception::TraceEntry;
use crate::frame::{
    CallStack, CallStackElement, ExecutionState, FrameAction, FrameKind, InstructionPointer,
};
use crate::funcptr::{self, FptrParam, FunctionPtr, RebindRequest};
use crate::generator::GeneratorState;
use crate::group::{GroupShared, Transfer, VmId};
use crate::library::{FunctionBody, FunctionDef, Library};
use crate::marshal::{marshal, read_value, unmarshal, write_value};
use crate::profile::ProfileData;
use crate::signal::AbortReason;
use crate::stack::{Args, StackMachine};
use crate::value::Value;

/// Result of a synchronous nested call.
///
/// A nested call can leave an exception pending; its result must not be
/// trusted unless it is [`SyncCall::Returned`].
#[derive(Debug)]
pub enum SyncCall {
    Returned(Option<Value>),
    /// An exception is pending. Return to the dispatch loop so it can unwind.
    Unwinding,
    /// A fatal error occurred. It is reported when the calling builtin returns,
    /// or through [`Vm::take_pending_error`].
    Aborted,
}

/// One virtual machine.
pub struct Vm {
    pub(crate) id: VmId,
    pub(crate) shared: Rc<GroupShared>,
    pub(crate) state: ExecutionState,
    pub(crate) call_stack: CallStack,
    pub(crate) stack: StackMachine,

    /// An exception is propagating.
    pub(crate) unwinding: bool,
    pub(crate) exception: Option<Value>,
    /// Leave the next frame out of the exception trace.
    pub(crate) skip_next_trace: bool,
    /// Trace of the current exception, also kept for non-object exceptions.
    pub(crate) trace: Vec<TraceEntry>,
    /// Offset of the instruction being executed.
    pub(crate) instr_start: usize,

    /// Operand stack sizes at each `StopExecute` anchor.
    stop_marks: Vec<usize>,
    /// Value left by the call finished by the last popped anchor.
    pub(crate) stop_result: Option<Value>,

    pub(crate) async_context: Option<Rc<AsyncStackTrace>>,
    async_weak_period: u32,

    outbound: Option<Transfer>,
    pending_fatal: Option<VmError>,

    profiling: bool,
    profile: ProfileData,
    pub(crate) deinit_done: bool,
}

impl Vm {
    pub(crate) fn new(id: VmId, shared: Rc<GroupShared>, config: &VmConfig) -> Self {
        Self {
            id,
            shared,
            state: ExecutionState::idle(),
            call_stack: CallStack::new(config.max_call_depth),
            stack: StackMachine::with_max_size(config.max_stack_size),
            unwinding: false,
            exception: None,
            skip_next_trace: false,
            trace: Vec::new(),
            instr_start: 0,
            stop_marks: Vec::new(),
            stop_result: None,
            async_context: None,
            async_weak_period: config.async_trace_weak_period,
            outbound: None,
            pending_fatal: None,
            profiling: config.profiling,
            profile: ProfileData::default(),
            deinit_done: false,
        }
    }

    pub fn id(&self) -> VmId {
        self.id
    }

    pub fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_unwinding(&self) -> bool {
        self.unwinding
    }

    pub fn current_exception(&self) -> Option<&Value> {
        self.exception.as_ref()
    }

    pub fn execution_state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn profile(&self) -> &ProfileData {
        &self.profile
    }

    /// Intern a name in the group's name table.
    pub fn intern(&self, name: &str) -> hsvm_core::NameId {
        self.shared.interner.borrow_mut().intern(name)
    }

    /// Library of the running code.
    pub(crate) fn current_library(&self) -> Result<Rc<Library>, VmError> {
        self.state.library.clone().ok_or(VmError::NoCode)
    }

    pub(crate) fn library_by_id(&self, id: crate::library::LibraryId) -> Result<Rc<Library>, VmError> {
        self.shared.libraries.borrow().get(id)
    }

    // === Frames ===

    /// Snapshot the execution state into a new frame.
    pub(crate) fn push_frame(&mut self, kind: FrameKind) -> Result<(), VmError> {
        let entered = (self.profiling && matches!(kind, FrameKind::Return)).then(Instant::now);
        trace!("push {:?} frame at depth {}", kind, self.call_stack.len());
        self.call_stack.push(CallStackElement {
            kind,
            state: self.state.clone(),
            base: self.stack.base(),
            entered,
        })
    }

    /// Pop a frame, restoring the execution state, and perform its action.
    pub(crate) fn pop_frame(&mut self) -> Result<FrameAction, Trap> {
        let returning = (self.state.library.clone(), self.state.function);
        let element = self.restore_frame()?;
        trace!("pop {:?} frame", element.kind);
        match element.kind {
            FrameKind::Return => {
                if let (Some(entered), (Some(library), function)) = (element.entered, returning) {
                    self.profile.record(library.id, function, entered.elapsed());
                }
                Ok(FrameAction::Continue)
            }
            FrameKind::StopExecute => {
                self.finish_anchor();
                Ok(FrameAction::Stop)
            }
            FrameKind::SwitchToOtherVm(target) => {
                debug!("{} hands control to {}", self.id, target);
                Ok(FrameAction::SwitchVm(target))
            }
            FrameKind::ReturnToOtherVm { target, returns_value } => {
                let payload = if returns_value {
                    let value = self.stack.pop()?;
                    Some(marshal(&value, &self.shared.interner.borrow())?)
                } else {
                    None
                };
                debug!("{} returns to {}", self.id, target);
                self.outbound = Some(Transfer::Return { target, payload });
                Ok(FrameAction::SwitchVm(target))
            }
            FrameKind::Dummy => Ok(FrameAction::Continue),
            FrameKind::PopVariable => {
                self.stack.pop()?;
                Ok(FrameAction::Continue)
            }
            FrameKind::TailCall(callback) => {
                callback(self, false)?;
                Ok(FrameAction::Continue)
            }
        }
    }

    /// Pop a frame and restore the execution state without performing its action.
    pub(crate) fn restore_frame(&mut self) -> Result<CallStackElement, VmError> {
        let element = self.call_stack.pop().ok_or(VmError::CallStackUnderflow)?;
        self.state = element.state.clone();
        self.stack.set_base(element.base);
        Ok(element)
    }

    /// Push a boundary the dispatch loop stops at.
    pub(crate) fn push_stop_anchor(&mut self) -> Result<(), VmError> {
        self.push_frame(FrameKind::StopExecute)?;
        self.stop_marks.push(self.stack.len());
        Ok(())
    }

    /// Collect the result of the call finished at an anchor.
    pub(crate) fn finish_anchor(&mut self) {
        let Some(mark) = self.stop_marks.pop() else {
            return;
        };
        self.stop_result = if !self.unwinding && self.stack.len() > mark {
            self.stack.pop().ok()
        } else {
            None
        };
        self.stack.truncate(mark);
    }

    /// Take the result of the last finished host call.
    pub fn take_result(&mut self) -> Option<Value> {
        self.stop_result.take()
    }

    // === Calls ===

    /// Bind `args` to the parameters of a function and start running it.
    ///
    /// Bytecode functions get a new local window and run from their entry;
    /// external functions run immediately and leave their result on the stack.
    pub(crate) fn enter_function(
        &mut self,
        library: &Rc<Library>,
        function: u32,
        args: Args,
        kind: FrameKind,
    ) -> Result<(), Trap> {
        let def = library.function(function)?;
        let bound = self
            .bind_arguments(def, args)
            .map_err(|trap| trap.with_function(|| def.signature()))?;
        trace!("enter {} with {} arguments", def.name, bound.len());

        self.push_frame(kind)?;
        self.state = ExecutionState {
            library: Some(library.clone()),
            function,
            ip: InstructionPointer::AwaitingFramePop,
        };
        match &def.body {
            FunctionBody::Code { entry } => {
                let locals = def.locals.iter().map(|&ty| Value::default_for(ty));
                self.stack.enter_window(bound.into_iter().chain(locals))?;
                self.state.ip = InstructionPointer::Code(*entry);
                Ok(())
            }
            FunctionBody::External(name) => self
                .call_external(name, def.return_type, &bound)
                .map_err(|trap| trap.with_function(|| def.signature())),
        }
    }

    fn bind_arguments(&self, def: &FunctionDef, args: Args) -> Result<Vec<Value>, Trap> {
        let fixed = def.fixed_params();
        let given = args.len();
        let mut args = args.into_iter();
        let mut bound = Vec::with_capacity(def.params.len() + def.locals.len());

        for (i, param) in fixed.iter().enumerate() {
            let value = match (args.next(), &param.default) {
                (Some(arg), _) => arg,
                (None, Some(default)) => unmarshal(default, &mut self.shared.interner.borrow_mut())?,
                (None, None) => {
                    return Err(RuntimeError::new(ErrorCode::TooFewArguments, [(i + 1).to_string()]).into());
                }
            };
            bound.push(value.cast_to(param.ty)?);
        }

        match def.vararg_element() {
            Some(elem) => {
                let rest = args.map(|arg| arg.cast_to(elem)).collect::<Result<Vec<_>, _>>()?;
                bound.push(Value::array(elem, rest));
            }
            None if given > fixed.len() => {
                return Err(RuntimeError::new(
                    ErrorCode::TooManyArguments,
                    [fixed.len().to_string(), given.to_string()],
                )
                .into());
            }
            None => {}
        }
        Ok(bound)
    }

    /// Run a host function. Its frame is already pushed; the dispatch loop pops it.
    fn call_external(&mut self, name: &str, return_type: VariableType, args: &[Value]) -> Result<(), Trap> {
        let builtin = self
            .shared
            .builtins
            .borrow()
            .get(name)
            .ok_or_else(|| VmError::MissingBuiltin(name.to_string()))?;
        self.poll_call_out()?;

        let result = builtin.invoke(self, args);
        if let Some(fatal) = self.pending_fatal.take() {
            return Err(Trap::Fatal(fatal));
        }
        if self.unwinding {
            // A nested call or the builtin itself threw; its result is meaningless.
            return Err(Trap::Unwind);
        }
        let value = result?;
        if return_type != VariableType::NoReturn {
            let value = value.unwrap_or_else(|| Value::default_for(return_type));
            self.stack.push(value.cast_to(return_type)?)?;
        }
        Ok(())
    }

    /// The signal is polled before a call-out. Yields are left to the next
    /// checkpoint; any other reason aborts, since the call-out cannot be
    /// suspended halfway.
    fn poll_call_out(&self) -> Result<(), VmError> {
        match self.shared.signal.get() {
            None | Some(AbortReason::Yield) => Ok(()),
            Some(reason) => Err(VmError::Aborted(reason)),
        }
    }

    // === Function pointers ===

    /// Pointer to a function with every parameter passed through unchanged.
    pub fn make_function_ptr(&self, library: &Rc<Library>, function: u32) -> Result<FunctionPtr, VmError> {
        let def = library.function(function)?;
        let mut params = Vec::with_capacity(def.params.len());
        for (i, param) in def.fixed_params().iter().enumerate() {
            let position = i as i32 + 1;
            params.push(match &param.default {
                Some(bytes) => {
                    let fallback = unmarshal(bytes, &mut self.shared.interner.borrow_mut())?;
                    FptrParam::optional(param.ty, position, fallback)
                }
                None => FptrParam::required(param.ty, position),
            });
        }
        Ok(FunctionPtr {
            library: library.id,
            function,
            vm: self.id,
            return_type: def.return_type,
            vararg: def.vararg_element(),
            first_unused_source: params.len() as i32 + 1,
            params,
        })
    }

    /// Start a call through a function pointer.
    pub(crate) fn invoke_ptr(&mut self, ptr: &FunctionPtr, args: Args) -> Result<(), Trap> {
        if ptr.vm != self.id {
            return self.call_other_vm(ptr, args);
        }
        let library = self.library_by_id(ptr.library)?;
        let resolved = ptr
            .resolve_arguments(&args)
            .map_err(|e| e.with_function(self.signature_of(ptr)))?;
        self.enter_function(&library, ptr.function, resolved, FrameKind::Return)
    }

    /// Signature of a function pointer's target, for error annotations.
    pub(crate) fn signature_of(&self, ptr: &FunctionPtr) -> String {
        self.library_by_id(ptr.library)
            .ok()
            .and_then(|library| library.function(ptr.function).ok().map(FunctionDef::signature))
            .unwrap_or_else(|| format!("function {} of library {}", ptr.function, ptr.library))
    }

    /// Rebind a function pointer. Errors name the target's signature.
    pub fn rebind(&self, ptr: &FunctionPtr, request: &RebindRequest) -> Result<FunctionPtr, RuntimeError> {
        funcptr::rebind(ptr, request).map_err(|e| e.with_function(self.signature_of(ptr)))
    }

    fn call_other_vm(&mut self, ptr: &FunctionPtr, args: Args) -> Result<(), Trap> {
        let mut payload = Vec::new();
        {
            let interner = self.shared.interner.borrow();
            let args = Value::array(VariableType::Variant, args.into_vec());
            write_value(&args, &interner, &mut payload)?;
            write_value(&Value::FunctionPtr(Some(Rc::new(ptr.clone()))), &interner, &mut payload)?;
        }
        debug!("{} calls function {} in {}", self.id, ptr.function, ptr.vm);
        self.outbound = Some(Transfer::Call {
            target: ptr.vm,
            payload,
            context: Some(self.capture_async_trace()),
        });
        self.push_frame(FrameKind::SwitchToOtherVm(ptr.vm))?;
        self.state.ip = InstructionPointer::AwaitingFramePop;
        Ok(())
    }

    pub(crate) fn take_outbound(&mut self) -> Option<Transfer> {
        self.outbound.take()
    }

    /// Start a call transferred from another VM.
    pub(crate) fn accept_call(
        &mut self,
        caller: VmId,
        payload: &[u8],
        context: Option<Rc<AsyncStackTrace>>,
    ) -> Result<(), VmError> {
        let (args, ptr) = {
            let mut interner = self.shared.interner.borrow_mut();
            let mut offset = 0;
            let args = read_value(payload, &mut offset, &mut interner)?;
            let ptr = read_value(payload, &mut offset, &mut interner)?;
            (args, ptr)
        };
        let ptr = funcptr::expect_function_ptr(&ptr)?;
        let args: Args = args.as_array().map(|a| a.iter().cloned().collect()).unwrap_or_default();

        self.async_context = context;
        self.push_frame(FrameKind::ReturnToOtherVm {
            target: caller,
            returns_value: ptr.return_type != VariableType::NoReturn,
        })?;
        self.state.ip = InstructionPointer::AwaitingFramePop;
        if let Err(trap) = self.invoke_ptr(&ptr, args) {
            self.handle_trap(trap)?;
        }
        Ok(())
    }

    /// Receive the result of a call made in another VM.
    pub(crate) fn accept_return(&mut self, payload: Option<&[u8]>) -> Result<(), VmError> {
        if let Some(bytes) = payload {
            let value = unmarshal(bytes, &mut self.shared.interner.borrow_mut())?;
            self.stack.push(value)?;
        }
        Ok(())
    }

    // === Host call-in ===

    /// Prepare a host call. Run it with [`Vm::execute`].
    pub fn begin_call(&mut self, library: &Rc<Library>, function: u32, args: Vec<Value>) -> Result<(), VmError> {
        self.push_stop_anchor()?;
        if let Err(trap) = self.enter_function(library, function, args.into_iter().collect(), FrameKind::Return) {
            self.handle_trap(trap)?;
        }
        Ok(())
    }

    /// Run a nested call to completion behind its own anchor.
    pub(crate) fn run_nested<F>(&mut self, setup: F) -> Result<SyncCall, VmError>
    where
        F: FnOnce(&mut Vm) -> Result<(), Trap>,
    {
        self.push_stop_anchor()?;
        // The caller's code resumes when the anchor pops, not before.
        self.state.ip = InstructionPointer::AwaitingFramePop;
        let stopped = match setup(self) {
            Ok(()) => false,
            Err(trap) => self.handle_trap(trap)?,
        };
        if !stopped {
            match self.run_loop(RunOptions::default(), None)? {
                ExecuteOutcome::Completed => {}
                ExecuteOutcome::SwitchVm(_) => return Err(VmError::NestedVmSwitch),
                other => {
                    debug!("unexpected outcome {:?} of a nested run", other);
                    return Err(VmError::NestedVmSwitch);
                }
            }
        }
        if self.unwinding {
            Ok(SyncCall::Unwinding)
        } else {
            Ok(SyncCall::Returned(self.stop_result.take()))
        }
    }

    fn settle_sync(&mut self, result: Result<SyncCall, VmError>) -> SyncCall {
        match result {
            Ok(call) => call,
            Err(e) => {
                debug!("nested call failed: {}", e);
                self.pending_fatal = Some(e);
                SyncCall::Aborted
            }
        }
    }

    /// Synchronously call a function, for use by builtins.
    pub fn call_sync(&mut self, library: &Rc<Library>, function: u32, args: Vec<Value>) -> SyncCall {
        let library = library.clone();
        let result = self.run_nested(move |vm| {
            vm.enter_function(&library, function, args.into_iter().collect(), FrameKind::Return)
        });
        self.settle_sync(result)
    }

    /// Synchronously invoke a function pointer value, for use by builtins.
    pub fn invoke_sync(&mut self, ptr: &Value, args: Vec<Value>) -> SyncCall {
        let ptr = ptr.clone();
        let result = self.run_nested(move |vm| {
            let ptr = funcptr::expect_function_ptr(&ptr)?;
            vm.invoke_ptr(&ptr, args.into_iter().collect())
        });
        self.settle_sync(result)
    }

    /// Synchronously read an object member as seen from outside the object.
    pub fn object_member_get_sync(&mut self, object: &Value, name: &str) -> SyncCall {
        let name = self.intern(name);
        let object = object.clone();
        let result = self.run_nested(move |vm| vm.push_member(&object, name, false));
        self.settle_sync(result)
    }

    /// Fatal error recorded by a failed nested call.
    pub fn take_pending_error(&mut self) -> Option<VmError> {
        self.pending_fatal.take()
    }

    /// Drop all execution state after a fatal error.
    pub fn reset(&mut self) {
        if !self.call_stack.is_empty() {
            debug!("{} reset with {} frames", self.id, self.call_stack.len());
        }
        while self.call_stack.pop().is_some() {}
        self.stack.clear();
        self.state = ExecutionState::idle();
        self.unwinding = false;
        self.exception = None;
        self.skip_next_trace = false;
        self.stop_marks.clear();
        self.stop_result = None;
        self.outbound = None;
        self.pending_fatal = None;
    }

    // === Generators ===

    /// State of a generator object.
    pub fn generator_state(&self, value: &Value) -> GeneratorState {
        value
            .as_object()
            .and_then(|obj| obj.borrow().generator.as_ref().map(|ctx| ctx.state))
            .unwrap_or(GeneratorState::NotAGenerator)
    }

    // === Async traces ===

    /// Entries for the live call stack, innermost first.
    fn live_trace_entries(&self) -> Vec<AsyncTraceEntry> {
        let current = std::iter::once(&self.state);
        let frames = self.call_stack.iter_innermost().map(|e| &e.state);
        current
            .chain(frames)
            .filter_map(|state| {
                let library = state.library.as_ref()?;
                let ip = state.code_offset()?;
                Some(AsyncTraceEntry {
                    library: library.id,
                    function: state.function,
                    ip,
                })
            })
            .collect()
    }

    /// Capture the live call stack as a new async trace segment.
    pub fn capture_async_trace(&self) -> Rc<AsyncStackTrace> {
        AsyncStackTrace::new(
            self.live_trace_entries(),
            self.async_context.clone(),
            self.async_weak_period,
        )
    }

    pub fn async_context(&self) -> Option<&Rc<AsyncStackTrace>> {
        self.async_context.as_ref()
    }

    /// Live call stack followed by every reachable async segment.
    pub fn async_stack_trace(&self) -> Vec<AsyncTraceEntry> {
        let mut entries = self.live_trace_entries();
        if let Some(context) = &self.async_context {
            for segment in context.walk() {
                entries.extend_from_slice(segment.entries());
            }
        }
        entries
    }
}
