//! The generator state machine.
//!
//! A generator's continuation lives on its object: the resume location and a
//! copy of its local window. Resuming copies the window back onto the stack
//! and runs the body until it yields or returns; both leave a
//! `{DONE, VALUE}` record for the resumer.

use std::fmt;
use std::rc::Rc;

use hsvm_core::ErrorCode;
use log::trace;

use crate::bytecode::{DecodeError, Opcode};
use crate::error::{RuntimeError, StackError, Trap, VmError};
use crate::frame::{ExecutionState, FrameKind, InstructionPointer};
use crate::library::Library;
use crate::machine::Vm;
use crate::object::ObjectData;
use crate::value::{ObjectRef, Value};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GeneratorState {
    NotAGenerator,
    SuspendedStart,
    SuspendedYield,
    Executing,
    Completed,
}

/// How a generator is resumed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResumeKind {
    /// Continue, delivering a value as the result of the pending yield.
    Next,
    /// Raise the value inside the generator.
    Throw,
    /// Complete the generator with the value.
    Return,
}

impl ResumeKind {
    pub fn from_i32(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Next),
            1 => Some(Self::Throw),
            2 => Some(Self::Return),
            _ => None,
        }
    }
}

/// Saved continuation of a generator.
pub struct GeneratorContext {
    pub state: GeneratorState,
    library: Rc<Library>,
    function: u32,
    ip: usize,
    /// Local window at suspension. The slot holding the generator itself is
    /// blanked so the object does not own a reference to itself.
    locals: Vec<Value>,
    self_slot: usize,
    /// Value of a `Return` resume; the body runs on and completes with it.
    pending_return: Option<Value>,
    /// Result record once completed.
    result: Value,
}

impl fmt::Debug for GeneratorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratorContext")
            .field("state", &self.state)
            .field("function", &self.function)
            .field("ip", &self.ip)
            .field("locals", &self.locals.len())
            .finish()
    }
}

impl Vm {
    fn generator_record(&self, done: bool, value: Value) -> Value {
        let names = &self.shared.names;
        Value::record([(names.done, Value::Boolean(done)), (names.value, value)])
    }

    /// Result of a generator that completed without producing a value.
    fn empty_completion(&self) -> Value {
        self.generator_record(true, Value::empty_record())
    }

    /// Wrap a generator body's return value.
    pub(crate) fn generator_return(&self, value: Value) -> Value {
        self.generator_record(true, value)
    }

    /// Turn the running call into a generator object and return it to the caller.
    pub(crate) fn generator_init(&mut self, slot: usize, pre_suspended: bool) -> Result<(), Trap> {
        let library = self.current_library()?;
        let InstructionPointer::Code(ip) = self.state.ip else {
            return Err(VmError::NoCode.into());
        };
        let mut locals = self.stack.window();
        let Some(own_slot) = locals.get_mut(slot) else {
            return Err(StackError::LocalOutOfRange(slot).into());
        };
        *own_slot = Value::Object(None);

        let state = if pre_suspended {
            GeneratorState::SuspendedYield
        } else {
            GeneratorState::SuspendedStart
        };
        let mut data = ObjectData::new(Some(self.shared.generator_type.clone()));
        data.generator = Some(GeneratorContext {
            state,
            library,
            function: self.state.function,
            ip,
            locals,
            self_slot: slot,
            pending_return: None,
            result: Value::Record(None),
        });
        let generator = Value::object(data);
        trace!("{} created generator for function {}", self.id, self.state.function);

        self.stack.truncate(self.stack.base());
        self.stack.push(generator)?;
        self.state.ip = InstructionPointer::AwaitingFramePop;
        Ok(())
    }

    /// Suspend the running generator body, handing `{DONE: FALSE, VALUE}` to the resumer.
    pub(crate) fn generator_yield(&mut self, slot: usize) -> Result<(), Trap> {
        let value = self.stack.pop()?;
        let generator = self.stack.local(slot)?.clone();
        let obj = generator.as_object().ok_or(VmError::NotAGenerator)?;
        let InstructionPointer::Code(ip) = self.state.ip else {
            return Err(VmError::NoCode.into());
        };
        {
            let mut data = obj.borrow_mut();
            let ctx = data.generator.as_mut().ok_or(VmError::NotAGenerator)?;
            ctx.ip = ip;
            ctx.locals = self.stack.window();
            if let Some(own_slot) = ctx.locals.get_mut(ctx.self_slot) {
                *own_slot = Value::Object(None);
            }
        }
        let record = self.generator_record(false, value);
        self.stack.truncate(self.stack.base());
        self.stack.push(record)?;
        self.state.ip = InstructionPointer::AwaitingFramePop;
        Ok(())
    }

    /// Resume a generator: `[generator value] -> [result record]`.
    ///
    /// A `Return` into a suspended generator hands the value to the pending
    /// yield like `Next`, but the generator completes with that value once the
    /// body yields or returns again.
    pub(crate) fn generator_resume(&mut self, raw_kind: i32) -> Result<(), Trap> {
        let Some(kind) = ResumeKind::from_i32(raw_kind) else {
            return Err(VmError::from(DecodeError::IllegalOpcode {
                opcode: Opcode::GenResume.as_byte(),
                offset: self.instr_start,
            })
            .into());
        };
        let sent = self.stack.pop()?;
        let generator = self.stack.pop()?;
        let obj = match generator.as_object() {
            Some(obj) if obj.borrow().is_generator() => obj.clone(),
            _ => return Err(RuntimeError::bare(ErrorCode::NotAGenerator).into()),
        };
        let state = self.generator_state(&generator);
        trace!("{} resumes generator in state {:?} with {:?}", self.id, state, kind);

        match (state, kind) {
            (GeneratorState::Executing, _) => Err(VmError::GeneratorReentered.into()),
            (GeneratorState::SuspendedStart, ResumeKind::Throw | ResumeKind::Return) => {
                let result = self.empty_completion();
                self.complete_generator(&obj, result.clone());
                self.stack.push(result)?;
                Ok(())
            }
            (GeneratorState::Completed, ResumeKind::Next) => {
                let result = frozen_result(&obj);
                self.stack.push(result)?;
                Ok(())
            }
            (GeneratorState::Completed, ResumeKind::Return) => {
                let mut result = frozen_result(&obj);
                result.set_cell(self.shared.names.value, sent)?;
                self.complete_generator(&obj, result.clone());
                self.stack.push(result)?;
                Ok(())
            }
            (GeneratorState::Completed, ResumeKind::Throw) => {
                self.throw(sent, false);
                Err(Trap::Unwind)
            }
            (_, kind) => self.enter_generator(obj, state, kind, sent),
        }
    }

    fn enter_generator(
        &mut self,
        obj: ObjectRef,
        state: GeneratorState,
        kind: ResumeKind,
        sent: Value,
    ) -> Result<(), Trap> {
        let (continuation, locals) = {
            let mut data = obj.borrow_mut();
            let ctx = data.generator.as_mut().ok_or(VmError::NotAGenerator)?;
            ctx.state = GeneratorState::Executing;
            if kind == ResumeKind::Return {
                ctx.pending_return = Some(sent.clone());
            }
            let mut locals = std::mem::take(&mut ctx.locals);
            if let Some(own_slot) = locals.get_mut(ctx.self_slot) {
                *own_slot = Value::Object(Some(obj.clone()));
            }
            let continuation = ExecutionState {
                library: Some(ctx.library.clone()),
                function: ctx.function,
                ip: InstructionPointer::Code(ctx.ip),
            };
            (continuation, locals)
        };

        self.push_frame(FrameKind::Dummy)?;
        self.state.ip = InstructionPointer::AwaitingFramePop;
        let generator = obj.clone();
        self.push_frame(FrameKind::TailCall(Box::new(move |vm: &mut Vm, unwinding: bool| {
            vm.process_generator_result(&generator, unwinding)
        })))?;

        self.state = continuation;
        self.stack.enter_window(locals)?;
        match kind {
            ResumeKind::Throw => {
                self.throw(sent, false);
                Err(Trap::Unwind)
            }
            _ if state == GeneratorState::SuspendedStart => Ok(()),
            _ => {
                self.stack.push(sent)?;
                Ok(())
            }
        }
    }

    /// Settle the state after the generator body yielded, returned or threw.
    fn process_generator_result(&mut self, obj: &ObjectRef, unwinding: bool) -> Result<(), Trap> {
        if unwinding {
            let result = self.empty_completion();
            self.complete_generator(obj, result);
            return Ok(());
        }
        let pending = obj
            .borrow_mut()
            .generator
            .as_mut()
            .and_then(|ctx| ctx.pending_return.take());
        if let Some(value) = pending {
            let result = self.generator_record(true, value);
            *self.stack.peek_mut(0)? = result.clone();
            self.complete_generator(obj, result);
            return Ok(());
        }
        let done = self.stack.peek(0)?.cell(self.shared.names.done).and_then(Value::as_bool);
        match done {
            Some(true) => {
                let result = self.stack.peek(0)?.clone();
                self.complete_generator(obj, result);
            }
            Some(false) => set_state(obj, GeneratorState::SuspendedYield),
            None => {
                let result = self.empty_completion();
                *self.stack.peek_mut(0)? = result.clone();
                self.complete_generator(obj, result);
            }
        }
        Ok(())
    }

    fn complete_generator(&self, obj: &ObjectRef, result: Value) {
        if let Some(ctx) = obj.borrow_mut().generator.as_mut() {
            ctx.state = GeneratorState::Completed;
            ctx.locals.clear();
            ctx.pending_return = None;
            ctx.result = result;
        }
    }
}

fn frozen_result(obj: &ObjectRef) -> Value {
    obj.borrow()
        .generator
        .as_ref()
        .map_or(Value::Record(None), |ctx| ctx.result.clone())
}

fn set_state(obj: &ObjectRef, state: GeneratorState) {
    if let Some(ctx) = obj.borrow_mut().generator.as_mut() {
        ctx.state = state;
    }
}
