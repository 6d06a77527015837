//! The dispatch loop.
//!
//! The loop is iterative: calls push frames and move the instruction pointer,
//! returns set it to [`InstructionPointer::AwaitingFramePop`] and the loop
//! pops the frame. After checkpoint instructions the shared abort/yield signal
//! is polled; a suspendable run returns to the host with all state intact.

use std::rc::Rc;

use hsvm_core::{ErrorCode, VariableType};
use log::{debug, trace};

use crate::bytecode::{FLAG_VIA_THIS, Instruction, Opcode, decode};
use crate::debug::{DebugEvent, DebugState};
use crate::error::{RuntimeError, StackError, Trap, VmError};
use crate::exception::UnwindOutcome;
use crate::frame::{FrameAction, FrameKind, InstructionPointer};
use crate::funcptr::{RebindRequest, expect_function_ptr};
use crate::group::VmId;
use crate::library::Library;
use crate::machine::{SyncCall, Vm};
use crate::marshal::unmarshal;
use crate::object::{ObjectData, ObjectTypeDef};
use crate::signal::AbortReason;
use crate::stack::Args;
use crate::value::{Value, cannot_convert};

/// How a host call runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Return to the host when the abort/yield signal is set, instead of
    /// failing (or ignoring a yield).
    pub suspendable: bool,
    /// Run library deinitializers once the call stack empties.
    pub run_deinit: bool,
}

/// Outcome of a dispatch loop run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// The host call finished.
    Completed,
    /// The signal was observed; run again to continue.
    Suspended(AbortReason),
    /// Control moves to another VM of the group.
    SwitchVm(VmId),
    /// Execution paused due to a debug event.
    Debug(DebugEvent),
}

impl Vm {
    /// Run the pending host call.
    ///
    /// On a fatal error (including an uncaught exception) the VM is reset.
    pub fn execute(&mut self, options: RunOptions) -> Result<ExecuteOutcome, VmError> {
        let outcome = self.run_loop(options, None);
        self.complete(options, outcome)
    }

    /// Like [`Vm::execute`], checking breakpoints and recording coverage.
    pub fn execute_debug(&mut self, options: RunOptions, debug: &mut DebugState) -> Result<ExecuteOutcome, VmError> {
        let outcome = self.run_loop(options, Some(debug));
        self.complete(options, outcome)
    }

    fn complete(
        &mut self,
        options: RunOptions,
        outcome: Result<ExecuteOutcome, VmError>,
    ) -> Result<ExecuteOutcome, VmError> {
        match outcome {
            Ok(ExecuteOutcome::Completed) => {
                if self.unwinding {
                    let error = self.take_uncaught();
                    self.reset();
                    return Err(error);
                }
                if options.run_deinit
                    && self.call_stack.is_empty()
                    && let Err(error) = self.run_deinitializers()
                {
                    self.reset();
                    return Err(error);
                }
                Ok(ExecuteOutcome::Completed)
            }
            Ok(other) => Ok(other),
            Err(error) => {
                debug!("{} aborted: {}", self.id, error);
                self.reset();
                Err(error)
            }
        }
    }

    /// Run every library's deinitializer once, newest library first.
    fn run_deinitializers(&mut self) -> Result<(), VmError> {
        if self.deinit_done {
            return Ok(());
        }
        self.deinit_done = true;
        let saved = self.stop_result.take();
        let pending: Vec<(Rc<Library>, u32)> = self
            .shared
            .libraries
            .borrow()
            .iter()
            .rev()
            .filter_map(|library| library.deinit.map(|f| (library.clone(), f)))
            .collect();

        for (library, function) in pending {
            debug!("running deinitializer of {}", library.name);
            let call = self.run_nested(move |vm| vm.enter_function(&library, function, Args::new(), FrameKind::Return))?;
            match call {
                SyncCall::Returned(_) => {}
                SyncCall::Unwinding => return Err(self.take_uncaught()),
                SyncCall::Aborted => return Err(self.take_pending_error().unwrap_or(VmError::NoCode)),
            }
        }
        self.stop_result = saved;
        Ok(())
    }

    /// Route a trap. Returns whether unwinding stopped at an anchor.
    pub(crate) fn handle_trap(&mut self, trap: Trap) -> Result<bool, VmError> {
        match trap {
            Trap::Fatal(error) => Err(error),
            Trap::Throw(error) => {
                self.raise(error);
                Ok(self.unwind_to_next_catch()? == UnwindOutcome::Stopped)
            }
            Trap::Unwind => Ok(self.unwind_to_next_catch()? == UnwindOutcome::Stopped),
        }
    }

    pub(crate) fn run_loop(
        &mut self,
        options: RunOptions,
        mut debug: Option<&mut DebugState>,
    ) -> Result<ExecuteOutcome, VmError> {
        loop {
            let InstructionPointer::Code(ip) = self.state.ip else {
                if self.call_stack.is_empty() {
                    return Ok(ExecuteOutcome::Completed);
                }
                match self.pop_frame() {
                    Ok(FrameAction::Continue) => {}
                    Ok(FrameAction::Stop) => return Ok(ExecuteOutcome::Completed),
                    Ok(FrameAction::SwitchVm(target)) => return Ok(ExecuteOutcome::SwitchVm(target)),
                    Err(trap) => {
                        if self.handle_trap(trap)? {
                            return Ok(ExecuteOutcome::Completed);
                        }
                    }
                }
                continue;
            };

            let library = self.current_library()?;
            if let Some(ref mut dbg) = debug
                && let Some(event) = dbg.check(library.id, ip, self.call_stack.len())
            {
                return Ok(ExecuteOutcome::Debug(event));
            }

            let (instr, next) = decode(&library.code, ip)?;
            self.instr_start = ip;
            self.state.ip = InstructionPointer::Code(next);
            let result = self.step(&library, instr);

            if let Some(ref mut dbg) = debug {
                dbg.mark_executed(library.id, ip);
            }
            if let Err(trap) = result
                && self.handle_trap(trap)?
            {
                return Ok(ExecuteOutcome::Completed);
            }

            if instr.op.is_checkpoint()
                && let Some(reason) = self.shared.signal.get()
            {
                if options.suspendable {
                    debug!("{} suspends at offset {}: {}", self.id, ip, reason);
                    return Ok(ExecuteOutcome::Suspended(reason));
                }
                if reason != AbortReason::Yield {
                    return Err(VmError::Aborted(reason));
                }
                trace!("{} ignores yield in a non-suspendable run", self.id);
            }
        }
    }

    fn step(&mut self, library: &Rc<Library>, instr: Instruction) -> Result<(), Trap> {
        let [a, b, c] = instr.args;
        match instr.op {
            Opcode::Nop => {}
            Opcode::LoadC => {
                let value = unmarshal(library.constant(a)?, &mut self.shared.interner.borrow_mut())?;
                self.stack.push(value)?;
            }
            Opcode::LoadI => self.stack.push(Value::Integer(i64::from(a)))?,
            Opcode::LoadB => self.stack.push(Value::Boolean(a != 0))?,
            Opcode::LoadS => {
                let value = self.stack.local(slot(a)?)?.clone();
                self.stack.push(value)?;
            }
            Opcode::StoreS => {
                let value = self.stack.pop()?;
                self.stack.set_local(slot(a)?, value)?;
            }
            Opcode::Drop => {
                self.stack.pop()?;
            }
            Opcode::Dup => {
                let value = self.stack.peek(0)?.clone();
                self.stack.push(value)?;
            }
            Opcode::Swap => self.stack.swap()?,

            Opcode::Jump => self.jump(a),
            Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                let cond = self.pop_bool()?;
                if cond == (instr.op == Opcode::JumpIfTrue) {
                    self.jump(a);
                }
            }
            Opcode::Call => {
                let args = self.stack.pop_n(count(b))?;
                self.enter_function(library, a as u32, args, FrameKind::Return)?;
            }
            Opcode::Return => self.return_from_function(library)?,

            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
                let rhs = self.stack.pop()?;
                let lhs = self.stack.pop()?;
                self.stack.push(arithmetic(instr.op, lhs, rhs)?)?;
            }
            Opcode::Less => {
                let rhs = self.stack.pop()?;
                let lhs = self.stack.pop()?;
                self.stack.push(Value::Boolean(less(&lhs, &rhs)?))?;
            }
            Opcode::Equal => {
                let rhs = self.stack.pop()?;
                let lhs = self.stack.pop()?;
                self.stack.push(Value::Boolean(lhs == rhs))?;
            }
            Opcode::Concat => {
                let rhs = self.stack.pop()?;
                let lhs = self.stack.pop()?;
                let joined = match (&lhs, &rhs) {
                    (Value::String(l), Value::String(r)) => format!("{}{}", l, r),
                    (Value::String(_), other) | (other, _) => {
                        return Err(cannot_convert(other.variable_type(), VariableType::String).into());
                    }
                };
                self.stack.push(Value::string(&joined))?;
            }

            Opcode::RecordNew => self.stack.push(Value::empty_record())?,
            Opcode::RecordSet => {
                let name = library.name_id(a)?;
                let value = self.stack.pop()?;
                let mut record = self.stack.pop()?;
                record.set_cell(name, value)?;
                self.stack.push(record)?;
            }
            Opcode::RecordGet => {
                let name = library.name_id(a)?;
                let record = self.stack.pop()?;
                if !matches!(record, Value::Record(_)) {
                    return Err(cannot_convert(record.variable_type(), VariableType::Record).into());
                }
                let Some(value) = record.cell(name) else {
                    return Err(RuntimeError::new(ErrorCode::RecordCellMissing, [self.shared.name(name)]).into());
                };
                self.stack.push(value.clone())?;
            }
            Opcode::ArrayNew => {
                let elem = VariableType::from_byte(a as u8).ok_or(VmError::InvalidType(a as u8))?;
                let items = self
                    .stack
                    .pop_n(count(b))?
                    .into_iter()
                    .map(|item| item.cast_to(elem))
                    .collect::<Result<Vec<_>, _>>()?;
                self.stack.push(Value::array(elem, items))?;
            }
            Opcode::ArrayGet => {
                let index = self.pop_integer()?;
                let array = self.stack.pop()?;
                let Some(items) = array.as_array() else {
                    return Err(cannot_convert(array.variable_type(), VariableType::VariantArray).into());
                };
                let item = usize::try_from(index).ok().and_then(|i| items.get(i)).cloned();
                let Some(item) = item else {
                    return Err(RuntimeError::new(
                        ErrorCode::IndexOutOfRange,
                        [index.to_string(), items.len().to_string()],
                    )
                    .into());
                };
                self.stack.push(item)?;
            }

            Opcode::ObjNew => self.stack.push(Value::object(ObjectData::new(None)))?,
            Opcode::ObjNewTyped => {
                let type_def = self.extend_type(None, library, a)?;
                self.stack.push(Value::object(ObjectData::new(Some(type_def))))?;
            }
            Opcode::ObjExtend => {
                let object = self.stack.pop()?;
                let Some(obj) = object.as_object() else {
                    return Err(RuntimeError::new(ErrorCode::NotAnObject, [object.variable_type().name()]).into());
                };
                let base = obj.borrow().type_def().cloned();
                let type_def = self.extend_type(base.as_ref(), library, a)?;
                obj.borrow_mut().set_type(Some(type_def));
            }
            Opcode::ObjGet => {
                let name = library.name_id(a)?;
                let object = self.stack.pop()?;
                self.push_member(&object, name, via_this(b))?;
            }
            Opcode::ObjSet => {
                let name = library.name_id(a)?;
                let value = self.stack.pop()?;
                let object = self.stack.pop()?;
                self.set_member(&object, name, value, via_this(b))?;
            }
            Opcode::ObjInsert => {
                let name = library.name_id(a)?;
                let value = self.stack.pop()?;
                let object = self.stack.pop()?;
                self.insert_member(&object, name, value)?;
            }
            Opcode::ObjDelete => {
                let name = library.name_id(a)?;
                let object = self.stack.pop()?;
                self.delete_member(&object, name)?;
            }
            Opcode::ObjCall => {
                let name = library.name_id(a)?;
                let args = self.stack.pop_n(count(b))?;
                let object = self.stack.pop()?;
                self.call_member(&object, name, args, via_this(c))?;
            }

            Opcode::MakeFptr => {
                let ptr = self.make_function_ptr(library, a as u32)?;
                self.stack.push(Value::FunctionPtr(Some(Rc::new(ptr))))?;
            }
            Opcode::InvokeFptr => {
                let args = self.stack.pop_n(count(a))?;
                let target = self.stack.pop()?;
                let ptr = expect_function_ptr(&target)?;
                self.invoke_ptr(&ptr, args)?;
            }
            Opcode::RebindFptr => self.rebind_from_stack()?,

            Opcode::Throw | Opcode::Rethrow => {
                let value = self.stack.pop()?;
                self.throw(value, instr.op == Opcode::Rethrow);
                return Err(Trap::Unwind);
            }

            Opcode::GenInit => self.generator_init(slot(a)?, b != 0)?,
            Opcode::GenYield => self.generator_yield(slot(a)?)?,
            Opcode::GenResume => self.generator_resume(a)?,
            Opcode::AsyncMark => {
                let segment = self.capture_async_trace();
                trace!("{} async segment at depth {}", self.id, segment.depth());
                self.async_context = Some(segment);
            }
        }
        Ok(())
    }

    fn jump(&mut self, target: i32) {
        self.state.ip = InstructionPointer::Code(target as usize);
    }

    fn pop_bool(&mut self) -> Result<bool, Trap> {
        let value = self.stack.pop()?;
        value
            .as_bool()
            .ok_or_else(|| cannot_convert(value.variable_type(), VariableType::Boolean).into())
    }

    fn pop_integer(&mut self) -> Result<i64, Trap> {
        let value = self.stack.pop()?;
        value
            .as_integer()
            .ok_or_else(|| cannot_convert(value.variable_type(), VariableType::Integer).into())
    }

    fn return_from_function(&mut self, library: &Rc<Library>) -> Result<(), Trap> {
        let def = library.function(self.state.function)?;
        let result = if def.generator {
            let value = self.stack.pop()?;
            Some(self.generator_return(value))
        } else if def.return_type == VariableType::NoReturn {
            None
        } else {
            let value = self.stack.pop()?;
            Some(
                value
                    .cast_to(def.return_type)
                    .map_err(|e| e.with_function(def.signature()))?,
            )
        };
        self.stack.truncate(self.stack.base());
        if let Some(value) = result {
            self.stack.push(value)?;
        }
        self.state.ip = InstructionPointer::AwaitingFramePop;
        Ok(())
    }

    fn extend_type(
        &self,
        base: Option<&Rc<ObjectTypeDef>>,
        library: &Rc<Library>,
        fragment: i32,
    ) -> Result<Rc<ObjectTypeDef>, Trap> {
        library.fragment(fragment)?;
        let interner = self.shared.interner.borrow();
        let type_def = self
            .shared
            .types
            .borrow_mut()
            .extend(base, library, fragment as u32, &interner)?;
        Ok(type_def)
    }

    /// `[fptr passthrough bound_mask bound first_unused keep_vararg] -> [fptr]`
    fn rebind_from_stack(&mut self) -> Result<(), Trap> {
        let keep_vararg = self.pop_bool()?;
        let first_unused = self.pop_integer()?;
        let bound = self.stack.pop()?;
        let mask = self.stack.pop()?;
        let passthrough = self.stack.pop()?;
        let target = self.stack.pop()?;
        let ptr = expect_function_ptr(&target)?;

        let request = rebind_request(&passthrough, &mask, &bound, first_unused, keep_vararg)
            .map_err(|e| e.with_function(self.signature_of(&ptr)))?;
        let rebound = self.rebind(&ptr, &request)?;
        self.stack.push(Value::FunctionPtr(Some(Rc::new(rebound))))?;
        Ok(())
    }
}

/// Decode the rebind tables popped by `RebindFptr`.
fn rebind_request(
    passthrough: &Value,
    mask: &Value,
    bound: &Value,
    first_unused: i64,
    keep_vararg: bool,
) -> Result<RebindRequest, RuntimeError> {
    let passthrough = passthrough
        .as_array()
        .unwrap_or_default()
        .iter()
        .map(|v| match v.as_integer() {
            Some(source) => source_position(source),
            None => Err(cannot_convert(v.variable_type(), VariableType::Integer)),
        })
        .collect::<Result<Vec<_>, _>>()?;
    let bound_values = bound.as_array().unwrap_or_default();
    let bound = mask
        .as_array()
        .unwrap_or_default()
        .iter()
        .enumerate()
        .map(|(i, flag)| match flag.as_bool() {
            Some(true) => bound_values.get(i).cloned(),
            _ => None,
        })
        .collect();
    let first_unused_source = match first_unused {
        n if n > 0 => Some(source_position(n)?),
        _ => None,
    };
    Ok(RebindRequest {
        passthrough,
        bound,
        first_unused_source,
        keep_vararg,
    })
}

/// Narrow a source operand to a caller position.
fn source_position(raw: i64) -> Result<i32, RuntimeError> {
    i32::try_from(raw).map_err(|_| {
        RuntimeError::new(
            ErrorCode::TooManyArguments,
            [(i32::MAX - 1).to_string(), raw.to_string()],
        )
    })
}

fn slot(raw: i32) -> Result<usize, StackError> {
    usize::try_from(raw).map_err(|_| StackError::LocalOutOfRange(raw.unsigned_abs() as usize))
}

fn count(raw: i32) -> usize {
    usize::try_from(raw).unwrap_or(0)
}

fn via_this(flags: i32) -> bool {
    flags & FLAG_VIA_THIS != 0
}

fn arithmetic(op: Opcode, lhs: Value, rhs: Value) -> Result<Value, RuntimeError> {
    match (&lhs, &rhs) {
        (Value::Integer(l), Value::Integer(r)) => {
            let (l, r) = (*l, *r);
            let value = match op {
                Opcode::Add => l.wrapping_add(r),
                Opcode::Sub => l.wrapping_sub(r),
                Opcode::Mul => l.wrapping_mul(r),
                _ if r == 0 => return Err(RuntimeError::bare(ErrorCode::DivisionByZero)),
                _ => l.wrapping_div(r),
            };
            Ok(Value::Integer(value))
        }
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
            let (l, r) = (as_float(&lhs), as_float(&rhs));
            let value = match op {
                Opcode::Add => l + r,
                Opcode::Sub => l - r,
                Opcode::Mul => l * r,
                _ if r == 0.0 => return Err(RuntimeError::bare(ErrorCode::DivisionByZero)),
                _ => l / r,
            };
            Ok(Value::Float(value))
        }
        (Value::Integer(_) | Value::Float(_), other) => {
            Err(cannot_convert(other.variable_type(), lhs.variable_type()))
        }
        (other, _) => Err(cannot_convert(other.variable_type(), VariableType::Float)),
    }
}

fn as_float(value: &Value) -> f64 {
    match value {
        Value::Integer(i) => *i as f64,
        Value::Float(f) => *f,
        _ => 0.0,
    }
}

fn less(lhs: &Value, rhs: &Value) -> Result<bool, RuntimeError> {
    match (lhs, rhs) {
        (Value::Integer(l), Value::Integer(r)) => Ok(l < r),
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
            Ok(as_float(lhs) < as_float(rhs))
        }
        (Value::String(l), Value::String(r)) => Ok(l < r),
        _ => Err(cannot_convert(rhs.variable_type(), lhs.variable_type())),
    }
}
