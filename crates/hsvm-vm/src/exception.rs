//! Exception raising and unwinding.
//!
//! An exception is any value; errors raised by the engine become EXCEPTION
//! objects carrying WHAT, CODE and TRACE members. While unwinding, each frame
//! with running code is checked against its library's unwind table using the
//! offset of the faulting instruction. Without a catch, the frame is popped
//! and its kind decides how unwinding continues.

use std::fmt;
use std::rc::Rc;

use hsvm_core::{SourcePosition, VariableType};
use log::{debug, trace};

use crate::error::{RuntimeError, Trap, VmError};
use crate::frame::{FrameKind, InstructionPointer};
use crate::group::WellKnownNames;
use crate::machine::Vm;
use crate::object::ObjectData;
use crate::value::Value;

/// One frame of an exception trace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceEntry {
    pub filename: String,
    /// Signature of the function.
    pub function: String,
    pub position: SourcePosition,
}

impl TraceEntry {
    /// Record form stored in an exception's TRACE array.
    pub(crate) fn to_record(&self, names: &WellKnownNames) -> Value {
        Value::record([
            (names.filename, Value::string(&self.filename)),
            (names.function, Value::string(&self.function)),
            (names.line, Value::Integer(i64::from(self.position.line))),
            (names.col, Value::Integer(i64::from(self.position.column))),
        ])
    }
}

impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.filename, self.position, self.function)
    }
}

/// Where unwinding ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum UnwindOutcome {
    /// A catch handler took the exception; execution continues there.
    Caught,
    /// A `StopExecute` anchor was reached with the exception still pending.
    Stopped,
}

impl Vm {
    /// Raise a runtime error as an EXCEPTION object.
    pub(crate) fn raise(&mut self, error: RuntimeError) {
        let names = self.shared.names;
        let mut data = ObjectData::new(Some(self.shared.exception_type.clone()));
        if let Some(what) = data.member_mut(names.what) {
            *what = Value::string(&error.to_string());
        }
        if let Some(code) = data.member_mut(names.code) {
            *code = Value::string(error.code.as_str());
        }
        debug!("{} raises {}: {}", self.id, error.code.as_str(), error);
        self.throw(Value::object(data), false);
    }

    /// Start propagating `value` as an exception.
    ///
    /// A builtin may call this and return normally; the engine discards its
    /// result and unwinds. A rethrow (`skip_current_frame`) keeps the trace
    /// collected so far and leaves the throwing frame out of it.
    pub fn throw(&mut self, value: Value, skip_current_frame: bool) {
        if !skip_current_frame {
            self.trace.clear();
            if let Some(obj) = value.as_object()
                && let Some(trace) = obj.borrow_mut().member_mut(self.shared.names.trace)
                && trace.as_array().is_some()
            {
                *trace = Value::default_for(VariableType::RecordArray);
            }
        }
        self.unwinding = true;
        self.skip_next_trace = skip_current_frame;
        self.exception = Some(value);
    }

    /// Trace of the pending (or last uncaught) exception, innermost first.
    pub fn exception_trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    fn record_trace(&mut self, entry: TraceEntry) {
        trace!("trace entry {}", entry);
        if let Some(obj) = self.exception.as_ref().and_then(Value::as_object) {
            let record = entry.to_record(&self.shared.names);
            if let Some(Value::Array(_, items)) = obj.borrow_mut().member_mut(self.shared.names.trace) {
                Rc::make_mut(items).push(record);
            }
        }
        self.trace.push(entry);
    }

    /// Unwind frames until a catch handler or an anchor is reached.
    pub(crate) fn unwind_to_next_catch(&mut self) -> Result<UnwindOutcome, VmError> {
        loop {
            if let Some(library) = self.state.library.clone()
                && let InstructionPointer::Code(ip) = self.state.ip
            {
                let fault = ip.saturating_sub(1);
                let def = library.function(self.state.function)?;
                if self.skip_next_trace {
                    self.skip_next_trace = false;
                } else if !def.skip_trace {
                    self.record_trace(TraceEntry {
                        filename: library.filename.clone(),
                        function: def.signature(),
                        position: def.position_at(fault),
                    });
                }

                if let Some(handler) = library.unwind.find(fault).copied() {
                    debug!(
                        "{} caught exception in {} at offset {}",
                        self.id, def.name, handler.target
                    );
                    self.stack.truncate(self.stack.base() + handler.stack_size);
                    let exception = self.exception.take().unwrap_or(Value::Object(None));
                    self.stack.push(exception)?;
                    self.state.ip = InstructionPointer::Code(handler.target);
                    self.unwinding = false;
                    return Ok(UnwindOutcome::Caught);
                }
            }

            if self.call_stack.is_empty() {
                return Err(self.take_uncaught());
            }
            let element = self.restore_frame()?;
            trace!("unwinding through {:?} frame", element.kind);
            match element.kind {
                FrameKind::SwitchToOtherVm(_) | FrameKind::ReturnToOtherVm { .. } => {
                    return Err(VmError::UnwindAcrossVm);
                }
                FrameKind::StopExecute => {
                    self.finish_anchor();
                    return Ok(UnwindOutcome::Stopped);
                }
                FrameKind::TailCall(callback) => match callback(self, true) {
                    Ok(()) | Err(Trap::Unwind) => {}
                    Err(Trap::Throw(error)) => self.raise(error),
                    Err(Trap::Fatal(error)) => return Err(error),
                },
                FrameKind::Return | FrameKind::Dummy | FrameKind::PopVariable => {}
            }
        }
    }

    /// Convert the pending exception into a fatal error for the host.
    pub(crate) fn take_uncaught(&mut self) -> VmError {
        self.unwinding = false;
        self.skip_next_trace = false;
        let what = self.shared.names.what;
        let (name, message) = match self.exception.take() {
            Some(Value::Object(Some(obj))) => {
                let obj = obj.borrow();
                let message = obj.member(what).and_then(Value::as_str).unwrap_or_default();
                (obj.type_name().to_string(), message.to_string())
            }
            Some(Value::String(s)) => (VariableType::String.name().to_string(), s.to_string()),
            Some(other) => (other.variable_type().name().to_string(), String::new()),
            None => ("UNKNOWN".to_string(), String::new()),
        };
        VmError::UncaughtException {
            name,
            message,
            trace: self.trace.clone(),
        }
    }
}
