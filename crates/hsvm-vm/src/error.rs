use hsvm_core::ErrorCode;
use thiserror::Error;

use crate::bytecode::DecodeError;
use crate::exception::TraceEntry;
use crate::group::VmId;
use crate::marshal::MarshalError;
use crate::signal::AbortReason;

/// Operand stack errors.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StackError {
    #[error("stack underflow")]
    Underflow,
    #[error("stack overflow")]
    Overflow,
    #[error("local variable {0} is outside the current frame")]
    LocalOutOfRange(usize),
}

/// A runtime error that a script can catch.
///
/// Raised errors are converted into exception objects and routed through the
/// unwind protocol. `relevant_function` names the function (or function pointer)
/// that was being prepared when a cast or binding failure was detected.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{}", describe(*.code, .params, .relevant_function.as_deref()))]
pub struct RuntimeError {
    pub code: ErrorCode,
    pub params: Vec<String>,
    pub relevant_function: Option<String>,
}

impl RuntimeError {
    pub fn new<I, S>(code: ErrorCode, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            code,
            params: params.into_iter().map(Into::into).collect(),
            relevant_function: None,
        }
    }

    /// Error without parameters.
    pub fn bare(code: ErrorCode) -> Self {
        Self::new(code, std::iter::empty::<String>())
    }

    /// Error raised by library code with a free-form message.
    pub fn custom(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CustomError, [message.into()])
    }

    /// Attach the signature of the function being prepared, unless one is set already.
    pub fn with_function(mut self, signature: impl Into<String>) -> Self {
        if self.relevant_function.is_none() {
            self.relevant_function = Some(signature.into());
        }
        self
    }

    /// Formatted message without the relevant-function annotation.
    pub fn message(&self) -> String {
        self.code.format(&self.params)
    }
}

fn describe(code: ErrorCode, params: &[String], function: Option<&str>) -> String {
    let message = code.format(params);
    match function {
        Some(function) => format!("{} (calling {})", message, function),
        None => message,
    }
}

/// Fatal engine errors. These are never catchable by scripts and abort the
/// enclosing host call immediately.
#[derive(Debug, Error)]
pub enum VmError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("no code is executing")]
    NoCode,

    #[error(transparent)]
    Stack(#[from] StackError),

    #[error("call stack underflow")]
    CallStackUnderflow,

    #[error("call stack depth limit of {0} exceeded")]
    CallDepthExceeded(usize),

    #[error("unknown library {0}")]
    UnknownLibrary(String),

    #[error("library {0} is already loaded")]
    DuplicateLibrary(String),

    #[error("function {function} does not exist in library {library}")]
    MissingFunction { library: String, function: String },

    #[error("constant {0} does not exist")]
    MissingConstant(u32),

    #[error("name {0} does not exist")]
    MissingName(u32),

    #[error("object fragment {0} does not exist")]
    MissingFragment(u32),

    #[error("invalid library {library}: {reason}")]
    InvalidLibrary { library: String, reason: String },

    #[error("invalid type byte 0x{0:02x}")]
    InvalidType(u8),

    #[error("external function {0} is not registered")]
    MissingBuiltin(String),

    #[error("exceptions cannot cross a VM boundary")]
    UnwindAcrossVm,

    #[error("generator is already executing")]
    GeneratorReentered,

    #[error("object is not a generator")]
    NotAGenerator,

    #[error("uncaught exception {name}: {message}")]
    UncaughtException {
        name: String,
        message: String,
        trace: Vec<TraceEntry>,
    },

    #[error("execution aborted: {0}")]
    Aborted(AbortReason),

    #[error("unknown VM {0}")]
    UnknownVm(VmId),

    #[error("no cross-VM transfer is pending for VM {0}")]
    MissingTransfer(VmId),

    #[error("cannot switch VMs inside a synchronous nested call")]
    NestedVmSwitch,

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Marshal(#[from] MarshalError),
}

/// Control-flow escape used inside the engine while executing an instruction.
#[derive(Debug)]
pub(crate) enum Trap {
    /// Raise a catchable error as an exception.
    Throw(RuntimeError),
    /// An exception is already pending; start unwinding.
    Unwind,
    /// Abort the host call.
    Fatal(VmError),
}

impl Trap {
    /// Attach a signature to a catchable error.
    pub(crate) fn with_function(self, signature: impl FnOnce() -> String) -> Self {
        match self {
            Trap::Throw(e) => Trap::Throw(e.with_function(signature())),
            other => other,
        }
    }
}

impl From<RuntimeError> for Trap {
    fn from(e: RuntimeError) -> Self {
        Trap::Throw(e)
    }
}

impl From<VmError> for Trap {
    fn from(e: VmError) -> Self {
        Trap::Fatal(e)
    }
}

impl From<StackError> for Trap {
    fn from(e: StackError) -> Self {
        Trap::Fatal(VmError::Stack(e))
    }
}

impl From<MarshalError> for Trap {
    fn from(e: MarshalError) -> Self {
        Trap::Fatal(VmError::Marshal(e))
    }
}
