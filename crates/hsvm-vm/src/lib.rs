//! hsvm execution engine
//!
//! This crate runs compiled libraries of a managed, stack-based bytecode
//! language. It is embedded by a host that loads libraries, registers
//! external functions and calls into script code.
//!
//! # Architecture
//!
//! The engine handles:
//! - The call-frame protocol: every call-like transfer pushes a frame whose
//!   kind decides what happens when it is popped, so nested calls, generators
//!   and cross-VM calls never recurse natively
//! - The dispatch loop with abort/yield checkpoints and a debug variant
//! - Object member resolution through composed vtables
//! - Function pointers with argument rebinding
//! - Generators, exceptions and async stack traces
//! - Groups of VMs that share libraries, names and one abort signal
//!
//! Values crossing from one VM to another are marshalled.
//!
//! # Example
//!
//! ```ignore
//! use hsvm_vm::{FunctionSpec, LibraryBuilder, Opcode, Value, VmConfig, VmGroup};
//! use hsvm_core::VariableType;
//!
//! let mut group = VmGroup::new(VmConfig::default());
//! let vm = group.create_vm();
//!
//! let mut lib = LibraryBuilder::new("math");
//! lib.function(
//!     FunctionSpec::new("ADD")
//!         .param("a", VariableType::Integer)
//!         .param("b", VariableType::Integer)
//!         .returns(VariableType::Integer),
//!     |c| {
//!         c.load_local(0).load_local(1).op(Opcode::Add).ret();
//!     },
//! );
//! let library = group.load_library(lib)?;
//!
//! let result = group.call(vm, &library, "ADD", vec![Value::Integer(2), Value::Integer(3)]);
//! ```

mod async_trace;
mod builder;
mod builtin;
mod bytecode;
mod config;
mod debug;
mod error;
mod exception;
mod execute;
mod frame;
mod funcptr;
mod generator;
mod group;
mod library;
mod machine;
mod marshal;
mod member;
mod object;
mod profile;
mod signal;
mod stack;
mod value;

// Re-export public types
pub use async_trace::{AsyncStackTrace, AsyncTraceEntry};
pub use builder::{CodeBuilder, FragmentSpec, FunctionSpec, Label, LibraryBuilder};
pub use builtin::{Builtin, BuiltinRegistry};
pub use bytecode::{DecodeError, FLAG_VIA_THIS, Instruction, Opcode, decode};
pub use config::{ConfigError, VmConfig};
pub use debug::{DebugEvent, DebugMode, DebugState};
pub use error::{RuntimeError, StackError, VmError};
pub use exception::TraceEntry;
pub use execute::{ExecuteOutcome, RunOptions};
pub use frame::{ExecutionState, InstructionPointer};
pub use funcptr::{FptrParam, FunctionPtr, RebindRequest, expect_function_ptr, rebind};
pub use generator::{GeneratorState, ResumeKind};
pub use group::{RunResult, VmGroup, VmId};
pub use library::{
    FragmentMember, FragmentMemberKind, FunctionBody, FunctionDef, Library, LibraryId, ObjectFragment, ParamDef,
    UnwindEntry, UnwindTable,
};
pub use machine::{SyncCall, Vm};
pub use marshal::{MarshalError, marshal, unmarshal};
pub use object::{EntryKind, MethodRef, ObjectData, ObjectTypeDef, VTableEntry};
pub use profile::{FunctionProfile, ProfileData};
pub use signal::{AbortReason, AbortSignal};
pub use stack::Args;
pub use value::{Cells, ObjectRef, Value};
