//! Instruction encoding.
//!
//! # Encoding
//!
//! Every instruction is a single opcode byte followed by a fixed number of
//! little-endian `i32` immediates. Jump targets are absolute offsets into the
//! library-wide code buffer.

use thiserror::Error;

/// Bytecode opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // === Stack and locals ===
    Nop = 0x00,
    /// Push a constant from the library's constant pool. Followed by the constant index.
    LoadC = 0x01,
    /// Push an integer immediate.
    LoadI = 0x02,
    /// Push a boolean immediate (0 or 1).
    LoadB = 0x03,
    /// Push a local variable. Followed by the slot.
    LoadS = 0x04,
    /// Pop into a local variable. Followed by the slot.
    StoreS = 0x05,
    Drop = 0x06,
    Dup = 0x07,
    Swap = 0x08,

    // === Control flow ===
    /// Jump to an absolute offset.
    Jump = 0x10,
    /// Pop a boolean and jump if it is TRUE.
    JumpIfTrue = 0x11,
    /// Pop a boolean and jump if it is FALSE.
    JumpIfFalse = 0x12,
    /// Call a function of the current library. Followed by function index and argument count.
    Call = 0x13,
    /// Return from the current function, popping the result unless it returns nothing.
    Return = 0x14,

    // === Arithmetic and comparison ===
    Add = 0x20,
    Sub = 0x21,
    Mul = 0x22,
    Div = 0x23,
    Less = 0x24,
    Equal = 0x25,
    /// Concatenate two strings.
    Concat = 0x26,

    // === Records and arrays ===
    /// Push an empty record.
    RecordNew = 0x30,
    /// [record value] -> [record]. Followed by the cell name index.
    RecordSet = 0x31,
    /// [record] -> [value]. Followed by the cell name index.
    RecordGet = 0x32,
    /// Build an array from the top values. Followed by the element type and count.
    ArrayNew = 0x33,
    /// [array index] -> [element]
    ArrayGet = 0x34,

    // === Objects ===
    /// Push a new bare dynamic object.
    ObjNew = 0x40,
    /// Push a new object whose type is the given fragment. Followed by the fragment index.
    ObjNewTyped = 0x41,
    /// [object] -> []. Extend the object's type with a fragment.
    ObjExtend = 0x42,
    /// [object] -> [value]. Followed by name index and access flags.
    ObjGet = 0x43,
    /// [object value] -> []. Followed by name index and access flags.
    ObjSet = 0x44,
    /// [object value] -> []. Insert a dynamic member. Followed by name index and flags.
    ObjInsert = 0x45,
    /// [object] -> []. Delete a dynamic member. Followed by name index and flags.
    ObjDelete = 0x46,
    /// [object args...] -> [result]. Followed by name index, argument count and flags.
    ObjCall = 0x47,

    // === Function pointers ===
    /// Push a function pointer to a function of the current library.
    MakeFptr = 0x50,
    /// [fptr args...] -> [result]. Followed by argument count.
    InvokeFptr = 0x51,
    /// [fptr passthrough bound_mask bound first_unused keep_vararg] -> [fptr]
    RebindFptr = 0x52,

    // === Exceptions ===
    /// Pop a value and throw it.
    Throw = 0x60,
    /// Pop a value and throw it without adding a trace entry for the throwing frame.
    Rethrow = 0x61,

    // === Generators and async ===
    /// Turn the current call into a generator stored in the given local slot.
    /// Followed by the slot and a start flag (1 starts pre-suspended).
    GenInit = 0x70,
    /// [value] -> suspend. Followed by the slot holding the generator.
    GenYield = 0x71,
    /// [generator value] -> [result]. Followed by the resume kind (0 next, 1 throw, 2 return).
    GenResume = 0x72,
    /// Capture the current call stack as the async continuation context.
    AsyncMark = 0x73,
}

/// Access flag: the member is accessed through `this`.
pub const FLAG_VIA_THIS: i32 = 0x01;

impl Opcode {
    /// Try to decode an opcode from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        use Opcode::*;
        let op = match byte {
            0x00 => Nop,
            0x01 => LoadC,
            0x02 => LoadI,
            0x03 => LoadB,
            0x04 => LoadS,
            0x05 => StoreS,
            0x06 => Drop,
            0x07 => Dup,
            0x08 => Swap,
            0x10 => Jump,
            0x11 => JumpIfTrue,
            0x12 => JumpIfFalse,
            0x13 => Call,
            0x14 => Return,
            0x20 => Add,
            0x21 => Sub,
            0x22 => Mul,
            0x23 => Div,
            0x24 => Less,
            0x25 => Equal,
            0x26 => Concat,
            0x30 => RecordNew,
            0x31 => RecordSet,
            0x32 => RecordGet,
            0x33 => ArrayNew,
            0x34 => ArrayGet,
            0x40 => ObjNew,
            0x41 => ObjNewTyped,
            0x42 => ObjExtend,
            0x43 => ObjGet,
            0x44 => ObjSet,
            0x45 => ObjInsert,
            0x46 => ObjDelete,
            0x47 => ObjCall,
            0x50 => MakeFptr,
            0x51 => InvokeFptr,
            0x52 => RebindFptr,
            0x60 => Throw,
            0x61 => Rethrow,
            0x70 => GenInit,
            0x71 => GenYield,
            0x72 => GenResume,
            0x73 => AsyncMark,
            _ => return None,
        };
        Some(op)
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Number of `i32` immediates following the opcode byte.
    pub fn immediates(self) -> usize {
        use Opcode::*;
        match self {
            LoadC | LoadI | LoadB | LoadS | StoreS => 1,
            Jump | JumpIfTrue | JumpIfFalse => 1,
            Call => 2,
            RecordSet | RecordGet => 1,
            ArrayNew => 2,
            ObjNewTyped | ObjExtend => 1,
            ObjGet | ObjSet | ObjInsert | ObjDelete => 2,
            ObjCall => 3,
            MakeFptr | InvokeFptr => 1,
            GenInit => 2,
            GenYield | GenResume => 1,
            _ => 0,
        }
    }

    /// Whether the abort/yield signal is polled after this instruction.
    ///
    /// Calls, branches and member accesses are the only suspension points of
    /// the dispatch loop.
    pub fn is_checkpoint(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Jump | JumpIfTrue
                | JumpIfFalse
                | Call
                | Return
                | ObjGet
                | ObjSet
                | ObjInsert
                | ObjDelete
                | ObjCall
                | InvokeFptr
                | GenResume
        )
    }
}

/// A decoded instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub op: Opcode,
    pub args: [i32; 3],
}

/// Why an instruction could not be decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("illegal opcode 0x{opcode:02x} at offset {offset}")]
    IllegalOpcode { opcode: u8, offset: usize },

    #[error("unexpected end of code at offset {0}")]
    UnexpectedEnd(usize),
}

/// Decode the instruction at `offset`, returning it with the offset of the next one.
pub fn decode(code: &[u8], offset: usize) -> Result<(Instruction, usize), DecodeError> {
    let byte = *code.get(offset).ok_or(DecodeError::UnexpectedEnd(offset))?;
    let op = Opcode::from_byte(byte).ok_or(DecodeError::IllegalOpcode {
        opcode: byte,
        offset,
    })?;
    let mut next = offset + 1;
    let mut args = [0i32; 3];
    for arg in args.iter_mut().take(op.immediates()) {
        *arg = read_i32(code, &mut next).ok_or(DecodeError::UnexpectedEnd(next))?;
    }
    Ok((Instruction { op, args }, next))
}

/// Helper for reading i32 (little-endian).
pub fn read_i32(bytes: &[u8], offset: &mut usize) -> Option<i32> {
    if *offset + 4 > bytes.len() {
        return None;
    }
    let arr: [u8; 4] = bytes[*offset..*offset + 4].try_into().ok()?;
    *offset += 4;
    Some(i32::from_le_bytes(arr))
}

/// Helper for writing i32 (little-endian).
pub fn write_i32(value: i32, output: &mut Vec<u8>) {
    output.extend_from_slice(&value.to_le_bytes());
}
