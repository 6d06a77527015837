//! Value marshalling.
//!
//! Used for the constant pool, parameter defaults and for moving values between
//! VM instances during a cross-VM call. Objects are bound to their VM and cannot
//! be marshalled.
//!
//! ## Wire Format
//!
//! Each value is prefixed with a 1-byte type tag.
//!
//! | Tag | Type | Payload |
//! |-----|------|---------|
//! | 0x01 | Integer | 8 bytes (i64 LE) |
//! | 0x02 | Float | 8 bytes (f64 LE) |
//! | 0x03 | Boolean | 1 byte |
//! | 0x04 | String | u32 len + UTF-8 bytes |
//! | 0x05 | Record | u32 count + (name string + value) per cell |
//! | 0x06 | Default record | - |
//! | 0x07 | Array | element type byte + u32 count + elements |
//! | 0x08 | Function ptr | see [`write_function_ptr`] |
//! | 0x09 | Default function ptr | - |
//! | 0x0A | Default object | - |

use std::rc::Rc;

use hsvm_core::{Interner, VariableType};
use thiserror::Error;

use crate::funcptr::{FptrParam, FunctionPtr};
use crate::group::VmId;
use crate::library::LibraryId;
use crate::value::{Cells, Value};

// Type tags
const TAG_INTEGER: u8 = 0x01;
const TAG_FLOAT: u8 = 0x02;
const TAG_BOOLEAN: u8 = 0x03;
const TAG_STRING: u8 = 0x04;
const TAG_RECORD: u8 = 0x05;
const TAG_DEFAULT_RECORD: u8 = 0x06;
const TAG_ARRAY: u8 = 0x07;
const TAG_FUNCTION_PTR: u8 = 0x08;
const TAG_DEFAULT_FUNCTION_PTR: u8 = 0x09;
const TAG_DEFAULT_OBJECT: u8 = 0x0A;

/// Marker for "no vararg element type".
const NO_VARARG: u8 = 0xFF;

/// Error type for marshalling failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarshalError {
    #[error("unexpected end of marshalled data")]
    UnexpectedEnd,
    #[error("invalid type tag: 0x{0:02x}")]
    InvalidTag(u8),
    #[error("invalid variable type: 0x{0:02x}")]
    InvalidType(u8),
    #[error("invalid UTF-8 string data")]
    InvalidUtf8,
    #[error("values of type {0} cannot be marshalled")]
    NotMarshallable(&'static str),
}

/// Marshal a value into a new buffer.
pub fn marshal(value: &Value, interner: &Interner) -> Result<Vec<u8>, MarshalError> {
    let mut out = Vec::new();
    write_value(value, interner, &mut out)?;
    Ok(out)
}

/// Unmarshal a single value from the start of a buffer.
pub fn unmarshal(bytes: &[u8], interner: &mut Interner) -> Result<Value, MarshalError> {
    let mut offset = 0;
    read_value(bytes, &mut offset, interner)
}

/// Append a marshalled value to `out`.
pub fn write_value(value: &Value, interner: &Interner, out: &mut Vec<u8>) -> Result<(), MarshalError> {
    match value {
        Value::Integer(i) => {
            out.push(TAG_INTEGER);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Value::Float(f) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&f.to_le_bytes());
        }
        Value::Boolean(b) => {
            out.push(TAG_BOOLEAN);
            out.push(u8::from(*b));
        }
        Value::String(s) => {
            out.push(TAG_STRING);
            write_str(s, out);
        }
        Value::Record(None) => out.push(TAG_DEFAULT_RECORD),
        Value::Record(Some(cells)) => {
            out.push(TAG_RECORD);
            write_u32(cells.len() as u32, out);
            for (name, cell) in cells.iter() {
                write_str(interner.resolve(*name), out);
                write_value(cell, interner, out)?;
            }
        }
        Value::Array(elem, items) => {
            out.push(TAG_ARRAY);
            out.push(elem.as_byte());
            write_u32(items.len() as u32, out);
            for item in items.iter() {
                write_value(item, interner, out)?;
            }
        }
        Value::FunctionPtr(None) => out.push(TAG_DEFAULT_FUNCTION_PTR),
        Value::FunctionPtr(Some(ptr)) => {
            out.push(TAG_FUNCTION_PTR);
            write_function_ptr(ptr, interner, out)?;
        }
        Value::Object(None) => out.push(TAG_DEFAULT_OBJECT),
        Value::Object(Some(_)) => return Err(MarshalError::NotMarshallable("OBJECT")),
    }
    Ok(())
}

/// Function pointer payload: library u32, function u32, vm u32, return type u8,
/// vararg element type u8 (0xFF for none), first unused source i32, u32 parameter
/// count, then per parameter: type u8, source i32, has-value u8 and the value.
pub fn write_function_ptr(ptr: &FunctionPtr, interner: &Interner, out: &mut Vec<u8>) -> Result<(), MarshalError> {
    write_u32(ptr.library.0, out);
    write_u32(ptr.function, out);
    write_u32(ptr.vm.0, out);
    out.push(ptr.return_type.as_byte());
    out.push(ptr.vararg.map_or(NO_VARARG, VariableType::as_byte));
    out.extend_from_slice(&ptr.first_unused_source.to_le_bytes());
    write_u32(ptr.params.len() as u32, out);
    for param in &ptr.params {
        out.push(param.ty.as_byte());
        out.extend_from_slice(&param.source.to_le_bytes());
        match &param.value {
            Some(value) => {
                out.push(1);
                write_value(value, interner, out)?;
            }
            None => out.push(0),
        }
    }
    Ok(())
}

/// Read one marshalled value, advancing `offset`.
pub fn read_value(bytes: &[u8], offset: &mut usize, interner: &mut Interner) -> Result<Value, MarshalError> {
    let tag = read_u8(bytes, offset)?;
    let value = match tag {
        TAG_INTEGER => Value::Integer(i64::from_le_bytes(read_array(bytes, offset)?)),
        TAG_FLOAT => Value::Float(f64::from_le_bytes(read_array(bytes, offset)?)),
        TAG_BOOLEAN => Value::Boolean(read_u8(bytes, offset)? != 0),
        TAG_STRING => Value::String(Rc::from(read_str(bytes, offset)?)),
        TAG_DEFAULT_RECORD => Value::Record(None),
        TAG_RECORD => {
            let count = read_u32(bytes, offset)?;
            let mut cells = Cells::with_capacity(count as usize);
            for _ in 0..count {
                let name = interner.intern(read_str(bytes, offset)?);
                let cell = read_value(bytes, offset, interner)?;
                cells.insert(name, cell);
            }
            Value::Record(Some(Rc::new(cells)))
        }
        TAG_ARRAY => {
            let elem = read_type(bytes, offset)?;
            let count = read_u32(bytes, offset)?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(read_value(bytes, offset, interner)?);
            }
            Value::Array(elem, Rc::new(items))
        }
        TAG_DEFAULT_FUNCTION_PTR => Value::FunctionPtr(None),
        TAG_FUNCTION_PTR => Value::FunctionPtr(Some(Rc::new(read_function_ptr(bytes, offset, interner)?))),
        TAG_DEFAULT_OBJECT => Value::Object(None),
        other => return Err(MarshalError::InvalidTag(other)),
    };
    Ok(value)
}

fn read_function_ptr(bytes: &[u8], offset: &mut usize, interner: &mut Interner) -> Result<FunctionPtr, MarshalError> {
    let library = LibraryId(read_u32(bytes, offset)?);
    let function = read_u32(bytes, offset)?;
    let vm = VmId(read_u32(bytes, offset)?);
    let return_type = read_type(bytes, offset)?;
    let vararg = match read_u8(bytes, offset)? {
        NO_VARARG => None,
        byte => Some(VariableType::from_byte(byte).ok_or(MarshalError::InvalidType(byte))?),
    };
    let first_unused_source = i32::from_le_bytes(read_array(bytes, offset)?);
    let count = read_u32(bytes, offset)?;
    let mut params = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let ty = read_type(bytes, offset)?;
        let source = i32::from_le_bytes(read_array(bytes, offset)?);
        let value = match read_u8(bytes, offset)? {
            0 => None,
            _ => Some(read_value(bytes, offset, interner)?),
        };
        params.push(FptrParam { ty, source, value });
    }
    Ok(FunctionPtr {
        library,
        function,
        vm,
        return_type,
        vararg,
        first_unused_source,
        params,
    })
}

fn write_u32(value: u32, out: &mut Vec<u8>) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_str(s: &str, out: &mut Vec<u8>) {
    write_u32(s.len() as u32, out);
    out.extend_from_slice(s.as_bytes());
}

fn read_u8(bytes: &[u8], offset: &mut usize) -> Result<u8, MarshalError> {
    let byte = *bytes.get(*offset).ok_or(MarshalError::UnexpectedEnd)?;
    *offset += 1;
    Ok(byte)
}

fn read_array<const N: usize>(bytes: &[u8], offset: &mut usize) -> Result<[u8; N], MarshalError> {
    let end = offset.checked_add(N).ok_or(MarshalError::UnexpectedEnd)?;
    let slice = bytes.get(*offset..end).ok_or(MarshalError::UnexpectedEnd)?;
    *offset = end;
    slice.try_into().map_err(|_| MarshalError::UnexpectedEnd)
}

fn read_u32(bytes: &[u8], offset: &mut usize) -> Result<u32, MarshalError> {
    Ok(u32::from_le_bytes(read_array(bytes, offset)?))
}

fn read_type(bytes: &[u8], offset: &mut usize) -> Result<VariableType, MarshalError> {
    let byte = read_u8(bytes, offset)?;
    VariableType::from_byte(byte).ok_or(MarshalError::InvalidType(byte))
}

fn read_str<'a>(bytes: &'a [u8], offset: &mut usize) -> Result<&'a str, MarshalError> {
    let len = read_u32(bytes, offset)? as usize;
    let end = offset.checked_add(len).ok_or(MarshalError::UnexpectedEnd)?;
    let slice = bytes.get(*offset..end).ok_or(MarshalError::UnexpectedEnd)?;
    *offset = end;
    std::str::from_utf8(slice).map_err(|_| MarshalError::InvalidUtf8)
}
