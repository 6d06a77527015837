//! Operand and local variable storage.
//!
//! One contiguous stack holds every active frame's locals followed by its
//! temporaries. `base` marks where the current frame's local window starts;
//! locals are addressed relative to it.

use smallvec::SmallVec;

use crate::error::StackError;
use crate::value::Value;

/// Argument lists are usually short.
pub type Args = SmallVec<[Value; 4]>;

/// The operand stack of one VM.
#[derive(Debug)]
pub struct StackMachine {
    values: Vec<Value>,
    base: usize,
    max_size: usize,
}

impl StackMachine {
    /// Create a stack with a maximum size limit.
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            values: Vec::new(),
            base: 0,
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Start of the current local variable window.
    pub fn base(&self) -> usize {
        self.base
    }

    pub fn set_base(&mut self, base: usize) {
        self.base = base;
    }

    /// Push a value onto the stack.
    pub fn push(&mut self, value: Value) -> Result<(), StackError> {
        if self.values.len() >= self.max_size {
            return Err(StackError::Overflow);
        }
        self.values.push(value);
        Ok(())
    }

    /// Pop a value from the stack.
    pub fn pop(&mut self) -> Result<Value, StackError> {
        self.values.pop().ok_or(StackError::Underflow)
    }

    /// Pop the top `n` values, returned in push order.
    pub fn pop_n(&mut self, n: usize) -> Result<Args, StackError> {
        if n > self.values.len() {
            return Err(StackError::Underflow);
        }
        let start = self.values.len() - n;
        Ok(self.values.drain(start..).collect())
    }

    /// Peek at a value without removing it. Depth 0 is the top of the stack.
    pub fn peek(&self, depth: usize) -> Result<&Value, StackError> {
        if depth >= self.values.len() {
            return Err(StackError::Underflow);
        }
        Ok(&self.values[self.values.len() - 1 - depth])
    }

    /// Get a mutable reference to a value on the stack.
    pub fn peek_mut(&mut self, depth: usize) -> Result<&mut Value, StackError> {
        if depth >= self.values.len() {
            return Err(StackError::Underflow);
        }
        let idx = self.values.len() - 1 - depth;
        Ok(&mut self.values[idx])
    }

    /// Read a local variable of the current frame.
    pub fn local(&self, slot: usize) -> Result<&Value, StackError> {
        self.values
            .get(self.base + slot)
            .ok_or(StackError::LocalOutOfRange(slot))
    }

    /// Overwrite a local variable of the current frame.
    pub fn set_local(&mut self, slot: usize, value: Value) -> Result<(), StackError> {
        let idx = self.base + slot;
        match self.values.get_mut(idx) {
            Some(v) => {
                *v = value;
                Ok(())
            }
            None => Err(StackError::LocalOutOfRange(slot)),
        }
    }

    /// Drop everything above `len`. Growing is a no-op.
    pub fn truncate(&mut self, len: usize) {
        self.values.truncate(len);
    }

    /// Copy of the current local window (locals plus pending temporaries).
    pub fn window(&self) -> Vec<Value> {
        self.values[self.base.min(self.values.len())..].to_vec()
    }

    /// Start a new local window on top of the stack and fill it.
    pub fn enter_window<I>(&mut self, values: I) -> Result<(), StackError>
    where
        I: IntoIterator<Item = Value>,
    {
        self.base = self.values.len();
        for value in values {
            self.push(value)?;
        }
        Ok(())
    }

    pub fn swap(&mut self) -> Result<(), StackError> {
        let len = self.values.len();
        if len < 2 {
            return Err(StackError::Underflow);
        }
        self.values.swap(len - 1, len - 2);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.base = 0;
    }
}
