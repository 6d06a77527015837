use std::cell::RefCell;
use std::rc::Rc;

use hsvm_core::{ErrorCode, NameId, VariableType};
use indexmap::IndexMap;

use crate::error::RuntimeError;
use crate::funcptr::FunctionPtr;
use crate::object::ObjectData;

/// Ordered record cells.
pub type Cells = IndexMap<NameId, Value>;

/// Shared handle to an object instance. Objects have reference semantics.
pub type ObjectRef = Rc<RefCell<ObjectData>>;

/// A value of the managed language.
///
/// Records, arrays and strings are shared copy-on-write; objects are shared by
/// reference and compare by identity.
#[derive(Clone, Debug)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    String(Rc<str>),
    /// `None` is the DEFAULT RECORD, which has no cells and cannot hold any.
    Record(Option<Rc<Cells>>),
    /// Array with its element type.
    Array(VariableType, Rc<Vec<Value>>),
    /// `None` is the DEFAULT OBJECT.
    Object(Option<ObjectRef>),
    /// `None` is the DEFAULT FUNCTION PTR.
    FunctionPtr(Option<Rc<FunctionPtr>>),
}

impl Value {
    /// Declared type matching this value.
    pub fn variable_type(&self) -> VariableType {
        match self {
            Value::Integer(_) => VariableType::Integer,
            Value::Float(_) => VariableType::Float,
            Value::Boolean(_) => VariableType::Boolean,
            Value::String(_) => VariableType::String,
            Value::Record(_) => VariableType::Record,
            Value::Array(elem, _) => elem.array_of().unwrap_or(VariableType::VariantArray),
            Value::Object(_) => VariableType::Object,
            Value::FunctionPtr(_) => VariableType::FunctionPtr,
        }
    }

    /// Default value of a declared type.
    pub fn default_for(ty: VariableType) -> Value {
        match ty {
            VariableType::Variant | VariableType::NoReturn | VariableType::Integer => {
                Value::Integer(0)
            }
            VariableType::Float => Value::Float(0.0),
            VariableType::Boolean => Value::Boolean(false),
            VariableType::String => Value::String(Rc::from("")),
            VariableType::Record => Value::Record(None),
            VariableType::Object => Value::Object(None),
            VariableType::FunctionPtr => Value::FunctionPtr(None),
            array => Value::Array(
                array.element_type().unwrap_or(VariableType::Variant),
                Rc::new(Vec::new()),
            ),
        }
    }

    pub fn string(s: &str) -> Value {
        Value::String(Rc::from(s))
    }

    pub fn array(elem: VariableType, values: Vec<Value>) -> Value {
        Value::Array(elem, Rc::new(values))
    }

    /// A record with no cells (not the DEFAULT RECORD).
    pub fn empty_record() -> Value {
        Value::Record(Some(Rc::new(Cells::new())))
    }

    pub fn record<I>(cells: I) -> Value
    where
        I: IntoIterator<Item = (NameId, Value)>,
    {
        Value::Record(Some(Rc::new(cells.into_iter().collect())))
    }

    pub fn object(data: ObjectData) -> Value {
        Value::Object(Some(Rc::new(RefCell::new(data))))
    }

    /// Convert to a declared type.
    ///
    /// VARIANT accepts anything, INTEGER widens to FLOAT and arrays convert
    /// element-wise. Everything else must match exactly.
    pub fn cast_to(self, ty: VariableType) -> Result<Value, RuntimeError> {
        let from = self.variable_type();
        if ty == VariableType::Variant || ty == from {
            return Ok(self);
        }
        match (self, ty) {
            (Value::Integer(i), VariableType::Float) => Ok(Value::Float(i as f64)),
            (Value::Array(_, items), target) if target.is_array() => {
                let elem = target.element_type().unwrap_or(VariableType::Variant);
                let cast = items
                    .iter()
                    .cloned()
                    .map(|v| v.cast_to(elem))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| cannot_convert(from, ty))?;
                Ok(Value::Array(elem, Rc::new(cast)))
            }
            _ => Err(cannot_convert(from, ty)),
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(_, items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(Some(obj)) => Some(obj),
            _ => None,
        }
    }

    pub fn as_function_ptr(&self) -> Option<&Rc<FunctionPtr>> {
        match self {
            Value::FunctionPtr(Some(ptr)) => Some(ptr),
            _ => None,
        }
    }

    /// Cell of a record value.
    pub fn cell(&self, name: NameId) -> Option<&Value> {
        match self {
            Value::Record(Some(cells)) => cells.get(&name),
            _ => None,
        }
    }

    /// Set (or add) a record cell. Writing to the DEFAULT RECORD creates a record.
    pub fn set_cell(&mut self, name: NameId, value: Value) -> Result<(), RuntimeError> {
        match self {
            Value::Record(cells) => {
                let cells = cells.get_or_insert_with(|| Rc::new(Cells::new()));
                Rc::make_mut(cells).insert(name, value);
                Ok(())
            }
            other => Err(cannot_convert(other.variable_type(), VariableType::Record)),
        }
    }

    pub fn is_default_record(&self) -> bool {
        matches!(self, Value::Record(None))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Integer(a), Value::Float(b)) | (Value::Float(b), Value::Integer(a)) => {
                *a as f64 == *b
            }
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => match (a, b) {
                (None, None) => true,
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
            (Value::Array(_, a), Value::Array(_, b)) => a == b,
            (Value::Object(a), Value::Object(b)) => match (a, b) {
                (None, None) => true,
                (Some(a), Some(b)) => Rc::ptr_eq(a, b),
                _ => false,
            },
            (Value::FunctionPtr(a), Value::FunctionPtr(b)) => a == b,
            _ => false,
        }
    }
}

pub(crate) fn cannot_convert(from: VariableType, to: VariableType) -> RuntimeError {
    RuntimeError::new(ErrorCode::CannotConvertType, [from.name(), to.name()])
}
