use std::fmt;

/// Declared type of a variable, parameter, member or function result.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum VariableType {
    /// Accepts a value of any type.
    Variant = 0x00,
    /// Result type of functions that return nothing ("macros").
    NoReturn = 0x01,
    Integer = 0x02,
    Float = 0x03,
    Boolean = 0x04,
    String = 0x05,
    Record = 0x06,
    Object = 0x07,
    FunctionPtr = 0x08,

    VariantArray = 0x80,
    IntegerArray = 0x82,
    FloatArray = 0x83,
    BooleanArray = 0x84,
    StringArray = 0x85,
    RecordArray = 0x86,
    ObjectArray = 0x87,
    FunctionPtrArray = 0x88,
}

/// Bit set on every array type.
const ARRAY_FLAG: u8 = 0x80;

impl VariableType {
    /// Try to decode a type from its byte encoding.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Variant),
            0x01 => Some(Self::NoReturn),
            0x02 => Some(Self::Integer),
            0x03 => Some(Self::Float),
            0x04 => Some(Self::Boolean),
            0x05 => Some(Self::String),
            0x06 => Some(Self::Record),
            0x07 => Some(Self::Object),
            0x08 => Some(Self::FunctionPtr),
            0x80 => Some(Self::VariantArray),
            0x82 => Some(Self::IntegerArray),
            0x83 => Some(Self::FloatArray),
            0x84 => Some(Self::BooleanArray),
            0x85 => Some(Self::StringArray),
            0x86 => Some(Self::RecordArray),
            0x87 => Some(Self::ObjectArray),
            0x88 => Some(Self::FunctionPtrArray),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn is_array(self) -> bool {
        self.as_byte() & ARRAY_FLAG != 0
    }

    /// Element type of an array type, `None` for scalars.
    pub fn element_type(self) -> Option<Self> {
        if self.is_array() {
            Self::from_byte(self.as_byte() & !ARRAY_FLAG)
        } else {
            None
        }
    }

    /// Array type holding elements of this type, `None` for arrays and `NoReturn`.
    pub fn array_of(self) -> Option<Self> {
        if self.is_array() || self == Self::NoReturn {
            None
        } else {
            Self::from_byte(self.as_byte() | ARRAY_FLAG)
        }
    }

    /// Name as it appears in function signatures.
    pub fn name(self) -> &'static str {
        match self {
            Self::Variant => "VARIANT",
            Self::NoReturn => "MACRO",
            Self::Integer => "INTEGER",
            Self::Float => "FLOAT",
            Self::Boolean => "BOOLEAN",
            Self::String => "STRING",
            Self::Record => "RECORD",
            Self::Object => "OBJECT",
            Self::FunctionPtr => "FUNCTION PTR",
            Self::VariantArray => "VARIANT ARRAY",
            Self::IntegerArray => "INTEGER ARRAY",
            Self::FloatArray => "FLOAT ARRAY",
            Self::BooleanArray => "BOOLEAN ARRAY",
            Self::StringArray => "STRING ARRAY",
            Self::RecordArray => "RECORD ARRAY",
            Self::ObjectArray => "OBJECT ARRAY",
            Self::FunctionPtrArray => "FUNCTION PTR ARRAY",
        }
    }
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
