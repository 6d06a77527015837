use thiserror::Error;

/// Codes of the runtime errors a script can catch.
///
/// Each code has a message template where `%0`, `%1`, ... are replaced by the
/// parameters carried by the raised error.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Error)]
pub enum ErrorCode {
    // Values and conversions
    #[error("cannot convert type")]
    CannotConvertType,
    #[error("index out of range")]
    IndexOutOfRange,
    #[error("missing record cell")]
    RecordCellMissing,
    #[error("division by zero")]
    DivisionByZero,

    // Object members
    #[error("unknown member")]
    MemberNotFound,
    #[error("private member access")]
    PrivateMemberAccess,
    #[error("method used as value")]
    MethodNotValue,
    #[error("read-only property")]
    ReadOnlyProperty,
    #[error("write-only property")]
    WriteOnlyProperty,
    #[error("not an object")]
    NotAnObject,
    #[error("insert into static object")]
    StaticObjectInsert,
    #[error("delete from static object")]
    StaticObjectDelete,
    #[error("delete of type member")]
    TypeMemberDelete,

    // Type extension
    #[error("member already exists")]
    MemberAlreadyExists,
    #[error("no member to update")]
    NoMemberToUpdate,
    #[error("incompatible override")]
    IncompatibleOverride,
    #[error("invalid property target")]
    PropertyTargetMissing,

    // Calls and function pointers
    #[error("not a function pointer")]
    NotAFunctionPtr,
    #[error("unbound function pointer")]
    UnboundFunctionPtr,
    #[error("too many arguments")]
    TooManyArguments,
    #[error("too few arguments")]
    TooFewArguments,
    #[error("parameter not bound")]
    ParameterNotBound,
    #[error("invalid parameter order")]
    RebindOrdering,
    #[error("optional parameter without default")]
    RebindNoDefault,

    // Generators
    #[error("not a generator")]
    NotAGenerator,

    /// Error raised by library code with a free-form message.
    #[error("custom error")]
    CustomError,
}

impl ErrorCode {
    /// Get the error code as a stable string, used in exception objects.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::CannotConvertType => "CANNOTCONVERTTYPE",
            ErrorCode::IndexOutOfRange => "INDEXOUTOFRANGE",
            ErrorCode::RecordCellMissing => "RECORDCELLMISSING",
            ErrorCode::DivisionByZero => "DIVISIONBYZERO",
            ErrorCode::MemberNotFound => "MEMBERNOTFOUND",
            ErrorCode::PrivateMemberAccess => "PRIVATEMEMBERACCESS",
            ErrorCode::MethodNotValue => "METHODNOTVALUE",
            ErrorCode::ReadOnlyProperty => "READONLYPROPERTY",
            ErrorCode::WriteOnlyProperty => "WRITEONLYPROPERTY",
            ErrorCode::NotAnObject => "NOTANOBJECT",
            ErrorCode::StaticObjectInsert => "STATICOBJECTINSERT",
            ErrorCode::StaticObjectDelete => "STATICOBJECTDELETE",
            ErrorCode::TypeMemberDelete => "TYPEMEMBERDELETE",
            ErrorCode::MemberAlreadyExists => "MEMBERALREADYEXISTS",
            ErrorCode::NoMemberToUpdate => "NOMEMBERTOUPDATE",
            ErrorCode::IncompatibleOverride => "INCOMPATIBLEOVERRIDE",
            ErrorCode::PropertyTargetMissing => "PROPERTYTARGETMISSING",
            ErrorCode::NotAFunctionPtr => "NOTAFUNCTIONPTR",
            ErrorCode::UnboundFunctionPtr => "UNBOUNDFUNCTIONPTR",
            ErrorCode::TooManyArguments => "TOOMANYARGUMENTS",
            ErrorCode::TooFewArguments => "TOOFEWARGUMENTS",
            ErrorCode::ParameterNotBound => "PARAMETERNOTBOUND",
            ErrorCode::RebindOrdering => "REBINDORDERING",
            ErrorCode::RebindNoDefault => "REBINDNODEFAULT",
            ErrorCode::NotAGenerator => "NOTAGENERATOR",
            ErrorCode::CustomError => "CUSTOMERROR",
        }
    }

    /// Message template with `%N` parameter placeholders.
    pub fn template(self) -> &'static str {
        match self {
            ErrorCode::CannotConvertType => "Cannot convert a value of type %0 to %1",
            ErrorCode::IndexOutOfRange => "Index %0 is out of range for an array of %1 elements",
            ErrorCode::RecordCellMissing => "Record has no cell named %0",
            ErrorCode::DivisionByZero => "Division by zero",
            ErrorCode::MemberNotFound => "Object has no member named %0",
            ErrorCode::PrivateMemberAccess => "Member %0 is private",
            ErrorCode::MethodNotValue => "Method %0 cannot be used as a value",
            ErrorCode::ReadOnlyProperty => "Property %0 is read-only",
            ErrorCode::WriteOnlyProperty => "Property %0 is write-only",
            ErrorCode::NotAnObject => "A value of type %0 is not an object",
            ErrorCode::StaticObjectInsert => "Cannot insert member %0 into a static object",
            ErrorCode::StaticObjectDelete => "Cannot delete member %0 from a static object",
            ErrorCode::TypeMemberDelete => "Cannot delete member %0, it is defined by the object type",
            ErrorCode::MemberAlreadyExists => "Member %0 already exists",
            ErrorCode::NoMemberToUpdate => "Member %0 is marked as an update but does not exist",
            ErrorCode::IncompatibleOverride => "Incompatible override of member %0: %1",
            ErrorCode::PropertyTargetMissing => "Property %0 refers to %1, which is not a member or method",
            ErrorCode::NotAFunctionPtr => "A value of type %0 is not a function pointer",
            ErrorCode::UnboundFunctionPtr => "Cannot call a default function pointer",
            ErrorCode::TooManyArguments => "Too many arguments: at most %0 expected, got %1",
            ErrorCode::TooFewArguments => "Too few arguments: argument %0 is required",
            ErrorCode::ParameterNotBound => "Parameter %0 is neither passed through nor bound",
            ErrorCode::RebindOrdering => "Parameter %0 cannot follow an optional parameter",
            ErrorCode::RebindNoDefault => "Optional parameter %0 has no default value",
            ErrorCode::NotAGenerator => "Object is not a generator",
            ErrorCode::CustomError => "%0",
        }
    }

    /// Substitute `params` into the message template.
    pub fn format(self, params: &[String]) -> String {
        let template = self.template();
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '%'
                && let Some(digit) = chars.peek().and_then(|d| d.to_digit(10))
            {
                chars.next();
                if let Some(param) = params.get(digit as usize) {
                    out.push_str(param);
                }
                continue;
            }
            out.push(c);
        }
        out
    }
}
