mod intern;
mod position;
mod types;

pub use intern::{Interner, NameId};
pub use position::SourcePosition;
pub use types::VariableType;
