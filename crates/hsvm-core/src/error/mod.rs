mod code;

pub use code::ErrorCode;
