//! Core types for the hsvm execution engine.
//!
//! This crate provides the foundational types shared by the engine and its hosts:
//! - Case-insensitive name interning
//! - Variable types of the managed language
//! - Source positions for exception traces
//! - Catchable runtime error codes

pub mod core;
pub mod error;

pub use core::{Interner, NameId, SourcePosition, VariableType};
pub use error::ErrorCode;
