//! Error types for sitrep-api

use thiserror::Error;

/// Errors raised when parsing API values from text
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Value does not name a known variant
    #[error("unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}
