//! Error types for iubus core.

use thiserror::Error;

/// Errors raised by the pure data layer.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),

    /// A wire frame or payload item carried a variant this build does not know.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// A payload path was navigated against an incompatible shape.
    #[error("addressing error: {0}")]
    AddressingError(String),

    /// A scalar could not be coerced to the requested type.
    #[error("type conversion error: cannot convert {value} to {target}")]
    TypeConversion { value: String, target: &'static str },
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
