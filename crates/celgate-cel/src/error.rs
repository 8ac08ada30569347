//! Error types for checking and evaluation.

use thiserror::Error;

/// Type-check errors.
///
/// Checking accumulates every error it finds rather than stopping at the
/// first, so callers report all problems in an expression at once.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckError {
    #[error("undeclared reference to '{0}'")]
    UndeclaredReference(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("undefined field '{field}' on message {message}")]
    UndefinedField { message: String, field: String },

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("no matching overload for '{function}' applied to ({args})")]
    NoMatchingOverload { function: String, args: String },

    #[error("expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("type '{0}' does not support field selection")]
    NotSelectable(String),

    #[error("type '{0}' cannot be iterated")]
    NotIterable(String),
}

/// Evaluation errors.
///
/// These propagate through evaluation as error values and only become
/// `Result` errors at the program boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("no such field '{field}' on {type_name}")]
    NoSuchField { type_name: String, field: String },

    #[error("no such key '{0}'")]
    NoSuchKey(String),

    #[error("index {index} out of range, length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("no matching overload for '{function}'")]
    NoMatchingOverload { function: String },

    #[error("division by zero")]
    DivisionByZero,

    #[error("integer overflow")]
    IntegerOverflow,

    #[error("invalid regular expression: {0}")]
    InvalidRegex(String),

    #[error("invalid map key: {0}")]
    InvalidMapKey(String),

    #[error("{0}")]
    TypeMismatch(String),

    #[error("{0}")]
    Message(String),
}
