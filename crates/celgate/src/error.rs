//! Error taxonomy for the rule engine.
//!
//! Build-time failures (resolution, compilation, registry misuse) are
//! fatal and surface from the construction APIs. Per-request outcomes are
//! [`ValidationError`]s: expression-false and required-field failures are
//! expected results, evaluation errors are recovered into the same channel
//! so a bad rule never crashes the serving request.

use thiserror::Error;

/// Engine errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A descriptor lookup failed during resolution or validation.
    #[error("missing descriptor: {0}")]
    MissingDescriptor(String),

    /// A field carries both `type` and `child_type` resource references.
    #[error("conflicting resource reference on field '{0}': both type and child_type set")]
    ConflictingResourceReference(String),

    /// A field references a resource type with no known name pattern.
    #[error("unresolved resource type '{type_name}' referenced by field '{field}'")]
    UnknownResourceType { type_name: String, field: String },

    /// A declared type string could not be parsed.
    #[error("invalid declared type '{input}': {reason}")]
    InvalidDeclaredType { input: String, reason: String },

    /// A rule expression failed to parse, type-check, or optimize.
    #[error("compilation of program '{id}' for {descriptor} failed: {message}")]
    Compilation {
        descriptor: String,
        id: String,
        message: String,
    },

    /// A field mask named a field the message does not declare.
    #[error("unknown field '{field}' in mask for {message}")]
    UnknownMaskField { message: String, field: String },

    /// A per-request validation outcome.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A manager is already registered under this package name.
    #[error("duplicate manager registration for package '{0}'")]
    DuplicateRegistration(String),

    /// Library injection was attempted after the manager built a validator.
    #[error("library '{library}' injected after validators were built for package '{package}'")]
    LibraryAfterBuild { package: String, library: String },

    /// A package glob pattern failed to compile.
    #[error("invalid package pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// A per-request validation outcome.
///
/// Carries the failing descriptor, the program id where one applies, and
/// the caller attribute context when the failure happened under a
/// service/method evaluation. Interceptors map these to transport status
/// codes without inspecting the kind; diagnostics can.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Fully qualified name of the failing descriptor.
    pub descriptor: String,
    /// Id of the failing program, when the failure came from one.
    pub program: Option<String>,
    /// What went wrong.
    pub kind: ValidationErrorKind,
    /// Rendered caller attribute context, when one was in play.
    pub context: Option<String>,
}

/// The cause of a validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// A rule expression evaluated to false.
    ExpressionFailed,
    /// A required field has no value.
    RequiredFieldMissing,
    /// Evaluation itself failed (unset variable, bad overload, panic in a
    /// custom function). The message describes the underlying error.
    Evaluation(String),
}

impl ValidationError {
    /// A rule expression evaluated to false.
    pub fn expression_failed(descriptor: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            descriptor: descriptor.into(),
            program: Some(program.into()),
            kind: ValidationErrorKind::ExpressionFailed,
            context: None,
        }
    }

    /// A required field has no value.
    pub fn required_field(descriptor: impl Into<String>) -> Self {
        Self {
            descriptor: descriptor.into(),
            program: None,
            kind: ValidationErrorKind::RequiredFieldMissing,
            context: None,
        }
    }

    /// Evaluation of a program failed.
    pub fn evaluation(
        descriptor: impl Into<String>,
        program: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            descriptor: descriptor.into(),
            program: Some(program.into()),
            kind: ValidationErrorKind::Evaluation(message.into()),
            context: None,
        }
    }

    /// Attach the caller attribute context.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ValidationErrorKind::ExpressionFailed => {
                write!(f, "rule")?;
                if let Some(program) = &self.program {
                    write!(f, " '{}'", program)?;
                }
                write!(f, " failed for {}", self.descriptor)?;
            }
            ValidationErrorKind::RequiredFieldMissing => {
                write!(f, "required field {} is not set", self.descriptor)?;
            }
            ValidationErrorKind::Evaluation(message) => {
                write!(f, "evaluation")?;
                if let Some(program) = &self.program {
                    write!(f, " of '{}'", program)?;
                }
                write!(f, " failed for {}: {}", self.descriptor, message)?;
            }
        }
        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_descriptor() {
        let err = ValidationError::expression_failed("pkg.Msg.name", "not_empty");
        assert_eq!(err.to_string(), "rule 'not_empty' failed for pkg.Msg.name");

        let err = ValidationError::required_field("pkg.Msg.name");
        assert_eq!(err.to_string(), "required field pkg.Msg.name is not set");
    }

    #[test]
    fn context_is_appended() {
        let err = ValidationError::expression_failed("pkg.Svc.Get", "authz")
            .with_context("operation=Get protocol=grpc");
        assert!(err.to_string().ends_with("(operation=Get protocol=grpc)"));
    }

    #[test]
    fn validation_errors_convert() {
        let err: Error = ValidationError::required_field("pkg.Msg.name").into();
        assert!(matches!(err, Error::Validation(_)));
    }
}
