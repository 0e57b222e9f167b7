//! Errors raised by campaign data itself.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// A deterministic failure: retrying the same input fails the same way.
///
/// Storage and transport failures live in the infra layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Bad job input, or an audience with nobody in it.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// No template for a requested name, or a body that fails to render.
    #[error("template error: {0}")]
    Template(String),

    #[error("malformed csv: {0}")]
    MalformedCsv(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    pub fn malformed_csv(msg: impl Into<String>) -> Self {
        Self::MalformedCsv(msg.into())
    }
}
