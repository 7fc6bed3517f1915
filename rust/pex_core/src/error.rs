//! Error types for permission resolution.

use thiserror::Error;

use crate::glob::GlobSyntaxError;
use crate::store::StoreError;
use crate::types::SubjectRef;

/// Errors that abort a whole query or write.
///
/// Per-pattern glob failures and missing ancestors are absorbed during
/// resolution and never surface here.
#[derive(Debug, Error)]
pub enum PermissionError {
    /// Inheritance loops back onto a subject still on its own ancestor chain.
    #[error("inheritance cycle detected: {}", format_cycle(.cycle))]
    CycleDetected {
        /// Subjects along the cycle, first subject repeated at the end.
        cycle: Vec<SubjectRef>,
    },

    /// The queried root subject does not exist.
    #[error("subject not found: {0}")]
    SubjectNotFound(SubjectRef),

    /// Failure reported by the persistence collaborator for the root subject.
    #[error("backend error: {0}")]
    Backend(String),

    /// No rank ladder registered under this name.
    #[error("unknown rank ladder: {0}")]
    UnknownLadder(String),

    /// A subject identifier string could not be parsed.
    #[error("invalid subject reference: {0:?}")]
    InvalidSubjectRef(String),

    /// Malformed `resolve_all` filter.
    #[error("invalid filter: {0}")]
    InvalidFilter(#[from] GlobSyntaxError),

    /// No Tokio runtime to spawn backend loads on.
    #[error("no async runtime available for backend loads")]
    NoRuntime,

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

impl From<StoreError> for PermissionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(subject) => PermissionError::SubjectNotFound(subject),
            StoreError::Backend(msg) => PermissionError::Backend(msg),
        }
    }
}

impl PermissionError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::SubjectNotFound(_))
    }
}

fn format_cycle(cycle: &[SubjectRef]) -> String {
    cycle
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Result type for resolver operations.
pub type Result<T> = std::result::Result<T, PermissionError>;
