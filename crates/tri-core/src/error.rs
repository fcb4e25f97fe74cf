//! Error types for the triangular solve.
//!
//! Only argument validation is reported as a recoverable error; everything
//! that goes wrong once the solve is in flight (malformed message headers,
//! more messages than the communication plan predicted) indicates a corrupt
//! setup and aborts the process via `panic!`. There is no retry path.

use thiserror::Error;

/// Result type alias for solver operations.
pub type Result<T> = std::result::Result<T, SolveError>;

/// Errors reported at the solve boundary.
#[derive(Debug, Error)]
pub enum SolveError {
    /// An argument of the solve entry point failed validation.
    ///
    /// `index` is the 1-based position of the offending argument, matching
    /// the classic `info = -k` convention of dense solver interfaces.
    #[error("argument {index} ({name}) is invalid: {reason}")]
    InvalidArgument {
        /// 1-based argument position.
        index: usize,
        /// Argument name for diagnostics.
        name: &'static str,
        /// Why validation failed.
        reason: String,
    },

    /// A diagonal block turned out to be numerically singular during
    /// explicit inversion. The factorization upstream is expected to have
    /// caught this; surfacing it here means the factor bundle is unusable.
    #[error("singular diagonal block {block}: zero pivot at position {pivot}")]
    SingularDiagonal {
        /// Global supernode id of the offending block.
        block: usize,
        /// Position of the zero pivot within the block.
        pivot: usize,
    },
}

impl SolveError {
    /// The `info` code this error maps to at a C-style boundary:
    /// `-k` for an invalid k-th argument, positive for numeric faults.
    pub fn info(&self) -> i64 {
        match self {
            SolveError::InvalidArgument { index, .. } => -(*index as i64),
            SolveError::SingularDiagonal { block, .. } => *block as i64 + 1,
        }
    }

    pub(crate) fn invalid(index: usize, name: &'static str, reason: impl Into<String>) -> Self {
        SolveError::InvalidArgument {
            index,
            name,
            reason: reason.into(),
        }
    }
}
