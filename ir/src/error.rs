use alloc::string::String;

use crate::NotApplicable;

/// A fatal error which aborts the compilation of the current method.
///
/// Transformations which merely cannot prove an opportunity do not produce an error; they
/// report that nothing changed.
#[derive(Debug, thiserror::Error)]
pub enum CompilationError {
    #[error("phase '{phase}' cannot be applied: {reason}")]
    PhaseNotApplicable {
        phase: &'static str,
        reason: NotApplicable,
    },
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
    #[error("precondition of {transformation} violated: {reason}")]
    PreconditionViolated {
        transformation: &'static str,
        reason: String,
    },
    #[error("phase '{phase}' did not reach a fixed point after {iterations} iterations")]
    FixpointNotReached {
        phase: &'static str,
        iterations: usize,
    },
}

impl CompilationError {
    pub fn precondition(transformation: &'static str, reason: impl Into<String>) -> Self {
        Self::PreconditionViolated {
            transformation,
            reason: reason.into(),
        }
    }
}
