//! Errors surfaced when an `Exit` crosses a blocking boundary.

use crate::Cause;
use thiserror::Error;

/// The failure classification of an [`crate::Exit`] converted into a plain
/// `Result`, for callers that do not want to inspect the full cause tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FiberError {
    /// The fiber failed with a typed error.
    #[error("fiber failed: {0}")]
    Failed(String),

    /// The fiber died with a defect.
    #[error("fiber died: {0}")]
    Defect(String),

    /// The fiber was interrupted.
    #[error("fiber interrupted")]
    Interrupted,
}

impl FiberError {
    /// Classify a cause: interruption-only causes map to `Interrupted`,
    /// causes containing a typed failure to `Failed`, everything else to
    /// `Defect`.
    #[must_use]
    pub fn from_cause(cause: &Cause) -> Self {
        if cause.is_interrupted_only() {
            return Self::Interrupted;
        }
        if cause.is_failure() {
            return Self::Failed(cause.to_string());
        }
        Self::Defect(cause.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Defect, FiberId};

    #[test]
    fn test_classification() {
        let id = FiberId::fresh();
        assert_eq!(
            FiberError::from_cause(&Cause::interrupt(id)),
            FiberError::Interrupted
        );
        assert!(matches!(
            FiberError::from_cause(&Cause::fail("x")),
            FiberError::Failed(_)
        ));
        assert!(matches!(
            FiberError::from_cause(&Cause::die(Defect::message("x"))),
            FiberError::Defect(_)
        ));
        // Mixed interrupt + typed failure is not "interrupted only".
        let mixed = Cause::interrupt(id).then(Cause::fail("x"));
        assert!(matches!(FiberError::from_cause(&mixed), FiberError::Failed(_)));
    }
}
