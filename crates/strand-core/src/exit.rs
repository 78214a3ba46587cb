//! Terminal fiber results.

use crate::cause::{AnyValue, Cause};
use crate::error::FiberError;
use std::fmt;
use std::sync::Arc;

/// The terminal result of a fiber.
///
/// Produced exactly once per fiber and delivered, by clone, to every
/// observer. Success payloads are erased so one `Exit` type can flow through
/// observers, finalizers, and supervisor hooks regardless of the fiber's
/// value type; typed access is by downcast.
#[derive(Clone)]
pub enum Exit {
    /// The fiber completed with a value.
    Success(AnyValue),
    /// The fiber failed with the given cause.
    Failure(Cause),
}

impl Exit {
    /// A successful exit carrying `value`.
    pub fn succeed<A>(value: A) -> Self
    where
        A: Send + Sync + 'static,
    {
        Self::Success(Arc::new(value))
    }

    /// A successful exit carrying `()`.
    #[must_use]
    pub fn unit() -> Self {
        Self::succeed(())
    }

    /// A failed exit with the given cause.
    #[must_use]
    pub fn fail_cause(cause: Cause) -> Self {
        Self::Failure(cause)
    }

    /// An exit recording interruption by `by`.
    #[must_use]
    pub fn interrupted(by: crate::FiberId) -> Self {
        Self::Failure(Cause::interrupt(by))
    }

    /// Check whether this exit is a success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Check whether this exit is a failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Check whether this exit records an interruption.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        match self {
            Self::Success(_) => false,
            Self::Failure(cause) => cause.is_interrupted(),
        }
    }

    /// The success value, downcast to `A`.
    #[must_use]
    pub fn value<A>(&self) -> Option<A>
    where
        A: Clone + Send + Sync + 'static,
    {
        match self {
            Self::Success(v) => v.downcast_ref::<A>().cloned(),
            Self::Failure(_) => None,
        }
    }

    /// The failure cause, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            Self::Success(_) => None,
            Self::Failure(cause) => Some(cause),
        }
    }

    /// Convert into a `Result`, classifying failures through
    /// [`FiberError`].
    ///
    /// A success payload that does not downcast to `A` is reported as a
    /// defect; by construction of the typed `Io` surface this does not
    /// happen.
    pub fn result<A>(&self) -> Result<A, FiberError>
    where
        A: Clone + Send + Sync + 'static,
    {
        match self {
            Self::Success(v) => v
                .downcast_ref::<A>()
                .cloned()
                .ok_or_else(|| FiberError::Defect("exit payload type mismatch".to_string())),
            Self::Failure(cause) => Err(FiberError::from_cause(cause)),
        }
    }
}

impl fmt::Debug for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success(_) => f.write_str("Exit::Success(..)"),
            Self::Failure(cause) => write!(f, "Exit::Failure({cause})"),
        }
    }
}
