//! Fiber lifecycle status.

use crate::FiberId;

/// The lifecycle phase of a fiber.
///
/// A fiber holds exactly one status at a time, and only the owning executor
/// mutates it. `Suspended` carries everything the resumption protocol needs:
/// the interruptibility at the point of suspension, the async epoch the
/// suspension opened, and the fiber (if any) the suspension is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    /// The fiber is executing instructions (or is queued for a turn).
    Running {
        /// An interrupt cause is currently being delivered.
        interrupting: bool,
    },
    /// The fiber is parked at an asynchronous boundary.
    Suspended {
        /// An interrupt cause is currently being delivered.
        interrupting: bool,
        /// Whether the fiber may be interrupted while parked here.
        interruptible: bool,
        /// The async epoch opened by this suspension. Resumptions and
        /// canceller registrations carrying a different epoch are stale and
        /// must be ignored.
        epoch: u64,
        /// The fiber this suspension waits on, when known.
        blocking_on: Option<FiberId>,
    },
    /// The fiber has produced its final `Exit`.
    Done,
}

impl FiberStatus {
    /// Check whether the fiber has completed.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Check whether the fiber is parked at an asynchronous boundary.
    #[must_use]
    pub const fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended { .. })
    }

    /// Check whether an interrupt cause is currently being delivered.
    #[must_use]
    pub const fn is_interrupting(&self) -> bool {
        match self {
            Self::Running { interrupting } | Self::Suspended { interrupting, .. } => *interrupting,
            Self::Done => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_predicates() {
        let running = FiberStatus::Running { interrupting: false };
        assert!(!running.is_done());
        assert!(!running.is_suspended());
        assert!(!running.is_interrupting());

        let suspended = FiberStatus::Suspended {
            interrupting: true,
            interruptible: true,
            epoch: 3,
            blocking_on: None,
        };
        assert!(suspended.is_suspended());
        assert!(suspended.is_interrupting());

        assert!(FiberStatus::Done.is_done());
        assert!(!FiberStatus::Done.is_interrupting());
    }
}
