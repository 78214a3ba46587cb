//! Supervision hooks.
//!
//! A [`Supervisor`] observes fiber lifecycle events in the region it is
//! installed over. Hooks run on the interpreter's thread and must not block.

use std::sync::Arc;
use strand_core::{AnyValue, Exit, FiberId};

/// Lifecycle observer for fibers forked under a supervised region.
///
/// A supervisor installed with `Io::supervised` follows every fiber forked
/// while it is active, from `on_start` through that fiber's suspend/resume
/// cycles to `on_end` with its final exit. The forked effect itself is
/// consumed by the child and is not part of any hook; the environment and
/// the two fiber ids identify the fork.
pub trait Supervisor: Send + Sync {
    /// A child fiber was forked. Called with the parent's environment,
    /// before the child's first turn.
    fn on_start(&self, env: &AnyValue, parent: Option<FiberId>, child: FiberId);

    /// A supervised fiber produced its final exit.
    fn on_end(&self, exit: &Exit, fiber: FiberId);

    /// A supervised fiber parked at an asynchronous boundary.
    fn on_suspend(&self, _fiber: FiberId) {}

    /// A supervised fiber resumed from an asynchronous boundary.
    fn on_resume(&self, _fiber: FiberId) {}
}

/// Composes two supervisors; both see every event, left first.
pub struct ZipSupervisor {
    left: Arc<dyn Supervisor>,
    right: Arc<dyn Supervisor>,
}

impl ZipSupervisor {
    /// Combine `left` and `right` into one supervisor.
    #[must_use]
    pub fn new(left: Arc<dyn Supervisor>, right: Arc<dyn Supervisor>) -> Self {
        Self { left, right }
    }
}

impl Supervisor for ZipSupervisor {
    fn on_start(&self, env: &AnyValue, parent: Option<FiberId>, child: FiberId) {
        self.left.on_start(env, parent, child);
        self.right.on_start(env, parent, child);
    }

    fn on_end(&self, exit: &Exit, fiber: FiberId) {
        self.left.on_end(exit, fiber);
        self.right.on_end(exit, fiber);
    }

    fn on_suspend(&self, fiber: FiberId) {
        self.left.on_suspend(fiber);
        self.right.on_suspend(fiber);
    }

    fn on_resume(&self, fiber: FiberId) {
        self.left.on_resume(fiber);
        self.right.on_resume(fiber);
    }
}

/// Emits lifecycle events as `tracing` records.
#[derive(Default)]
pub struct TracingSupervisor;

impl Supervisor for TracingSupervisor {
    fn on_start(&self, _env: &AnyValue, parent: Option<FiberId>, child: FiberId) {
        tracing::debug!(?parent, %child, "fiber forked");
    }

    fn on_end(&self, exit: &Exit, fiber: FiberId) {
        tracing::debug!(%fiber, ?exit, "fiber ended");
    }

    fn on_suspend(&self, fiber: FiberId) {
        tracing::trace!(%fiber, "fiber suspended");
    }

    fn on_resume(&self, fiber: FiberId) {
        tracing::trace!(%fiber, "fiber resumed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use strand_core::Exit;

    struct Counting(AtomicUsize);

    impl Supervisor for Counting {
        fn on_start(&self, _env: &AnyValue, _parent: Option<FiberId>, _child: FiberId) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn on_end(&self, _exit: &Exit, _fiber: FiberId) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_zip_delivers_to_both() {
        let a = Arc::new(Counting(AtomicUsize::new(0)));
        let b = Arc::new(Counting(AtomicUsize::new(0)));
        let zip = ZipSupervisor::new(a.clone(), b.clone());
        let env: AnyValue = Arc::new(());
        let id = FiberId::fresh();
        zip.on_start(&env, None, id);
        zip.on_end(&Exit::unit(), id);
        assert_eq!(a.0.load(Ordering::SeqCst), 2);
        assert_eq!(b.0.load(Ordering::SeqCst), 2);
    }
}
