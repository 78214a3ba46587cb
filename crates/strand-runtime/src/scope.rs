//! Supervision scopes.
//!
//! A scope is where forked children are registered for structured teardown.
//! Every fiber owns a local scope; the global scope adopts daemons that must
//! outlive their parent.

use crate::fiber::FiberContext;
use std::fmt;
use std::sync::{Arc, Weak};
use strand_core::FiberId;

/// A target for child registration.
#[derive(Clone)]
pub enum Scope {
    /// The root scope. Never closes; children registered here are daemons
    /// with no parent to tear them down.
    Global,
    /// The scope owned by a live fiber.
    Local(LocalScope),
}

/// A handle to one fiber's child table.
///
/// Holds the owner weakly so a scope value captured in a closure does not
/// keep a finished fiber alive.
#[derive(Clone)]
pub struct LocalScope {
    pub(crate) fiber_id: FiberId,
    pub(crate) owner: Weak<FiberContext>,
}

impl Scope {
    pub(crate) fn local(owner: &Arc<FiberContext>) -> Self {
        Self::Local(LocalScope {
            fiber_id: owner.id(),
            owner: Arc::downgrade(owner),
        })
    }

    /// The id of the owning fiber, or `None` for the global scope.
    #[must_use]
    pub fn fiber_id(&self) -> Option<FiberId> {
        match self {
            Self::Global => None,
            Self::Local(local) => Some(local.fiber_id),
        }
    }

    /// Try to register `child` with the scope owner.
    ///
    /// Returns `false` when the scope is closed: the owner has finished (or
    /// is gone) and can no longer guarantee teardown, so the caller must
    /// start the child pre-interrupted.
    pub(crate) fn add(&self, child: &Arc<FiberContext>) -> bool {
        match self {
            Self::Global => true,
            Self::Local(local) => match local.owner.upgrade() {
                Some(owner) => owner.adopt_child(child),
                None => false,
            },
        }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("Scope::Global"),
            Self::Local(local) => write!(f, "Scope::Local({})", local.fiber_id),
        }
    }
}
