//! Continuation stack frames.
//!
//! The interpreter is a defunctionalized loop: instead of host recursion,
//! every "what happens next" is pushed here as a [`Frame`]. Success values
//! pop frames until one consumes the value; failure causes unwind frames
//! until a handler catches the cause, running restore frames and finalizers
//! on the way down.

use crate::effect::{Cont, Env, ErrCont, Finalize};
use crate::fiber_ref::ErasedRef;
use crate::scope::Scope;
use crate::supervisor::Supervisor;
use std::sync::Arc;
use strand_core::AnyValue;

pub(crate) enum Frame {
    /// Value continuation from a `FlatMap`. Skipped during unwinding.
    OnSuccess(Cont),
    /// Handler pair from a `Fold`. Catches causes, unless discarded because
    /// the fiber is being interrupted while interruptible.
    Handler {
        on_failure: ErrCont,
        on_success: Cont,
    },
    /// Restores the interruptibility flag popped by a `SetInterruptible`.
    /// Never skipped, on either path.
    RestoreInterrupt,
    /// A pending finalizer from `Ensuring`. Runs on both paths, exactly once.
    Finalizer(Finalize),
    /// Restores the environment saved by a `ProvideEnv`.
    RestoreEnv(Env),
    /// Restores the fork-scope override saved by an `OverrideForkScope`.
    RestoreForkScope(Option<Scope>),
    /// Restores the supervisor saved by a `Supervise`.
    RestoreSupervisor(Option<Arc<dyn Supervisor>>),
    /// Restores a fiber-local reference saved by a `RefLocally`. `None`
    /// means the reference had no entry before the scoped set.
    RestoreRef {
        fiber_ref: ErasedRef,
        previous: Option<AnyValue>,
    },
}
