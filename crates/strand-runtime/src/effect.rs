//! The closed instruction set of the effect language.
//!
//! An [`Effect`] is one step of a description of computation: inert data
//! plus boxed closures, never executed on construction. All behavior lives
//! in the interpreter. The typed `Io` surface erases values to [`Val`]
//! (owned, consumed exactly once) and recovers them by downcast; terminal
//! results are shared as `Exit` payloads.

use crate::fiber::{FiberContext, ResumeInner};
use crate::fiber_ref::ErasedRef;
use crate::logger::LogLevel;
use crate::scope::Scope;
use crate::supervisor::Supervisor;
use std::any::Any;
use std::sync::Arc;
use strand_core::{AnyValue, Cause, Defect, Exit, FiberId};

/// An erased, owned success value moving through the interpreter.
pub(crate) type Val = Box<dyn Any + Send + Sync>;

/// A value continuation: what to do with the result of a sub-effect.
pub(crate) type Cont = Box<dyn FnOnce(Val) -> Effect + Send>;

/// A cause continuation: an error handler installed by a fold.
pub(crate) type ErrCont = Box<dyn FnOnce(Cause) -> Effect + Send>;

/// The erased environment value readable through `GetEnv`.
pub(crate) type Env = AnyValue;

/// A finalizer body: builds the cleanup effect from a view of the exit.
pub(crate) type Finalize = Box<dyn for<'a> FnOnce(ExitView<'a>) -> Effect + Send>;

/// A race continuation: receives the winner's exit and the loser's handle.
pub(crate) type RaceCont = Box<dyn FnOnce(Exit, Arc<FiberContext>) -> Effect + Send>;

/// The outcome of an async registration function.
pub(crate) enum AsyncOutcome {
    /// The operation completed during registration; continue immediately.
    Resumed(Effect),
    /// The operation is in flight; the resume handle will be invoked later.
    Pending {
        /// Effect to run if the fiber is interrupted while suspended here.
        canceller: Option<Effect>,
    },
}

/// A borrowed view of an in-flight exit, handed to finalizers.
///
/// Success payloads are borrowed rather than shared because the value is
/// still owned by the interpreter and continues down the stack after the
/// finalizer runs.
pub enum ExitView<'a> {
    /// The guarded effect succeeded.
    Success(&'a (dyn Any + Send + Sync)),
    /// The guarded effect failed with this cause.
    Failure(&'a Cause),
}

impl<'a> ExitView<'a> {
    /// Check whether the guarded effect succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Check whether the guarded effect was interrupted.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Failure(c) if c.is_interrupted())
    }

    /// The failure cause, if the guarded effect failed.
    #[must_use]
    pub fn cause(&self) -> Option<&'a Cause> {
        match self {
            Self::Success(_) => None,
            Self::Failure(c) => Some(c),
        }
    }

    /// The success value, if the guarded effect produced an `A`.
    #[must_use]
    pub fn value_ref<A: 'static>(&self) -> Option<&'a A> {
        match self {
            Self::Success(v) => v.downcast_ref::<A>(),
            Self::Failure(_) => None,
        }
    }
}

/// One instruction of the effect description language.
pub(crate) enum Effect {
    /// A resolved value.
    Succeed(Val),
    /// A lazy synchronous computation; panics become defects.
    Sync(Box<dyn FnOnce() -> Val + Send>),
    /// A lazily constructed failure cause.
    Fail(Box<dyn FnOnce() -> Cause + Send>),
    /// Monadic bind.
    FlatMap { first: Box<Effect>, k: Cont },
    /// Installs an error handler around `first`.
    Fold {
        first: Box<Effect>,
        on_failure: ErrCont,
        on_success: Cont,
    },
    /// An asynchronous boundary.
    Async {
        register: Box<dyn FnOnce(ResumeInner) -> AsyncOutcome + Send>,
        blocking_on: Option<FiberId>,
    },
    /// Spawn `effect` on a new fiber; the value is the child's handle.
    Fork {
        effect: Box<Effect>,
        scope_override: Option<Scope>,
    },
    /// Run both sides as children; exactly one continuation fires.
    RaceWith {
        left: Box<Effect>,
        right: Box<Effect>,
        on_left: RaceCont,
        on_right: RaceCont,
    },
    /// Yield the rest of this turn back to the scheduler.
    YieldNow,
    /// Read the current environment.
    GetEnv(Box<dyn FnOnce(Env) -> Effect + Send>),
    /// Run `effect` with `env` as the environment.
    ProvideEnv { effect: Box<Effect>, env: Env },
    /// Read the current interruptibility flag.
    CheckInterruptible(Box<dyn FnOnce(bool) -> Effect + Send>),
    /// Run `effect` with interruptibility set to `flag`, restoring after.
    SetInterruptible { effect: Box<Effect>, flag: bool },
    /// Read the scope new children would be forked into.
    GetForkScope(Box<dyn FnOnce(Scope) -> Effect + Send>),
    /// Run `effect` with the fork scope overridden (or reset, for `None`).
    OverrideForkScope {
        effect: Box<Effect>,
        scope: Option<Scope>,
    },
    /// Run `effect` with an additional supervisor attached.
    Supervise {
        effect: Box<Effect>,
        supervisor: Arc<dyn Supervisor>,
    },
    /// Run a finalizer on the eventual exit of `effect`, uninterruptibly.
    Ensuring { effect: Box<Effect>, finalizer: Finalize },
    /// Read-modify-write of a fiber-local reference.
    RefModify {
        fiber_ref: ErasedRef,
        f: Box<dyn FnOnce(AnyValue) -> (Val, RefUpdate) + Send>,
    },
    /// Run `effect` with the reference set to `value`, restoring after.
    RefLocally {
        fiber_ref: ErasedRef,
        value: AnyValue,
        effect: Box<Effect>,
    },
    /// Merge a completed fiber's locals into the current fiber.
    InheritRefs(Arc<FiberContext>),
    /// Read the current fiber's id.
    GetFiberId(Box<dyn FnOnce(FiberId) -> Effect + Send>),
    /// Emit a log record through the runtime logger.
    Log {
        level: LogLevel,
        message: Box<dyn FnOnce() -> String + Send>,
        cause: Option<Cause>,
    },
    /// Internal: resume with the value stashed before a success finalizer.
    Unstash,
    /// Internal: enter finalization with an already-terminal exit.
    Finish(Exit),
}

/// The write-back half of a `RefModify`.
pub(crate) enum RefUpdate {
    /// Store a new value.
    Set(AnyValue),
    /// Remove the fiber's entry for the reference.
    Delete,
    /// Leave the entry untouched.
    Keep,
}

impl Effect {
    /// A resolved unit value.
    pub(crate) fn unit() -> Self {
        Self::Succeed(Box::new(()))
    }

    /// An immediate failure with a known cause.
    pub(crate) fn fail_now(cause: Cause) -> Self {
        Self::Fail(Box::new(move || cause))
    }

    /// An immediate defect.
    pub(crate) fn die_now(defect: Defect) -> Self {
        Self::fail_now(Cause::die(defect))
    }

    /// The defect raised when an erased payload fails to downcast. By
    /// construction of the typed surface this is unreachable, but the
    /// interpreter must not panic.
    pub(crate) fn payload_mismatch() -> Self {
        Self::die_now(Defect::message("erased payload type mismatch"))
    }

    /// Sequence: run `self`, discard its value, then run `next`.
    pub(crate) fn and_discard(self, next: Effect) -> Self {
        Self::FlatMap {
            first: Box::new(self),
            k: Box::new(move |_| next),
        }
    }

    /// Run `self` uninterruptibly.
    pub(crate) fn uninterruptible(self) -> Self {
        Self::SetInterruptible {
            effect: Box::new(self),
            flag: false,
        }
    }
}
