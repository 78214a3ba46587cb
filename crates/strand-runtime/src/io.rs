//! The typed effect surface.
//!
//! An [`Io<A, E>`] is a lazy description of a computation producing `A` or
//! failing with `E`; nothing runs until a fiber interprets it. The struct is
//! a thin typed wrapper over the erased instruction set: constructors box
//! values and closures in, combinators recover them by downcast at the seam
//! where a typed continuation meets an erased value. The downcasts cannot
//! fail for values built through this surface, and a mismatch surfaces as a
//! defect rather than a panic.

use crate::effect::{AsyncOutcome, Effect, ExitView, Val};
use crate::fiber::{Fiber, FiberContext, ResumeInner};
use crate::fiber_ref::{log_annotations, log_spans};
use crate::logger::LogLevel;
use crate::scope::Scope;
use crate::supervisor::Supervisor;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;
use strand_core::{Cause, Defect, Exit, FiberId};

/// The error type of effects that cannot fail.
pub type Never = std::convert::Infallible;

/// A lazy, composable description of an effectful computation.
#[must_use = "an Io is inert until a fiber runs it"]
pub struct Io<A, E = Never> {
    effect: Effect,
    _marker: PhantomData<fn() -> (A, E)>,
}

/// Downcast an erased value into the typed continuation.
fn with_value<A>(value: Val, f: impl FnOnce(A) -> Effect) -> Effect
where
    A: Send + Sync + 'static,
{
    match value.downcast::<A>() {
        Ok(a) => f(*a),
        Err(_) => Effect::payload_mismatch(),
    }
}

impl<A, E> Io<A, E>
where
    A: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub(crate) fn wrap(effect: Effect) -> Self {
        Self {
            effect,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_effect(self) -> Effect {
        self.effect
    }

    // ==== Constructors ===================================================

    /// An effect that immediately produces `value`.
    pub fn succeed(value: A) -> Self {
        Self::wrap(Effect::Succeed(Box::new(value)))
    }

    /// Lift a synchronous computation; it runs when the effect does, and a
    /// panic inside becomes a defect.
    pub fn attempt(f: impl FnOnce() -> A + Send + 'static) -> Self {
        Self::wrap(Effect::Sync(Box::new(move || Box::new(f()))))
    }

    /// Defer the construction of an effect until it runs.
    pub fn suspend(f: impl FnOnce() -> Io<A, E> + Send + 'static) -> Self {
        Self::wrap(Effect::FlatMap {
            first: Box::new(Effect::unit()),
            k: Box::new(move |_| f().into_effect()),
        })
    }

    /// An effect that fails with `error`.
    pub fn fail(error: E) -> Self
    where
        E: Debug,
    {
        Self::wrap(Effect::Fail(Box::new(move || Cause::fail(error))))
    }

    /// An effect that fails with a full cause.
    pub fn fail_cause(cause: Cause) -> Self {
        Self::wrap(Effect::fail_now(cause))
    }

    /// An effect that dies with `defect`, bypassing the error channel.
    pub fn die(defect: Defect) -> Self {
        Self::wrap(Effect::die_now(defect))
    }

    /// Lift a `Result` into the effect's two channels.
    pub fn from_result(result: Result<A, E>) -> Self
    where
        E: Debug,
    {
        match result {
            Ok(a) => Self::succeed(a),
            Err(e) => Self::fail(e),
        }
    }

    /// Replay a terminal exit: succeed with its value or fail with its
    /// cause.
    pub fn done(exit: Exit) -> Self
    where
        A: Clone,
    {
        Self::wrap(match exit {
            Exit::Success(value) => match value.downcast_ref::<A>() {
                Some(a) => Effect::Succeed(Box::new(a.clone())),
                None => Effect::payload_mismatch(),
            },
            Exit::Failure(cause) => Effect::fail_now(cause),
        })
    }

    /// An asynchronous effect. `register` is called once, at suspension,
    /// with a resume handle; it either completes inline or reports the
    /// operation pending, optionally with a canceller to run if the fiber
    /// is interrupted while parked.
    pub fn async_io(
        register: impl FnOnce(Resume<A, E>) -> AsyncRegistration<A, E> + Send + 'static,
    ) -> Self {
        Self::async_inner(None, register)
    }

    /// Like [`Io::async_io`], recording the fiber this suspension waits on.
    pub fn async_blocking_on(
        on: FiberId,
        register: impl FnOnce(Resume<A, E>) -> AsyncRegistration<A, E> + Send + 'static,
    ) -> Self {
        Self::async_inner(Some(on), register)
    }

    fn async_inner(
        blocking_on: Option<FiberId>,
        register: impl FnOnce(Resume<A, E>) -> AsyncRegistration<A, E> + Send + 'static,
    ) -> Self {
        Self::wrap(Effect::Async {
            register: Box::new(move |inner| {
                let handle = Resume {
                    inner,
                    _marker: PhantomData,
                };
                match register(handle) {
                    AsyncRegistration::Resumed(io) => AsyncOutcome::Resumed(io.into_effect()),
                    AsyncRegistration::Pending { canceller } => AsyncOutcome::Pending {
                        canceller: canceller.map(Io::into_effect),
                    },
                }
            }),
            blocking_on,
        })
    }

    /// Run `f` inside an uninterruptible region, handing it a mask that can
    /// restore the outer interruptibility for selected sub-effects.
    pub fn uninterruptible_mask(
        f: impl FnOnce(InterruptMask) -> Io<A, E> + Send + 'static,
    ) -> Self {
        Self::wrap(Effect::CheckInterruptible(Box::new(move |saved| {
            Effect::SetInterruptible {
                effect: Box::new(f(InterruptMask { saved }).into_effect()),
                flag: false,
            }
        })))
    }

    // ==== Sequencing =====================================================

    /// Run `self`, then feed its value to `f`.
    pub fn flat_map<B>(self, f: impl FnOnce(A) -> Io<B, E> + Send + 'static) -> Io<B, E>
    where
        B: Send + Sync + 'static,
    {
        Io::wrap(Effect::FlatMap {
            first: Box::new(self.effect),
            k: Box::new(move |value| with_value::<A>(value, |a| f(a).into_effect())),
        })
    }

    /// Transform the success value.
    pub fn map<B>(self, f: impl FnOnce(A) -> B + Send + 'static) -> Io<B, E>
    where
        B: Send + Sync + 'static,
    {
        self.flat_map(move |a| Io::succeed(f(a)))
    }

    /// Run `self`, discard its value, then run `next`.
    pub fn zip_right<B>(self, next: Io<B, E>) -> Io<B, E>
    where
        B: Send + Sync + 'static,
    {
        self.flat_map(move |_| next)
    }

    /// Run `self`, then `next`, keeping the first value.
    pub fn zip_left<B>(self, next: Io<B, E>) -> Io<A, E>
    where
        B: Send + Sync + 'static,
    {
        self.flat_map(move |a| next.map(move |_| a))
    }

    /// Discard the success value.
    pub fn unit_value(self) -> Io<(), E> {
        self.map(|_| ())
    }

    // ==== Error handling =================================================

    /// Handle both channels at the cause level.
    pub fn fold_cause<B, E2>(
        self,
        on_cause: impl FnOnce(Cause) -> Io<B, E2> + Send + 'static,
        on_value: impl FnOnce(A) -> Io<B, E2> + Send + 'static,
    ) -> Io<B, E2>
    where
        B: Send + Sync + 'static,
        E2: Send + Sync + 'static,
    {
        Io::wrap(Effect::Fold {
            first: Box::new(self.effect),
            on_failure: Box::new(move |cause| on_cause(cause).into_effect()),
            on_success: Box::new(move |value| {
                with_value::<A>(value, |a| on_value(a).into_effect())
            }),
        })
    }

    /// Recover from any cause, including defects and interruption observed
    /// inside uninterruptible regions.
    pub fn catch_all_cause<E2>(
        self,
        f: impl FnOnce(Cause) -> Io<A, E2> + Send + 'static,
    ) -> Io<A, E2>
    where
        E2: Send + Sync + 'static,
    {
        self.fold_cause(f, Io::succeed)
    }

    /// Recover from a typed failure. Defects and interruptions pass
    /// through untouched.
    pub fn catch_all<E2>(self, f: impl FnOnce(E) -> Io<A, E2> + Send + 'static) -> Io<A, E2>
    where
        E: Clone,
        E2: Send + Sync + 'static,
    {
        self.fold_cause(
            move |cause| match typed_failure::<E>(&cause) {
                Some(e) => f(e),
                None => Io::fail_cause(cause),
            },
            Io::succeed,
        )
    }

    /// Handle both channels with plain functions.
    pub fn fold<B, E2>(
        self,
        on_error: impl FnOnce(E) -> B + Send + 'static,
        on_value: impl FnOnce(A) -> B + Send + 'static,
    ) -> Io<B, E2>
    where
        E: Clone,
        B: Send + Sync + 'static,
        E2: Send + Sync + 'static,
    {
        self.fold_cause(
            move |cause| match typed_failure::<E>(&cause) {
                Some(e) => Io::succeed(on_error(e)),
                None => Io::fail_cause(cause),
            },
            move |a| Io::succeed(on_value(a)),
        )
    }

    /// Transform the typed error.
    pub fn map_error<E2>(self, f: impl FnOnce(E) -> E2 + Send + 'static) -> Io<A, E2>
    where
        E: Clone,
        E2: Debug + Send + Sync + 'static,
    {
        self.fold_cause(
            move |cause| match typed_failure::<E>(&cause) {
                Some(e) => Io::fail(f(e)),
                None => Io::fail_cause(cause),
            },
            Io::succeed,
        )
    }

    /// Surface the typed error as a `Result` value.
    pub fn result<E2>(self) -> Io<Result<A, E>, E2>
    where
        E: Clone,
        E2: Send + Sync + 'static,
    {
        self.fold(Err, Ok)
    }

    // ==== Resource safety ================================================

    /// Attach a finalizer that runs exactly once on the effect's exit, on
    /// every path: success, failure, and interruption. The finalizer itself
    /// runs uninterruptibly.
    pub fn ensuring<E2>(
        self,
        finalizer: impl for<'a> FnOnce(ExitView<'a>) -> Io<(), E2> + Send + 'static,
    ) -> Io<A, E>
    where
        E2: Send + Sync + 'static,
    {
        Io::wrap(Effect::Ensuring {
            effect: Box::new(self.effect),
            finalizer: Box::new(move |view| finalizer(view).into_effect()),
        })
    }

    /// Run a cleanup effect after `self`, ignoring the exit.
    pub fn on_exit<E2>(self, cleanup: Io<(), E2>) -> Io<A, E>
    where
        E2: Send + Sync + 'static,
    {
        self.ensuring(move |_| cleanup)
    }

    // ==== Interruption ===================================================

    /// Shield `self` from interruption.
    pub fn uninterruptible(self) -> Self {
        Self::wrap(self.effect.uninterruptible())
    }

    /// Restore interruptibility inside an uninterruptible region.
    pub fn interruptible(self) -> Self {
        Self::wrap(Effect::SetInterruptible {
            effect: Box::new(self.effect),
            flag: true,
        })
    }

    // ==== Concurrency ====================================================

    /// Start `self` on a new fiber in the current fork scope.
    pub fn fork<E2>(self) -> Io<Fiber<A, E>, E2>
    where
        A: Clone,
        E2: Send + Sync + 'static,
    {
        Self::fork_with(self.effect, None)
    }

    /// Start `self` on a new daemon fiber in the global scope, unbound
    /// from the parent's lifetime.
    pub fn fork_daemon<E2>(self) -> Io<Fiber<A, E>, E2>
    where
        A: Clone,
        E2: Send + Sync + 'static,
    {
        Self::fork_with(self.effect, Some(Scope::Global))
    }

    /// Start `self` on a new fiber registered with `scope`.
    pub fn fork_in<E2>(self, scope: Scope) -> Io<Fiber<A, E>, E2>
    where
        A: Clone,
        E2: Send + Sync + 'static,
    {
        Self::fork_with(self.effect, Some(scope))
    }

    fn fork_with<E2>(effect: Effect, scope_override: Option<Scope>) -> Io<Fiber<A, E>, E2>
    where
        A: Clone,
        E2: Send + Sync + 'static,
    {
        Io::wrap(Effect::FlatMap {
            first: Box::new(Effect::Fork {
                effect: Box::new(effect),
                scope_override,
            }),
            k: Box::new(|value| match value.downcast::<Arc<FiberContext>>() {
                Ok(context) => Effect::Succeed(Box::new(Fiber::<A, E>::from_context(*context))),
                Err(_) => Effect::payload_mismatch(),
            }),
        })
    }

    /// Race `self` against `other`. The first fiber to complete decides the
    /// outcome; the loser is interrupted and awaited before the winner's
    /// exit is delivered.
    pub fn race(self, other: Io<A, E>) -> Io<A, E>
    where
        A: Clone,
    {
        fn settle<A, E>(exit: Exit, loser: Fiber<A, E>) -> Io<A, E>
        where
            A: Clone + Send + Sync + 'static,
            E: Send + Sync + 'static,
        {
            loser.interrupt::<E>().flat_map(move |_| Io::done(exit))
        }
        self.race_with(other, settle, settle)
    }

    /// Race `self` against `other` with full control: the continuation for
    /// the winning side receives the winner's exit and a handle to the
    /// still-running loser. Exactly one continuation runs, on the racing
    /// fiber, after inheriting the winner's fiber-local refs. Both
    /// contenders are children of the racing fiber, so any still running at
    /// the end of the race are interrupted by structured teardown at the
    /// latest.
    pub fn race_with<B, C, E2>(
        self,
        other: Io<B, E>,
        on_self: impl FnOnce(Exit, Fiber<B, E>) -> Io<C, E2> + Send + 'static,
        on_other: impl FnOnce(Exit, Fiber<A, E>) -> Io<C, E2> + Send + 'static,
    ) -> Io<C, E2>
    where
        A: Clone,
        B: Clone + Send + Sync + 'static,
        C: Send + Sync + 'static,
        E2: Send + Sync + 'static,
    {
        Io::wrap(Effect::RaceWith {
            left: Box::new(self.effect),
            right: Box::new(other.effect),
            on_left: Box::new(move |exit, loser| {
                on_self(exit, Fiber::from_context(loser)).into_effect()
            }),
            on_right: Box::new(move |exit, loser| {
                on_other(exit, Fiber::from_context(loser)).into_effect()
            }),
        })
    }

    /// Attach `supervisor` to every fiber forked inside `self`.
    pub fn supervised(self, supervisor: Arc<dyn Supervisor>) -> Self {
        Self::wrap(Effect::Supervise {
            effect: Box::new(self.effect),
            supervisor,
        })
    }

    // ==== Environment ====================================================

    /// Run `self` with `value` as the environment.
    pub fn provide<R>(self, value: R) -> Self
    where
        R: Send + Sync + 'static,
    {
        Self::wrap(Effect::ProvideEnv {
            effect: Box::new(self.effect),
            env: Arc::new(value),
        })
    }
}

/// Extract the typed failure from a cause, if the cause is a plain typed
/// failure rather than a defect or an interruption.
fn typed_failure<E>(cause: &Cause) -> Option<E>
where
    E: Clone + Send + Sync + 'static,
{
    if cause.is_interrupted() || cause.is_die() {
        return None;
    }
    cause.failure::<E>()
}

/// The mask handed to [`Io::uninterruptible_mask`]; restores the region's
/// outer interruptibility for selected sub-effects.
#[derive(Clone, Copy)]
pub struct InterruptMask {
    saved: bool,
}

impl InterruptMask {
    /// Run `io` with the interruptibility that was in force outside the
    /// mask.
    pub fn restore<A, E>(&self, io: Io<A, E>) -> Io<A, E>
    where
        A: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        Io::wrap(Effect::SetInterruptible {
            effect: Box::new(io.into_effect()),
            flag: self.saved,
        })
    }
}

/// A typed handle for completing one asynchronous suspension.
///
/// Cheap to clone; every clone refers to the same suspension, and only the
/// first resumption takes effect. Later calls return `false`.
pub struct Resume<A, E> {
    inner: ResumeInner,
    _marker: PhantomData<fn(A, E)>,
}

impl<A, E> Clone for Resume<A, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> Resume<A, E>
where
    A: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Complete the suspension with a value.
    pub fn succeed(&self, value: A) -> bool {
        self.inner.resume(Effect::Succeed(Box::new(value)))
    }

    /// Complete the suspension with a typed failure.
    pub fn fail(&self, error: E) -> bool
    where
        E: Debug,
    {
        self.inner.resume(Effect::fail_now(Cause::fail(error)))
    }

    /// Complete the suspension with a full cause.
    pub fn fail_cause(&self, cause: Cause) -> bool {
        self.inner.resume(Effect::fail_now(cause))
    }

    /// Complete the suspension with an arbitrary follow-up effect.
    pub fn resume(&self, io: Io<A, E>) -> bool {
        self.inner.resume(io.into_effect())
    }
}

/// The outcome of an asynchronous registration.
pub enum AsyncRegistration<A, E> {
    /// The operation finished during registration.
    Resumed(Io<A, E>),
    /// The operation is in flight and will complete through the resume
    /// handle.
    Pending {
        /// Cleanup to run if the fiber is interrupted while suspended here.
        canceller: Option<Io<(), Never>>,
    },
}

// ==== Nullary operations =================================================

/// An effect that never completes. Interruptible, so it ends with the
/// fiber's interruption.
pub fn never<A, E>() -> Io<A, E>
where
    A: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    Io::wrap(Effect::Async {
        register: Box::new(|_| AsyncOutcome::Pending { canceller: None }),
        blocking_on: None,
    })
}

/// End the current turn and requeue the fiber behind its peers.
pub fn yield_now<E>() -> Io<(), E>
where
    E: Send + Sync + 'static,
{
    Io::wrap(Effect::YieldNow)
}

/// The id of the fiber running the effect.
pub fn fiber_id<E>() -> Io<FiberId, E>
where
    E: Send + Sync + 'static,
{
    Io::wrap(Effect::GetFiberId(Box::new(|id| {
        Effect::Succeed(Box::new(id))
    })))
}

/// Whether the current region is interruptible.
pub fn interrupt_status<E>() -> Io<bool, E>
where
    E: Send + Sync + 'static,
{
    Io::wrap(Effect::CheckInterruptible(Box::new(|flag| {
        Effect::Succeed(Box::new(flag))
    })))
}

/// The scope new fibers would currently be forked into.
pub fn fork_scope<E>() -> Io<Scope, E>
where
    E: Send + Sync + 'static,
{
    Io::wrap(Effect::GetForkScope(Box::new(|scope| {
        Effect::Succeed(Box::new(scope))
    })))
}

/// Read the environment as an `R`, dying if none of that type was provided.
pub fn environment<R, E>() -> Io<Arc<R>, E>
where
    R: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    Io::wrap(Effect::GetEnv(Box::new(|env| match env.downcast::<R>() {
        Ok(r) => Effect::Succeed(Box::new(r)),
        Err(_) => Effect::die_now(Defect::message("environment type mismatch")),
    })))
}

// ==== Logging ============================================================

/// Emit a log record at `level` through the runtime logger.
pub fn log<E>(level: LogLevel, message: impl Into<String>) -> Io<(), E>
where
    E: Send + Sync + 'static,
{
    let message = message.into();
    Io::wrap(Effect::Log {
        level,
        message: Box::new(move || message),
        cause: None,
    })
}

/// Emit a log record carrying a failure cause.
pub fn log_cause<E>(level: LogLevel, message: impl Into<String>, cause: Cause) -> Io<(), E>
where
    E: Send + Sync + 'static,
{
    let message = message.into();
    Io::wrap(Effect::Log {
        level,
        message: Box::new(move || message),
        cause: Some(cause),
    })
}

/// `log` at info level.
pub fn log_info<E>(message: impl Into<String>) -> Io<(), E>
where
    E: Send + Sync + 'static,
{
    log(LogLevel::Info, message)
}

/// `log` at debug level.
pub fn log_debug<E>(message: impl Into<String>) -> Io<(), E>
where
    E: Send + Sync + 'static,
{
    log(LogLevel::Debug, message)
}

/// `log` at warn level.
pub fn log_warn<E>(message: impl Into<String>) -> Io<(), E>
where
    E: Send + Sync + 'static,
{
    log(LogLevel::Warn, message)
}

/// `log` at error level.
pub fn log_error<E>(message: impl Into<String>) -> Io<(), E>
where
    E: Send + Sync + 'static,
{
    log(LogLevel::Error, message)
}

/// Run `io` inside a named log span. Spans nest, follow the fiber (children
/// inherit them at fork), and are removed when `io` completes.
pub fn log_span<A, E>(name: impl Into<String>, io: Io<A, E>) -> Io<A, E>
where
    A: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    let name = name.into();
    let spans = log_spans().clone();
    let reader = spans.clone();
    reader.get::<E>().flat_map(move |mut current| {
        current.push(name);
        spans.locally(current, io)
    })
}

/// Run `io` with a log annotation set. Annotations follow the fiber like
/// spans do.
pub fn log_annotate<A, E>(
    key: impl Into<String>,
    value: impl Into<String>,
    io: Io<A, E>,
) -> Io<A, E>
where
    A: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    let key = key.into();
    let value = value.into();
    let annotations = log_annotations().clone();
    let reader = annotations.clone();
    reader.get::<E>().flat_map(move |mut current| {
        current.insert(key, value);
        annotations.locally(current, io)
    })
}
