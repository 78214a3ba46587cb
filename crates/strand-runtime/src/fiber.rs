//! Fiber identity, state, and the public fiber handle.
//!
//! A [`FiberContext`] owns everything one fiber needs: its continuation
//! stack and locals (behind the `run` lock, held for whole interpreter
//! turns), its externally visible state (behind the `state` lock, held only
//! for short accesses), and its child table. Lock order is `run` before
//! `state` before `children`; no code path acquires them in the other
//! direction, and observers always fire after every lock is released.

use crate::effect::{Effect, Env, Val};
use crate::fiber_ref::{ErasedRef, FiberRef, FiberRefs};
use crate::frame::Frame;
use crate::interpreter;
use crate::io::Io;
use crate::runtime::RuntimeShared;
use crate::scheduler::Scheduler;
use crate::scope::Scope;
use crate::supervisor::Supervisor;
use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strand_core::{AnyValue, Cause, Exit, FiberError, FiberId, FiberStatus};

/// Callback invoked with the fiber's exit, after completion is published.
pub(crate) type Observer = Box<dyn FnOnce(Exit) + Send>;

/// The canceller armed for the current suspension, if any.
pub(crate) enum CancellerState {
    /// No canceller registered for the current suspension.
    Empty,
    /// Registered and armed for the current suspension.
    Registered(Effect),
}

/// Externally visible fiber state, behind the `state` lock.
pub(crate) enum FiberState {
    Executing {
        status: FiberStatus,
        observers: Vec<Observer>,
        /// Causes recorded against the fiber outside normal propagation,
        /// chiefly interrupts it has not yet observed. Merged into the
        /// final exit.
        suppressed: Cause,
        /// Every fiber that has requested interruption.
        interruptors: FxHashSet<FiberId>,
        canceller: CancellerState,
        /// Epochs of suspensions an interrupt consumed before their
        /// registration finished; a canceller arriving for one of these
        /// fires immediately.
        due_cancels: FxHashSet<u64>,
        /// Effects spliced in by `eval_on`, run at the start of the next
        /// turn.
        mailbox: Option<Effect>,
        /// The effect the next turn starts from, set by a resumption.
        resumption: Option<Effect>,
    },
    Done {
        exit: Exit,
        /// Frozen locals, read by parents that inherit this fiber's refs.
        refs: FiberRefs,
    },
}

/// Interpreter-owned state, behind the `run` lock.
pub(crate) struct RunState {
    /// The effect the next turn evaluates, when the fiber is runnable but
    /// not mid-turn.
    pub(crate) current: Option<Effect>,
    pub(crate) stack: Vec<Frame>,
    pub(crate) interrupt_stack: SmallVec<[bool; 8]>,
    pub(crate) interruptible: bool,
    /// True while an interrupt cause is unwinding, so the loop head does
    /// not substitute a second one.
    pub(crate) interrupting: bool,
    pub(crate) env: Env,
    pub(crate) refs: FiberRefs,
    /// Fork-scope override installed by `OverrideForkScope`.
    pub(crate) fork_scope: Option<Scope>,
    pub(crate) supervisor: Option<Arc<dyn Supervisor>>,
    /// Success values parked while their finalizers run.
    pub(crate) stash: Vec<Val>,
}

pub(crate) struct FiberContext {
    id: FiberId,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) shared: Arc<RuntimeShared>,
    /// The supervisor active when this fiber was forked; receives this
    /// fiber's lifecycle events.
    pub(crate) supervisor: Option<Arc<dyn Supervisor>>,
    /// The scope owner this fiber registered with, for removal on exit.
    pub(crate) parent: Mutex<Option<std::sync::Weak<FiberContext>>>,
    pub(crate) state: Mutex<FiberState>,
    pub(crate) children: Mutex<FxHashMap<FiberId, Arc<FiberContext>>>,
    pub(crate) run: Mutex<RunState>,
    /// Cheap pre-check for the interpreter's loop head.
    interrupt_flag: AtomicBool,
    next_epoch: AtomicU64,
    done_cv: Condvar,
}

impl FiberContext {
    pub(crate) fn new(
        effect: Effect,
        env: Env,
        refs: FiberRefs,
        supervisor: Option<Arc<dyn Supervisor>>,
        scheduler: Arc<dyn Scheduler>,
        shared: Arc<RuntimeShared>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: FiberId::fresh(),
            scheduler,
            shared,
            supervisor: supervisor.clone(),
            parent: Mutex::new(None),
            state: Mutex::new(FiberState::Executing {
                status: FiberStatus::Running { interrupting: false },
                observers: Vec::new(),
                suppressed: Cause::Empty,
                interruptors: FxHashSet::default(),
                canceller: CancellerState::Empty,
                due_cancels: FxHashSet::default(),
                mailbox: None,
                resumption: None,
            }),
            children: Mutex::new(FxHashMap::default()),
            run: Mutex::new(RunState {
                current: Some(effect),
                stack: Vec::new(),
                interrupt_stack: SmallVec::new(),
                interruptible: true,
                interrupting: false,
                env,
                refs,
                fork_scope: None,
                supervisor,
                stash: Vec::new(),
            }),
            interrupt_flag: AtomicBool::new(false),
            next_epoch: AtomicU64::new(0),
            done_cv: Condvar::new(),
        })
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn schedule_turn(self: &Arc<Self>) {
        let fiber = self.clone();
        self.scheduler
            .schedule(Box::new(move || interpreter::run_turn(fiber)));
    }

    pub(crate) fn new_epoch(&self) -> u64 {
        self.next_epoch.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Loop-head pre-check; precise state lives behind the state lock.
    pub(crate) fn interrupt_pending(&self) -> bool {
        self.interrupt_flag.load(Ordering::Acquire)
    }

    // ==== Cross-fiber operations =========================================

    /// Record an interruption request from `by`.
    ///
    /// If the fiber is parked interruptibly, this consumes the suspension:
    /// the next turn delivers the interrupt cause (running the registered
    /// canceller first), and any later resumption for that suspension is
    /// stale.
    pub(crate) fn interrupt_as(self: &Arc<Self>, by: FiberId) {
        let mut state = self.state.lock();
        let FiberState::Executing {
            status,
            suppressed,
            interruptors,
            canceller,
            due_cancels,
            resumption,
            ..
        } = &mut *state
        else {
            return;
        };
        if interruptors.insert(by) {
            let prior = std::mem::replace(suppressed, Cause::Empty);
            *suppressed = prior.then(Cause::interrupt(by));
        }
        self.interrupt_flag.store(true, Ordering::Release);
        if let FiberStatus::Suspended {
            interruptible: true,
            epoch,
            ..
        } = *status
        {
            *status = FiberStatus::Running { interrupting: true };
            if matches!(canceller, CancellerState::Empty) {
                due_cancels.insert(epoch);
            }
            // Wake the fiber; the loop head substitutes the interrupt.
            *resumption = Some(Effect::unit());
            drop(state);
            self.schedule_turn();
        }
    }

    /// Deliver a resumption for the suspension identified by `epoch`.
    /// Returns `false` (a no-op) when the suspension has already been
    /// consumed by an earlier resumption or an interrupt.
    pub(crate) fn try_resume(self: &Arc<Self>, epoch: u64, effect: Effect) -> bool {
        let mut state = self.state.lock();
        let FiberState::Executing {
            status, resumption, ..
        } = &mut *state
        else {
            return false;
        };
        match *status {
            FiberStatus::Suspended {
                interrupting,
                epoch: current,
                ..
            } if current == epoch => {
                *status = FiberStatus::Running { interrupting };
                *resumption = Some(effect);
                drop(state);
                if let Some(s) = &self.supervisor {
                    s.on_resume(self.id);
                }
                self.schedule_turn();
                true
            }
            _ => false,
        }
    }

    /// Attach the canceller produced by an asynchronous registration.
    ///
    /// Registration races with interruption: if an interrupt consumed the
    /// suspension while the registration was still running, the canceller
    /// arrives here already due and fires on a detached fiber.
    pub(crate) fn register_canceller(self: &Arc<Self>, epoch: u64, effect: Option<Effect>) {
        let due = {
            let mut state = self.state.lock();
            let FiberState::Executing {
                status,
                canceller,
                due_cancels,
                ..
            } = &mut *state
            else {
                return;
            };
            if due_cancels.remove(&epoch) {
                true
            } else {
                if let FiberStatus::Suspended { epoch: current, .. } = *status {
                    if current == epoch {
                        if let Some(c) = effect {
                            *canceller = CancellerState::Registered(c);
                        }
                        return;
                    }
                }
                // The suspension resumed normally; nothing to cancel.
                false
            }
        };
        if due {
            if let Some(c) = effect {
                self.run_detached(c.uninterruptible());
            }
        }
    }

    /// Park the fiber at an asynchronous boundary. Called by the
    /// interpreter before it releases the run lock for a registration.
    ///
    /// An interrupt request can land after the interpreter's last loop-head
    /// check but before the status flips to `Suspended`; `interrupt_as` sees
    /// `Running` then and never wakes the fiber. The re-check here consumes
    /// such a suspension immediately instead of parking forever.
    pub(crate) fn enter_suspension(
        self: &Arc<Self>,
        epoch: u64,
        interrupting: bool,
        interruptible: bool,
        blocking_on: Option<FiberId>,
    ) {
        let mut state = self.state.lock();
        let FiberState::Executing {
            status,
            canceller,
            interruptors,
            due_cancels,
            resumption,
            ..
        } = &mut *state
        else {
            return;
        };
        *canceller = CancellerState::Empty;
        if interruptible && !interrupting && !interruptors.is_empty() {
            *status = FiberStatus::Running { interrupting: true };
            due_cancels.insert(epoch);
            *resumption = Some(Effect::unit());
            drop(state);
            self.schedule_turn();
            return;
        }
        *status = FiberStatus::Suspended {
            interrupting,
            interruptible,
            epoch,
            blocking_on,
        };
    }

    /// Take the canceller armed for the suspension being interrupted.
    pub(crate) fn take_canceller(&self) -> Option<Effect> {
        let mut state = self.state.lock();
        let FiberState::Executing { canceller, .. } = &mut *state else {
            return None;
        };
        match std::mem::replace(canceller, CancellerState::Empty) {
            CancellerState::Registered(c) => Some(c),
            other => {
                *canceller = other;
                None
            }
        }
    }

    /// Record `cause` against the fiber outside normal propagation; it
    /// surfaces through the final exit or the failure reporter.
    pub(crate) fn suppress(&self, cause: Cause) {
        let mut state = self.state.lock();
        if let FiberState::Executing { suppressed, .. } = &mut *state {
            let prior = std::mem::replace(suppressed, Cause::Empty);
            *suppressed = prior.both(cause);
        }
    }

    /// Take the accumulated suppressed cause, leaving `Empty` behind.
    pub(crate) fn take_suppressed(&self) -> Cause {
        let mut state = self.state.lock();
        match &mut *state {
            FiberState::Executing { suppressed, .. } => {
                std::mem::replace(suppressed, Cause::Empty)
            }
            FiberState::Done { .. } => Cause::Empty,
        }
    }

    /// The interrupt cause built from every recorded interruptor.
    pub(crate) fn interruptors_cause(&self) -> Cause {
        let state = self.state.lock();
        let FiberState::Executing { interruptors, .. } = &*state else {
            return Cause::Empty;
        };
        interruptors
            .iter()
            .fold(Cause::Empty, |acc, id| acc.then(Cause::interrupt(*id)))
    }

    /// Register `f` to run with the fiber's exit; fires immediately if the
    /// fiber already completed.
    pub(crate) fn add_observer(&self, f: Observer) {
        let exit = {
            let mut state = self.state.lock();
            match &mut *state {
                FiberState::Executing { observers, .. } => {
                    observers.push(f);
                    return;
                }
                FiberState::Done { exit, .. } => exit.clone(),
            }
        };
        f(exit);
    }

    pub(crate) fn poll(&self) -> Option<Exit> {
        match &*self.state.lock() {
            FiberState::Executing { .. } => None,
            FiberState::Done { exit, .. } => Some(exit.clone()),
        }
    }

    /// The fiber's final value of `fiber_ref`, from the frozen snapshot.
    /// Falls back to the initial value while the fiber is still executing.
    pub(crate) fn final_ref(&self, fiber_ref: &ErasedRef) -> AnyValue {
        match &*self.state.lock() {
            FiberState::Done { refs, .. } => refs.get(fiber_ref),
            FiberState::Executing { .. } => fiber_ref.initial(),
        }
    }

    pub(crate) fn status(&self) -> FiberStatus {
        match &*self.state.lock() {
            FiberState::Executing { status, .. } => *status,
            FiberState::Done { .. } => FiberStatus::Done,
        }
    }

    /// Block the calling thread until the fiber completes.
    pub(crate) fn await_exit(&self) -> Exit {
        let mut state = self.state.lock();
        loop {
            if let FiberState::Done { exit, .. } = &*state {
                return exit.clone();
            }
            self.done_cv.wait(&mut state);
        }
    }

    /// Block until the fiber completes or `timeout` elapses.
    pub(crate) fn await_exit_timeout(&self, timeout: Duration) -> Option<Exit> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let FiberState::Done { exit, .. } = &*state {
                return Some(exit.clone());
            }
            if self.done_cv.wait_until(&mut state, deadline).timed_out() {
                return match &*state {
                    FiberState::Done { exit, .. } => Some(exit.clone()),
                    FiberState::Executing { .. } => None,
                };
            }
        }
    }

    // ==== Child management ===============================================

    /// Register `child` for structured teardown. Fails when this fiber has
    /// already completed, in which case the caller starts the child
    /// pre-interrupted.
    pub(crate) fn adopt_child(self: &Arc<Self>, child: &Arc<FiberContext>) -> bool {
        let state = self.state.lock();
        if matches!(&*state, FiberState::Done { .. }) {
            return false;
        }
        self.children.lock().insert(child.id(), child.clone());
        drop(state);
        *child.parent.lock() = Some(Arc::downgrade(self));
        true
    }

    pub(crate) fn remove_child(&self, id: FiberId) {
        self.children.lock().remove(&id);
    }

    /// Children that have not yet completed.
    pub(crate) fn live_children(&self) -> Vec<Arc<FiberContext>> {
        self.children
            .lock()
            .values()
            .filter(|c| c.poll().is_none())
            .cloned()
            .collect()
    }

    /// Mark a fiber interrupted before its first turn, used when its scope
    /// refused the registration.
    pub(crate) fn pre_interrupt(&self, by: FiberId) {
        let mut state = self.state.lock();
        if let FiberState::Executing {
            suppressed,
            interruptors,
            ..
        } = &mut *state
        {
            if interruptors.insert(by) {
                let prior = std::mem::replace(suppressed, Cause::Empty);
                *suppressed = prior.then(Cause::interrupt(by));
            }
            self.interrupt_flag.store(true, Ordering::Release);
        }
    }

    /// Append `effect` to the mailbox, to run at the start of the fiber's
    /// next turn. Returns `false` if the fiber has already completed.
    pub(crate) fn enqueue_mailbox(&self, effect: Effect) -> bool {
        let mut state = self.state.lock();
        let FiberState::Executing { mailbox, .. } = &mut *state else {
            return false;
        };
        *mailbox = Some(match mailbox.take() {
            Some(existing) => existing.and_discard(effect),
            None => effect,
        });
        true
    }

    /// Publish completion: store the exit and frozen refs, wake blocked
    /// joiners, then fire observers outside every lock.
    pub(crate) fn complete(self: &Arc<Self>, exit: Exit, refs: FiberRefs) {
        let observers = {
            let mut state = self.state.lock();
            match std::mem::replace(
                &mut *state,
                FiberState::Done {
                    exit: exit.clone(),
                    refs,
                },
            ) {
                FiberState::Executing { observers, .. } => observers,
                done @ FiberState::Done { .. } => {
                    // Completion happens once; restore and bail.
                    *state = done;
                    return;
                }
            }
        };
        self.done_cv.notify_all();
        if let Some(s) = &self.supervisor {
            s.on_end(&exit, self.id);
        }
        let parent = self.parent.lock().take();
        if let Some(parent) = parent.and_then(|p| p.upgrade()) {
            parent.remove_child(self.id);
        }
        let unobserved = observers.is_empty();
        for observer in observers {
            observer(exit.clone());
        }
        if unobserved {
            if let Exit::Failure(cause) = &exit {
                if !cause.is_interrupted_only() {
                    (self.shared.reporter)(cause);
                }
            }
        }
    }

    /// Run `effect` on a fresh daemon fiber in the global scope. Used for
    /// cancellers whose owning suspension has already been torn down.
    pub(crate) fn run_detached(&self, effect: Effect) {
        let child = FiberContext::new(
            effect,
            Arc::new(()),
            FiberRefs::default(),
            self.supervisor.clone(),
            self.scheduler.clone(),
            self.shared.clone(),
        );
        child.schedule_turn();
    }
}

/// The capability to resume one specific suspension.
///
/// Carries the epoch of the suspension it belongs to; resuming after the
/// suspension was already consumed (by an earlier resume or an interrupt)
/// is a no-op. Clones share the epoch, so exactly one of any number of
/// racing resumptions wins.
pub(crate) struct ResumeInner {
    pub(crate) fiber: Arc<FiberContext>,
    pub(crate) epoch: u64,
}

impl Clone for ResumeInner {
    fn clone(&self) -> Self {
        Self {
            fiber: self.fiber.clone(),
            epoch: self.epoch,
        }
    }
}

impl ResumeInner {
    /// Resume the fiber with `effect`. Returns `false` if stale.
    pub(crate) fn resume(&self, effect: Effect) -> bool {
        self.fiber.try_resume(self.epoch, effect)
    }
}

// ==== Public handle ======================================================

/// A typed handle to a running fiber.
///
/// Obtained from `Io::fork` or `Runtime::spawn`. Dropping the handle does
/// not affect the fiber; its lifetime is governed by its scope.
pub struct Fiber<A, E> {
    context: Arc<FiberContext>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> Fiber<A, E>
where
    A: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub(crate) fn from_context(context: Arc<FiberContext>) -> Self {
        Self {
            context,
            _marker: PhantomData,
        }
    }

    /// The fiber's unique id.
    #[must_use]
    pub fn id(&self) -> FiberId {
        self.context.id()
    }

    /// A snapshot of the fiber's lifecycle status.
    #[must_use]
    pub fn status(&self) -> FiberStatus {
        self.context.status()
    }

    /// The fiber's exit, if it has completed.
    #[must_use]
    pub fn poll(&self) -> Option<Exit> {
        self.context.poll()
    }

    /// Suspend until the fiber completes, producing its exit. Never fails;
    /// the fiber's failure is inside the exit.
    #[must_use]
    pub fn awaiting<E2>(&self) -> Io<Exit, E2>
    where
        E2: Send + Sync + 'static,
    {
        Io::wrap(await_effect(self.context.clone()))
    }

    /// Suspend until the fiber completes, inherit its fiber-local refs,
    /// and deliver its result in the caller's error channel.
    #[must_use]
    pub fn join(&self) -> Io<A, E> {
        let ctx = self.context.clone();
        Io::wrap(Effect::FlatMap {
            first: Box::new(await_effect(ctx.clone())),
            k: Box::new(move |val| {
                let Ok(exit) = val.downcast::<Exit>() else {
                    return Effect::payload_mismatch();
                };
                Effect::FlatMap {
                    first: Box::new(Effect::InheritRefs(ctx)),
                    k: Box::new(move |_| match *exit {
                        Exit::Success(ref v) => match v.downcast_ref::<A>() {
                            Some(a) => Effect::Succeed(Box::new(a.clone())),
                            None => Effect::payload_mismatch(),
                        },
                        Exit::Failure(ref cause) => Effect::fail_now(cause.clone()),
                    }),
                }
            }),
        })
    }

    /// Request interruption on behalf of the calling fiber and suspend
    /// until the target completes.
    #[must_use]
    pub fn interrupt<E2>(&self) -> Io<Exit, E2>
    where
        E2: Send + Sync + 'static,
    {
        let ctx = self.context.clone();
        Io::wrap(Effect::GetFiberId(Box::new(move |me| {
            ctx.interrupt_as(me);
            await_effect(ctx)
        })))
    }

    /// Request interruption attributed to `by`, without awaiting.
    #[must_use]
    pub fn interrupt_as<E2>(&self, by: FiberId) -> Io<(), E2>
    where
        E2: Send + Sync + 'static,
    {
        let ctx = self.context.clone();
        Io::wrap(Effect::Sync(Box::new(move || {
            ctx.interrupt_as(by);
            Box::new(())
        })))
    }

    /// Merge the completed fiber's locals into the calling fiber. A no-op
    /// if the fiber has not completed.
    #[must_use]
    pub fn inherit_refs<E2>(&self) -> Io<(), E2>
    where
        E2: Send + Sync + 'static,
    {
        Io::wrap(Effect::InheritRefs(self.context.clone()))
    }

    /// Splice `effect` into the fiber's next turn, or run `if_done` in the
    /// caller if the fiber has already completed.
    #[must_use]
    pub fn eval_on<E2>(&self, effect: Io<(), E2>, if_done: Io<(), E2>) -> Io<(), E2>
    where
        E2: Send + Sync + 'static,
    {
        let ctx = self.context.clone();
        let mut slot = Some((effect.into_effect(), if_done.into_effect()));
        Io::wrap(Effect::Async {
            register: Box::new(move |_resume| {
                let (eff, fallback) = match slot.take() {
                    Some(pair) => pair,
                    None => return crate::effect::AsyncOutcome::Resumed(Effect::unit()),
                };
                if ctx.enqueue_mailbox(eff) {
                    crate::effect::AsyncOutcome::Resumed(Effect::unit())
                } else {
                    crate::effect::AsyncOutcome::Resumed(fallback)
                }
            }),
            blocking_on: None,
        })
    }

    /// Suspend until the fiber completes, then read its final value of
    /// `fiber_ref` (or the reference's initial value, if the fiber never
    /// set it). Unlike [`Fiber::join`] this merges nothing into the caller.
    #[must_use]
    pub fn get_ref<V, E2>(&self, fiber_ref: &FiberRef<V>) -> Io<V, E2>
    where
        V: Clone + Send + Sync + 'static,
        E2: Send + Sync + 'static,
    {
        let ctx = self.context.clone();
        let erased = fiber_ref.erased();
        Io::wrap(Effect::FlatMap {
            first: Box::new(await_effect(ctx.clone())),
            k: Box::new(move |_| {
                let value = ctx.final_ref(&erased);
                match value.downcast_ref::<V>() {
                    Some(v) => Effect::Succeed(Box::new(v.clone())),
                    None => Effect::payload_mismatch(),
                }
            }),
        })
    }

    /// The supervision scope this fiber owns. Fibers forked into it are
    /// torn down when this fiber completes.
    #[must_use]
    pub fn scope(&self) -> Scope {
        Scope::local(&self.context)
    }

    /// Block the calling thread until the fiber completes. Intended for
    /// code outside the runtime; never call it from inside an effect.
    pub fn join_blocking(&self) -> Result<A, FiberError> {
        self.context.await_exit().result::<A>()
    }

    /// Like [`Fiber::join_blocking`], giving up after `timeout`.
    pub fn join_blocking_timeout(&self, timeout: Duration) -> Option<Result<A, FiberError>> {
        self.context
            .await_exit_timeout(timeout)
            .map(|exit| exit.result::<A>())
    }

    /// Block the calling thread until the fiber completes, returning the
    /// full exit.
    pub fn await_blocking(&self) -> Exit {
        self.context.await_exit()
    }
}

/// The effect that suspends until `ctx` completes and yields its `Exit`.
pub(crate) fn await_effect(ctx: Arc<FiberContext>) -> Effect {
    let blocking_on = Some(ctx.id());
    Effect::Async {
        register: Box::new(move |resume| {
            if let Some(exit) = ctx.poll() {
                return crate::effect::AsyncOutcome::Resumed(Effect::Succeed(Box::new(exit)));
            }
            ctx.add_observer(Box::new(move |exit| {
                resume.resume(Effect::Succeed(Box::new(exit)));
            }));
            crate::effect::AsyncOutcome::Pending { canceller: None }
        }),
        blocking_on,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use crate::runtime::{RuntimeConfig, RuntimeShared};
    use crate::scheduler::TestScheduler;

    fn test_context(sched: Arc<TestScheduler>) -> Arc<FiberContext> {
        let shared = Arc::new(RuntimeShared {
            config: RuntimeConfig::default(),
            logger: Arc::new(NoopLogger),
            reporter: Box::new(|_| {}),
        });
        FiberContext::new(
            Effect::unit(),
            Arc::new(()),
            FiberRefs::default(),
            None,
            sched,
            shared,
        )
    }

    #[test]
    fn test_interrupt_landing_before_parking_consumes_the_suspension() {
        let sched = TestScheduler::new();
        let fiber = test_context(sched.clone());
        let epoch = fiber.new_epoch();

        // The request lands while the status is still Running: it records
        // the interruptor without waking anything.
        fiber.interrupt_as(FiberId::fresh());
        assert!(sched.is_idle());

        fiber.enter_suspension(epoch, false, true, None);
        assert_eq!(
            fiber.status(),
            FiberStatus::Running { interrupting: true }
        );
        assert!(!sched.is_idle());

        // The registration finishes afterwards; its canceller is already
        // due and runs on a detached fiber.
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        fiber.register_canceller(
            epoch,
            Some(Effect::Sync(Box::new(move || {
                flag.store(true, Ordering::SeqCst);
                Box::new(())
            }))),
        );
        sched.run_until_idle();
        assert!(cancelled.load(Ordering::SeqCst));
        assert!(fiber.poll().is_some_and(|exit| exit.is_interrupted()));
    }

    #[test]
    fn test_parking_without_a_pending_interrupt_stays_suspended() {
        let sched = TestScheduler::new();
        let fiber = test_context(sched.clone());
        let epoch = fiber.new_epoch();
        fiber.enter_suspension(epoch, false, true, None);
        assert!(fiber.status().is_suspended());
        assert!(sched.is_idle());
    }
}
