//! The trampolined effect interpreter.
//!
//! One call to [`run_turn`] evaluates one fiber for one turn: it holds the
//! fiber's run lock for the whole call and loops over effect nodes without
//! host recursion, so arbitrarily deep effect chains use constant native
//! stack. A turn ends when the fiber completes, parks at an asynchronous
//! boundary, yields, or exhausts its operation budget.
//!
//! The loop head is where interruption becomes visible: before dispatching
//! the next node, a pending interrupt on an interruptible fiber replaces the
//! current effect with the interrupt cause (preceded by the suspension's
//! canceller, if one was armed). Unwinding then runs finalizers normally,
//! while error handlers passed on the way are discarded and typed failures
//! stripped from the propagating cause.

use crate::effect::{AsyncOutcome, Effect, ExitView, RefUpdate, Val};
use crate::fiber::{await_effect, FiberContext, FiberState, ResumeInner, RunState};
use crate::fiber_ref::{log_annotations, log_spans};
use crate::frame::Frame;
use crate::scope::Scope;
use crate::supervisor::{Supervisor, ZipSupervisor};
use rustc_hash::FxHashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strand_core::{Cause, Defect, Exit, FiberStatus};

/// Run closure output through a panic guard, converting escapes to defects.
fn protect(f: impl FnOnce() -> Effect) -> Effect {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(effect) => effect,
        Err(payload) => Effect::die_now(Defect::from_panic(payload)),
    }
}

/// Evaluate `fiber` for one turn.
pub(crate) fn run_turn(fiber: Arc<FiberContext>) {
    let mut run = fiber.run.lock();

    // Splice in the resumption and any mailbox effects before evaluating.
    {
        let mut state = fiber.state.lock();
        match &mut *state {
            FiberState::Executing {
                status,
                mailbox,
                resumption,
                ..
            } => {
                if let Some(resumed) = resumption.take() {
                    run.current = Some(resumed);
                }
                // Only a runnable fiber consumes its mailbox; a wake with
                // no resumption must leave a parked fiber parked.
                if run.current.is_some() {
                    if let Some(spliced) = mailbox.take() {
                        let rest = match run.current.take() {
                            Some(rest) => rest,
                            None => Effect::unit(),
                        };
                        run.current = Some(Effect::FlatMap {
                            first: Box::new(spliced),
                            k: Box::new(move |_| rest),
                        });
                    }
                    // An interrupt that consumed the previous suspension
                    // already marked the status; keep that visible until
                    // the loop head delivers the cause.
                    let interrupting = run.interrupting || status.is_interrupting();
                    *status = FiberStatus::Running { interrupting };
                }
            }
            FiberState::Done { .. } => return,
        }
    }
    let Some(mut current) = run.current.take() else {
        // Spurious wake of a parked fiber; stay parked.
        return;
    };

    let max_ops = fiber.shared.config.max_ops;
    let mut ops = 0_usize;

    loop {
        // Interrupt substitution. The pending-flag check is a cheap atomic;
        // the substituted cause is taken under the state lock.
        if run.interruptible && !run.interrupting && fiber.interrupt_pending() {
            run.interrupting = true;
            let suppressed = fiber.take_suppressed();
            let cause = if suppressed.is_empty() {
                fiber.interruptors_cause()
            } else {
                suppressed
            };
            current = match fiber.take_canceller() {
                Some(canceller) => {
                    // The canceller runs shielded; its own outcome never
                    // changes the interrupt being delivered.
                    let on_fail = cause.clone();
                    let on_done = cause;
                    Effect::SetInterruptible {
                        effect: Box::new(Effect::Fold {
                            first: Box::new(canceller),
                            on_failure: Box::new(move |_| Effect::fail_now(on_fail)),
                            on_success: Box::new(move |_| Effect::fail_now(on_done)),
                        }),
                        flag: false,
                    }
                }
                None => Effect::fail_now(cause),
            };
        }

        ops += 1;
        if ops > max_ops {
            // Budget exhausted; requeue and give other fibers a turn.
            run.current = Some(current);
            drop(run);
            fiber.schedule_turn();
            return;
        }

        current = match current {
            Effect::Succeed(value) => apply_value(&mut run, &fiber, value),
            Effect::Sync(thunk) => match panic::catch_unwind(AssertUnwindSafe(thunk)) {
                Ok(value) => apply_value(&mut run, &fiber, value),
                Err(payload) => {
                    unwind(&mut run, &fiber, Cause::die(Defect::from_panic(payload)))
                }
            },
            Effect::Fail(thunk) => {
                let cause = match panic::catch_unwind(AssertUnwindSafe(thunk)) {
                    Ok(cause) => cause,
                    Err(payload) => Cause::die(Defect::from_panic(payload)),
                };
                unwind(&mut run, &fiber, cause)
            }
            Effect::FlatMap { first, k } => {
                run.stack.push(Frame::OnSuccess(k));
                *first
            }
            Effect::Fold {
                first,
                on_failure,
                on_success,
            } => {
                run.stack.push(Frame::Handler {
                    on_failure,
                    on_success,
                });
                *first
            }
            Effect::SetInterruptible { effect, flag } => {
                let prev = run.interruptible;
                run.interrupt_stack.push(prev);
                run.stack.push(Frame::RestoreInterrupt);
                run.interruptible = flag;
                *effect
            }
            Effect::CheckInterruptible(k) => {
                let flag = run.interruptible;
                protect(move || k(flag))
            }
            Effect::GetEnv(k) => {
                let env = run.env.clone();
                protect(move || k(env))
            }
            Effect::ProvideEnv { effect, env } => {
                let prev = std::mem::replace(&mut run.env, env);
                run.stack.push(Frame::RestoreEnv(prev));
                *effect
            }
            Effect::GetForkScope(k) => {
                let scope = run
                    .fork_scope
                    .clone()
                    .unwrap_or_else(|| Scope::local(&fiber));
                protect(move || k(scope))
            }
            Effect::OverrideForkScope { effect, scope } => {
                let prev = std::mem::replace(&mut run.fork_scope, scope);
                run.stack.push(Frame::RestoreForkScope(prev));
                *effect
            }
            Effect::Supervise { effect, supervisor } => {
                let prev = run.supervisor.clone();
                run.supervisor = Some(match prev.clone() {
                    Some(existing) => {
                        Arc::new(ZipSupervisor::new(existing, supervisor)) as Arc<dyn Supervisor>
                    }
                    None => supervisor,
                });
                run.stack.push(Frame::RestoreSupervisor(prev));
                *effect
            }
            Effect::GetFiberId(k) => {
                let id = fiber.id();
                protect(move || k(id))
            }
            Effect::Ensuring { effect, finalizer } => {
                run.stack.push(Frame::Finalizer(finalizer));
                *effect
            }
            Effect::Unstash => match run.stash.pop() {
                Some(value) => apply_value(&mut run, &fiber, value),
                None => unwind(
                    &mut run,
                    &fiber,
                    Cause::die(Defect::message("finalizer stash underflow")),
                ),
            },
            Effect::RefModify { fiber_ref, f } => {
                let before = run.refs.get(&fiber_ref);
                match panic::catch_unwind(AssertUnwindSafe(move || f(before))) {
                    Ok((value, update)) => {
                        match update {
                            RefUpdate::Set(next) => run.refs.set(&fiber_ref, next),
                            RefUpdate::Delete => run.refs.delete(&fiber_ref),
                            RefUpdate::Keep => {}
                        }
                        apply_value(&mut run, &fiber, value)
                    }
                    Err(payload) => {
                        unwind(&mut run, &fiber, Cause::die(Defect::from_panic(payload)))
                    }
                }
            }
            Effect::RefLocally {
                fiber_ref,
                value,
                effect,
            } => {
                let previous = run.refs.get_entry(&fiber_ref);
                run.refs.set(&fiber_ref, value);
                run.stack.push(Frame::RestoreRef {
                    fiber_ref,
                    previous,
                });
                *effect
            }
            Effect::InheritRefs(child) => {
                {
                    let state = child.state.lock();
                    if let FiberState::Done { refs, .. } = &*state {
                        run.refs.inherit(refs);
                    }
                }
                apply_value(&mut run, &fiber, Box::new(()))
            }
            Effect::Log {
                level,
                message,
                cause,
            } => {
                let text = match panic::catch_unwind(AssertUnwindSafe(message)) {
                    Ok(text) => text,
                    Err(_) => "<log message panicked>".to_string(),
                };
                let spans_any = run.refs.get(&log_spans().erased());
                let annotations_any = run.refs.get(&log_annotations().erased());
                let empty_spans: Vec<String> = Vec::new();
                let empty_annotations: FxHashMap<String, String> = FxHashMap::default();
                let spans = spans_any
                    .downcast_ref::<Vec<String>>()
                    .unwrap_or(&empty_spans);
                let annotations = annotations_any
                    .downcast_ref::<FxHashMap<String, String>>()
                    .unwrap_or(&empty_annotations);
                fiber
                    .shared
                    .logger
                    .log(fiber.id(), level, &text, cause.as_ref(), spans, annotations);
                apply_value(&mut run, &fiber, Box::new(()))
            }
            Effect::YieldNow => {
                run.current = Some(Effect::unit());
                drop(run);
                fiber.schedule_turn();
                return;
            }
            Effect::Fork {
                effect,
                scope_override,
            } => {
                let child = fork_child(&mut run, &fiber, *effect, scope_override);
                apply_value(&mut run, &fiber, Box::new(child))
            }
            Effect::RaceWith {
                left,
                right,
                on_left,
                on_right,
            } => {
                let epoch = fiber.new_epoch();
                fiber.enter_suspension(epoch, run.interrupting, run.interruptible, None);
                let own_scope = Some(Scope::local(&fiber));
                let left_ctx = fork_child(&mut run, &fiber, *left, own_scope.clone());
                let right_ctx = fork_child(&mut run, &fiber, *right, own_scope);

                let winner = Arc::new(AtomicBool::new(false));
                arm_racer(
                    &fiber,
                    epoch,
                    &winner,
                    left_ctx.clone(),
                    right_ctx.clone(),
                    on_left,
                );
                arm_racer(&fiber, epoch, &winner, right_ctx, left_ctx, on_right);
                if let Some(s) = &fiber.supervisor {
                    s.on_suspend(fiber.id());
                }
                drop(run);
                return;
            }
            Effect::Async {
                register,
                blocking_on,
            } => {
                let epoch = fiber.new_epoch();
                fiber.enter_suspension(epoch, run.interrupting, run.interruptible, blocking_on);
                if let Some(s) = &fiber.supervisor {
                    s.on_suspend(fiber.id());
                }
                // The registration runs outside the run lock so a resume
                // arriving during it can take the lock and start a turn.
                drop(run);
                let resume = ResumeInner {
                    fiber: fiber.clone(),
                    epoch,
                };
                match panic::catch_unwind(AssertUnwindSafe(move || register(resume))) {
                    Ok(AsyncOutcome::Resumed(effect)) => {
                        fiber.try_resume(epoch, effect);
                    }
                    Ok(AsyncOutcome::Pending { canceller }) => {
                        fiber.register_canceller(epoch, canceller);
                    }
                    Err(payload) => {
                        fiber.try_resume(epoch, Effect::die_now(Defect::from_panic(payload)));
                    }
                }
                return;
            }
            Effect::Finish(exit) => {
                let children = fiber.live_children();
                if children.is_empty() {
                    finalize(run, &fiber, exit);
                    return;
                }
                // Interrupt every live child now, then await them all and
                // re-enter finalization; children forked by finalizers in
                // the meantime are caught by the re-check. A child exit
                // that carries more than the teardown interrupt is
                // suppressed, not dropped.
                let me = fiber.id();
                let mut awaits = Effect::unit();
                for child in children {
                    child.interrupt_as(me);
                    let owner = fiber.clone();
                    awaits = awaits.and_discard(Effect::FlatMap {
                        first: Box::new(await_effect(child)),
                        k: Box::new(move |val| {
                            if let Ok(exit) = val.downcast::<Exit>() {
                                if let Exit::Failure(cause) = exit.as_ref() {
                                    let residual = cause.strip_interrupts();
                                    if !residual.is_empty() {
                                        owner.suppress(residual);
                                    }
                                }
                            }
                            Effect::unit()
                        }),
                    });
                }
                Effect::SetInterruptible {
                    effect: Box::new(awaits.and_discard(Effect::Finish(exit))),
                    flag: false,
                }
            }
        };
    }
}

/// Deliver a success value to the continuation stack.
///
/// Returns the next effect to evaluate; an empty stack means the fiber's
/// body is done and finalization begins. Popping a `RestoreInterrupt`
/// returns control to the loop head so a newly interruptible fiber observes
/// pending interrupts before running further continuations.
fn apply_value(run: &mut RunState, fiber: &Arc<FiberContext>, value: Val) -> Effect {
    let mut value = value;
    loop {
        match run.stack.pop() {
            None => return Effect::Finish(Exit::Success(Arc::from(value))),
            Some(Frame::OnSuccess(k)) => return protect(move || k(value)),
            Some(Frame::Handler { on_success, .. }) => return protect(move || on_success(value)),
            Some(Frame::RestoreInterrupt) => {
                if let Some(prev) = run.interrupt_stack.pop() {
                    run.interruptible = prev;
                }
                return Effect::Succeed(value);
            }
            Some(Frame::Finalizer(finalizer)) => {
                let cleanup = protect(|| finalizer(ExitView::Success(value.as_ref())));
                run.stash.push(value);
                let owner = fiber.clone();
                // The merge handler sits inside an uninterruptible region,
                // so interrupt-unwinding can never discard it and the
                // stashed value is always popped. A failing cleanup is
                // suppressed; the primary success still stands.
                return Effect::SetInterruptible {
                    effect: Box::new(Effect::Fold {
                        first: Box::new(cleanup),
                        on_failure: Box::new(move |cause| {
                            owner.suppress(cause);
                            Effect::Unstash
                        }),
                        on_success: Box::new(|_| Effect::Unstash),
                    }),
                    flag: false,
                };
            }
            Some(Frame::RestoreEnv(env)) => run.env = env,
            Some(Frame::RestoreForkScope(scope)) => run.fork_scope = scope,
            Some(Frame::RestoreSupervisor(supervisor)) => run.supervisor = supervisor,
            Some(Frame::RestoreRef {
                fiber_ref,
                previous,
            }) => run.refs.restore(&fiber_ref, previous),
        }
    }
}

/// Unwind the continuation stack with a failure cause.
///
/// Handlers are discarded while an interrupt is pending and the fiber is
/// interruptible; each discard strips typed failures from the cause, since
/// the handler that would have observed them never runs.
fn unwind(run: &mut RunState, fiber: &FiberContext, cause: Cause) -> Effect {
    let mut cause = cause;
    loop {
        match run.stack.pop() {
            None => return Effect::Finish(Exit::Failure(cause)),
            Some(Frame::OnSuccess(_)) => {}
            Some(Frame::Handler { on_failure, .. }) => {
                if run.interruptible && fiber.interrupt_pending() {
                    cause = cause.strip_failures();
                } else {
                    run.interrupting = false;
                    return protect(move || on_failure(cause));
                }
            }
            Some(Frame::RestoreInterrupt) => {
                if let Some(prev) = run.interrupt_stack.pop() {
                    run.interruptible = prev;
                }
            }
            Some(Frame::Finalizer(finalizer)) => {
                let cleanup = protect(|| finalizer(ExitView::Failure(&cause)));
                let primary = cause.clone();
                return Effect::SetInterruptible {
                    effect: Box::new(Effect::Fold {
                        first: Box::new(cleanup),
                        on_failure: Box::new(move |late| Effect::fail_now(primary.then(late))),
                        on_success: Box::new(move |_| Effect::fail_now(cause)),
                    }),
                    flag: false,
                };
            }
            Some(Frame::RestoreEnv(env)) => run.env = env,
            Some(Frame::RestoreForkScope(scope)) => run.fork_scope = scope,
            Some(Frame::RestoreSupervisor(supervisor)) => run.supervisor = supervisor,
            Some(Frame::RestoreRef {
                fiber_ref,
                previous,
            }) => run.refs.restore(&fiber_ref, previous),
        }
    }
}

/// Spawn a child fiber: forked refs, the parent's environment and
/// supervisor, and registration with the resolved scope.
fn fork_child(
    run: &mut RunState,
    fiber: &Arc<FiberContext>,
    effect: Effect,
    scope_override: Option<Scope>,
) -> Arc<FiberContext> {
    let child = FiberContext::new(
        effect,
        run.env.clone(),
        run.refs.fork(),
        run.supervisor.clone(),
        fiber.scheduler.clone(),
        fiber.shared.clone(),
    );
    let scope = scope_override
        .or_else(|| run.fork_scope.clone())
        .unwrap_or_else(|| Scope::local(fiber));
    if !scope.add(&child) {
        // The scope owner is gone; the child observes interruption on its
        // first instruction instead of running unsupervised.
        child.pre_interrupt(fiber.id());
    }
    if let Some(s) = &run.supervisor {
        s.on_start(&run.env, Some(fiber.id()), child.id());
    }
    child.schedule_turn();
    child
}

/// Observe one side of a race. The first sibling to complete wins the flag
/// and resumes the racing fiber; the loser's resumption is stale by epoch.
fn arm_racer(
    fiber: &Arc<FiberContext>,
    epoch: u64,
    winner: &Arc<AtomicBool>,
    own: Arc<FiberContext>,
    other: Arc<FiberContext>,
    on_win: crate::effect::RaceCont,
) {
    let resume = ResumeInner {
        fiber: fiber.clone(),
        epoch,
    };
    let winner = winner.clone();
    let observed = own.clone();
    own.add_observer(Box::new(move |exit| {
        if winner.swap(true, Ordering::AcqRel) {
            return;
        }
        let continuation = protect(move || on_win(exit, other));
        resume.resume(Effect::FlatMap {
            first: Box::new(Effect::InheritRefs(observed)),
            k: Box::new(move |_| continuation),
        });
    }));
}

/// Produce the final exit: merge the suppressed cause, publish completion,
/// and release the fiber's resources.
fn finalize(
    mut run: parking_lot::MutexGuard<'_, RunState>,
    fiber: &Arc<FiberContext>,
    exit: Exit,
) {
    let suppressed = fiber.take_suppressed();
    let final_exit = match exit {
        Exit::Failure(primary) => Exit::Failure(primary.then(suppressed)),
        Exit::Success(value) => {
            if suppressed.is_empty() {
                Exit::Success(value)
            } else if suppressed.is_interrupted() {
                // Interrupted fibers never report success, even when an
                // uninterruptible body ran to completion.
                Exit::Failure(suppressed)
            } else {
                (fiber.shared.reporter)(&suppressed);
                Exit::Success(value)
            }
        }
    };
    let refs = std::mem::take(&mut run.refs);
    run.stack.clear();
    run.interrupt_stack.clear();
    run.stash.clear();
    run.current = None;
    drop(run);
    fiber.complete(final_exit, refs);
}
