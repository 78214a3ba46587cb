//! End-to-end tests for the sequential effect surface: construction,
//! sequencing, error handling, environment access, and turn scheduling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use strand_runtime::io::{self, Io};
use strand_runtime::{
    AsyncRegistration, Exit, Never, Resume, Runtime, TestScheduler,
};

fn test_runtime() -> (Arc<TestScheduler>, Runtime) {
    let sched = TestScheduler::new();
    let rt = Runtime::builder().scheduler(sched.clone()).build();
    (sched, rt)
}

type Gate = Arc<Mutex<Option<Resume<(), Never>>>>;

/// An effect that parks until the test fires the returned handle.
fn gate() -> (Gate, Io<(), Never>) {
    let slot: Gate = Arc::new(Mutex::new(None));
    let shared = slot.clone();
    let io = Io::async_io(move |resume| {
        *shared.lock().unwrap() = Some(resume);
        AsyncRegistration::Pending { canceller: None }
    });
    (slot, io)
}

#[test]
fn test_map_and_flat_map() {
    let (sched, rt) = test_runtime();
    let program = Io::<i32, Never>::succeed(6)
        .map(|n| n * 7)
        .flat_map(|n| Io::succeed(n.to_string()));
    let fiber = rt.spawn(program);
    sched.run_until_idle();
    let exit = fiber.poll().unwrap();
    assert_eq!(exit.value::<String>().as_deref(), Some("42"));
}

#[test]
fn test_attempt_runs_lazily() {
    let (sched, rt) = test_runtime();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let program = Io::<i32, Never>::attempt(move || {
        flag.store(true, Ordering::SeqCst);
        1
    });
    let fiber = rt.spawn(program);
    // Describing and even spawning runs nothing until the scheduler turns.
    assert!(!ran.load(Ordering::SeqCst));
    sched.run_until_idle();
    assert!(ran.load(Ordering::SeqCst));
    assert_eq!(fiber.poll().unwrap().value::<i32>(), Some(1));
}

#[test]
fn test_typed_failure_is_caught() {
    let (sched, rt) = test_runtime();
    let program = Io::<i32, &'static str>::fail("boom")
        .catch_all::<Never>(|e| Io::succeed(if e == "boom" { 1 } else { 0 }));
    let fiber = rt.spawn(program);
    sched.run_until_idle();
    assert_eq!(fiber.poll().unwrap().value::<i32>(), Some(1));
}

#[test]
fn test_fold_handles_both_channels() {
    let (sched, rt) = test_runtime();
    let failing = Io::<i32, &'static str>::fail("bad").fold::<i32, Never>(|_| -1, |n| n);
    let succeeding = Io::<i32, &'static str>::succeed(3).fold::<i32, Never>(|_| -1, |n| n);
    let a = rt.spawn(failing);
    let b = rt.spawn(succeeding);
    sched.run_until_idle();
    assert_eq!(a.poll().unwrap().value::<i32>(), Some(-1));
    assert_eq!(b.poll().unwrap().value::<i32>(), Some(3));
}

#[test]
fn test_from_result() {
    let (sched, rt) = test_runtime();
    let ok = rt.spawn(Io::<i32, String>::from_result(Ok(5)).result::<Never>());
    let err = rt.spawn(Io::<i32, String>::from_result(Err("no".to_string())).result::<Never>());
    sched.run_until_idle();
    assert_eq!(ok.poll().unwrap().value::<Result<i32, String>>(), Some(Ok(5)));
    assert_eq!(
        err.poll().unwrap().value::<Result<i32, String>>(),
        Some(Err("no".to_string()))
    );
}

#[test]
fn test_panic_becomes_defect_and_skips_typed_handlers() {
    let (sched, rt) = test_runtime();
    let caught = Arc::new(AtomicBool::new(false));
    let flag = caught.clone();
    let program = Io::<i32, &'static str>::attempt(|| panic!("kaboom")).catch_all::<Never>(
        move |_| {
            flag.store(true, Ordering::SeqCst);
            Io::succeed(0)
        },
    );
    let fiber = rt.spawn(program);
    sched.run_until_idle();
    let exit = fiber.poll().unwrap();
    let cause = exit.cause().unwrap();
    assert!(cause.is_die());
    assert!(!caught.load(Ordering::SeqCst));
    assert_eq!(cause.defects()[0].describe(), "kaboom");
}

#[test]
fn test_catch_all_cause_recovers_defects() {
    let (sched, rt) = test_runtime();
    let program = Io::<i32, Never>::attempt(|| panic!("kaboom"))
        .catch_all_cause::<Never>(|cause| Io::succeed(if cause.is_die() { 1 } else { 0 }));
    let fiber = rt.spawn(program);
    sched.run_until_idle();
    assert_eq!(fiber.poll().unwrap().value::<i32>(), Some(1));
}

#[test]
fn test_environment_provide_and_read() {
    let (sched, rt) = test_runtime();
    let program = io::environment::<String, Never>()
        .map(|s| s.len())
        .provide("hello".to_string());
    let fiber = rt.spawn(program);
    sched.run_until_idle();
    assert_eq!(fiber.poll().unwrap().value::<usize>(), Some(5));
}

#[test]
fn test_environment_type_mismatch_is_a_defect() {
    let (sched, rt) = test_runtime();
    let fiber = rt.spawn(io::environment::<String, Never>());
    sched.run_until_idle();
    let exit = fiber.poll().unwrap();
    assert!(exit.cause().unwrap().is_die());
}

#[test]
fn test_yield_interleaves_fibers() {
    let (sched, rt) = test_runtime();
    let order = Arc::new(Mutex::new(Vec::new()));
    let step = |tag: &'static str, n: u32| {
        let order = order.clone();
        Io::<(), Never>::attempt(move || order.lock().unwrap().push(format!("{tag}{n}")))
    };
    let a = step("a", 1).zip_right(io::yield_now()).zip_right(step("a", 2));
    let b = step("b", 1).zip_right(io::yield_now()).zip_right(step("b", 2));
    rt.spawn(a);
    rt.spawn(b);
    sched.run_until_idle();
    assert_eq!(*order.lock().unwrap(), vec!["a1", "b1", "a2", "b2"]);
}

#[test]
fn test_deep_flat_map_chain_is_stack_safe() {
    let (sched, rt) = test_runtime();
    let program = (0..50_000).fold(Io::<i64, Never>::succeed(0), |io, _| io.map(|n| n + 1));
    let fiber = rt.spawn(program);
    sched.run_until_idle();
    assert_eq!(fiber.poll().unwrap().value::<i64>(), Some(50_000));
}

#[test]
fn test_join_propagates_typed_failure() {
    let (sched, rt) = test_runtime();
    let program = Io::<i32, &'static str>::fail("boom")
        .fork::<&'static str>()
        .flat_map(|child| child.join())
        .catch_all::<Never>(|e| Io::succeed(if e == "boom" { 1 } else { 0 }));
    let fiber = rt.spawn(program);
    sched.run_until_idle();
    assert_eq!(fiber.poll().unwrap().value::<i32>(), Some(1));
}

#[test]
fn test_async_resumes_with_value() {
    let (sched, rt) = test_runtime();
    let (slot, gate) = gate();
    let fiber = rt.spawn(gate.map(|_| 9));
    sched.run_until_idle();
    assert!(fiber.poll().is_none());
    assert!(slot.lock().unwrap().take().unwrap().succeed(()));
    sched.run_until_idle();
    assert_eq!(fiber.poll().unwrap().value::<i32>(), Some(9));
}

#[test]
fn test_async_inline_resume() {
    let (sched, rt) = test_runtime();
    let program = Io::<i32, Never>::async_io(|_resume| {
        AsyncRegistration::Resumed(Io::succeed(3))
    });
    let fiber = rt.spawn(program);
    sched.run_until_idle();
    assert_eq!(fiber.poll().unwrap().value::<i32>(), Some(3));
}

#[test]
fn test_eval_on_splices_into_target_turn() {
    let (sched, rt) = test_runtime();
    let order = Arc::new(Mutex::new(Vec::new()));
    let step = |tag: &'static str| {
        let order = order.clone();
        Io::<(), Never>::attempt(move || order.lock().unwrap().push(tag))
    };

    let (slot, gate) = gate();
    let target = rt.spawn(gate.zip_right(step("resumed")));
    sched.run_until_idle();

    let driver = rt.spawn(target.eval_on(step("mailbox"), step("fallback")));
    sched.run_until_idle();
    assert!(driver.poll().is_some());
    // The spliced effect waits for the target's next turn.
    assert!(order.lock().unwrap().is_empty());

    slot.lock().unwrap().take().unwrap().succeed(());
    sched.run_until_idle();
    assert_eq!(*order.lock().unwrap(), vec!["mailbox", "resumed"]);

    // Once the target is done the fallback runs in the caller instead.
    let late = rt.spawn(target.eval_on(step("late"), step("fallback")));
    sched.run_until_idle();
    assert!(late.poll().is_some());
    assert_eq!(*order.lock().unwrap(), vec!["mailbox", "resumed", "fallback"]);
}

#[test]
fn test_exit_reaches_every_observer_exactly_once() {
    let (sched, rt) = test_runtime();
    let (slot, gate) = gate();
    let target = rt.spawn(gate.map(|_| 11));
    sched.run_until_idle();

    // Two observers registered before completion.
    let early_a = rt.spawn(target.awaiting::<Never>());
    let early_b = rt.spawn(target.awaiting::<Never>());
    sched.run_until_idle();
    assert!(early_a.poll().is_none());

    slot.lock().unwrap().take().unwrap().succeed(());
    sched.run_until_idle();

    // And one registered after; it resolves without suspending.
    let late = rt.spawn(target.awaiting::<Never>());
    sched.run_until_idle();

    for watcher in [early_a, early_b, late] {
        let seen = watcher.poll().unwrap().value::<Exit>().unwrap();
        assert_eq!(seen.value::<i32>(), Some(11));
    }
    assert_eq!(target.poll().unwrap().value::<i32>(), Some(11));
}

#[test]
fn test_interrupt_status_reflects_region() {
    let (sched, rt) = test_runtime();
    let program = io::interrupt_status::<Never>().flat_map(|outer| {
        io::interrupt_status::<Never>()
            .uninterruptible()
            .map(move |inner| (outer, inner))
    });
    let fiber = rt.spawn(program);
    sched.run_until_idle();
    assert_eq!(fiber.poll().unwrap().value::<(bool, bool)>(), Some((true, false)));
}
