//! Interruption semantics: prompt cancellation of parked fibers, stale
//! resume handles, cancellers, uninterruptible regions, and the handler
//! discard rule during an interrupt unwind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use strand_runtime::io::{self, Io};
use strand_runtime::{
    AsyncRegistration, Exit, Fiber, Never, Resume, Runtime, TestScheduler,
};

fn test_runtime() -> (Arc<TestScheduler>, Runtime) {
    let sched = TestScheduler::new();
    let rt = Runtime::builder().scheduler(sched.clone()).build();
    (sched, rt)
}

type Gate = Arc<Mutex<Option<Resume<(), Never>>>>;

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
fn test_interrupt_wakes_parked_fiber() {
    let (sched, rt) = test_runtime();
    let (slot, gate) = gate();
    let fiber = rt.spawn(gate);
    sched.run_until_idle();
    assert!(fiber.poll().is_none());

    let killer = rt.spawn(fiber.interrupt::<Never>());
    sched.run_until_idle();

    let exit = fiber.poll().unwrap();
    assert!(exit.is_interrupted());
    // The interruptor observed the same exit.
    let seen = killer.poll().unwrap().value::<Exit>().unwrap();
    assert!(seen.is_interrupted());
    // The suspension's resume handle is stale now.
    assert!(!slot.lock().unwrap().take().unwrap().succeed(()));
}

#[test]
fn test_interrupting_a_done_fiber_returns_its_exit() {
    let (sched, rt) = test_runtime();
    let fiber = rt.spawn(Io::<i32, Never>::succeed(5));
    sched.run_until_idle();

    let killer = rt.spawn(fiber.interrupt::<Never>());
    sched.run_until_idle();
    let seen = killer.poll().unwrap().value::<Exit>().unwrap();
    assert_eq!(seen.value::<i32>(), Some(5));
}

#[test]
fn test_canceller_runs_when_interrupted_while_parked() {
    let (sched, rt) = test_runtime();
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();
    let program = Io::<(), Never>::async_io(move |_resume| AsyncRegistration::Pending {
        canceller: Some(Io::attempt(move || flag.store(true, Ordering::SeqCst))),
    });
    let fiber = rt.spawn(program);
    sched.run_until_idle();

    rt.spawn(fiber.interrupt::<Never>());
    sched.run_until_idle();
    assert!(cancelled.load(Ordering::SeqCst));
    assert!(fiber.poll().unwrap().is_interrupted());
}

#[test]
fn test_uninterruptible_region_defers_interruption() {
    let (sched, rt) = test_runtime();
    let (slot, gate) = gate();
    let finished = Arc::new(AtomicBool::new(false));
    let flag = finished.clone();
    let body = gate
        .zip_right(Io::attempt(move || flag.store(true, Ordering::SeqCst)))
        .uninterruptible();
    let fiber = rt.spawn(body);
    sched.run_until_idle();

    let killer = rt.spawn(fiber.interrupt::<Never>());
    sched.run_until_idle();
    // The interrupt is pending but the shielded suspension stays parked.
    assert!(fiber.poll().is_none());
    assert!(!finished.load(Ordering::SeqCst));

    assert!(slot.lock().unwrap().take().unwrap().succeed(()));
    sched.run_until_idle();
    // The body ran to the end of the region, then interruption took over.
    assert!(finished.load(Ordering::SeqCst));
    assert!(fiber.poll().unwrap().is_interrupted());
    assert!(killer.poll().is_some());
}

#[test]
fn test_mask_restore_reopens_interruption() {
    let (sched, rt) = test_runtime();
    let (slot, gate) = gate();
    let program = Io::<(), Never>::uninterruptible_mask(move |mask| mask.restore(gate));
    let fiber = rt.spawn(program);
    sched.run_until_idle();

    rt.spawn(fiber.interrupt::<Never>());
    sched.run_until_idle();
    // No resume was needed: the restored region is promptly interruptible.
    assert!(fiber.poll().unwrap().is_interrupted());
    drop(slot);
}

#[test]
fn test_discarded_handler_does_not_leak_typed_failure() {
    let (sched, rt) = test_runtime();
    let slot: Arc<Mutex<Option<Fiber<i32, Never>>>> = Arc::new(Mutex::new(None));
    let shared = slot.clone();
    let handled = Arc::new(AtomicBool::new(false));
    let flag = handled.clone();

    // Make interruption pending while shielded, then fail. The unwind
    // leaves the region with an interrupt pending, so the outer handler
    // must be discarded and the failure stripped from the exit.
    let self_interrupt = Io::<(), &'static str>::suspend(move || {
        let me = shared.lock().unwrap().take().unwrap();
        me.interrupt_as::<&'static str>(me.id())
    });
    let program = self_interrupt
        .zip_right(Io::<i32, &'static str>::fail("boom"))
        .uninterruptible()
        .catch_all::<Never>(move |_| {
            flag.store(true, Ordering::SeqCst);
            Io::succeed(0)
        });

    let fiber = rt.spawn(program);
    *slot.lock().unwrap() = Some(fiber.clone());
    sched.run_until_idle();

    let exit = fiber.poll().unwrap();
    assert!(!handled.load(Ordering::SeqCst));
    assert!(exit.is_interrupted());
    assert!(!exit.cause().unwrap().is_failure());
}

#[test]
fn test_multiple_interruptors_accumulate_without_duplicates() {
    let (sched, rt) = test_runtime();
    let (_slot, gate) = gate();
    let target = rt.spawn(gate);
    sched.run_until_idle();

    let spawn_killer = || {
        let t = target.clone();
        rt.spawn(io::fiber_id::<Never>().flat_map(move |me| {
            t.interrupt_as::<Never>(me)
                .zip_right(t.interrupt_as::<Never>(me))
                .map(move |_| me)
        }))
    };
    let k1 = spawn_killer();
    let k2 = spawn_killer();
    sched.run_until_idle();

    let id1 = k1.poll().unwrap().value::<strand_runtime::FiberId>().unwrap();
    let id2 = k2.poll().unwrap().value::<strand_runtime::FiberId>().unwrap();
    let cause = target.poll().unwrap().cause().unwrap().clone();
    let interruptors = cause.interruptors();
    assert!(interruptors.contains(&id1));
    assert!(interruptors.contains(&id2));
    assert_eq!(interruptors.len(), 2);
}

#[test]
fn test_interrupting_status_survives_preempted_delivery() {
    let sched = TestScheduler::new();
    let rt = Runtime::builder()
        .scheduler(sched.clone())
        .max_ops(1)
        .build();
    let (_slot, gate) = gate();
    let fiber = rt.spawn(gate);
    sched.run_until_idle();
    assert!(fiber.status().is_suspended());

    // With a one-op budget the interrupt delivery spans several turns;
    // the status must keep reporting it the whole way.
    rt.spawn(fiber.interrupt::<Never>());
    let mut saw_interrupting = false;
    for _ in 0..100 {
        if fiber.poll().is_some() {
            break;
        }
        if fiber.status().is_interrupting() {
            saw_interrupting = true;
        } else {
            assert!(!saw_interrupting, "interrupting status dropped mid-delivery");
        }
        sched.step();
    }
    assert!(saw_interrupting);
    assert!(fiber.poll().unwrap().is_interrupted());
}

#[test]
fn test_interrupt_as_attributes_the_interruptor() {
    let (sched, rt) = test_runtime();
    let (_slot, gate) = gate();
    let fiber = rt.spawn(gate);
    sched.run_until_idle();

    let killer = rt.spawn(
        io::fiber_id::<Never>()
            .flat_map({
                let target = fiber.clone();
                move |me| target.interrupt_as::<Never>(me).map(move |_| me)
            })
            .zip_left(fiber.awaiting::<Never>().unit_value()),
    );
    sched.run_until_idle();

    let killer_id = killer.poll().unwrap().value::<strand_runtime::FiberId>().unwrap();
    let cause = fiber.poll().unwrap().cause().unwrap().clone();
    assert!(cause.interruptors().contains(&killer_id));
}
