//! Fiber-local references across fork and join: fork transforms, join
//! merges, scoped overrides, and deletion back to the initial value.

use std::sync::Arc;
use strand_runtime::io::Io;
use strand_runtime::{FiberRef, Never, Runtime, TestScheduler};

fn test_runtime() -> (Arc<TestScheduler>, Runtime) {
    let sched = TestScheduler::new();
    let rt = Runtime::builder().scheduler(sched.clone()).build();
    (sched, rt)
}

#[test]
fn test_child_update_flows_back_through_join() {
    let (sched, rt) = test_runtime();
    let r = FiberRef::new(0_i32);
    let setter = r.clone();
    let child_ref = r.clone();
    let reader = r.clone();
    let program = setter
        .set::<Never>(1)
        .zip_right(
            child_ref
                .update::<Never>(|n| n + 5)
                .fork::<Never>()
                .flat_map(|child| child.join()),
        )
        .zip_right(reader.get::<Never>());
    let fiber = rt.spawn(program);
    sched.run_until_idle();
    assert_eq!(fiber.poll().unwrap().value::<i32>(), Some(6));
}

#[test]
fn test_awaiting_does_not_merge_child_refs() {
    let (sched, rt) = test_runtime();
    let r = FiberRef::new(0_i32);
    let setter = r.clone();
    let child_ref = r.clone();
    let reader = r.clone();
    let program = setter
        .set::<Never>(1)
        .zip_right(
            child_ref
                .set::<Never>(2)
                .fork::<Never>()
                .flat_map(|child| child.awaiting::<Never>().map(|_| ())),
        )
        .zip_right(reader.get::<Never>());
    let fiber = rt.spawn(program);
    sched.run_until_idle();
    assert_eq!(fiber.poll().unwrap().value::<i32>(), Some(1));
}

#[test]
fn test_fork_transform_shapes_the_child_value() {
    let (sched, rt) = test_runtime();
    let r = FiberRef::with_transforms(0_i32, |v| v * 2, |_parent, child| *child);
    let setter = r.clone();
    let child_ref = r.clone();
    let program = setter.set::<Never>(3).zip_right(
        child_ref
            .get::<Never>()
            .fork::<Never>()
            .flat_map(|child| child.join()),
    );
    let fiber = rt.spawn(program);
    sched.run_until_idle();
    assert_eq!(fiber.poll().unwrap().value::<i32>(), Some(6));
}

#[test]
fn test_join_transform_merges_parent_and_child() {
    let (sched, rt) = test_runtime();
    let r = FiberRef::with_transforms(0_i32, |v| *v, |parent, child| parent + child);
    let setter = r.clone();
    let child_ref = r.clone();
    let reader = r.clone();
    let program = setter
        .set::<Never>(3)
        .zip_right(
            child_ref
                .set::<Never>(4)
                .fork::<Never>()
                .flat_map(|child| child.join()),
        )
        .zip_right(reader.get::<Never>());
    let fiber = rt.spawn(program);
    sched.run_until_idle();
    assert_eq!(fiber.poll().unwrap().value::<i32>(), Some(7));
}

#[test]
fn test_locally_scopes_the_value() {
    let (sched, rt) = test_runtime();
    let r = FiberRef::new(10_i32);
    let scoped = r.clone();
    let inside_ref = r.clone();
    let after_ref = r.clone();
    let program = scoped
        .locally(5, inside_ref.get::<Never>())
        .flat_map(move |inside| after_ref.get::<Never>().map(move |after| (inside, after)));
    let fiber = rt.spawn(program);
    sched.run_until_idle();
    assert_eq!(fiber.poll().unwrap().value::<(i32, i32)>(), Some((5, 10)));
}

#[test]
fn test_locally_restores_after_failure() {
    let (sched, rt) = test_runtime();
    let r = FiberRef::new(10_i32);
    let scoped = r.clone();
    let reader = r.clone();
    let program = scoped
        .locally(99, Io::<i32, &'static str>::fail("boom"))
        .catch_all::<Never>(|_| Io::succeed(0))
        .zip_right(reader.get::<Never>());
    let fiber = rt.spawn(program);
    sched.run_until_idle();
    assert_eq!(fiber.poll().unwrap().value::<i32>(), Some(10));
}

#[test]
fn test_delete_reverts_to_the_initial_value() {
    let (sched, rt) = test_runtime();
    let r = FiberRef::new(10_i32);
    let setter = r.clone();
    let deleter = r.clone();
    let reader = r.clone();
    let program = setter
        .set::<Never>(5)
        .zip_right(deleter.delete::<Never>())
        .zip_right(reader.get::<Never>());
    let fiber = rt.spawn(program);
    sched.run_until_idle();
    assert_eq!(fiber.poll().unwrap().value::<i32>(), Some(10));
}

#[test]
fn test_get_ref_reads_the_fibers_final_value() {
    let (sched, rt) = test_runtime();
    let r = FiberRef::new(0_i32);
    let child_ref = r.clone();
    let reader = r.clone();
    let program = child_ref
        .set::<Never>(9)
        .fork::<Never>()
        .flat_map(move |child| {
            child.get_ref::<i32, Never>(&r).flat_map(move |seen| {
                reader.get::<Never>().map(move |mine| (seen, mine))
            })
        });
    let fiber = rt.spawn(program);
    sched.run_until_idle();
    // The child's final value is visible, without merging into the caller.
    assert_eq!(fiber.poll().unwrap().value::<(i32, i32)>(), Some((9, 0)));
}

#[test]
fn test_modify_returns_the_computed_result() {
    let (sched, rt) = test_runtime();
    let r = FiberRef::new(2_i32);
    let program = r.modify::<i32, Never>(|n| (n * 10, n + 1)).flat_map({
        let reader = r.clone();
        move |result| reader.get::<Never>().map(move |now| (result, now))
    });
    let fiber = rt.spawn(program);
    sched.run_until_idle();
    assert_eq!(fiber.poll().unwrap().value::<(i32, i32)>(), Some((20, 3)));
}
