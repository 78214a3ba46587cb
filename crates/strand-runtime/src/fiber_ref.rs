//! Fiber-local references.
//!
//! A [`FiberRef`] is a storage key whose value lives in the reading fiber,
//! not in the reference. Forking copies the parent's entries through each
//! reference's `fork` transform; joining a child merges its entries back
//! through `join`. All access goes through effects, so a fiber's entries are
//! only ever touched from its own interpreter turn and need no locking.

use crate::effect::{Effect, RefUpdate, Val};
use crate::io::Io;
use rustc_hash::FxHashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use strand_core::AnyValue;

type ForkFn = Box<dyn Fn(&AnyValue) -> AnyValue + Send + Sync>;
type JoinFn = Box<dyn Fn(&AnyValue, &AnyValue) -> AnyValue + Send + Sync>;

/// The erased identity of a reference: its key, initial value, and
/// fork/join transforms. Shared by every typed handle cloned from one
/// `FiberRef::new`.
pub(crate) struct RefInner {
    id: u64,
    initial: AnyValue,
    fork: ForkFn,
    join: JoinFn,
}

pub(crate) type ErasedRef = Arc<RefInner>;

impl RefInner {
    pub(crate) fn initial(&self) -> AnyValue {
        self.initial.clone()
    }
}

fn next_ref_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// A typed fiber-local reference.
///
/// Cloning the handle aliases the same storage key. Two references created
/// by separate `new` calls never alias, even with equal initial values.
pub struct FiberRef<A> {
    inner: ErasedRef,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for FiberRef<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A> FiberRef<A>
where
    A: Clone + Send + Sync + 'static,
{
    /// A reference whose children start with a copy of the parent's value
    /// and whose joins adopt the child's value.
    #[must_use]
    pub fn new(initial: A) -> Self {
        Self::with_transforms(initial, |v: &A| v.clone(), |_parent, child: &A| {
            child.clone()
        })
    }

    /// A reference with explicit fork and join transforms.
    ///
    /// `fork` maps the parent's value to the child's starting value; `join`
    /// merges `(parent, child)` into the parent's new value when a child is
    /// joined or inherited.
    pub fn with_transforms(
        initial: A,
        fork: impl Fn(&A) -> A + Send + Sync + 'static,
        join: impl Fn(&A, &A) -> A + Send + Sync + 'static,
    ) -> Self {
        let inner = Arc::new(RefInner {
            id: next_ref_id(),
            initial: Arc::new(initial),
            fork: Box::new(move |v| match v.downcast_ref::<A>() {
                Some(v) => Arc::new(fork(v)),
                None => v.clone(),
            }),
            join: Box::new(move |parent, child| {
                match (parent.downcast_ref::<A>(), child.downcast_ref::<A>()) {
                    (Some(p), Some(c)) => Arc::new(join(p, c)),
                    _ => child.clone(),
                }
            }),
        });
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    /// Read the current fiber's value (or the initial value).
    #[must_use]
    pub fn get<E>(&self) -> Io<A, E>
    where
        E: Send + Sync + 'static,
    {
        self.modify(|a| (a.clone(), a))
    }

    /// Replace the current fiber's value.
    #[must_use]
    pub fn set<E>(&self, value: A) -> Io<(), E>
    where
        E: Send + Sync + 'static,
    {
        self.modify(move |_| ((), value))
    }

    /// Transform the current fiber's value.
    #[must_use]
    pub fn update<E>(&self, f: impl FnOnce(A) -> A + Send + 'static) -> Io<(), E>
    where
        E: Send + Sync + 'static,
    {
        self.modify(move |a| ((), f(a)))
    }

    /// Atomically (with respect to this fiber) compute a result and a new
    /// value from the current one.
    #[must_use]
    pub fn modify<B, E>(&self, f: impl FnOnce(A) -> (B, A) + Send + 'static) -> Io<B, E>
    where
        B: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        let fiber_ref = self.inner.clone();
        Io::wrap(Effect::RefModify {
            fiber_ref,
            f: Box::new(move |current| match current.downcast_ref::<A>() {
                Some(a) => {
                    let (b, next) = f(a.clone());
                    (Box::new(b) as Val, RefUpdate::Set(Arc::new(next)))
                }
                None => (Box::new(()) as Val, RefUpdate::Keep),
            }),
        })
    }

    /// Remove the current fiber's entry, reverting reads to the initial
    /// value.
    #[must_use]
    pub fn delete<E>(&self) -> Io<(), E>
    where
        E: Send + Sync + 'static,
    {
        let fiber_ref = self.inner.clone();
        Io::wrap(Effect::RefModify {
            fiber_ref,
            f: Box::new(|_| (Box::new(()) as Val, RefUpdate::Delete)),
        })
    }

    /// Run `io` with the reference set to `value`, restoring the previous
    /// entry afterwards on every path, including failure and interruption.
    #[must_use]
    pub fn locally<B, E>(&self, value: A, io: Io<B, E>) -> Io<B, E>
    where
        B: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        let fiber_ref = self.inner.clone();
        Io::wrap(Effect::RefLocally {
            fiber_ref,
            value: Arc::new(value),
            effect: Box::new(io.into_effect()),
        })
    }

    pub(crate) fn erased(&self) -> ErasedRef {
        self.inner.clone()
    }
}

/// One fiber's reference entries.
///
/// Owned by the fiber's run state; never shared across threads while the
/// fiber runs.
#[derive(Default)]
pub(crate) struct FiberRefs {
    entries: FxHashMap<u64, (ErasedRef, AnyValue)>,
}

impl FiberRefs {
    /// Current value for `fiber_ref`, falling back to its initial value.
    pub(crate) fn get(&self, fiber_ref: &ErasedRef) -> AnyValue {
        match self.entries.get(&fiber_ref.id) {
            Some((_, value)) => value.clone(),
            None => fiber_ref.initial(),
        }
    }

    /// Entry for `fiber_ref`, without the initial-value fallback.
    pub(crate) fn get_entry(&self, fiber_ref: &ErasedRef) -> Option<AnyValue> {
        self.entries.get(&fiber_ref.id).map(|(_, v)| v.clone())
    }

    pub(crate) fn set(&mut self, fiber_ref: &ErasedRef, value: AnyValue) {
        self.entries
            .insert(fiber_ref.id, (fiber_ref.clone(), value));
    }

    pub(crate) fn delete(&mut self, fiber_ref: &ErasedRef) {
        self.entries.remove(&fiber_ref.id);
    }

    /// Restore the state a `locally` saved: `Some` re-sets the previous
    /// value, `None` removes the scoped entry.
    pub(crate) fn restore(&mut self, fiber_ref: &ErasedRef, previous: Option<AnyValue>) {
        match previous {
            Some(value) => self.set(fiber_ref, value),
            None => self.delete(fiber_ref),
        }
    }

    /// The entries a newly forked child starts with: every entry mapped
    /// through its reference's fork transform.
    pub(crate) fn fork(&self) -> Self {
        let entries = self
            .entries
            .values()
            .map(|(r, v)| (r.id, (r.clone(), (r.fork)(v))))
            .collect();
        Self { entries }
    }

    /// Merge a completed child's entries into this fiber through each
    /// reference's join transform. References the child never touched are
    /// left alone.
    pub(crate) fn inherit(&mut self, child: &Self) {
        for (id, (r, child_value)) in &child.entries {
            let parent_value = match self.entries.get(id) {
                Some((_, v)) => v.clone(),
                None => r.initial(),
            };
            let merged = (r.join)(&parent_value, child_value);
            self.entries.insert(*id, (r.clone(), merged));
        }
    }
}

// ==== Builtin references =================================================

/// Log spans active for the current fiber, outermost first. Children
/// inherit their parent's spans; joins keep the parent's.
pub(crate) fn log_spans() -> &'static FiberRef<Vec<String>> {
    static SPANS: OnceLock<FiberRef<Vec<String>>> = OnceLock::new();
    SPANS.get_or_init(|| {
        FiberRef::with_transforms(Vec::new(), Clone::clone, |parent, _child| parent.clone())
    })
}

/// Log annotations for the current fiber. Same inheritance as spans.
pub(crate) fn log_annotations() -> &'static FiberRef<FxHashMap<String, String>> {
    static ANNOTATIONS: OnceLock<FiberRef<FxHashMap<String, String>>> = OnceLock::new();
    ANNOTATIONS.get_or_init(|| {
        FiberRef::with_transforms(FxHashMap::default(), Clone::clone, |parent, _child| {
            parent.clone()
        })
    })
}
