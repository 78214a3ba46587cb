//! Composable failure descriptions.
//!
//! A [`Cause`] records everything that went wrong while a fiber ran: typed
//! failures raised through the error channel, defects (panics and other
//! unexpected values), and interruptions, combined sequentially (`Then`) or
//! in parallel (`Both`). Causes compose associatively and are consumed at
//! the top of a fiber's stack or handed to the failure reporter.

use crate::FiberId;
use rustc_hash::FxHashSet;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// An erased, shareable payload. Success values and typed errors travel the
/// runtime in this form once they become part of a terminal result.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

// ============================================================================
// ErrorBox
// ============================================================================

/// A typed failure, erased for storage inside a [`Cause`].
///
/// Carries the error value plus its `Debug` rendering captured at
/// construction, so causes stay printable after erasure.
#[derive(Clone)]
pub struct ErrorBox {
    value: AnyValue,
    rendered: String,
}

impl ErrorBox {
    /// Erase a typed error.
    pub fn new<E>(error: E) -> Self
    where
        E: fmt::Debug + Send + Sync + 'static,
    {
        let rendered = format!("{error:?}");
        Self {
            value: Arc::new(error),
            rendered,
        }
    }

    /// Recover the typed error, if this box holds an `E`.
    #[must_use]
    pub fn downcast<E>(&self) -> Option<E>
    where
        E: Clone + Send + Sync + 'static,
    {
        self.value.downcast_ref::<E>().cloned()
    }

    /// The `Debug` rendering captured when the error was erased.
    #[must_use]
    pub fn rendered(&self) -> &str {
        &self.rendered
    }
}

impl fmt::Debug for ErrorBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

// ============================================================================
// Defect
// ============================================================================

/// An unexpected failure: a panic that escaped a computation, or a value the
/// program explicitly declared unrecoverable.
///
/// Defects propagate past ordinary error handlers; only handlers operating
/// on the full cause observe them.
#[derive(Clone)]
pub struct Defect {
    message: String,
    payload: Option<AnyValue>,
}

impl Defect {
    /// Create a defect from an explicit value.
    pub fn new<T>(value: T) -> Self
    where
        T: fmt::Debug + Send + Sync + 'static,
    {
        Self {
            message: format!("{value:?}"),
            payload: Some(Arc::new(value)),
        }
    }

    /// Create a defect carrying only a message.
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            payload: None,
        }
    }

    /// Create a defect from a panic payload.
    ///
    /// Panic payloads are `Send` but not necessarily `Sync`, so only the
    /// conventional `&str`/`String` messages are preserved.
    #[must_use]
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "fiber panicked".to_string()
        };
        Self {
            message,
            payload: None,
        }
    }

    /// The human-readable description of this defect.
    #[must_use]
    pub fn describe(&self) -> &str {
        &self.message
    }

    /// Recover the typed defect value, if one was attached.
    #[must_use]
    pub fn downcast<T>(&self) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.payload.as_ref()?.downcast_ref::<T>().cloned()
    }
}

impl fmt::Debug for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Defect({})", self.message)
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

// ============================================================================
// Cause
// ============================================================================

/// A description of how a fiber failed.
///
/// `Then` composes causes that occurred one after another (a finalizer
/// failing while another cause propagated); `Both` composes causes from
/// concurrent siblings. Composition through [`Cause::then`] and
/// [`Cause::both`] normalizes away `Empty` operands, which is what makes the
/// algebra associative in practice.
#[derive(Clone, Debug)]
pub enum Cause {
    /// No failure.
    Empty,
    /// A typed, expected failure raised through the error channel.
    Fail(ErrorBox),
    /// An unexpected failure.
    Die(Defect),
    /// Interruption requested by the given fiber.
    Interrupt(FiberId),
    /// Sequential composition: the left cause occurred, then the right.
    Then(Box<Cause>, Box<Cause>),
    /// Parallel composition: both causes occurred concurrently.
    Both(Box<Cause>, Box<Cause>),
}

impl Cause {
    /// A typed failure cause.
    pub fn fail<E>(error: E) -> Self
    where
        E: fmt::Debug + Send + Sync + 'static,
    {
        Self::Fail(ErrorBox::new(error))
    }

    /// A defect cause.
    #[must_use]
    pub fn die(defect: Defect) -> Self {
        Self::Die(defect)
    }

    /// An interruption cause attributed to `by`.
    #[must_use]
    pub fn interrupt(by: FiberId) -> Self {
        Self::Interrupt(by)
    }

    /// Sequential composition, normalizing empty operands.
    #[must_use]
    pub fn then(self, that: Self) -> Self {
        match (self, that) {
            (Self::Empty, c) | (c, Self::Empty) => c,
            (l, r) => Self::Then(Box::new(l), Box::new(r)),
        }
    }

    /// Parallel composition, normalizing empty operands.
    #[must_use]
    pub fn both(self, that: Self) -> Self {
        match (self, that) {
            (Self::Empty, c) | (c, Self::Empty) => c,
            (l, r) => Self::Both(Box::new(l), Box::new(r)),
        }
    }

    /// Check whether this cause records no failure at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Fail(_) | Self::Die(_) | Self::Interrupt(_) => false,
            Self::Then(l, r) | Self::Both(l, r) => l.is_empty() && r.is_empty(),
        }
    }

    /// Check whether any leaf is an interruption.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        match self {
            Self::Interrupt(_) => true,
            Self::Empty | Self::Fail(_) | Self::Die(_) => false,
            Self::Then(l, r) | Self::Both(l, r) => l.is_interrupted() || r.is_interrupted(),
        }
    }

    /// Check whether the cause is non-empty and consists only of
    /// interruptions.
    #[must_use]
    pub fn is_interrupted_only(&self) -> bool {
        fn only(cause: &Cause) -> bool {
            match cause {
                Cause::Empty | Cause::Interrupt(_) => true,
                Cause::Fail(_) | Cause::Die(_) => false,
                Cause::Then(l, r) | Cause::Both(l, r) => only(l) && only(r),
            }
        }
        !self.is_empty() && only(self)
    }

    /// Check whether any leaf is a typed failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        match self {
            Self::Fail(_) => true,
            Self::Empty | Self::Die(_) | Self::Interrupt(_) => false,
            Self::Then(l, r) | Self::Both(l, r) => l.is_failure() || r.is_failure(),
        }
    }

    /// Check whether any leaf is a defect.
    #[must_use]
    pub fn is_die(&self) -> bool {
        match self {
            Self::Die(_) => true,
            Self::Empty | Self::Fail(_) | Self::Interrupt(_) => false,
            Self::Then(l, r) | Self::Both(l, r) => l.is_die() || r.is_die(),
        }
    }

    /// The set of fibers that requested interruption, without duplicates.
    #[must_use]
    pub fn interruptors(&self) -> FxHashSet<FiberId> {
        fn walk(cause: &Cause, acc: &mut FxHashSet<FiberId>) {
            match cause {
                Cause::Interrupt(id) => {
                    acc.insert(*id);
                }
                Cause::Empty | Cause::Fail(_) | Cause::Die(_) => {}
                Cause::Then(l, r) | Cause::Both(l, r) => {
                    walk(l, acc);
                    walk(r, acc);
                }
            }
        }
        let mut acc = FxHashSet::default();
        walk(self, &mut acc);
        acc
    }

    /// The first typed failure of type `E`, if any.
    #[must_use]
    pub fn failure<E>(&self) -> Option<E>
    where
        E: Clone + Send + Sync + 'static,
    {
        match self {
            Self::Fail(e) => e.downcast::<E>(),
            Self::Empty | Self::Die(_) | Self::Interrupt(_) => None,
            Self::Then(l, r) | Self::Both(l, r) => l.failure::<E>().or_else(|| r.failure::<E>()),
        }
    }

    /// All defects in the cause, left to right.
    #[must_use]
    pub fn defects(&self) -> Vec<Defect> {
        fn walk(cause: &Cause, acc: &mut Vec<Defect>) {
            match cause {
                Cause::Die(d) => acc.push(d.clone()),
                Cause::Empty | Cause::Fail(_) | Cause::Interrupt(_) => {}
                Cause::Then(l, r) | Cause::Both(l, r) => {
                    walk(l, acc);
                    walk(r, acc);
                }
            }
        }
        let mut acc = Vec::new();
        walk(self, &mut acc);
        acc
    }

    /// Remove every typed-failure leaf while preserving defects and
    /// interruptions.
    ///
    /// Applied when an error handler was discarded during an
    /// interrupt-unwind: the surfaced cause must not expose a typed failure
    /// whose handler never ran.
    #[must_use]
    pub fn strip_failures(&self) -> Self {
        match self {
            Self::Fail(_) => Self::Empty,
            Self::Empty => Self::Empty,
            Self::Die(d) => Self::Die(d.clone()),
            Self::Interrupt(id) => Self::Interrupt(*id),
            Self::Then(l, r) => l.strip_failures().then(r.strip_failures()),
            Self::Both(l, r) => l.strip_failures().both(r.strip_failures()),
        }
    }

    /// Remove every interruption leaf while preserving typed failures and
    /// defects.
    ///
    /// Applied to the exits of children interrupted during their parent's
    /// teardown: the interrupts are expected there, anything else still has
    /// to surface.
    #[must_use]
    pub fn strip_interrupts(&self) -> Self {
        match self {
            Self::Interrupt(_) => Self::Empty,
            Self::Empty => Self::Empty,
            Self::Fail(e) => Self::Fail(e.clone()),
            Self::Die(d) => Self::Die(d.clone()),
            Self::Then(l, r) => l.strip_interrupts().then(r.strip_interrupts()),
            Self::Both(l, r) => l.strip_interrupts().both(r.strip_interrupts()),
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("<empty>"),
            Self::Fail(e) => write!(f, "fail: {}", e.rendered()),
            Self::Die(d) => write!(f, "die: {d}"),
            Self::Interrupt(id) => write!(f, "interrupted by {id}"),
            Self::Then(l, r) => write!(f, "({l}) then ({r})"),
            Self::Both(l, r) => write!(f, "({l}) both ({r})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_then_normalizes_empty() {
        let c = Cause::Empty.then(Cause::fail("boom"));
        assert!(matches!(c, Cause::Fail(_)));
        let c = Cause::fail("boom").then(Cause::Empty);
        assert!(matches!(c, Cause::Fail(_)));
    }

    #[test]
    fn test_interruptors_deduplicate() {
        let id = FiberId::fresh();
        let other = FiberId::fresh();
        let cause = Cause::interrupt(id)
            .then(Cause::interrupt(other))
            .both(Cause::interrupt(id));
        let set = cause.interruptors();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&id));
        assert!(set.contains(&other));
    }

    #[test]
    fn test_strip_failures_preserves_defects_and_interrupts() {
        let id = FiberId::fresh();
        let cause = Cause::fail("boom")
            .then(Cause::die(Defect::message("oops")))
            .then(Cause::interrupt(id));
        let stripped = cause.strip_failures();
        assert!(!stripped.is_failure());
        assert!(stripped.is_die());
        assert!(stripped.is_interrupted());
    }

    #[test]
    fn test_strip_failures_can_empty_out() {
        let cause = Cause::fail("a").both(Cause::fail("b"));
        assert!(cause.strip_failures().is_empty());
    }

    #[test]
    fn test_strip_interrupts_preserves_failures_and_defects() {
        let id = FiberId::fresh();
        let cause = Cause::interrupt(id)
            .then(Cause::die(Defect::message("oops")))
            .both(Cause::fail("boom"));
        let stripped = cause.strip_interrupts();
        assert!(!stripped.is_interrupted());
        assert!(stripped.is_die());
        assert!(stripped.is_failure());
        assert!(Cause::interrupt(id).strip_interrupts().is_empty());
    }

    #[test]
    fn test_failure_downcast() {
        let cause = Cause::die(Defect::message("noise")).then(Cause::fail("boom"));
        assert_eq!(cause.failure::<&str>(), Some("boom"));
        assert_eq!(cause.failure::<i32>(), None);
    }

    #[test]
    fn test_interrupted_only() {
        let id = FiberId::fresh();
        assert!(Cause::interrupt(id).is_interrupted_only());
        assert!(!Cause::interrupt(id).then(Cause::fail("x")).is_interrupted_only());
        assert!(!Cause::Empty.is_interrupted_only());
    }

    #[test]
    fn test_defect_from_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("kaboom");
        assert_eq!(Defect::from_panic(payload).describe(), "kaboom");
        let payload: Box<dyn Any + Send> = Box::new(7_u32);
        assert_eq!(Defect::from_panic(payload).describe(), "fiber panicked");
    }

    #[test]
    fn test_display_renders_tree() {
        let cause = Cause::fail("boom").then(Cause::die(Defect::message("late")));
        let text = format!("{cause}");
        assert!(text.contains("boom"));
        assert!(text.contains("late"));
    }
}
