//! A fiber runtime for lazy, composable effects.
//!
//! The crate splits into a description language and an interpreter:
//!
//! ```text
//!   Io<A, E>  --typed surface-->  Effect  --run by-->  FiberContext
//!      |                            |                      |
//!   combinators               erased nodes          one turn at a time,
//!   (map, fold, fork,         (boxed values         trampolined on a
//!    race, ensuring, ...)      and closures)         Scheduler thread
//! ```
//!
//! An [`Io`] value is inert data. Running it spawns a fiber: a lightweight,
//! cooperatively scheduled thread of execution with its own continuation
//! stack, fiber-local refs, and child table. Fibers are structured: children
//! forked in a fiber's scope are interrupted and awaited when the parent
//! finishes, finalizers installed with [`Io::ensuring`] run exactly once on
//! every exit path, and interruption is precise down to a single suspension
//! via epoch-guarded resumptions.
//!
//! ```
//! use strand_runtime::{Io, Never, Runtime};
//!
//! let rt = Runtime::new();
//! let program = Io::<i32, Never>::succeed(20).map(|n| n * 2 + 2);
//! assert_eq!(rt.block_on(program), Ok(42));
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

mod effect;
mod fiber;
mod fiber_ref;
mod frame;
mod interpreter;
pub mod io;
pub mod logger;
mod runtime;
pub mod scheduler;
mod scope;
pub mod supervisor;

pub use effect::ExitView;
pub use fiber::Fiber;
pub use fiber_ref::FiberRef;
pub use io::{AsyncRegistration, InterruptMask, Io, Never, Resume};
pub use logger::{LogLevel, Logger};
pub use runtime::{Runtime, RuntimeBuilder, RuntimeConfig};
pub use scheduler::{PoolConfig, PoolScheduler, Scheduler, TestScheduler};
pub use scope::Scope;
pub use supervisor::Supervisor;

pub use strand_core::{
    AnyValue, Cause, Defect, ErrorBox, Exit, FiberError, FiberId, FiberStatus,
};
