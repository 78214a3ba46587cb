//! Core data model for the strand fiber runtime.
//!
//! This crate holds the pure, interpreter-agnostic types: fiber identities,
//! fiber lifecycle statuses, the composable failure description ([`Cause`]),
//! the terminal fiber result ([`Exit`]), and the error type used when an
//! `Exit` is converted into a plain `Result` at a blocking boundary.
//!
//! Nothing in here schedules, suspends, or interprets anything; the executor
//! lives in `strand-runtime`.

#![warn(missing_docs)]
#![deny(unsafe_code)]

mod cause;
mod error;
mod exit;
mod id;
mod status;

pub use cause::{AnyValue, Cause, Defect, ErrorBox};
pub use error::FiberError;
pub use exit::Exit;
pub use id::FiberId;
pub use status::FiberStatus;
