//! chop controller: the reconciliation engine and the watch loop that drives it.
//!
//! `Engine` is generic over `ResourceStore` so the same passes run against the
//! API server and against the in-RAM store used by tests and offline renders.

#![forbid(unsafe_code)]

pub mod engine;
pub mod error;
pub mod guard;
pub mod runtime;

pub use engine::{Engine, Intervals, Outcome};
pub use error::ReconcileError;
pub use guard::Rejection;
pub use runtime::{run, WatchConfig};
