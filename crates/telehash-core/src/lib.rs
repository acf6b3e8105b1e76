//! Ambient stack shared across the telehash switch workspace: a clock
//! abstraction, a task-spawning seam, and observability span names.
//!
//! This crate deliberately carries no protocol knowledge — it exists so
//! `telehash-transport-udp` and `telehash-switch` do not each reinvent
//! their own notion of "what time is it" or "how do I spawn work".

pub mod observability;
pub mod runtime;
pub mod time;

pub use runtime::{TaskExecutor, TokioExecutor};
pub use time::{Clock, MockClock, Sleep, SystemClock};
