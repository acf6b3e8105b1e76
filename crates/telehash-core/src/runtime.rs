//! Minimal task-spawning seam.
//!
//! The switch's run loop never blocks: long operations (path negotiation,
//! handshake verification, per-channel user handlers) are handed to a
//! [`TaskExecutor`] and post their result back onto the run loop as a
//! command once they finish. Abstracting over the executor (rather than
//! calling `tokio::spawn` directly) keeps the switch runtime testable
//! without a multi-threaded tokio runtime.

use std::future::Future;
use std::pin::Pin;

/// Spawns detached background work.
///
/// Implementors must run `fut` to completion without blocking the caller;
/// the default production implementation is [`TokioExecutor`]. The trait
/// itself takes a boxed future so `dyn TaskExecutor` stays object-safe;
/// callers holding a trait object reach the ergonomic generic entry point
/// via the inherent `spawn` impl below.
pub trait TaskExecutor: Send + Sync + 'static {
    fn spawn_boxed(&self, fut: Pin<Box<dyn Future<Output = ()> + Send>>);
}

impl dyn TaskExecutor {
    /// Convenience wrapper so callers can pass an `async move { .. }` block
    /// directly instead of boxing it themselves.
    pub fn spawn(&self, fut: impl Future<Output = ()> + Send + 'static) {
        self.spawn_boxed(Box::pin(fut));
    }
}

/// Executor backed by `tokio::spawn`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioExecutor;

impl TaskExecutor for TokioExecutor {
    fn spawn_boxed(&self, fut: Pin<Box<dyn Future<Output = ()> + Send>>) {
        tokio::spawn(fut);
    }
}
