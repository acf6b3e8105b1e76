//! Backlog (§4.2): an ordered collection of suspended commands.
//!
//! No counterpart exists in the teacher's own modules — `spark-core`
//! suspends work via its pipeline/governance stack, which has no
//! equivalent here — so this is written directly from the run-loop
//! contract in §4.1/§4.2: a command suspends by being pushed onto some
//! resource's backlog; it is released either by `reschedule_all`
//! (re-submit for another attempt) or `cancel_all` (fail the waiter).

use tokio::sync::oneshot;

use crate::command::CommandOutcome;
use crate::error::SwitchError;

type Responder = oneshot::Sender<Result<CommandOutcome, SwitchError>>;

/// A suspended command paired with the channel its `Call` awaiter (if
/// any) is listening on. `Cast`-originated commands carry `None` and are
/// simply dropped on cancellation, per §7's "logged and dropped" policy.
pub struct Pending<T> {
    pub item: T,
    responder: Option<Responder>,
}

impl<T> Pending<T> {
    pub fn new(item: T, responder: Option<Responder>) -> Self {
        Self { item, responder }
    }

    fn fail(self, err: SwitchError) {
        if let Some(responder) = self.responder {
            let _ = responder.send(Err(err));
        }
    }

    /// Unwrap into the raw command and its (possibly absent) responder,
    /// for re-submission onto the run loop's queue.
    pub(crate) fn into_parts(self) -> (T, Option<Responder>) {
        (self.item, self.responder)
    }
}

/// FIFO of deferred commands for one resource (a line, or a channel's
/// receive/send queue).
#[derive(Default)]
pub struct Backlog<T> {
    waiting: Vec<Pending<T>>,
}

impl<T> Backlog<T> {
    pub fn new() -> Self {
        Self { waiting: Vec::new() }
    }

    pub fn defer(&mut self, entry: Pending<T>) {
        self.waiting.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    /// Drain every waiting command for re-submission on the run loop.
    /// Returns the items in FIFO order; the caller re-enqueues each one
    /// (preserving its responder) as a fresh command.
    pub fn reschedule_all(&mut self) -> Vec<Pending<T>> {
        std::mem::take(&mut self.waiting)
    }

    /// Fail every waiting command's awaiter with `err` and clear the
    /// backlog.
    pub fn cancel_all(&mut self, err: SwitchError) {
        for pending in std::mem::take(&mut self.waiting) {
            pending.fail(err.clone());
        }
    }
}
