//! Clock abstraction used by every timer in the switch runtime: the line
//! open/broken timers, channel receive deadlines, the channel GC sweep and
//! the path-recheck cadence.
//!
//! Production code drives everything from [`SystemClock`], which is a thin
//! wrapper over `tokio::time`. [`MockClock`] advances a virtual clock by
//! hand and wakes pending sleepers deterministically, exercised by its own
//! unit tests below; the switch's integration tests currently run against
//! `SystemClock` with short configured durations and real `tokio::time`
//! waits rather than `MockClock`, since `Line::last_sync` freshness checks
//! are timestamped off the real clock independent of the injected `Clock`.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// Boxed future returned by [`Clock::sleep`].
pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// An injectable source of monotonic time and delayed wakeups.
///
/// Implementors must guarantee `now()` is monotonically non-decreasing and
/// that a `sleep(d)` future does not resolve before `d` has elapsed on the
/// clock's own timeline.
pub trait Clock: Send + Sync + 'static {
    /// Current point on this clock's timeline.
    fn now(&self) -> Instant;

    /// A future that resolves once `duration` has elapsed on this clock.
    fn sleep(&self, duration: Duration) -> Sleep;
}

/// Real-time clock backed by the tokio timer wheel.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Deterministic virtual clock for tests.
///
/// Time only moves when [`MockClock::advance`] is called; all sleepers due
/// at or before the new virtual time are woken, in the order they were
/// registered.
#[derive(Clone, Debug)]
pub struct MockClock {
    inner: Arc<MockClockInner>,
}

impl MockClock {
    pub fn new() -> Self {
        Self::with_start(Instant::now())
    }

    pub fn with_start(origin: Instant) -> Self {
        Self {
            inner: Arc::new(MockClockInner {
                state: Mutex::new(ClockState {
                    origin,
                    elapsed: Duration::ZERO,
                    sleepers: Vec::new(),
                    next_id: 0,
                }),
            }),
        }
    }

    /// Advance the virtual clock by `delta` and wake everything now due.
    pub fn advance(&self, delta: Duration) {
        if delta.is_zero() {
            return;
        }

        let mut to_wake = Vec::new();
        let mut guard = self.inner.state.lock().expect("mock clock poisoned");
        guard.elapsed = guard.elapsed.saturating_add(delta);
        let elapsed = guard.elapsed;
        guard.sleepers.retain(|entry| {
            if entry.cancelled.load(Ordering::SeqCst) {
                return false;
            }
            if elapsed >= entry.deadline {
                entry.completed.store(true, Ordering::SeqCst);
                if let Some(waker) = entry.take_waker() {
                    to_wake.push(waker);
                }
                false
            } else {
                true
            }
        });
        drop(guard);

        for waker in to_wake {
            waker.wake();
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.state.lock().expect("mock clock poisoned").elapsed
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        let guard = self.inner.state.lock().expect("mock clock poisoned");
        guard.origin + guard.elapsed
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        let state = {
            let mut guard = self.inner.state.lock().expect("mock clock poisoned");
            let deadline = guard.elapsed.saturating_add(duration);
            let id = guard.next_id;
            guard.next_id += 1;
            let state = Arc::new(SleepState::new(id, deadline));
            guard.sleepers.push(Arc::clone(&state));
            state
        };

        Box::pin(MockSleep {
            inner: Arc::clone(&self.inner),
            state,
        })
    }
}

#[derive(Debug)]
struct MockClockInner {
    state: Mutex<ClockState>,
}

#[derive(Debug)]
struct ClockState {
    origin: Instant,
    elapsed: Duration,
    sleepers: Vec<Arc<SleepState>>,
    next_id: usize,
}

#[derive(Debug)]
struct SleepState {
    id: usize,
    deadline: Duration,
    waker: Mutex<Option<Waker>>,
    completed: AtomicBool,
    cancelled: AtomicBool,
}

impl SleepState {
    fn new(id: usize, deadline: Duration) -> Self {
        Self {
            id,
            deadline,
            waker: Mutex::new(None),
            completed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    fn take_waker(&self) -> Option<Waker> {
        self.waker.lock().expect("sleep state poisoned").take()
    }

    fn store_waker(&self, waker: &Waker) {
        let mut guard = self.waker.lock().expect("sleep state poisoned");
        if guard.as_ref().is_some_and(|existing| existing.will_wake(waker)) {
            return;
        }
        *guard = Some(waker.clone());
    }
}

struct MockSleep {
    inner: Arc<MockClockInner>,
    state: Arc<SleepState>,
}

impl Future for MockSleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.state.cancelled.load(Ordering::SeqCst) || self.state.completed.load(Ordering::SeqCst) {
            return Poll::Ready(());
        }

        let elapsed = self.inner.state.lock().expect("mock clock poisoned").elapsed;
        if elapsed >= self.state.deadline {
            self.state.completed.store(true, Ordering::SeqCst);
            return Poll::Ready(());
        }

        self.state.store_waker(cx.waker());
        Poll::Pending
    }
}

impl Drop for MockSleep {
    fn drop(&mut self) {
        if !self.state.completed.load(Ordering::SeqCst) {
            self.state.cancelled.store(true, Ordering::SeqCst);
            self.state.take_waker();
            if let Ok(mut guard) = self.inner.state.lock() {
                guard.sleepers.retain(|entry| entry.id != self.state.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_clock_wakes_sleeper_on_advance() {
        let clock = MockClock::new();
        let sleep = clock.sleep(Duration::from_secs(5));
        tokio::pin!(sleep);

        assert!(futures_poll_once_pending(&mut sleep));
        clock.advance(Duration::from_secs(5));
        sleep.await;
    }

    #[tokio::test]
    async fn mock_clock_does_not_wake_before_deadline() {
        let clock = MockClock::new();
        let sleep = clock.sleep(Duration::from_secs(10));
        tokio::pin!(sleep);

        clock.advance(Duration::from_secs(3));
        assert!(futures_poll_once_pending(&mut sleep));
        clock.advance(Duration::from_secs(7));
        sleep.await;
    }

    fn futures_poll_once_pending(sleep: &mut Pin<&mut Sleep>) -> bool {
        use std::task::{RawWaker, RawWakerVTable};

        fn noop(_: *const ()) {}
        fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(std::ptr::null(), &VTABLE)
        }
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
        let raw = RawWaker::new(std::ptr::null(), &VTABLE);
        let waker = unsafe { Waker::from_raw(raw) };
        let mut cx = Context::from_waker(&waker);
        matches!(sleep.as_mut().poll(&mut cx), Poll::Pending)
    }
}
