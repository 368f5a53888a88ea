use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A source of monotonic time that can also wait.
pub trait Clock {
    /// Time since some fixed starting point.
    fn now(&self) -> Duration;

    /// Block for `duration`, or pretend to.
    fn sleep(&mut self, duration: Duration);
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration)
    }
}

/// A clock that only moves when slept on. Waits never block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ManualClock {
    now: Duration,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&mut self, duration: Duration) {
        self.now += duration;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now
    }

    fn sleep(&mut self, duration: Duration) {
        self.advance(duration)
    }
}

/// Result of polling for something that may take a while.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Wait<T> {
    Pending,
    Ready(T),
    TimedOut,
}

impl<T> Wait<T> {
    pub fn map<U, F>(self, f: F) -> Wait<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Self::Pending => Wait::Pending,
            Self::Ready(v) => Wait::Ready(f(v)),
            Self::TimedOut => Wait::TimedOut,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// A point in time, on some [Clock], after which a wait gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Deadline {
    at: Duration,
}

impl Deadline {
    pub fn after<C>(clock: &C, timeout: Duration) -> Self
    where
        C: Clock + ?Sized,
    {
        Self {
            at: clock.now() + timeout,
        }
    }

    pub fn expired<C>(&self, clock: &C) -> bool
    where
        C: Clock + ?Sized,
    {
        clock.now() >= self.at
    }

    pub fn remaining<C>(&self, clock: &C) -> Duration
    where
        C: Clock + ?Sized,
    {
        self.at.saturating_sub(clock.now())
    }
}

/// A cancellation flag shared between a running transfer and whoever
/// wants to stop it. Only checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deadline_on_manual_clock() {
        let mut clock = ManualClock::new();
        let deadline = Deadline::after(&clock, Duration::from_millis(25));
        assert!(!deadline.expired(&clock));
        clock.sleep(Duration::from_millis(10));
        clock.sleep(Duration::from_millis(10));
        assert_eq!(deadline.remaining(&clock), Duration::from_millis(5));
        clock.sleep(Duration::from_millis(10));
        assert!(deadline.expired(&clock));
        assert_eq!(deadline.remaining(&clock), Duration::ZERO);
    }

    #[test]
    fn cancel_is_shared() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!token.is_cancelled());
        other.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!other.is_cancelled());
    }

    #[test]
    fn wait_map() {
        assert_eq!(Wait::Ready(2).map(|v| v * 2), Wait::Ready(4));
        assert_eq!(Wait::<u8>::TimedOut.map(|v| v * 2), Wait::TimedOut);
        assert!(Wait::<u8>::Pending.is_pending());
    }
}
