//! Monotonic counters used to order halo traffic between partitions.
//!
//! A [`Timeline`] only moves forward. Producers advance it after their data
//! is in place; consumers block until it reaches the value they expect.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// Why a wait returned without reaching its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// The deadline passed first.
    #[error("timed out at {reached}, waiting for {target}")]
    TimedOut {
        /// Value waited for.
        target: u64,
        /// Value when the wait gave up.
        reached: u64,
    },
    /// The step was aborted while waiting.
    #[error("aborted at {reached}, waiting for {target}")]
    Aborted {
        /// Value waited for.
        target: u64,
        /// Value when the wait gave up.
        reached: u64,
    },
}

/// Monotonic counter with blocking waits.
#[derive(Debug, Default)]
pub struct Timeline {
    value: Mutex<u64>,
    changed: Condvar,
}

impl Timeline {
    /// Counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value.
    pub fn value(&self) -> u64 {
        *self.value.lock()
    }

    /// Increment and wake waiters. Returns the new value.
    pub fn advance(&self) -> u64 {
        let mut v = self.value.lock();
        *v += 1;
        self.changed.notify_all();
        *v
    }

    /// Move the counter up to `target` if it is behind. Never moves it back.
    pub fn raise_to(&self, target: u64) {
        let mut v = self.value.lock();
        if *v < target {
            *v = target;
            self.changed.notify_all();
        }
    }

    /// Block until the value reaches `target`, the deadline passes, or
    /// `abort` is set and the waiter is woken.
    pub fn wait_for(
        &self,
        target: u64,
        deadline: Instant,
        abort: &AtomicBool,
    ) -> Result<u64, WaitError> {
        let mut v = self.value.lock();
        while *v < target {
            if abort.load(Ordering::SeqCst) {
                return Err(WaitError::Aborted {
                    target,
                    reached: *v,
                });
            }
            if self.changed.wait_until(&mut v, deadline).timed_out() && *v < target {
                return Err(WaitError::TimedOut {
                    target,
                    reached: *v,
                });
            }
        }
        Ok(*v)
    }

    /// Wake every waiter so it can re-check its abort flag.
    pub fn interrupt(&self) {
        // Taking the lock orders this wake-up after any waiter's flag check.
        let _guard = self.value.lock();
        self.changed.notify_all();
    }
}

/// Directed link carrying halo traffic from one partition to a face
/// neighbor.
///
/// The producer advances the timeline once per delivered face exchange. The
/// receiver keeps its own `expected` count and waits for the timeline to
/// catch up with it before reading.
#[derive(Debug)]
pub struct SyncChannel {
    from: usize,
    to: usize,
    timeline: Timeline,
    expected: AtomicU64,
}

impl SyncChannel {
    /// Channel from partition `from` to partition `to`.
    pub fn new(from: usize, to: usize) -> Self {
        Self {
            from,
            to,
            timeline: Timeline::new(),
            expected: AtomicU64::new(0),
        }
    }

    /// Producing partition.
    pub fn from(&self) -> usize {
        self.from
    }

    /// Consuming partition.
    pub fn to(&self) -> usize {
        self.to
    }

    /// Deliveries signalled so far.
    pub fn value(&self) -> u64 {
        self.timeline.value()
    }

    /// Deliveries the consumer has claimed so far.
    pub fn expected(&self) -> u64 {
        self.expected.load(Ordering::SeqCst)
    }

    /// Producer side: announce one more delivery.
    pub fn signal(&self) -> u64 {
        self.timeline.advance()
    }

    /// Consumer side: claim the next delivery and wait for it.
    pub fn wait_next(&self, deadline: Instant, abort: &AtomicBool) -> Result<u64, WaitError> {
        let target = self.expected.fetch_add(1, Ordering::SeqCst) + 1;
        self.timeline.wait_for(target, deadline, abort)
    }

    /// Forget claims that were never satisfied, after an aborted step.
    pub fn resynchronize(&self) {
        self.expected.store(self.timeline.value(), Ordering::SeqCst);
    }

    /// Wake a blocked consumer.
    pub fn interrupt(&self) {
        self.timeline.interrupt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn soon(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn test_wait_returns_once_signalled() {
        let channel = Arc::new(SyncChannel::new(0, 1));
        let abort = Arc::new(AtomicBool::new(false));
        let consumer = {
            let channel = Arc::clone(&channel);
            let abort = Arc::clone(&abort);
            thread::spawn(move || channel.wait_next(soon(5_000), &abort))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(channel.signal(), 1);
        assert_eq!(consumer.join().unwrap(), Ok(1));
        assert_eq!(channel.expected(), 1);
    }

    #[test]
    fn test_already_reached_does_not_block() {
        let t = Timeline::new();
        t.advance();
        t.advance();
        let abort = AtomicBool::new(false);
        assert_eq!(t.wait_for(1, Instant::now(), &abort), Ok(2));
    }

    #[test]
    fn test_timeout_reports_progress() {
        let t = Timeline::new();
        t.advance();
        let abort = AtomicBool::new(false);
        assert_eq!(
            t.wait_for(3, soon(10), &abort),
            Err(WaitError::TimedOut { target: 3, reached: 1 })
        );
    }

    #[test]
    fn test_interrupt_wakes_aborted_waiter() {
        let t = Arc::new(Timeline::new());
        let abort = Arc::new(AtomicBool::new(false));
        let waiter = {
            let t = Arc::clone(&t);
            let abort = Arc::clone(&abort);
            thread::spawn(move || t.wait_for(1, soon(10_000), &abort))
        };
        thread::sleep(Duration::from_millis(20));
        abort.store(true, Ordering::SeqCst);
        t.interrupt();
        assert_eq!(
            waiter.join().unwrap(),
            Err(WaitError::Aborted { target: 1, reached: 0 })
        );
    }

    #[test]
    fn test_raise_never_moves_back() {
        let t = Timeline::new();
        t.raise_to(4);
        t.raise_to(2);
        assert_eq!(t.value(), 4);
    }

    #[test]
    fn test_resynchronize_drops_unmet_claims() {
        let channel = SyncChannel::new(2, 3);
        let abort = AtomicBool::new(false);
        assert!(channel.wait_next(Instant::now(), &abort).is_err());
        assert_eq!(channel.expected(), 1);
        channel.resynchronize();
        assert_eq!(channel.expected(), 0);
        channel.signal();
        assert_eq!(channel.wait_next(Instant::now(), &abort), Ok(1));
    }
}
