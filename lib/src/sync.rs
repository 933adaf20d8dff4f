//! Synchronization primitives of the queue protocol.
//!
//! [`CriticalSection`] is the single mutual-exclusion point shared between
//! task-context consumers and the driver's completion path. Its contract is
//! mutual exclusion with completion (interrupt) handlers; the hosted backend
//! used here is a blocking mutex, embedded ports substitute an IRQ-masking
//! lock without changing callers.
//!
//! [`ReadySignal`] is the counting signal whose value tracks the number of
//! completed-but-undequeued buffers of a stream. It is the sole suspension
//! point for consumers waiting on a completed frame; `stop()` drains it and
//! wakes every waiter with a "stream stopped" result.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::{Result, VideoError};

/// Mutual exclusion with the driver's completion context.
pub struct CriticalSection<T> {
    inner: Mutex<T>,
}

impl<T> CriticalSection<T> {
    pub fn new(value: T) -> Self {
        CriticalSection {
            inner: Mutex::new(value),
        }
    }

    /// Run `f` with exclusive access to the protected state. Callers keep
    /// the section short; in particular nothing blocking runs inside it.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut *self.inner.lock().unwrap())
    }
}

/// How long a consumer dequeue is willing to wait for a completed buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Poll: return `Timeout` immediately if nothing is available.
    None,
    /// Block until a buffer completes or the stream is stopped.
    Forever,
    /// Block for at most this long.
    For(Duration),
}

struct SignalState {
    count: usize,
    stopped: bool,
}

/// Counting signal tracking completed buffers of one stream.
pub struct ReadySignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl Default for ReadySignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadySignal {
    pub fn new() -> Self {
        ReadySignal {
            state: Mutex::new(SignalState {
                count: 0,
                stopped: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Account one newly completed buffer and wake one waiter.
    pub fn signal(&self) {
        let mut state = self.state.lock().unwrap();
        state.count += 1;
        self.cond.notify_one();
    }

    /// Current number of completed-but-undequeued buffers.
    pub fn count(&self) -> usize {
        self.state.lock().unwrap().count
    }

    /// Consume one completed-buffer credit, waiting up to `wait` for one to
    /// appear. Returns `Timeout` if the wait budget runs out and `Stopped`
    /// if the stream is stopped before a credit is obtained.
    pub fn acquire(&self, wait: Wait) -> Result<()> {
        let deadline = match wait {
            Wait::For(timeout) => Some(Instant::now() + timeout),
            _ => None,
        };

        let mut state = self.state.lock().unwrap();
        loop {
            if state.stopped {
                return Err(VideoError::Stopped);
            }
            if state.count > 0 {
                state.count -= 1;
                return Ok(());
            }
            state = match wait {
                Wait::None => return Err(VideoError::Timeout),
                Wait::Forever => self.cond.wait(state).unwrap(),
                Wait::For(_) => {
                    let deadline = deadline.unwrap();
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(VideoError::Timeout);
                    }
                    self.cond.wait_timeout(state, remaining).unwrap().0
                }
            };
        }
    }

    /// Drain the signal to zero and wake every waiter with `Stopped`. The
    /// stopped latch persists until `resume()` or `reset()`.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.count = 0;
        state.stopped = true;
        self.cond.notify_all();
    }

    /// Clear the stopped latch, keeping the current count.
    pub fn resume(&self) {
        self.state.lock().unwrap().stopped = false;
    }

    /// Return the signal to its initial state: zero count, not stopped.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.count = 0;
        state.stopped = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_signal_counts() {
        let signal = ReadySignal::new();
        assert_eq!(signal.count(), 0);
        signal.signal();
        signal.signal();
        assert_eq!(signal.count(), 2);
        signal.acquire(Wait::None).unwrap();
        assert_eq!(signal.count(), 1);
        signal.acquire(Wait::None).unwrap();
        assert!(matches!(
            signal.acquire(Wait::None),
            Err(VideoError::Timeout)
        ));
    }

    #[test]
    fn test_acquire_timeout() {
        let signal = ReadySignal::new();
        let start = Instant::now();
        let res = signal.acquire(Wait::For(Duration::from_millis(20)));
        assert!(matches!(res, Err(VideoError::Timeout)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_stop_unblocks_waiter() {
        let signal = Arc::new(ReadySignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.acquire(Wait::Forever))
        };
        // Give the waiter a chance to block.
        thread::sleep(Duration::from_millis(20));
        signal.stop();
        assert!(matches!(waiter.join().unwrap(), Err(VideoError::Stopped)));

        // The latch persists until resumed.
        assert!(matches!(
            signal.acquire(Wait::None),
            Err(VideoError::Stopped)
        ));
        signal.resume();
        assert!(matches!(
            signal.acquire(Wait::None),
            Err(VideoError::Timeout)
        ));
    }

    #[test]
    fn test_signal_wakes_blocked_waiter() {
        let signal = Arc::new(ReadySignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.acquire(Wait::Forever))
        };
        thread::sleep(Duration::from_millis(20));
        signal.signal();
        assert!(waiter.join().unwrap().is_ok());
        assert_eq!(signal.count(), 0);
    }

    #[test]
    fn test_critical_section() {
        let cs = Arc::new(CriticalSection::new(0u32));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cs = Arc::clone(&cs);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        cs.with(|v| *v += 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cs.with(|v| *v), 4000);
    }
}
