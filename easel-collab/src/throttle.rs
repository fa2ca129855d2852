//! Trailing-edge rate limiter for high-frequency event streams.
//!
//! A [`Throttle`] is a single-slot buffer plus a deadline:
//!
//! ```text
//! push(a) ──► slot = a, deadline = now + interval
//! push(b) ──► slot = b              (deadline unchanged)
//! push(c) ──► slot = c
//!            ... deadline reached ...
//! poll()  ──► Some(c), slot cleared, deadline cleared
//! ```
//!
//! At most one value is delivered per window and the most recent value
//! before a pause is always delivered. The throttle never reads the clock
//! itself; callers pass `now`, which keeps it deterministic under test.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Throttle<T> {
    interval: Duration,
    pending: Option<T>,
    deadline: Option<Instant>,
    delivered: u64,
    coalesced: u64,
}

impl<T> Throttle<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: None,
            deadline: None,
            delivered: 0,
            coalesced: 0,
        }
    }

    /// Replace the pending value. Arms the timer if it is idle.
    pub fn push(&mut self, value: T, now: Instant) {
        if self.pending.replace(value).is_some() {
            self.coalesced += 1;
        }
        self.arm(now);
    }

    /// Fold `value` into the pending value with `merge`, or store it if the
    /// slot is empty. Arms the timer if it is idle.
    pub fn merge<F>(&mut self, value: T, now: Instant, merge: F)
    where
        F: FnOnce(&mut T, T),
    {
        match self.pending.as_mut() {
            Some(pending) => {
                merge(pending, value);
                self.coalesced += 1;
            }
            None => self.pending = Some(value),
        }
        self.arm(now);
    }

    /// Take the pending value if the window has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        match self.deadline {
            Some(deadline) if now >= deadline => self.fire(),
            _ => None,
        }
    }

    /// Take the pending value regardless of the deadline.
    pub fn flush(&mut self) -> Option<T> {
        self.fire()
    }

    /// When the pending value becomes due, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn pending(&self) -> Option<&T> {
        self.pending.as_ref()
    }

    pub fn pending_mut(&mut self) -> Option<&mut T> {
        self.pending.as_mut()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Values delivered so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Values replaced or merged before delivery.
    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }

    /// Drop the pending value without delivering it.
    pub fn cancel(&mut self) {
        self.pending = None;
        self.deadline = None;
    }

    fn arm(&mut self, now: Instant) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.interval);
        }
    }

    fn fire(&mut self) -> Option<T> {
        self.deadline = None;
        let value = self.pending.take()?;
        self.delivered += 1;
        Some(value)
    }
}
