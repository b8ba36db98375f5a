// Copyright © 2026 The Weft Contributors
//
// This file is part of weft, distributed under the terms of the GPLv3
// or later. For full terms see the included LICENSE file.

//! Hybrid logical clock.
//!
//! An [`Hlc`] is a `(physical_ms, logical)` pair: 48 bits of wall-clock
//! milliseconds plus a 16 bit logical counter, compared
//! lexicographically. The pair is bounded to wall time but still orders
//! events causally when wall clocks stall or run side by side.

use std::{
    fmt,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use thiserror::Error;

/// Largest representable physical component (48 bits of milliseconds,
/// good until the year 10889).
pub const MAX_PHYSICAL_MS: u64 = (1 << 48) - 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The logical counter wrapped, meaning the wall clock made no
    /// progress over 65535 consecutive events. Treated as clock skew.
    #[error("logical clock overflow at physical time {physical_ms}ms")]
    LogicalOverflow { physical_ms: u64 },
}

/// Source of wall-clock milliseconds, injected into [`Clock`].
pub trait TimeSource: Send + Sync + 'static {
    fn now_ms(&self) -> u64;
}

/// A [`TimeSource`] anchored to a monotonic instant.
///
/// Captures the Unix epoch offset once and advances via
/// [`tokio::time::Instant`], so a paused test runtime observes virtual
/// time while production observes wall time. Immune to wall-clock jumps
/// after construction.
pub struct Anchored {
    base_ms: u64,
    origin: tokio::time::Instant,
}

impl Anchored {
    pub fn now() -> Self {
        let base_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self::starting_at(base_ms)
    }

    pub fn starting_at(base_ms: u64) -> Self {
        Self {
            base_ms,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl TimeSource for Anchored {
    fn now_ms(&self) -> u64 {
        self.base_ms + self.origin.elapsed().as_millis() as u64
    }
}

/// Hybrid logical timestamp.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hlc {
    physical_ms: u64,
    logical: u16,
}

impl Hlc {
    pub fn new(physical_ms: u64, logical: u16) -> Self {
        Self {
            physical_ms: physical_ms & MAX_PHYSICAL_MS,
            logical,
        }
    }

    pub fn physical_ms(&self) -> u64 {
        self.physical_ms
    }

    pub fn logical(&self) -> u16 {
        self.logical
    }

    /// Pack into a single `u64` for the wire: 48 bits physical, 16 bits
    /// logical. Preserves ordering.
    pub fn as_u64(&self) -> u64 {
        (self.physical_ms << 16) | u64::from(self.logical)
    }

    pub fn from_u64(raw: u64) -> Self {
        Self {
            physical_ms: raw >> 16,
            logical: (raw & 0xffff) as u16,
        }
    }
}

impl fmt::Debug for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}+{}", self.physical_ms, self.logical)
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}+{}", self.physical_ms, self.logical)
    }
}

/// Monotone HLC generator for one coordinator.
///
/// `tick` stamps local events, `observe` folds a remote timestamp in on
/// receive. Both never move backwards.
pub struct Clock {
    time: Arc<dyn TimeSource>,
    last: Mutex<Hlc>,
}

impl Clock {
    pub fn new(time: Arc<dyn TimeSource>) -> Self {
        Self {
            time,
            last: Mutex::new(Hlc::default()),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.time.now_ms()
    }

    /// Timestamp a local event.
    pub fn tick(&self) -> Result<Hlc, Error> {
        let wall = self.time.now_ms() & MAX_PHYSICAL_MS;
        let mut last = self.last.lock();

        let next = if wall > last.physical_ms {
            Hlc::new(wall, 0)
        } else {
            Hlc::new(last.physical_ms, bump(last.physical_ms, last.logical)?)
        };

        *last = next;
        Ok(next)
    }

    /// Fold a remote timestamp in, returning the local clock's new value.
    pub fn observe(&self, remote: Hlc) -> Result<Hlc, Error> {
        let wall = self.time.now_ms() & MAX_PHYSICAL_MS;
        let mut last = self.last.lock();

        let physical = wall.max(last.physical_ms).max(remote.physical_ms());
        let logical = if physical > last.physical_ms && physical > remote.physical_ms() {
            0
        } else if physical == last.physical_ms && physical == remote.physical_ms() {
            bump(physical, last.logical.max(remote.logical()))?
        } else if physical == last.physical_ms {
            bump(physical, last.logical)?
        } else {
            bump(physical, remote.logical())?
        };

        let next = Hlc::new(physical, logical);
        *last = next;
        Ok(next)
    }

    /// The most recent timestamp handed out.
    pub fn last(&self) -> Hlc {
        *self.last.lock()
    }
}

fn bump(physical_ms: u64, logical: u16) -> Result<u16, Error> {
    logical
        .checked_add(1)
        .ok_or(Error::LogicalOverflow { physical_ms })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    struct Manual(AtomicU64);

    impl Manual {
        fn set(&self, ms: u64) {
            self.0.store(ms, Ordering::SeqCst)
        }
    }

    impl TimeSource for Manual {
        fn now_ms(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn clock(ms: u64) -> (Arc<Manual>, Clock) {
        let time = Arc::new(Manual(AtomicU64::new(ms)));
        let clock = Clock::new(time.clone());
        (time, clock)
    }

    #[test]
    fn tick_follows_wall_clock() {
        let (time, clock) = clock(100);
        assert_eq!(clock.tick().unwrap(), Hlc::new(100, 0));
        time.set(250);
        assert_eq!(clock.tick().unwrap(), Hlc::new(250, 0));
    }

    #[test]
    fn tick_is_monotone_under_stalled_wall_clock() {
        let (_, clock) = clock(100);
        let mut prev = clock.tick().unwrap();
        for _ in 0..100 {
            let next = clock.tick().unwrap();
            assert!(next > prev);
            assert_eq!(next.physical_ms(), 100);
            prev = next;
        }
    }

    #[test]
    fn tick_is_monotone_under_backwards_wall_clock() {
        let (time, clock) = clock(500);
        let first = clock.tick().unwrap();
        time.set(200);
        let second = clock.tick().unwrap();
        assert!(second > first);
        assert_eq!(second.physical_ms(), 500);
    }

    #[test]
    fn observe_takes_remote_physical_when_ahead() {
        let (_, clock) = clock(100);
        let merged = clock.observe(Hlc::new(900, 7)).unwrap();
        assert_eq!(merged, Hlc::new(900, 8));
    }

    #[test]
    fn observe_resets_logical_when_wall_wins() {
        let (time, clock) = clock(100);
        clock.observe(Hlc::new(150, 3)).unwrap();
        time.set(1000);
        assert_eq!(clock.observe(Hlc::new(150, 3)).unwrap(), Hlc::new(1000, 0));
    }

    #[test]
    fn observe_three_way_tie_takes_max_logical() {
        let (time, clock) = clock(100);
        clock.tick().unwrap(); // local at (100, 0)
        time.set(100);
        let merged = clock.observe(Hlc::new(100, 9)).unwrap();
        assert_eq!(merged, Hlc::new(100, 10));
    }

    #[test]
    fn logical_overflow_is_reported() {
        let (_, clock) = clock(100);
        for _ in 0..=u16::MAX {
            clock.tick().unwrap();
        }
        assert_eq!(
            clock.tick(),
            Err(Error::LogicalOverflow { physical_ms: 100 })
        );
    }

    #[test]
    fn packing_preserves_order() {
        let a = Hlc::new(100, 65535);
        let b = Hlc::new(101, 0);
        assert!(a < b);
        assert!(a.as_u64() < b.as_u64());
        assert_eq!(Hlc::from_u64(a.as_u64()), a);
    }
}
