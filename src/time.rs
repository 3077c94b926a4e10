//! Timespec arithmetic and the monotonic clock.
//!
//! All durations and timestamps in the runtime are `(sec, nsec)` pairs
//! read from `CLOCK_MONOTONIC`. Trigger pacing sleeps to absolute
//! deadlines on the same clock, so cycle times do not drift with the
//! execution time of the chain.

use std::cmp::Ordering;
use std::io::Result;
use std::ops::{Add, Sub};

use crate::ffi::syscall::{clock_gettime, clock_nanosleep_abs};
use crate::ffi::CLOCK;

pub const NSEC_PER_SEC: i64 = 1_000_000_000;
pub const NSEC_PER_USEC: i64 = 1_000;
pub const USEC_PER_SEC: i64 = 1_000_000;

/// A point in time or a duration on the monotonic clock.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl Timespec {
    pub const ZERO: Timespec = Timespec { sec: 0, nsec: 0 };

    /// Saturated sentinel, larger than any measured duration.
    /// Used to initialise minima so the first sample wins.
    pub const MAX: Timespec = Timespec {
        sec: i64::MAX,
        nsec: i64::MAX,
    };

    pub fn new(sec: i64, nsec: i64) -> Timespec {
        let mut ts = Timespec { sec, nsec };
        ts.norm();
        ts
    }

    /// Normalize so that `nsec` lies in `(-NSEC_PER_SEC, NSEC_PER_SEC)`
    /// and carries the same sign as `sec`.
    pub fn norm(&mut self) {
        if self.nsec >= NSEC_PER_SEC {
            self.sec += self.nsec / NSEC_PER_SEC;
            self.nsec %= NSEC_PER_SEC;
        }
        if self.nsec <= -NSEC_PER_SEC {
            self.sec += self.nsec / NSEC_PER_SEC;
            self.nsec %= NSEC_PER_SEC;
        }
        if self.sec > 0 && self.nsec < 0 {
            self.sec -= 1;
            self.nsec += NSEC_PER_SEC;
        }
        if self.sec < 0 && self.nsec > 0 {
            self.sec += 1;
            self.nsec -= NSEC_PER_SEC;
        }
    }

    /// Divide a duration by `div`.
    ///
    /// Reduces to total nanoseconds before dividing, so sub-second
    /// fractions of `sec` are not lost.
    pub fn div(&self, div: u64) -> Timespec {
        let total = self.sec * NSEC_PER_SEC + self.nsec;
        let total = total / div as i64;
        Timespec {
            sec: total / NSEC_PER_SEC,
            nsec: total % NSEC_PER_SEC,
        }
    }

    pub fn to_ns(&self) -> u64 {
        (self.sec.saturating_mul(NSEC_PER_SEC).saturating_add(self.nsec)).max(0) as u64
    }

    pub fn to_us(&self) -> u64 {
        (self
            .sec
            .saturating_mul(USEC_PER_SEC)
            .saturating_add(self.nsec / NSEC_PER_USEC))
        .max(0) as u64
    }

    pub fn to_f64(&self) -> f64 {
        self.sec as f64 + self.nsec as f64 / NSEC_PER_SEC as f64
    }
}

impl Add for Timespec {
    type Output = Timespec;

    fn add(self, rhs: Timespec) -> Timespec {
        Timespec::new(self.sec + rhs.sec, self.nsec + rhs.nsec)
    }
}

impl Sub for Timespec {
    type Output = Timespec;

    fn sub(self, rhs: Timespec) -> Timespec {
        Timespec::new(self.sec - rhs.sec, self.nsec - rhs.nsec)
    }
}

impl PartialOrd for Timespec {
    fn partial_cmp(&self, other: &Timespec) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timespec {
    fn cmp(&self, other: &Timespec) -> Ordering {
        self.sec
            .cmp(&other.sec)
            .then_with(|| self.nsec.cmp(&other.nsec))
    }
}

/// Current monotonic time.
pub fn gettime() -> Result<Timespec> {
    let ts = clock_gettime(CLOCK)?;
    Ok(Timespec {
        sec: ts.tv_sec as i64,
        nsec: ts.tv_nsec as i64,
    })
}

/// Sleep until the absolute monotonic deadline `ts`.
///
/// A deadline in the past returns immediately; the caller restarts the
/// cycle at the already-passed deadline rather than catching up.
pub fn sleep_until(ts: &Timespec) -> Result<()> {
    let deadline = libc::timespec {
        tv_sec: ts.sec as libc::time_t,
        tv_nsec: ts.nsec as libc::c_long,
    };
    clock_nanosleep_abs(CLOCK, &deadline)
}
