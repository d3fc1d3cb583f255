/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Time primitives for budget accounting: signed microsecond durations,
//! monotonic instants, and pluggable clock sources.
//!
//! The whole scheduler works in microseconds. [`Duration`] is *signed*: a
//! reservation that over-runs its budget inside one scheduler tick carries a
//! temporarily negative budget, and the recharge logic subtracts the overrun
//! from the next instance. [`Instant`] is an opaque monotonic µs count from
//! the clock origin; only ordering and differences are meaningful.

use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

// ── Duration ──────────────────────────────────────────────────────────────────

/// Signed span of time with microsecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
pub struct Duration(i64);

impl Duration {
    pub const ZERO: Duration = Duration(0);

    pub const fn from_usec(us: i64) -> Self {
        Duration(us)
    }

    pub const fn from_msec(ms: i64) -> Self {
        Duration(ms * 1_000)
    }

    /// Build from a `(seconds, nanoseconds)` pair; sub-µs precision is
    /// truncated.
    pub const fn from_sec_nsec(sec: i64, nsec: i64) -> Self {
        Duration(sec * 1_000_000 + nsec / 1_000)
    }

    pub const fn as_usec(self) -> i64 {
        self.0
    }

    /// Decompose into a `(seconds, nanoseconds)` pair. Both components carry
    /// the sign of the duration.
    pub const fn as_sec_nsec(self) -> (i64, i64) {
        (self.0 / 1_000_000, (self.0 % 1_000_000) * 1_000)
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn min(self, other: Duration) -> Duration {
        Duration(self.0.min(other.0))
    }

    pub fn max(self, other: Duration) -> Duration {
        Duration(self.0.max(other.0))
    }

    /// Clamp a negative value to zero; used where a stable observation point
    /// must report a budget within `[0, max_budget]`.
    pub fn clamp_floor_zero(self) -> Duration {
        Duration(self.0.max(0))
    }
}

impl Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Duration {
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl Sub for Duration {
    type Output = Duration;
    fn sub(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for Duration {
    fn sub_assign(&mut self, rhs: Duration) {
        *self = *self - rhs;
    }
}

impl Neg for Duration {
    type Output = Duration;
    fn neg(self) -> Duration {
        Duration(-self.0)
    }
}

impl std::fmt::Display for Duration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}us", self.0)
    }
}

// ── Instant ───────────────────────────────────────────────────────────────────

/// Monotonic point in time, microseconds since the clock origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
pub struct Instant(u64);

impl Instant {
    pub const ZERO: Instant = Instant(0);

    pub const fn from_usec(us: u64) -> Self {
        Instant(us)
    }

    pub const fn as_usec(self) -> u64 {
        self.0
    }

    /// Decompose into a `(seconds, nanoseconds)` pair.
    pub const fn as_sec_nsec(self) -> (u64, u64) {
        (self.0 / 1_000_000, (self.0 % 1_000_000) * 1_000)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    /// Adding a negative span saturates at the clock origin rather than
    /// wrapping; the scheduler never schedules before its own origin.
    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0.saturating_add_signed(rhs.as_usec()))
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl Sub for Instant {
    type Output = Duration;
    fn sub(self, rhs: Instant) -> Duration {
        Duration(self.0 as i64 - rhs.0 as i64)
    }
}

impl std::fmt::Display for Instant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (s, ns) = self.as_sec_nsec();
        write!(f, "<{s:>6}.{:06}>", ns / 1_000)
    }
}

// ── Clock sources ─────────────────────────────────────────────────────────────

/// Monotonic time source sampled at every scheduler entry point.
pub trait Clock: Send {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`std::time::Instant`], anchored at construction.
#[derive(Debug)]
pub struct SystemClock {
    origin: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant(self.origin.elapsed().as_micros() as u64)
    }
}

/// Manually driven clock for deterministic simulation.
///
/// Cloning yields a handle onto the same underlying time, so a test can keep
/// one handle while moving the other into the scheduler.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_us: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(t: Instant) -> Self {
        let c = Self::default();
        c.set(t);
        c
    }

    pub fn set(&self, t: Instant) {
        self.now_us.store(t.as_usec(), Ordering::SeqCst);
    }

    /// Move time forward; `d` must not be negative.
    pub fn advance(&self, d: Duration) {
        debug_assert!(!d.is_negative());
        self.now_us
            .fetch_add(d.as_usec().max(0) as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        Instant(self.now_us.load(Ordering::SeqCst))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
