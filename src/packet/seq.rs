//! TCP sequence numbers.
//!
//! Sequence numbers live in a 32-bit space that wraps at 2^32, so every
//! comparison goes through the signed difference of two values. Plain `<` on
//! the raw `u32` is never correct once a stream crosses the wrap point.

use core::cmp::Ordering;
use core::fmt;
use core::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// A wraparound-aware TCP sequence number.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeqNum(u32);

impl SeqNum {
    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Signed distance from `self` to `other`.
    ///
    /// Positive when `other` lies ahead of `self`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn diff(self, other: SeqNum) -> i32 {
        other.0.wrapping_sub(self.0) as i32
    }

    /// Number of bytes from `self` up to `later`.
    ///
    /// Only meaningful when `later` is not behind `self`; callers check ordering first.
    #[inline]
    #[must_use]
    pub const fn distance_to(self, later: SeqNum) -> u32 {
        later.0.wrapping_sub(self.0)
    }

    #[inline]
    #[must_use]
    pub const fn is_before(self, other: SeqNum) -> bool {
        self.diff(other) > 0
    }

    #[inline]
    #[must_use]
    pub const fn is_before_or_eq(self, other: SeqNum) -> bool {
        self.diff(other) >= 0
    }

    #[inline]
    #[must_use]
    pub const fn is_after(self, other: SeqNum) -> bool {
        self.diff(other) < 0
    }

    #[inline]
    #[must_use]
    pub const fn is_after_or_eq(self, other: SeqNum) -> bool {
        self.diff(other) <= 0
    }

    /// Half-open range check `[start, end)`. An empty range contains nothing.
    #[must_use]
    pub fn in_range(self, start: SeqNum, end: SeqNum) -> bool {
        start != end && start.is_before_or_eq(self) && self.is_before(end)
    }

    #[must_use]
    pub fn max(self, other: SeqNum) -> SeqNum {
        if self.is_before(other) { other } else { self }
    }

    #[must_use]
    pub fn min(self, other: SeqNum) -> SeqNum {
        if self.is_before(other) { self } else { other }
    }
}

impl fmt::Debug for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeqNum({})", self.0)
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SeqNum {
    #[inline]
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl Add<u32> for SeqNum {
    type Output = SeqNum;

    #[inline]
    fn add(self, rhs: u32) -> SeqNum {
        SeqNum(self.0.wrapping_add(rhs))
    }
}

impl Sub<u32> for SeqNum {
    type Output = SeqNum;

    #[inline]
    fn sub(self, rhs: u32) -> SeqNum {
        SeqNum(self.0.wrapping_sub(rhs))
    }
}

/// Ordering relative to the wrap window. Only consistent for values less
/// than 2^31 apart, which holds for everything a single flow keeps.
impl PartialOrd for SeqNum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SeqNum {
    fn cmp(&self, other: &Self) -> Ordering {
        // a positive distance to `other` means `self` comes first
        0.cmp(&self.diff(*other))
    }
}
