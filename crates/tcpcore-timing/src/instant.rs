use std::ops::{Add, Sub};
use std::sync::OnceLock;

use crate::Duration;

static EPOCH: OnceLock<std::time::Instant> = OnceLock::new();

fn epoch() -> std::time::Instant {
    *EPOCH.get_or_init(std::time::Instant::now)
}

/// A wrapping microsecond counter since process start, the same shape as the
/// timer-wheel `now_base` each engine keeps: comparisons and subtraction use
/// `wrapping_sub`, so a wraparound (every ~71 minutes) is handled exactly
/// like TCP sequence-number wraparound rather than panicking or saturating.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Instant(pub u32);

impl Instant {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub fn now() -> Self {
        Instant(epoch().elapsed().as_micros().min(u32::MAX as u128) as u32)
    }

    /// Wrapping-safe `self - other`, matching sequence-number comparison.
    #[inline]
    pub fn wrapping_sub(self, other: Instant) -> Duration {
        Duration(self.0.wrapping_sub(other.0))
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        Instant::now().wrapping_sub(*self)
    }

    /// True if `self` is at or after `other` on the wrapping clock, using the
    /// same "is the signed delta non-negative" test as TCP sequence compare.
    #[inline]
    pub fn has_passed(&self, other: Instant) -> bool {
        (other.0.wrapping_sub(self.0) as i32) <= 0
    }
}

impl PartialOrd for Instant {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Instant {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.0.wrapping_sub(other.0) as i32).cmp(&0)
    }
}

impl Sub for Instant {
    type Output = Duration;
    #[inline]
    fn sub(self, rhs: Instant) -> Duration {
        self.wrapping_sub(rhs)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;
    #[inline]
    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0.wrapping_add(rhs.0))
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;
    #[inline]
    fn sub(self, rhs: Duration) -> Instant {
        Instant(self.0.wrapping_sub(rhs.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_sub_survives_counter_wraparound() {
        let before = Instant(u32::MAX - 10);
        let after = Instant(5);
        assert_eq!(after.wrapping_sub(before), Duration(16));
    }

    #[test]
    fn has_passed_across_wraparound() {
        let deadline = Instant(u32::MAX - 2);
        assert!(!deadline.has_passed(Instant(u32::MAX - 3)));
        assert!(deadline.has_passed(Instant(2)));
    }

    #[test]
    fn ord_respects_wraparound_not_raw_value() {
        let earlier = Instant(u32::MAX - 1);
        let later = Instant(1);
        assert!(earlier < later);
    }
}
