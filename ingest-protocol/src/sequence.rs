//! Packet sequence numbers
//!
//! Data packets carry a 31-bit sequence number (bit 31 of the first header
//! word is the control flag). Arithmetic and comparisons wrap modulo 2^31.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// Largest representable sequence number
pub const MAX_SEQ_NUMBER: u32 = 0x7FFF_FFFF;

const HALF_SPACE: i64 = (MAX_SEQ_NUMBER as i64 + 1) / 2;

/// Sequence number with 31-bit wraparound semantics
///
/// The derived `Ord` compares raw values and is only used to key ordered
/// maps over short windows; protocol ordering goes through
/// [`SeqNumber::distance_to`] and the `lt`/`gt` family.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct SeqNumber(u32);

impl SeqNumber {
    pub const ZERO: SeqNumber = SeqNumber(0);

    /// Create a sequence number
    ///
    /// # Panics
    /// Panics if `value` does not fit in 31 bits
    pub fn new(value: u32) -> Self {
        assert!(
            value <= MAX_SEQ_NUMBER,
            "sequence number {} exceeds {}",
            value,
            MAX_SEQ_NUMBER
        );
        SeqNumber(value)
    }

    /// Create a sequence number, masking to 31 bits
    #[inline]
    pub fn new_unchecked(value: u32) -> Self {
        SeqNumber(value & MAX_SEQ_NUMBER)
    }

    #[inline]
    pub fn as_raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn increment(&mut self) {
        self.0 = (self.0 + 1) & MAX_SEQ_NUMBER;
    }

    #[inline]
    pub fn next(self) -> Self {
        SeqNumber((self.0 + 1) & MAX_SEQ_NUMBER)
    }

    /// Signed distance from `self` to `other`
    ///
    /// Positive when `other` is ahead of `self`. The result is folded into
    /// half the sequence space so values on either side of the wrap compare
    /// correctly.
    pub fn distance_to(self, other: SeqNumber) -> i32 {
        let modulus = MAX_SEQ_NUMBER as i64 + 1;
        let mut diff = (other.0 as i64 - self.0 as i64).rem_euclid(modulus);
        if diff >= HALF_SPACE {
            diff -= modulus;
        }
        diff as i32
    }

    #[inline]
    pub fn lt(self, other: SeqNumber) -> bool {
        self.distance_to(other) > 0
    }

    #[inline]
    pub fn le(self, other: SeqNumber) -> bool {
        self == other || self.lt(other)
    }

    #[inline]
    pub fn gt(self, other: SeqNumber) -> bool {
        self.distance_to(other) < 0
    }

    #[inline]
    pub fn ge(self, other: SeqNumber) -> bool {
        self == other || self.gt(other)
    }

    /// Iterate `count` sequence numbers starting at `self`
    pub fn span(self, count: u32) -> impl Iterator<Item = SeqNumber> {
        (0..count).map(move |i| self + i)
    }
}

impl fmt::Debug for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeqNumber({})", self.0)
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SeqNumber {
    fn from(value: u32) -> Self {
        SeqNumber::new_unchecked(value)
    }
}

impl From<SeqNumber> for u32 {
    fn from(seq: SeqNumber) -> u32 {
        seq.0
    }
}

impl Add<u32> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: u32) -> SeqNumber {
        SeqNumber::new_unchecked(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u32> for SeqNumber {
    fn add_assign(&mut self, rhs: u32) {
        *self = *self + rhs;
    }
}

impl Sub<u32> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: u32) -> SeqNumber {
        SeqNumber::new_unchecked(self.0.wrapping_sub(rhs))
    }
}

impl Sub for SeqNumber {
    type Output = i32;

    /// Signed distance `self - rhs`
    fn sub(self, rhs: SeqNumber) -> i32 {
        rhs.distance_to(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masking() {
        assert_eq!(SeqNumber::new_unchecked(MAX_SEQ_NUMBER + 6).as_raw(), 5);
    }

    #[test]
    #[should_panic]
    fn test_new_rejects_control_bit() {
        SeqNumber::new(MAX_SEQ_NUMBER + 1);
    }

    #[test]
    fn test_increment_wraps() {
        let mut seq = SeqNumber::new(MAX_SEQ_NUMBER);
        seq.increment();
        assert_eq!(seq, SeqNumber::ZERO);
        assert_eq!(SeqNumber::new(MAX_SEQ_NUMBER).next(), SeqNumber::ZERO);
    }

    #[test]
    fn test_distance_across_wrap() {
        let before = SeqNumber::new(MAX_SEQ_NUMBER - 4);
        let after = SeqNumber::new(3);
        assert_eq!(before.distance_to(after), 8);
        assert_eq!(after.distance_to(before), -8);
        assert!(before.lt(after));
        assert!(after.gt(before));
        assert_eq!(after - before, 8);
    }

    #[test]
    fn test_ordering_helpers() {
        let a = SeqNumber::new(40);
        let b = SeqNumber::new(41);
        assert!(a.lt(b) && a.le(b) && a.le(a));
        assert!(b.gt(a) && b.ge(a) && b.ge(b));
    }

    #[test]
    fn test_span() {
        let seqs: Vec<u32> = SeqNumber::new(MAX_SEQ_NUMBER - 1)
            .span(3)
            .map(SeqNumber::as_raw)
            .collect();
        assert_eq!(seqs, vec![MAX_SEQ_NUMBER - 1, MAX_SEQ_NUMBER, 0]);
    }

    #[test]
    fn test_sub_wraps() {
        assert_eq!((SeqNumber::new(2) - 5).as_raw(), MAX_SEQ_NUMBER - 2);
    }
}
