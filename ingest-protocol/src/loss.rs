//! Receiver loss list
//!
//! Missing sequence numbers are kept as merged inclusive ranges. Each range
//! remembers when it was detected and how often it was reported, so NAKs
//! can be rate limited to roughly one per round trip.

use crate::sequence::SeqNumber;
use std::time::{Duration, Instant};

/// Inclusive range of sequence numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossRange {
    pub start: SeqNumber,
    pub end: SeqNumber,
}

impl LossRange {
    pub fn new(start: SeqNumber, end: SeqNumber) -> Self {
        LossRange { start, end }
    }

    pub fn single(seq: SeqNumber) -> Self {
        LossRange { start: seq, end: seq }
    }

    pub fn contains(&self, seq: SeqNumber) -> bool {
        seq.ge(self.start) && seq.le(self.end)
    }

    pub fn len(&self) -> usize {
        (self.start.distance_to(self.end) + 1).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_single(&self) -> bool {
        self.start == self.end
    }

    /// Union with `other` if the two overlap or touch
    pub fn try_merge(&self, other: &LossRange) -> Option<LossRange> {
        if other.start.le(self.end.next()) && other.end.ge(self.start - 1) {
            Some(LossRange {
                start: if self.start.lt(other.start) {
                    self.start
                } else {
                    other.start
                },
                end: if self.end.gt(other.end) {
                    self.end
                } else {
                    other.end
                },
            })
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = SeqNumber> {
        self.start.span(self.len() as u32)
    }
}

#[derive(Debug, Clone)]
struct LossEntry {
    range: LossRange,
    detected_at: Instant,
    last_nak_sent: Option<Instant>,
    nak_count: u32,
}

/// Ordered list of outstanding losses
#[derive(Debug)]
pub struct LossList {
    losses: Vec<LossEntry>,
    max_nak_count: u32,
    nak_interval: Duration,
    first_nak_delay: Duration,
}

impl LossList {
    pub fn new(max_nak_count: u32, nak_interval: Duration) -> Self {
        LossList {
            losses: Vec::new(),
            max_nak_count,
            nak_interval,
            first_nak_delay: Duration::ZERO,
        }
    }

    /// Hold back the first report of a loss for `delay` after detection
    pub fn set_first_nak_delay(&mut self, delay: Duration) {
        self.first_nak_delay = delay;
    }

    /// Minimum spacing between two reports of the same loss
    pub fn set_nak_interval(&mut self, interval: Duration) {
        self.nak_interval = interval;
    }

    pub fn add(&mut self, seq: SeqNumber, now: Instant) {
        self.add_range(LossRange::single(seq), now);
    }

    pub fn add_range(&mut self, range: LossRange, now: Instant) {
        let mut merged = LossEntry {
            range,
            detected_at: now,
            last_nak_sent: None,
            nak_count: 0,
        };
        let mut kept = Vec::with_capacity(self.losses.len() + 1);

        for existing in self.losses.drain(..) {
            if let Some(range) = merged.range.try_merge(&existing.range) {
                merged.range = range;
                merged.detected_at = merged.detected_at.min(existing.detected_at);
                merged.nak_count = merged.nak_count.max(existing.nak_count);
                merged.last_nak_sent = merged.last_nak_sent.or(existing.last_nak_sent);
            } else if existing.range.start.lt(merged.range.start) {
                kept.push(existing);
            } else {
                kept.push(merged);
                merged = existing;
            }
        }

        kept.push(merged);
        self.losses = kept;
    }

    /// Drop `seq` from the list, splitting its range if needed
    ///
    /// Returns true when `seq` was outstanding.
    pub fn remove(&mut self, seq: SeqNumber) -> bool {
        let Some(pos) = self.losses.iter().position(|e| e.range.contains(seq)) else {
            return false;
        };

        let entry = self.losses.remove(pos);
        let mut insert_at = pos;
        if entry.range.start != seq {
            self.losses.insert(
                insert_at,
                LossEntry {
                    range: LossRange::new(entry.range.start, seq - 1),
                    ..entry.clone()
                },
            );
            insert_at += 1;
        }
        if entry.range.end != seq {
            self.losses.insert(
                insert_at,
                LossEntry {
                    range: LossRange::new(seq.next(), entry.range.end),
                    ..entry
                },
            );
        }
        true
    }

    /// Drop every loss up to and including `seq`, returning how many went
    pub fn remove_up_to(&mut self, seq: SeqNumber) -> usize {
        let mut removed = 0;
        self.losses.retain_mut(|entry| {
            if entry.range.end.le(seq) {
                removed += entry.range.len();
                false
            } else {
                if entry.range.start.le(seq) {
                    removed += entry.range.start.distance_to(seq) as usize + 1;
                    entry.range.start = seq.next();
                }
                true
            }
        });
        removed
    }

    /// Ranges due for a (re)report at `now`
    pub fn nak_ranges(&mut self, now: Instant) -> Vec<LossRange> {
        let mut ranges = Vec::new();

        for entry in &mut self.losses {
            let due = match entry.last_nak_sent {
                None => now.saturating_duration_since(entry.detected_at) >= self.first_nak_delay,
                Some(sent) => {
                    now.saturating_duration_since(sent) >= self.nak_interval
                        && entry.nak_count < self.max_nak_count
                }
            };

            if due {
                ranges.push(entry.range);
                entry.last_nak_sent = Some(now);
                entry.nak_count += 1;
            }
        }

        ranges
    }

    /// When the loss containing `seq` was first seen
    pub fn detected_at(&self, seq: SeqNumber) -> Option<Instant> {
        self.losses
            .iter()
            .find(|e| e.range.contains(seq))
            .map(|e| e.detected_at)
    }

    pub fn ranges(&self) -> Vec<LossRange> {
        self.losses.iter().map(|e| e.range).collect()
    }

    pub fn first(&self) -> Option<SeqNumber> {
        self.losses.first().map(|e| e.range.start)
    }

    pub fn len(&self) -> usize {
        self.losses.iter().map(|e| e.range.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.losses.is_empty()
    }

    pub fn clear(&mut self) {
        self.losses.clear();
    }

    pub fn contains(&self, seq: SeqNumber) -> bool {
        self.losses.iter().any(|e| e.range.contains(seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(n: u32) -> SeqNumber {
        SeqNumber::new(n)
    }

    #[test]
    fn test_adjacent_ranges_merge() {
        let a = LossRange::new(seq(10), seq(15));
        let b = LossRange::new(seq(16), seq(20));
        assert_eq!(a.try_merge(&b), Some(LossRange::new(seq(10), seq(20))));
        assert!(a.try_merge(&LossRange::new(seq(17), seq(20))).is_none());
    }

    #[test]
    fn test_out_of_order_adds_merge() {
        let now = Instant::now();
        let mut list = LossList::new(3, Duration::from_millis(100));
        list.add(seq(10), now);
        list.add(seq(12), now);
        list.add(seq(11), now);
        assert_eq!(list.ranges(), vec![LossRange::new(seq(10), seq(12))]);
    }

    #[test]
    fn test_remove_splits_range() {
        let now = Instant::now();
        let mut list = LossList::new(3, Duration::from_millis(100));
        list.add_range(LossRange::new(seq(10), seq(14)), now);

        assert!(list.remove(seq(12)));
        assert!(!list.remove(seq(12)));
        assert_eq!(
            list.ranges(),
            vec![
                LossRange::new(seq(10), seq(11)),
                LossRange::new(seq(13), seq(14))
            ]
        );
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn test_remove_up_to() {
        let now = Instant::now();
        let mut list = LossList::new(3, Duration::from_millis(100));
        list.add_range(LossRange::new(seq(5), seq(9)), now);
        list.add(seq(20), now);

        assert_eq!(list.remove_up_to(seq(7)), 3);
        assert_eq!(list.first(), Some(seq(8)));
        assert_eq!(list.remove_up_to(seq(30)), 3);
        assert!(list.is_empty());
    }

    #[test]
    fn test_nak_rate_limit() {
        let start = Instant::now();
        let mut list = LossList::new(2, Duration::from_millis(20));
        list.add_range(LossRange::new(seq(1), seq(2)), start);

        assert_eq!(list.nak_ranges(start).len(), 1);
        assert!(list.nak_ranges(start + Duration::from_millis(5)).is_empty());
        assert_eq!(list.nak_ranges(start + Duration::from_millis(25)).len(), 1);
        // max_nak_count reached
        assert!(list.nak_ranges(start + Duration::from_millis(60)).is_empty());
    }

    #[test]
    fn test_first_nak_delay() {
        let start = Instant::now();
        let mut list = LossList::new(4, Duration::from_millis(20));
        list.set_first_nak_delay(Duration::from_millis(50));
        list.add(seq(9), start);

        assert!(list.nak_ranges(start + Duration::from_millis(10)).is_empty());
        assert_eq!(
            list.nak_ranges(start + Duration::from_millis(50)),
            vec![LossRange::single(seq(9))]
        );
    }

    #[test]
    fn test_detection_time_kept_on_merge() {
        let start = Instant::now();
        let later = start + Duration::from_millis(40);
        let mut list = LossList::new(3, Duration::from_millis(10));
        list.add(seq(3), start);
        list.add(seq(4), later);
        assert_eq!(list.detected_at(seq(4)), Some(start));
    }
}
