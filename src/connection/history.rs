use std::collections::VecDeque;

use crate::range_set::RangeSet;

/// Largest number of distinct gaps tracked before the oldest ranges are dropped
///
/// A peer that deliberately leaves holes in the packet number sequence could otherwise
/// grow this state without bound.
pub(crate) const MAX_ACK_RANGES: usize = 500;

/// An inclusive interval of received packet numbers
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct PacketInterval {
    pub(crate) start: u64,
    pub(crate) end: u64,
}

/// Records which packet numbers were received in one packet number space
///
/// Maintains the maximal contiguous intervals of received packet numbers, supports
/// trimming once ranges have been acknowledged by the peer (and that acknowledgement
/// acknowledged back), and answers whether a freshly decrypted packet may be a replay.
/// Duplicate detection is conservative: everything at or below the deletion point is
/// reported as a potential duplicate forever, including ranges evicted for exceeding
/// [`MAX_ACK_RANGES`].
#[derive(Debug, Default)]
pub(crate) struct ReceivedPacketHistory {
    /// Ascending, disjoint, non-adjacent intervals
    ranges: VecDeque<PacketInterval>,
    /// All packet numbers below this have been dropped from `ranges`
    deleted_below: u64,
}

impl ReceivedPacketHistory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record receipt of `pn`; returns false if the packet was already recorded or its
    /// range was already deleted
    pub(crate) fn received_packet(&mut self, pn: u64) -> bool {
        if pn < self.deleted_below {
            return false;
        }
        let is_new = self.add_to_ranges(pn);
        if self.ranges.len() > MAX_ACK_RANGES {
            // The lowest range is the least useful for ACK generation; evicted packet
            // numbers count as duplicates from here on.
            let evicted = self.ranges.pop_front().unwrap();
            self.deleted_below = self.deleted_below.max(evicted.end + 1);
        }
        is_new
    }

    fn add_to_ranges(&mut self, pn: u64) -> bool {
        // Fast path: in order
        if let Some(last) = self.ranges.back_mut() {
            if pn == last.end + 1 {
                last.end = pn;
                return true;
            }
            if pn > last.end {
                self.ranges.push_back(PacketInterval { start: pn, end: pn });
                return true;
            }
        } else {
            self.ranges.push_back(PacketInterval { start: pn, end: pn });
            return true;
        }

        // Find the first interval ending at or after pn - 1, then extend, merge, or
        // insert before it.
        for i in 0..self.ranges.len() {
            let interval = self.ranges[i];
            if pn >= interval.start && pn <= interval.end {
                return false;
            }
            if interval.end + 1 == pn {
                // Extend at the back, merging with the successor if they now touch
                self.ranges[i].end = pn;
                if i + 1 < self.ranges.len() && self.ranges[i + 1].start == pn + 1 {
                    self.ranges[i].end = self.ranges[i + 1].end;
                    self.ranges.remove(i + 1);
                }
                return true;
            }
            if interval.start == pn + 1 {
                // Extend at the front
                self.ranges[i].start = pn;
                return true;
            }
            if pn < interval.start {
                self.ranges.insert(i, PacketInterval { start: pn, end: pn });
                return true;
            }
        }
        unreachable!("fast path handles insertion above the highest range");
    }

    /// Drop state for all packet numbers strictly below `pn`
    ///
    /// Called when an ACK covering them has itself been acknowledged: the peer will
    /// never need them reported again.
    pub(crate) fn delete_below(&mut self, pn: u64) {
        if pn <= self.deleted_below {
            return;
        }
        self.deleted_below = pn;
        while let Some(&front) = self.ranges.front() {
            if front.end < pn {
                self.ranges.pop_front();
            } else {
                if front.start < pn {
                    self.ranges.front_mut().unwrap().start = pn;
                }
                break;
            }
        }
    }

    /// All tracked intervals, highest first, matching ACK frame layout
    pub(crate) fn ack_ranges(&self) -> impl Iterator<Item = PacketInterval> + '_ {
        self.ranges.iter().rev().copied()
    }

    /// The interval containing the highest received packet number, if any
    pub(crate) fn highest_range(&self) -> Option<PacketInterval> {
        self.ranges.back().copied()
    }

    /// Number of tracked intervals
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.ranges.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Conservatively decide whether `pn` may already have been processed
    pub(crate) fn is_potentially_duplicate(&self, pn: u64) -> bool {
        if pn < self.deleted_below {
            return true;
        }
        self.ranges
            .iter()
            .any(|r| pn >= r.start && pn <= r.end)
    }

    /// Collect the tracked intervals into a [`RangeSet`] for ACK frame encoding
    pub(crate) fn to_range_set(&self) -> RangeSet {
        let mut set = RangeSet::new();
        for interval in self.ack_ranges() {
            set.insert(interval.start..interval.end + 1);
        }
        set
    }
}
