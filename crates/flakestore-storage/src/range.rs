//! Free index tracking as an ordered set of half-open ranges.
//!
//! Used by the chunk table for record slots and by every fixed-record data
//! table for its record indices. Ranges never overlap; touching ranges are
//! merged on insert so the set stays minimal.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A half-open interval `[begin, end)` of free indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongRange {
    /// First index in the range.
    pub begin: u64,
    /// First index after the range.
    pub end: u64,
}

impl LongRange {
    /// Creates a new range. `begin` must not exceed `end`.
    pub fn new(begin: u64, end: u64) -> Self {
        debug_assert!(begin <= end);
        Self { begin, end }
    }

    /// Number of indices in the range.
    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    /// True if the range holds no index.
    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// True if `index` lies inside the range.
    pub fn contains(&self, index: u64) -> bool {
        self.begin <= index && index < self.end
    }
}

impl fmt::Display for LongRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

/// Ordered, merge-on-insert set of free index ranges.
#[derive(Debug, Clone, Default)]
pub struct IndexRangeSet {
    /// begin -> end
    ranges: BTreeMap<u64, u64>,
    free_count: u64,
}

impl IndexRangeSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of free indices.
    pub fn free_count(&self) -> u64 {
        self.free_count
    }

    /// Number of disjoint ranges.
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// True if no index is free.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// True if `index` is free.
    pub fn contains(&self, index: u64) -> bool {
        self.ranges
            .range(..=index)
            .next_back()
            .is_some_and(|(_, &end)| index < end)
    }

    /// Iterates the ranges in ascending order.
    pub fn ranges(&self) -> impl Iterator<Item = LongRange> + '_ {
        self.ranges.iter().map(|(&begin, &end)| LongRange::new(begin, end))
    }

    /// Removes and returns the lowest free index.
    pub fn pop_lowest(&mut self) -> Option<u64> {
        let (&begin, &end) = self.ranges.iter().next()?;
        self.ranges.remove(&begin);
        if begin + 1 < end {
            self.ranges.insert(begin + 1, end);
        }
        self.free_count -= 1;
        Some(begin)
    }

    /// Removes the first `len` indices of the lowest range holding at least
    /// `len` of them and returns the first removed index.
    pub fn allocate_first_fit(&mut self, len: u64) -> Option<u64> {
        let (&begin, &end) = self.ranges.iter().find(|&(&b, &e)| e - b >= len)?;
        self.ranges.remove(&begin);
        if begin + len < end {
            self.ranges.insert(begin + len, end);
        }
        self.free_count -= len;
        Some(begin)
    }

    /// The range with the highest indices.
    pub fn last(&self) -> Option<LongRange> {
        self.ranges
            .iter()
            .next_back()
            .map(|(&begin, &end)| LongRange::new(begin, end))
    }

    /// Marks `index` as free. Returns false if it already was.
    pub fn insert(&mut self, index: u64) -> bool {
        self.insert_range(LongRange::new(index, index + 1))
    }

    /// Marks every index of `range` as free, merging with touching ranges.
    /// Returns false, leaving the set unchanged, if any index was already free.
    pub fn insert_range(&mut self, range: LongRange) -> bool {
        if range.is_empty() {
            return true;
        }
        if self.overlaps(range) {
            return false;
        }
        let mut begin = range.begin;
        let mut end = range.end;

        if let Some((&prev_begin, &prev_end)) = self.ranges.range(..begin).next_back() {
            if prev_end == begin {
                self.ranges.remove(&prev_begin);
                begin = prev_begin;
            }
        }
        if let Some(next_end) = self.ranges.remove(&end) {
            end = next_end;
        }
        self.ranges.insert(begin, end);
        self.free_count += range.len();
        true
    }

    /// Removes a single free index. Returns false if it was not free.
    pub fn remove(&mut self, index: u64) -> bool {
        let Some((&begin, &end)) = self.ranges.range(..=index).next_back() else {
            return false;
        };
        if index >= end {
            return false;
        }
        self.ranges.remove(&begin);
        if begin < index {
            self.ranges.insert(begin, index);
        }
        if index + 1 < end {
            self.ranges.insert(index + 1, end);
        }
        self.free_count -= 1;
        true
    }

    /// Drops every free index `>= limit`, returning how many were dropped.
    pub fn truncate(&mut self, limit: u64) -> u64 {
        let tail: Vec<(u64, u64)> = self
            .ranges
            .range(..)
            .filter(|&(_, &end)| end > limit)
            .map(|(&b, &e)| (b, e))
            .collect();
        let mut dropped = 0;
        for (begin, end) in tail {
            self.ranges.remove(&begin);
            if begin < limit {
                self.ranges.insert(begin, limit);
                dropped += end - limit;
            } else {
                dropped += end - begin;
            }
        }
        self.free_count -= dropped;
        dropped
    }

    fn overlaps(&self, range: LongRange) -> bool {
        if let Some((_, &end)) = self.ranges.range(..range.end).next_back() {
            if end > range.begin {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_lowest_prefers_lowest_index() {
        let mut set = IndexRangeSet::new();
        set.insert_range(LongRange::new(10, 12));
        set.insert(3);
        assert_eq!(set.pop_lowest(), Some(3));
        assert_eq!(set.pop_lowest(), Some(10));
        assert_eq!(set.pop_lowest(), Some(11));
        assert_eq!(set.pop_lowest(), None);
        assert_eq!(set.free_count(), 0);
    }

    #[test]
    fn test_insert_merges_neighbours() {
        let mut set = IndexRangeSet::new();
        assert!(set.insert(1));
        assert!(set.insert(3));
        assert_eq!(set.range_count(), 2);
        assert!(set.insert(2));
        assert_eq!(set.range_count(), 1);
        assert_eq!(set.ranges().next(), Some(LongRange::new(1, 4)));
        assert_eq!(set.free_count(), 3);
    }

    #[test]
    fn test_double_insert_rejected() {
        let mut set = IndexRangeSet::new();
        set.insert_range(LongRange::new(0, 10));
        assert!(!set.insert(5));
        assert!(!set.insert_range(LongRange::new(9, 11)));
        assert_eq!(set.free_count(), 10);
    }

    #[test]
    fn test_contains() {
        let mut set = IndexRangeSet::new();
        set.insert_range(LongRange::new(4, 8));
        assert!(!set.contains(3));
        assert!(set.contains(4));
        assert!(set.contains(7));
        assert!(!set.contains(8));
    }

    #[test]
    fn test_remove_splits_range() {
        let mut set = IndexRangeSet::new();
        set.insert_range(LongRange::new(0, 5));
        assert!(set.remove(2));
        assert!(!set.remove(2));
        let ranges: Vec<_> = set.ranges().collect();
        assert_eq!(ranges, vec![LongRange::new(0, 2), LongRange::new(3, 5)]);
        assert_eq!(set.free_count(), 4);
    }

    #[test]
    fn test_truncate() {
        let mut set = IndexRangeSet::new();
        set.insert_range(LongRange::new(0, 2));
        set.insert_range(LongRange::new(5, 10));
        set.insert_range(LongRange::new(20, 30));
        assert_eq!(set.truncate(7), 3 + 10);
        let ranges: Vec<_> = set.ranges().collect();
        assert_eq!(ranges, vec![LongRange::new(0, 2), LongRange::new(5, 7)]);
        assert_eq!(set.free_count(), 4);
        assert_eq!(set.truncate(0), 4);
        assert!(set.is_empty());
    }

    #[test]
    fn test_allocate_first_fit() {
        let mut set = IndexRangeSet::new();
        set.insert_range(LongRange::new(0, 4));
        set.insert_range(LongRange::new(10, 30));
        assert_eq!(set.allocate_first_fit(8), Some(10));
        assert_eq!(set.allocate_first_fit(4), Some(0));
        assert_eq!(set.allocate_first_fit(13), None);
        assert_eq!(set.allocate_first_fit(12), Some(18));
        assert!(set.is_empty());
        assert_eq!(set.free_count(), 0);
    }

    #[test]
    fn test_last() {
        let mut set = IndexRangeSet::new();
        assert_eq!(set.last(), None);
        set.insert_range(LongRange::new(0, 4));
        set.insert_range(LongRange::new(10, 30));
        assert_eq!(set.last(), Some(LongRange::new(10, 30)));
    }

    #[test]
    fn test_empty_range_is_noop() {
        let mut set = IndexRangeSet::new();
        assert!(set.insert_range(LongRange::new(4, 4)));
        assert!(set.is_empty());
        assert!(LongRange::new(4, 4).is_empty());
    }
}
