//! Sets of vocabulary entries as sorted, disjoint half-open index ranges.
//!
//! Indices refer to positions in [`TokenizerInfo::sorted_vocab`], where tokens
//! sharing a prefix are adjacent, so the tokens legal after a grammar
//! position tend to form a handful of long runs.
//!
//! [`TokenizerInfo::sorted_vocab`]: crate::structured::tokenizer::TokenizerInfo::sorted_vocab

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::ops::Range;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenRanges {
    ranges: Vec<Range<u32>>,
}

impl TokenRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from arbitrary ranges; overlapping and adjacent ranges coalesce.
    pub fn from_ranges(mut ranges: Vec<Range<u32>>) -> Self {
        ranges.sort_by_key(|r| r.start);
        let mut out = Self::new();
        for r in ranges {
            out.push_range(r);
        }
        out
    }

    /// Append index `i`, which must not precede anything already present.
    pub fn push(&mut self, i: u32) {
        self.push_range(i..i + 1);
    }

    fn push_range(&mut self, r: Range<u32>) {
        if r.is_empty() {
            return;
        }
        match self.ranges.last_mut() {
            Some(last) if r.start <= last.end => last.end = last.end.max(r.end),
            _ => self.ranges.push(r),
        }
    }

    pub fn ranges(&self) -> &[Range<u32>] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of indices covered.
    pub fn len(&self) -> usize {
        self.ranges.iter().map(|r| r.len()).sum()
    }

    pub fn contains(&self, i: u32) -> bool {
        let at = self.ranges.partition_point(|r| r.end <= i);
        self.ranges.get(at).is_some_and(|r| r.start <= i)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.ranges.iter().flat_map(|r| r.clone())
    }

    /// Coalesce with another set.
    pub fn merge(&mut self, other: &TokenRanges) {
        let merged = Self::union([&*self, other]);
        *self = merged;
    }

    /// Union of many sets via a k-way merge on range starts.
    pub fn union<'a>(sets: impl IntoIterator<Item = &'a TokenRanges>) -> TokenRanges {
        let sets: Vec<&TokenRanges> = sets.into_iter().collect();
        let mut heap: BinaryHeap<Reverse<(u32, u32, usize, usize)>> = BinaryHeap::new();
        for (s, set) in sets.iter().enumerate() {
            if let Some(r) = set.ranges.first() {
                heap.push(Reverse((r.start, r.end, s, 0)));
            }
        }
        let mut out = TokenRanges::new();
        while let Some(Reverse((start, end, s, i))) = heap.pop() {
            out.push_range(start..end);
            if let Some(r) = sets[s].ranges.get(i + 1) {
                heap.push(Reverse((r.start, r.end, s, i + 1)));
            }
        }
        out
    }

    /// Complement within `0..n`.
    pub fn invert(&self, n: u32) -> TokenRanges {
        let mut out = TokenRanges::new();
        let mut cursor = 0;
        for r in &self.ranges {
            if r.start >= n {
                break;
            }
            out.push_range(cursor..r.start);
            cursor = r.end;
        }
        out.push_range(cursor.min(n)..n);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_coalesces_adjacent() {
        let mut r = TokenRanges::new();
        for i in [1, 2, 3, 7, 8] {
            r.push(i);
        }
        assert_eq!(r.ranges(), &[1..4, 7..9]);
        assert_eq!(r.len(), 5);
        assert!(r.contains(3));
        assert!(!r.contains(4));
        assert!(r.contains(8));
    }

    #[test]
    fn test_union_overlapping() {
        let a = TokenRanges::from_ranges(vec![0..2, 10..12]);
        let b = TokenRanges::from_ranges(vec![1..5, 20..21]);
        let c = TokenRanges::from_ranges(vec![5..6]);
        let u = TokenRanges::union([&a, &b, &c]);
        assert_eq!(u.ranges(), &[0..6, 10..12, 20..21]);

        let mut m = a.clone();
        m.merge(&c);
        assert_eq!(m.ranges(), &[0..2, 5..6, 10..12]);
    }

    #[test]
    fn test_invert() {
        let r = TokenRanges::from_ranges(vec![0..2, 5..6]);
        assert_eq!(r.invert(8).ranges(), &[2..5, 6..8]);
        assert_eq!(TokenRanges::new().invert(3).ranges(), &[0..3]);
        assert!(TokenRanges::from_ranges(vec![0..3]).invert(3).is_empty());
    }
}
