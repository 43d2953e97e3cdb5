// Copyright 2026 Oxide Computer Company

use serde::{Deserialize, Serialize};

use std::iter::FusedIterator;

/// A half-open interval `[start, end)` of block indices.
///
/// Ranges handed out by the range lock are never empty, so `new` insists on
/// at least one block.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
    Deserialize,
)]
pub struct BlockRange {
    start: u64,
    end: u64,
}

/// An iteration over the block indices in a [`BlockRange`]
pub struct BlockRangeIter {
    next: u64,
    end: u64,
}

impl Iterator for BlockRangeIter {
    type Item = u64;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.next < self.end {
            let result = self.next;
            self.next += 1;
            Some(result)
        } else {
            None
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.len(), Some(self.len()))
    }

    fn count(self) -> usize {
        self.len()
    }

    fn last(self) -> Option<Self::Item>
    where
        Self: Sized,
    {
        if self.next < self.end {
            Some(self.end - 1)
        } else {
            None
        }
    }
}

impl ExactSizeIterator for BlockRangeIter {
    fn len(&self) -> usize {
        (self.end - self.next) as usize
    }
}

impl DoubleEndedIterator for BlockRangeIter {
    #[inline]
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.next < self.end {
            self.end -= 1;
            Some(self.end)
        } else {
            None
        }
    }
}

impl FusedIterator for BlockRangeIter {}

impl BlockRange {
    /// Create a range from its first block and one past its last block.
    /// Panics unless `start < end`.
    pub fn new(start: u64, end: u64) -> Self {
        assert!(start < end, "empty block range {start}..{end}");
        BlockRange { start, end }
    }

    /// Create a range of `n_blocks` blocks beginning at `start`.
    pub fn from_len(start: u64, n_blocks: u64) -> Self {
        let end = start
            .checked_add(n_blocks)
            .expect("block range end overflows u64");
        BlockRange::new(start, end)
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, block: u64) -> bool {
        (self.start..self.end).contains(&block)
    }

    /// True when the two ranges share at least one block.
    pub fn overlaps(&self, other: &BlockRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn blocks(&self) -> BlockRangeIter {
        BlockRangeIter {
            next: self.start,
            end: self.end,
        }
    }
}

impl std::fmt::Display for BlockRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;
    use std::panic;
    use std::panic::UnwindSafe;
    use test_strategy::proptest;

    #[test]
    fn test_range_blocks() {
        let r = BlockRange::new(3, 7);
        assert_eq!(r.len(), 4);
        assert_eq!(r.blocks().collect::<Vec<_>>(), vec![3, 4, 5, 6]);
        assert_eq!(r.blocks().rev().collect::<Vec<_>>(), vec![6, 5, 4, 3]);
        assert_eq!(r.blocks().last(), Some(6));
        assert_eq!(r.blocks().count(), 4);
    }

    #[test]
    fn test_range_single_block() {
        let r = BlockRange::from_len(9, 1);
        assert_eq!(r, BlockRange::new(9, 10));
        assert!(r.contains(9));
        assert!(!r.contains(10));
        assert!(!r.contains(8));
    }

    #[test]
    fn test_range_overlap_edges() {
        let a = BlockRange::new(4, 8);

        // Touching at either end is not an overlap.
        assert!(!a.overlaps(&BlockRange::new(0, 4)));
        assert!(!a.overlaps(&BlockRange::new(8, 12)));

        assert!(a.overlaps(&BlockRange::new(0, 5)));
        assert!(a.overlaps(&BlockRange::new(7, 12)));
        assert!(a.overlaps(&BlockRange::new(5, 6)));
        assert!(a.overlaps(&BlockRange::new(0, 100)));
        assert!(a.overlaps(&a));
    }

    #[test]
    fn test_range_iter_mixed_ends() {
        let mut it = BlockRange::new(0, 4).blocks();
        assert_eq!(it.next(), Some(0));
        assert_eq!(it.next_back(), Some(3));
        assert_eq!(it.len(), 2);
        assert_eq!(it.next(), Some(1));
        assert_eq!(it.next_back(), Some(2));
        assert_eq!(it.next(), None);
        assert_eq!(it.next_back(), None);
    }

    /// prop_assert that something should panic
    fn prop_should_panic<F: FnOnce() -> R + UnwindSafe, R>(
        f: F,
    ) -> Result<(), TestCaseError> {
        let original_panic_hook = panic::take_hook();
        panic::set_hook(Box::new(|_| {}));
        let unwind = panic::catch_unwind(f);
        panic::set_hook(original_panic_hook);

        prop_assert!(unwind.is_err());
        Ok(())
    }

    #[proptest]
    /// Make sure that an empty or backwards range panics
    fn range_new_panics_for_flipped_polarity(
        #[strategy(0..=u64::MAX)] start_block: u64,
        #[strategy(0..=#start_block)] end_block: u64,
    ) {
        prop_should_panic(|| BlockRange::new(start_block, end_block))?;
    }

    #[proptest]
    fn range_blocks_iterates_over_all_blocks(
        #[strategy(0..1_000_000u64)] start: u64,
        #[strategy(1..=256u64)] n_blocks: u64,
    ) {
        let r = BlockRange::from_len(start, n_blocks);
        let expected: Vec<u64> = (start..start + n_blocks).collect();
        prop_assert_eq!(r.blocks().len() as u64, n_blocks);
        prop_assert_eq!(r.blocks().collect::<Vec<_>>(), expected);
    }

    #[proptest]
    /// overlaps() agrees with a block by block comparison
    fn range_overlap_matches_brute_force(
        #[strategy(0..64u64)] a_start: u64,
        #[strategy(1..=16u64)] a_len: u64,
        #[strategy(0..64u64)] b_start: u64,
        #[strategy(1..=16u64)] b_len: u64,
    ) {
        let a = BlockRange::from_len(a_start, a_len);
        let b = BlockRange::from_len(b_start, b_len);
        let brute = a.blocks().any(|blk| b.contains(blk));
        prop_assert_eq!(a.overlaps(&b), brute);
        prop_assert_eq!(b.overlaps(&a), brute);
    }
}
