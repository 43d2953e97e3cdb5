// Copyright 2026 Oxide Computer Company
use crate::Tag;

/// What was last written to each block, plus which blocks have been
/// verified at least once.
///
/// There is no locking in here.  The table lives inside the
/// [`crate::RangeLock`] mutex and a block's entry is only touched by the
/// worker holding the lease that covers it.
#[derive(Debug)]
pub struct BlockStateTable {
    tags: Vec<Option<Tag>>,
    covered: Vec<u64>,
    covered_count: u64,
}

impl BlockStateTable {
    pub fn new(n_blocks: u64) -> Self {
        BlockStateTable {
            tags: vec![None; n_blocks as usize],
            covered: vec![0; (n_blocks as usize).div_ceil(64)],
            covered_count: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.tags.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// `None` means the block has never been written this run.
    pub fn get(&self, block: u64) -> Option<Tag> {
        self.tags[block as usize]
    }

    pub fn set(&mut self, block: u64, state: Option<Tag>) {
        self.tags[block as usize] = state;
    }

    /// Record that `block` read back correctly.  Returns true the first time
    /// for a given block.
    pub fn mark_covered(&mut self, block: u64) -> bool {
        let word = &mut self.covered[(block / 64) as usize];
        let bit = 1u64 << (block % 64);
        if *word & bit != 0 {
            return false;
        }
        *word |= bit;
        self.covered_count += 1;
        true
    }

    pub fn is_covered(&self, block: u64) -> bool {
        self.covered[(block / 64) as usize] & (1u64 << (block % 64)) != 0
    }

    /// Number of distinct blocks verified at least once.
    pub fn covered(&self) -> u64 {
        self.covered_count
    }
}
