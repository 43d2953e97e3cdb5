// Copyright 2026 Oxide Computer Company
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;

use blockverify_common::{verify_bail, BlockRange, VerifyError};

use crate::{BlockStateTable, Tag};

/// Candidates tried per trip through the mutex before backing off.
const ATTEMPTS_PER_LOCK: usize = 8;
const MIN_BACKOFF: Duration = Duration::from_micros(10);
const MAX_BACKOFF: Duration = Duration::from_millis(2);

/// Exclusive ownership of a block range, along with what the state table
/// said about those blocks at the moment it was granted.
#[derive(Debug)]
pub struct Lease {
    range: BlockRange,
    prior: Vec<Option<Tag>>,
}

impl Lease {
    pub fn range(&self) -> BlockRange {
        self.range
    }

    /// Prior states, one per block in the range, in block order.
    pub fn prior(&self) -> &[Option<Tag>] {
        &self.prior
    }

    pub fn any_written(&self) -> bool {
        self.prior.iter().any(Option::is_some)
    }
}

#[derive(Debug)]
struct Inner {
    // start -> end of every active lease
    active: BTreeMap<u64, u64>,
    table: BlockStateTable,
}

impl Inner {
    fn overlaps_active(&self, range: &BlockRange) -> bool {
        // Leases never overlap each other, so the only candidate is the
        // lease with the greatest start below our end.
        self.active
            .range(..range.end())
            .next_back()
            .is_some_and(|(_, &end)| end > range.start())
    }

    fn register(&mut self, range: BlockRange) -> Lease {
        self.active.insert(range.start(), range.end());
        let prior = range.blocks().map(|b| self.table.get(b)).collect();
        Lease { range, prior }
    }
}

/// Hands out non-overlapping block ranges to workers.
///
/// The active lease set and the [`BlockStateTable`] sit behind one mutex,
/// so the overlap test and the registration of a new lease happen as a
/// single step.
#[derive(Debug)]
pub struct RangeLock {
    n_blocks: u64,
    max_blocks_per_op: u64,
    inner: Mutex<Inner>,
}

impl RangeLock {
    /// `max_blocks_per_op` is clamped to the device size.
    pub fn new(n_blocks: u64, max_blocks_per_op: u64) -> Self {
        assert!(n_blocks > 0);
        RangeLock {
            n_blocks,
            max_blocks_per_op: max_blocks_per_op.clamp(1, n_blocks),
            inner: Mutex::new(Inner {
                active: BTreeMap::new(),
                table: BlockStateTable::new(n_blocks),
            }),
        }
    }

    pub fn n_blocks(&self) -> u64 {
        self.n_blocks
    }

    pub fn max_blocks_per_op(&self) -> u64 {
        self.max_blocks_per_op
    }

    fn candidate<R: Rng + ?Sized>(&self, rng: &mut R) -> BlockRange {
        let len = rng.gen_range(1..=self.max_blocks_per_op);
        let start = rng.gen_range(0..=self.n_blocks - len);
        BlockRange::from_len(start, len)
    }

    /// Draw random candidate ranges until one overlaps no active lease,
    /// then register and return it.  Sleeps with exponential backoff
    /// between rounds of candidates.
    pub fn acquire<R: Rng + ?Sized>(&self, rng: &mut R) -> Lease {
        let mut backoff = MIN_BACKOFF;
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                for _ in 0..ATTEMPTS_PER_LOCK {
                    let range = self.candidate(rng);
                    if !inner.overlaps_active(&range) {
                        return inner.register(range);
                    }
                }
            }
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Claim exactly `range` if nothing active overlaps it.
    pub fn try_claim(
        &self,
        range: BlockRange,
    ) -> Result<Option<Lease>, VerifyError> {
        if range.end() > self.n_blocks {
            verify_bail!(
                InvariantViolation,
                "range {} is past the last block {}",
                range,
                self.n_blocks - 1
            );
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.overlaps_active(&range) {
            return Ok(None);
        }
        Ok(Some(inner.register(range)))
    }

    /// Store the new state of every block in the lease, mark the blocks
    /// that verified as covered, and give the range back.
    ///
    /// Returns how many blocks were covered for the first time.
    pub fn release(
        &self,
        lease: Lease,
        states: &[Option<Tag>],
        verified: &[u64],
    ) -> Result<u64, VerifyError> {
        let range = lease.range;
        if states.len() as u64 != range.len() {
            verify_bail!(
                InvariantViolation,
                "{} states for lease {}",
                states.len(),
                range
            );
        }
        if let Some(b) = verified.iter().find(|b| !range.contains(**b)) {
            verify_bail!(
                InvariantViolation,
                "verified block {} outside lease {}",
                b,
                range
            );
        }

        let mut inner = self.inner.lock().unwrap();
        match inner.active.get(&range.start()) {
            Some(&end) if end == range.end() => {}
            _ => verify_bail!(
                InvariantViolation,
                "release of {} which is not an active lease",
                range
            ),
        }

        for (block, state) in range.blocks().zip(states) {
            inner.table.set(block, *state);
        }
        let mut newly = 0;
        for b in verified {
            if inner.table.mark_covered(*b) {
                newly += 1;
            }
        }
        inner.active.remove(&range.start());
        Ok(newly)
    }

    /// Walk the active set in order and confirm no two leases overlap.
    pub fn check_disjoint(&self) -> Result<(), VerifyError> {
        let inner = self.inner.lock().unwrap();
        let mut prev: Option<(u64, u64)> = None;
        for (&start, &end) in inner.active.iter() {
            if let Some((ps, pe)) = prev {
                if pe > start {
                    verify_bail!(
                        InvariantViolation,
                        "leases [{}, {}) and [{}, {}) overlap",
                        ps,
                        pe,
                        start,
                        end
                    );
                }
            }
            prev = Some((start, end));
        }
        Ok(())
    }

    pub fn active_leases(&self) -> Vec<BlockRange> {
        let inner = self.inner.lock().unwrap();
        inner
            .active
            .iter()
            .map(|(&s, &e)| BlockRange::new(s, e))
            .collect()
    }

    pub fn state(&self, block: u64) -> Option<Tag> {
        self.inner.lock().unwrap().table.get(block)
    }

    /// Distinct blocks verified at least once.
    pub fn covered(&self) -> u64 {
        self.inner.lock().unwrap().table.covered()
    }
}
