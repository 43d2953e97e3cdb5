// Copyright 2026 Oxide Computer Company
use std::fmt;
use std::sync::Arc;

use blockverify_common::{DeviceGeometry, VerifyError};

use crate::{BlockDevice, ContentGenerator, Lease, Tag};

const PREVIEW_LEN: usize = 16;

/// One block that read back different from what was last written to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub block: u64,
    pub offset: u64,
    pub expected_tag: Tag,
    /// Index within the block of the first byte that differs.
    pub first_diff: usize,
    /// Up to 16 bytes from `first_diff` on.
    pub expected: Vec<u8>,
    pub actual: Vec<u8>,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "block {} at offset {} ({}) differs from byte {}: \
             expected {} got {}",
            self.block,
            self.offset,
            self.expected_tag,
            self.first_diff,
            hex::encode(&self.expected),
            hex::encode(&self.actual),
        )
    }
}

/// What checking one lease found.
#[derive(Debug, Default)]
pub struct VerifyOutcome {
    /// Blocks that had never been written.
    pub skipped: u64,
    /// Blocks that matched.
    pub verified: u64,
    pub verified_duplicate: u64,
    pub verified_trimmed: u64,
    pub verified_blocks: Vec<u64>,
    pub mismatches: Vec<Mismatch>,
    /// Set when the range could not be read, in which case nothing was
    /// compared.
    pub read_error: Option<VerifyError>,
}

impl VerifyOutcome {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty() && self.read_error.is_none()
    }
}

/// Reads back a leased range and compares it with regenerated content.
///
/// Each worker owns one, so the read and compare buffers are reused from
/// one iteration to the next.
#[derive(Debug)]
pub struct Verifier {
    device: Arc<dyn BlockDevice>,
    generator: ContentGenerator,
    geometry: DeviceGeometry,
    read_buf: Vec<u8>,
    expected: Vec<u8>,
}

impl Verifier {
    pub fn new(
        device: Arc<dyn BlockDevice>,
        generator: ContentGenerator,
        geometry: DeviceGeometry,
    ) -> Self {
        assert_eq!(generator.block_size() as u64, geometry.block_size());
        Verifier {
            device,
            generator,
            geometry,
            read_buf: Vec::new(),
            expected: vec![0; generator.block_size()],
        }
    }

    pub fn verify(&mut self, lease: &Lease) -> VerifyOutcome {
        let range = lease.range();
        let mut out = VerifyOutcome::default();

        if !lease.any_written() {
            out.skipped = range.len();
            return out;
        }

        let (offset, len) = self.geometry.range_bytes(&range);

        // Failing to drop the cache only weakens the test, it doesn't
        // invalidate the comparison.
        let _ = self.device.invalidate_cache(offset, len as u64);

        self.read_buf.resize(len, 0);
        if let Err(e) = self.device.read_at(offset, &mut self.read_buf) {
            out.skipped =
                lease.prior().iter().filter(|s| s.is_none()).count() as u64;
            out.read_error = Some(e);
            return out;
        }

        let bs = self.generator.block_size();
        for (i, (block, prior)) in
            range.blocks().zip(lease.prior()).enumerate()
        {
            let Some(tag) = *prior else {
                out.skipped += 1;
                continue;
            };

            let block_offset = self.geometry.byte_offset(block);
            self.generator.fill(block_offset, tag, &mut self.expected);
            let actual = &self.read_buf[i * bs..(i + 1) * bs];

            match first_difference(&self.expected, actual) {
                None => {
                    out.verified += 1;
                    match tag {
                        Tag::Duplicate => out.verified_duplicate += 1,
                        Tag::Trimmed => out.verified_trimmed += 1,
                        Tag::Unique(_) => {}
                    }
                    out.verified_blocks.push(block);
                }
                Some(first_diff) => {
                    let end = (first_diff + PREVIEW_LEN).min(bs);
                    out.mismatches.push(Mismatch {
                        block,
                        offset: block_offset,
                        expected_tag: tag,
                        first_diff,
                        expected: self.expected[first_diff..end].to_vec(),
                        actual: actual[first_diff..end].to_vec(),
                    });
                }
            }
        }

        out
    }
}

fn first_difference(a: &[u8], b: &[u8]) -> Option<usize> {
    if a == b {
        return None;
    }
    a.iter().zip(b).position(|(x, y)| x != y)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ContentMode, MemDevice, RangeLock};
    use blockverify_common::BlockRange;

    const BS: u64 = 512;
    const N: u64 = 16;

    struct Rig {
        dev: Arc<MemDevice>,
        content: ContentGenerator,
        geometry: DeviceGeometry,
        locks: RangeLock,
        verifier: Verifier,
    }

    fn rig() -> Rig {
        let dev = Arc::new(MemDevice::new((BS * N) as usize));
        let content = ContentGenerator::new(BS as usize, 11, ContentMode::Hash);
        let geometry = DeviceGeometry::new(BS * N, BS).unwrap();
        let verifier = Verifier::new(dev.clone(), content, geometry);
        Rig {
            dev,
            content,
            geometry,
            locks: RangeLock::new(N, N),
            verifier,
        }
    }

    impl Rig {
        /// Write `tags` starting at `start` and record them as the state.
        fn write(&self, start: u64, tags: &[Option<Tag>]) {
            let range = BlockRange::from_len(start, tags.len() as u64);
            let lease = self.locks.try_claim(range).unwrap().unwrap();
            for (block, tag) in range.blocks().zip(tags) {
                if let Some(tag) = tag {
                    let off = self.geometry.byte_offset(block);
                    let data = self.content.generate(off, *tag);
                    self.dev.write_at(off, &data).unwrap();
                }
            }
            self.locks.release(lease, tags, &[]).unwrap();
        }

        fn check(&mut self, start: u64, len: u64) -> VerifyOutcome {
            let range = BlockRange::from_len(start, len);
            let lease = self.locks.try_claim(range).unwrap().unwrap();
            let out = self.verifier.verify(&lease);
            let prior = lease.prior().to_vec();
            self.locks.release(lease, &prior, &[]).unwrap();
            out
        }
    }

    #[test]
    fn unwritten_range_is_skipped_without_io() {
        let mut r = rig();
        let out = r.check(0, 4);
        assert_eq!(out.skipped, 4);
        assert_eq!(out.verified, 0);
        assert!(out.is_clean());
        assert_eq!(r.dev.invalidations(), 0);
    }

    #[test]
    fn written_blocks_verify() {
        let mut r = rig();
        r.write(
            2,
            &[
                Some(Tag::Unique(3)),
                Some(Tag::Duplicate),
                Some(Tag::Trimmed),
                None,
            ],
        );
        let out = r.check(1, 6);
        assert!(out.is_clean());
        assert_eq!(out.verified, 3);
        assert_eq!(out.verified_duplicate, 1);
        assert_eq!(out.verified_trimmed, 1);
        assert_eq!(out.skipped, 3);
        assert_eq!(out.verified_blocks, vec![2, 3, 4]);
        assert_eq!(r.dev.invalidations(), 1);
    }

    #[test]
    fn duplicate_blocks_are_identical_and_verify() {
        let mut r = rig();
        r.write(0, &[Some(Tag::Duplicate); 8]);
        let contents = r.dev.contents();
        let bs = BS as usize;
        for i in 1..8 {
            assert_eq!(contents[..bs], contents[i * bs..(i + 1) * bs]);
        }
        let out = r.check(0, 8);
        assert_eq!(out.verified, 8);
        assert_eq!(out.verified_duplicate, 8);
    }

    #[test]
    fn corruption_is_reported() {
        let mut r = rig();
        r.write(4, &[Some(Tag::Unique(1)), Some(Tag::Unique(2))]);
        r.dev.corrupt((5 * BS + 100) as usize, 1);

        let out = r.check(4, 2);
        assert_eq!(out.verified, 1);
        assert_eq!(out.verified_blocks, vec![4]);
        assert_eq!(out.mismatches.len(), 1);

        let m = &out.mismatches[0];
        assert_eq!(m.block, 5);
        assert_eq!(m.offset, 5 * BS);
        assert_eq!(m.expected_tag, Tag::Unique(2));
        assert_eq!(m.first_diff, 100);
        assert_eq!(m.expected.len(), PREVIEW_LEN);
        assert_eq!(m.actual[0], !m.expected[0]);
        assert_eq!(m.actual[1..], m.expected[1..]);
        assert!(m.to_string().contains("block 5"));
    }

    #[test]
    fn preview_is_cut_at_block_end() {
        let mut r = rig();
        r.write(0, &[Some(Tag::Unique(9))]);
        r.dev.corrupt((BS - 4) as usize, 1);
        let out = r.check(0, 1);
        assert_eq!(out.mismatches[0].first_diff, (BS - 4) as usize);
        assert_eq!(out.mismatches[0].expected.len(), 4);
    }

    #[test]
    fn trimmed_block_with_data_is_a_mismatch() {
        let mut r = rig();
        r.write(0, &[Some(Tag::Trimmed)]);
        r.dev.write_at(0, &[1u8]).unwrap();
        let out = r.check(0, 1);
        assert_eq!(out.verified_trimmed, 0);
        assert_eq!(out.mismatches.len(), 1);
        assert_eq!(out.mismatches[0].first_diff, 0);
    }

    #[test]
    fn read_error_is_not_a_mismatch() {
        let mut r = rig();
        r.write(0, &[Some(Tag::Unique(1)), None]);
        r.dev.set_fail_reads(true);
        let out = r.check(0, 2);
        assert!(matches!(out.read_error, Some(VerifyError::ReadError(_))));
        assert!(out.mismatches.is_empty());
        assert_eq!(out.verified, 0);
        assert_eq!(out.skipped, 1);
    }
}
