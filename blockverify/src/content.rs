// Copyright 2026 Oxide Computer Company
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use blockverify_common::{verify_bail, VerifyError};

/// How the content of a written block was derived.
///
/// A block that has never been written has no tag at all, see
/// [`crate::BlockStateTable`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    /// Derived from the block offset, the run seed, and this value.
    Unique(u16),
    /// Derived from the run seed only, so identical on every block.
    Duplicate,
    /// All zeroes, and the range was discarded after writing.
    Trimmed,
}

impl Tag {
    /// Draw the tag for one freshly written block.  `unique_pct` of draws are
    /// `Unique`, the next `trim_pct` are `Trimmed`, the rest `Duplicate`.
    pub fn pick<R: Rng + ?Sized>(
        rng: &mut R,
        unique_pct: u8,
        trim_pct: u8,
    ) -> Tag {
        let perc = rng.gen_range(0..100u32);
        if perc < u32::from(unique_pct) {
            Tag::Unique(rng.gen())
        } else if perc < u32::from(unique_pct) + u32::from(trim_pct) {
            Tag::Trimmed
        } else {
            Tag::Duplicate
        }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tag::Unique(n) => write!(f, "unique:{:#06x}", n),
            Tag::Duplicate => write!(f, "duplicate"),
            Tag::Trimmed => write!(f, "trimmed"),
        }
    }
}

/// Expansion of seed material into a full block.  The two modes produce
/// different bytes for the same inputs, so a run sticks to one.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentMode {
    /// SHA-512 of the seed material, then of each previous digest.
    #[default]
    Hash,
    /// ChaCha8 keyed with the seed material.
    Fast,
}

const DIGEST_LEN: usize = 64;

/// Deterministic block content for `(offset, run seed, tag)`.
#[derive(Copy, Clone, Debug)]
pub struct ContentGenerator {
    block_size: usize,
    run_seed: u64,
    mode: ContentMode,
}

impl ContentGenerator {
    pub fn new(block_size: usize, run_seed: u64, mode: ContentMode) -> Self {
        assert_ne!(block_size, 0);
        ContentGenerator {
            block_size,
            run_seed,
            mode,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn run_seed(&self) -> u64 {
        self.run_seed
    }

    pub fn mode(&self) -> ContentMode {
        self.mode
    }

    pub fn generate(&self, offset: u64, tag: Tag) -> Vec<u8> {
        let mut out = vec![0u8; self.block_size];
        self.fill(offset, tag, &mut out);
        out
    }

    /// Fill `out` (exactly one block) with the content for the block at
    /// byte `offset`.
    pub fn fill(&self, offset: u64, tag: Tag, out: &mut [u8]) {
        assert_eq!(out.len(), self.block_size);
        match tag {
            Tag::Trimmed => out.fill(0),
            Tag::Duplicate => {
                self.expand(&self.run_seed.to_be_bytes(), out);
            }
            Tag::Unique(n) => {
                let mut material = [0u8; 18];
                material[..8].copy_from_slice(&offset.to_be_bytes());
                material[8..16].copy_from_slice(&self.run_seed.to_be_bytes());
                material[16..].copy_from_slice(&n.to_be_bytes());
                self.expand(&material, out);
            }
        }
    }

    fn expand(&self, material: &[u8], out: &mut [u8]) {
        match self.mode {
            ContentMode::Hash => {
                let mut digest = Sha512::digest(material);
                let mut pos = 0;
                loop {
                    let n = DIGEST_LEN.min(out.len() - pos);
                    out[pos..pos + n].copy_from_slice(&digest[..n]);
                    pos += n;
                    if pos == out.len() {
                        break;
                    }
                    digest = Sha512::digest(digest.as_slice());
                }
            }
            ContentMode::Fast => {
                // The material length sits in the last key byte so seed-only
                // and offset+seed+tag material never share a key.
                let mut key = [0u8; 32];
                key[..material.len()].copy_from_slice(material);
                key[31] = material.len() as u8;
                ChaCha8Rng::from_seed(key).fill_bytes(out);
            }
        }
    }

    /// Generate sample blocks twice and insist on identical output, and on
    /// duplicate content being independent of the offset.
    pub fn self_check(&self) -> Result<(), VerifyError> {
        let far = self.block_size as u64 * 7919;
        for tag in [Tag::Unique(0x5a5a), Tag::Duplicate, Tag::Trimmed] {
            for offset in [0, far] {
                if self.generate(offset, tag) != self.generate(offset, tag) {
                    verify_bail!(
                        InvariantViolation,
                        "{:?} content for {} at offset {} is not deterministic",
                        self.mode,
                        tag,
                        offset
                    );
                }
            }
        }
        let dup = self.generate(0, Tag::Duplicate);
        if dup != self.generate(far, Tag::Duplicate) {
            verify_bail!(
                InvariantViolation,
                "duplicate content differs between offsets 0 and {}",
                far
            );
        }
        Ok(())
    }
}
