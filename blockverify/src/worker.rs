// Copyright 2026 Oxide Computer Company
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use slog::{debug, error, o, warn, Logger};

use blockverify_common::{BlockRange, DeviceGeometry, VerifyError};

use crate::{
    BlockDevice, ContentGenerator, IterationRecord, RangeLock, RateSamples,
    Reporter, RunConfig, Stats, StopPolicy, StopReason, StopSignal, Tag,
    VerifyOutcome, Verifier,
};

/// Everything the workers of one run share.
#[derive(Debug)]
pub struct RunContext {
    pub config: RunConfig,
    pub geometry: DeviceGeometry,
    pub generator: ContentGenerator,
    pub device: Arc<dyn BlockDevice>,
    pub locks: RangeLock,
    pub stats: Stats,
    pub policy: StopPolicy,
    pub stop: StopSignal,
    pub start: Instant,
    discard_warned: AtomicBool,
}

impl RunContext {
    pub fn new(
        config: RunConfig,
        geometry: DeviceGeometry,
        generator: ContentGenerator,
        device: Arc<dyn BlockDevice>,
        stop: StopSignal,
        start: Instant,
    ) -> Self {
        let locks =
            RangeLock::new(geometry.n_blocks(), config.max_blocks_per_op);
        let policy =
            StopPolicy::from_config(&config, start, geometry.n_blocks());
        RunContext {
            config,
            geometry,
            generator,
            device,
            locks,
            stats: Stats::new(),
            policy,
            stop,
            start,
            discard_warned: AtomicBool::new(false),
        }
    }
}

/// One worker thread's loop: acquire a range, verify what was there, write
/// new content, release, repeat.
#[derive(Debug)]
pub struct Worker {
    id: usize,
    ctx: Arc<RunContext>,
    rng: ChaCha8Rng,
    verifier: Verifier,
    write_buf: Vec<u8>,
    diagnostics_left: usize,
    diagnostics_muted: bool,
    reporter: Option<Reporter>,
    log: Logger,
}

impl Worker {
    /// Worker 0 also owns the status reporter.  With a fixed seed the
    /// worker's random stream is derived from it and the worker id.
    pub fn new(id: usize, ctx: Arc<RunContext>, log: &Logger) -> Self {
        let rng = match ctx.config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(
                seed ^ (id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
            ),
            None => ChaCha8Rng::from_entropy(),
        };
        let reporter = (id == 0).then(|| {
            Reporter::new(
                ctx.config.report_interval,
                ctx.geometry.n_blocks(),
                ctx.start,
            )
        });
        Worker {
            id,
            verifier: Verifier::new(
                ctx.device.clone(),
                ctx.generator,
                ctx.geometry,
            ),
            rng,
            write_buf: Vec::new(),
            diagnostics_left: ctx.config.max_diagnostics,
            diagnostics_muted: false,
            reporter,
            log: log.new(o!("worker" => id)),
            ctx,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Loop until the stop flag goes up.  Only an error the run cannot
    /// continue past ends the loop early, and it stops the other workers
    /// too.
    pub fn run(mut self) -> Result<Option<RateSamples>, VerifyError> {
        while !self.ctx.stop.is_raised() {
            if let Err(e) = self.iterate() {
                error!(self.log, "worker aborting: {}", e);
                self.ctx.stop.raise(StopReason::Aborted);
                return Err(e);
            }
        }
        debug!(self.log, "worker done");
        Ok(self.reporter.map(Reporter::into_samples))
    }

    fn iterate(&mut self) -> Result<(), VerifyError> {
        let lease = self.ctx.locks.acquire(&mut self.rng);
        let range = lease.range();

        let outcome = self.verifier.verify(&lease);
        self.log_outcome(range, &outcome);

        let tags = self.generate(range);

        let write_error = match self.write_and_flush(range, &tags) {
            Ok(()) => false,
            Err(e) => {
                warn!(self.log, "write of {} failed: {}", range, e);
                true
            }
        };

        // Whatever a failed write left behind is unknown, so those blocks
        // are not verified again until rewritten.
        let states: Vec<Option<Tag>> = if write_error {
            vec![None; tags.len()]
        } else {
            tags.into_iter().map(Some).collect()
        };
        let newly_covered =
            self.ctx
                .locks
                .release(lease, &states, &outcome.verified_blocks)?;

        let (_, len) = self.ctx.geometry.range_bytes(&range);
        let rec = IterationRecord {
            blocks: range.len(),
            bytes_written: if write_error { 0 } else { len as u64 },
            verified: outcome.verified,
            verified_duplicate: outcome.verified_duplicate,
            verified_trimmed: outcome.verified_trimmed,
            newly_covered,
            read_errors: outcome.read_error.is_some() as u64,
            write_errors: write_error as u64,
            mismatches: outcome.mismatches.len() as u64,
        };
        self.ctx.stats.record(&rec);

        if let Some(reporter) = &mut self.reporter {
            if let Some(line) = reporter.maybe_report(&self.ctx.stats) {
                println!("{}", line);
            }
        }

        if let Some(reason) = self
            .ctx
            .policy
            .evaluate(&self.ctx.stats.snapshot(), Instant::now())
        {
            self.ctx.stop.raise(reason);
        }
        Ok(())
    }

    fn log_outcome(&mut self, range: BlockRange, outcome: &VerifyOutcome) {
        debug!(
            self.log,
            "{} verified {} skipped {} mismatched {}",
            range,
            outcome.verified,
            outcome.skipped,
            outcome.mismatches.len()
        );
        if let Some(e) = &outcome.read_error {
            warn!(self.log, "read of {} failed: {}", range, e);
        }
        for m in &outcome.mismatches {
            if self.diagnostics_left > 0 {
                self.diagnostics_left -= 1;
                error!(
                    self.log,
                    "integrity mismatch";
                    "block" => m.block,
                    "offset" => m.offset,
                    "expected_tag" => %m.expected_tag,
                    "first_diff" => m.first_diff,
                    "expected" => hex::encode(&m.expected),
                    "actual" => hex::encode(&m.actual)
                );
            } else if !self.diagnostics_muted {
                self.diagnostics_muted = true;
                error!(
                    self.log,
                    "further mismatches from this worker are counted only"
                );
            }
        }
    }

    /// Pick a tag for each block and render the range into the write
    /// buffer.
    fn generate(&mut self, range: BlockRange) -> Vec<Tag> {
        let bs = self.ctx.generator.block_size();
        let (_, len) = self.ctx.geometry.range_bytes(&range);
        self.write_buf.resize(len, 0);

        let mut tags = Vec::with_capacity(range.len() as usize);
        for (block, chunk) in range.blocks().zip(self.write_buf.chunks_mut(bs))
        {
            let tag = Tag::pick(
                &mut self.rng,
                self.ctx.config.unique_pct,
                self.ctx.config.trim_pct,
            );
            self.ctx.generator.fill(
                self.ctx.geometry.byte_offset(block),
                tag,
                chunk,
            );
            tags.push(tag);
        }
        tags
    }

    /// Write the range, discard its trimmed blocks, and flush, all before
    /// the lease is given back.
    fn write_and_flush(
        &self,
        range: BlockRange,
        tags: &[Tag],
    ) -> Result<(), VerifyError> {
        let device = &self.ctx.device;
        let geometry = &self.ctx.geometry;
        let (offset, len) = geometry.range_bytes(&range);

        device.write_at(offset, &self.write_buf)?;

        for run in trimmed_runs(range, tags) {
            let (off, len) = geometry.range_bytes(&run);
            match device.discard(off, len as u64) {
                Ok(()) => {}
                // The blocks were written as zeroes anyway.
                Err(VerifyError::Unsupported(e)) => {
                    if !self.ctx.discard_warned.swap(true, Ordering::Relaxed) {
                        warn!(self.log, "discard not supported: {}", e);
                    }
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        device.flush()?;
        let _ = device.invalidate_cache(offset, len as u64);
        Ok(())
    }
}

/// Maximal runs of consecutive trimmed blocks within `range`.
fn trimmed_runs(range: BlockRange, tags: &[Tag]) -> Vec<BlockRange> {
    let mut runs = Vec::new();
    let mut start = None;
    for (block, tag) in range.blocks().zip(tags) {
        match (tag, start) {
            (Tag::Trimmed, None) => start = Some(block),
            (Tag::Trimmed, Some(_)) => {}
            (_, Some(s)) => {
                runs.push(BlockRange::new(s, block));
                start = None;
            }
            (_, None) => {}
        }
    }
    if let Some(s) = start {
        runs.push(BlockRange::new(s, range.end()));
    }
    runs
}
