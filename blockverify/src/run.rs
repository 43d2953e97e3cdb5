// Copyright 2026 Oxide Computer Company
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use slog::{info, warn, Logger};

use blockverify_common::{verify_bail, DeviceGeometry, VerifyError};

use crate::{
    status_line, BlockDevice, ContentGenerator, RateSamples, RunConfig,
    RunContext, StatsSnapshot, StopReason, StopSignal, Worker,
};

/// The result of a finished run, as written by `--summary-out`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub config: RunConfig,
    pub seed: u64,
    pub geometry: DeviceGeometry,
    pub elapsed_secs: f64,
    pub stats: StatsSnapshot,
    pub stop_reason: Option<StopReason>,
    pub rates: RateSamples,
}

impl RunSummary {
    /// No block ever read back wrong.
    pub fn passed(&self) -> bool {
        self.stats.mismatches == 0
    }

    pub fn status_line(&self) -> String {
        status_line(
            &self.stats,
            std::time::Duration::from_secs_f64(self.elapsed_secs),
            self.geometry.n_blocks(),
        )
    }
}

fn wall_clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Drive `device` with `config.workers` worker threads until a stop
/// condition is met or `stop` is raised from outside.
///
/// Errors come back only for problems found before the workers start, or
/// for a broken invariant; read/write failures and mismatches are counted
/// in the summary.
pub fn run(
    config: &RunConfig,
    device: Arc<dyn BlockDevice>,
    stop: Arc<AtomicBool>,
    log: &Logger,
) -> Result<RunSummary, VerifyError> {
    config.validate()?;

    let dev_size = device.size().map_err(|e| {
        VerifyError::SetupError(format!("cannot size device: {}", e))
    })?;
    let geometry = DeviceGeometry::new(dev_size, config.block_size)?;
    info!(
        log,
        "device size {} bytes, {} blocks of {}",
        dev_size,
        geometry.n_blocks(),
        geometry.block_size()
    );
    if geometry.remainder() != 0 {
        warn!(
            log,
            "last {} bytes of the device are not tested",
            geometry.remainder()
        );
    }

    let seed = config.seed.unwrap_or_else(wall_clock_seed);
    let generator =
        ContentGenerator::new(config.block_size as usize, seed, config.mode);
    generator.self_check()?;

    info!(
        log,
        "seed {} mode {:?} workers {} max blocks per op {} unique {}% trim {}%",
        seed,
        config.mode,
        config.workers,
        config.max_blocks_per_op.min(geometry.n_blocks()),
        config.unique_pct,
        config.trim_pct
    );
    if !config.is_bounded() {
        info!(log, "no stop condition given, running until signalled");
    }

    let start = Instant::now();
    let ctx = Arc::new(RunContext::new(
        config.clone(),
        geometry,
        generator,
        device,
        StopSignal::new(stop),
        start,
    ));

    let (spawn_error, results) = std::thread::scope(|s| {
        let mut handles = Vec::with_capacity(config.workers);
        let mut spawn_error = None;
        for id in 0..config.workers {
            let worker = Worker::new(id, ctx.clone(), log);
            match std::thread::Builder::new()
                .name(format!("worker-{}", id))
                .spawn_scoped(s, move || worker.run())
            {
                Ok(h) => handles.push(h),
                Err(e) => {
                    ctx.stop.raise(StopReason::Aborted);
                    spawn_error = Some(VerifyError::SetupError(format!(
                        "spawn worker {}: {}",
                        id, e
                    )));
                    break;
                }
            }
        }
        let results: Vec<_> = handles.into_iter().map(|h| h.join()).collect();
        (spawn_error, results)
    });

    if let Some(e) = spawn_error {
        return Err(e);
    }

    let mut rates = RateSamples::default();
    for res in results {
        match res {
            Ok(Ok(Some(samples))) => rates = samples,
            Ok(Ok(None)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                verify_bail!(InvariantViolation, "a worker thread panicked")
            }
        }
    }

    ctx.locks.check_disjoint()?;
    let leftover = ctx.locks.active_leases();
    if !leftover.is_empty() {
        verify_bail!(
            InvariantViolation,
            "{} leases still held after all workers stopped",
            leftover.len()
        );
    }

    let summary = RunSummary {
        config: config.clone(),
        seed,
        geometry,
        elapsed_secs: start.elapsed().as_secs_f64(),
        stats: ctx.stats.snapshot(),
        stop_reason: ctx.stop.reason(),
        rates,
    };
    info!(
        log,
        "run finished after {:.1}s: {}",
        summary.elapsed_secs,
        summary
            .stop_reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "no reason".to_string())
    );
    Ok(summary)
}
