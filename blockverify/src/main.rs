// Copyright 2026 Oxide Computer Company
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use futures::StreamExt;
use human_bytes::human_bytes;
use signal_hook::consts::signal::*;
use signal_hook_tokio::Signals;
use slog::{info, warn, Logger};

use blockverify::{BlockDevice, ContentMode, FileDevice, RunConfig};
use blockverify_common::{build_logger_with_level, write_json};

#[derive(Debug, Parser)]
#[clap(name = "blockverify", term_width = 80)]
#[clap(
    about = "Concurrent randomized data integrity test for block devices",
    long_about = "Concurrent randomized data integrity test for block \
    devices.  Every block written is later read back and compared.  \
    EVERYTHING ON THE DEVICE IS OVERWRITTEN."
)]
pub struct Opt {
    /// Device (or file) to test.
    #[clap(short, long, action)]
    device: Option<PathBuf>,

    /// Block size in bytes.
    #[clap(short, long, action)]
    block_size: Option<u64>,

    /// Maximum number of blocks in one operation.
    #[clap(short, long = "max-blocks", action)]
    max_blocks: Option<u64>,

    /// Percentage of blocks written with unique content, for testing
    /// de-duplicating devices.
    #[clap(short, long, action)]
    unique_pct: Option<u8>,

    /// Percentage of blocks to trim.
    #[clap(short = 'T', long, action)]
    trim_pct: Option<u8>,

    /// Number of worker threads.
    #[clap(short = 'n', long, action)]
    workers: Option<usize>,

    /// Stop once as many blocks were verified as the device has.
    #[clap(short = 't', long, action)]
    stop_at_full: bool,

    /// Generate content with a seeded PRNG instead of hashing.
    #[clap(short, long, action)]
    fast: bool,

    /// Stop after this many iterations, over all workers.
    #[clap(short, long, action)]
    count: Option<u64>,

    /// Stop after this long, e.g. "10m" or "1h 30m".
    #[clap(long, value_parser = humantime::parse_duration)]
    duration: Option<Duration>,

    /// Run seed, to reproduce the content of an earlier run.
    #[clap(long, action)]
    seed: Option<u64>,

    /// Stop at the first block that reads back wrong.
    #[clap(long, action)]
    stop_on_failure: bool,

    /// How often to print a status line.
    #[clap(long, value_parser = humantime::parse_duration)]
    report_interval: Option<Duration>,

    /// Mismatches each worker reports in detail before only counting them.
    #[clap(long, action)]
    max_diagnostics: Option<usize>,

    /// TOML file with run settings.  Flags override it.
    #[clap(long, action)]
    config: Option<PathBuf>,

    /// Write the final summary here as JSON.
    #[clap(long, action)]
    summary_out: Option<PathBuf>,

    /// Log every iteration.
    #[clap(short, long, action)]
    verbose: bool,
}

impl Opt {
    fn run_config(&self) -> Result<RunConfig> {
        let mut c = match &self.config {
            Some(path) => RunConfig::from_toml_file(path)?,
            None => RunConfig::default(),
        };

        if let Some(d) = &self.device {
            c.device = Some(d.clone());
        }
        if let Some(v) = self.block_size {
            c.block_size = v;
        }
        if let Some(v) = self.max_blocks {
            c.max_blocks_per_op = v;
        }
        if let Some(v) = self.unique_pct {
            c.unique_pct = v;
        }
        if let Some(v) = self.trim_pct {
            c.trim_pct = v;
        }
        if let Some(v) = self.workers {
            c.workers = v;
        }
        if self.fast {
            c.mode = ContentMode::Fast;
        }
        if self.seed.is_some() {
            c.seed = self.seed;
        }
        if self.count.is_some() {
            c.count = self.count;
        }
        if self.duration.is_some() {
            c.duration = self.duration;
        }
        if let Some(v) = self.report_interval {
            c.report_interval = v;
        }
        if let Some(v) = self.max_diagnostics {
            c.max_diagnostics = v;
        }
        c.stop_at_full |= self.stop_at_full;
        c.stop_on_failure |= self.stop_on_failure;

        c.validate()?;
        Ok(c)
    }
}

/// The first signal asks the workers to finish their current iteration and
/// stop; a second one exits right away.
async fn handle_signals(
    mut signals: Signals,
    stop: Arc<AtomicBool>,
    log: Logger,
) {
    while let Some(signal) = signals.next().await {
        match signal {
            SIGINT | SIGTERM | SIGUSR1 => {
                if stop.swap(true, Ordering::SeqCst) {
                    warn!(log, "second signal {}, exiting now", signal);
                    std::process::exit(1);
                }
                info!(
                    log,
                    "signal {}, stopping after current iterations", signal
                );
            }
            x => {
                warn!(log, "ignoring unexpected signal {}", x);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    /*
     * A panic in any worker means the results can't be trusted, exit the
     * program right away.
     */
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    let opt = Opt::parse();
    let config = opt.run_config()?;

    let log = build_logger_with_level(if opt.verbose {
        slog::Level::Debug
    } else {
        slog::Level::Info
    });

    let path = config.device.clone().ok_or_else(|| {
        anyhow!("no device given, use --device or the config file")
    })?;
    let device = FileDevice::open(&path)?;
    let size = device.size()?;
    warn!(log, "all data on {:?} will be overwritten", path);
    info!(log, "{:?} is {}", device.path(), human_bytes(size as f64));

    let stop = Arc::new(AtomicBool::new(false));
    let signals = Signals::new([SIGINT, SIGTERM, SIGUSR1])?;
    let signals_handle = signals.handle();
    let signal_task =
        tokio::spawn(handle_signals(signals, stop.clone(), log.clone()));

    let device: Arc<dyn BlockDevice> = Arc::new(device);
    let run_log = log.clone();
    let summary = tokio::task::spawn_blocking(move || {
        blockverify::run(&config, device, stop, &run_log)
    })
    .await??;

    signals_handle.close();
    signal_task.await?;

    println!("{}", summary.status_line());
    if let Some(iops) = summary.rates.iops_summary() {
        println!("iterations/s {}", iops);
    }
    if let Some(bw) = summary.rates.bw_summary() {
        println!(
            "write MB/s mean {:.2} min {:.2} max {:.2}",
            bw.mean / 1024.0 / 1024.0,
            bw.min / 1024.0 / 1024.0,
            bw.max / 1024.0 / 1024.0
        );
    }
    println!("seed {}", summary.seed);

    if let Some(out) = &opt.summary_out {
        write_json(out, &summary, true)?;
        info!(log, "summary written to {:?}", out);
    }

    if !summary.passed() {
        bail!(
            "{} blocks failed verification, see logs for details",
            summary.stats.mismatches
        );
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(args: &[&str]) -> Opt {
        let mut argv = vec!["blockverify"];
        argv.extend_from_slice(args);
        Opt::try_parse_from(argv).unwrap()
    }

    #[test]
    fn short_flags() {
        let c = parse(&[
            "-d", "/dev/sdx", "-b", "512", "-m", "8", "-u", "20", "-T", "30",
            "-n", "4", "-t", "-f",
        ])
        .run_config()
        .unwrap();
        assert_eq!(c.device, Some(PathBuf::from("/dev/sdx")));
        assert_eq!(c.block_size, 512);
        assert_eq!(c.max_blocks_per_op, 8);
        assert_eq!(c.unique_pct, 20);
        assert_eq!(c.trim_pct, 30);
        assert_eq!(c.workers, 4);
        assert!(c.stop_at_full);
        assert_eq!(c.mode, ContentMode::Fast);
    }

    #[test]
    fn long_flags_and_durations() {
        let c = parse(&[
            "--device",
            "disk.img",
            "--duration",
            "2m",
            "--report-interval",
            "500ms",
            "--seed",
            "99",
            "--stop-on-failure",
        ])
        .run_config()
        .unwrap();
        assert_eq!(c.duration, Some(Duration::from_secs(120)));
        assert_eq!(c.report_interval, Duration::from_millis(500));
        assert_eq!(c.seed, Some(99));
        assert!(c.stop_on_failure);
        assert_eq!(c.block_size, 4096);
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(&path, "device = \"a.img\"\nworkers = 6\ntrim_pct = 5\n")
            .unwrap();
        let c = parse(&["--config", path.to_str().unwrap(), "-n", "3"])
            .run_config()
            .unwrap();
        assert_eq!(c.device, Some(PathBuf::from("a.img")));
        assert_eq!(c.workers, 3);
        assert_eq!(c.trim_pct, 5);
    }

    #[test]
    fn invalid_combination_is_rejected() {
        assert!(parse(&["-u", "90", "-T", "20"]).run_config().is_err());
    }
}
