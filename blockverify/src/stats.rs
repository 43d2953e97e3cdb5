// Copyright 2026 Oxide Computer Company
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Run wide counters, shared by every worker.
///
/// Each counter only ever grows.  They are independent of one another, so
/// relaxed ordering is enough; a snapshot may see one iteration's updates
/// half applied, which the report tolerates.
#[derive(Debug, Default)]
pub struct Stats {
    iterations: AtomicU64,
    blocks_touched: AtomicU64,
    bytes_written: AtomicU64,
    verified: AtomicU64,
    verified_duplicate: AtomicU64,
    verified_trimmed: AtomicU64,
    covered: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
    mismatches: AtomicU64,
    failed_iterations: AtomicU64,
}

/// Everything one iteration of one worker adds to [`Stats`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IterationRecord {
    pub blocks: u64,
    pub bytes_written: u64,
    pub verified: u64,
    pub verified_duplicate: u64,
    pub verified_trimmed: u64,
    pub newly_covered: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub mismatches: u64,
}

impl IterationRecord {
    pub fn failed(&self) -> bool {
        self.read_errors + self.write_errors + self.mismatches > 0
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub iterations: u64,
    pub blocks_touched: u64,
    pub bytes_written: u64,
    pub verified: u64,
    pub verified_duplicate: u64,
    pub verified_trimmed: u64,
    pub covered: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub mismatches: u64,
    pub failed_iterations: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one finished iteration.  Returns the number of iterations
    /// recorded so far, this one included.
    pub fn record(&self, rec: &IterationRecord) -> u64 {
        let add = |c: &AtomicU64, v: u64| {
            if v != 0 {
                c.fetch_add(v, Ordering::Relaxed);
            }
        };
        add(&self.blocks_touched, rec.blocks);
        add(&self.bytes_written, rec.bytes_written);
        add(&self.verified, rec.verified);
        add(&self.verified_duplicate, rec.verified_duplicate);
        add(&self.verified_trimmed, rec.verified_trimmed);
        add(&self.covered, rec.newly_covered);
        add(&self.read_errors, rec.read_errors);
        add(&self.write_errors, rec.write_errors);
        add(&self.mismatches, rec.mismatches);
        if rec.failed() {
            self.failed_iterations.fetch_add(1, Ordering::Relaxed);
        }
        self.iterations.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    pub fn verified(&self) -> u64 {
        self.verified.load(Ordering::Relaxed)
    }

    pub fn mismatches(&self) -> u64 {
        self.mismatches.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            iterations: get(&self.iterations),
            blocks_touched: get(&self.blocks_touched),
            bytes_written: get(&self.bytes_written),
            verified: get(&self.verified),
            verified_duplicate: get(&self.verified_duplicate),
            verified_trimmed: get(&self.verified_trimmed),
            covered: get(&self.covered),
            read_errors: get(&self.read_errors),
            write_errors: get(&self.write_errors),
            mismatches: get(&self.mismatches),
            failed_iterations: get(&self.failed_iterations),
        }
    }
}

fn secs(d: Duration) -> f64 {
    d.as_secs_f64().max(f64::EPSILON)
}

/// The one line progress report.
///
/// `percent done` is verified blocks against the device size, so it passes
/// 100 once blocks start being verified a second time.  `covered` counts
/// each block once.
pub fn status_line(
    snap: &StatsSnapshot,
    elapsed: Duration,
    n_blocks: u64,
) -> String {
    let t = secs(elapsed);
    let avg = if snap.iterations == 0 {
        0.0
    } else {
        snap.blocks_touched as f64 / snap.iterations as f64
    };
    let pct = |v: u64| v as f64 * 100.0 / n_blocks as f64;
    format!(
        "total: {}, n/s: {}, avg blocks per it.: {:.2}, percent done: {:.2}, \
         covered: {:.2}%, verify cnt: {}/{}/{}, errors: {}/{}, \
         mismatches: {}, failures: {}, MB/s: {:.2}",
        snap.iterations,
        (snap.iterations as f64 / t) as u64,
        avg,
        pct(snap.verified),
        pct(snap.covered),
        snap.verified,
        snap.verified_duplicate,
        snap.verified_trimmed,
        snap.read_errors,
        snap.write_errors,
        snap.mismatches,
        snap.failed_iterations,
        snap.bytes_written as f64 / t / 1024.0 / 1024.0,
    )
}

/// Mean, spread, and extremes of a series of per-interval rates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateSummary {
    pub samples: usize,
    pub mean: f32,
    /// Absent with fewer than two samples.
    pub stddev: Option<f32>,
    pub min: f32,
    pub max: f32,
}

impl RateSummary {
    pub fn from_samples(samples: &[f32]) -> Option<RateSummary> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| {
            a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
        });
        Some(RateSummary {
            samples: samples.len(),
            mean: statistical::mean(samples),
            stddev: (samples.len() >= 2)
                .then(|| statistical::standard_deviation(samples, None)),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
        })
    }
}

impl std::fmt::Display for RateSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mean {:.2}", self.mean)?;
        if let Some(sd) = self.stddev {
            write!(f, " stddev {:.2}", sd)?;
        }
        write!(f, " min {:.2} max {:.2}", self.min, self.max)
    }
}

/// Per-interval rates kept by the reporting worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateSamples {
    /// Iterations per second.
    pub iops: Vec<f32>,
    /// Bytes written per second.
    pub bw: Vec<f32>,
}

impl RateSamples {
    pub fn iops_summary(&self) -> Option<RateSummary> {
        RateSummary::from_samples(&self.iops)
    }

    pub fn bw_summary(&self) -> Option<RateSummary> {
        RateSummary::from_samples(&self.bw)
    }
}

/// Produces a status line at most once per interval.  Owned by a single
/// worker so reports are never duplicated.
#[derive(Debug)]
pub struct Reporter {
    interval: Duration,
    n_blocks: u64,
    start: Instant,
    last: Instant,
    last_snap: StatsSnapshot,
    samples: RateSamples,
}

impl Reporter {
    pub fn new(interval: Duration, n_blocks: u64, start: Instant) -> Self {
        Reporter {
            interval,
            n_blocks,
            start,
            last: start,
            last_snap: StatsSnapshot::default(),
            samples: RateSamples::default(),
        }
    }

    /// If an interval has passed since the last report, sample the counters
    /// and return the status line.
    pub fn maybe_report(&mut self, stats: &Stats) -> Option<String> {
        self.report_at(stats, Instant::now())
    }

    fn report_at(&mut self, stats: &Stats, now: Instant) -> Option<String> {
        let since = now.saturating_duration_since(self.last);
        if since < self.interval {
            return None;
        }
        let snap = stats.snapshot();
        let t = secs(since) as f32;
        let iterations =
            snap.iterations.saturating_sub(self.last_snap.iterations);
        self.samples.iops.push(iterations as f32 / t);
        self.samples.bw.push(
            snap.bytes_written
                .saturating_sub(self.last_snap.bytes_written) as f32
                / t,
        );
        self.last = now;
        self.last_snap = snap;
        Some(status_line(
            &snap,
            now.saturating_duration_since(self.start),
            self.n_blocks,
        ))
    }

    pub fn samples(&self) -> &RateSamples {
        &self.samples
    }

    pub fn into_samples(self) -> RateSamples {
        self.samples
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn record_accumulates() {
        let stats = Stats::new();
        let rec = IterationRecord {
            blocks: 4,
            bytes_written: 4 * 4096,
            verified: 3,
            verified_duplicate: 1,
            verified_trimmed: 1,
            newly_covered: 2,
            ..Default::default()
        };
        assert_eq!(stats.record(&rec), 1);
        assert_eq!(stats.record(&rec), 2);

        let bad = IterationRecord {
            blocks: 1,
            read_errors: 1,
            ..Default::default()
        };
        assert_eq!(stats.record(&bad), 3);

        let s = stats.snapshot();
        assert_eq!(s.iterations, 3);
        assert_eq!(s.blocks_touched, 9);
        assert_eq!(s.bytes_written, 8 * 4096);
        assert_eq!(s.verified, 6);
        assert_eq!(s.verified_duplicate, 2);
        assert_eq!(s.verified_trimmed, 2);
        assert_eq!(s.covered, 4);
        assert_eq!(s.read_errors, 1);
        assert_eq!(s.failed_iterations, 1);
        assert_eq!(stats.verified(), 6);
        assert_eq!(stats.mismatches(), 0);
    }

    #[test]
    fn counters_from_many_threads() {
        let stats = Stats::new();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        stats.record(&IterationRecord {
                            blocks: 2,
                            mismatches: 1,
                            ..Default::default()
                        });
                    }
                });
            }
        });
        let s = stats.snapshot();
        assert_eq!(s.iterations, 4000);
        assert_eq!(s.blocks_touched, 8000);
        assert_eq!(s.mismatches, 4000);
        assert_eq!(s.failed_iterations, 4000);
    }

    #[test]
    fn status_line_fields() {
        let snap = StatsSnapshot {
            iterations: 200,
            blocks_touched: 500,
            bytes_written: 10 * 1024 * 1024,
            verified: 8,
            verified_duplicate: 2,
            verified_trimmed: 1,
            covered: 4,
            read_errors: 3,
            write_errors: 0,
            mismatches: 5,
            failed_iterations: 6,
        };
        let line = status_line(&snap, Duration::from_secs(2), 16);
        assert_eq!(
            line,
            "total: 200, n/s: 100, avg blocks per it.: 2.50, \
             percent done: 50.00, covered: 25.00%, verify cnt: 8/2/1, \
             errors: 3/0, mismatches: 5, failures: 6, MB/s: 5.00"
        );
    }

    #[test]
    fn status_line_at_start() {
        let line =
            status_line(&StatsSnapshot::default(), Duration::ZERO, 16);
        assert!(line.starts_with("total: 0, n/s: 0, avg blocks per it.: 0.00"));
    }

    #[test]
    fn reporter_waits_for_interval() {
        let stats = Stats::new();
        let start = Instant::now();
        let mut r = Reporter::new(Duration::from_secs(1), 16, start);

        stats.record(&IterationRecord {
            blocks: 1,
            bytes_written: 4096,
            ..Default::default()
        });
        let half = start + Duration::from_millis(500);
        assert!(r.report_at(&stats, half).is_none());

        let line = r.report_at(&stats, start + Duration::from_secs(1)).unwrap();
        assert!(line.starts_with("total: 1,"));
        assert_eq!(r.samples().iops, vec![1.0]);
        assert_eq!(r.samples().bw, vec![4096.0]);

        // Next interval only sees what happened since the last report.
        for _ in 0..4 {
            stats.record(&IterationRecord::default());
        }
        let early = start + Duration::from_millis(1500);
        assert!(r.report_at(&stats, early).is_none());
        r.report_at(&stats, start + Duration::from_secs(3)).unwrap();
        assert_eq!(r.samples().iops, vec![1.0, 2.0]);
        assert_eq!(r.into_samples().bw, vec![4096.0, 0.0]);
    }

    #[test]
    fn rate_summary() {
        assert!(RateSummary::from_samples(&[]).is_none());

        let one = RateSummary::from_samples(&[5.0]).unwrap();
        assert_eq!(one.mean, 5.0);
        assert_eq!(one.stddev, None);
        assert_eq!((one.min, one.max), (5.0, 5.0));

        let s = RateSummary::from_samples(&[4.0, 2.0, 6.0]).unwrap();
        assert_eq!(s.samples, 3);
        assert_eq!(s.mean, 4.0);
        assert_eq!(s.stddev, Some(2.0));
        assert_eq!((s.min, s.max), (2.0, 6.0));
        assert_eq!(s.to_string(), "mean 4.00 stddev 2.00 min 2.00 max 6.00");
    }
}
