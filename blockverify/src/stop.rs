// Copyright 2026 Oxide Computer Company
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::{RunConfig, StatsSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    IterationBudget,
    Deadline,
    FullCoverage,
    Failure,
    Signalled,
    /// A worker hit an error it could not absorb.
    Aborted,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::IterationBudget => "iteration count reached",
            StopReason::Deadline => "duration elapsed",
            StopReason::FullCoverage => "verified count reached device size",
            StopReason::Failure => "stopped on failure",
            StopReason::Signalled => "stop requested",
            StopReason::Aborted => "worker aborted",
        };
        write!(f, "{s}")
    }
}

/// When a run ends, apart from being told to.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopPolicy {
    pub max_iterations: Option<u64>,
    pub deadline: Option<Instant>,
    /// Target for the verified block counter.
    pub until_verified: Option<u64>,
    pub stop_on_failure: bool,
}

impl StopPolicy {
    pub fn from_config(
        config: &RunConfig,
        start: Instant,
        n_blocks: u64,
    ) -> Self {
        StopPolicy {
            max_iterations: config.count,
            deadline: config.duration.map(|d| start + d),
            until_verified: config.stop_at_full.then_some(n_blocks),
            stop_on_failure: config.stop_on_failure,
        }
    }

    pub fn evaluate(
        &self,
        snap: &StatsSnapshot,
        now: Instant,
    ) -> Option<StopReason> {
        if self.stop_on_failure && snap.mismatches > 0 {
            return Some(StopReason::Failure);
        }
        if self.max_iterations.is_some_and(|m| snap.iterations >= m) {
            return Some(StopReason::IterationBudget);
        }
        if self.until_verified.is_some_and(|n| snap.verified >= n) {
            return Some(StopReason::FullCoverage);
        }
        if self.deadline.is_some_and(|d| now >= d) {
            return Some(StopReason::Deadline);
        }
        None
    }
}

/// The shared stop flag and the reason it was first raised.
///
/// The flag may also be raised from outside (a signal handler), in which
/// case no reason is recorded and the run reports `Signalled`.
#[derive(Debug)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
    reason: OnceLock<StopReason>,
}

impl StopSignal {
    pub fn new(flag: Arc<AtomicBool>) -> Self {
        StopSignal {
            flag,
            reason: OnceLock::new(),
        }
    }

    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Raise the flag.  Only the first reason given sticks.
    pub fn raise(&self, reason: StopReason) {
        let _ = self.reason.set(reason);
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn reason(&self) -> Option<StopReason> {
        match self.reason.get() {
            Some(r) => Some(*r),
            None if self.is_raised() => Some(StopReason::Signalled),
            None => None,
        }
    }
}
