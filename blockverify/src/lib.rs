// Copyright 2026 Oxide Computer Company

//! Concurrent data integrity stress testing for block devices.
//!
//! Workers repeatedly lease a random block range, check that it still holds
//! what was last written there, and overwrite it with freshly generated
//! content.  Content is a pure function of the block offset, the run seed,
//! and a per-block [`Tag`], so nothing but the tag needs to be remembered.

mod config;
mod content;
mod device;
mod in_memory;
mod lease;
mod run;
mod state;
mod stats;
mod stop;
mod verify;
mod worker;

pub use config::RunConfig;
pub use content::{ContentGenerator, ContentMode, Tag};
pub use device::{BlockDevice, FileDevice};
pub use in_memory::MemDevice;
pub use lease::{Lease, RangeLock};
pub use run::{run, RunSummary};
pub use state::BlockStateTable;
pub use stats::{
    status_line, IterationRecord, RateSamples, RateSummary, Reporter, Stats,
    StatsSnapshot,
};
pub use stop::{StopPolicy, StopReason, StopSignal};
pub use verify::{Mismatch, Verifier, VerifyOutcome};
pub use worker::{RunContext, Worker};
