// Copyright 2026 Oxide Computer Company
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use ErrorKind::NotFound;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use slog::{o, Drain, Logger};
use tempfile::NamedTempFile;

/// Errors raised by the verification core and the device adapters.
///
/// Read and write failures are operational: workers count them and keep
/// going.  `InvariantViolation` means the core itself is broken.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("setup error: {0}")]
    SetupError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("read error: {0}")]
    ReadError(String),

    #[error("write error: {0}")]
    WriteError(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl VerifyError {
    /// True for the errors a worker absorbs into its counters.
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            VerifyError::IoError(_)
                | VerifyError::ReadError(_)
                | VerifyError::WriteError(_)
                | VerifyError::Unsupported(_)
        )
    }
}

impl From<std::io::Error> for VerifyError {
    fn from(e: std::io::Error) -> Self {
        VerifyError::IoError(e.to_string())
    }
}

#[macro_export]
macro_rules! verify_bail {
    ($i:ident, $str:expr) => {
        return Err($crate::VerifyError::$i($str.to_string()))
    };

    ($i:ident, $fmt:expr, $($arg:tt)*) => {
        return Err($crate::VerifyError::$i(format!($fmt, $($arg)*)))
    };
}

mod block_range;
mod geometry;

pub use block_range::*;
pub use geometry::*;

pub fn build_logger() -> Logger {
    build_logger_with_level(slog::Level::Info)
}

/// Logs go to stderr; stdout is reserved for the status report.
pub fn build_logger_with_level(level: slog::Level) -> Logger {
    let main_drain = if atty::is(atty::Stream::Stderr) {
        let decorator = slog_term::TermDecorator::new().stderr().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build()
    } else {
        let drain =
            slog_bunyan::with_name("blockverify", std::io::stderr())
                .build()
                .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build()
    };

    Logger::root(main_drain.filter_level(level).fuse(), o!())
}

pub fn read_json_maybe<P, T>(file: P) -> Result<Option<T>>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let file = file.as_ref();
    let mut f = match File::open(file) {
        Ok(f) => f,
        Err(e) if e.kind() == NotFound => return Ok(None),
        Err(e) => bail!("open {:?}: {:?}", file, e),
    };
    let mut buf = Vec::<u8>::new();
    f.read_to_end(&mut buf)
        .with_context(|| anyhow!("read {:?}", file))?;
    Ok(serde_json::from_slice(buf.as_slice())
        .with_context(|| anyhow!("parse {:?}", file))?)
}

pub fn read_json<P, T>(file: P) -> Result<T>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let file = file.as_ref();
    read_json_maybe(file)?
        .ok_or_else(|| anyhow!("open {:?}: file not found", file))
}

/// Write `data` as pretty JSON via a temporary file in the same directory,
/// so readers never see a partially written file.
pub fn write_json<P, T>(file: P, data: &T, clobber: bool) -> Result<()>
where
    P: AsRef<Path>,
    T: Serialize,
{
    let file = file.as_ref();
    let mut buf = serde_json::to_vec_pretty(data)?;
    buf.push(b'\n');
    let dir = match file.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmpf = NamedTempFile::new_in(dir)?;
    tmpf.write_all(&buf)?;
    tmpf.flush()?;

    if clobber {
        tmpf.persist(file)?;
    } else {
        tmpf.persist_noclobber(file)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        iterations: u64,
        device: String,
    }

    #[test]
    fn json_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let res: Option<Sample> =
            read_json_maybe(dir.path().join("nope.json")).unwrap();
        assert!(res.is_none());
        assert!(read_json::<_, Sample>(dir.path().join("nope.json")).is_err());
    }

    #[test]
    fn json_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        let s = Sample {
            iterations: 200,
            device: "/dev/null".to_string(),
        };
        write_json(&path, &s, false).unwrap();
        let back: Sample = read_json(&path).unwrap();
        assert_eq!(back, s);

        // No clobber refuses to replace, clobber does.
        assert!(write_json(&path, &s, false).is_err());
        write_json(&path, &s, true).unwrap();
    }

    #[test]
    fn operational_errors() {
        assert!(VerifyError::ReadError("x".into()).is_operational());
        assert!(VerifyError::WriteError("x".into()).is_operational());
        assert!(!VerifyError::InvariantViolation("x".into()).is_operational());
        assert!(!VerifyError::SetupError("x".into()).is_operational());
    }

    fn bails(n: u64) -> Result<(), VerifyError> {
        if n == 0 {
            verify_bail!(InvalidConfig, "count must not be zero");
        }
        verify_bail!(InvalidConfig, "count {} too large", n);
    }

    #[test]
    fn bail_macro_formats() {
        assert_eq!(
            bails(0),
            Err(VerifyError::InvalidConfig("count must not be zero".into()))
        );
        assert_eq!(
            bails(7),
            Err(VerifyError::InvalidConfig("count 7 too large".into()))
        );
    }
}
