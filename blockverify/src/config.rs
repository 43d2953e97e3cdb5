// Copyright 2026 Oxide Computer Company
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use blockverify_common::{validate_block_size, verify_bail, VerifyError};

use crate::ContentMode;

/// A complete description of one run.
///
/// Every field has a default, so a config file only needs to name what it
/// changes.  Command line flags are applied on top of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub device: Option<PathBuf>,
    pub block_size: u64,
    pub max_blocks_per_op: u64,
    /// Percentage of written blocks given unique content.
    pub unique_pct: u8,
    /// Percentage of written blocks trimmed.  Whatever `unique_pct` and
    /// `trim_pct` leave over is written as duplicate content.
    pub trim_pct: u8,
    pub workers: usize,
    pub mode: ContentMode,
    /// Fixed run seed.  Wall clock seconds when unset.
    pub seed: Option<u64>,
    /// Stop after this many iterations, counted over all workers.
    pub count: Option<u64>,
    #[serde(with = "opt_duration")]
    pub duration: Option<Duration>,
    #[serde(with = "duration")]
    pub report_interval: Duration,
    /// Stop once the verified block count reaches the device block count.
    pub stop_at_full: bool,
    pub stop_on_failure: bool,
    /// Mismatches each worker describes in full before only counting.
    pub max_diagnostics: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            device: None,
            block_size: 4096,
            max_blocks_per_op: 16,
            unique_pct: 51,
            trim_pct: 0,
            workers: 2,
            mode: ContentMode::Hash,
            seed: None,
            count: None,
            duration: None,
            report_interval: Duration::from_secs(1),
            stop_at_full: false,
            stop_on_failure: false,
            max_diagnostics: 3,
        }
    }
}

impl RunConfig {
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<RunConfig> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read {:?}", path))?;
        toml::from_str(&text).with_context(|| format!("parse {:?}", path))
    }

    pub fn validate(&self) -> Result<(), VerifyError> {
        validate_block_size(self.block_size)?;
        if self.max_blocks_per_op == 0 {
            verify_bail!(InvalidConfig, "max blocks per op must be at least 1");
        }
        if u32::from(self.unique_pct) + u32::from(self.trim_pct) > 100 {
            verify_bail!(
                InvalidConfig,
                "unique ({}%) and trim ({}%) add up to more than 100%",
                self.unique_pct,
                self.trim_pct
            );
        }
        if self.workers == 0 {
            verify_bail!(InvalidConfig, "need at least one worker");
        }
        if self.report_interval.is_zero() {
            verify_bail!(InvalidConfig, "report interval must not be zero");
        }
        if self.count == Some(0) {
            verify_bail!(InvalidConfig, "count must be at least 1");
        }
        if self.duration.is_some_and(|d| d.is_zero()) {
            verify_bail!(InvalidConfig, "duration must not be zero");
        }
        Ok(())
    }

    /// True when the run has some bound other than a signal.
    pub fn is_bounded(&self) -> bool {
        self.count.is_some()
            || self.duration.is_some()
            || self.stop_at_full
            || self.stop_on_failure
    }
}

/// Durations as humantime strings ("1s", "2m 30s").
mod duration {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        d: &Duration,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Duration, D::Error> {
        let text = String::deserialize(d)?;
        humantime::parse_duration(&text).map_err(D::Error::custom)
    }
}

mod opt_duration {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        d: &Option<Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(
                &humantime::format_duration(*d).to_string(),
            ),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|text| {
                humantime::parse_duration(&text).map_err(D::Error::custom)
            })
            .transpose()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let c = RunConfig::default();
        c.validate().unwrap();
        assert!(!c.is_bounded());
        assert_eq!(c.block_size, 4096);
        assert_eq!(c.max_blocks_per_op, 16);
        assert_eq!(c.unique_pct, 51);
        assert_eq!(c.workers, 2);
        assert_eq!(c.max_diagnostics, 3);
    }

    #[test]
    fn rejects_bad_values() {
        let bad = [
            RunConfig {
                block_size: 1000,
                ..Default::default()
            },
            RunConfig {
                max_blocks_per_op: 0,
                ..Default::default()
            },
            RunConfig {
                unique_pct: 60,
                trim_pct: 41,
                ..Default::default()
            },
            RunConfig {
                workers: 0,
                ..Default::default()
            },
            RunConfig {
                report_interval: Duration::ZERO,
                ..Default::default()
            },
            RunConfig {
                count: Some(0),
                ..Default::default()
            },
            RunConfig {
                duration: Some(Duration::ZERO),
                ..Default::default()
            },
        ];
        for c in bad {
            assert!(
                matches!(c.validate(), Err(VerifyError::InvalidConfig(_))),
                "{:?}",
                c
            );
        }

        RunConfig {
            unique_pct: 0,
            trim_pct: 100,
            ..Default::default()
        }
        .validate()
        .unwrap();
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(
            &path,
            r#"
device = "/dev/sdz"
block_size = 512
trim_pct = 10
mode = "fast"
duration = "1m 30s"
report_interval = "250ms"
stop_on_failure = true
"#,
        )
        .unwrap();

        let c = RunConfig::from_toml_file(&path).unwrap();
        assert_eq!(c.device, Some(PathBuf::from("/dev/sdz")));
        assert_eq!(c.block_size, 512);
        assert_eq!(c.trim_pct, 10);
        assert_eq!(c.mode, ContentMode::Fast);
        assert_eq!(c.duration, Some(Duration::from_secs(90)));
        assert_eq!(c.report_interval, Duration::from_millis(250));
        assert!(c.stop_on_failure);
        assert!(c.is_bounded());
        // untouched
        assert_eq!(c.unique_pct, 51);
        assert_eq!(c.workers, 2);
    }

    #[test]
    fn toml_rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(&path, "blocksize = 512\n").unwrap();
        assert!(RunConfig::from_toml_file(&path).is_err());
    }

    #[test]
    fn json_keeps_durations() {
        let c = RunConfig {
            duration: Some(Duration::from_millis(1500)),
            seed: Some(7),
            ..Default::default()
        };
        let text = serde_json::to_string(&c).unwrap();
        assert!(text.contains("\"1s 500ms\""), "{}", text);
        let back: RunConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, c);
    }
}
