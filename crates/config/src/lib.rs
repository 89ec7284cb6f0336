//! # Config — RiptideKV engine configuration
//!
//! Loads the knobs that govern the write-path core: WAL layout, flush and
//! stall thresholds, and which of the three write-coordinator modes
//! (default / pipelined / unordered) is active.
//!
//! Settings are loaded from an optional TOML file and then overlaid with
//! `RIPTIDE_*` environment variables, matching the "env vars with sensible
//! defaults" style the `cli` crate already used before any file existed.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from loading or validating an [`EngineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The config file contents were not valid TOML for this schema.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that failed to parse.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: toml::de::Error,
    },
    /// An environment variable override had an unparsable value.
    #[error("environment variable {var} has invalid value {value:?}")]
    BadEnvValue {
        /// Name of the offending variable.
        var: &'static str,
        /// The value that failed to parse.
        value: String,
    },
}

/// Selects which write-coordinator mode the engine runs (spec §4.6).
///
/// Exactly one is active for the lifetime of an `Engine`; the mode is a
/// tagged enum selected once at open rather than per-write virtual dispatch
/// (see `DESIGN.md` — "Design Notes: Polymorphism").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// WAL append and memtable apply both happen on the group leader.
    Default,
    /// WAL leader and memtable leader are separate roles, pipelined across
    /// consecutive groups.
    Pipelined,
    /// WAL append publishes last-sequence before memtable apply; each
    /// writer applies to its own memtable independently afterwards.
    Unordered,
}

impl Default for WriteMode {
    fn default() -> Self {
        WriteMode::Default
    }
}

/// The `DBOptions` table from spec §6 that affects the write-path core,
/// plus the teacher's pre-existing engine knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// WAL file path (single-WAL deployments) or WAL directory.
    pub wal_dir: PathBuf,
    /// Directory SSTables are written to.
    pub sst_dir: PathBuf,
    /// Memtable byte-size threshold that triggers a flush.
    pub flush_threshold: usize,
    /// Number of L0 SSTables that triggers automatic compaction. `0`
    /// disables auto-compaction.
    pub l0_compaction_trigger: usize,
    /// If true, every WAL append is followed by `fsync`.
    pub wal_sync: bool,

    /// Active write-coordinator mode.
    pub write_mode: WriteMode,
    /// `allow_concurrent_memtable_write` — followers apply their own
    /// batch to the memtable concurrently instead of the leader applying
    /// the whole group serially.
    pub allow_concurrent_memtable_write: bool,
    /// `two_write_queues` — WAL-only batches (e.g. 2PC prepare records)
    /// are dispatched through a separate queue and WAL-write mutex.
    pub two_write_queues: bool,
    /// `manual_wal_flush` — the coordinator does not fsync automatically;
    /// callers must invoke a manual flush. Only meaningful combined with
    /// `two_write_queues` per spec §4.4.
    pub manual_wal_flush: bool,
    /// `paranoid_checks` — WAL errors are escalated to background errors
    /// even when they might otherwise be treated as transient.
    pub paranoid_checks: bool,
    /// `atomic_flush` — the preprocessor switches every non-empty column
    /// family together instead of picking the one with the oldest
    /// active memtable.
    pub atomic_flush: bool,
    /// Maximum aggregate WAL size across all live WAL files before the
    /// preprocessor forces a rotation. `0` means "derive from
    /// `db_write_buffer_size`" (4x total memtable reservation per §4.5).
    pub max_total_wal_size: u64,
    /// Soft cap on aggregate memtable memory across all column families.
    pub db_write_buffer_size: usize,
    /// Number of retired WAL numbers to keep around for reuse instead of
    /// minting a fresh number on every switch.
    pub recycle_log_file_num: usize,
    /// Use `fsync` instead of `fdatasync`-equivalent semantics. RiptideKV's
    /// WAL writer always calls `sync_all`, so this only affects directory
    /// syncs in the preprocessor.
    pub use_fsync: bool,
    /// Persist internal stats counters to disk periodically. Out of scope
    /// for this core (spec §1 — metrics back-ends are external); kept as a
    /// recognized knob so callers configuring a full `DBOptions` table
    /// don't get a rejected field.
    pub persist_stats_to_disk: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            wal_dir: PathBuf::from("wal"),
            sst_dir: PathBuf::from("data/sst"),
            flush_threshold: 1024 * 1024,
            l0_compaction_trigger: 4,
            wal_sync: true,
            write_mode: WriteMode::Default,
            allow_concurrent_memtable_write: true,
            two_write_queues: false,
            manual_wal_flush: false,
            paranoid_checks: true,
            atomic_flush: false,
            max_total_wal_size: 0,
            db_write_buffer_size: 64 * 1024 * 1024,
            recycle_log_file_num: 0,
            use_fsync: true,
            persist_stats_to_disk: false,
        }
    }
}

impl EngineConfig {
    /// Loads config from a TOML file if it exists, otherwise starts from
    /// defaults, then overlays `RIPTIDE_*` environment variables.
    pub fn load_from_file_and_env(path: &Path) -> Result<Self, ConfigError> {
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    /// Parses config from an in-memory TOML string, without any env overlay.
    /// Useful for tests.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<memory>"),
            source,
        })
    }

    /// Overlays `RIPTIDE_*` environment variables onto an already-loaded
    /// config, in place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_var("RIPTIDE_WAL_DIR") {
            self.wal_dir = PathBuf::from(v);
        }
        if let Some(v) = env_var("RIPTIDE_SST_DIR") {
            self.sst_dir = PathBuf::from(v);
        }
        if let Some(v) = env_parsed::<usize>("RIPTIDE_FLUSH_KB")? {
            self.flush_threshold = v * 1024;
        }
        if let Some(v) = env_parsed("RIPTIDE_WAL_SYNC")? {
            self.wal_sync = v;
        }
        if let Some(v) = env_parsed("RIPTIDE_L0_TRIGGER")? {
            self.l0_compaction_trigger = v;
        }
        if let Some(v) = env_var("RIPTIDE_WRITE_MODE") {
            self.write_mode = match v.as_str() {
                "pipelined" => WriteMode::Pipelined,
                "unordered" => WriteMode::Unordered,
                _ => WriteMode::Default,
            };
        }
        if let Some(v) = env_parsed("RIPTIDE_TWO_WRITE_QUEUES")? {
            self.two_write_queues = v;
        }
        if let Some(v) = env_parsed("RIPTIDE_ATOMIC_FLUSH")? {
            self.atomic_flush = v;
        }
        Ok(())
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn env_parsed<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::BadEnvValue { var: key, value: v }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.write_mode, WriteMode::Default);
        assert!(cfg.wal_sync);
        assert_eq!(cfg.l0_compaction_trigger, 4);
    }

    #[test]
    fn parses_toml_overriding_only_some_fields() {
        let cfg = EngineConfig::from_toml_str(
            r#"
            flush_threshold = 2048
            write_mode = "pipelined"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.flush_threshold, 2048);
        assert_eq!(cfg.write_mode, WriteMode::Pipelined);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.l0_compaction_trigger, 4);
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        let result = EngineConfig::from_toml_str("not valid toml {{{");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does_not_exist.toml");
        let cfg = EngineConfig::load_from_file_and_env(&path).unwrap();
        assert_eq!(cfg.flush_threshold, EngineConfig::default().flush_threshold);
    }

    #[test]
    fn loads_file_then_applies_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("riptide.toml");
        std::fs::write(&path, "flush_threshold = 4096\n").unwrap();

        std::env::set_var("RIPTIDE_L0_TRIGGER", "9");
        let cfg = EngineConfig::load_from_file_and_env(&path).unwrap();
        std::env::remove_var("RIPTIDE_L0_TRIGGER");

        assert_eq!(cfg.flush_threshold, 4096);
        assert_eq!(cfg.l0_compaction_trigger, 9);
    }
}
