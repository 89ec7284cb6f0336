//! `WriteOptions` and the merge-operator seam (spec §6).

use std::fmt;
use std::sync::Arc;

/// Per-write knobs recognized by the coordinator. See spec §6 for the
/// exhaustive effect table.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// fsync the WAL before acknowledging. Incompatible with `disable_wal`.
    pub sync: bool,
    /// Skip the WAL append; memtable apply only.
    pub disable_wal: bool,
    /// Apply to the WAL but skip the memtable apply phase entirely. Used by
    /// the WAL-only queue (2PC prepare records under write-committed policy).
    pub disable_memtable: bool,
    /// Apply silently skips column families it doesn't recognize instead of
    /// failing the whole batch.
    pub ignore_missing_column_families: bool,
    /// Subject to compaction-pressure throttling.
    pub low_pri: bool,
    /// Stall or throttle becomes an immediate `Incomplete` instead of a wait.
    pub no_slowdown: bool,
    /// Supplies hint pointers to the in-memory inserter (opaque to this
    /// core; threaded through unexamined).
    pub memtable_insert_hint_per_batch: bool,
    /// User-supplied timestamp stamped on the batch; size must equal the
    /// CF comparator's configured timestamp size (not enforced here — no
    /// comparator machinery in this core).
    pub timestamp: Option<Vec<u8>>,
}

impl WriteOptions {
    /// Default options: async WAL, no throttling, subject to batching.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates option combinations that must be rejected before the
    /// writer ever joins the queue (spec §4.6 step 1, §7 "before joining
    /// the queue"), including the DB-wide mode incompatibilities spec
    /// §4.6 step 1 also names (pipelined mode can't combine with
    /// two-write-queues).
    pub fn validate(&self, config: &config::EngineConfig) -> Result<(), crate::error::EngineError> {
        if self.sync && self.disable_wal {
            return Err(crate::error::EngineError::InvalidArgument(
                "sync and disable_wal cannot both be set".into(),
            ));
        }
        if config.write_mode == config::WriteMode::Pipelined && config.two_write_queues {
            return Err(crate::error::EngineError::InvalidArgument(
                "pipelined write mode cannot be combined with two_write_queues".into(),
            ));
        }
        Ok(())
    }
}

/// User-pluggable merge logic for a column family (spec §6 `merge`).
///
/// A CF with no merge operator rejects `merge()` with `NotSupported` before
/// the writer ever joins the queue.
pub trait MergeOperator: Send + Sync {
    /// Combines an optional existing value with a sequence of merge operands
    /// (oldest first) into the new value to store.
    fn full_merge(&self, key: &[u8], existing: Option<&[u8]>, operands: &[Vec<u8>]) -> Vec<u8>;

    /// Short name used in logs and error messages.
    fn name(&self) -> &str {
        "unnamed_merge_operator"
    }
}

impl fmt::Debug for dyn MergeOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MergeOperator({})", self.name())
    }
}

/// A merge operator that concatenates operands with a separator. Useful as
/// a default for tests and simple counter/log-style CFs.
pub struct ConcatMergeOperator {
    separator: Vec<u8>,
}

impl ConcatMergeOperator {
    /// Builds a concat operator that joins operands (and the existing value,
    /// if any) with `separator`.
    pub fn new(separator: impl Into<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            separator: separator.into(),
        })
    }
}

impl MergeOperator for ConcatMergeOperator {
    fn full_merge(&self, _key: &[u8], existing: Option<&[u8]>, operands: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(existing) = existing {
            out.extend_from_slice(existing);
        }
        for op in operands {
            if !out.is_empty() {
                out.extend_from_slice(&self.separator);
            }
            out.extend_from_slice(op);
        }
        out
    }

    fn name(&self) -> &str {
        "concat"
    }
}
