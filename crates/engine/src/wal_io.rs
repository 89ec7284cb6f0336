//! WAL Appender orchestration (C2, spec §4.4).
//!
//! `crates/wal` owns framing and file I/O; this module owns the batch-merge
//! and fsync-policy decisions layered on top of it — batching multiple
//! writers' records into one scratch append, and deciding which alive logs
//! need an `fsync` after a durable write.

use crate::batch::WriteBatch;
use crate::error::EngineResult;
use crate::queue::WriteGroup;
use std::path::Path;
use wal::WalWriter;

/// Builds the payload to hand to the WAL writer for one group.
///
/// If the group has exactly one writer, its batch is appended in place.
/// Otherwise every non-precommit-failed member's records are copied, in
/// queue order, into one scratch batch that gets stamped with the group's
/// base sequence on encode.
pub fn merge_group_batch(group: &WriteGroup) -> WriteBatch {
    if group.is_single() {
        group.leader().batch.clone()
    } else {
        let mut records = Vec::new();
        for w in group.iter() {
            if w.precommit_failed() {
                continue;
            }
            records.extend(w.batch.records().iter().cloned());
        }
        WriteBatch::from_records(records)
    }
}

/// Appends `batch` (already merged for the group) at `base_seq`, optionally
/// fsyncing the file. Returns the number of bytes written.
pub fn append_group(
    wal: &mut WalWriter,
    base_seq: u64,
    batch: &WriteBatch,
    sync: bool,
) -> EngineResult<u64> {
    let payload = batch.encode(base_seq);
    let written = wal.append(base_seq, &payload)?;
    if sync {
        wal.sync_to_disk()?;
    }
    Ok(written)
}

/// fsyncs the WAL directory once, for the "directory-sync pending" half of
/// the fsync policy (spec §4.4). A no-op error here is folded into the
/// caller's background-error handling.
pub fn sync_wal_directory(dir: &Path) -> EngineResult<()> {
    wal::fsync_parent_dir(&dir.join(".")).map_err(Into::into)
}
