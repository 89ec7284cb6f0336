//! Write Coordinator (C6, spec §4.6).
//!
//! Orchestrates one end-to-end write: preprocess → WAL → in-memory apply →
//! publish. Houses the three selectable modes (`Default`, `Pipelined`,
//! `Unordered`) plus the WAL-only queue for memtable-bypassing batches.
//! All three modes rely on [`crate::queue::WriterQueue`] for leader
//! election and batch-group assembly; they differ only in where the WAL
//! and memtable phases run relative to each other.

use crate::batch::{BatchRecord, WriteBatch};
use crate::column_family::ColumnFamilyData;
use crate::error::{EngineError, EngineResult};
use crate::options::WriteOptions;
use crate::preprocess::{preprocess, PreprocessContext};
use crate::queue::WriteGroup;
use crate::wal_io::{append_group, merge_group_batch};
use crate::writer::{Writer, WriterState};
use crate::Engine;
use config::WriteMode;
use std::sync::atomic::Ordering;
use std::sync::Arc;

impl Engine {
    /// `put(options, cf, key, value)` (spec §6).
    pub fn put(&self, options: WriteOptions, cf: &str, key: Vec<u8>, value: Vec<u8>) -> EngineResult<()> {
        let mut batch = WriteBatch::new();
        batch.put_cf(cf, key, value);
        self.write(options, batch)
    }

    /// `delete(options, cf, key)` (spec §6).
    pub fn delete(&self, options: WriteOptions, cf: &str, key: Vec<u8>) -> EngineResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete_cf(cf, key);
        self.write(options, batch)
    }

    /// `single_delete(options, cf, key)` (spec §6).
    pub fn single_delete(&self, options: WriteOptions, cf: &str, key: Vec<u8>) -> EngineResult<()> {
        let mut batch = WriteBatch::new();
        batch.single_delete_cf(cf, key);
        self.write(options, batch)
    }

    /// `delete_range(options, cf, start, end)` (spec §6).
    pub fn delete_range(&self, options: WriteOptions, cf: &str, start: Vec<u8>, end: Vec<u8>) -> EngineResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete_range_cf(cf, start, end);
        self.write(options, batch)
    }

    /// `merge(options, cf, key, operand)` (spec §6). Fails with
    /// `NotSupported` before ever joining the queue if the CF has no
    /// merge operator.
    pub fn merge(&self, options: WriteOptions, cf: &str, key: Vec<u8>, operand: Vec<u8>) -> EngineResult<()> {
        let cf_data = self
            .cfs
            .get(cf)
            .ok_or_else(|| EngineError::InvalidArgument(format!("unknown column family '{cf}'")))?;
        if cf_data.merge_operator.is_none() {
            return Err(EngineError::NotSupported(format!(
                "column family '{cf}' has no merge operator"
            )));
        }
        let mut batch = WriteBatch::new();
        batch.merge_cf(cf, key, operand);
        self.write(options, batch)
    }

    /// `write(options, batch)` — the main entry point (spec §6).
    pub fn write(&self, options: WriteOptions, batch: WriteBatch) -> EngineResult<()> {
        self.write_with_callbacks(options, batch, None, None)
    }

    /// `write_with_callback(options, batch, callback)` — like [`write`],
    /// but invokes `callback` under the queue lock (conceptually — this
    /// core invokes it once the writer is about to be admitted) to decide
    /// whether to commit.
    pub fn write_with_callback(
        &self,
        options: WriteOptions,
        batch: WriteBatch,
        callback: impl Fn() -> EngineResult<()> + Send + Sync + 'static,
    ) -> EngineResult<()> {
        self.write_with_callbacks(options, batch, Some(Box::new(callback)), None)
    }

    fn write_with_callbacks(
        &self,
        options: WriteOptions,
        batch: WriteBatch,
        pre_commit: Option<Box<dyn Fn() -> EngineResult<()> + Send + Sync>>,
        pre_release: Option<Box<dyn Fn(u64) + Send + Sync>>,
    ) -> EngineResult<()> {
        if batch.is_empty() {
            return Err(EngineError::Corruption("null batch".into()));
        }

        // Step 1: validate options before the writer ever joins the queue.
        options.validate(&self.config)?;

        self.errors.check()?;

        // Low-priority throttle, applied before the writer is ever admitted
        // to the queue (spec §4.5 "Low-priority throttle"). The token is
        // held for the writer's whole lifetime and released on return.
        let _low_pri_token = if options.low_pri {
            crate::preprocess::admit_low_pri(&self.controller, options.no_slowdown)?
        } else {
            None
        };

        let mut writer = Writer::new(batch, options.clone());
        if let Some(cb) = pre_commit {
            writer = writer.with_pre_commit(move || cb());
        }
        if let Some(cb) = pre_release {
            writer = writer.with_pre_release(move |seq| cb(seq));
        }
        let writer = Arc::new(writer);

        self.queue.join_batch_group(Arc::clone(&writer));
        let state = writer.wait_while_locked_waiting();

        match state {
            WriterState::ParallelMemtableWriter => {
                self.apply_own_batch_and_maybe_exit(&writer)?;
            }
            WriterState::Completed => {}
            WriterState::GroupLeader => {
                self.run_as_group_leader(&writer)?;
            }
            other => {
                unreachable!("writer promoted into unexpected state {other:?}")
            }
        }

        writer.take_status()
    }

    /// Driven by a writer woken as `ParallelMemtableWriter`: applies its own
    /// batch, and if it is the last to finish, publishes and exits the
    /// group on everyone's behalf.
    fn apply_own_batch_and_maybe_exit(&self, writer: &Arc<Writer>) -> EngineResult<()> {
        let group = self
            .active_group
            .lock()
            .unwrap()
            .clone()
            .expect("a parallel writer's group must be installed by its leader");

        if !writer.options.disable_memtable {
            apply_batch(&self.cfs, &writer.batch, writer.assigned_seq(), &writer.options)?;
        }

        if group.complete_parallel_memtable_writer() {
            self.seqno.publish_last_allocated();
            self.queue.exit_as_batch_group_leader(&group, Ok(()));
            *self.active_group.lock().unwrap() = None;
        }
        Ok(())
    }

    fn run_as_group_leader(&self, leader: &Arc<Writer>) -> EngineResult<()> {
        match self.write_mode {
            WriteMode::Default => self.run_default_mode(leader),
            WriteMode::Pipelined => self.run_pipelined_mode(leader),
            WriteMode::Unordered => self.run_unordered_mode(leader),
        }
    }

    /// Default mode (spec §4.6 "Default mode").
    fn run_default_mode(&self, leader: &Arc<Writer>) -> EngineResult<()> {
        self.preprocess_as_leader(leader)?;

        let group = Arc::new(self.queue.enter_as_batch_group_leader(leader));
        let result = self.wal_append_phase(&group);
        if let Err(e) = &result {
            self.escalate_wal_error(e.clone());
        }
        result?;

        run_pre_release_callbacks(&group);

        if group.is_single() || has_merge_records(&group) || !self.allow_concurrent_memtable_write() {
            apply_group_serially(&self.cfs, &group)?;
            self.seqno.publish_last_allocated();
            self.queue.exit_as_batch_group_leader(&group, Ok(()));
        } else {
            *self.active_group.lock().unwrap() = Some(Arc::clone(&group));
            group.launch_parallel_memtable_writers();
            if !leader.options.disable_memtable {
                apply_batch(&self.cfs, &leader.batch, leader.assigned_seq(), &leader.options)?;
            }
            if group.complete_parallel_memtable_writer() {
                self.seqno.publish_last_allocated();
                self.queue.exit_as_batch_group_leader(&group, Ok(()));
                *self.active_group.lock().unwrap() = None;
            }
        }
        Ok(())
    }

    /// Pipelined mode (spec §4.6 "Pipelined mode"): the WAL leader hands the
    /// group off to memtable-writer leadership instead of applying it
    /// itself, so the next leader's WAL phase can start immediately.
    fn run_pipelined_mode(&self, leader: &Arc<Writer>) -> EngineResult<()> {
        self.preprocess_as_leader(leader)?;

        let group = Arc::new(self.queue.enter_as_batch_group_leader(leader));
        let ticket = self.queue.memtable_tickets.take_ticket();

        let result = self.wal_append_phase(&group);
        if let Err(e) = &result {
            self.escalate_wal_error(e.clone());
        }
        result?;

        // Pop the group off the queue now, not after the memtable apply
        // below — a newly arrived writer must be electable as the next
        // WAL leader while this group is still applying to memory.
        self.queue.dequeue_group(&group);

        run_pre_release_callbacks(&group);

        leader.set_state(WriterState::MemtableWriterLeader);
        let parallel = !group.is_single() && !has_merge_records(&group) && self.allow_concurrent_memtable_write();
        if parallel {
            *self.active_group.lock().unwrap() = Some(Arc::clone(&group));
            group.launch_parallel_memtable_writers();
        }

        self.queue.memtable_tickets.wait_for_turn(ticket);

        if !parallel {
            apply_group_serially(&self.cfs, &group)?;
            self.seqno.publish_last_allocated();
            self.queue.exit_as_batch_group_leader(&group, Ok(()));
        } else {
            if !leader.options.disable_memtable {
                apply_batch(&self.cfs, &leader.batch, leader.assigned_seq(), &leader.options)?;
            }
            if group.complete_parallel_memtable_writer() {
                self.seqno.publish_last_allocated();
                self.queue.exit_as_batch_group_leader(&group, Ok(()));
                *self.active_group.lock().unwrap() = None;
            }
        }

        self.queue.memtable_tickets.complete_turn(ticket);
        Ok(())
    }

    /// Unordered mode (spec §4.6 "Unordered (WAL-only + async memtable)
    /// mode"): publishes last-allocated right after the WAL append,
    /// *before* any memtable apply, sacrificing read-visibility ordering
    /// for WAL throughput.
    fn run_unordered_mode(&self, leader: &Arc<Writer>) -> EngineResult<()> {
        self.preprocess_as_leader(leader)?;

        let group = Arc::new(self.queue.enter_as_batch_group_leader(leader));
        let result = self.wal_append_phase(&group);
        if let Err(e) = &result {
            self.escalate_wal_error(e.clone());
        }
        result?;

        // Pop the group off the queue now, not after the memtable apply
        // below — a newly arrived writer must be electable as the next
        // WAL leader while this group is still applying to memory.
        self.queue.dequeue_group(&group);

        run_pre_release_callbacks(&group);

        // Publish before memtable apply — the defining trait of this mode.
        self.seqno.publish_last_allocated();

        self.pending_memtable_writes
            .fetch_add(group.members.len(), Ordering::SeqCst);

        let parallel = !group.is_single() && !has_merge_records(&group) && self.allow_concurrent_memtable_write();
        if parallel {
            *self.active_group.lock().unwrap() = Some(Arc::clone(&group));
            group.launch_parallel_memtable_writers();
            if !leader.options.disable_memtable {
                apply_batch(&self.cfs, &leader.batch, leader.assigned_seq(), &leader.options)?;
            }
            self.note_memtable_write_done();
            if group.complete_parallel_memtable_writer() {
                self.queue.exit_as_batch_group_leader(&group, Ok(()));
                *self.active_group.lock().unwrap() = None;
            }
        } else {
            apply_group_serially(&self.cfs, &group)?;
            for _ in 0..group.members.len() {
                self.note_memtable_write_done();
            }
            self.queue.exit_as_batch_group_leader(&group, Ok(()));
        }
        Ok(())
    }

    fn note_memtable_write_done(&self) {
        let prev = self.pending_memtable_writes.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            let guard = self.pending_memtable_cv_mutex.lock().unwrap();
            self.pending_memtable_cv.notify_all();
            drop(guard);
        }
    }

    /// Blocks the caller until the unordered-mode pending-memtable counter
    /// reaches zero — the precondition a memtable switch waits on before
    /// proceeding (spec §5 "Suspension points").
    pub(crate) fn wait_for_pending_memtable_writes(&self) {
        let guard = self.pending_memtable_cv_mutex.lock().unwrap();
        let _unused = self
            .pending_memtable_cv
            .wait_while(guard, |_| self.pending_memtable_writes.load(Ordering::SeqCst) > 0)
            .unwrap();
    }

    fn allow_concurrent_memtable_write(&self) -> bool {
        self.config.allow_concurrent_memtable_write
    }

    fn preprocess_as_leader(&self, leader: &Arc<Writer>) -> EngineResult<()> {
        let ctx = PreprocessContext {
            queue: &self.queue,
            controller: &self.controller,
            errors: &self.errors,
            cfs: &self.cfs,
            wal_state: &self.wal_state,
            config: &self.config,
            drain_pending_memtable_writes: &|| self.wait_for_pending_memtable_writes(),
        };
        preprocess(
            &ctx,
            self.seqno.last_allocated(),
            leader.options.no_slowdown,
            self.last_group_bytes_hint(),
        )
        .map(|_| ())
    }

    fn last_group_bytes_hint(&self) -> usize {
        // The queue tracks this internally for the byte-budget formula;
        // the preprocessor only uses it as a hint for delay sizing, so an
        // approximate read is fine.
        self.queue.len() * 256
    }

    /// Records a WAL-phase failure as a background error. An `IoError` here
    /// means the WAL append or its fsync actually failed at the OS level —
    /// there is no retry path, so this core treats it as having fenced the
    /// engine (spec §7 "`IOFenced` is terminal: no further writes succeed"),
    /// independent of `paranoid_checks` (that gate only governs whether
    /// *other, potentially transient* WAL error kinds get escalated).
    fn escalate_wal_error(&self, err: EngineError) {
        if matches!(err, EngineError::IoError(_)) {
            self.errors.set(EngineError::IoFenced);
        } else if self.config.paranoid_checks && !err.is_transient_for_paranoid_checks() {
            self.errors.set(err);
        }
    }

    /// C2 WAL append phase, shared by all three modes. Merges the group's
    /// batch, allocates sequences, appends, and stamps every writer with
    /// its assigned sequence and log number.
    fn wal_append_phase(&self, group: &WriteGroup) -> EngineResult<()> {
        // Sequences (and pre-commit failures) must be settled before the
        // batch is merged, since the merge skips failed writers' records.
        let base_seq = assign_group_sequences(&self.seqno, group);

        if group.leader().options.disable_wal {
            return Ok(());
        }

        let merged = merge_group_batch(group);
        if merged.is_empty() {
            return Ok(());
        }

        // `manual_wal_flush` suppresses the automatic fsync-after-append
        // this coordinator would otherwise perform; callers are expected to
        // invoke a manual flush themselves (spec §4.4/§4.6 `DBOptions`).
        let sync = group.leader().options.sync && !self.config.manual_wal_flush;
        let log_number = {
            let mut wal = self.wal_state.writer.lock().unwrap();
            append_group(&mut wal, base_seq + 1, &merged, sync)?;
            wal.number()
        };
        for w in group.iter() {
            w.set_log_number(log_number);
        }
        if sync {
            crate::wal_io::sync_wal_directory(&self.wal_state.dir)?;
        }
        Ok(())
    }
}

/// Assigns contiguous sequence numbers to every member of the group, in
/// queue order, and returns the group's base sequence (spec §4.3 "the
/// per-writer sequence is base + cumulative_count_of_earlier_writers").
/// Writers whose pre-commit callback failed consume no sequence.
fn assign_group_sequences(seqno: &crate::seqno::SequenceAllocator, group: &WriteGroup) -> u64 {
    let mut cumulative = 0u64;
    let mut assignable = 0u64;
    for w in group.iter() {
        if let Some(cb) = &w.pre_commit {
            if let Err(e) = cb() {
                w.fail_precommit(e);
                continue;
            }
        }
        assignable += w.batch.count().max(1) as u64;
    }
    let base = seqno.allocate(assignable);
    for w in group.iter() {
        if w.precommit_failed() {
            continue;
        }
        w.set_assigned_seq(base + 1 + cumulative);
        cumulative += w.batch.count().max(1) as u64;
    }
    base
}

fn run_pre_release_callbacks(group: &WriteGroup) {
    for w in group.iter() {
        if w.precommit_failed() {
            continue;
        }
        if let Some(cb) = &w.pre_release {
            cb(w.assigned_seq());
        }
    }
}

fn has_merge_records(group: &WriteGroup) -> bool {
    group
        .iter()
        .any(|w| w.batch.records().iter().any(|r| matches!(r, BatchRecord::Merge { .. })))
}

/// Serially applies every member's batch to memtables, in queue order —
/// used for single-writer groups and whenever the group contains a merge
/// (which this core does not parallelize, since merge resolution needs the
/// existing value at apply time).
fn apply_group_serially(cfs: &crate::column_family::ColumnFamilySet, group: &WriteGroup) -> EngineResult<()> {
    for w in group.iter() {
        if w.precommit_failed() || w.options.disable_memtable {
            continue;
        }
        apply_batch(cfs, &w.batch, w.assigned_seq(), &w.options)?;
    }
    Ok(())
}

/// Applies a batch's records to their target memtables, stamping each
/// record with `base_seq + index` (spec §3 "Write Batch"). Shared by every
/// write mode and by WAL replay during recovery.
pub(crate) fn apply_batch(
    cfs: &crate::column_family::ColumnFamilySet,
    batch: &WriteBatch,
    base_seq: u64,
    options: &WriteOptions,
) -> EngineResult<()> {
    for (idx, record) in batch.records().iter().enumerate() {
        let seq = base_seq + idx as u64;
        apply_record(cfs, record, seq, options)?;
    }
    Ok(())
}

fn apply_record(
    cfs: &crate::column_family::ColumnFamilySet,
    record: &BatchRecord,
    seq: u64,
    options: &WriteOptions,
) -> EngineResult<()> {
    match record {
        BatchRecord::Put { cf, key, value } => {
            with_cf(cfs, cf, options, |cf_data| {
                cf_data.active.lock().unwrap().put(key.clone(), value.clone(), seq);
                Ok(())
            })
        }
        BatchRecord::Delete { cf, key } | BatchRecord::SingleDelete { cf, key } => with_cf(cfs, cf, options, |cf_data| {
            cf_data.active.lock().unwrap().delete(key.clone(), seq);
            Ok(())
        }),
        BatchRecord::Merge { cf, key, operand } => with_cf(cfs, cf, options, |cf_data| {
            let existing = read_for_merge(cf_data, key);
            let merged = match &cf_data.merge_operator {
                Some(op) => op.full_merge(key, existing.as_deref(), std::slice::from_ref(operand)),
                None => {
                    return Err(EngineError::NotSupported(format!(
                        "column family '{cf}' has no merge operator"
                    )))
                }
            };
            cf_data.active.lock().unwrap().put(key.clone(), merged, seq);
            Ok(())
        }),
        BatchRecord::DeleteRange { cf, start, end } => with_cf(cfs, cf, options, |cf_data| {
            let keys: Vec<Vec<u8>> = {
                let active = cf_data.active.lock().unwrap();
                active
                    .iter()
                    .filter(|(k, _)| *k >= start.as_slice() && *k < end.as_slice())
                    .map(|(k, _)| k.to_vec())
                    .collect()
            };
            let mut active = cf_data.active.lock().unwrap();
            for k in keys {
                active.delete(k, seq);
            }
            Ok(())
        }),
        BatchRecord::BeginPrepare | BatchRecord::Commit | BatchRecord::Rollback => {
            // WAL-only markers: no memtable effect in this core (full 2PC
            // semantics are out of scope per spec §1).
            Ok(())
        }
    }
}

fn read_for_merge(cf_data: &ColumnFamilyData, key: &[u8]) -> Option<Vec<u8>> {
    cf_data
        .active
        .lock()
        .unwrap()
        .get(key)
        .map(|(_, v)| v.to_vec())
}

fn with_cf(
    cfs: &crate::column_family::ColumnFamilySet,
    cf: &str,
    options: &WriteOptions,
    f: impl FnOnce(&ColumnFamilyData) -> EngineResult<()>,
) -> EngineResult<()> {
    match cfs.get(cf) {
        Some(cf_data) => f(&cf_data),
        None if options.ignore_missing_column_families => Ok(()),
        None => Err(EngineError::InvalidArgument(format!("unknown column family '{cf}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column_family::DEFAULT_CF;
    use crate::Engine;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open(dir: &std::path::Path) -> Engine {
        let config = config::EngineConfig {
            wal_dir: dir.join("wal"),
            sst_dir: dir.join("sst"),
            ..config::EngineConfig::default()
        };
        Engine::open(config).unwrap()
    }

    /// Scenario 1 (spec §8): single solo writer.
    #[test]
    fn single_solo_writer() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());

        engine.put(WriteOptions::new(), DEFAULT_CF, b"k".to_vec(), b"v".to_vec()).unwrap();

        assert_eq!(engine.seq(), 1);
        let (seq, value) = engine.get(b"k").unwrap().unwrap();
        assert_eq!(seq, 1);
        assert_eq!(value, b"v");
    }

    /// Scenario 2 (spec §8): two concurrent writers, grouped into one
    /// batch. Exactly one becomes leader; both return OK; assigned
    /// sequences are {1,2}; both values are visible afterwards.
    #[test]
    fn two_concurrent_writers_grouped() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(open(dir.path()));

        let e1 = Arc::clone(&engine);
        let t1 = std::thread::spawn(move || e1.put(WriteOptions::new(), DEFAULT_CF, b"a".to_vec(), b"1".to_vec()));
        let e2 = Arc::clone(&engine);
        let t2 = std::thread::spawn(move || e2.put(WriteOptions::new(), DEFAULT_CF, b"b".to_vec(), b"2".to_vec()));

        t1.join().unwrap().unwrap();
        t2.join().unwrap().unwrap();

        assert_eq!(engine.seq(), 2);
        let (seq_a, val_a) = engine.get(b"a").unwrap().unwrap();
        let (seq_b, val_b) = engine.get(b"b").unwrap().unwrap();
        assert_eq!(val_a, b"1");
        assert_eq!(val_b, b"2");
        let mut seqs = [seq_a, seq_b];
        seqs.sort();
        assert_eq!(seqs, [1, 2]);
    }

    /// Scenario 3 (spec §8): `no_slowdown` under a write stall fails fast
    /// with `Incomplete`, consuming no sequence.
    #[test]
    fn no_slowdown_under_stall() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());
        engine.controller.set_stopped(true);

        let opts = WriteOptions {
            no_slowdown: true,
            ..WriteOptions::new()
        };
        let result = engine.put(opts, DEFAULT_CF, b"k".to_vec(), b"v".to_vec());

        assert!(matches!(result, Err(EngineError::Incomplete(_))));
        assert_eq!(engine.seq(), 0);
        assert!(engine.get(b"k").unwrap().is_none());
    }

    /// Scenario 4 (spec §8): `merge` against a CF with no merge operator
    /// fails with `NotSupported` before consuming a sequence.
    #[test]
    fn manual_wal_flush_suppresses_the_automatic_fsync_but_writes_still_apply() {
        let dir = TempDir::new().unwrap();
        let config = config::EngineConfig {
            wal_dir: dir.path().join("wal"),
            sst_dir: dir.path().join("sst"),
            manual_wal_flush: true,
            ..config::EngineConfig::default()
        };
        let engine = Engine::open(config).unwrap();
        let opts = WriteOptions { sync: true, ..WriteOptions::new() };
        engine.put(opts, DEFAULT_CF, b"k".to_vec(), b"v".to_vec()).unwrap();
        assert_eq!(engine.get(b"k").unwrap().unwrap().1, b"v");
    }

    #[test]
    fn a_wal_io_error_fences_the_engine_against_further_writes() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());
        engine.escalate_wal_error(EngineError::IoError("disk full".into()));

        let result = engine.put(WriteOptions::new(), DEFAULT_CF, b"k".to_vec(), b"v".to_vec());
        assert!(matches!(result, Err(EngineError::IoFenced)));

        // Stays fenced — it doesn't fall back to a non-terminal kind later.
        let result2 = engine.put(WriteOptions::new(), DEFAULT_CF, b"k2".to_vec(), b"v2".to_vec());
        assert!(matches!(result2, Err(EngineError::IoFenced)));
    }

    #[test]
    fn merge_without_operator_is_not_supported() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());

        let result = engine.merge(WriteOptions::new(), DEFAULT_CF, b"k".to_vec(), b"delta".to_vec());

        assert!(matches!(result, Err(EngineError::NotSupported(_))));
        assert_eq!(engine.seq(), 0);
    }

    /// Scenario 5 (spec §8): `disable_wal` writes are visible immediately
    /// but do not survive a crash (simulated by skipping `Drop`, which
    /// would otherwise flush the memtable to an SSTable).
    #[test]
    fn disable_wal_does_not_survive_a_crash() {
        let dir = TempDir::new().unwrap();
        let engine = open(dir.path());

        let opts = WriteOptions {
            disable_wal: true,
            ..WriteOptions::new()
        };
        engine.put(opts, DEFAULT_CF, b"k".to_vec(), b"v".to_vec()).unwrap();
        assert_eq!(engine.get(b"k").unwrap().unwrap().1, b"v");

        // Simulate a crash: skip the best-effort flush-on-drop so the
        // in-memory-only write is genuinely lost, the way a real process
        // crash would lose it.
        std::mem::forget(engine);

        let reopened = open(dir.path());
        assert!(reopened.get(b"k").unwrap().is_none());
    }

    /// Scenario 6 (spec §8), simplified: an over-budget write-buffer
    /// forces a memtable switch on the next write's preprocess step,
    /// sealing the prior memtable into the immutable backlog.
    #[test]
    fn over_budget_write_buffer_triggers_a_memtable_switch() {
        let dir = TempDir::new().unwrap();
        let mut config = config::EngineConfig {
            wal_dir: dir.path().join("wal"),
            sst_dir: dir.path().join("sst"),
            ..config::EngineConfig::default()
        };
        config.db_write_buffer_size = 1;
        let engine = Engine::open(config).unwrap();

        engine.put(WriteOptions::new(), DEFAULT_CF, b"k1".to_vec(), b"v1".to_vec()).unwrap();
        // The second write's preprocess observes the (now nonzero) active
        // memtable size exceeding the 1-byte budget and switches.
        engine.put(WriteOptions::new(), DEFAULT_CF, b"k2".to_vec(), b"v2".to_vec()).unwrap();

        let cf = engine.cfs.get(DEFAULT_CF).unwrap();
        assert!(!cf.immutables.lock().unwrap().is_empty());
    }

    /// Invariant 5 (spec §8): `last_published <= last_allocated` at every
    /// instant. Checked after a burst of concurrent writers.
    #[test]
    fn published_never_exceeds_allocated() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(open(dir.path()));

        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    engine
                        .put(WriteOptions::new(), DEFAULT_CF, vec![i], vec![i])
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(engine.seqno.last_published() <= engine.seqno.last_allocated());
        assert_eq!(engine.seqno.last_published(), 8);
    }
}
