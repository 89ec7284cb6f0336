//! Writer and Writer State (spec §3, §4.2).

use crate::batch::WriteBatch;
use crate::error::EngineResult;
use crate::options::WriteOptions;
use std::sync::{Condvar, Mutex};

/// A writer's position in the state machine (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Freshly constructed, not yet queued.
    Init,
    /// First in queue at the moment it joined; responsible for preprocess
    /// and WAL append.
    GroupLeader,
    /// Pipelined mode only: the writer now responsible for the memtable
    /// phase of its group.
    MemtableWriterLeader,
    /// Applying its own batch to the memtable concurrently with siblings.
    ParallelMemtableWriter,
    /// Queued behind a leader, parked until promoted.
    LockedWaiting,
    /// Terminal. `status()` holds the final result.
    Completed,
}

/// The role assigned to a writer within its batch group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Performs preprocess, WAL append (and, outside pipelined mode,
    /// memtable apply) on behalf of the group.
    Leader,
    /// Rides along in a group assembled by a leader.
    Follower,
    /// The only writer in its group.
    Solo,
}

struct WriterInner {
    state: WriterState,
    role: Option<Role>,
    status: Option<EngineResult<()>>,
    assigned_seq: u64,
    log_number: u64,
}

/// A single client's attempt to commit a batch (spec §3 "Writer").
///
/// Owned by the submitting thread for its whole lifetime; the coordinator
/// and writer queue only ever borrow it through a shared reference, so it
/// is always held behind an `Arc`.
pub struct Writer {
    /// The batch this writer is attempting to commit.
    pub batch: WriteBatch,
    /// Write options in effect for this writer.
    pub options: WriteOptions,
    /// Invoked once, before the sequence is assigned, to decide whether the
    /// writer should actually commit. Returning `Err` fails just this
    /// writer — it consumes no sequence and does not abort the group.
    pub pre_commit: Option<Box<dyn Fn() -> EngineResult<()> + Send + Sync>>,
    /// Invoked with the assigned sequence after WAL durability and strictly
    /// before any memtable apply.
    pub pre_release: Option<Box<dyn Fn(u64) + Send + Sync>>,
    inner: Mutex<WriterInner>,
    cv: Condvar,
}

impl Writer {
    /// Builds a writer in state `Init` with no callbacks.
    pub fn new(batch: WriteBatch, options: WriteOptions) -> Self {
        Self {
            batch,
            options,
            pre_commit: None,
            pre_release: None,
            inner: Mutex::new(WriterInner {
                state: WriterState::Init,
                role: None,
                status: None,
                assigned_seq: 0,
                log_number: 0,
            }),
            cv: Condvar::new(),
        }
    }

    /// Attaches a pre-commit callback (builder style; call before wrapping
    /// in an `Arc`).
    pub fn with_pre_commit(mut self, f: impl Fn() -> EngineResult<()> + Send + Sync + 'static) -> Self {
        self.pre_commit = Some(Box::new(f));
        self
    }

    /// Attaches a pre-release callback.
    pub fn with_pre_release(mut self, f: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.pre_release = Some(Box::new(f));
        self
    }

    /// Current state.
    pub fn state(&self) -> WriterState {
        self.inner.lock().unwrap().state
    }

    /// Assigns a role (leader/follower/solo) without changing state.
    pub fn set_role(&self, role: Role) {
        self.inner.lock().unwrap().role = Some(role);
    }

    /// Currently assigned role, if any.
    pub fn role(&self) -> Option<Role> {
        self.inner.lock().unwrap().role
    }

    /// Transitions to a new non-terminal state and wakes anyone parked on
    /// this writer.
    pub fn set_state(&self, state: WriterState) {
        let mut guard = self.inner.lock().unwrap();
        guard.state = state;
        self.cv.notify_all();
    }

    /// Parks the calling thread until the state is no longer `LockedWaiting`
    /// (spec §4.2: `{PARALLEL_MEMTABLE_WRITER, MEMTABLE_WRITER_LEADER,
    /// COMPLETED}`), returning the state observed on wakeup.
    pub fn wait_while_locked_waiting(&self) -> WriterState {
        let mut guard = self.inner.lock().unwrap();
        while guard.state == WriterState::LockedWaiting {
            guard = self.cv.wait(guard).unwrap();
        }
        guard.state
    }

    /// Records a pre-commit failure. The writer consumes no sequence and is
    /// completed with this status once the group exits, without aborting
    /// its siblings.
    pub fn fail_precommit(&self, err: crate::error::EngineError) {
        let mut guard = self.inner.lock().unwrap();
        guard.status = Some(Err(err));
    }

    /// `true` if a pre-commit failure has already been recorded.
    pub fn precommit_failed(&self) -> bool {
        self.inner.lock().unwrap().status.is_some()
    }

    /// Moves to `Completed`, stamping `status` as the final result unless a
    /// pre-commit failure already claimed the status slot, and wakes
    /// anyone waiting on this writer.
    pub fn complete(&self, status: EngineResult<()>) {
        let mut guard = self.inner.lock().unwrap();
        if guard.status.is_none() {
            guard.status = Some(status);
        }
        guard.state = WriterState::Completed;
        self.cv.notify_all();
    }

    /// Takes the final status, defaulting to `Ok(())` if the writer never
    /// recorded one (should not happen for a writer that reached
    /// `Completed`, but keeps this infallible for callers).
    pub fn take_status(&self) -> EngineResult<()> {
        self.inner.lock().unwrap().status.take().unwrap_or(Ok(()))
    }

    /// Sets the sequence assigned to this writer's first record.
    pub fn set_assigned_seq(&self, seq: u64) {
        self.inner.lock().unwrap().assigned_seq = seq;
    }

    /// The sequence assigned to this writer's first record.
    pub fn assigned_seq(&self) -> u64 {
        self.inner.lock().unwrap().assigned_seq
    }

    /// Sets the WAL log number this writer's batch was appended to.
    pub fn set_log_number(&self, n: u64) {
        self.inner.lock().unwrap().log_number = n;
    }

    /// The WAL log number this writer's batch was appended to.
    pub fn log_number(&self) -> u64 {
        self.inner.lock().unwrap().log_number
    }

    /// Approximate encoded size of this writer's batch, used for the
    /// batch-group byte budget.
    pub fn approx_batch_bytes(&self) -> usize {
        self.batch.approx_bytes()
    }
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.inner.lock().unwrap();
        f.debug_struct("Writer")
            .field("state", &guard.state)
            .field("role", &guard.role)
            .field("assigned_seq", &guard.assigned_seq)
            .field("records", &self.batch.records().len())
            .finish()
    }
}
