//! Writer Queue & Batch-Group State Machine (C4, spec §4.2).
//!
//! The spec calls for a lock-free linked list with CAS-append leader
//! election. This core implements the same contract — join-batch-group,
//! leader election, batch-group assembly, parallel-writer fan-out, group
//! exit — with a `Mutex<VecDeque<Arc<Writer>>>` plus a `Condvar` instead of
//! a raw CAS list (see `DESIGN.md`, open question on the writer queue):
//! every parking point the spec describes (join, stall, unbatched passage)
//! is modeled as a safe condvar wait rather than a spin/park primitive, in
//! keeping with the rest of this codebase's avoidance of unsafe code.

use crate::writer::{Role, Writer, WriterState};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

const MIB: usize = 1024 * 1024;
const KIB128: usize = 128 * 1024;

/// Byte budget for a batch group: grows with the previous group's size but
/// is capped by queue pressure (spec §4.2).
///
/// `max(1 MiB, min(1 MiB + last_group_bytes/8, 128 KiB * writers_in_queue))`
pub fn batch_byte_budget(last_group_bytes: usize, writers_in_queue: usize) -> usize {
    let grown = MIB + last_group_bytes / 8;
    let capped = KIB128.saturating_mul(writers_in_queue.max(1));
    MIB.max(grown.min(capped))
}

/// A leader plus the consecutive eligible followers chosen to commit
/// together (spec §3 "Write Group").
pub struct WriteGroup {
    /// Leader first, followers in queue order.
    pub members: Vec<Arc<Writer>>,
    /// Aggregate batch size in bytes, as measured for the byte budget.
    pub total_bytes: usize,
    pending_parallel: Arc<AtomicUsize>,
    /// Set once this group has been popped off the front of the queue.
    /// Lets `dequeue_group` run early (pipelined/unordered modes, right
    /// after the WAL phase) without `exit_as_batch_group_leader` popping
    /// a second time once the memtable-apply phase finishes.
    dequeued: std::sync::atomic::AtomicBool,
}

impl WriteGroup {
    /// The group's leader (first queue entry at group-assembly time).
    pub fn leader(&self) -> &Arc<Writer> {
        &self.members[0]
    }

    /// `true` if this group has no followers.
    pub fn is_single(&self) -> bool {
        self.members.len() == 1
    }

    /// Every member's batch, for WAL merge and serial memtable apply.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Writer>> {
        self.members.iter()
    }

    /// Total record count across every member's batch (used to advance
    /// last-allocated).
    pub fn total_record_count(&self) -> u64 {
        self.members.iter().map(|w| w.batch.count() as u64).sum()
    }

    /// `launch-parallel-memtable-writers`: promotes every non-leader member
    /// to `ParallelMemtableWriter` and wakes it. Initializes the shared
    /// completion counter to `len - 1`.
    pub fn launch_parallel_memtable_writers(&self) {
        self.pending_parallel
            .store(self.members.len().saturating_sub(1), Ordering::SeqCst);
        for w in &self.members[1..] {
            w.set_state(WriterState::ParallelMemtableWriter);
        }
    }

    /// `complete-parallel-memtable-writer`: atomically decrements the
    /// group's counter, returning `true` iff the caller was the last to
    /// finish (and is therefore responsible for exiting the group).
    pub fn complete_parallel_memtable_writer(&self) -> bool {
        self.pending_parallel.fetch_sub(1, Ordering::SeqCst) == 1
    }
}

/// Ticketed ordering for pipelined mode's memtable-writer leadership: a
/// newly arrived WAL leader can start its WAL phase while the previous
/// group is still applying to memory, but memtable-writer leaders must
/// still exit in the order their groups entered the queue.
#[derive(Default)]
pub struct MemtableLeaderTicketing {
    next_ticket: AtomicUsize,
    completed_through: Mutex<usize>,
    cv: Condvar,
}

impl MemtableLeaderTicketing {
    /// Issues the next ticket, in queue-entry order.
    pub fn take_ticket(&self) -> usize {
        self.next_ticket.fetch_add(1, Ordering::SeqCst)
    }

    /// `wait-for-memtable-writers`: blocks until every earlier ticket has
    /// completed.
    pub fn wait_for_turn(&self, ticket: usize) {
        let mut guard = self.completed_through.lock().unwrap();
        while *guard < ticket {
            guard = self.cv.wait(guard).unwrap();
        }
    }

    /// Marks `ticket` done and wakes anyone waiting on a later ticket.
    pub fn complete_turn(&self, ticket: usize) {
        let mut guard = self.completed_through.lock().unwrap();
        *guard = (*guard).max(ticket + 1);
        self.cv.notify_all();
    }
}

/// The writer queue: admits writers, elects leaders, assembles batch
/// groups, and exposes the write-stall and unbatched-passage barriers.
pub struct WriterQueue {
    queue: Mutex<VecDeque<Arc<Writer>>>,
    last_group_bytes: AtomicUsize,
    stalled: Mutex<bool>,
    stall_cv: Condvar,
    unbatched_held: Mutex<bool>,
    unbatched_cv: Condvar,
    /// Shared ticketing for pipelined-mode memtable-writer leadership.
    pub memtable_tickets: MemtableLeaderTicketing,
}

impl Default for WriterQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WriterQueue {
    /// An empty queue, no stall in effect.
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            last_group_bytes: AtomicUsize::new(0),
            stalled: Mutex::new(false),
            stall_cv: Condvar::new(),
            unbatched_held: Mutex::new(false),
            unbatched_cv: Condvar::new(),
            memtable_tickets: MemtableLeaderTicketing::default(),
        }
    }

    /// `join-batch-group`: appends `writer`; if it is the new head, marks it
    /// `GroupLeader`, otherwise `LockedWaiting`. Does not block — callers
    /// that land in `LockedWaiting` must call
    /// [`Writer::wait_while_locked_waiting`] themselves.
    pub fn join_batch_group(&self, writer: Arc<Writer>) {
        let mut q = self.queue.lock().unwrap();
        let is_leader = q.is_empty();
        q.push_back(Arc::clone(&writer));
        if is_leader {
            writer.set_role(Role::Leader);
            writer.set_state(WriterState::GroupLeader);
        } else {
            writer.set_state(WriterState::LockedWaiting);
        }
    }

    /// `enter-as-batch-group-leader`: walks the queue from `leader`
    /// forward, accumulating consecutive eligible followers until the byte
    /// budget is exceeded, a non-batchable writer is reached, or the queue
    /// ends.
    pub fn enter_as_batch_group_leader(&self, leader: &Arc<Writer>) -> WriteGroup {
        let q = self.queue.lock().unwrap();
        debug_assert!(
            q.front().map(|w| Arc::ptr_eq(w, leader)).unwrap_or(false),
            "leader must be at the head of the queue"
        );

        let last_bytes = self.last_group_bytes.load(Ordering::Relaxed);
        let budget = batch_byte_budget(last_bytes, q.len());
        let leader_allows_batching = leader.pre_commit.is_none();
        let leader_disable_wal = leader.options.disable_wal;

        let mut members = Vec::new();
        let mut total_bytes = 0usize;
        for w in q.iter() {
            if !members.is_empty() {
                if w.options.disable_wal != leader_disable_wal {
                    break;
                }
                if !leader_allows_batching {
                    break;
                }
                let wbytes = w.approx_batch_bytes();
                if total_bytes + wbytes > budget {
                    break;
                }
                total_bytes += wbytes;
                w.set_role(Role::Follower);
                members.push(Arc::clone(w));
            } else {
                total_bytes += w.approx_batch_bytes();
                members.push(Arc::clone(w));
            }
        }

        if members.len() == 1 {
            members[0].set_role(Role::Solo);
        }

        self.last_group_bytes.store(total_bytes, Ordering::Relaxed);

        WriteGroup {
            members,
            total_bytes,
            pending_parallel: Arc::new(AtomicUsize::new(0)),
            dequeued: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Pops `group`'s members off the front of the queue, making the next
    /// writer in line eligible for leader election. Idempotent: a second
    /// call (e.g. from `exit_as_batch_group_leader`, for modes that don't
    /// call this early) is a no-op.
    ///
    /// Pipelined and unordered mode call this right after their WAL phase
    /// succeeds, *before* the memtable-apply phase runs, so a newly
    /// arrived writer can be elected leader and start its own WAL phase
    /// while this group is still applying to memory (spec §4.6 "this
    /// allows a newly arrived leader to begin its WAL phase while the
    /// previous group is still applying to memory").
    pub fn dequeue_group(&self, group: &WriteGroup) {
        if group.dequeued.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut q = self.queue.lock().unwrap();
        for _ in 0..group.members.len() {
            q.pop_front();
        }
    }

    /// `exit-as-batch-group-leader`: marks every member `Completed` with
    /// `default_status` (unless it already recorded a pre-commit failure),
    /// wakes each, and advances the head past the group (if not already
    /// advanced by an earlier [`WriterQueue::dequeue_group`] call).
    pub fn exit_as_batch_group_leader(
        &self,
        group: &WriteGroup,
        default_status: crate::error::EngineResult<()>,
    ) {
        for w in &group.members {
            w.complete(default_status.clone());
        }
        self.dequeue_group(group);
    }

    /// Number of writers currently queued (used by the byte-budget
    /// formula and tests).
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// `true` if no writers are queued.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    /// `begin-write-stall`: sets the stall barrier.
    pub fn begin_write_stall(&self) {
        *self.stalled.lock().unwrap() = true;
    }

    /// `end-write-stall`: clears the stall barrier and wakes waiters.
    pub fn end_write_stall(&self) {
        *self.stalled.lock().unwrap() = false;
        self.stall_cv.notify_all();
    }

    /// `true` while a stall barrier is in effect.
    pub fn is_stalled(&self) -> bool {
        *self.stalled.lock().unwrap()
    }

    /// Blocks the caller until the stall barrier clears.
    pub fn wait_for_stall_to_clear(&self) {
        let mut guard = self.stalled.lock().unwrap();
        while *guard {
            guard = self.stall_cv.wait(guard).unwrap();
        }
    }

    /// `enter-unbatched`: blocks until no other unbatched writer holds
    /// exclusive passage, then takes it. Used by the memtable switch to run
    /// ahead of ordinary batchable traffic.
    pub fn enter_unbatched(&self) {
        let mut guard = self.unbatched_held.lock().unwrap();
        while *guard {
            guard = self.unbatched_cv.wait(guard).unwrap();
        }
        *guard = true;
    }

    /// `exit-unbatched`: releases exclusive passage.
    pub fn exit_unbatched(&self) {
        *self.unbatched_held.lock().unwrap() = false;
        self.unbatched_cv.notify_all();
    }
}
