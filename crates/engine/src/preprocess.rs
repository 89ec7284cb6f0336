//! Preprocessor (C5, spec §4.5).
//!
//! Runs under the global mutex, on the leader only, immediately before the
//! leader assembles its batch group. Decides whether to rotate the WAL,
//! switch a memtable, or stall the writer.

use crate::column_family::ColumnFamilySet;
use crate::error::{EngineError, EngineResult};
use crate::memtable_switch::{select_switch_targets, switch_memtable_and_wal, WalState};
use crate::queue::WriterQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Stores the first unrecoverable background error, if any. Once set, the
/// DB is considered stopped and every subsequent write observes it.
#[derive(Default)]
pub struct BackgroundErrorHandler {
    error: Mutex<Option<EngineError>>,
    cv: Condvar,
}

impl BackgroundErrorHandler {
    /// Records `err` as the background error, unless one is already set
    /// (first error wins) and wakes anyone parked waiting on it.
    pub fn set(&self, err: EngineError) {
        let mut guard = self.error.lock().unwrap();
        if guard.is_none() {
            *guard = Some(err);
        }
        self.cv.notify_all();
    }

    /// Returns `Err` with a clone of the stored background error, if any.
    pub fn check(&self) -> EngineResult<()> {
        match &*self.error.lock().unwrap() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// `true` if a background error has been recorded.
    pub fn has_error(&self) -> bool {
        self.error.lock().unwrap().is_some()
    }
}

/// Tracks whether the DB is fully stopped and whether incoming writes need
/// to be delayed, standing in for RocksDB's `WriteController`.
pub struct WriteController {
    stopped: AtomicBool,
    delay_millis: AtomicU64,
    /// Parks writers blocked in `delay_write`. Notified whenever `stopped`
    /// or `delay_millis` changes, so a clear/shrink wakes waiters instead
    /// of leaving them to find out on the next poll tick.
    cv: Condvar,
    cv_lock: Mutex<()>,
    /// Rate-gates low-priority writers under compaction pressure. Reuses
    /// the task limiter's CAS-retry counting semaphore for a different
    /// purpose: "permission for N low-pri writers in flight," not
    /// background tasks.
    low_pri_limiter: limiter::TaskLimiter,
}

impl Default for WriteController {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteController {
    /// A controller with no stop and no delay in effect, and an unbounded
    /// low-priority limiter.
    pub fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            delay_millis: AtomicU64::new(0),
            cv: Condvar::new(),
            cv_lock: Mutex::new(()),
            low_pri_limiter: limiter::TaskLimiter::new(-1),
        }
    }

    /// `true` if the controller is fully stopped (all writes must wait on
    /// the background condvar, or fail fast if already erroring).
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Sets or clears the fully-stopped state, waking anyone parked in
    /// `delay_write`.
    pub fn set_stopped(&self, stopped: bool) {
        self.stopped.store(stopped, Ordering::SeqCst);
        self.cv.notify_all();
    }

    /// `true` if a positive delay is currently required.
    pub fn needs_delay(&self) -> bool {
        self.delay_millis.load(Ordering::SeqCst) > 0
    }

    /// Sets the delay, in milliseconds, future writers must sleep for,
    /// waking anyone parked in `delay_write`.
    pub fn set_delay_millis(&self, ms: u64) {
        self.delay_millis.store(ms, Ordering::SeqCst);
        self.cv.notify_all();
    }

    /// Required delay in milliseconds for the next write.
    pub fn required_delay_millis(&self) -> u64 {
        self.delay_millis.load(Ordering::SeqCst)
    }

    /// Caps the number of low-priority writers permitted to proceed at
    /// once. `n < 0` means unbounded.
    pub fn set_low_pri_limit(&self, n: i64) {
        self.low_pri_limiter.set_max(n);
    }

    /// Attempts to admit a low-priority writer; `None` means throttled.
    pub fn low_pri_token(&self, force: bool) -> Option<limiter::Token> {
        self.low_pri_limiter.get_token(force)
    }

    /// Blocks on `cv` while `condition` holds, waking immediately on a
    /// `set_stopped`/`set_delay_millis` change and otherwise re-checking at
    /// most every `poll` interval — needed because a background error can
    /// arrive through `BackgroundErrorHandler::set`, which this controller
    /// has no handle to notify directly.
    fn wait_while(&self, poll: Duration, condition: impl Fn() -> bool) {
        let guard = self.cv_lock.lock().unwrap();
        let _ = self.cv.wait_timeout_while(guard, poll, |_| condition());
    }
}

/// Threshold beyond which total alive WAL size triggers a rotation, absent
/// an explicit `max_total_wal_size` override (spec §4.5 check 2).
pub fn wal_size_threshold(configured: u64, db_write_buffer_size: usize) -> u64 {
    if configured > 0 {
        configured
    } else {
        4 * db_write_buffer_size as u64
    }
}

/// Everything the preprocessor needs, borrowed for the duration of one
/// call. Owned by `Engine` and threaded through by the write coordinator.
pub struct PreprocessContext<'a> {
    pub queue: &'a WriterQueue,
    pub controller: &'a WriteController,
    pub errors: &'a BackgroundErrorHandler,
    pub cfs: &'a ColumnFamilySet,
    pub wal_state: &'a WalState,
    pub config: &'a config::EngineConfig,
    /// Blocks until unordered mode's in-flight memtable-apply count drains
    /// to zero. A no-op under the other modes, which never increment that
    /// counter. Called before a memtable switch proceeds (spec §5
    /// "Suspension points" #4: a switch must not race unordered mode's
    /// async memtable writes).
    pub drain_pending_memtable_writes: &'a dyn Fn(),
}

/// Outcome of a preprocess call that the write coordinator must act on.
#[derive(Debug, Default)]
pub struct PreprocessOutcome {
    /// `true` if a memtable switch (and therefore a background flush
    /// request) was performed.
    pub switched: bool,
}

/// Runs the C5 checks, in spec order, for one leader. `no_slowdown` and
/// `last_group_bytes` come from the leader's options and the previous
/// group, respectively.
pub fn preprocess(
    ctx: &PreprocessContext<'_>,
    next_seq: u64,
    no_slowdown: bool,
    last_group_bytes: usize,
) -> EngineResult<PreprocessOutcome> {
    let mut outcome = PreprocessOutcome::default();

    // 1. DB stopped? propagate stored background error.
    ctx.errors.check()?;

    // 2. Total WAL size over threshold? quiesce, then switch WAL.
    let threshold = wal_size_threshold(ctx.config.max_total_wal_size, ctx.config.db_write_buffer_size);
    if ctx.wal_state.total_alive_size() > threshold {
        ctx.queue.begin_write_stall();
        (ctx.drain_pending_memtable_writes)();
        let targets = select_switch_targets(ctx.cfs, ctx.config.atomic_flush);
        let result = switch_memtable_and_wal(ctx.wal_state, ctx.cfs, &targets, next_seq);
        ctx.queue.end_write_stall();
        result.map_err(|e| {
            ctx.errors.set(e.clone());
            e
        })?;
        sync_new_wal_directory(ctx)?;
        outcome.switched = true;
        log::info!(target: "engine::preprocess", "rotated WAL: total alive size exceeded {threshold} bytes");
    }

    // 3. Write-buffer manager says flush? pick a CF (or all, under
    // atomic_flush) and switch it too, if step 2 didn't already cover it.
    if !outcome.switched {
        let over_budget = ctx
            .cfs
            .all()
            .iter()
            .map(|cf| cf.active.lock().unwrap().approx_size())
            .sum::<usize>()
            >= ctx.config.db_write_buffer_size;
        if over_budget {
            ctx.queue.begin_write_stall();
            (ctx.drain_pending_memtable_writes)();
            let targets = select_switch_targets(ctx.cfs, ctx.config.atomic_flush);
            let result = switch_memtable_and_wal(ctx.wal_state, ctx.cfs, &targets, next_seq);
            ctx.queue.end_write_stall();
            result.map_err(|e| {
                ctx.errors.set(e.clone());
                e
            })?;
            sync_new_wal_directory(ctx)?;
            outcome.switched = true;
            log::info!(target: "engine::preprocess", "switched memtable(s): write-buffer budget exceeded");
        }
    }

    // 4. Trim-history scheduler: dropping obsolete immutable-memtable tails
    // is a background-flush-scheduler responsibility (external per spec
    // Non-goals) — nothing to do here once a flush has been requested.

    // 5. Flush scheduler: servicing the flush request itself is likewise
    // external; the coordinator only ever *requests* it via the switch
    // above.

    // 6. Write controller stopped or needs delay?
    if ctx.controller.is_stopped() || ctx.controller.needs_delay() {
        delay_write(ctx, no_slowdown, last_group_bytes)?;
    }

    // 7. Need log sync: handled by the WAL appender itself (wal_io),
    // which always fsyncs the active writer when the leader requested
    // sync; no separate "getting synced" bookkeeping is needed for a
    // single active WAL file.

    Ok(outcome)
}

/// Directory-sync half of the fsync policy (spec §4.4): a WAL switch just
/// created a new log file, so the directory entry for it needs its own
/// fsync. `use_fsync` is RocksDB's knob for this — the WAL writer itself
/// always calls `sync_all` on the file regardless, so `use_fsync` only
/// gates this directory sync.
fn sync_new_wal_directory(ctx: &PreprocessContext<'_>) -> EngineResult<()> {
    if ctx.config.use_fsync {
        crate::wal_io::sync_wal_directory(&ctx.wal_state.dir)?;
    }
    Ok(())
}

/// `delay-write`: computes the required sleep from the write controller,
/// fails fast under `no_slowdown`, otherwise blocks — parked on the
/// controller's condvar rather than polling — until the controller clears
/// or a background error appears.
fn delay_write(ctx: &PreprocessContext<'_>, no_slowdown: bool, _last_group_bytes: usize) -> EngineResult<()> {
    if no_slowdown {
        return Err(EngineError::Incomplete("Write stall".into()));
    }

    ctx.queue.begin_write_stall();
    let deadline = Instant::now() + Duration::from_millis(1000);
    while ctx.controller.needs_delay() && Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        ctx.controller
            .wait_while(remaining.min(Duration::from_millis(50)), || ctx.controller.needs_delay());
    }

    // Re-acquire the mutex and wait on the background condvar, unless
    // there is already a background error (in which case propagate it
    // instead of blocking).
    while ctx.controller.is_stopped() {
        if ctx.errors.has_error() {
            ctx.queue.end_write_stall();
            return ctx.errors.check();
        }
        ctx.controller
            .wait_while(Duration::from_millis(50), || ctx.controller.is_stopped() && !ctx.errors.has_error());
    }

    ctx.queue.end_write_stall();
    Ok(())
}

/// Low-priority throttle applied before a low-priority, non-commit,
/// non-rollback writer even joins the queue (spec §4.5 "Low-priority
/// throttle").
pub fn admit_low_pri(controller: &WriteController, no_slowdown: bool) -> EngineResult<Option<limiter::Token>> {
    match controller.low_pri_token(false) {
        Some(token) => Ok(Some(token)),
        None if no_slowdown => Err(EngineError::Incomplete("low-priority throttle".into())),
        None => {
            // Block until a token frees up, polling like the stall loop
            // above; low-pri traffic is expected to be rare relative to
            // normal writes so a coarse poll is acceptable here.
            loop {
                if let Some(token) = controller.low_pri_token(false) {
                    return Ok(Some(token));
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column_family::ColumnFamilySet;
    use tempfile::tempdir;

    #[test]
    fn background_error_is_returned_on_check() {
        let handler = BackgroundErrorHandler::default();
        handler.set(EngineError::IoError("disk full".into()));
        assert!(handler.check().is_err());
    }

    #[test]
    fn first_background_error_wins() {
        let handler = BackgroundErrorHandler::default();
        handler.set(EngineError::IoError("first".into()));
        handler.set(EngineError::IoError("second".into()));
        match handler.check() {
            Err(EngineError::IoError(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn no_slowdown_fails_fast_when_stopped() {
        let queue = WriterQueue::new();
        let controller = WriteController::new();
        controller.set_stopped(true);
        let errors = BackgroundErrorHandler::default();
        let cfs = ColumnFamilySet::new(0, 1);
        let dir = tempdir().unwrap();
        let wal_state = WalState::new(dir.path().to_path_buf(), 1, false, 0).unwrap();
        let config = config::EngineConfig::default();

        let ctx = PreprocessContext {
            queue: &queue,
            controller: &controller,
            errors: &errors,
            cfs: &cfs,
            wal_state: &wal_state,
            config: &config,
            drain_pending_memtable_writes: &|| {},
        };

        // stopped, no_slowdown=false would block forever in real use; here
        // we only check the no_slowdown=true fast-fail branch directly.
        let result = delay_write(&ctx, true, 0);
        assert!(matches!(result, Err(EngineError::Incomplete(_))));
    }

    #[test]
    fn delay_write_wakes_promptly_when_the_controller_clears() {
        use std::sync::Arc;
        use std::thread;

        let controller = Arc::new(WriteController::new());
        controller.set_stopped(true);
        let errors = Arc::new(BackgroundErrorHandler::default());
        let queue = Arc::new(WriterQueue::new());
        let cfs = Arc::new(ColumnFamilySet::new(0, 1));
        let dir = tempdir().unwrap();
        let wal_state = Arc::new(WalState::new(dir.path().to_path_buf(), 1, false, 0).unwrap());
        let config = Arc::new(config::EngineConfig::default());

        let (controller2, errors2, queue2, cfs2, wal_state2, config2) = (
            Arc::clone(&controller),
            Arc::clone(&errors),
            Arc::clone(&queue),
            Arc::clone(&cfs),
            Arc::clone(&wal_state),
            Arc::clone(&config),
        );
        let handle = thread::spawn(move || {
            let ctx = PreprocessContext {
                queue: &queue2,
                controller: &controller2,
                errors: &errors2,
                cfs: &cfs2,
                wal_state: &wal_state2,
                config: &config2,
                drain_pending_memtable_writes: &|| {},
            };
            delay_write(&ctx, false, 0)
        });

        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());
        controller.set_stopped(false);
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn wal_threshold_prefers_configured_value() {
        assert_eq!(wal_size_threshold(100, 50), 100);
        assert_eq!(wal_size_threshold(0, 50), 200);
    }

    #[test]
    fn preprocess_switches_and_syncs_directory_when_over_the_write_buffer_budget() {
        let queue = WriterQueue::new();
        let controller = WriteController::new();
        let errors = BackgroundErrorHandler::default();
        let cfs = ColumnFamilySet::new(0, 1);
        let dir = tempdir().unwrap();
        let wal_state = WalState::new(dir.path().to_path_buf(), 1, false, 0).unwrap();
        let mut config = config::EngineConfig::default();
        config.db_write_buffer_size = 0;
        config.use_fsync = true;

        let drained = std::sync::atomic::AtomicBool::new(false);
        let ctx = PreprocessContext {
            queue: &queue,
            controller: &controller,
            errors: &errors,
            cfs: &cfs,
            wal_state: &wal_state,
            config: &config,
            drain_pending_memtable_writes: &|| drained.store(true, Ordering::SeqCst),
        };

        let outcome = preprocess(&ctx, 1, false, 0).unwrap();
        assert!(outcome.switched);
        assert!(drained.load(Ordering::SeqCst));
    }
}
