//! # Task Limiter
//!
//! A counting semaphore over the number of concurrently running long-lived
//! background tasks (e.g. compactions), with an atomic, runtime-adjustable
//! cap and an optional bypass for callers that must run regardless of
//! pressure.
//!
//! This crate has no dependency on `engine` so that background subsystems
//! unrelated to the write path (a compaction scheduler, a stats flusher)
//! can share the same cap without linking the write-path core.
//!
//! ## Example
//!
//! ```rust
//! use limiter::TaskLimiter;
//!
//! let limiter = TaskLimiter::new(2);
//! let t1 = limiter.get_token(false).unwrap();
//! let t2 = limiter.get_token(false).unwrap();
//! assert!(limiter.get_token(false).is_none()); // cap reached
//! drop(t1);
//! assert!(limiter.get_token(false).is_some());
//! drop(t2);
//! ```

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

struct Inner {
    /// Maximum number of outstanding tokens. Negative means unbounded.
    /// Rarely contended and rarely updated, so relaxed ordering suffices.
    max: AtomicI64,
    /// Number of currently live tokens.
    outstanding: AtomicUsize,
}

/// A named counting semaphore with a dynamic cap.
///
/// Cloning a `TaskLimiter` is cheap and shares the same underlying counters
/// (it is a thin `Arc` wrapper), so it can be handed out to every background
/// subsystem that needs to respect the same cap.
#[derive(Clone)]
pub struct TaskLimiter {
    inner: Arc<Inner>,
}

impl TaskLimiter {
    /// Creates a limiter with the given initial cap. `max < 0` means
    /// unbounded.
    pub fn new(max: i64) -> Self {
        Self {
            inner: Arc::new(Inner {
                max: AtomicI64::new(max),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Sets the cap. `n < 0` removes the cap entirely.
    pub fn set_max(&self, n: i64) {
        self.inner.max.store(n, Ordering::Relaxed);
    }

    /// Equivalent to `set_max(-1)`.
    pub fn reset_max(&self) {
        self.set_max(-1);
    }

    /// Current cap (negative means unbounded).
    pub fn max(&self) -> i64 {
        self.inner.max.load(Ordering::Relaxed)
    }

    /// Current number of live tokens.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Attempts to acquire a token.
    ///
    /// Returns `Some(Token)` if `force` is set, the cap is unbounded, or the
    /// outstanding count is below the cap. Otherwise returns `None` —
    /// throttling is expressed purely by the absence of a token, never as an
    /// error.
    pub fn get_token(&self, force: bool) -> Option<Token> {
        loop {
            let max = self.inner.max.load(Ordering::Relaxed);
            let cur = self.inner.outstanding.load(Ordering::SeqCst);

            if !force && max >= 0 && cur as i64 >= max {
                return None;
            }

            if self
                .inner
                .outstanding
                .compare_exchange(cur, cur + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Some(Token {
                    inner: self.inner.clone(),
                });
            }
            // Lost the race to a concurrent get_token/drop; retry.
        }
    }
}

/// Proof that the holder was granted permission to run one unit of
/// concurrent work. Dropping the token releases the slot.
pub struct Token {
    inner: Arc<Inner>,
}

impl Drop for Token {
    fn drop(&mut self) {
        let prev = self.inner.outstanding.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "task limiter outstanding count went negative");
    }
}
