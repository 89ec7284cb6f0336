//! # Engine - RiptideKV Storage Engine
//!
//! The central orchestrator that ties together the [`memtable`], [`wal`], and
//! [`sstable`] crates into a complete LSM-tree key-value store, built around
//! a group-commit write coordinator (spec'd in `DESIGN.md`): writers elect a
//! leader, the leader assembles a batch group, and the group's WAL append
//! and memtable apply happen once on behalf of everyone in it.
//!
//! ## Module Responsibilities
//!
//! | Module             | Purpose                                             |
//! |---------------------|-----------------------------------------------------|
//! | [`lib.rs`]          | `Engine` struct, constructor, accessors, `Debug`/`Drop` |
//! | [`writer`]          | Per-writer state machine (C4)                       |
//! | [`queue`]           | Writer queue, leader election, batch groups (C4)    |
//! | [`batch`]           | `WriteBatch` encoding (spec §3, §6)                 |
//! | [`seqno`]           | Sequence allocator (C3)                             |
//! | [`wal_io`]          | Batch merge + WAL append orchestration (C2)         |
//! | [`preprocess`]      | Per-leader checks before a group commits (C5)       |
//! | [`write`]           | Write coordinator: three modes + entry points (C6) |
//! | [`memtable_switch`] | Memtable/WAL rotation, super-versions (C7)          |
//! | [`column_family`]   | Per-CF state, super-version snapshots               |
//! | [`recovery`]        | WAL replay, SSTable loading, tmp file cleanup        |
//! | [`flush`]           | Immutable-memtable -> SSTable flush                  |
//! | [`read`]            | `get()`, `scan()`                                    |
//! | [`compaction`]      | L0+L1 -> L1 streaming merge + tombstone GC            |
//! | [`manifest`]        | Persistent L0/L1 level tracking (atomic file ops)     |
//! | [`error`], [`options`] | `EngineError`, `WriteOptions`, `MergeOperator`    |
//!
//! ## Crash Safety
//!
//! Every write is appended to the WAL **before** it is visible to readers.
//! SSTables and the manifest are both written atomically (temp file +
//! fsync + rename).

mod batch;
mod column_family;
mod compaction;
mod error;
mod flush;
mod manifest;
mod memtable_switch;
mod options;
mod preprocess;
mod queue;
mod read;
mod recovery;
mod seqno;
mod wal_io;
mod write;
mod writer;

pub use batch::{BatchRecord, WriteBatch};
pub use column_family::DEFAULT_CF;
pub use error::{EngineError, EngineResult};
pub use options::{ConcatMergeOperator, MergeOperator, WriteOptions};
pub use recovery::replay_wal_and_build;

use column_family::ColumnFamilySet;
use manifest::Manifest;
use memtable_switch::WalState;
use preprocess::{BackgroundErrorHandler, WriteController};
use queue::WriterQueue;
use seqno::SequenceAllocator;
use sstable::{MergeIterator, SSTableReader, SSTableWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Condvar, Mutex};

/// Maximum allowed key size in bytes (64 KiB).
pub const MAX_KEY_SIZE: usize = 64 * 1024;
/// Maximum allowed value size in bytes (10 MiB).
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;
/// Default number of L0 SSTables that triggers automatic compaction.
pub const DEFAULT_L0_COMPACTION_TRIGGER: usize = 4;

/// The write-path core: column families, a writer queue, a sequence
/// allocator, and the global collaborators (WAL state, write controller,
/// background-error handler, config) every writer coordinates through.
///
/// SSTables and the manifest remain engine-global rather than per-CF,
/// matching the teacher's single-keyspace compaction design (see
/// `DESIGN.md`, "per-CF SSTables" open question).
pub struct Engine {
    pub(crate) cfs: ColumnFamilySet,
    pub(crate) wal_state: WalState,
    pub(crate) seqno: SequenceAllocator,
    pub(crate) queue: WriterQueue,
    pub(crate) controller: WriteController,
    pub(crate) errors: BackgroundErrorHandler,
    pub(crate) config: config::EngineConfig,
    pub(crate) write_mode: config::WriteMode,
    pub(crate) active_group: Mutex<Option<Arc<queue::WriteGroup>>>,
    pub(crate) pending_memtable_writes: AtomicUsize,
    pub(crate) pending_memtable_cv: Condvar,
    pub(crate) pending_memtable_cv_mutex: Mutex<()>,

    pub(crate) l0_sstables: Vec<SSTableReader>,
    pub(crate) l1_sstables: Vec<SSTableReader>,
    pub(crate) sst_dir: PathBuf,
    pub(crate) manifest: Manifest,
    pub(crate) l0_compaction_trigger: usize,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("write_mode", &self.write_mode)
            .field("last_allocated", &self.seqno.last_allocated())
            .field("last_published", &self.seqno.last_published())
            .field("sst_dir", &self.sst_dir)
            .field("l0_sstable_count", &self.l0_sstables.len())
            .field("l1_sstable_count", &self.l1_sstables.len())
            .field("l0_compaction_trigger", &self.l0_compaction_trigger)
            .finish()
    }
}

impl Engine {
    /// Opens (or creates) an engine rooted at `config.wal_dir`/`config.sst_dir`.
    ///
    /// Recovery order: clean up stray `.sst.tmp` files, replay the latest
    /// WAL file into fresh column-family memtables, open the WAL writer in
    /// append mode, load (or bootstrap) the manifest, then open every
    /// SSTable it names. The sequence allocator resumes from
    /// `max(wal_max_seq, sstable_max_seq)`.
    pub fn open(config: config::EngineConfig) -> anyhow::Result<Self> {
        let sst_dir = config.sst_dir.clone();
        let wal_dir = config.wal_dir.clone();
        std::fs::create_dir_all(&sst_dir)?;
        std::fs::create_dir_all(&wal_dir)?;
        recovery::cleanup_tmp_files(&sst_dir);

        let cfs = ColumnFamilySet::new(0, 1);
        let wal_number = latest_wal_number(&wal_dir)?.unwrap_or(1);
        let wal_path = wal::wal_file_path(&wal_dir, wal_number);
        let wal_seq = recovery::replay_wal_and_build(&wal_path, &cfs)?;

        let wal_state = WalState::new(wal_dir, wal_number, config.wal_sync, config.recycle_log_file_num)?;

        let manifest = Manifest::load_or_create(&sst_dir)?;
        let (l0_sstables, l1_sstables, manifest) = if manifest.entries.is_empty() {
            Self::bootstrap_manifest(&sst_dir, manifest)?
        } else {
            let l0 = manifest
                .l0_filenames()
                .iter()
                .map(|name| SSTableReader::open(sst_dir.join(name)))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let l1 = manifest
                .l1_filenames()
                .iter()
                .map(|name| SSTableReader::open(sst_dir.join(name)))
                .collect::<anyhow::Result<Vec<_>>>()?;
            (l0, l1, manifest)
        };

        let sst_seq = l0_sstables
            .iter()
            .chain(l1_sstables.iter())
            .map(Self::reader_max_seq)
            .max()
            .unwrap_or(0);
        let seqno = SequenceAllocator::new(wal_seq.max(sst_seq));

        let write_mode = config.write_mode;
        let controller = WriteController::new();

        Ok(Self {
            cfs,
            wal_state,
            seqno,
            queue: WriterQueue::new(),
            controller,
            errors: BackgroundErrorHandler::default(),
            l0_compaction_trigger: config.l0_compaction_trigger,
            config,
            write_mode,
            active_group: Mutex::new(None),
            pending_memtable_writes: AtomicUsize::new(0),
            pending_memtable_cv: Condvar::new(),
            pending_memtable_cv_mutex: Mutex::new(()),
            l0_sstables,
            l1_sstables,
            sst_dir,
            manifest,
        })
    }

    /// Scans `sst_dir` for orphaned `.sst` files and records them all as L0,
    /// for upgrading a pre-manifest database (teacher behavior, unchanged).
    fn bootstrap_manifest(
        sst_dir: &Path,
        mut manifest: Manifest,
    ) -> anyhow::Result<(Vec<SSTableReader>, Vec<SSTableReader>, Manifest)> {
        let mut names: Vec<String> = std::fs::read_dir(sst_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|x| x == "sst").unwrap_or(false))
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect();
        names.sort();
        names.reverse();

        let mut readers = Vec::with_capacity(names.len());
        for name in &names {
            readers.push(SSTableReader::open(sst_dir.join(name))?);
            manifest.add(name.clone(), 0);
        }
        if !names.is_empty() {
            manifest.save()?;
        }
        Ok((readers, Vec::new(), manifest))
    }

    /// Current reader-visible sequence number.
    pub fn seq(&self) -> u64 {
        self.seqno.last_published()
    }

    /// Configured L0-compaction trigger.
    pub fn l0_compaction_trigger(&self) -> usize {
        self.l0_compaction_trigger
    }

    /// Overrides the L0-compaction trigger at runtime.
    pub fn set_l0_compaction_trigger(&mut self, trigger: usize) {
        self.l0_compaction_trigger = trigger;
    }

    /// Total SSTable count across both levels.
    pub fn sstable_count(&self) -> usize {
        self.l0_sstables.len() + self.l1_sstables.len()
    }

    /// Number of L0 SSTables (from memtable flushes).
    pub fn l0_sstable_count(&self) -> usize {
        self.l0_sstables.len()
    }

    /// Number of L1 SSTables (from compaction).
    pub fn l1_sstable_count(&self) -> usize {
        self.l1_sstables.len()
    }

    /// Creates a new column family (idempotent), stamped with the current
    /// last-allocated sequence and WAL log number.
    pub fn create_column_family(&self, name: impl Into<String>) -> EngineResult<()> {
        self.cfs
            .create(name, self.seqno.last_allocated(), self.wal_state.current_number());
        Ok(())
    }
}

/// Finds the highest `NNNNNN.wal` number present in `dir`, if any.
fn latest_wal_number(dir: &Path) -> anyhow::Result<Option<u64>> {
    let mut max = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(".wal") else { continue };
        if let Ok(n) = stem.parse::<u64>() {
            max = Some(max.map_or(n, |m: u64| m.max(n)));
        }
    }
    Ok(max)
}

/// Best-effort flush on drop: every non-empty column family gets its active
/// memtable flushed so a clean process exit never strands acknowledged
/// writes in memory alone. Errors are swallowed — `Drop` cannot propagate
/// them, and the WAL still has the data for the next recovery.
impl Drop for Engine {
    fn drop(&mut self) {
        for cf in self.cfs.all() {
            if !cf.active.lock().unwrap().is_empty() {
                let _ = self.flush_cf(&cf.name);
            }
        }
    }
}
