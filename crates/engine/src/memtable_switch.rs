//! Memtable Switch (C7, spec §4.7).
//!
//! Atomically rolls to a new WAL number and a new active memtable, marks
//! the prior memtable immutable, and installs a new super-version. Callers
//! must already hold the global mutex and be at the head of the writer
//! queue (and, in two-queue mode, the WAL-only queue too, via
//! `enter_unbatched`) before calling this.

use crate::column_family::{ColumnFamilyData, ColumnFamilySet};
use crate::error::EngineResult;
use memtable::Memtable;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use wal::WalWriter;

/// WAL rotation state shared by the preprocessor and the memtable switch.
pub struct WalState {
    /// Directory new WAL files are created in.
    pub dir: PathBuf,
    /// The currently active WAL writer.
    pub writer: Mutex<WalWriter>,
    /// WAL numbers with data not yet flushed from every memtable that
    /// covers them.
    pub alive_numbers: Mutex<Vec<u64>>,
    /// Retired WAL numbers kept around for reuse (`recycle_log_file_num`).
    pub recycled_numbers: Mutex<Vec<u64>>,
    /// Cap on how many retired numbers `recycled_numbers` will hold.
    pub recycle_log_file_num: usize,
}

impl WalState {
    /// Opens (or creates) WAL number `number` as the active writer.
    pub fn new(dir: PathBuf, number: u64, sync: bool, recycle_log_file_num: usize) -> EngineResult<Self> {
        std::fs::create_dir_all(&dir)?;
        let path = wal::wal_file_path(&dir, number);
        let writer = WalWriter::create_numbered(&path, number, sync)?;
        Ok(Self {
            dir,
            writer: Mutex::new(writer),
            alive_numbers: Mutex::new(vec![number]),
            recycled_numbers: Mutex::new(Vec::new()),
            recycle_log_file_num,
        })
    }

    /// The WAL number currently accepting appends.
    pub fn current_number(&self) -> u64 {
        self.writer.lock().unwrap().number()
    }

    /// Bytes written to the current WAL file so far.
    pub fn current_size(&self) -> u64 {
        self.writer.lock().unwrap().size()
    }

    /// Aggregate size across every alive WAL file. Conservative: only the
    /// active file's size is tracked precisely; retired-but-alive files
    /// contribute their last-known size via the directory listing.
    pub fn total_alive_size(&self) -> u64 {
        let dir = &self.dir;
        self.alive_numbers
            .lock()
            .unwrap()
            .iter()
            .map(|&n| {
                std::fs::metadata(wal::wal_file_path(dir, n))
                    .map(|m| m.len())
                    .unwrap_or(0)
            })
            .sum()
    }

    /// Retires a WAL number once every memtable covering it has flushed,
    /// feeding the recycle pool up to its configured size.
    pub fn retire(&self, number: u64) -> EngineResult<()> {
        self.alive_numbers.lock().unwrap().retain(|&n| n != number);
        let mut recycled = self.recycled_numbers.lock().unwrap();
        if recycled.len() < self.recycle_log_file_num {
            recycled.push(number);
        } else {
            wal::remove_wal(&self.dir, number)?;
        }
        Ok(())
    }
}

/// Runs the C7 memtable switch against `targets`: seals each target's
/// active memtable into its immutable list, rotates the WAL if the current
/// one is non-empty, and installs a fresh super-version for every target.
///
/// `next_seq` is the creation sequence stamped on every new active
/// memtable — callers pass the current last-allocated sequence so invariant
/// 4 (active creation seq ≥ highest immutable seq) holds by construction.
pub fn switch_memtable_and_wal(
    wal_state: &WalState,
    cfs: &ColumnFamilySet,
    targets: &[Arc<ColumnFamilyData>],
    next_seq: u64,
) -> EngineResult<u64> {
    // Step 1/2: a new WAL is only needed if the current one has data.
    let needs_new_wal = wal_state.current_size() > 0;
    let new_number = if needs_new_wal {
        let recycled = wal_state.recycled_numbers.lock().unwrap().pop();
        recycled.unwrap_or_else(|| wal_state.current_number() + 1)
    } else {
        wal_state.current_number()
    };

    if needs_new_wal {
        // Step 3: create the new WAL file.
        let new_path = wal::wal_file_path(&wal_state.dir, new_number);
        let new_writer = WalWriter::create_numbered(&new_path, new_number, false)?;

        // Step 4: flush the outgoing writer's buffer, install the new one.
        {
            let mut w = wal_state.writer.lock().unwrap();
            w.sync_to_disk()?;
            *w = new_writer;
        }
        wal_state.alive_numbers.lock().unwrap().push(new_number);
    }

    // Step 5: CFs with nothing outstanding can advance their log number
    // without manifest churn.
    for cf in cfs.all() {
        if cf.is_fully_flushed() {
            cf.set_log_number(new_number);
        }
    }

    // Steps 6-7: seal and install for the requested targets.
    for cf in targets {
        let sealed = {
            let mut active = cf.active.lock().unwrap();
            std::mem::replace(&mut *active, Memtable::with_creation_seq(next_seq))
        };
        let sealed_was_empty = sealed.is_empty();
        if !sealed_was_empty {
            cf.immutables.lock().unwrap().push(Arc::new(sealed));
        }
        cf.set_log_number(new_number);
        cf.install_super_version();
        log::info!(target: "engine::memtable_switch", "sealed memtable for cf '{}' at seq {}", cf.name, next_seq);
    }

    Ok(new_number)
}

/// Determines which CFs should be switched for a given preprocess decision
/// (spec §4.5 step 3): every non-empty CF under `atomic_flush`, otherwise
/// just the one with the smallest active creation sequence.
pub fn select_switch_targets(cfs: &ColumnFamilySet, atomic_flush: bool) -> Vec<Arc<ColumnFamilyData>> {
    if atomic_flush {
        cfs.non_empty()
    } else {
        cfs.oldest_active().into_iter().collect()
    }
}
