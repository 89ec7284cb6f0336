//! Immutable-memtable -> SSTable flush.
//!
//! The write-path core only ever *requests* a flush, by sealing a memtable
//! via the C7 memtable switch (`preprocess.rs` checks 2/3); actually
//! servicing that request is an external background-flush-scheduler
//! responsibility per spec §1 Non-goals. This module is the synchronous
//! stand-in this core runs that request through directly: `Drop` and the
//! CLI's `FLUSH` command both call it.

use crate::column_family::DEFAULT_CF;
use crate::memtable_switch::switch_memtable_and_wal;
use crate::Engine;
use sstable::{SSTableReader, SSTableWriter};
use std::time::{SystemTime, UNIX_EPOCH};

impl Engine {
    /// Flushes the oldest immutable memtable of `cf_name` to a new L0
    /// SSTable. If there is no immutable backlog but the active memtable
    /// holds data, seals it first. Returns `true` if a flush happened, and
    /// runs compaction if the L0 trigger is crossed.
    pub fn flush_cf(&mut self, cf_name: &str) -> anyhow::Result<bool> {
        let cf = match self.cfs.get(cf_name) {
            Some(cf) => cf,
            None => return Ok(false),
        };

        if cf.immutables.lock().unwrap().is_empty() {
            if cf.active.lock().unwrap().is_empty() {
                return Ok(false);
            }
            let next_seq = self.seqno.last_allocated();
            switch_memtable_and_wal(&self.wal_state, &self.cfs, std::slice::from_ref(&cf), next_seq)?;
        }

        let sealed = {
            let mut guard = cf.immutables.lock().unwrap();
            if guard.is_empty() {
                return Ok(false);
            }
            guard.remove(0)
        };

        let ts = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis();
        let seq = self.seqno.last_allocated();
        let sst_name = format!("sst-{:020}-{}.sst", seq, ts);
        let sst_path = self.sst_dir.join(&sst_name);
        SSTableWriter::write_from_memtable(&sst_path, &sealed)?;

        self.manifest.add(sst_name.clone(), 0);
        self.manifest.save()?;
        self.l0_sstables.insert(0, SSTableReader::open(&sst_path)?);

        if cf.is_fully_flushed() {
            let n = cf.log_number();
            if n != self.wal_state.current_number() {
                let _ = self.wal_state.retire(n);
            }
        }

        if self.l0_compaction_trigger > 0 && self.l0_sstables.len() >= self.l0_compaction_trigger {
            self.compact()?;
        }

        Ok(true)
    }

    /// Flushes the default column family. Convenience wrapper for callers
    /// (e.g. the CLI's `FLUSH` command) that don't work with column
    /// families directly.
    pub fn force_flush(&mut self) -> anyhow::Result<bool> {
        self.flush_cf(DEFAULT_CF)
    }
}

#[cfg(test)]
mod tests {
    use crate::column_family::DEFAULT_CF;
    use crate::{Engine, WriteOptions};
    use tempfile::tempdir;

    fn open(dir: &std::path::Path) -> Engine {
        let config = config::EngineConfig {
            wal_dir: dir.join("wal"),
            sst_dir: dir.join("sst"),
            ..config::EngineConfig::default()
        };
        Engine::open(config).unwrap()
    }

    #[test]
    fn flush_with_no_data_is_a_no_op() {
        let dir = tempdir().unwrap();
        let mut engine = open(dir.path());
        assert!(!engine.flush_cf(DEFAULT_CF).unwrap());
    }

    #[test]
    fn flush_seals_active_memtable_and_creates_an_sstable() {
        let dir = tempdir().unwrap();
        let mut engine = open(dir.path());
        engine.put(WriteOptions::new(), DEFAULT_CF, b"k".to_vec(), b"v".to_vec()).unwrap();

        assert!(engine.flush_cf(DEFAULT_CF).unwrap());
        assert_eq!(engine.l0_sstable_count(), 1);

        let (_, value) = engine.get(b"k").unwrap().unwrap();
        assert_eq!(value, b"v");
    }

    #[test]
    fn flush_triggers_compaction_at_the_configured_threshold() {
        let dir = tempdir().unwrap();
        let mut engine = open(dir.path());
        engine.set_l0_compaction_trigger(2);

        for i in 0..2u8 {
            engine
                .put(WriteOptions::new(), DEFAULT_CF, vec![i], vec![i])
                .unwrap();
            engine.flush_cf(DEFAULT_CF).unwrap();
        }

        assert_eq!(engine.l0_sstable_count(), 0);
        assert_eq!(engine.l1_sstable_count(), 1);
    }
}
