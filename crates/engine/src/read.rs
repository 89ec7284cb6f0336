//! Read path: `get()` and `scan()`.
//!
//! Point lookups check the default column family's active memtable first
//! (freshest data), then its immutable backlog (newest-sealed first), then
//! L0 SSTables (newest-first, may overlap), then L1 SSTables (newest-first,
//! non-overlapping). The first match wins; tombstones shadow older values.
//!
//! Range scans merge data from all sources, deduplicate by highest sequence
//! number, and filter out tombstones before returning sorted results.

use anyhow::Result;
use memtable::ValueEntry;
use std::collections::BTreeMap;

use crate::column_family::DEFAULT_CF;
use crate::Engine;

impl Engine {
    /// Looks up a key in the default column family, returning
    /// `Some((seq, value))` if found and live.
    ///
    /// # Errors
    ///
    /// Returns an error if any SSTable read fails (e.g. corruption, I/O), or
    /// if the default column family is somehow missing.
    pub fn get(&self, key: &[u8]) -> Result<Option<(u64, Vec<u8>)>> {
        let cf = self
            .cfs
            .get(DEFAULT_CF)
            .ok_or_else(|| anyhow::anyhow!("default column family missing"))?;

        // 1. Active memtable (freshest data, includes tombstones).
        if let Some(entry) = cf.active.lock().unwrap().get_entry(key) {
            return Ok(entry.value.as_ref().map(|v| (entry.seq, v.clone())));
        }

        // 2. Immutable backlog, newest-sealed first.
        for sealed in cf.immutables.lock().unwrap().iter().rev() {
            if let Some(entry) = sealed.get_entry(key) {
                return Ok(entry.value.as_ref().map(|v| (entry.seq, v.clone())));
            }
        }

        // 3. L0 SSTables (newest -> oldest, may overlap).
        for sst in &self.l0_sstables {
            match sst.get(key) {
                Ok(Some(entry)) => return Ok(entry.value.map(|v| (entry.seq, v))),
                Ok(None) => continue,
                Err(e) => return Err(e),
            }
        }

        // 4. L1 SSTables (newest -> oldest, non-overlapping).
        for sst in &self.l1_sstables {
            match sst.get(key) {
                Ok(Some(entry)) => return Ok(entry.value.map(|v| (entry.seq, v))),
                Ok(None) => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(None)
    }

    /// Scans `[start, end)` in the default column family, returning all live
    /// key-value pairs in ascending key order. Pass `b""` for `start` or
    /// `end` to leave that bound open.
    ///
    /// # Errors
    ///
    /// Returns an error if any SSTable read fails.
    pub fn scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self
            .cfs
            .get(DEFAULT_CF)
            .ok_or_else(|| anyhow::anyhow!("default column family missing"))?;

        let mut merged: BTreeMap<Vec<u8>, ValueEntry> = BTreeMap::new();
        let mut merge_entry = |key: Vec<u8>, entry: ValueEntry| match merged.get(&key) {
            Some(existing) if existing.seq >= entry.seq => {}
            _ => {
                merged.insert(key, entry);
            }
        };
        let in_range = |key: &[u8]| (start.is_empty() || key >= start) && (end.is_empty() || key < end);

        // 1. Active memtable (highest priority).
        for (key, entry) in cf.active.lock().unwrap().iter() {
            if in_range(key) {
                merge_entry(key.to_vec(), entry.clone());
            }
        }

        // 2. Immutable backlog.
        for sealed in cf.immutables.lock().unwrap().iter() {
            for (key, entry) in sealed.iter() {
                if in_range(key) {
                    merge_entry(key.to_vec(), entry.clone());
                }
            }
        }

        // 3. L0 SSTables (may overlap).
        for sst in &self.l0_sstables {
            for key_ref in sst.keys() {
                if in_range(key_ref) {
                    if let Ok(Some(entry)) = sst.get(key_ref) {
                        merge_entry(key_ref.to_vec(), entry);
                    }
                }
            }
        }

        // 4. L1 SSTables (non-overlapping).
        for sst in &self.l1_sstables {
            for key_ref in sst.keys() {
                if in_range(key_ref) {
                    if let Ok(Some(entry)) = sst.get(key_ref) {
                        merge_entry(key_ref.to_vec(), entry);
                    }
                }
            }
        }

        let result: Vec<(Vec<u8>, Vec<u8>)> = merged
            .into_iter()
            .filter_map(|(key, entry)| entry.value.map(|v| (key, v)))
            .collect();

        Ok(result)
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

    fn put(engine: &Engine, key: &str, val: &str) {
        engine
            .put(WriteOptions::new(), DEFAULT_CF, key.as_bytes().to_vec(), val.as_bytes().to_vec())
            .unwrap();
    }

    #[test]
    fn get_missing_key_returns_none() {
        let dir = tempdir().unwrap();
        let engine = open(dir.path());
        assert!(engine.get(b"missing").unwrap().is_none());
    }

    #[test]
    fn get_reads_through_to_sstable_after_flush() {
        let dir = tempdir().unwrap();
        let mut engine = open(dir.path());
        put(&engine, "k", "v");
        engine.force_flush().unwrap();
        let (_, val) = engine.get(b"k").unwrap().unwrap();
        assert_eq!(val, b"v");
    }

    #[test]
    fn active_memtable_shadows_a_flushed_sstable_value() {
        let dir = tempdir().unwrap();
        let mut engine = open(dir.path());
        put(&engine, "k", "old");
        engine.force_flush().unwrap();
        put(&engine, "k", "new");
        let (_, val) = engine.get(b"k").unwrap().unwrap();
        assert_eq!(val, b"new");
    }

    #[test]
    fn deleting_a_flushed_key_hides_it_via_a_memtable_tombstone() {
        let dir = tempdir().unwrap();
        let mut engine = open(dir.path());
        put(&engine, "k", "v");
        engine.force_flush().unwrap();
        engine
            .delete(WriteOptions::new(), DEFAULT_CF, b"k".to_vec())
            .unwrap();
        assert!(engine.get(b"k").unwrap().is_none());
    }

    #[test]
    fn scan_is_bounded_sorted_and_excludes_tombstones() {
        let dir = tempdir().unwrap();
        let engine = open(dir.path());
        put(&engine, "b", "2");
        put(&engine, "a", "1");
        put(&engine, "c", "3");
        engine
            .delete(WriteOptions::new(), DEFAULT_CF, b"c".to_vec())
            .unwrap();

        let all = engine.scan(b"", b"").unwrap();
        assert_eq!(all, vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())]);

        let bounded = engine.scan(b"b", b"").unwrap();
        assert_eq!(bounded, vec![(b"b".to_vec(), b"2".to_vec())]);
    }

    #[test]
    fn scan_merges_memtable_and_flushed_sstable_with_newest_seq_winning() {
        let dir = tempdir().unwrap();
        let mut engine = open(dir.path());
        put(&engine, "k", "old");
        engine.force_flush().unwrap();
        put(&engine, "k", "new");

        let results = engine.scan(b"", b"").unwrap();
        assert_eq!(results, vec![(b"k".to_vec(), b"new".to_vec())]);
    }
}
