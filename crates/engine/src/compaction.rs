//! Compaction: merges all L0 + L1 SSTables into a single L1 SSTable.
//!
//! Uses [`MergeIterator`] for sorted, deduplicated streaming from multiple
//! SSTables. Tombstone GC drops dead keys when no older SSTables remain.
//! The result is written atomically (temp file + rename), old files are
//! deleted, and the manifest is updated.

use anyhow::Result;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::column_family::DEFAULT_CF;
use crate::{Engine, MergeIterator, SSTableReader, SSTableWriter};

impl Engine {
    /// Compacts all SSTables into a single merged SSTable.
    ///
    /// Uses [`MergeIterator`] to walk all SSTables in sorted key order,
    /// resolving duplicates by highest sequence number. The merged result is
    /// written to a new SSTable, old SSTable files are deleted, and the
    /// engine's SSTable list is replaced with the single merged reader.
    ///
    /// Tombstone GC: since this is a full compaction (all L0 + L1 -> single
    /// L1), tombstones are safe to drop unless the default column family's
    /// active memtable or immutable backlog still references the key (none
    /// of those are part of compaction).
    ///
    /// # When to compact
    ///
    /// Called automatically from [`Engine::flush_cf`] once the L0 count
    /// reaches `l0_compaction_trigger`, or manually by the caller.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure during merge, write, or cleanup.
    pub fn compact(&mut self) -> Result<()> {
        let total = self.l0_sstables.len() + self.l1_sstables.len();
        if total <= 1 {
            return Ok(()); // nothing to compact
        }

        // Collect the paths of old SSTable files before we start.
        let old_paths: Vec<PathBuf> = std::fs::read_dir(&self.sst_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|x| x == "sst").unwrap_or(false))
            .collect();

        // Move L0 + L1 into a contiguous vec for MergeIterator.
        let mut all_sstables: Vec<SSTableReader> = Vec::new();
        let mut l0 = std::mem::take(&mut self.l0_sstables);
        let mut l1 = std::mem::take(&mut self.l1_sstables);
        all_sstables.append(&mut l0);
        all_sstables.append(&mut l1);

        // Estimate total entry count for bloom filter sizing.
        let estimated_count: usize = all_sstables.iter().map(|r| r.len()).sum();

        let mut merge = MergeIterator::new(&all_sstables);

        let ts = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis();
        let sst_name = format!("sst-{:020}-{}.sst", self.seqno.last_allocated(), ts);
        let sst_path = self.sst_dir.join(&sst_name);

        // A key still shadowed by the default CF's active memtable or
        // immutable backlog must keep its tombstone, since those are not
        // part of this compaction and would otherwise resurface the key on
        // recovery once the SSTable tombstone is gone.
        let default_cf = self.cfs.get(DEFAULT_CF);
        let still_in_memory = |key: &[u8]| -> bool {
            match &default_cf {
                Some(cf) => {
                    cf.active.lock().unwrap().contains_key(key)
                        || cf.immutables.lock().unwrap().iter().any(|m| m.contains_key(key))
                }
                None => false,
            }
        };

        let mut merge_error: Option<anyhow::Error> = None;
        let streaming_iter = std::iter::from_fn(|| loop {
            match merge.next_entry() {
                Ok(Some((key, entry))) => {
                    if entry.value.is_none() && still_in_memory(&key) {
                        continue; // GC this tombstone: a live memtable entry
                                  // for the same key is checked first on
                                  // read and fully shadows it either way.
                    }
                    return Some((key, entry));
                }
                Ok(None) => return None,
                Err(e) => {
                    merge_error = Some(e);
                    return None;
                }
            }
        });

        let write_result = SSTableWriter::write_from_iterator(&sst_path, estimated_count, streaming_iter);

        if let Some(e) = merge_error {
            let _ = std::fs::remove_file(sst_path.with_extension("sst.tmp"));
            return Err(e);
        }

        if let Err(e) = write_result {
            if e.to_string().contains("empty") {
                drop(all_sstables);
                for p in &old_paths {
                    let _ = std::fs::remove_file(p);
                }
                self.manifest.entries.clear();
                self.manifest.save()?;
                return Ok(());
            }
            return Err(e);
        }

        self.manifest.replace_all_with_l1(sst_name);
        self.manifest.save()?;

        drop(all_sstables);

        for p in &old_paths {
            let _ = std::fs::remove_file(p);
        }

        let reader = SSTableReader::open(&sst_path)?;
        self.l1_sstables = vec![reader];

        Ok(())
    }
}
