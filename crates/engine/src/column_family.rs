//! Column family state and super-versions (spec §3, §9 "Reference counting
//! / lifetime of memtables and super-versions").
//!
//! The manifest/version-set machinery itself is an external collaborator
//! (out of scope per spec §1); this module only carries the pieces the
//! write-path core actually touches: which memtable is active for a CF,
//! its immutable backlog, and the super-version snapshot installed on every
//! memtable switch.

use arc_swap::ArcSwap;
use memtable::Memtable;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::options::MergeOperator;

/// An immutable snapshot bundle of (active memtable, immutable list, version)
/// handed to readers. Swapped atomically on every memtable switch.
#[derive(Clone)]
pub struct SuperVersion {
    /// Creation sequence of the active memtable at the moment this
    /// super-version was installed.
    pub active_creation_seq: u64,
    /// Number of immutable memtables visible in this snapshot.
    pub immutable_count: usize,
    /// Monotonically increasing id, bumped on every install. Stands in for
    /// the on-disk version the (external) version-set would otherwise
    /// attach here.
    pub version_id: u64,
}

impl Default for SuperVersion {
    fn default() -> Self {
        Self {
            active_creation_seq: 0,
            immutable_count: 0,
            version_id: 0,
        }
    }
}

/// Per-column-family write-path state: the active memtable, its immutable
/// backlog, and the WAL log number it is tied to.
pub struct ColumnFamilyData {
    /// Column family name.
    pub name: String,
    /// The single active memtable. Wrapped in a `Mutex` because
    /// `allow_concurrent_memtable_write` lets multiple parallel followers
    /// insert into it at once; `memtable`'s `BTreeMap`-backed map has no
    /// internal synchronization of its own (see `DESIGN.md`).
    pub active: Mutex<Memtable>,
    /// Immutable memtables awaiting flush, oldest first. Each is shared
    /// with readers (hence `Arc`) and never mutated again once sealed, so
    /// no further synchronization is needed past the initial seal.
    pub immutables: Mutex<Vec<Arc<Memtable>>>,
    /// WAL number this CF's oldest unflushed data depends on.
    log_number: AtomicU64,
    /// Optional merge operator; `merge()` against a CF without one is
    /// rejected with `NotSupported` before the writer joins the queue.
    pub merge_operator: Option<Arc<dyn MergeOperator>>,
    /// Installed super-version for this CF.
    pub super_version: ArcSwap<SuperVersion>,
}

impl ColumnFamilyData {
    /// Creates a fresh CF with an empty active memtable stamped at
    /// `creation_seq`.
    pub fn new(name: impl Into<String>, creation_seq: u64, log_number: u64) -> Self {
        Self {
            name: name.into(),
            active: Mutex::new(Memtable::with_creation_seq(creation_seq)),
            immutables: Mutex::new(Vec::new()),
            log_number: AtomicU64::new(log_number),
            merge_operator: None,
            super_version: ArcSwap::from_pointee(SuperVersion {
                active_creation_seq: creation_seq,
                immutable_count: 0,
                version_id: 0,
            }),
        }
    }

    /// Attaches a merge operator (builder style).
    pub fn with_merge_operator(mut self, op: Arc<dyn MergeOperator>) -> Self {
        self.merge_operator = Some(op);
        self
    }

    /// Creation sequence of the currently active memtable.
    pub fn active_creation_seq(&self) -> u64 {
        self.active.lock().unwrap().creation_seq()
    }

    /// Highest sequence recorded in any immutable memtable, or `0` if none.
    ///
    /// Invariant 4 (spec §3) requires the active memtable's creation
    /// sequence to stay at or above this value at all times.
    pub fn immutable_max_seq(&self) -> u64 {
        let guard = self.immutables.lock().unwrap();
        guard
            .iter()
            .map(|m| m.earliest_seq().unwrap_or(0).max(m.creation_seq()))
            .max()
            .unwrap_or(0)
    }

    /// `true` if the active memtable is empty and there are no unflushed
    /// immutables — the condition under which this CF's log number can
    /// advance without manifest churn (spec §4.7 step 5).
    pub fn is_fully_flushed(&self) -> bool {
        self.active.lock().unwrap().is_empty() && self.immutables.lock().unwrap().is_empty()
    }

    /// Current tracked log number.
    pub fn log_number(&self) -> u64 {
        self.log_number.load(Ordering::SeqCst)
    }

    /// Advances the tracked log number.
    pub fn set_log_number(&self, n: u64) {
        self.log_number.store(n, Ordering::SeqCst);
    }

    /// Installs a new super-version reflecting the current active/immutable
    /// state (spec §4.7 step 6).
    pub fn install_super_version(&self) {
        let prev = self.super_version.load();
        let sv = SuperVersion {
            active_creation_seq: self.active_creation_seq(),
            immutable_count: self.immutables.lock().unwrap().len(),
            version_id: prev.version_id + 1,
        };
        self.super_version.store(Arc::new(sv));
    }
}

/// The set of all column families known to the engine, keyed by name.
/// Always contains `"default"`.
pub struct ColumnFamilySet {
    families: RwLock<HashMap<String, Arc<ColumnFamilyData>>>,
}

/// Default column family name.
pub const DEFAULT_CF: &str = "default";

impl ColumnFamilySet {
    /// Builds a set containing only the default CF.
    pub fn new(initial_seq: u64, initial_log_number: u64) -> Self {
        let mut map = HashMap::new();
        map.insert(
            DEFAULT_CF.to_string(),
            Arc::new(ColumnFamilyData::new(DEFAULT_CF, initial_seq, initial_log_number)),
        );
        Self {
            families: RwLock::new(map),
        }
    }

    /// Looks up a CF by name.
    pub fn get(&self, name: &str) -> Option<Arc<ColumnFamilyData>> {
        self.families.read().unwrap().get(name).cloned()
    }

    /// Creates a new column family. No-op (returns the existing one) if
    /// already present.
    pub fn create(&self, name: impl Into<String>, creation_seq: u64, log_number: u64) -> Arc<ColumnFamilyData> {
        let name = name.into();
        let mut map = self.families.write().unwrap();
        map.entry(name.clone())
            .or_insert_with(|| Arc::new(ColumnFamilyData::new(name, creation_seq, log_number)))
            .clone()
    }

    /// All column families, in unspecified order.
    pub fn all(&self) -> Vec<Arc<ColumnFamilyData>> {
        self.families.read().unwrap().values().cloned().collect()
    }

    /// Every non-empty column family (atomic-flush mode, spec §4.5 step 3).
    pub fn non_empty(&self) -> Vec<Arc<ColumnFamilyData>> {
        self.all().into_iter().filter(|cf| !cf.is_fully_flushed()).collect()
    }

    /// The column family whose active memtable has the smallest creation
    /// sequence (default-mode flush target, spec §4.5 step 3).
    pub fn oldest_active(&self) -> Option<Arc<ColumnFamilyData>> {
        self.all()
            .into_iter()
            .filter(|cf| !cf.active.lock().unwrap().is_empty())
            .min_by_key(|cf| cf.active_creation_seq())
    }
}
