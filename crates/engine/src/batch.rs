//! Write Batch (spec §3, §6).
//!
//! An ordered, length-prefixed sequence of mutation records, prefixed by a
//! 12-byte header (8-byte base sequence + 4-byte record count). Every record
//! is stamped with the batch's base sequence plus its index within the
//! batch. Batches are immutable once handed to the coordinator.

use crate::error::{EngineError, EngineResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// A single mutation within a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchRecord {
    /// Insert or overwrite `key` with `value` in column family `cf`.
    Put { cf: String, key: Vec<u8>, value: Vec<u8> },
    /// Apply `operand` to `key` via the CF's merge operator.
    Merge { cf: String, key: Vec<u8>, operand: Vec<u8> },
    /// Tombstone `key`.
    Delete { cf: String, key: Vec<u8> },
    /// Tombstone exactly one occurrence of `key` (no-op beyond `Delete` for
    /// this core, which has no duplicate-key multiset semantics; kept as a
    /// distinct tag so downstream layers can special-case it).
    SingleDelete { cf: String, key: Vec<u8> },
    /// Tombstone every key in `[start, end)`.
    DeleteRange { cf: String, start: Vec<u8>, end: Vec<u8> },
    /// Marks the start of a 2PC prepare batch. Carries no sequence of its
    /// own beyond the batch's base sequence.
    BeginPrepare,
    /// Marks a 2PC commit. WAL-only queue traffic.
    Commit,
    /// Marks a 2PC rollback. WAL-only queue traffic.
    Rollback,
}

impl BatchRecord {
    fn tag(&self) -> u8 {
        match self {
            BatchRecord::Put { .. } => 1,
            BatchRecord::Merge { .. } => 2,
            BatchRecord::Delete { .. } => 3,
            BatchRecord::SingleDelete { .. } => 4,
            BatchRecord::DeleteRange { .. } => 5,
            BatchRecord::BeginPrepare => 6,
            BatchRecord::Commit => 7,
            BatchRecord::Rollback => 8,
        }
    }

    /// Approximate encoded size, used for the batch-group byte budget.
    pub fn approx_bytes(&self) -> usize {
        match self {
            BatchRecord::Put { cf, key, value } => cf.len() + key.len() + value.len() + 9,
            BatchRecord::Merge { cf, key, operand } => cf.len() + key.len() + operand.len() + 9,
            BatchRecord::Delete { cf, key } | BatchRecord::SingleDelete { cf, key } => {
                cf.len() + key.len() + 6
            }
            BatchRecord::DeleteRange { cf, start, end } => cf.len() + start.len() + end.len() + 9,
            BatchRecord::BeginPrepare | BatchRecord::Commit | BatchRecord::Rollback => 1,
        }
    }

    fn write_field(buf: &mut Vec<u8>, bytes: &[u8]) {
        buf.write_u32::<LittleEndian>(bytes.len() as u32).unwrap();
        buf.extend_from_slice(bytes);
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.tag());
        match self {
            BatchRecord::Put { cf, key, value } => {
                Self::write_field(buf, cf.as_bytes());
                Self::write_field(buf, key);
                Self::write_field(buf, value);
            }
            BatchRecord::Merge { cf, key, operand } => {
                Self::write_field(buf, cf.as_bytes());
                Self::write_field(buf, key);
                Self::write_field(buf, operand);
            }
            BatchRecord::Delete { cf, key } | BatchRecord::SingleDelete { cf, key } => {
                Self::write_field(buf, cf.as_bytes());
                Self::write_field(buf, key);
            }
            BatchRecord::DeleteRange { cf, start, end } => {
                Self::write_field(buf, cf.as_bytes());
                Self::write_field(buf, start);
                Self::write_field(buf, end);
            }
            BatchRecord::BeginPrepare | BatchRecord::Commit | BatchRecord::Rollback => {}
        }
    }

    fn read_field(cur: &mut Cursor<&[u8]>) -> EngineResult<Vec<u8>> {
        let len = cur
            .read_u32::<LittleEndian>()
            .map_err(|_| EngineError::Corruption("truncated batch field length".into()))?
            as usize;
        let pos = cur.position() as usize;
        let data = cur.get_ref();
        if pos + len > data.len() {
            return Err(EngineError::Corruption("truncated batch field data".into()));
        }
        let bytes = data[pos..pos + len].to_vec();
        cur.set_position((pos + len) as u64);
        Ok(bytes)
    }

    fn decode(cur: &mut Cursor<&[u8]>) -> EngineResult<BatchRecord> {
        let tag = cur
            .read_u8()
            .map_err(|_| EngineError::Corruption("truncated batch record tag".into()))?;
        let record = match tag {
            1 => {
                let cf = String::from_utf8(Self::read_field(cur)?)
                    .map_err(|_| EngineError::Corruption("non-utf8 cf name".into()))?;
                let key = Self::read_field(cur)?;
                let value = Self::read_field(cur)?;
                BatchRecord::Put { cf, key, value }
            }
            2 => {
                let cf = String::from_utf8(Self::read_field(cur)?)
                    .map_err(|_| EngineError::Corruption("non-utf8 cf name".into()))?;
                let key = Self::read_field(cur)?;
                let operand = Self::read_field(cur)?;
                BatchRecord::Merge { cf, key, operand }
            }
            3 => {
                let cf = String::from_utf8(Self::read_field(cur)?)
                    .map_err(|_| EngineError::Corruption("non-utf8 cf name".into()))?;
                let key = Self::read_field(cur)?;
                BatchRecord::Delete { cf, key }
            }
            4 => {
                let cf = String::from_utf8(Self::read_field(cur)?)
                    .map_err(|_| EngineError::Corruption("non-utf8 cf name".into()))?;
                let key = Self::read_field(cur)?;
                BatchRecord::SingleDelete { cf, key }
            }
            5 => {
                let cf = String::from_utf8(Self::read_field(cur)?)
                    .map_err(|_| EngineError::Corruption("non-utf8 cf name".into()))?;
                let start = Self::read_field(cur)?;
                let end = Self::read_field(cur)?;
                BatchRecord::DeleteRange { cf, start, end }
            }
            6 => BatchRecord::BeginPrepare,
            7 => BatchRecord::Commit,
            8 => BatchRecord::Rollback,
            other => {
                return Err(EngineError::Corruption(format!(
                    "unknown batch record tag {other}"
                )))
            }
        };
        Ok(record)
    }
}

/// An ordered, immutable-once-submitted sequence of [`BatchRecord`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    records: Vec<BatchRecord>,
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a `Put` record for the default column family.
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.put_cf("default", key, value)
    }

    /// Appends a `Put` record for `cf`.
    pub fn put_cf(
        &mut self,
        cf: impl Into<String>,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> &mut Self {
        self.records.push(BatchRecord::Put {
            cf: cf.into(),
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Appends a `Merge` record for `cf`.
    pub fn merge_cf(
        &mut self,
        cf: impl Into<String>,
        key: impl Into<Vec<u8>>,
        operand: impl Into<Vec<u8>>,
    ) -> &mut Self {
        self.records.push(BatchRecord::Merge {
            cf: cf.into(),
            key: key.into(),
            operand: operand.into(),
        });
        self
    }

    /// Appends a `Delete` record for the default column family.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.delete_cf("default", key)
    }

    /// Appends a `Delete` record for `cf`.
    pub fn delete_cf(&mut self, cf: impl Into<String>, key: impl Into<Vec<u8>>) -> &mut Self {
        self.records.push(BatchRecord::Delete {
            cf: cf.into(),
            key: key.into(),
        });
        self
    }

    /// Appends a `SingleDelete` record for `cf`.
    pub fn single_delete_cf(&mut self, cf: impl Into<String>, key: impl Into<Vec<u8>>) -> &mut Self {
        self.records.push(BatchRecord::SingleDelete {
            cf: cf.into(),
            key: key.into(),
        });
        self
    }

    /// Appends a `DeleteRange` record for `cf`.
    pub fn delete_range_cf(
        &mut self,
        cf: impl Into<String>,
        start: impl Into<Vec<u8>>,
        end: impl Into<Vec<u8>>,
    ) -> &mut Self {
        self.records.push(BatchRecord::DeleteRange {
            cf: cf.into(),
            start: start.into(),
            end: end.into(),
        });
        self
    }

    /// Raw record access, in insertion order.
    pub fn records(&self) -> &[BatchRecord] {
        &self.records
    }

    /// Number of records in the batch.
    pub fn count(&self) -> u32 {
        self.records.len() as u32
    }

    /// `true` if the batch carries no records — rejected as `Corruption`
    /// ("null batch") by the coordinator.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Approximate encoded size in bytes, used for the batch-group byte
    /// budget (spec §4.2).
    pub fn approx_bytes(&self) -> usize {
        self.records.iter().map(BatchRecord::approx_bytes).sum::<usize>() + 12
    }

    /// Encodes the batch with the given base sequence: 12-byte header
    /// (base sequence + record count) followed by length-prefixed records.
    pub fn encode(&self, base_seq: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.approx_bytes());
        buf.write_u64::<LittleEndian>(base_seq).unwrap();
        buf.write_u32::<LittleEndian>(self.count()).unwrap();
        for record in &self.records {
            record.encode(&mut buf);
        }
        buf
    }

    /// Decodes a batch previously produced by [`WriteBatch::encode`],
    /// returning `(base_seq, batch)`.
    pub fn decode(bytes: &[u8]) -> EngineResult<(u64, WriteBatch)> {
        if bytes.len() < 12 {
            return Err(EngineError::Corruption("batch shorter than header".into()));
        }
        let mut cur = Cursor::new(bytes);
        let base_seq = cur
            .read_u64::<LittleEndian>()
            .map_err(|_| EngineError::Corruption("truncated batch header".into()))?;
        let count = cur
            .read_u32::<LittleEndian>()
            .map_err(|_| EngineError::Corruption("truncated batch header".into()))?;
        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            records.push(BatchRecord::decode(&mut cur)?);
        }
        Ok((base_seq, WriteBatch { records }))
    }

    /// Builds a batch directly from records (used by the scratch-batch
    /// merge path in `wal_io`).
    pub fn from_records(records: Vec<BatchRecord>) -> Self {
        Self { records }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_mixed_record_batch() {
        let mut batch = WriteBatch::new();
        batch
            .put_cf("cf1", b"k1".to_vec(), b"v1".to_vec())
            .merge_cf("cf1", b"k2".to_vec(), b"delta".to_vec())
            .delete_cf("cf2", b"k3".to_vec())
            .single_delete_cf("cf2", b"k4".to_vec())
            .delete_range_cf("cf1", b"a".to_vec(), b"z".to_vec());

        let encoded = batch.encode(42);
        let (seq, decoded) = WriteBatch::decode(&encoded).unwrap();
        assert_eq!(seq, 42);
        assert_eq!(decoded.records(), batch.records());
    }

    #[test]
    fn empty_batch_is_empty() {
        assert!(WriteBatch::new().is_empty());
    }

    #[test]
    fn prepare_commit_rollback_round_trip() {
        let mut batch = WriteBatch::new();
        batch.records.push(BatchRecord::BeginPrepare);
        batch.records.push(BatchRecord::Commit);
        let encoded = batch.encode(7);
        let (seq, decoded) = WriteBatch::decode(&encoded).unwrap();
        assert_eq!(seq, 7);
        assert_eq!(
            decoded.records(),
            &[BatchRecord::BeginPrepare, BatchRecord::Commit]
        );
    }

    #[test]
    fn decode_rejects_truncated_header() {
        let err = WriteBatch::decode(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, EngineError::Corruption(_)));
    }

    #[test]
    fn decode_rejects_truncated_field() {
        let mut batch = WriteBatch::new();
        batch.put_cf("cf", b"k".to_vec(), b"v".to_vec());
        let mut encoded = batch.encode(1);
        encoded.truncate(encoded.len() - 1);
        let err = WriteBatch::decode(&encoded).unwrap_err();
        assert!(matches!(err, EngineError::Corruption(_)));
    }
}
