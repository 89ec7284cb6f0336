//! # WAL — Write-Ahead Log
//!
//! Provides crash-safe durability for the RiptideKV storage engine.
//!
//! Every mutation is serialized into a binary record and appended to the WAL
//! **before** the corresponding in-memory update. On restart the WAL is
//! replayed to reconstruct the memtable, guaranteeing that no acknowledged
//! write is lost.
//!
//! This crate only frames and persists bytes — it does not know about keys,
//! values, or sequence numbers beyond the base sequence stamped on a record.
//! The write-batch layout (`Put`/`Merge`/`Delete`/... operation records) is
//! owned by the `engine` crate's `batch` module; this crate guarantees that
//! whatever bytes it is handed come back out intact, in order, with
//! truncated tails and corruption handled the same way regardless of what
//! the payload means.
//!
//! ## Binary Record Format
//!
//! ```text
//! [record_len: u32 LE][crc32: u32 LE][base_seq: u64 LE][payload ...]
//! ```
//!
//! `record_len` includes the 8-byte base sequence and the 4-byte CRC but
//! **not** itself.
//!
//! WAL files are identified by a dense positive integer assigned by the
//! caller ([`WalWriter::create_numbered`]); the engine keeps at most one WAL
//! "active" for appends at a time and retains older ones until every
//! memtable they cover has flushed.
//!
//! ## Example
//!
//! ```rust,no_run
//! use wal::{WalWriter, WalReader};
//!
//! let mut w = WalWriter::create("wal.log", true).unwrap();
//! w.append(1, b"payload").unwrap();
//! drop(w);
//!
//! let mut r = WalReader::open("wal.log").unwrap();
//! r.replay(|seq, payload| println!("{seq} -> {} bytes", payload.len())).unwrap();
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Legacy convenience record shape, retained for callers and tests that want
/// to log a single key/value mutation without going through the batch
/// encoder. Superseded by raw [`WalWriter::append`]/[`WalReader::replay`]
/// for anything that needs real batch semantics (grouped writers, multi-op
/// batches).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// A key-value insertion.
    Put {
        /// Sequence number assigned by the engine.
        seq: u64,
        /// The lookup key.
        key: Vec<u8>,
        /// The payload value.
        value: Vec<u8>,
    },
    /// A key deletion (tombstone).
    Del {
        /// Sequence number assigned by the engine.
        seq: u64,
        /// The key to delete.
        key: Vec<u8>,
    },
}

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A record failed CRC validation or contained an unknown op code.
    #[error("corrupt record")]
    Corrupt,
}

/// Maximum single-record size accepted during replay (64 MiB safety cap).
const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

/// Append-only WAL writer for one numbered log file.
///
/// Records are serialized into an in-memory buffer, CRC-checksummed, and then
/// written to the underlying file in a single `write_all` call. When `sync`
/// is `true`, every append is followed by `sync_all()` (fsync) so the record
/// is durable on disk before the call returns. A running byte count is kept
/// so the engine can enforce `max_total_wal_size` without a `stat` syscall
/// per write.
pub struct WalWriter {
    file: File,
    sync: bool,
    /// Dense positive log number, assigned by the caller at creation time.
    number: u64,
    /// Bytes written to this file so far (frame overhead included).
    bytes_written: u64,
    /// Reusable scratch buffer to avoid allocation on every append.
    buf: Vec<u8>,
}

impl WalWriter {
    /// Opens (or creates) a WAL file in append mode with log number `0`.
    ///
    /// Prefer [`WalWriter::create_numbered`] when the engine tracks dense
    /// WAL numbers; this constructor exists for callers that only ever keep
    /// a single WAL file.
    pub fn create<P: AsRef<Path>>(path: P, sync: bool) -> Result<Self, WalError> {
        Self::create_numbered(path, 0, sync)
    }

    /// Opens (or creates) a WAL file in append mode, tagging it with
    /// `number` so the engine can track which memtables a given WAL file
    /// covers.
    pub fn create_numbered<P: AsRef<Path>>(
        path: P,
        number: u64,
        sync: bool,
    ) -> Result<Self, WalError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        let bytes_written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            file,
            sync,
            number,
            bytes_written,
            buf: Vec::with_capacity(256),
        })
    }

    /// The dense log number this writer was created with.
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Bytes appended to this WAL file so far (including frame overhead).
    pub fn size(&self) -> u64 {
        self.bytes_written
    }

    /// Serializes an opaque `payload` tagged with `base_seq` and appends it
    /// to the WAL file. Returns the number of bytes written for the frame,
    /// which the caller accumulates into its own per-WAL byte counter.
    ///
    /// Layout: `[record_len: u32 LE][crc32: u32 LE][base_seq: u64 LE][payload]`
    pub fn append(&mut self, base_seq: u64, payload: &[u8]) -> Result<u64, WalError> {
        self.buf.clear();
        // Reserve 8 bytes for record_len + crc, filled in once the body is known.
        self.buf.extend_from_slice(&[0u8; 8]);
        self.buf.write_u64::<LittleEndian>(base_seq)?;
        self.buf.extend_from_slice(payload);

        let body = &self.buf[8..];
        let mut hasher = Crc32::new();
        hasher.update(body);
        let crc = hasher.finalize();

        let record_len = (body.len() as u64) + 4;
        if record_len > (u32::MAX as u64) {
            return Err(WalError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "WAL record too large (exceeds u32::MAX bytes)",
            )));
        }

        self.buf[0..4].copy_from_slice(&(record_len as u32).to_le_bytes());
        self.buf[4..8].copy_from_slice(&crc.to_le_bytes());

        self.file.write_all(&self.buf)?;
        self.file.flush()?;
        if self.sync {
            self.file.sync_all()?;
        }

        let written = self.buf.len() as u64;
        self.bytes_written += written;
        Ok(written)
    }

    /// Appends a legacy [`WalRecord`], for callers that do not go through
    /// the `engine` batch encoder.
    pub fn append_record(&mut self, record: &WalRecord) -> Result<u64, WalError> {
        let (seq, payload) = encode_legacy(record)?;
        self.append(seq, &payload)
    }

    /// Forces all buffered data to disk via `fsync`.
    ///
    /// Useful when `sync` is `false` (batched mode) and the caller wants to
    /// ensure durability at a specific point (e.g. before acknowledging a
    /// write group).
    pub fn sync_to_disk(&mut self) -> Result<(), WalError> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Fsyncs the directory containing `path`. Needed after creating or
/// renaming a file so the directory entry itself survives a crash, not just
/// the file contents.
pub fn fsync_parent_dir(path: &Path) -> Result<(), WalError> {
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(d) => d,
        None => return Ok(()),
    };
    let f = File::open(dir)?;
    f.sync_all()?;
    Ok(())
}

fn encode_legacy(record: &WalRecord) -> Result<(u64, Vec<u8>), WalError> {
    let mut buf = Vec::with_capacity(32);
    match record {
        WalRecord::Put { seq, key, value } => {
            buf.write_u8(0)?;
            buf.write_u32::<LittleEndian>(key.len() as u32)?;
            buf.extend_from_slice(key);
            buf.write_u32::<LittleEndian>(value.len() as u32)?;
            buf.extend_from_slice(value);
            Ok((*seq, buf))
        }
        WalRecord::Del { seq, key } => {
            buf.write_u8(1)?;
            buf.write_u32::<LittleEndian>(key.len() as u32)?;
            buf.extend_from_slice(key);
            Ok((*seq, buf))
        }
    }
}

fn decode_legacy(seq: u64, mut body: &[u8]) -> Result<WalRecord, WalError> {
    let op = body.read_u8()?;
    let key_len = body.read_u32::<LittleEndian>()? as usize;
    if key_len > body.len() {
        return Err(WalError::Corrupt);
    }
    let mut key = vec![0u8; key_len];
    body.read_exact(&mut key)?;
    match op {
        0 => {
            let val_len = body.read_u32::<LittleEndian>()? as usize;
            if val_len > body.len() {
                return Err(WalError::Corrupt);
            }
            let mut value = vec![0u8; val_len];
            body.read_exact(&mut value)?;
            Ok(WalRecord::Put { seq, key, value })
        }
        1 => Ok(WalRecord::Del { seq, key }),
        _ => Err(WalError::Corrupt),
    }
}

/// Sequential WAL reader that yields valid records.
///
/// Generic over any `Read` implementor, so it can be used with real files
/// (`WalReader<File>`) or in-memory buffers for testing.
///
/// During replay, each record's CRC32 is verified. A truncated tail record
/// (e.g. from a crash mid-write) is treated as a clean EOF — all
/// fully-written records before it are still returned.
pub struct WalReader<R: Read> {
    rdr: BufReader<R>,
}

impl WalReader<File> {
    /// Opens an existing WAL file for sequential replay.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<WalReader<File>, WalError> {
        let f = File::open(path)?;
        Ok(WalReader {
            rdr: BufReader::new(f),
        })
    }
}

impl<R: Read> WalReader<R> {
    /// Constructs a reader from any `Read` implementor.
    pub fn from_reader(reader: R) -> Self {
        WalReader {
            rdr: BufReader::new(reader),
        }
    }

    /// Replays every valid record, calling `apply(base_seq, payload)` for
    /// each one in file order.
    ///
    /// - **Clean EOF** -> returns `Ok(())`.
    /// - **Truncated tail** (partial record, e.g. crash mid-write) -> returns
    ///   `Ok(())` after yielding all complete records before it.
    /// - **CRC mismatch** or **oversized record** -> `Err(WalError::Corrupt)`.
    /// - **I/O error** -> `Err(WalError::Io(...))`.
    pub fn replay<F>(&mut self, mut apply: F) -> Result<(), WalError>
    where
        F: FnMut(u64, &[u8]),
    {
        let mut body = Vec::with_capacity(256);

        loop {
            let record_len = match self.rdr.read_u32::<LittleEndian>() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(WalError::Io(e)),
            };

            // record_len includes the CRC (4 bytes) but not itself, and must
            // hold at least the 8-byte base sequence.
            if record_len <= 12 || record_len > MAX_RECORD_SIZE {
                return Err(WalError::Corrupt);
            }

            let crc = match self.rdr.read_u32::<LittleEndian>() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(WalError::Io(e)),
            };

            let body_len = (record_len - 4) as usize;
            body.clear();
            body.resize(body_len, 0);
            match self.rdr.read_exact(&mut body) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(WalError::Io(e)),
            }

            let mut hasher = Crc32::new();
            hasher.update(&body);
            if hasher.finalize() != crc {
                return Err(WalError::Corrupt);
            }

            let mut br = &body[..];
            let base_seq = br.read_u64::<LittleEndian>()?;
            apply(base_seq, br);
        }
    }

    /// Like [`replay`](Self::replay) but decodes each record as a legacy
    /// [`WalRecord`]. Only meaningful on WALs written entirely via
    /// [`WalWriter::append_record`].
    pub fn replay_legacy<F>(&mut self, mut apply: F) -> Result<(), WalError>
    where
        F: FnMut(WalRecord),
    {
        let mut err = None;
        self.replay(|seq, payload| {
            if err.is_some() {
                return;
            }
            match decode_legacy(seq, payload) {
                Ok(rec) => apply(rec),
                Err(e) => err = Some(e),
            }
        })?;
        if let Some(e) = err {
            return Err(e);
        }
        Ok(())
    }
}

/// Builds the conventional WAL file name for a dense log number, e.g.
/// `000123.wal`.
pub fn wal_file_name(number: u64) -> String {
    format!("{:06}.wal", number)
}

/// Joins `dir` with the conventional file name for WAL number `number`.
pub fn wal_file_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(wal_file_name(number))
}

/// Removes a WAL file by number, ignoring a missing file.
pub fn remove_wal(dir: &Path, number: u64) -> Result<(), WalError> {
    let path = wal_file_path(dir, number);
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(WalError::Io(e)),
    }
}
