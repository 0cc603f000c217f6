//! Snapshot persistence.
//!
//! The engine exposes its state as an [`EngineSnapshot`]; when to save is
//! the host's decision. Snapshots are MessagePack framed as
//! `magic(4) | version(1) | len(u64 LE) | payload | crc32(u32 LE)`.

use crate::entities::EntityStore;
use crate::error::{Result, SyncError};
use crate::subscriptions::SubscriptionRegistry;
use crate::tracker::ReadTracker;
use crate::types::{Column, Timestamp};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Magic bytes for snapshot files.
const SNAPSHOT_MAGIC: &[u8; 4] = b"ASN\0";

/// Current snapshot format version.
const SNAPSHOT_VERSION: u8 = 1;

const HEADER_LEN: usize = 4 + 1 + 8;
const TRAILER_LEN: usize = 4;

/// 1GB sanity limit on the encoded payload.
const MAX_PAYLOAD_LEN: u64 = 1024 * 1024 * 1024;

const SNAPSHOT_FILE: &str = "snapshot.bin";
const SNAPSHOT_TEMP_FILE: &str = "snapshot.bin.tmp";

/// Everything the engine persists: merged entity values (not their history),
/// subscriptions with cache validators, columns and read marks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub entities: EntityStore,
    pub subscriptions: SubscriptionRegistry,
    pub columns: Vec<Column>,
    pub tracker: ReadTracker,
    pub taken_at: Timestamp,
}

/// Durable load/save capability supplied by the host.
pub trait SnapshotStorage: Send + Sync {
    /// The last saved snapshot, or `None` if nothing was saved yet.
    fn load(&self) -> Result<Option<EngineSnapshot>>;

    fn save(&self, snapshot: &EngineSnapshot) -> Result<()>;
}

/// Encode a snapshot into its framed binary form.
pub fn encode_snapshot(snapshot: &EngineSnapshot) -> Result<Vec<u8>> {
    let encoded = rmp_serde::to_vec(snapshot)?;

    let mut out = Vec::with_capacity(HEADER_LEN + encoded.len() + TRAILER_LEN);
    out.extend_from_slice(SNAPSHOT_MAGIC);
    out.push(SNAPSHOT_VERSION);
    out.extend_from_slice(&(encoded.len() as u64).to_le_bytes());
    out.extend_from_slice(&encoded);
    out.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());
    Ok(out)
}

/// Decode and verify a framed snapshot.
pub fn decode_snapshot(bytes: &[u8]) -> Result<EngineSnapshot> {
    if bytes.len() < HEADER_LEN + TRAILER_LEN {
        return Err(SyncError::Corruption("snapshot too short".into()));
    }

    if &bytes[..4] != SNAPSHOT_MAGIC {
        return Err(SyncError::InvalidFormat("Invalid snapshot magic".into()));
    }
    if bytes[4] != SNAPSHOT_VERSION {
        return Err(SyncError::InvalidFormat(format!(
            "Unsupported snapshot version: {}",
            bytes[4]
        )));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[5..HEADER_LEN]);
    let len = u64::from_le_bytes(len_bytes);
    if len > MAX_PAYLOAD_LEN {
        return Err(SyncError::Corruption("snapshot payload too large".into()));
    }
    let len = len as usize;
    if bytes.len() != HEADER_LEN + len + TRAILER_LEN {
        return Err(SyncError::Corruption(format!(
            "snapshot length mismatch: header says {len} bytes, file holds {}",
            bytes.len().saturating_sub(HEADER_LEN + TRAILER_LEN)
        )));
    }

    let encoded = &bytes[HEADER_LEN..HEADER_LEN + len];
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&bytes[HEADER_LEN + len..]);
    let expected = u32::from_le_bytes(crc_bytes);
    let got = crc32fast::hash(encoded);
    if expected != got {
        return Err(SyncError::ChecksumMismatch { expected, got });
    }

    Ok(rmp_serde::from_slice(encoded)?)
}

/// Snapshot kept in a directory on disk.
///
/// Holds an exclusive lock on `<dir>/LOCK` for its lifetime. Saves write a
/// temporary file and rename it over the previous snapshot.
pub struct FileSnapshotStorage {
    dir: PathBuf,
    _lock_file: File,
}

impl FileSnapshotStorage {
    /// Open (creating if needed) a snapshot directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let lock_file = Self::acquire_lock(&dir)?;
        Ok(Self {
            dir,
            _lock_file: lock_file,
        })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    fn acquire_lock(dir: &Path) -> Result<File> {
        let lock_file = File::create(dir.join("LOCK"))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| SyncError::Locked)?;

        Ok(lock_file)
    }
}

impl SnapshotStorage for FileSnapshotStorage {
    fn load(&self) -> Result<Option<EngineSnapshot>> {
        let bytes = match fs::read(self.path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        decode_snapshot(&bytes).map(Some)
    }

    fn save(&self, snapshot: &EngineSnapshot) -> Result<()> {
        let bytes = encode_snapshot(snapshot)?;
        let temp = self.dir.join(SNAPSHOT_TEMP_FILE);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp, self.path())?;
        debug!(bytes = bytes.len(), path = %self.path().display(), "snapshot saved");
        Ok(())
    }
}

/// In-memory snapshot slot, encoded the same way as on disk.
#[derive(Default)]
pub struct MemorySnapshotStorage {
    bytes: Mutex<Option<Vec<u8>>>,
}

impl MemorySnapshotStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size of the saved snapshot, if any.
    pub fn saved_len(&self) -> Option<usize> {
        self.bytes.lock().as_ref().map(Vec::len)
    }
}

impl SnapshotStorage for MemorySnapshotStorage {
    fn load(&self) -> Result<Option<EngineSnapshot>> {
        self.bytes
            .lock()
            .as_deref()
            .map(decode_snapshot)
            .transpose()
    }

    fn save(&self, snapshot: &EngineSnapshot) -> Result<()> {
        let bytes = encode_snapshot(snapshot)?;
        *self.bytes.lock() = Some(bytes);
        Ok(())
    }
}
