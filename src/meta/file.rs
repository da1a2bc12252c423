//! Snapshot-over-memory backend.
//!
//! Every successful mutation rewrites the whole store to disk. This costs
//! O(total stored size) per write.

use super::{Meta, MemoryMeta, MetaSnapshot};
use crate::error::{ChangeError, Result};
use crate::types::{Change, ChangeInput, ChangeSearch};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the snapshot file.
const SNAPSHOT_MAGIC: &[u8; 4] = b"CFS\0";

/// Current snapshot format version.
const SNAPSHOT_VERSION: u8 = 1;

/// File-persisted implementation of [`Meta`].
pub struct FileMeta {
    /// Path to the snapshot document.
    path: PathBuf,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Live state.
    inner: MemoryMeta,

    /// Serializes mutate-then-persist so snapshots land in order.
    write_lock: Mutex<()>,
}

impl FileMeta {
    /// Open a snapshot file, creating an empty one if allowed.
    pub fn open(path: impl AsRef<Path>, create_if_missing: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() && !create_if_missing {
            return Err(ChangeError::NotInitialized);
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let lock_file = Self::acquire_lock(&path)?;

        let inner = if path.exists() {
            let mut bytes = Vec::new();
            File::open(&path)?.read_to_end(&mut bytes)?;
            let snapshot = Self::decode(&bytes)?;
            tracing::info!(
                "Loaded change snapshot from {:?} ({} changes, {} registrations)",
                path,
                snapshot.changes.len(),
                snapshot.registrations.len()
            );
            MemoryMeta::from_snapshot(snapshot)
        } else {
            tracing::info!("Creating change snapshot at {:?}", path);
            MemoryMeta::new()
        };

        let meta = Self {
            path,
            _lock_file: lock_file,
            inner,
            write_lock: Mutex::new(()),
        };
        meta.persist()?;
        Ok(meta)
    }

    /// Get the snapshot path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Encode the current store as a snapshot document.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Self::encode(&self.inner.snapshot())
    }

    /// Replace the current store with a snapshot document and persist it.
    pub fn deserialize(&self, bytes: &[u8]) -> Result<()> {
        let snapshot = Self::decode(bytes)?;
        self.mutate(|m| {
            m.restore(snapshot);
            Ok(())
        })
    }

    /// Write the current store to disk.
    pub fn persist(&self) -> Result<()> {
        let _lock = self.write_lock.lock();
        self.write_snapshot()
    }

    /// Run a mutation and, if it succeeded, rewrite the snapshot.
    ///
    /// If the snapshot cannot be written the mutation is rolled back, so
    /// memory never holds state that is not on disk.
    fn mutate<T>(&self, op: impl FnOnce(&MemoryMeta) -> Result<T>) -> Result<T> {
        let _lock = self.write_lock.lock();
        let previous = self.inner.snapshot();

        let value = op(&self.inner)?;
        if let Err(e) = self.write_snapshot() {
            tracing::error!("Failed to write change snapshot to {:?}, rolling back: {}", self.path, e);
            self.inner.restore(previous);
            return Err(e);
        }
        Ok(value)
    }

    /// Caller must hold `write_lock`.
    fn write_snapshot(&self) -> Result<()> {
        let encoded = self.serialize()?;

        let tmp_path = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;

        tracing::trace!("Wrote change snapshot ({} bytes) to {:?}", encoded.len(), self.path);
        Ok(())
    }

    fn encode(snapshot: &MetaSnapshot) -> Result<Vec<u8>> {
        let payload = rmp_serde::to_vec(snapshot)?;

        let mut out = Vec::with_capacity(payload.len() + 17);
        out.extend_from_slice(SNAPSHOT_MAGIC);
        out.push(SNAPSHOT_VERSION);
        out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    fn decode(bytes: &[u8]) -> Result<MetaSnapshot> {
        let mut reader = bytes;

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(ChangeError::InvalidFormat("Invalid snapshot magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != SNAPSHOT_VERSION {
            return Err(ChangeError::InvalidFormat(format!(
                "Unsupported snapshot version: {}",
                version[0]
            )));
        }

        let mut crc_bytes = [0u8; 4];
        reader.read_exact(&mut crc_bytes)?;
        let expected = u32::from_le_bytes(crc_bytes);

        let mut len_bytes = [0u8; 8];
        reader.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;

        if reader.len() < len {
            return Err(ChangeError::InvalidFormat(format!(
                "Truncated snapshot: expected {} payload bytes, found {}",
                len,
                reader.len()
            )));
        }
        let payload = &reader[..len];

        let got = crc32fast::hash(payload);
        if got != expected {
            return Err(ChangeError::ChecksumMismatch { expected, got });
        }

        Ok(rmp_serde::from_slice(payload)?)
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.with_extension("lock");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| ChangeError::Locked)?;

        Ok(lock_file)
    }
}

impl Meta for FileMeta {
    fn change_create(&self, input: ChangeInput) -> Result<Change> {
        self.mutate(|m| m.change_create(input))
    }

    fn change_read(&self, id: &str) -> Result<Change> {
        self.inner.change_read(id)
    }

    fn changes_read(&self, search: &ChangeSearch) -> Result<Vec<Change>> {
        self.inner.changes_read(search)
    }

    fn changes_delete(&self, ids: &[String]) -> Result<()> {
        self.mutate(|m| m.changes_delete(ids))
    }

    fn registration_upsert(&self, id: &str) -> Result<()> {
        self.mutate(|m| m.registration_upsert(id))
    }

    fn registration_delete(&self, id: &str) -> Result<()> {
        self.mutate(|m| m.registration_delete(id))
    }

    fn registrations_read(&self) -> Result<Vec<String>> {
        self.inner.registrations_read()
    }

    fn registration_change_upsert(&self, change_id: &str) -> Result<()> {
        self.mutate(|m| m.registration_change_upsert(change_id))
    }

    fn registration_changes_read(&self, registration_id: &str) -> Result<Vec<String>> {
        self.inner.registration_changes_read(registration_id)
    }

    fn registration_change_acknowledge(
        &self,
        registration_id: &str,
        change_ids: &[String],
    ) -> Result<Vec<String>> {
        self.mutate(|m| m.registration_change_acknowledge(registration_id, change_ids))
    }
}
