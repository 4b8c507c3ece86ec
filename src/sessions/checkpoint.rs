//! On-disk session checkpoints.
//!
//! File layout: magic, version byte, payload length (u64 LE), MessagePack
//! payload, CRC32 of the payload (u32 LE).

use super::types::Checkpoint;
use crate::error::{Result, SyncError};
use crate::types::{SessionId, Timestamp};
use fs2::FileExt;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const CHECKPOINT_MAGIC: &[u8; 4] = b"CKP\0";

const CHECKPOINT_VERSION: u8 = 1;

const CHECKPOINT_EXT: &str = "ckp";

/// Directory of per-session checkpoint files, held under an exclusive lock.
pub struct CheckpointStore {
    path: PathBuf,
    _lock: File,
}

impl CheckpointStore {
    /// Open (creating if needed) a checkpoint directory.
    ///
    /// Fails with [`SyncError::Locked`] if another process holds it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let lock = File::create(path.join("LOCK"))?;
        lock.try_lock_exclusive().map_err(|_| SyncError::Locked)?;

        Ok(Self { path, _lock: lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_path(&self, session: SessionId) -> PathBuf {
        self.path.join(format!("{}.{}", session.0, CHECKPOINT_EXT))
    }

    /// Write a checkpoint, replacing any previous one for the session.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let payload = rmp_serde::to_vec_named(checkpoint)?;

        let final_path = self.file_path(checkpoint.session);
        let tmp_path = final_path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(CHECKPOINT_MAGIC)?;
            file.write_all(&[CHECKPOINT_VERSION])?;
            file.write_all(&(payload.len() as u64).to_le_bytes())?;
            file.write_all(&payload)?;
            file.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;

        debug!(session = %checkpoint.session, cursors = checkpoint.cursors.len(), "checkpoint saved");
        Ok(())
    }

    /// Read a session's checkpoint, if one exists.
    pub fn load(&self, session: SessionId) -> Result<Option<Checkpoint>> {
        let path = self.file_path(session);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_file(&path).map(Some)
    }

    fn read_file(path: &Path) -> Result<Checkpoint> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != CHECKPOINT_MAGIC {
            return Err(SyncError::Corruption(format!(
                "{}: bad checkpoint magic",
                path.display()
            )));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != CHECKPOINT_VERSION {
            return Err(SyncError::Corruption(format!(
                "{}: unsupported checkpoint version {}",
                path.display(),
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let mut payload = vec![0u8; u64::from_le_bytes(len_bytes) as usize];
        file.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&payload);
        if expected != got {
            return Err(SyncError::ChecksumMismatch { expected, got });
        }

        Ok(rmp_serde::from_slice(&payload)?)
    }

    /// Remove a session's checkpoint. Returns whether one existed.
    pub fn purge(&self, session: SessionId) -> Result<bool> {
        let path = self.file_path(session);
        if path.exists() {
            fs::remove_file(&path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Every stored checkpoint. Unreadable files are skipped.
    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CHECKPOINT_EXT) {
                continue;
            }
            match Self::read_file(&path) {
                Ok(checkpoint) => out.push(checkpoint),
                Err(e) => debug!(file = %path.display(), error = %e, "skipping checkpoint"),
            }
        }
        out.sort_by_key(|c| c.session);
        Ok(out)
    }

    /// Delete checkpoints older than `grace`, and any that cannot be read.
    pub fn purge_expired(&self, now: Timestamp, grace: Duration) -> Result<Vec<SessionId>> {
        let mut purged = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CHECKPOINT_EXT) {
                continue;
            }
            match Self::read_file(&path) {
                Ok(checkpoint) if checkpoint.expired(now, grace) => {
                    fs::remove_file(&path)?;
                    purged.push(checkpoint.session);
                }
                Ok(_) => {}
                Err(_) => fs::remove_file(&path)?,
            }
        }
        purged.sort();
        Ok(purged)
    }
}
