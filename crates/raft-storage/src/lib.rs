//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: used by raft-peer to save and restore raft-core's PersistentState
//! what: Storage trait, blob codec, FileStorage implementation, InMemoryStorage for testing

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use raft_core::PersistentState;
use thiserror::Error;

/// errors raised while saving or loading raft state
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("raft state blob is malformed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// trait for durable storage of raft state
///
/// the whole of term, vote and log is saved as one opaque blob, so a reader
/// never sees a term without its matching vote and log. implementations use
/// interior mutability: one handle is shared between the peer and whoever
/// restarts it.
///
/// this abstraction allows the same code to work with:
/// - real filesystem (native)
/// - in-memory (testing)
pub trait Storage: Send + Sync {
    /// replace the saved blob; must be durable when this returns Ok
    fn save_raft_state(&self, data: &[u8]) -> Result<(), StorageError>;

    /// the last saved blob, or None if nothing was ever saved
    fn read_raft_state(&self) -> Result<Option<Vec<u8>>, StorageError>;

    /// size in bytes of the saved blob (0 when absent)
    fn raft_state_size(&self) -> Result<u64, StorageError>;

    /// forget all saved state
    fn clear(&self) -> Result<(), StorageError>;
}

// -- codec --

/// encode raft state into the blob handed to `Storage::save_raft_state`
pub fn encode_state(state: &PersistentState) -> Result<Vec<u8>, StorageError> {
    Ok(serde_json::to_vec(state)?)
}

/// decode a blob produced by `encode_state`
pub fn decode_state(data: &[u8]) -> Result<PersistentState, StorageError> {
    Ok(serde_json::from_slice(data)?)
}

/// read and decode the saved state; a missing blob yields the initial state
pub fn load_state(storage: &dyn Storage) -> Result<PersistentState, StorageError> {
    match storage.read_raft_state()? {
        Some(data) => decode_state(&data),
        None => Ok(PersistentState::default()),
    }
}

/// encode and save in one step
pub fn save_state(storage: &dyn Storage, state: &PersistentState) -> Result<(), StorageError> {
    storage.save_raft_state(&encode_state(state)?)
}

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// stores raft state in a directory as raft_state.json, replaced atomically
/// on every save
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
}

impl FileStorage {
    /// create a new filestorage at the given directory
    /// creates the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// get the path to the state file
    fn state_path(&self) -> PathBuf {
        self.dir.join("raft_state.json")
    }

    fn temp_path(&self) -> PathBuf {
        self.dir.join("raft_state.tmp")
    }
}

impl Storage for FileStorage {
    fn save_raft_state(&self, data: &[u8]) -> Result<(), StorageError> {
        // atomic write: write to temp file then rename
        let temp_path = self.temp_path();
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.state_path())?;
        // the rename itself lives in the directory entry
        sync_dir(&self.dir)?;
        Ok(())
    }

    fn read_raft_state(&self) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.state_path()) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn raft_state_size(&self) -> Result<u64, StorageError> {
        match fs::metadata(self.state_path()) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn clear(&self) -> Result<(), StorageError> {
        for path in [self.state_path(), self.temp_path()] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

// directories cannot be opened for syncing on windows
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

// -- in-memory storage implementation --

/// in-memory storage for testing
///
/// stores the blob in memory, no persistence across process restarts. a
/// restarted peer in the same process is handed `copy()` of its old storage
#[derive(Default)]
pub struct InMemoryStorage {
    raft_state: Mutex<Option<Vec<u8>>>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// an independent storage holding the same bytes
    pub fn copy(&self) -> Self {
        Self {
            raft_state: Mutex::new(self.state().clone()),
        }
    }

    fn state(&self) -> MutexGuard<'_, Option<Vec<u8>>> {
        self.raft_state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Storage for InMemoryStorage {
    fn save_raft_state(&self, data: &[u8]) -> Result<(), StorageError> {
        *self.state() = Some(data.to_vec());
        Ok(())
    }

    fn read_raft_state(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.state().clone())
    }

    fn raft_state_size(&self) -> Result<u64, StorageError> {
        Ok(self.state().as_ref().map_or(0, |d| d.len() as u64))
    }

    fn clear(&self) -> Result<(), StorageError> {
        *self.state() = None;
        Ok(())
    }
}
