//! Byte-addressed snapshot persistence: one file per session.
//!
//! Layout: `<root>/<session_id>.snapshot`, content is the full document
//! encoded as one update. There is no index; restoration looks sessions up
//! by id on demand. Writes go through a `.tmp` sibling and a rename, but
//! durability is deliberately weak: a torn or corrupted snapshot is treated
//! as absent by the restore path (the session simply starts fresh).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const SNAPSHOT_EXT: &str = "snapshot";

/// Store errors. All of these are recoverable: the hub logs them and keeps
/// the session alive; the next snapshot tick retries.
#[derive(Debug)]
pub enum SnapshotError {
    /// Session id contains characters that cannot form a file name.
    InvalidSessionId(String),
    Io(io::Error),
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotError::InvalidSessionId(id) => write!(f, "invalid session id: {id:?}"),
            SnapshotError::Io(e) => write!(f, "snapshot I/O error: {e}"),
        }
    }
}

impl std::error::Error for SnapshotError {}

impl From<io::Error> for SnapshotError {
    fn from(e: io::Error) -> Self {
        SnapshotError::Io(e)
    }
}

/// Directory-backed snapshot store.
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    /// Open the store, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Session ids double as file names; anything else is rejected before
    /// it can touch the filesystem.
    pub fn valid_session_id(id: &str) -> bool {
        !id.is_empty()
            && id.len() <= 128
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            && !id.starts_with('.')
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist snapshot bytes for a session, replacing any previous file.
    pub fn put(&self, session_id: &str, bytes: &[u8]) -> Result<(), SnapshotError> {
        let path = self.path_for(session_id)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Stored bytes for a session, `None` when no snapshot exists. Whether
    /// the bytes still decode is the caller's problem: a failed restore
    /// means "absent, start fresh".
    pub fn get(&self, session_id: &str) -> Result<Option<Vec<u8>>, SnapshotError> {
        let path = self.path_for(session_id)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a session's snapshot. Returns whether one existed.
    pub fn remove(&self, session_id: &str) -> Result<bool, SnapshotError> {
        let path = self.path_for(session_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Session ids with a stored snapshot, sorted.
    pub fn list(&self) -> Result<Vec<String>, SnapshotError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if Self::valid_session_id(stem) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf, SnapshotError> {
        if !Self::valid_session_id(session_id) {
            return Err(SnapshotError::InvalidSessionId(session_id.to_string()));
        }
        Ok(self.root.join(format!("{session_id}.{SNAPSHOT_EXT}")))
    }
}
