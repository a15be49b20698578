// SPDX-License-Identifier: Apache-2.0

//! Durable offset state.
//!
//! The store maps each tracking key to its shared offset cell and owns the
//! open handle to the snapshot file. The snapshot is one versioned JSON
//! document rewritten in full at shutdown; there is no incremental journal.
//! Loading is all-or-nothing: a corrupt snapshot is a fatal construction
//! error.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::follower::OffsetCell;

/// Identifies one followed instance. The same physical path may appear under
/// several keys when multiple filters match it, each with its own offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackKey {
    /// Name of the filter this instance was launched under.
    pub filter: String,
    /// Path being followed.
    pub path: PathBuf,
}

impl TrackKey {
    pub fn new(filter: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            filter: filter.into(),
            path: path.into(),
        }
    }
}

/// Current snapshot schema version.
pub(crate) const STATE_VERSION: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    version: u8,
    entries: Vec<PersistedEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    filter: String,
    path: PathBuf,
    offset: u64,
}

/// Durable (filter, path) → offset store.
#[derive(Debug)]
pub(crate) struct StateStore {
    handle: Option<File>,
    offsets: HashMap<TrackKey, OffsetCell>,
}

impl StateStore {
    /// Open or create the snapshot file at `path`, decode any prior
    /// snapshot, and sanitize the loaded entries against the filesystem.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let (handle, offsets) = match std::fs::metadata(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let handle = create_state_file(path)?;
                (handle, HashMap::new())
            }
            Err(e) => return Err(e.into()),
            Ok(meta) => {
                if !meta.is_file() {
                    return Err(Error::InvalidStateFile(path.to_path_buf()));
                }
                let handle = OpenOptions::new().read(true).write(true).open(path)?;
                let offsets = if meta.len() > 0 {
                    decode_snapshot(&handle)?
                } else {
                    HashMap::new()
                };
                (handle, offsets)
            }
        };

        let mut store = Self {
            handle: Some(handle),
            offsets,
        };
        store.sanitize()?;
        Ok(store)
    }

    /// Reconcile loaded entries with what is actually on disk: drop entries
    /// whose files are gone, rewind offsets that point past end-of-file.
    fn sanitize(&mut self) -> Result<()> {
        let mut stale = Vec::new();
        for (key, cell) in &self.offsets {
            match std::fs::metadata(&key.path) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = ?key.path, filter = %key.filter, "dropping state for missing file");
                    stale.push(key.clone());
                }
                Err(e) => return Err(e.into()),
                Ok(meta) => {
                    if meta.len() < cell.get() {
                        // The file shrank since the snapshot was taken;
                        // resuming past its end would be unsafe.
                        debug!(path = ?key.path, offset = cell.get(), len = meta.len(),
                               "persisted offset past end of file, rewinding");
                        cell.reset();
                    }
                }
            }
        }
        for key in stale {
            self.offsets.remove(&key);
        }
        Ok(())
    }

    /// Look up the offset cell for a key, if one exists.
    pub(crate) fn get(&self, key: &TrackKey) -> Option<OffsetCell> {
        self.offsets.get(key).cloned()
    }

    /// Allocate a zero-valued cell for a key, replacing any prior cell.
    pub(crate) fn insert_fresh(&mut self, key: TrackKey) -> OffsetCell {
        let cell = OffsetCell::new(0);
        self.offsets.insert(key, cell.clone());
        cell
    }

    /// Drop a key's cell.
    pub(crate) fn remove(&mut self, key: &TrackKey) {
        self.offsets.remove(key);
    }

    /// Move a cell from one key to another, preserving its value.
    pub(crate) fn move_key(&mut self, old: &TrackKey, new: TrackKey) {
        if let Some(cell) = self.offsets.remove(old) {
            self.offsets.insert(new, cell);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Rewrite the snapshot file with the full current offset map. Caller
    /// must hold the manager lock; this must not race offset mutation.
    pub(crate) fn snapshot(&mut self) -> Result<()> {
        let handle = match self.handle.as_mut() {
            Some(h) => h,
            None => return Ok(()),
        };

        let pos = handle.seek(SeekFrom::Start(0))?;
        if pos != 0 {
            return Err(Error::Persistence(
                "failed to rewind state file before snapshot".to_string(),
            ));
        }
        handle.set_len(0)?;

        let state = PersistedState {
            version: STATE_VERSION,
            entries: self
                .offsets
                .iter()
                .map(|(key, cell)| PersistedEntry {
                    filter: key.filter.clone(),
                    path: key.path.clone(),
                    offset: cell.get(),
                })
                .collect(),
        };
        serde_json::to_writer(&mut *handle, &state)
            .map_err(|e| Error::Persistence(format!("failed to encode state snapshot: {e}")))?;
        handle.flush()?;
        Ok(())
    }

    /// Release the snapshot file handle. Subsequent snapshots and closes
    /// no-op.
    pub(crate) fn close_handle(&mut self) {
        self.handle = None;
    }
}

#[cfg(unix)]
fn create_state_file(path: &Path) -> Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)?)
}

#[cfg(not(unix))]
fn create_state_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?)
}

fn decode_snapshot(handle: &File) -> Result<HashMap<TrackKey, OffsetCell>> {
    let state: PersistedState = serde_json::from_reader(handle)
        .map_err(|e| Error::Persistence(format!("failed to decode state snapshot: {e}")))?;
    if state.version != STATE_VERSION {
        return Err(Error::Persistence(format!(
            "unsupported state snapshot version {}",
            state.version
        )));
    }
    Ok(state
        .entries
        .into_iter()
        .map(|e| {
            (
                TrackKey::new(e.filter, e.path),
                OffsetCell::new(e.offset),
            )
        })
        .collect())
}
