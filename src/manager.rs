// SPDX-License-Identifier: Apache-2.0

//! The filter manager facade.
//!
//! One coarse lock guards the filter registry, the follower table, the
//! offset map, and the durable-store handle together. Every public entry
//! point acquires it for its full duration, so operations observe a total
//! order equal to lock-acquisition order. The one exception is the recursive
//! directory walk of [`FilterManager::rename_follower`], which runs outside
//! the critical section and revalidates the table before mutating it.
//!
//! Callers (an external directory watcher, startup scan code) drive the
//! manager through `new_follower` / `load_file` / `remove_follower` /
//! `rename_follower`; the manager decides whether each notification is a
//! fresh file, a rotation of a file it already follows, or a disappearance.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::config::TailConfig;
use crate::error::{Error, Result};
use crate::filter::{match_base, Filter, FilterSet};
use crate::follower::{Follower, LogHandler};
use crate::identity::FileId;
use crate::state::{StateStore, TrackKey};

/// How to resolve the offset cell when launching a follower.
#[derive(Clone, Copy, PartialEq, Eq)]
enum CellMode {
    /// Always allocate a zero-valued cell (new file, or migration).
    Fresh,
    /// Reuse a persisted cell if one exists (startup scan / rescan).
    Reuse,
}

/// Everything the manager lock guards.
struct Inner {
    filters: FilterSet,
    followers: HashMap<TrackKey, Follower>,
    store: StateStore,
}

/// Orchestrates filters, followers, and durable offset state.
pub struct FilterManager {
    inner: Mutex<Inner>,
    config: TailConfig,
}

impl FilterManager {
    /// Build a manager: open (or create) the state file, decode any prior
    /// snapshot, and sanitize it against the filesystem.
    pub fn new(config: TailConfig) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        let store = StateStore::open(&config.state_path)?;
        info!(state_path = ?config.state_path, recovered = store.len(), "filter manager ready");

        Ok(Self {
            inner: Mutex::new(Inner {
                filters: FilterSet::default(),
                followers: HashMap::new(),
                store,
            }),
            config,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| Error::Persistence(format!("manager lock poisoned: {e}")))
    }

    /// Register a watch rule. The directory is lexically cleaned before
    /// storage; the name must be unique and becomes the filter's stable
    /// identity. Filters only grow during a manager's lifetime.
    pub fn add_filter(
        &self,
        name: impl Into<String>,
        directory: impl AsRef<Path>,
        patterns: Vec<String>,
        handler: Arc<dyn LogHandler>,
    ) -> Result<()> {
        let filter = Filter::new(name, directory, patterns, handler);
        debug!(filter = %filter.name(), directory = ?filter.directory(), "adding filter");
        self.lock()?.filters.add(filter)
    }

    /// A new file appeared: start following it with a fresh offset, unless
    /// the notification turns out to be a rename of a file already followed.
    pub fn new_follower(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut inner = self.lock()?;
        inner.launch_followers(path.as_ref(), CellMode::Fresh, &self.config)
    }

    /// An existing file was discovered (startup scan or rescan): follow it,
    /// resuming from a persisted offset when one survives sanitation.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut inner = self.lock()?;
        inner.launch_followers(path.as_ref(), CellMode::Reuse, &self.config)
    }

    /// A file was deleted: tear down every follower at that path, across all
    /// filters.
    pub fn remove_follower(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut inner = self.lock()?;
        inner.remove_all_at(path.as_ref())
    }

    /// A followed path no longer resolves under its old name and the watcher
    /// did not supply a new one. Recover the follower's identity and search
    /// the watched directory trees for the file's new location.
    ///
    /// The walk runs outside the manager lock; state captured beforehand is
    /// revalidated after re-acquisition, and a concurrent mutation that
    /// invalidates it turns the resolution into a no-op.
    pub fn rename_follower(&self, old_path: impl AsRef<Path>) -> Result<()> {
        let old_path = old_path.as_ref();

        // Capture what the walk needs, then release the lock.
        let (id, first_key, searches) = {
            let inner = self.lock()?;

            // The first follower at the old path (registry order) is the one
            // the resolution applies to, matching intake ordering.
            let first_key = inner
                .filters
                .iter()
                .map(|f| TrackKey::new(f.name(), old_path))
                .find(|k| inner.followers.contains_key(k));
            let first_key = match first_key {
                Some(k) => k,
                None => return Ok(()),
            };

            let id = match inner.followers.get(&first_key).map(|f| f.file_id()) {
                Some(id) => id,
                None => return Ok(()),
            };

            let searches: Vec<(String, PathBuf, Vec<String>)> = inner
                .filters
                .iter()
                .map(|f| {
                    (
                        f.name().to_string(),
                        f.directory().to_path_buf(),
                        f.patterns().to_vec(),
                    )
                })
                .collect();

            (id, first_key, searches)
        };

        // Walk every filter's tree for the identity, lock not held.
        let mut discovered: Option<(String, PathBuf)> = None;
        for (name, directory, patterns) in &searches {
            match find_by_identity(directory, patterns, id) {
                Ok(Some(new_path)) => {
                    discovered = Some((name.clone(), new_path));
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    // The resolution is aborted; the affected follower is
                    // torn down before the error propagates.
                    warn!(path = ?old_path, "identity search failed: {}", e);
                    let mut inner = self.lock()?;
                    if inner.followers.get(&first_key).map(|f| f.file_id()) == Some(id) {
                        if let Some(mut follower) = inner.followers.remove(&first_key) {
                            inner.store.remove(&first_key);
                            let _ = follower.close();
                        }
                    }
                    return Err(e);
                }
            }
        }

        let mut inner = self.lock()?;

        // Revalidate: the follower must still be where we left it.
        if inner.followers.get(&first_key).map(|f| f.file_id()) != Some(id) {
            debug!(path = ?old_path, "follower table changed during identity search, skipping");
            return Ok(());
        }

        match discovered {
            None => {
                // Gone from all watched scope.
                debug!(path = ?old_path, %id, "identity not found under any filter, removing");
                inner.remove_all_at(old_path)
            }
            Some((_, ref new_path)) if new_path == old_path => Ok(()),
            Some((filter_name, new_path)) => {
                if filter_name == first_key.filter {
                    // Pure rekey: same filter, new name. The follower, its
                    // handle, and its offset are untouched.
                    info!(from = ?old_path, to = ?new_path, filter = %filter_name, "follower renamed");
                    if let Some(follower) = inner.followers.remove(&first_key) {
                        follower.set_path(&new_path);
                        let new_key = TrackKey::new(&filter_name, &new_path);
                        inner.store.move_key(&first_key, new_key.clone());
                        inner.followers.insert(new_key, follower);
                    }
                    Ok(())
                } else {
                    // The file now satisfies a different filter: a new
                    // logical stream. Old follower and offset are discarded.
                    info!(from = ?old_path, to = ?new_path, filter = %filter_name,
                          "follower migrated to a different filter");
                    if let Some(mut follower) = inner.followers.remove(&first_key) {
                        inner.store.remove(&first_key);
                        follower.close()?;
                    }
                    let handler = match inner.filters.get(&filter_name) {
                        Some(f) => f.handler(),
                        None => return Ok(()),
                    };
                    let new_key = TrackKey::new(&filter_name, &new_path);
                    inner.add_follower(new_key, CellMode::Fresh, handler, &self.config)
                }
            }
        }
    }

    /// Graceful shutdown: close every follower (collecting failures), clear
    /// the tables, write the final snapshot, release the store handle. Safe
    /// to call more than once.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock()?;
        let mut errs = Vec::new();

        for (key, mut follower) in inner.followers.drain() {
            debug!(filter = %key.filter, path = ?key.path, "closing follower");
            if let Err(e) = follower.close() {
                errs.push(e);
            }
        }
        inner.filters.clear();

        if let Err(e) = inner.store.snapshot() {
            errs.push(e);
        }
        inner.store.close_handle();

        match Error::merge(errs) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of active follows. A file matched by several filters counts
    /// once per match, not once per physical file.
    pub fn followed(&self) -> usize {
        self.lock().map(|i| i.followers.len()).unwrap_or(0)
    }

    /// Number of registered filters.
    pub fn filters(&self) -> usize {
        self.lock().map(|i| i.filters.len()).unwrap_or(0)
    }
}

impl Inner {
    /// Intake for both `new_follower` and `load_file`: detect renames first,
    /// then launch a follower for every filter the path satisfies.
    fn launch_followers(
        &mut self,
        path: &Path,
        mode: CellMode,
        config: &TailConfig,
    ) -> Result<()> {
        let id = FileId::from_path(path)?;

        if self.check_rename(path, id)? {
            return Ok(());
        }

        let matched: Vec<(String, Arc<dyn LogHandler>)> = self
            .filters
            .iter()
            .filter(|f| f.matches(path))
            .map(|f| (f.name().to_string(), f.handler()))
            .collect();

        for (name, handler) in matched {
            let key = TrackKey::new(&name, path);
            self.add_follower(key, mode, handler, config)?;
        }
        Ok(())
    }

    /// Create, start, and register a follower for `key`, resolving its
    /// offset cell per `mode`. A live follower already at the key with the
    /// same identity is a duplicate-creation condition; one with a different
    /// identity is a stale entry for a replaced file and is torn down first.
    fn add_follower(
        &mut self,
        key: TrackKey,
        mode: CellMode,
        handler: Arc<dyn LogHandler>,
        config: &TailConfig,
    ) -> Result<()> {
        let id = FileId::from_path(&key.path)?;

        if let Some(existing) = self.followers.get(&key) {
            if existing.file_id() == id {
                return Err(Error::DuplicateFollower {
                    filter: key.filter,
                    path: key.path,
                });
            }
            // Same key, different file underneath: a new logical stream.
            debug!(filter = %key.filter, path = ?key.path, "replacing stale follower");
            if let Some(mut stale) = self.followers.remove(&key) {
                self.store.remove(&key);
                stale.close()?;
            }
        }

        let cell = match mode {
            CellMode::Fresh => self.store.insert_fresh(key.clone()),
            CellMode::Reuse => match self.store.get(&key) {
                Some(cell) => cell,
                None => self.store.insert_fresh(key.clone()),
            },
        };

        let mut follower = Follower::open(&key.filter, &key.path, cell, handler, config)?;
        if let Err(e) = follower.start() {
            let _ = follower.close();
            return Err(e);
        }

        debug!(filter = %key.filter, path = ?key.path, id = %follower.file_id(), "follower started");
        self.followers.insert(key, follower);
        Ok(())
    }

    /// Rename detection against a notified path and its identity.
    ///
    /// Scans the follower table for entries whose recorded identity matches.
    /// Each match is either a pure in-place rename (the new name still
    /// satisfies the follower's filter: rekey, keep everything) or a
    /// migration away (close and discard). Returns true when the
    /// notification was fully handled here and intake must not proceed.
    fn check_rename(&mut self, path: &Path, id: FileId) -> Result<bool> {
        let matching: Vec<TrackKey> = self
            .followers
            .iter()
            .filter(|(_, f)| f.file_id() == id)
            .map(|(k, _)| k.clone())
            .collect();

        if matching.is_empty() {
            return Ok(false);
        }

        for key in matching {
            let still_matches = self
                .filters
                .get(&key.filter)
                .map(|f| f.matches(path))
                .unwrap_or(false);

            if still_matches {
                if let Some(follower) = self.followers.remove(&key) {
                    debug!(from = ?key.path, to = ?path, filter = %key.filter, "rename detected, rekeying");
                    follower.set_path(path);
                    let new_key = TrackKey::new(&key.filter, path);
                    self.store.move_key(&key, new_key.clone());
                    self.followers.insert(new_key, follower);
                }
            } else {
                // Renamed out of the filter's scope. If the new name matches
                // some other filter, its own notification drives that intake.
                debug!(from = ?key.path, to = ?path, filter = %key.filter,
                       "rename moved file out of filter scope, closing");
                if let Some(mut follower) = self.followers.remove(&key) {
                    self.store.remove(&key);
                    follower.close()?;
                }
            }
        }

        Ok(true)
    }

    /// Tear down every follower keyed at `path`, across all filters.
    fn remove_all_at(&mut self, path: &Path) -> Result<()> {
        let keys: Vec<TrackKey> = self
            .filters
            .iter()
            .map(|f| TrackKey::new(f.name(), path))
            .collect();

        for key in keys {
            if let Some(mut follower) = self.followers.remove(&key) {
                debug!(filter = %key.filter, path = ?path, "removing follower");
                self.store.remove(&key);
                follower.close()?;
            }
        }
        Ok(())
    }
}

/// Recursively search `dir` for a regular file whose base name matches one
/// of `patterns` and whose identity equals `id`. First hit wins; two files
/// can never legitimately share an identity at the same time.
fn find_by_identity(dir: &Path, patterns: &[String], id: FileId) -> Result<Option<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        // A watch directory that does not exist yet is not an error.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();

        if file_type.is_dir() {
            if let Some(found) = find_by_identity(&path, patterns, id)? {
                return Ok(Some(found));
            }
            continue;
        }
        if !file_type.is_file() {
            continue;
        }

        let base = match path.file_name().and_then(|n| n.to_str()) {
            Some(base) => base,
            None => continue,
        };
        if !match_base(patterns, base) {
            continue;
        }

        match FileId::from_path(&path) {
            Ok(fid) if fid == id => return Ok(Some(path)),
            Ok(_) => {}
            // Deleted between the directory listing and the stat: skip.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(None)
}
