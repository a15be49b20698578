// SPDX-License-Identifier: Apache-2.0

//! Active tailing sessions.
//!
//! A [`Follower`] is bound to one (filter, path) tracking key. It owns an
//! open handle to the file plus the identity and filter name recorded at
//! creation time, and drives a background thread that reads complete lines
//! from the shared offset onward and hands them to the handler.
//!
//! The handle stays open across renames, so a follower keeps draining a file
//! that was rotated away while the manager decides its fate.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::TailConfig;
use crate::error::{Error, Result};
use crate::identity::FileId;

/// Per-line content consumer, passed opaquely from filter to follower.
/// What a handler does with a line is outside this crate's scope.
pub trait LogHandler: Send + Sync {
    /// Called once per complete line, with the follower's current tracked
    /// path and the line contents (newline stripped).
    fn handle_line(&self, path: &Path, line: &str);
}

/// Shared counter of bytes consumed for one tracking key.
///
/// The follower's read loop is the sole writer during normal operation; the
/// manager reads it when taking a persistence snapshot and resets it to zero
/// on truncation or migration.
#[derive(Clone, Debug, Default)]
pub struct OffsetCell(Arc<AtomicU64>);

impl OffsetCell {
    pub fn new(offset: u64) -> Self {
        Self(Arc::new(AtomicU64::new(offset)))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, offset: u64) {
        self.0.store(offset, Ordering::Release);
    }

    pub fn reset(&self) {
        self.set(0);
    }
}

/// An active tailing session for one (filter, path) key.
pub struct Follower {
    filter: String,
    path: Arc<Mutex<PathBuf>>,
    file: File,
    file_id: FileId,
    offset: OffsetCell,
    handler: Arc<dyn LogHandler>,
    poll_interval: Duration,
    max_line_size: usize,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Follower {
    /// Open `path` and bind a follower to it. The file's identity is
    /// recorded at this point; the read loop does not run until `start`.
    pub(crate) fn open(
        filter: impl Into<String>,
        path: impl Into<PathBuf>,
        offset: OffsetCell,
        handler: Arc<dyn LogHandler>,
        config: &TailConfig,
    ) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        let file_id = FileId::from_file(&file)?;

        Ok(Self {
            filter: filter.into(),
            path: Arc::new(Mutex::new(path)),
            file,
            file_id,
            offset,
            handler,
            poll_interval: config.poll_interval,
            max_line_size: config.max_line_size,
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        })
    }

    /// Spawn the read loop. Fails if the handle cannot be cloned or the
    /// thread cannot be spawned; the follower is left stopped either way.
    pub(crate) fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }

        let file = self.file.try_clone().map_err(|e| {
            Error::FollowerStart(self.path(), format!("failed to clone handle: {e}"))
        })?;

        let loop_state = ReadLoop {
            file,
            path: self.path.clone(),
            offset: self.offset.clone(),
            handler: self.handler.clone(),
            poll_interval: self.poll_interval,
            max_line_size: self.max_line_size,
            stop: self.stop.clone(),
        };

        let handle = std::thread::Builder::new()
            .name(format!("tail-{}", self.filter))
            .spawn(move || loop_state.run())
            .map_err(|e| Error::FollowerStart(self.path(), e.to_string()))?;

        self.thread = Some(handle);
        Ok(())
    }

    /// Stop the read loop and release the thread. Safe to call on a
    /// never-started follower, and safe to call twice.
    pub(crate) fn close(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| Error::Teardown(format!("read loop for {:?} panicked", self.path())))?;
        }
        Ok(())
    }

    /// The identity recorded when this follower was created.
    pub(crate) fn file_id(&self) -> FileId {
        self.file_id
    }

    /// The path currently tracked by this follower.
    pub(crate) fn path(&self) -> PathBuf {
        self.path.lock().expect("path lock poisoned").clone()
    }

    /// Point the follower at a new path after a rename. The open handle and
    /// offset are untouched; only the name reported alongside lines changes.
    pub(crate) fn set_path(&self, path: impl Into<PathBuf>) {
        *self.path.lock().expect("path lock poisoned") = path.into();
    }

    /// The shared offset cell for this follower's tracking key.
    #[cfg(test)]
    pub(crate) fn offset(&self) -> OffsetCell {
        self.offset.clone()
    }
}

impl Drop for Follower {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Everything the read loop thread needs, detached from the Follower so the
/// manager can keep mutating the table while the loop runs.
struct ReadLoop {
    file: File,
    path: Arc<Mutex<PathBuf>>,
    offset: OffsetCell,
    handler: Arc<dyn LogHandler>,
    poll_interval: Duration,
    max_line_size: usize,
    stop: Arc<AtomicBool>,
}

impl ReadLoop {
    fn run(mut self) {
        loop {
            if self.stop.load(Ordering::Acquire) {
                // Final pass so lines written just before close are not lost.
                if let Err(e) = self.read_pass() {
                    debug!("final read pass failed: {}", e);
                }
                return;
            }

            if let Err(e) = self.read_pass() {
                warn!(path = ?self.current_path(), "read pass failed: {}", e);
            }

            std::thread::sleep(self.poll_interval);
        }
    }

    fn current_path(&self) -> PathBuf {
        self.path.lock().expect("path lock poisoned").clone()
    }

    /// One pass over the file: detect in-place truncation, then consume any
    /// complete lines past the current offset.
    fn read_pass(&mut self) -> std::io::Result<()> {
        let len = self.file.metadata()?.len();
        let mut pos = self.offset.get();

        if len < pos {
            // The file shrank under us; resuming past EOF is unsafe.
            debug!(path = ?self.current_path(), offset = pos, len, "file truncated, rewinding");
            self.offset.reset();
            pos = 0;
        }
        if len == pos {
            return Ok(());
        }

        self.file.seek(SeekFrom::Start(pos))?;
        let mut reader = BufReader::new(&self.file);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 {
                break;
            }
            if buf.last() != Some(&b'\n') {
                // Partial line; wait for the writer to finish it.
                break;
            }

            let line = trim_line(&buf, self.max_line_size);
            self.handler.handle_line(&self.current_path(), &line);

            pos += n as u64;
            self.offset.set(pos);
        }

        Ok(())
    }
}

/// Strip the trailing newline (and carriage return) and cap the line length.
fn trim_line(raw: &[u8], max_line_size: usize) -> String {
    let mut end = raw.len();
    if end > 0 && raw[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && raw[end - 1] == b'\r' {
        end -= 1;
    }
    let line = String::from_utf8_lossy(&raw[..end]);
    if line.len() > max_line_size {
        line.chars().take(max_line_size).collect()
    } else {
        line.into_owned()
    }
}
