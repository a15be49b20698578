// SPDX-License-Identifier: Apache-2.0

//! Orchestration core for tailing log files.
//!
//! This crate tracks a set of filesystem watch rules ("filters"), keeps one
//! active tailing session ("follower") per file matching each rule, persists
//! per-file read offsets across restarts, and tells genuine rotation/rename
//! events apart from deletion or truncation so log data is neither
//! duplicated nor silently dropped.
//!
//! The entry point is [`FilterManager`]: register filters with
//! [`FilterManager::add_filter`], then drive it from an external directory
//! watcher via `new_follower` / `load_file` / `remove_follower` /
//! `rename_follower`, and `close` it on shutdown to persist the final offset
//! snapshot.
//!
//! Features:
//! - Inode-based file identity for tracking files across renames
//! - Whole-file versioned JSON offset snapshots, sanitized at startup
//! - Per-(filter, path) offset cells: a file matched by several filters is
//!   followed once per match, each with an independent offset

pub mod config;
pub mod error;
pub mod filter;
pub mod follower;
pub mod identity;
pub mod manager;
pub mod state;

pub use config::TailConfig;
pub use error::{Error, Result};
pub use follower::{LogHandler, OffsetCell};
pub use identity::FileId;
pub use manager::FilterManager;
pub use state::TrackKey;
