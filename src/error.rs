// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state decode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("state file path is not a regular file: {0}")]
    InvalidStateFile(PathBuf),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("filter {0:?} is already registered")]
    DuplicateFilter(String),

    #[error("duplicate follower for filter {filter:?} at {path:?}")]
    DuplicateFollower { filter: String, path: PathBuf },

    #[error("follower for {0:?} failed to start: {1}")]
    FollowerStart(PathBuf, String),

    #[error("teardown failures: {0}")]
    Teardown(String),
}

impl Error {
    /// Merge a batch of errors into one combined error. Used during bulk
    /// teardown so every follower gets a chance to close before we report.
    pub(crate) fn merge(errs: Vec<Error>) -> Option<Error> {
        match errs.len() {
            0 => None,
            1 => errs.into_iter().next(),
            _ => {
                let joined = errs
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                Some(Error::Teardown(joined))
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
