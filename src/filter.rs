// SPDX-License-Identifier: Apache-2.0

//! Watch rules and glob matching.
//!
//! A filter names a directory plus a set of glob patterns applied to file
//! base names. Registered filters never change and are never removed; the
//! registry only grows during a manager's lifetime. A filter's name is its
//! stable identity, persisted in every tracking key.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::follower::LogHandler;

/// A registered watch rule.
pub(crate) struct Filter {
    name: String,
    directory: PathBuf,
    patterns: Vec<String>,
    handler: Arc<dyn LogHandler>,
}

impl Filter {
    pub(crate) fn new(
        name: impl Into<String>,
        directory: impl AsRef<Path>,
        patterns: Vec<String>,
        handler: Arc<dyn LogHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            directory: clean_path(directory.as_ref()),
            patterns,
            handler,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn directory(&self) -> &Path {
        &self.directory
    }

    pub(crate) fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub(crate) fn handler(&self) -> Arc<dyn LogHandler> {
        self.handler.clone()
    }

    /// True if `path` sits directly in this filter's directory and its base
    /// name matches one of the patterns.
    pub(crate) fn matches(&self, path: &Path) -> bool {
        let dir = match path.parent() {
            Some(d) => clean_path(d),
            None => return false,
        };
        if dir != self.directory {
            return false;
        }
        match path.file_name().and_then(|n| n.to_str()) {
            Some(base) => match_base(&self.patterns, base),
            None => false,
        }
    }
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("name", &self.name)
            .field("directory", &self.directory)
            .field("patterns", &self.patterns)
            .finish()
    }
}

/// The ordered filter registry. Add-only; names are unique.
#[derive(Default)]
pub(crate) struct FilterSet {
    filters: Vec<Filter>,
}

impl FilterSet {
    pub(crate) fn add(&mut self, filter: Filter) -> Result<()> {
        if self.get(filter.name()).is_some() {
            return Err(Error::DuplicateFilter(filter.name().to_string()));
        }
        self.filters.push(filter);
        Ok(())
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Filter> {
        self.filters.iter().find(|f| f.name() == name)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Filter> {
        self.filters.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.filters.len()
    }

    pub(crate) fn clear(&mut self) {
        self.filters.clear();
    }
}

/// True iff any pattern glob-matches `base`. Invalid pattern syntax is a
/// non-match, not an error.
pub(crate) fn match_base(patterns: &[String], base: &str) -> bool {
    patterns.iter().any(|p| match glob::Pattern::new(p) {
        Ok(pattern) => pattern.matches(base),
        Err(_) => false,
    })
}

/// Lexically clean a path: drop `.` components and fold `..` into its parent
/// where one exists. Does not touch the filesystem.
pub(crate) fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let can_pop = matches!(out.components().next_back(), Some(Component::Normal(_)));
                if can_pop {
                    out.pop();
                } else {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}
