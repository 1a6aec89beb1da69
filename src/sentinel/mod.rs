//! Durable "already bootstrapped" marker
//!
//! The sentinel is a plain file. Its existence is the whole state: contents
//! are irrelevant and the file is never updated once written.

#[cfg(test)]
use mockall::automock;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::layout::SystemLayout;
use crate::{Error, Result};

/// Persistent marker guarding the one-time bootstrap
#[cfg_attr(test, automock)]
pub trait SentinelGuard: Send + Sync {
    /// Whether a previous bootstrap completed
    fn exists(&self) -> bool;

    /// Record a completed bootstrap
    fn create(&self) -> Result<()>;
}

/// Sentinel backed by a marker file
#[derive(Clone, Debug)]
pub struct FileSentinel {
    path: PathBuf,
}

impl FileSentinel {
    /// Sentinel at an explicit path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Sentinel at the well-known location of a layout
    pub fn at(layout: &SystemLayout) -> Self {
        Self::new(layout.sentinel())
    }

    /// Marker file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SentinelGuard for FileSentinel {
    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn create(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::sentinel(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        std::fs::write(&self.path, "").map_err(|e| {
            Error::sentinel(format!("cannot write {}: {}", self.path.display(), e))
        })?;
        debug!(path = %self.path.display(), "Sentinel created");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn story_fresh_machine_has_no_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let sentinel = FileSentinel::at(&SystemLayout::new(dir.path()));
        assert!(!sentinel.exists());
        assert!(!sentinel.exists());
    }

    #[test]
    fn story_created_sentinel_survives_new_handles() {
        let dir = tempfile::tempdir().unwrap();
        let layout = SystemLayout::new(dir.path());

        FileSentinel::at(&layout).create().unwrap();

        // A new process (new handle) sees the marker
        let again = FileSentinel::at(&layout);
        assert!(again.exists());
        assert_eq!(again.path(), dir.path().join("usr/local/.kairos/deployed"));
    }

    #[test]
    fn story_creating_twice_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let sentinel = FileSentinel::new(dir.path().join("deployed"));
        sentinel.create().unwrap();
        sentinel.create().unwrap();
        assert!(sentinel.exists());
    }

    #[test]
    fn story_unwritable_location_is_a_sentinel_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("usr");
        std::fs::write(&blocker, "file, not dir").unwrap();

        let sentinel = FileSentinel::new(blocker.join("local/.kairos/deployed"));
        let err = sentinel.create().unwrap_err();
        assert!(matches!(err, Error::Sentinel(_)));
        assert!(!sentinel.exists());
    }
}
