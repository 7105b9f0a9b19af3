//! Temporary-file provider for spool files.
//!
//! Spool files only exist while a listener has backlog. The provider keeps
//! track of every file it hands out so anything still on disk at shutdown
//! can be swept with [`TempFileProvider::remove_all`].

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Creates and removes spool files, tracking which are live.
pub trait TempFileProvider: Send + Sync + std::fmt::Debug {
    /// Create a new file whose name starts with `prefix`.
    fn create(&self, prefix: &str) -> io::Result<NamedTempFile>;

    /// Delete a file returned by `create` and stop tracking it.
    fn remove(&self, file: NamedTempFile) -> io::Result<()>;

    /// Paths of files created and not yet removed.
    fn tracked(&self) -> Vec<PathBuf>;

    /// Delete every tracked file. Returns how many were removed from disk.
    fn remove_all(&self) -> usize;
}

/// Where spool files are placed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SpoolLocation {
    /// The OS temporary directory.
    #[default]
    System,
    /// A specific directory, created on first use.
    Directory(PathBuf),
}

impl From<Option<PathBuf>> for SpoolLocation {
    fn from(dir: Option<PathBuf>) -> Self {
        match dir {
            Some(path) => Self::Directory(path),
            None => Self::System,
        }
    }
}

/// Spool files backed by `tempfile`.
#[derive(Debug, Default)]
pub struct TempDirSpool {
    location: SpoolLocation,
    tracked: Mutex<HashSet<PathBuf>>,
}

impl TempDirSpool {
    pub fn new(location: SpoolLocation) -> Self {
        Self {
            location,
            tracked: Mutex::new(HashSet::new()),
        }
    }

    /// Spool into the OS temporary directory.
    pub fn system() -> Self {
        Self::new(SpoolLocation::System)
    }

    /// Spool into `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self::new(SpoolLocation::Directory(dir.into()))
    }

    pub fn location(&self) -> &SpoolLocation {
        &self.location
    }

    fn with_tracked<R>(&self, f: impl FnOnce(&mut HashSet<PathBuf>) -> R) -> R {
        let mut tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut tracked)
    }
}

impl TempFileProvider for TempDirSpool {
    fn create(&self, prefix: &str) -> io::Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix);

        let file = match &self.location {
            SpoolLocation::System => builder.tempfile()?,
            SpoolLocation::Directory(dir) => {
                std::fs::create_dir_all(dir)?;
                builder.tempfile_in(dir)?
            }
        };

        let path = file.path().to_path_buf();
        debug!(path = %path.display(), "Created spool file");
        self.with_tracked(|tracked| tracked.insert(path));

        Ok(file)
    }

    fn remove(&self, file: NamedTempFile) -> io::Result<()> {
        let path = file.path().to_path_buf();
        self.with_tracked(|tracked| tracked.remove(&path));
        debug!(path = %path.display(), "Removing spool file");
        file.close()
    }

    fn tracked(&self) -> Vec<PathBuf> {
        self.with_tracked(|tracked| tracked.iter().cloned().collect())
    }

    fn remove_all(&self) -> usize {
        let paths: Vec<PathBuf> = self.with_tracked(|tracked| tracked.drain().collect());

        let mut removed = 0;
        for path in paths {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove spool file"),
            }
        }
        removed
    }
}

impl Drop for TempDirSpool {
    fn drop(&mut self) {
        self.remove_all();
    }
}
