//! Output file system the route render driver writes into.
//!
//! [`DiskFileSystem`] writes through `tokio::fs`. [`MemoryFileSystem`] keeps
//! everything in memory, for dry runs and tests.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

#[async_trait]
pub trait OutputFileSystem: Send + Sync {
    /// Create `path` and any missing parents. Succeeds if it already exists.
    async fn ensure_dir(&self, path: &Path) -> io::Result<()>;

    /// Create or overwrite `path` with `contents`.
    async fn write_file(&self, path: &Path, contents: &str) -> io::Result<()>;
}

// ---------------------------------------------------------------------------
// Disk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct DiskFileSystem;

#[async_trait]
impl OutputFileSystem for DiskFileSystem {
    async fn ensure_dir(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn write_file(&self, path: &Path, contents: &str) -> io::Result<()> {
        tokio::fs::write(path, contents).await
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Thread-safe in-memory file tree.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    dirs: DashSet<PathBuf>,
    files: DashMap<PathBuf, String>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, path: impl AsRef<Path>) -> Option<String> {
        self.files.get(path.as_ref()).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.files.contains_key(path.as_ref())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Every file under `root`, keyed by its path relative to `root`.
    pub fn snapshot(&self, root: impl AsRef<Path>) -> BTreeMap<String, String> {
        let root = root.as_ref();
        self.files
            .iter()
            .filter_map(|entry| {
                let relative = entry.key().strip_prefix(root).ok()?;
                Some((
                    relative.to_string_lossy().replace('\\', "/"),
                    entry.value().clone(),
                ))
            })
            .collect()
    }
}

#[async_trait]
impl OutputFileSystem for MemoryFileSystem {
    async fn ensure_dir(&self, path: &Path) -> io::Result<()> {
        for ancestor in path.ancestors() {
            if self.files.contains_key(ancestor) {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} is a file", ancestor.display()),
                ));
            }
        }
        for ancestor in path.ancestors() {
            if !ancestor.as_os_str().is_empty() {
                self.dirs.insert(ancestor.to_path_buf());
            }
        }
        Ok(())
    }

    async fn write_file(&self, path: &Path, contents: &str) -> io::Result<()> {
        let parent_exists = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => self.dirs.contains(parent),
            _ => true,
        };
        if !parent_exists {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("directory {} does not exist", path.parent().unwrap_or(path).display()),
            ));
        }
        if self.dirs.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} is a directory", path.display()),
            ));
        }
        self.files.insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }
}
