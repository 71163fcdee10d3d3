//! The host virtual filesystem seam.
//!
//! The installer and planner see the host filesystem only through
//! [`VirtualFs`]. Paths are absolute, `/`-separated strings. Every
//! operation may suspend, so the trait returns boxed futures and stays
//! dyn-compatible (`Arc<dyn VirtualFs>`).
//!
//! [`BlockDevice`] is the backend a mount reads an image through.

mod memory;
mod path;

use std::sync::Arc;

use thiserror::Error;

use crate::BoxFuture;

pub use memory::MemoryFs;
pub use path::{file_name, join, normalize, parent};

/// Result type for filesystem operations.
pub type VfsResult<T> = Result<T, VfsError>;

/// Filesystem errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VfsError {
    #[error("no such file or directory: {path}")]
    NotFound { path: String },

    #[error("not a directory: {path}")]
    NotADirectory { path: String },

    #[error("is a directory: {path}")]
    IsADirectory { path: String },

    #[error("already exists: {path}")]
    AlreadyExists { path: String },

    #[error("directory not empty: {path}")]
    NotEmpty { path: String },

    #[error("too many levels of symbolic links: {path}")]
    SymlinkLoop { path: String },

    #[error("invalid path: {path}")]
    InvalidPath { path: String },

    /// Block device read or mount failure.
    #[error("device error: {reason}")]
    Device { reason: String },
}

/// Kind of a filesystem object, after following symlinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsObjectKind {
    Directory,
    File,
}

/// Result of [`VirtualFs::find_object`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsObject {
    /// Resolved path of the object.
    pub path: String,
    pub kind: FsObjectKind,
    /// Byte length for files, 0 for directories.
    pub size: u64,
}

impl FsObject {
    pub fn is_dir(&self) -> bool {
        self.kind == FsObjectKind::Directory
    }
}

/// Host virtual filesystem.
pub trait VirtualFs: Send + Sync {
    /// Entry names of a directory, sorted, without `.` and `..`.
    fn read_dir<'a>(&'a self, path: &'a str) -> BoxFuture<'a, VfsResult<Vec<String>>>;

    /// Look up a path, following symlinks. `None` if nothing is there.
    fn find_object<'a>(&'a self, path: &'a str) -> BoxFuture<'a, VfsResult<Option<FsObject>>>;

    /// Read a whole file.
    fn read_file<'a>(&'a self, path: &'a str) -> BoxFuture<'a, VfsResult<Vec<u8>>>;

    /// Read at most `len` bytes from the start of a file.
    fn read_head<'a>(&'a self, path: &'a str, len: usize) -> BoxFuture<'a, VfsResult<Vec<u8>>>;

    /// Create or replace a file. The parent directory must exist.
    fn write_file<'a>(&'a self, path: &'a str, data: Vec<u8>) -> BoxFuture<'a, VfsResult<()>>;

    /// Create one directory. The parent must exist.
    fn mkdir<'a>(&'a self, path: &'a str) -> BoxFuture<'a, VfsResult<()>>;

    /// Create a directory and any missing parents.
    fn mkdir_all<'a>(&'a self, path: &'a str) -> BoxFuture<'a, VfsResult<()>>;

    /// Create a symlink at `link` pointing to `target`.
    fn symlink<'a>(&'a self, target: &'a str, link: &'a str) -> BoxFuture<'a, VfsResult<()>>;

    /// Remove a file, a symlink (not its target) or an empty directory.
    fn remove<'a>(&'a self, path: &'a str) -> BoxFuture<'a, VfsResult<()>>;

    /// Mount a read-only image served by `device` at `mount_point`.
    fn mount<'a>(
        &'a self,
        mount_point: &'a str,
        device: Arc<dyn BlockDevice>,
    ) -> BoxFuture<'a, VfsResult<()>>;
}

/// Random-access, read-only byte device backing a mount.
pub trait BlockDevice: Send + Sync {
    /// Total size in bytes.
    fn size(&self) -> u64;

    /// Fill `buf` from `offset`; returns the bytes read (short at the end).
    fn read_at<'a>(&'a self, offset: u64, buf: &'a mut [u8]) -> BoxFuture<'a, VfsResult<usize>>;
}
