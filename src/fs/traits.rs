//! Open-file abstraction for memory-mapped and lazily-loaded pages.
//!
//! The VM core never touches paths, directories or inodes. Everything it
//! needs from the filesystem is an already-open file object supporting
//! length queries, positioned reads/writes, and `reopen` — a second,
//! independent handle to the same underlying file, so that a child
//! process (fork) or an individual mmap page can close its handle without
//! affecting anyone else's.

use alloc::sync::Arc;

/// Error type for file operations as seen by the VM core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// File or handle no longer valid
    NotFound,
    /// Permission denied
    PermissionDenied,
    /// Invalid offset or argument
    InvalidArgument,
    /// No space left on device
    NoSpace,
    /// Read-only filesystem
    ReadOnly,
    /// I/O error
    IoError,
    /// Bad file descriptor
    BadFd,
    /// Operation not supported by this file object
    NotSupported,
}

impl FsError {
    /// Convert to POSIX errno value
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::NotFound => -crate::posix::errno::ENOENT,
            FsError::PermissionDenied => -crate::posix::errno::EACCES,
            FsError::InvalidArgument => -crate::posix::errno::EINVAL,
            FsError::NoSpace => -crate::posix::errno::ENOSPC,
            FsError::ReadOnly => -crate::posix::errno::EPERM,
            FsError::IoError => -crate::posix::errno::EIO,
            FsError::BadFd => -crate::posix::errno::EBADF,
            FsError::NotSupported => -crate::posix::errno::ENOSYS,
        }
    }
}

/// Result type alias for file operations
pub type FsResult<T> = Result<T, FsError>;

/// Shared reference to an open file object
pub type FileRef = Arc<dyn VmFile>;

/// Open-file object consumed by FileBacked pages and the mmap manager.
///
/// Implementations are provided by the embedding kernel's VFS. All I/O is
/// positioned, so a handle carries no cursor; handles differ in identity
/// (close accounting) rather than state.
pub trait VmFile: Send + Sync {
    /// Current length of the file in bytes
    fn length(&self) -> u64;

    /// Read up to `buf.len()` bytes at `offset`. Returns bytes read;
    /// reads past end-of-file return 0.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> FsResult<usize>;

    /// Write `data` at `offset`. Returns bytes written.
    fn write_at(&self, offset: u64, data: &[u8]) -> FsResult<usize>;

    /// Open an independent handle to the same underlying file.
    fn reopen(&self) -> FsResult<FileRef>;

    /// Release this handle. Only handles the VM owns (per-page mmap
    /// handles, fork-reopened handles) are ever closed by the VM.
    fn close(&self);
}
