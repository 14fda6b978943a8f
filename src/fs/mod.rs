//! File system collaborators of the process core.
//!
//! The core only needs a flat namespace of byte files with open counts and
//! write denial. [`FileSystem`] is that seam; [`RamFs`] is the in-memory
//! implementation used by the hosted kernel and the tests.

pub mod error;
pub mod fd;
pub mod file;
pub mod inode;
pub mod ramfs;

pub use error::{FsError, FsResult};
pub use fd::{Descriptor, FdTable};
pub use file::OpenFile;
pub use inode::InodeId;
pub use ramfs::RamFs;

/// Operations the process core performs on files.
///
/// Callers serialize all calls through the kernel's file system lock; an
/// implementation only needs to be memory safe under concurrent use.
pub trait FileSystem: Send + Sync {
    /// Filesystem type name, e.g. "ramfs".
    fn name(&self) -> &str;

    /// Create a zero-filled file of `initial_size` bytes.
    fn create(&self, path: &str, initial_size: usize) -> FsResult<()>;

    /// Unlink `path`. Open handles keep working until they are closed.
    fn remove(&self, path: &str) -> FsResult<()>;

    /// Resolve `path` and take one open reference on it.
    fn open(&self, path: &str) -> FsResult<InodeId>;

    /// Take another open reference on an inode that is already open.
    fn reopen(&self, inode: InodeId) -> FsResult<()>;

    /// Drop one open reference.
    fn close(&self, inode: InodeId);

    fn length(&self, inode: InodeId) -> FsResult<usize>;

    fn read_at(&self, inode: InodeId, offset: usize, buf: &mut [u8]) -> FsResult<usize>;

    /// Returns the number of bytes written, 0 while writes are denied.
    fn write_at(&self, inode: InodeId, offset: usize, data: &[u8]) -> FsResult<usize>;

    fn deny_write(&self, inode: InodeId);

    fn allow_write(&self, inode: InodeId);
}
