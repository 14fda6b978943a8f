use alloc::sync::Arc;

use super::error::FsResult;
use super::inode::InodeId;
use super::FileSystem;

/// An open file: one open reference on an inode plus a private position.
///
/// Dropping the handle closes it, and lifts the write denial if this
/// handle placed one.
pub struct OpenFile {
    fs: Arc<dyn FileSystem>,
    inode: InodeId,
    pos: usize,
    deny_write: bool,
}

impl OpenFile {
    pub fn open(fs: &Arc<dyn FileSystem>, path: &str) -> FsResult<Self> {
        let inode = fs.open(path)?;
        Ok(OpenFile {
            fs: fs.clone(),
            inode,
            pos: 0,
            deny_write: false,
        })
    }

    pub fn inode(&self) -> InodeId {
        self.inode
    }

    /// Read at the current position and advance past the bytes read.
    pub fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        let n = self.fs.read_at(self.inode, self.pos, buf)?;
        self.pos += n;
        Ok(n)
    }

    /// Read at `offset` without touching the position.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> FsResult<usize> {
        self.fs.read_at(self.inode, offset, buf)
    }

    pub fn write(&mut self, data: &[u8]) -> FsResult<usize> {
        let n = self.fs.write_at(self.inode, self.pos, data)?;
        self.pos += n;
        Ok(n)
    }

    /// Positions past the end are allowed; reads there return nothing.
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn tell(&self) -> usize {
        self.pos
    }

    pub fn length(&self) -> FsResult<usize> {
        self.fs.length(self.inode)
    }

    /// Refuse writes to the underlying file for as long as this handle is
    /// open.
    pub fn deny_write(&mut self) {
        if !self.deny_write {
            self.deny_write = true;
            self.fs.deny_write(self.inode);
        }
    }

    pub fn allow_write(&mut self) {
        if self.deny_write {
            self.deny_write = false;
            self.fs.allow_write(self.inode);
        }
    }

    /// A second independent handle on the same file, at the same position
    /// and with the same write denial.
    pub fn duplicate(&self) -> FsResult<Self> {
        self.fs.reopen(self.inode)?;
        let mut copy = OpenFile {
            fs: self.fs.clone(),
            inode: self.inode,
            pos: self.pos,
            deny_write: false,
        };
        if self.deny_write {
            copy.deny_write();
        }
        Ok(copy)
    }
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        self.allow_write();
        self.fs.close(self.inode);
    }
}

impl core::fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("OpenFile")
            .field("inode", &self.inode)
            .field("pos", &self.pos)
            .field("deny_write", &self.deny_write)
            .finish()
    }
}
