use alloc::string::String;
use alloc::vec::Vec;

/// Identifies a file for as long as any handle keeps it open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct InodeId(pub u64);

/// An in-memory file.
#[derive(Debug)]
pub struct Inode {
    pub id: InodeId,
    pub name: String,
    pub data: Vec<u8>,
    /// Open handles referencing this inode.
    pub open_count: usize,
    /// While non-zero, every write to the file is refused.
    pub deny_write_count: usize,
    /// Unlinked while still open; reclaimed on the last close.
    pub removed: bool,
}

impl Inode {
    pub fn new(id: InodeId, name: String, size: usize) -> Self {
        Inode {
            id,
            name,
            data: alloc::vec![0; size],
            open_count: 0,
            deny_write_count: 0,
            removed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        if offset >= self.data.len() {
            return 0;
        }
        let available = &self.data[offset..];
        let to_read = buf.len().min(available.len());
        buf[..to_read].copy_from_slice(&available[..to_read]);
        to_read
    }

    /// Write at `offset`, growing the file as needed. Returns 0 while
    /// writes are denied.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> usize {
        if self.deny_write_count > 0 {
            return 0;
        }
        let end = offset + data.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(data);
        data.len()
    }
}
