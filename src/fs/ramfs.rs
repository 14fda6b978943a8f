use alloc::string::String;
use alloc::vec::Vec;
use spin::Mutex;

use super::error::{FsError, FsResult};
use super::inode::{Inode, InodeId};
use super::FileSystem;

/// Internal state protected by a Mutex.
struct RamFsInner {
    nodes: Vec<Inode>, // arena: index by scanning for id
    next_id: u64,
}

impl RamFsInner {
    fn new() -> Self {
        RamFsInner {
            nodes: Vec::new(),
            next_id: 1,
        }
    }

    fn alloc_id(&mut self) -> InodeId {
        let id = self.next_id;
        self.next_id += 1;
        InodeId(id)
    }

    /// Find a node by its inode id. Returns index in the arena.
    fn find_by_id(&self, id: InodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    /// Find a linked (not removed) file by name.
    fn lookup(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| !n.removed && n.name == name)
    }

    fn node(&self, id: InodeId) -> FsResult<&Inode> {
        self.find_by_id(id)
            .map(|idx| &self.nodes[idx])
            .ok_or(FsError::StaleHandle)
    }

    fn node_mut(&mut self, id: InodeId) -> FsResult<&mut Inode> {
        let idx = self.find_by_id(id).ok_or(FsError::StaleHandle)?;
        Ok(&mut self.nodes[idx])
    }

    /// Drop the node once it is both unlinked and closed.
    fn reap(&mut self, idx: usize) {
        let node = &self.nodes[idx];
        if node.removed && node.open_count == 0 {
            self.nodes.swap_remove(idx);
        }
    }
}

/// Flat in-memory filesystem.
pub struct RamFs {
    label: &'static str,
    inner: Mutex<RamFsInner>,
}

impl RamFs {
    pub fn new(label: &'static str) -> Self {
        RamFs {
            label,
            inner: Mutex::new(RamFsInner::new()),
        }
    }

    /// Create `path` holding `data`. Used to seed executables.
    pub fn install(&self, path: &str, data: &[u8]) -> FsResult<()> {
        let name = normalize(path)?;
        let mut inner = self.inner.lock();
        if inner.lookup(name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        let id = inner.alloc_id();
        let mut node = Inode::new(id, String::from(name), 0);
        node.data.extend_from_slice(data);
        inner.nodes.push(node);
        Ok(())
    }

    /// Number of inodes still held, linked or not.
    pub fn inode_count(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    /// Open references on the file currently linked at `path`.
    pub fn open_count(&self, path: &str) -> Option<usize> {
        let name = normalize(path).ok()?;
        let inner = self.inner.lock();
        inner.lookup(name).map(|idx| inner.nodes[idx].open_count)
    }
}

/// Strip the leading slash. The namespace is flat, so any other separator
/// is rejected.
fn normalize(path: &str) -> FsResult<&str> {
    let name = path.strip_prefix('/').unwrap_or(path);
    if name.is_empty() || name.contains('/') {
        return Err(FsError::InvalidPath);
    }
    Ok(name)
}

impl FileSystem for RamFs {
    fn name(&self) -> &str {
        self.label
    }

    fn create(&self, path: &str, initial_size: usize) -> FsResult<()> {
        let name = normalize(path)?;
        let mut inner = self.inner.lock();
        if inner.lookup(name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        let id = inner.alloc_id();
        inner.nodes.push(Inode::new(id, String::from(name), initial_size));
        Ok(())
    }

    fn remove(&self, path: &str) -> FsResult<()> {
        let name = normalize(path)?;
        let mut inner = self.inner.lock();
        let idx = inner.lookup(name).ok_or(FsError::NotFound)?;
        inner.nodes[idx].removed = true;
        inner.reap(idx);
        Ok(())
    }

    fn open(&self, path: &str) -> FsResult<InodeId> {
        let name = normalize(path)?;
        let mut inner = self.inner.lock();
        let idx = inner.lookup(name).ok_or(FsError::NotFound)?;
        let node = &mut inner.nodes[idx];
        node.open_count += 1;
        Ok(node.id)
    }

    fn reopen(&self, inode: InodeId) -> FsResult<()> {
        self.inner.lock().node_mut(inode)?.open_count += 1;
        Ok(())
    }

    fn close(&self, inode: InodeId) {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.find_by_id(inode) {
            let node = &mut inner.nodes[idx];
            node.open_count = node.open_count.saturating_sub(1);
            inner.reap(idx);
        }
    }

    fn length(&self, inode: InodeId) -> FsResult<usize> {
        Ok(self.inner.lock().node(inode)?.len())
    }

    fn read_at(&self, inode: InodeId, offset: usize, buf: &mut [u8]) -> FsResult<usize> {
        Ok(self.inner.lock().node(inode)?.read_at(offset, buf))
    }

    fn write_at(&self, inode: InodeId, offset: usize, data: &[u8]) -> FsResult<usize> {
        Ok(self.inner.lock().node_mut(inode)?.write_at(offset, data))
    }

    fn deny_write(&self, inode: InodeId) {
        if let Ok(node) = self.inner.lock().node_mut(inode) {
            node.deny_write_count += 1;
        }
    }

    fn allow_write(&self, inode: InodeId) {
        if let Ok(node) = self.inner.lock().node_mut(inode) {
            node.deny_write_count = node.deny_write_count.saturating_sub(1);
        }
    }
}
