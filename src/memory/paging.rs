use alloc::vec::Vec;
use core::fmt;
use x86_64::{
    structures::paging::{
        mapper::MapToError, page_table::PageTableEntry, FrameDeallocator, Mapper,
        OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame,
    },
    VirtAddr,
};

use super::{is_user_vaddr, page_size, pg_ofs, FramePool};

/// P4 slots below this index cover user space; the rest belong to the
/// kernel and are shared by every address space.
const USER_P4_ENTRIES: usize = 256;

/// Page-mapping errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    OutOfMemory,
    AlreadyMapped,
    NotUserAddress,
    HugePage,
    Unmapped,
    ReadOnly,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MapError::OutOfMemory => write!(f, "Out of physical frames"),
            MapError::AlreadyMapped => write!(f, "Page already mapped"),
            MapError::NotUserAddress => write!(f, "Address outside user space"),
            MapError::HugePage => write!(f, "Huge page in user space"),
            MapError::Unmapped => write!(f, "Page not mapped"),
            MapError::ReadOnly => write!(f, "Page not writable"),
        }
    }
}

/// One present user mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub page: Page,
    pub frame: PhysFrame,
    pub flags: PageTableFlags,
}

impl Mapping {
    pub fn writable(&self) -> bool {
        self.flags.contains(PageTableFlags::WRITABLE)
    }
}

/// A process's page-table root and everything it maps below the kernel
/// range.
///
/// The table lives in frames from a [`FramePool`] and is read and written
/// through the pool's physical-memory offset. User frames and the tables
/// that hold them are owned by exactly one `AddressSpace` and are released
/// by [`AddressSpace::destroy`]; the kernel half is copied from a template
/// root at creation and never freed here.
#[derive(Debug)]
pub struct AddressSpace {
    root: PhysFrame,
    phys_offset: VirtAddr,
}

impl AddressSpace {
    /// Create an empty user address space. With a `kernel_root`, its kernel
    /// half is shared into the new table.
    pub fn new(frames: &mut FramePool, kernel_root: Option<PhysFrame>) -> Result<Self, MapError> {
        let root = frames.allocate_zeroed().ok_or(MapError::OutOfMemory)?;
        let space = AddressSpace {
            root,
            phys_offset: frames.phys_offset(),
        };
        if let Some(kernel_root) = kernel_root {
            let template = unsafe { space.table(kernel_root) };
            let p4 = unsafe { space.table_mut(root) };
            for i in USER_P4_ENTRIES..512 {
                p4[i] = template[i].clone();
            }
        }
        Ok(space)
    }

    /// Physical frame of the level-4 table (the CR3 value).
    pub fn root(&self) -> PhysFrame {
        self.root
    }

    unsafe fn table<'a>(&self, frame: PhysFrame) -> &'a PageTable {
        &*(self.phys_offset + frame.start_address().as_u64()).as_ptr::<PageTable>()
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn table_mut<'a>(&self, frame: PhysFrame) -> &'a mut PageTable {
        &mut *(self.phys_offset + frame.start_address().as_u64()).as_mut_ptr::<PageTable>()
    }

    fn next_table(&self, entry: &PageTableEntry) -> Option<&PageTable> {
        // `frame()` refuses entries that are absent or huge.
        let frame = entry.frame().ok()?;
        Some(unsafe { self.table(frame) })
    }

    /// Map `page` to `frame` for user access. Fails if the page is already
    /// present or an intermediate table cannot be allocated.
    pub fn install(
        &mut self,
        page: Page,
        frame: PhysFrame,
        writable: bool,
        frames: &mut FramePool,
    ) -> Result<(), MapError> {
        if !is_user_vaddr(page.start_address().as_u64()) {
            return Err(MapError::NotUserAddress);
        }
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }
        let parent_flags =
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

        let p4 = unsafe { self.table_mut(self.root) };
        let mut mapper = unsafe { OffsetPageTable::new(p4, self.phys_offset) };
        // Not necessarily the active table, and activation reloads CR3, so
        // there is nothing to flush.
        match unsafe { mapper.map_to_with_table_flags(page, frame, flags, parent_flags, frames) } {
            Ok(flush) => {
                flush.ignore();
                Ok(())
            }
            Err(MapToError::PageAlreadyMapped(_)) => Err(MapError::AlreadyMapped),
            Err(MapToError::FrameAllocationFailed) => Err(MapError::OutOfMemory),
            Err(MapToError::ParentEntryHugePage) => Err(MapError::HugePage),
        }
    }

    /// Look up the mapping of the page containing `addr`.
    pub fn translate(&self, addr: VirtAddr) -> Option<Mapping> {
        let page = Page::containing_address(addr);
        let p4 = unsafe { self.table(self.root) };
        let p3 = self.next_table(&p4[page.p4_index()])?;
        let p2 = self.next_table(&p3[page.p3_index()])?;
        let p1 = self.next_table(&p2[page.p2_index()])?;
        let entry = &p1[page.p1_index()];
        let frame = entry.frame().ok()?;
        Some(Mapping {
            page,
            frame,
            flags: entry.flags(),
        })
    }

    /// Every present mapping below the kernel range, in address order.
    pub fn user_mappings(&self) -> impl Iterator<Item = Mapping> {
        let mut found = Vec::new();
        let p4 = unsafe { self.table(self.root) };
        for (i4, e4) in p4.iter().enumerate().take(USER_P4_ENTRIES) {
            let Some(p3) = self.next_table(e4) else { continue };
            for (i3, e3) in p3.iter().enumerate() {
                let Some(p2) = self.next_table(e3) else { continue };
                for (i2, e2) in p2.iter().enumerate() {
                    let Some(p1) = self.next_table(e2) else { continue };
                    for (i1, e1) in p1.iter().enumerate() {
                        let Ok(frame) = e1.frame() else { continue };
                        let addr = ((i4 as u64) << 39)
                            | ((i3 as u64) << 30)
                            | ((i2 as u64) << 21)
                            | ((i1 as u64) << 12);
                        found.push(Mapping {
                            page: Page::containing_address(VirtAddr::new(addr)),
                            frame,
                            flags: e1.flags(),
                        });
                    }
                }
            }
        }
        found.into_iter()
    }

    /// Verify that `[addr, addr + len)` is mapped user memory, writable too
    /// when `write` is set.
    pub fn check_access(&self, addr: u64, len: usize, write: bool) -> Result<(), MapError> {
        if len == 0 {
            return Ok(());
        }
        let end = addr.checked_add(len as u64 - 1).ok_or(MapError::NotUserAddress)?;
        if !is_user_vaddr(addr) || !is_user_vaddr(end) {
            return Err(MapError::NotUserAddress);
        }
        let mut page = addr & !(page_size() as u64 - 1);
        while page <= end {
            let mapping = self.translate(VirtAddr::new(page)).ok_or(MapError::Unmapped)?;
            if !mapping.flags.contains(PageTableFlags::USER_ACCESSIBLE) {
                return Err(MapError::NotUserAddress);
            }
            if write && !mapping.writable() {
                return Err(MapError::ReadOnly);
            }
            page += page_size() as u64;
        }
        Ok(())
    }

    /// Copy `data` into this space at `addr`, ignoring page permissions.
    pub fn write(&self, frames: &mut FramePool, addr: u64, data: &[u8]) -> Result<(), MapError> {
        let mut done = 0;
        while done < data.len() {
            let at = addr + done as u64;
            if !is_user_vaddr(at) {
                return Err(MapError::NotUserAddress);
            }
            let mapping = self.translate(VirtAddr::new(at)).ok_or(MapError::Unmapped)?;
            let offset = pg_ofs(at) as usize;
            let chunk = (page_size() - offset).min(data.len() - done);
            frames.write(mapping.frame, offset, &data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Copy bytes at `addr` out of this space into `buf`.
    pub fn read(&self, frames: &FramePool, addr: u64, buf: &mut [u8]) -> Result<(), MapError> {
        let mut done = 0;
        while done < buf.len() {
            let at = addr + done as u64;
            if !is_user_vaddr(at) {
                return Err(MapError::NotUserAddress);
            }
            let mapping = self.translate(VirtAddr::new(at)).ok_or(MapError::Unmapped)?;
            let offset = pg_ofs(at) as usize;
            let chunk = (page_size() - offset).min(buf.len() - done);
            frames.read(mapping.frame, offset, &mut buf[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Release every user frame, every table that maps them, and the root.
    /// The shared kernel half is left alone.
    pub fn destroy(self, frames: &mut FramePool) {
        let p4 = unsafe { self.table(self.root) };
        for e4 in p4.iter().take(USER_P4_ENTRIES) {
            let Ok(p3_frame) = e4.frame() else { continue };
            let p3 = unsafe { self.table(p3_frame) };
            for e3 in p3.iter() {
                let Ok(p2_frame) = e3.frame() else { continue };
                let p2 = unsafe { self.table(p2_frame) };
                for e2 in p2.iter() {
                    let Ok(p1_frame) = e2.frame() else { continue };
                    let p1 = unsafe { self.table(p1_frame) };
                    for e1 in p1.iter() {
                        if let Ok(frame) = e1.frame() {
                            unsafe { frames.deallocate_frame(frame) };
                        }
                    }
                    unsafe { frames.deallocate_frame(p1_frame) };
                }
                unsafe { frames.deallocate_frame(p2_frame) };
            }
            unsafe { frames.deallocate_frame(p3_frame) };
        }
        unsafe { frames.deallocate_frame(self.root) };
    }
}
