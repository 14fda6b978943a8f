use alloc::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use alloc::vec;
use alloc::vec::Vec;
use bit_field::BitField;
use core::ptr::NonNull;
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr, VirtAddr,
};

use super::page_size;
use crate::config::PAGE_SIZE;

/// Physical frame pool.
///
/// Manages the frames of one contiguous physical range. Every frame is
/// reachable by the kernel at `phys_offset + physical address`, the same
/// complete physical mapping the page-table code relies on. Allocation state
/// is a bitmap, so frames can be handed back when a process dies.
pub struct FramePool {
    phys_offset: VirtAddr,
    first: PhysFrame,
    count: usize,
    used: Vec<u64>,
    next: usize,
    free: usize,
    backing: Option<(NonNull<u8>, Layout)>,
}

// The backing pointer is only dereferenced while the pool is borrowed.
unsafe impl Send for FramePool {}

impl FramePool {
    /// Manage the frames in `[start, end)`.
    ///
    /// # Safety
    /// The range must be unused RAM, and all of it must be mapped at
    /// `phys_offset`.
    pub unsafe fn new(phys_offset: VirtAddr, start: PhysAddr, end: PhysAddr) -> Self {
        let first = PhysFrame::containing_address(start.align_up(PAGE_SIZE));
        let count = end
            .as_u64()
            .saturating_sub(first.start_address().as_u64()) as usize
            / page_size();
        FramePool {
            phys_offset,
            first,
            count,
            used: vec![0; (count + 63) / 64],
            next: 0,
            free: count,
            backing: None,
        }
    }

    /// A pool of `frames` frames backed by heap memory instead of RAM
    /// discovered at boot. Physical addresses start at one page, so no
    /// handed-out frame is ever at physical address zero.
    pub fn hosted(frames: usize) -> Self {
        let size = (frames + 1) * page_size();
        let layout =
            Layout::from_size_align(size, page_size()).expect("hosted frame pool too large");
        let base = unsafe { alloc_zeroed(layout) };
        let Some(base) = NonNull::new(base) else {
            handle_alloc_error(layout);
        };
        let phys_offset = VirtAddr::new(base.as_ptr() as u64);
        let mut pool = unsafe {
            FramePool::new(
                phys_offset,
                PhysAddr::new(PAGE_SIZE),
                PhysAddr::new(size as u64),
            )
        };
        pool.backing = Some((base, layout));
        pool
    }

    /// Where physical memory is visible in the kernel's address space.
    pub fn phys_offset(&self) -> VirtAddr {
        self.phys_offset
    }

    pub fn free_frames(&self) -> usize {
        self.free
    }

    pub fn total_frames(&self) -> usize {
        self.count
    }

    fn index_of(&self, frame: PhysFrame) -> Option<usize> {
        let addr = frame.start_address().as_u64();
        let first = self.first.start_address().as_u64();
        if addr < first {
            return None;
        }
        let index = ((addr - first) / PAGE_SIZE) as usize;
        (index < self.count).then_some(index)
    }

    /// True if `frame` belongs to this pool and is currently allocated.
    pub fn is_allocated(&self, frame: PhysFrame) -> bool {
        self.index_of(frame)
            .map(|i| self.used[i / 64].get_bit(i % 64))
            .unwrap_or(false)
    }

    /// Allocate a frame and clear it.
    pub fn allocate_zeroed(&mut self) -> Option<PhysFrame> {
        let frame = self.allocate_frame()?;
        self.zero(frame);
        Some(frame)
    }

    fn frame_ptr(&self, frame: PhysFrame) -> *mut u8 {
        assert!(
            self.is_allocated(frame),
            "frame {:#x} accessed while not allocated",
            frame.start_address().as_u64()
        );
        (self.phys_offset + frame.start_address().as_u64()).as_mut_ptr()
    }

    pub fn zero(&mut self, frame: PhysFrame) {
        let ptr = self.frame_ptr(frame);
        unsafe { core::ptr::write_bytes(ptr, 0, page_size()) };
    }

    /// Copy a whole frame.
    pub fn copy_frame(&mut self, src: PhysFrame, dst: PhysFrame) {
        let from = self.frame_ptr(src);
        let to = self.frame_ptr(dst);
        if from != to {
            unsafe { core::ptr::copy_nonoverlapping(from, to, page_size()) };
        }
    }

    /// Write `data` into `frame` starting at byte `offset`.
    pub fn write(&mut self, frame: PhysFrame, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= page_size());
        let ptr = self.frame_ptr(frame);
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset), data.len()) };
    }

    /// Fill `buf` from `frame` starting at byte `offset`.
    pub fn read(&self, frame: PhysFrame, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= page_size());
        let ptr = self.frame_ptr(frame);
        unsafe { core::ptr::copy_nonoverlapping(ptr.add(offset), buf.as_mut_ptr(), buf.len()) };
    }
}

unsafe impl FrameAllocator<Size4KiB> for FramePool {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        if self.free == 0 {
            return None;
        }
        for step in 0..self.count {
            let index = (self.next + step) % self.count;
            let word = &mut self.used[index / 64];
            if !word.get_bit(index % 64) {
                word.set_bit(index % 64, true);
                self.next = (index + 1) % self.count;
                self.free -= 1;
                return Some(self.first + index as u64);
            }
        }
        None
    }
}

impl FrameDeallocator<Size4KiB> for FramePool {
    /// A frame outside the pool, or one already free, is logged and left
    /// alone.
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
        let addr = frame.start_address().as_u64();
        let Some(index) = self.index_of(frame) else {
            crate::log_error!("frame {:#x} freed but not in the pool", addr);
            return;
        };
        let word = &mut self.used[index / 64];
        if !word.get_bit(index % 64) {
            crate::log_error!("double free of frame {:#x}", addr);
            return;
        }
        word.set_bit(index % 64, false);
        self.free += 1;
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        if let Some((base, layout)) = self.backing.take() {
            unsafe { dealloc(base.as_ptr(), layout) };
        }
    }
}
