//! Eager copy of a parent's user memory into a child's address space.

use x86_64::structures::paging::{FrameAllocator, FrameDeallocator};

use super::{is_user_vaddr, AddressSpace, FramePool, MapError};

/// Give `child` a private copy of every user page mapped in `parent`.
///
/// Each page lands at the same virtual address with the parent's writable
/// bit. Kernel-range mappings are never copied; the child already shares
/// them through its kernel half. On error the child may be partly filled,
/// and the caller must destroy it.
pub fn duplicate(
    child: &mut AddressSpace,
    parent: &AddressSpace,
    frames: &mut FramePool,
) -> Result<usize, MapError> {
    let mut copied = 0;
    for mapping in parent.user_mappings() {
        if !is_user_vaddr(mapping.page.start_address().as_u64()) {
            continue;
        }
        let frame = frames.allocate_frame().ok_or(MapError::OutOfMemory)?;
        frames.copy_frame(mapping.frame, frame);
        if let Err(e) = child.install(mapping.page, frame, mapping.writable(), frames) {
            unsafe { frames.deallocate_frame(frame) };
            return Err(e);
        }
        copied += 1;
    }
    Ok(copied)
}
