pub mod duplicate;
pub mod frame_allocator;
pub mod paging;

pub use duplicate::duplicate;
pub use frame_allocator::FramePool;
pub use paging::{AddressSpace, MapError, Mapping};

use crate::config::{PAGE_MASK, PAGE_SIZE, USER_TOP};

/// True when `addr` lies in the user-addressable range.
#[inline]
pub fn is_user_vaddr(addr: u64) -> bool {
    addr < USER_TOP
}

/// Byte offset of `addr` within its page.
#[inline]
pub fn pg_ofs(addr: u64) -> u64 {
    addr & PAGE_MASK
}

#[inline]
pub fn pg_round_down(addr: u64) -> u64 {
    addr & !PAGE_MASK
}

/// Round `addr` up to a page boundary, `None` on overflow.
#[inline]
pub fn pg_round_up(addr: u64) -> Option<u64> {
    addr.checked_add(PAGE_MASK).map(pg_round_down)
}

#[inline]
pub(crate) fn page_size() -> usize {
    PAGE_SIZE as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_rounding() {
        assert_eq!(pg_round_down(0x401234), 0x401000);
        assert_eq!(pg_round_up(0x401234), Some(0x402000));
        assert_eq!(pg_round_up(0x402000), Some(0x402000));
        assert_eq!(pg_round_up(u64::MAX - 5), None);
        assert_eq!(pg_ofs(0x401234), 0x234);
    }

    #[test]
    fn test_user_range_boundary() {
        assert!(is_user_vaddr(0x1000));
        assert!(is_user_vaddr(USER_TOP - 1));
        assert!(!is_user_vaddr(USER_TOP));
        assert!(!is_user_vaddr(crate::config::KERN_BASE));
    }
}
