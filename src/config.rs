//! Compile-time configuration for the process core.
//!
//! Memory layout and the hard limits enforced on untrusted input live here.

/// Page size (4 KiB).
pub const PAGE_SIZE: u64 = 4096;

/// Low bits of an address that select a byte within its page.
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// One past the highest user-addressable virtual address (end of the lower
/// canonical half).
pub const USER_TOP: u64 = 0x0000_8000_0000_0000;

/// Start of the kernel-reserved range. Every address space shares the
/// kernel mappings above this address; they are never copied per process.
pub const KERN_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Top of the initial user stack. The stack is a single page ending here.
pub const USER_STACK: u64 = 0x4748_0000;

/// Maximum number of whitespace-separated words in a command line.
pub const MAX_ARGS: usize = 30;

/// Command lines are copied from user memory into at most one page.
pub const MAX_CMDLINE_LEN: usize = PAGE_SIZE as usize;

/// Longest process name kept for diagnostics (bytes).
pub const MAX_NAME_LEN: usize = 15;

/// Size of each process's file descriptor table.
pub const MAX_FD: usize = 128;

/// Upper bound on `e_phnum` accepted from an executable header.
pub const MAX_PHNUM: u16 = 1024;

/// Exit status recorded for a process the kernel terminated, and returned
/// by system calls on failure.
pub const EXIT_KILLED: i32 = -1;
