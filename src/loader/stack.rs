//! Initial user stack: `argv` strings, the pointer array and a fake return
//! address, laid out for the x86_64 SysV entry convention.

use super::ExecError;
use crate::config::PAGE_SIZE;
use crate::memory::{AddressSpace, FramePool};

/// Pushes values downward onto a stack page of another address space.
pub struct StackBuilder<'a> {
    space: &'a AddressSpace,
    frames: &'a mut FramePool,
    sp: u64,
    floor: u64,
}

impl<'a> StackBuilder<'a> {
    /// Start at `top`, the exclusive end of a single mapped stack page.
    pub fn new(space: &'a AddressSpace, frames: &'a mut FramePool, top: u64) -> Self {
        StackBuilder {
            space,
            frames,
            sp: top,
            floor: top.saturating_sub(PAGE_SIZE),
        }
    }

    pub fn sp(&self) -> u64 {
        self.sp
    }

    /// Push raw bytes and return their address.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<u64, ExecError> {
        let sp = self
            .sp
            .checked_sub(bytes.len() as u64)
            .filter(|&sp| sp >= self.floor)
            .ok_or(ExecError::ArgsTooLarge)?;
        self.space.write(self.frames, sp, bytes)?;
        self.sp = sp;
        Ok(sp)
    }

    /// Push `s` with a NUL terminator and return its address.
    pub fn push_str(&mut self, s: &str) -> Result<u64, ExecError> {
        self.push_bytes(&[0])?;
        self.push_bytes(s.as_bytes())
    }

    pub fn push_usize(&mut self, value: u64) -> Result<u64, ExecError> {
        self.push_bytes(&value.to_le_bytes())
    }

    /// Zero-pad down to a multiple of `align` (a power of two).
    pub fn align(&mut self, align: u64) -> Result<(), ExecError> {
        let pad = (self.sp % align) as usize;
        if pad > 0 {
            self.push_bytes(&alloc::vec![0u8; pad])?;
        }
        Ok(())
    }
}

/// Register and stack-pointer values for a program entered with `args`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgLayout {
    pub rsp: u64,
    /// First argument register: `argc`.
    pub argc: u64,
    /// Second argument register: address of `argv[0]`.
    pub argv: u64,
}

/// Lay out `args` on the stack page ending at `top`.
///
/// From high to low: the strings (last argument first), padding to 8
/// bytes, a NULL `argv[argc]`, the pointers (last first, so the array
/// reads forward), and a zero return address at `rsp`.
pub fn build_args(
    space: &AddressSpace,
    frames: &mut FramePool,
    top: u64,
    args: &[&str],
) -> Result<ArgLayout, ExecError> {
    let mut stack = StackBuilder::new(space, frames, top);
    let mut addrs = alloc::vec::Vec::with_capacity(args.len());
    for arg in args.iter().rev() {
        addrs.push(stack.push_str(arg)?);
    }
    stack.align(8)?;
    stack.push_usize(0)?;
    for &addr in addrs.iter() {
        stack.push_usize(addr)?;
    }
    let argv = stack.sp();
    let rsp = stack.push_usize(0)?;
    Ok(ArgLayout {
        rsp,
        argc: args.len() as u64,
        argv,
    })
}
