//! Copying system-call arguments across the user/kernel boundary.
//!
//! Every user address is checked against the caller's page table before
//! it is touched. A bad address is a [`Fault`] and costs the caller its
//! life.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::config::PAGE_SIZE;
use crate::memory::{AddressSpace, FramePool, MapError};
use crate::process::{Kernel, Process};

/// The caller passed something that cannot be honored at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    BadAddress,
    /// No NUL within the allowed length.
    StringTooLong,
    UnknownCall(u64),
}

impl From<MapError> for Fault {
    fn from(_: MapError) -> Self {
        Fault::BadAddress
    }
}

fn with_space<T>(
    kernel: &Kernel,
    proc: &Process,
    f: impl FnOnce(&AddressSpace, &mut FramePool) -> Result<T, MapError>,
) -> Result<T, Fault> {
    let res = proc.resources.lock();
    let space = res.address_space.as_ref().ok_or(Fault::BadAddress)?;
    let mut frames = kernel.frames.lock();
    Ok(f(space, &mut frames)?)
}

/// Verify the caller may access `[addr, addr + len)`, and write to it
/// when `write` is set.
pub fn check(kernel: &Kernel, proc: &Process, addr: u64, len: usize, write: bool) -> Result<(), Fault> {
    with_space(kernel, proc, |space, _| space.check_access(addr, len, write))
}

pub fn copy_in(kernel: &Kernel, proc: &Process, addr: u64, len: usize) -> Result<Vec<u8>, Fault> {
    with_space(kernel, proc, |space, frames| {
        space.check_access(addr, len, false)?;
        let mut buf = vec![0u8; len];
        space.read(frames, addr, &mut buf)?;
        Ok(buf)
    })
}

pub fn copy_out(kernel: &Kernel, proc: &Process, addr: u64, data: &[u8]) -> Result<(), Fault> {
    with_space(kernel, proc, |space, frames| {
        space.check_access(addr, data.len(), true)?;
        space.write(frames, addr, data)
    })
}

/// Copy in the NUL-terminated string at `addr`, at most `max` bytes
/// before the terminator.
pub fn copy_in_str(kernel: &Kernel, proc: &Process, addr: u64, max: usize) -> Result<String, Fault> {
    let mut bytes = Vec::new();
    let mut at = addr;
    loop {
        // Never read past the page the cursor is in before checking it.
        let chunk = (PAGE_SIZE - (at % PAGE_SIZE)) as usize;
        let data = copy_in(kernel, proc, at, chunk)?;
        if let Some(nul) = data.iter().position(|&b| b == 0) {
            bytes.extend_from_slice(&data[..nul]);
            break;
        }
        bytes.extend_from_slice(&data);
        if bytes.len() > max {
            return Err(Fault::StringTooLong);
        }
        at = at.checked_add(chunk as u64).ok_or(Fault::BadAddress)?;
    }
    if bytes.len() > max {
        return Err(Fault::StringTooLong);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
