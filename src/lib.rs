//! AtomicOS user-process core.
//!
//! Loads ELF executables into per-process address spaces, builds their
//! argument stacks, forks running processes, and coordinates exit and wait
//! between parents and children. Threads, address-space activation and the
//! console are supplied by a [`process::Platform`]; the filesystem by a
//! [`fs::FileSystem`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod serial;
pub mod sync;
pub mod memory;
pub mod fs;
pub mod loader;
pub mod process;
pub mod syscalls;

#[cfg(test)]
mod testing;

pub use process::{
    create_initial_process, exec, exit, fork, wait, IntrFrame, Kernel, Platform, ProcError,
    ProcessId, KERNEL_PID,
};
