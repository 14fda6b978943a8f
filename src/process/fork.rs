//! fork: duplicate a running process.

use alloc::boxed::Box;
use alloc::sync::Arc;
use x86_64::structures::paging::PhysFrame;

use super::launch::{abandon_start, run_user};
use super::{IntrFrame, Kernel, ProcError, Process, ProcessId};
use crate::memory::duplicate;

/// Create a child of `parent` that resumes from `frame` with a private copy
/// of the parent's memory and descriptors.
///
/// Returns the child's id once the child has finished copying. The child
/// sees 0 in `rax`. If the copy fails the child is gone by the time this
/// returns, and the parent's children are as they were.
pub fn fork(
    kernel: &Arc<Kernel>,
    parent: ProcessId,
    name: &str,
    frame: &IntrFrame,
) -> Result<ProcessId, ProcError> {
    let owner = kernel.lookup(parent)?;
    let child = kernel.register_child(parent, name)?;
    let snapshot = *frame;

    let entry = {
        let kernel = kernel.clone();
        let child = child.clone();
        Box::new(move || fork_child(&kernel, &owner, &child, snapshot))
    };
    if let Err(e) = kernel.platform.spawn_thread(&child.name, entry) {
        kernel.forget_child(parent, child.pid);
        kernel.unregister(child.pid);
        crate::log_warn!("fork: process {}: {}", parent.0, e);
        return Err(e);
    }

    kernel.block_on(&child.load_signal);
    if child.load_outcome.get() != Some(&true) {
        return Err(ProcError::LoadFailed);
    }
    crate::log_info!("fork: process {} created child {}", parent.0, child.pid.0);
    Ok(child.pid)
}

/// Body of the child's thread.
fn fork_child(kernel: &Arc<Kernel>, parent: &Process, child: &Arc<Process>, mut frame: IntrFrame) {
    match copy_resources(kernel, parent, child) {
        Ok(root) => {
            kernel.platform.activate(Some(root));
            frame.rax = 0;
            child.load_outcome.call_once(|| true);
            child.load_signal.up();
            run_user(kernel, child.pid, frame);
        }
        Err(e) => {
            crate::log_warn!("fork: child {} of {}: {}", child.pid.0, parent.pid.0, e);
            abandon_start(kernel, child);
        }
    }
}

/// Give `child` copies of `parent`'s address space and file descriptors.
/// Nothing is installed in `child` unless both copies succeed.
fn copy_resources(kernel: &Kernel, parent: &Process, child: &Process) -> Result<PhysFrame, ProcError> {
    let _fs = kernel.fs_lock.lock();
    let theirs = parent.resources.lock();
    let source = theirs.address_space.as_ref().ok_or(ProcError::NoAddressSpace)?;

    let mut space = kernel.new_address_space()?;
    {
        let mut frames = kernel.frames.lock();
        if let Err(e) = duplicate(&mut space, source, &mut frames) {
            space.destroy(&mut frames);
            return Err(e.into());
        }
    }
    let fds = match theirs.fds.fork() {
        Ok(fds) => fds,
        Err(e) => {
            kernel.destroy_address_space(space);
            return Err(e.into());
        }
    };
    drop(theirs);

    let root = space.root();
    let mut mine = child.resources.lock();
    mine.address_space = Some(space);
    mine.fds = fds;
    Ok(root)
}
