//! Process termination and the exit-status handoff to the parent.

use alloc::format;

use super::{Kernel, ProcError, Process, ProcessId, ProcessState};
use crate::config::EXIT_KILLED;

/// Terminate `pid` with `status`.
///
/// The first status recorded wins. Files and the executable are released,
/// then the address space is torn down: detached from the process, the
/// CPU switched to the kernel-only table, and only then freed. The
/// process becomes a zombie, wakes a waiting parent, and stays in the
/// table until that parent has read the status. A process nobody will
/// wait for reclaims itself at once.
///
/// On hardware this runs on the exiting process's own thread and never
/// returns to user mode; it returns here once the process is reclaimed.
pub fn exit(kernel: &Kernel, pid: ProcessId, status: i32) {
    let Some(proc) = kernel.process(pid) else { return };
    {
        let mut state = proc.state.lock();
        if *state != ProcessState::Running {
            return;
        }
        *state = ProcessState::Exiting;
    }
    let status = *proc.exit_status.call_once(|| status);
    kernel
        .platform
        .console_write(format!("{}: exit({})\n", proc.name, status).as_bytes());
    crate::log_info!("process {} ({}) exited with status {}", pid.0, proc.name, status);

    release_children(kernel, &proc);
    release_resources(kernel, &proc);

    *proc.state.lock() = ProcessState::Zombie;
    proc.wait_signal.up();
    if kernel.has_waiting_parent(&proc) {
        kernel.block_on(&proc.exit_signal);
    }
    kernel.unregister(pid);
    *proc.state.lock() = ProcessState::Reclaimed;
}

/// Hand every unwaited child its freedom: zombies finish reclaiming, and
/// running children will not block when they exit.
fn release_children(kernel: &Kernel, proc: &Process) {
    for child in kernel.take_children(proc) {
        child.exit_signal.up();
    }
}

fn release_resources(kernel: &Kernel, proc: &Process) {
    let space = {
        let _fs = kernel.fs_lock.lock();
        let mut res = proc.resources.lock();
        res.fds.close_files();
        res.running = None;
        res.address_space.take()
    };
    if let Some(space) = space {
        kernel.platform.activate(None);
        kernel.destroy_address_space(space);
    }
}

/// Wait for `child` of `parent` to exit and return its status.
///
/// Fails at once, without blocking, unless `child` is an unwaited child of
/// `parent`. A second wait on the same child therefore fails.
pub fn wait(kernel: &Kernel, parent: ProcessId, child: ProcessId) -> Result<i32, ProcError> {
    let me = kernel.lookup(parent)?;
    if !me.has_child(child) {
        return Err(ProcError::NotAChild);
    }
    // A listed child stays in the table until released below.
    let proc = kernel.lookup(child)?;
    kernel.block_on(&proc.wait_signal);
    let status = proc.exit_status().unwrap_or(EXIT_KILLED);
    kernel.forget_child(parent, child);
    proc.exit_signal.up();
    crate::log_info!("process {} collected child {} (status {})", parent.0, child.0, status);
    Ok(status)
}
