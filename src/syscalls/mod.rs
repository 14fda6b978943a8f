//! System-call dispatch for user processes.
//!
//! The trap handler passes the caller's saved registers: the call number in
//! `rax` and arguments in `rdi`, `rsi`, `rdx`. The result goes back in
//! `rax`; `-1` reports failure.

pub mod file;
pub mod user;

use alloc::sync::Arc;

use crate::config::{EXIT_KILLED, MAX_CMDLINE_LEN};
use crate::process::{self, IntrFrame, Kernel, Process, ProcessId};
use user::Fault;

/// Syscall numbers (passed in RAX from userland).
pub const SYS_HALT: u64     = 0;
pub const SYS_EXIT: u64     = 1;
pub const SYS_FORK: u64     = 2;
pub const SYS_EXEC: u64     = 3;
pub const SYS_WAIT: u64     = 4;
pub const SYS_CREATE: u64   = 5;
pub const SYS_REMOVE: u64   = 6;
pub const SYS_OPEN: u64     = 7;
pub const SYS_FILESIZE: u64 = 8;
pub const SYS_READ: u64     = 9;
pub const SYS_WRITE: u64    = 10;
pub const SYS_SEEK: u64     = 11;
pub const SYS_TELL: u64     = 12;
pub const SYS_CLOSE: u64    = 13;

pub(crate) const SYS_ERR: u64 = -1i64 as u64;
pub(crate) const TRUE: u64 = 1;
pub(crate) const FALSE: u64 = 0;

pub(crate) type SysResult = Result<u64, Fault>;

/// What the trap handler does after a system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallFlow {
    /// Return to user mode with the updated frame.
    Resume,
    /// The caller is gone; do not return to it.
    Exited,
    /// The machine was powered off.
    Halt,
}

/// Central syscall dispatcher, called from the trap handler on behalf of
/// `pid`.
pub fn dispatch(kernel: &Arc<Kernel>, pid: ProcessId, frame: &mut IntrFrame) -> SyscallFlow {
    let nr = frame.syscall_nr();
    let Some(proc) = kernel.process(pid) else {
        return SyscallFlow::Exited;
    };
    let (a0, a1, a2) = (frame.arg(0), frame.arg(1), frame.arg(2));

    let result = match nr {
        SYS_HALT => {
            crate::log_info!("process {} halted the machine", pid.0);
            kernel.platform.power_off();
            return SyscallFlow::Halt;
        }
        SYS_EXIT => {
            process::exit(kernel, pid, a0 as i32);
            return SyscallFlow::Exited;
        }
        SYS_FORK => sys_fork(kernel, &proc, frame),
        SYS_EXEC => sys_exec(kernel, &proc, frame),
        SYS_WAIT => Ok(process::wait(kernel, pid, ProcessId(a0))
            .map_or(SYS_ERR, |status| status as i64 as u64)),
        SYS_CREATE => file::create(kernel, &proc, a0, a1),
        SYS_REMOVE => file::remove(kernel, &proc, a0),
        SYS_OPEN => file::open(kernel, &proc, a0),
        SYS_FILESIZE => file::filesize(kernel, &proc, a0 as usize),
        SYS_READ => file::read(kernel, &proc, a0 as usize, a1, a2 as usize),
        SYS_WRITE => file::write(kernel, &proc, a0 as usize, a1, a2 as usize),
        SYS_SEEK => file::seek(kernel, &proc, a0 as usize, a1),
        SYS_TELL => file::tell(kernel, &proc, a0 as usize),
        SYS_CLOSE => file::close(kernel, &proc, a0 as usize),
        _ => Err(Fault::UnknownCall(nr)),
    };

    #[cfg(feature = "trace-syscalls")]
    crate::log_info!("syscall {} from process {} -> {:?}", nr, pid.0, result);

    match result {
        Ok(value) => {
            frame.set_return(value);
            SyscallFlow::Resume
        }
        Err(fault) => {
            crate::log_warn!("process {} ({}) killed: {:?}", pid.0, proc.name, fault);
            process::exit(kernel, pid, EXIT_KILLED);
            SyscallFlow::Exited
        }
    }
}

fn sys_fork(kernel: &Arc<Kernel>, proc: &Process, frame: &IntrFrame) -> SysResult {
    let name = user::copy_in_str(kernel, proc, frame.arg(0), MAX_CMDLINE_LEN)?;
    let name = if name.is_empty() { proc.name.as_str() } else { name.as_str() };
    Ok(process::fork(kernel, proc.pid, name, frame).map_or(SYS_ERR, |child| child.0))
}

fn sys_exec(kernel: &Kernel, proc: &Process, frame: &mut IntrFrame) -> SysResult {
    let cmdline = user::copy_in_str(kernel, proc, frame.arg(0), MAX_CMDLINE_LEN)?;
    Ok(match process::exec(kernel, proc.pid, &cmdline, frame) {
        // The frame now starts the new program.
        Ok(()) => frame.rax,
        Err(_) => SYS_ERR,
    })
}
