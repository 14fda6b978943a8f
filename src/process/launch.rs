//! Starting programs: the initial process and exec.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::{exit, IntrFrame, Kernel, ProcError, Process, ProcessId, KERNEL_PID};
use crate::config::EXIT_KILLED;
use crate::fs::OpenFile;
use crate::loader::{self, build_args, parse_args, ExecError};
use crate::memory::AddressSpace;

/// Start the first user program from `cmdline` as a child of the kernel
/// pseudo-process.
///
/// Blocks until the program is loaded. If loading fails the process has
/// already been reclaimed when this returns.
pub fn create_initial_process(kernel: &Arc<Kernel>, cmdline: &str) -> Result<ProcessId, ProcError> {
    let args: Vec<String> = parse_args(cmdline)?.into_iter().map(String::from).collect();
    let proc = kernel.register_child(KERNEL_PID, &args[0])?;

    let entry = {
        let kernel = kernel.clone();
        let proc = proc.clone();
        Box::new(move || start_process(&kernel, &proc, args))
    };
    if let Err(e) = kernel.platform.spawn_thread(&proc.name, entry) {
        kernel.forget_child(KERNEL_PID, proc.pid);
        kernel.unregister(proc.pid);
        return Err(e);
    }

    kernel.block_on(&proc.load_signal);
    if proc.load_outcome.get() != Some(&true) {
        return Err(ProcError::LoadFailed);
    }
    Ok(proc.pid)
}

/// Body of a new process's thread: load the program and enter it.
fn start_process(kernel: &Arc<Kernel>, proc: &Arc<Process>, args: Vec<String>) {
    let argv: Vec<&str> = args.iter().map(String::as_str).collect();
    match prepare_image(kernel, &argv) {
        Ok((space, file, frame)) => {
            let root = space.root();
            {
                let mut res = proc.resources.lock();
                res.address_space = Some(space);
                res.running = Some(file);
            }
            kernel.platform.activate(Some(root));
            proc.load_outcome.call_once(|| true);
            proc.load_signal.up();
            crate::log_info!("process {} ({}) started", proc.pid.0, proc.name);
            run_user(kernel, proc.pid, frame);
        }
        Err(_) => abandon_start(kernel, proc),
    }
}

/// A process that never got a runnable image: it is dropped from its
/// parent's children, terminated and reclaimed, and only then is the
/// parent woken.
pub(crate) fn abandon_start(kernel: &Kernel, proc: &Process) {
    proc.load_outcome.call_once(|| false);
    proc.exit_status.call_once(|| EXIT_KILLED);
    if let Some(parent) = proc.parent {
        kernel.forget_child(parent, proc.pid);
    }
    exit(kernel, proc.pid, EXIT_KILLED);
    proc.load_signal.up();
}

/// Run user code for `pid`. A program that stops without calling exit is
/// killed.
pub(crate) fn run_user(kernel: &Arc<Kernel>, pid: ProcessId, frame: IntrFrame) {
    kernel.platform.enter_user(kernel, pid, frame);
    if kernel.process(pid).map_or(false, |p| p.is_running()) {
        exit(kernel, pid, EXIT_KILLED);
    }
}

/// Load `argv[0]` into a fresh address space and lay out its arguments.
/// On failure everything built so far is released.
fn prepare_image(
    kernel: &Kernel,
    argv: &[&str],
) -> Result<(AddressSpace, OpenFile, IntrFrame), ExecError> {
    let mut space = kernel.new_address_space()?;
    let built = loader::load(kernel, argv[0], &mut space).and_then(|image| {
        let layout = build_args(&space, &mut kernel.frames.lock(), image.stack_top, argv)?;
        let mut frame = IntrFrame::user(image.entry, layout.rsp);
        frame.rdi = layout.argc;
        frame.rsi = layout.argv;
        Ok((image.file, frame))
    });
    match built {
        Ok((file, frame)) => Ok((space, file, frame)),
        Err(e) => {
            kernel.destroy_address_space(space);
            Err(e)
        }
    }
}

/// Replace the program of `pid` with the one named by `cmdline`.
///
/// On success `frame` holds the new program's entry state and the old
/// image is gone. On failure nothing changes.
pub fn exec(
    kernel: &Kernel,
    pid: ProcessId,
    cmdline: &str,
    frame: &mut IntrFrame,
) -> Result<(), ProcError> {
    let proc = kernel.lookup(pid)?;
    let args = parse_args(cmdline)?;
    let (space, file, entry) = prepare_image(kernel, &args)?;

    let root = space.root();
    let old = {
        let _fs = kernel.fs_lock.lock();
        let mut res = proc.resources.lock();
        res.running = Some(file);
        res.address_space.replace(space)
    };
    kernel.platform.activate(Some(root));
    if let Some(old) = old {
        kernel.destroy_address_space(old);
    }
    *frame = entry;
    crate::log_info!("process {} ({}) exec '{}'", pid.0, proc.name, args[0]);
    Ok(())
}
