//! User processes: the process table, fork, program launch, exit and
//! wait.
//!
//! Every operation names the acting process explicitly. Parent and child
//! refer to each other only by [`ProcessId`] through the table held by
//! [`Kernel`].

pub mod exit;
pub mod fork;
pub mod frame;
pub mod launch;
pub mod task;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use spin::Mutex;
use x86_64::structures::paging::PhysFrame;

pub use exit::{exit, wait};
pub use fork::fork;
pub use frame::IntrFrame;
pub use launch::{create_initial_process, exec};
pub use task::{Process, ProcessId, ProcessState};

use crate::fs::{FileSystem, FsError};
use crate::sync::Semaphore;
use crate::loader::ExecError;
use crate::memory::{AddressSpace, FramePool, MapError};

/// The kernel pseudo-process. It never runs user code; it parents the
/// initial process so boot code can wait for it.
pub const KERNEL_PID: ProcessId = ProcessId(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcError {
    NoSuchProcess,
    /// Not a child of the caller, or already waited for.
    NotAChild,
    NoAddressSpace,
    ThreadSpawn,
    /// The new process could not build its image.
    LoadFailed,
    Exec(ExecError),
    Memory(MapError),
    Fs(FsError),
}

impl fmt::Display for ProcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProcError::NoSuchProcess  => write!(f, "No such process"),
            ProcError::NotAChild      => write!(f, "Not a waitable child"),
            ProcError::NoAddressSpace => write!(f, "Process has no address space"),
            ProcError::ThreadSpawn    => write!(f, "Cannot create kernel thread"),
            ProcError::LoadFailed     => write!(f, "Child failed to load"),
            ProcError::Exec(e)        => write!(f, "{}", e),
            ProcError::Memory(e)      => write!(f, "{}", e),
            ProcError::Fs(e)          => write!(f, "{}", e),
        }
    }
}

impl From<ExecError> for ProcError {
    fn from(e: ExecError) -> Self {
        ProcError::Exec(e)
    }
}

impl From<MapError> for ProcError {
    fn from(e: MapError) -> Self {
        ProcError::Memory(e)
    }
}

impl From<FsError> for ProcError {
    fn from(e: FsError) -> Self {
        ProcError::Fs(e)
    }
}

/// Body of a new kernel thread.
pub type ThreadEntry = Box<dyn FnOnce() + Send + 'static>;

/// Machine services the process core runs on.
pub trait Platform: Send + Sync {
    /// Start a schedulable kernel thread running `entry`.
    fn spawn_thread(&self, name: &str, entry: ThreadEntry) -> Result<(), ProcError>;

    /// Load `root` into CR3 on this CPU, or the kernel-only table for
    /// `None`.
    fn activate(&self, root: Option<PhysFrame>);

    /// Drop to ring 3 with `frame`. Does not return on hardware; a hosted
    /// platform returns once the simulated program is done.
    fn enter_user(&self, kernel: &Arc<Kernel>, pid: ProcessId, frame: IntrFrame);

    /// Give up the CPU while blocked on a rendezvous.
    fn yield_now(&self);

    fn console_write(&self, bytes: &[u8]);

    /// Read keyboard input into `buf`, returning the count read.
    fn console_read(&self, buf: &mut [u8]) -> usize;

    fn power_off(&self);
}

struct ProcessTable {
    procs: BTreeMap<ProcessId, Arc<Process>>,
    next_pid: u64,
}

/// The process core's view of the machine.
///
/// Lock order: process table, filesystem lock, process resources (parent
/// before child), frame pool.
pub struct Kernel {
    pub(crate) frames: Mutex<FramePool>,
    kernel_root: Option<PhysFrame>,
    pub(crate) fs: Arc<dyn FileSystem>,
    /// Serializes every filesystem access made on behalf of a process.
    pub(crate) fs_lock: Mutex<()>,
    pub(crate) platform: Arc<dyn Platform>,
    table: Mutex<ProcessTable>,
}

impl Kernel {
    /// `kernel_root` is the table whose upper half every address space
    /// shares.
    pub fn new(
        frames: FramePool,
        kernel_root: Option<PhysFrame>,
        fs: Arc<dyn FileSystem>,
        platform: Arc<dyn Platform>,
    ) -> Arc<Self> {
        #[cfg(not(test))]
        crate::serial::init();

        let mut procs = BTreeMap::new();
        procs.insert(KERNEL_PID, Arc::new(Process::new(KERNEL_PID, "kernel", None)));
        crate::log_info!(
            "process core: {} frames, filesystem {}",
            frames.total_frames(),
            fs.name()
        );
        Arc::new(Kernel {
            frames: Mutex::new(frames),
            kernel_root,
            fs,
            fs_lock: Mutex::new(()),
            platform,
            table: Mutex::new(ProcessTable { procs, next_pid: 1 }),
        })
    }

    pub fn process(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.table.lock().procs.get(&pid).cloned()
    }

    pub(crate) fn lookup(&self, pid: ProcessId) -> Result<Arc<Process>, ProcError> {
        self.process(pid).ok_or(ProcError::NoSuchProcess)
    }

    /// Live processes, the kernel pseudo-process included.
    pub fn process_count(&self) -> usize {
        self.table.lock().procs.len()
    }

    pub fn free_frames(&self) -> usize {
        self.frames.lock().free_frames()
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    pub(crate) fn new_address_space(&self) -> Result<AddressSpace, MapError> {
        AddressSpace::new(&mut self.frames.lock(), self.kernel_root)
    }

    pub(crate) fn destroy_address_space(&self, space: AddressSpace) {
        space.destroy(&mut self.frames.lock());
    }

    /// Register a new process as a child of `parent`.
    pub(crate) fn register_child(
        &self,
        parent: ProcessId,
        name: &str,
    ) -> Result<Arc<Process>, ProcError> {
        let mut table = self.table.lock();
        let owner = table.procs.get(&parent).cloned().ok_or(ProcError::NoSuchProcess)?;
        let pid = ProcessId(table.next_pid);
        table.next_pid += 1;
        let child = Arc::new(Process::new(pid, name, Some(parent)));
        table.procs.insert(pid, child.clone());
        owner.children.lock().insert(pid);
        Ok(child)
    }

    /// Drop `child` from `parent`'s children. Returns whether it was there.
    pub(crate) fn forget_child(&self, parent: ProcessId, child: ProcessId) -> bool {
        let table = self.table.lock();
        table
            .procs
            .get(&parent)
            .map_or(false, |p| p.children.lock().remove(&child))
    }

    /// Whether `pid` is still listed by a live parent, which will collect
    /// its status.
    pub(crate) fn has_waiting_parent(&self, proc: &Process) -> bool {
        let table = self.table.lock();
        proc.parent
            .and_then(|parent| table.procs.get(&parent))
            .map_or(false, |p| p.children.lock().contains(&proc.pid))
    }

    /// Take every listed child away from `proc`.
    pub(crate) fn take_children(&self, proc: &Process) -> alloc::vec::Vec<Arc<Process>> {
        let table = self.table.lock();
        let mut children = proc.children.lock();
        let taken = children
            .iter()
            .filter_map(|pid| table.procs.get(pid).cloned())
            .collect();
        children.clear();
        taken
    }

    /// Block on `sema`, yielding the CPU between attempts.
    pub(crate) fn block_on(&self, sema: &Semaphore) {
        sema.down_with(|| self.platform.yield_now());
    }

    pub(crate) fn unregister(&self, pid: ProcessId) {
        self.table.lock().procs.remove(&pid);
    }
}
