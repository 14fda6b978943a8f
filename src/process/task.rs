use alloc::collections::BTreeSet;
use alloc::string::String;
use spin::{Mutex, Once};

use crate::config::MAX_NAME_LEN;
use crate::fs::{FdTable, OpenFile};
use crate::memory::AddressSpace;
use crate::sync::Semaphore;

/// Unique process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u64);

/// Process state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exiting,
    /// Exited; the status is available to the parent.
    Zombie,
    Reclaimed,
}

/// What a process owns and gives back when it exits.
#[derive(Debug, Default)]
pub struct Resources {
    pub address_space: Option<AddressSpace>,
    pub fds: FdTable,
    /// The executable backing the program, held open with writes denied.
    pub running: Option<OpenFile>,
}

/// A user process.
pub struct Process {
    pub pid: ProcessId,
    pub name: String,
    pub parent: Option<ProcessId>,
    /// Set once, by the first exit.
    pub(crate) exit_status: Once<i32>,
    /// Whether the child side of fork/exec produced a runnable image.
    pub(crate) load_outcome: Once<bool>,
    pub(crate) state: Mutex<ProcessState>,
    /// Children not yet waited for. Only changed with the process table
    /// locked.
    pub(crate) children: Mutex<BTreeSet<ProcessId>>,
    pub(crate) resources: Mutex<Resources>,
    /// Child to parent: the image is built (or failed).
    pub(crate) load_signal: Semaphore,
    /// Child to parent: the exit status is available.
    pub(crate) wait_signal: Semaphore,
    /// Parent to child: the status was collected, finish reclaiming.
    pub(crate) exit_signal: Semaphore,
}

impl Process {
    pub(crate) fn new(pid: ProcessId, name: &str, parent: Option<ProcessId>) -> Self {
        Process {
            pid,
            name: short_name(name),
            parent,
            exit_status: Once::new(),
            load_outcome: Once::new(),
            state: Mutex::new(ProcessState::Running),
            children: Mutex::new(BTreeSet::new()),
            resources: Mutex::new(Resources::default()),
            load_signal: Semaphore::new(0),
            wait_signal: Semaphore::new(0),
            exit_signal: Semaphore::new(0),
        }
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status.get().copied()
    }

    pub fn has_child(&self, child: ProcessId) -> bool {
        self.children.lock().contains(&child)
    }

    pub fn children(&self) -> alloc::vec::Vec<ProcessId> {
        self.children.lock().iter().copied().collect()
    }

    /// Number of file descriptors in use above the console slots.
    pub fn open_files(&self) -> usize {
        self.resources.lock().fds.open_files()
    }

    pub fn has_address_space(&self) -> bool {
        self.resources.lock().address_space.is_some()
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("state", &self.state())
            .field("exit_status", &self.exit_status())
            .finish()
    }
}

/// The program name, truncated on a character boundary.
fn short_name(name: &str) -> String {
    let mut end = name.len().min(MAX_NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    String::from(&name[..end])
}
