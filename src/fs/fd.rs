use alloc::vec::Vec;

use super::error::{FsError, FsResult};
use super::file::OpenFile;
use crate::config::MAX_FD;

pub const STDIN_FILENO: usize = 0;
pub const STDOUT_FILENO: usize = 1;

/// What a descriptor slot refers to.
#[derive(Debug)]
pub enum Descriptor {
    /// Console keyboard input.
    Stdin,
    /// Console output.
    Stdout,
    File(OpenFile),
}

impl Descriptor {
    fn try_clone(&self) -> FsResult<Self> {
        Ok(match self {
            Descriptor::Stdin => Descriptor::Stdin,
            Descriptor::Stdout => Descriptor::Stdout,
            Descriptor::File(file) => Descriptor::File(file.duplicate()?),
        })
    }
}

/// Per-process file descriptor table of `MAX_FD` slots.
#[derive(Debug)]
pub struct FdTable {
    slots: Vec<Option<Descriptor>>,
}

impl FdTable {
    /// Slots 0 and 1 hold the console; everything else is free.
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_FD);
        slots.push(Some(Descriptor::Stdin));
        slots.push(Some(Descriptor::Stdout));
        slots.resize_with(MAX_FD, || None);
        FdTable { slots }
    }

    /// Place `file` in the lowest free slot at or above 2.
    pub fn insert(&mut self, file: OpenFile) -> FsResult<usize> {
        let fd = (2..self.slots.len())
            .find(|&fd| self.slots[fd].is_none())
            .ok_or(FsError::NoFreeDescriptor)?;
        self.slots[fd] = Some(Descriptor::File(file));
        Ok(fd)
    }

    pub fn get_mut(&mut self, fd: usize) -> Option<&mut Descriptor> {
        self.slots.get_mut(fd).and_then(Option::as_mut)
    }

    /// The open file at `fd`, if the slot holds one.
    pub fn file_mut(&mut self, fd: usize) -> FsResult<&mut OpenFile> {
        match self.get_mut(fd) {
            Some(Descriptor::File(file)) => Ok(file),
            _ => Err(FsError::BadDescriptor),
        }
    }

    /// Close a file descriptor. The console slots cannot be closed.
    pub fn close(&mut self, fd: usize) -> FsResult<()> {
        match self.slots.get_mut(fd) {
            Some(slot) if matches!(slot, Some(Descriptor::File(_))) => {
                *slot = None;
                Ok(())
            }
            _ => Err(FsError::BadDescriptor),
        }
    }

    /// Close every file slot. Returns how many were open.
    pub fn close_files(&mut self) -> usize {
        let mut closed = 0;
        for slot in self.slots.iter_mut().skip(2) {
            if slot.take().is_some() {
                closed += 1;
            }
        }
        closed
    }

    pub fn open_files(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Some(Descriptor::File(_))))
            .count()
    }

    /// The table a forked child starts with: the same descriptor numbers,
    /// each file reopened with its own copy of the position.
    pub fn fork(&self) -> FsResult<FdTable> {
        let slots = self
            .slots
            .iter()
            .map(|slot| slot.as_ref().map(Descriptor::try_clone).transpose())
            .collect::<FsResult<Vec<_>>>()?;
        Ok(FdTable { slots })
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}
