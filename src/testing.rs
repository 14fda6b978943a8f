//! Host fixtures for unit tests: a platform built on `std::thread`,
//! simulated user programs, and an ELF image builder.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::Mutex;
use std::time::{Duration, Instant};
use x86_64::{
    structures::paging::{
        FrameAllocator, FrameDeallocator, Mapper, OffsetPageTable, Page, PageTable,
        PageTableFlags, PhysFrame,
    },
    VirtAddr,
};

use crate::config::{KERN_BASE, PAGE_SIZE, USER_STACK};
use crate::fs::RamFs;
use crate::memory::{AddressSpace, FramePool};
use crate::process::{self, IntrFrame, Kernel, Platform, ProcError, ProcessId, ThreadEntry};
use crate::syscalls::{self, SyscallFlow};

/// Frames in every test kernel's pool.
pub const POOL_FRAMES: usize = 512;

/// Bottom of the initial stack page, clear of the arguments at its top.
pub const SCRATCH: u64 = USER_STACK - PAGE_SIZE;

const PROGRAM_BASE: u64 = 0x40_0000;
const PROGRAM_STRIDE: u64 = 0x10_0000;

type ScriptFn = dyn Fn(&Arc<Kernel>, ProcessId, IntrFrame) + Send + Sync;

/// What a simulated user program does once entered.
#[derive(Clone)]
pub enum Program {
    /// Exit at once with this status.
    Exit(i32),
    /// Idle until [`HostPlatform::release`] names the process.
    Block,
    /// Run arbitrary kernel calls on the process's behalf.
    Script(Arc<ScriptFn>),
}

pub fn script(f: impl Fn(&Arc<Kernel>, ProcessId, IntrFrame) + Send + Sync + 'static) -> Program {
    Program::Script(Arc::new(f))
}

/// A platform that runs kernel threads as host threads and user programs
/// as closures picked by entry address.
pub struct HostPlatform {
    kernel: Mutex<Weak<Kernel>>,
    programs: Mutex<BTreeMap<u64, Program>>,
    entries: Mutex<BTreeMap<String, u64>>,
    console: Mutex<String>,
    input: Mutex<VecDeque<u8>>,
    activations: Mutex<Vec<(Option<PhysFrame>, usize)>>,
    releases: Mutex<BTreeMap<ProcessId, i32>>,
    fail_spawn: AtomicBool,
    powered_off: AtomicBool,
    yields: AtomicUsize,
}

impl HostPlatform {
    fn new() -> Self {
        HostPlatform {
            kernel: Mutex::new(Weak::new()),
            programs: Mutex::new(BTreeMap::new()),
            entries: Mutex::new(BTreeMap::new()),
            console: Mutex::new(String::new()),
            input: Mutex::new(VecDeque::new()),
            activations: Mutex::new(Vec::new()),
            releases: Mutex::new(BTreeMap::new()),
            fail_spawn: AtomicBool::new(false),
            powered_off: AtomicBool::new(false),
            yields: AtomicUsize::new(0),
        }
    }

    pub fn console(&self) -> String {
        self.console.lock().clone()
    }

    pub fn feed_input(&self, bytes: &[u8]) {
        self.input.lock().extend(bytes.iter().copied());
    }

    /// Every activation so far, with the free frame count at that moment.
    pub fn activations(&self) -> Vec<(Option<PhysFrame>, usize)> {
        self.activations.lock().clone()
    }

    /// Let a [`Program::Block`] process exit with `status`.
    pub fn release(&self, pid: ProcessId, status: i32) {
        self.releases.lock().insert(pid, status);
    }

    pub fn fail_spawns(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }

    pub fn powered_off(&self) -> bool {
        self.powered_off.load(Ordering::SeqCst)
    }

    /// How often a blocked kernel thread gave up the CPU.
    pub fn yields(&self) -> usize {
        self.yields.load(Ordering::SeqCst)
    }

    pub fn entry_of(&self, name: &str) -> u64 {
        self.entries.lock()[name]
    }

    fn block(&self, kernel: &Arc<Kernel>, pid: ProcessId) {
        loop {
            let released = self.releases.lock().remove(&pid);
            if let Some(status) = released {
                process::exit(kernel, pid, status);
                return;
            }
            if !kernel.process(pid).map_or(false, |p| p.is_running()) {
                return;
            }
            std::thread::yield_now();
        }
    }
}

impl Platform for HostPlatform {
    fn spawn_thread(&self, name: &str, entry: ThreadEntry) -> Result<(), ProcError> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(ProcError::ThreadSpawn);
        }
        std::thread::Builder::new()
            .name(String::from(name))
            .spawn(entry)
            .map(|_| ())
            .map_err(|_| ProcError::ThreadSpawn)
    }

    fn activate(&self, root: Option<PhysFrame>) {
        let free = self.kernel.lock().upgrade().map_or(0, |k| k.free_frames());
        self.activations.lock().push((root, free));
    }

    fn enter_user(&self, kernel: &Arc<Kernel>, pid: ProcessId, frame: IntrFrame) {
        let program = self.programs.lock().get(&frame.rip).cloned();
        match program {
            None => {}
            Some(Program::Exit(status)) => process::exit(kernel, pid, status),
            Some(Program::Block) => self.block(kernel, pid),
            Some(Program::Script(f)) => f(kernel, pid, frame),
        }
    }

    fn yield_now(&self) {
        self.yields.fetch_add(1, Ordering::SeqCst);
        std::thread::yield_now();
    }

    fn console_write(&self, bytes: &[u8]) {
        self.console.lock().push_str(&String::from_utf8_lossy(bytes));
    }

    fn console_read(&self, buf: &mut [u8]) -> usize {
        let mut input = self.input.lock();
        let n = buf.len().min(input.len());
        for (slot, byte) in buf.iter_mut().zip(input.drain(..n)) {
            *slot = byte;
        }
        n
    }

    fn power_off(&self) {
        self.powered_off.store(true, Ordering::SeqCst);
    }
}

/// A kernel-half template: a root with one kernel page mapped at
/// `KERN_BASE`.
pub fn kernel_template(frames: &mut FramePool) -> AddressSpace {
    let space = AddressSpace::new(frames, None).unwrap();
    let phys_offset = frames.phys_offset();
    let p4: &mut PageTable =
        unsafe { &mut *(phys_offset + space.root().start_address().as_u64()).as_mut_ptr() };
    let mut mapper = unsafe { OffsetPageTable::new(p4, phys_offset) };
    let frame = frames.allocate_zeroed().unwrap();
    let page: Page = Page::containing_address(VirtAddr::new(KERN_BASE));
    unsafe {
        mapper
            .map_to(page, frame, PageTableFlags::PRESENT | PageTableFlags::WRITABLE, frames)
            .unwrap()
            .ignore();
    }
    space
}

/// A kernel over a hosted frame pool and a ramfs holding `files`.
pub fn kernel_with(files: &[(&str, &[u8])]) -> (Arc<Kernel>, Arc<HostPlatform>) {
    let mut frames = FramePool::hosted(POOL_FRAMES);
    let template = kernel_template(&mut frames);
    let fs = RamFs::new("ramfs");
    for (path, data) in files {
        fs.install(path, data).unwrap();
    }
    let host = Arc::new(HostPlatform::new());
    let kernel = Kernel::new(frames, Some(template.root()), Arc::new(fs), host.clone());
    *host.kernel.lock() = Arc::downgrade(&kernel);
    (kernel, host)
}

/// A kernel whose ramfs holds one executable per entry of `programs`.
pub fn kernel_with_programs(programs: &[(&str, Program)]) -> (Arc<Kernel>, Arc<HostPlatform>) {
    let images: Vec<(String, Vec<u8>, u64)> = programs
        .iter()
        .enumerate()
        .map(|(i, (name, _))| {
            let entry = PROGRAM_BASE + i as u64 * PROGRAM_STRIDE;
            let image = ElfBuilder::new(entry)
                .segment(entry, b"\xf4", PAGE_SIZE, false)
                .segment(entry + 0x1_0000, b"data", PAGE_SIZE, true)
                .build();
            (String::from(*name), image, entry)
        })
        .collect();
    let files: Vec<(&str, &[u8])> = images
        .iter()
        .map(|(name, image, _)| (name.as_str(), image.as_slice()))
        .collect();
    let (kernel, host) = kernel_with(&files);
    for ((name, _, entry), (_, program)) in images.iter().zip(programs) {
        host.programs.lock().insert(*entry, program.clone());
        host.entries.lock().insert(name.clone(), *entry);
    }
    (kernel, host)
}

/// Wait until exactly `count` processes remain.
pub fn settle(kernel: &Kernel, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while kernel.process_count() != count {
        assert!(Instant::now() < deadline, "{} processes left", kernel.process_count());
        std::thread::yield_now();
    }
}

/// Allocate frames until only `leave` are free.
pub fn drain_frames(kernel: &Kernel, leave: usize) -> Vec<PhysFrame> {
    let mut frames = kernel.frames.lock();
    let mut taken = Vec::new();
    while frames.free_frames() > leave {
        taken.push(frames.allocate_frame().unwrap());
    }
    taken
}

pub fn return_frames(kernel: &Kernel, taken: Vec<PhysFrame>) {
    let mut frames = kernel.frames.lock();
    for frame in taken {
        unsafe { frames.deallocate_frame(frame) };
    }
}

/// Write into the user memory of `pid`.
pub fn poke(kernel: &Kernel, pid: ProcessId, addr: u64, data: &[u8]) {
    let proc = kernel.process(pid).unwrap();
    let res = proc.resources.lock();
    let space = res.address_space.as_ref().unwrap();
    space.write(&mut kernel.frames.lock(), addr, data).unwrap();
}

pub fn peek(kernel: &Kernel, pid: ProcessId, addr: u64, len: usize) -> Vec<u8> {
    let proc = kernel.process(pid).unwrap();
    let res = proc.resources.lock();
    let space = res.address_space.as_ref().unwrap();
    let mut buf = alloc::vec![0u8; len];
    space.read(&kernel.frames.lock(), addr, &mut buf).unwrap();
    buf
}

/// The argument strings a program was entered with.
pub fn read_argv(kernel: &Kernel, pid: ProcessId, frame: &IntrFrame) -> Vec<String> {
    (0..frame.rdi)
        .map(|i| {
            let mut ptr = [0u8; 8];
            ptr.copy_from_slice(&peek(kernel, pid, frame.rsi + 8 * i, 8));
            let mut at = u64::from_le_bytes(ptr);
            let mut word = Vec::new();
            loop {
                let byte = peek(kernel, pid, at, 1)[0];
                if byte == 0 {
                    break;
                }
                word.push(byte);
                at += 1;
            }
            String::from_utf8(word).unwrap()
        })
        .collect()
}

/// Issue system call `nr` as `pid` and return the flow and `rax`.
pub fn syscall(kernel: &Arc<Kernel>, pid: ProcessId, frame: &IntrFrame, nr: u64, args: &[u64]) -> (SyscallFlow, u64) {
    let mut call = *frame;
    call.rax = nr;
    call.rdi = args.first().copied().unwrap_or(0);
    call.rsi = args.get(1).copied().unwrap_or(0);
    call.rdx = args.get(2).copied().unwrap_or(0);
    let flow = syscalls::dispatch(kernel, pid, &mut call);
    (flow, call.rax)
}

/// Builds minimal ELF64 executables.
#[derive(Clone)]
pub struct ElfBuilder {
    entry: u64,
    segments: Vec<(u64, Vec<u8>, u64, bool)>,
    raw: Vec<u32>,
}

impl ElfBuilder {
    pub fn new(entry: u64) -> Self {
        ElfBuilder {
            entry,
            segments: Vec::new(),
            raw: Vec::new(),
        }
    }

    /// A `PT_LOAD` segment of `data` at `vaddr` spanning `memsz` bytes.
    pub fn segment(mut self, vaddr: u64, data: &[u8], memsz: u64, writable: bool) -> Self {
        self.segments.push((vaddr, data.to_vec(), memsz, writable));
        self
    }

    /// An extra program header of type `p_type` with every other field 0.
    pub fn raw_phdr(mut self, p_type: u32) -> Self {
        self.raw.push(p_type);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let phnum = self.segments.len() + self.raw.len();
        let mut out = alloc::vec![0u8; 64 + 56 * phnum];
        out[..7].copy_from_slice(&[0x7F, b'E', b'L', b'F', 2, 1, 1]);
        out[16..18].copy_from_slice(&2u16.to_le_bytes());
        out[18..20].copy_from_slice(&0x3Eu16.to_le_bytes());
        out[20..24].copy_from_slice(&1u32.to_le_bytes());
        out[24..32].copy_from_slice(&self.entry.to_le_bytes());
        out[32..40].copy_from_slice(&64u64.to_le_bytes());
        out[52..54].copy_from_slice(&64u16.to_le_bytes());
        out[54..56].copy_from_slice(&56u16.to_le_bytes());
        out[56..58].copy_from_slice(&(phnum as u16).to_le_bytes());

        for (i, (vaddr, data, memsz, writable)) in self.segments.iter().enumerate() {
            let base = (out.len() as u64 + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            let offset = base + vaddr % PAGE_SIZE;
            out.resize(offset as usize, 0);
            out.extend_from_slice(data);

            let flags: u32 = if *writable { 0b110 } else { 0b101 };
            let ph = 64 + 56 * i;
            out[ph..ph + 4].copy_from_slice(&1u32.to_le_bytes());
            out[ph + 4..ph + 8].copy_from_slice(&flags.to_le_bytes());
            out[ph + 8..ph + 16].copy_from_slice(&offset.to_le_bytes());
            out[ph + 16..ph + 24].copy_from_slice(&vaddr.to_le_bytes());
            out[ph + 24..ph + 32].copy_from_slice(&vaddr.to_le_bytes());
            out[ph + 32..ph + 40].copy_from_slice(&(data.len() as u64).to_le_bytes());
            out[ph + 40..ph + 48].copy_from_slice(&memsz.to_le_bytes());
            out[ph + 48..ph + 56].copy_from_slice(&PAGE_SIZE.to_le_bytes());
        }
        for (j, p_type) in self.raw.iter().enumerate() {
            let ph = 64 + 56 * (self.segments.len() + j);
            out[ph..ph + 4].copy_from_slice(&p_type.to_le_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{create_initial_process, wait, ProcessState, KERNEL_PID};

    #[test]
    fn test_release_while_another_process_is_parked() {
        let (kernel, host) = kernel_with_programs(&[("prog", Program::Block)]);
        let first = create_initial_process(&kernel, "prog").unwrap();
        let second = create_initial_process(&kernel, "prog").unwrap();
        let parked = kernel.process(first).unwrap();

        // `first` stays a zombie, blocked until the kernel waits for it.
        host.release(first, 1);
        while parked.state() != ProcessState::Zombie {
            std::thread::yield_now();
        }
        host.release(second, 2);
        assert_eq!(wait(&kernel, KERNEL_PID, second), Ok(2));
        assert_eq!(wait(&kernel, KERNEL_PID, first), Ok(1));
        settle(&kernel, 1);
    }
}
