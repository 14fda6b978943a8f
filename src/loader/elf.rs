use alloc::vec;
use bitflags::bitflags;
use x86_64::{
    structures::paging::{FrameDeallocator, Page},
    VirtAddr,
};

use super::ExecError;
use crate::config::{MAX_PHNUM, PAGE_MASK, PAGE_SIZE, USER_STACK};
use crate::fs::OpenFile;
use crate::memory::{is_user_vaddr, page_size, pg_round_up, AddressSpace, FramePool};
use crate::process::Kernel;

// ══════════════════════════════════════════════════════════════
//  ELF64 constants
// ══════════════════════════════════════════════════════════════

/// Magic, 64-bit class, little-endian data, current ident version.
const ELF_IDENT: [u8; 7] = [0x7F, b'E', b'L', b'F', 2, 1, 1];
const ET_EXEC: u16      = 2;
const EM_X86_64: u16    = 0x3E;
const EV_CURRENT: u32   = 1;

const EHDR_SIZE: usize  = 64;
const PHDR_SIZE: usize  = 56;

const PT_LOAD: u32      = 1;
const PT_DYNAMIC: u32   = 2;
const PT_INTERP: u32    = 3;
const PT_SHLIB: u32     = 5;

bitflags! {
    /// Program header `p_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const EXECUTE = 1;
        const WRITE   = 1 << 1;
        const READ    = 1 << 2;
    }
}

fn le_u16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn le_u32(b: &[u8], off: usize) -> u32 {
    let mut w = [0u8; 4];
    w.copy_from_slice(&b[off..off + 4]);
    u32::from_le_bytes(w)
}

fn le_u64(b: &[u8], off: usize) -> u64 {
    let mut w = [0u8; 8];
    w.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(w)
}

// ══════════════════════════════════════════════════════════════
//  ELF64 structures
// ══════════════════════════════════════════════════════════════

struct Elf64Ehdr {
    e_entry: u64,
    e_phoff: u64,
    e_phnum: u16,
}

impl Elf64Ehdr {
    fn parse(data: &[u8; EHDR_SIZE]) -> Result<Self, ExecError> {
        if data[..7] != ELF_IDENT { return Err(ExecError::InvalidFormat); }

        let e_type = le_u16(data, 16);
        let e_machine = le_u16(data, 18);
        let e_version = le_u32(data, 20);
        let e_phentsize = le_u16(data, 54);
        let e_phnum = le_u16(data, 56);
        if e_type != ET_EXEC { return Err(ExecError::UnsupportedType); }
        if e_machine != EM_X86_64 { return Err(ExecError::UnsupportedArch); }
        if e_version != EV_CURRENT { return Err(ExecError::InvalidFormat); }
        if e_phentsize as usize != PHDR_SIZE { return Err(ExecError::InvalidFormat); }
        if e_phnum > MAX_PHNUM { return Err(ExecError::TooManySegments); }

        Ok(Elf64Ehdr {
            e_entry: le_u64(data, 24),
            e_phoff: le_u64(data, 32),
            e_phnum,
        })
    }
}

struct Elf64Phdr {
    p_type: u32,
    p_flags: SegmentFlags,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

impl Elf64Phdr {
    fn parse(data: &[u8; PHDR_SIZE]) -> Self {
        Elf64Phdr {
            p_type: le_u32(data, 0),
            p_flags: SegmentFlags::from_bits_retain(le_u32(data, 4)),
            p_offset: le_u64(data, 8),
            p_vaddr: le_u64(data, 16),
            p_filesz: le_u64(data, 32),
            p_memsz: le_u64(data, 40),
        }
    }

    /// Whether this loadable segment can be mapped into a user address
    /// space backed by a file of `file_len` bytes.
    fn is_valid(&self, file_len: u64) -> bool {
        if self.p_offset & PAGE_MASK != self.p_vaddr & PAGE_MASK { return false; }
        if self.p_offset > file_len { return false; }
        if self.p_memsz < self.p_filesz { return false; }
        if self.p_memsz == 0 { return false; }
        let Some(end) = self.p_vaddr.checked_add(self.p_memsz) else { return false };
        if !is_user_vaddr(self.p_vaddr) || !is_user_vaddr(end) { return false; }
        // Page 0 stays unmapped so user null dereferences fault.
        self.p_vaddr >= PAGE_SIZE
    }
}

// ══════════════════════════════════════════════════════════════
//  ELF Loader
// ══════════════════════════════════════════════════════════════

/// A program image mapped into an address space.
#[derive(Debug)]
pub struct LoadedImage {
    pub entry: u64,
    /// Initial stack pointer: the top of the mapped stack page.
    pub stack_top: u64,
    /// The executable, held open with writes denied.
    pub file: OpenFile,
}

/// Load the ELF executable at `path` into `space` and map its stack page.
///
/// The filesystem lock is held for the whole load. On failure `space` may
/// be partly filled; the caller destroys it.
pub fn load(kernel: &Kernel, path: &str, space: &mut AddressSpace) -> Result<LoadedImage, ExecError> {
    let _fs = kernel.fs_lock.lock();
    let mut frames = kernel.frames.lock();
    load_locked(kernel, path, space, &mut frames).map_err(|e| {
        crate::log_warn!("load: {}: {}", path, e);
        e
    })
}

fn load_locked(
    kernel: &Kernel,
    path: &str,
    space: &mut AddressSpace,
    frames: &mut FramePool,
) -> Result<LoadedImage, ExecError> {
    let mut file = OpenFile::open(&kernel.fs, path)?;
    file.deny_write();

    let mut header = [0u8; EHDR_SIZE];
    if file.read(&mut header)? != EHDR_SIZE {
        return Err(ExecError::InvalidFormat);
    }
    let ehdr = Elf64Ehdr::parse(&header)?;
    let file_len = file.length()? as u64;

    let mut file_ofs = ehdr.e_phoff;
    for _ in 0..ehdr.e_phnum {
        if file_ofs > file_len {
            return Err(ExecError::InvalidFormat);
        }
        let mut raw = [0u8; PHDR_SIZE];
        if file.read_at(file_ofs as usize, &mut raw)? != PHDR_SIZE {
            return Err(ExecError::ReadError);
        }
        file_ofs += PHDR_SIZE as u64;

        let phdr = Elf64Phdr::parse(&raw);
        match phdr.p_type {
            PT_DYNAMIC | PT_INTERP | PT_SHLIB => return Err(ExecError::DynamicLinking),
            PT_LOAD => {
                if !phdr.is_valid(file_len) {
                    return Err(ExecError::BadSegment);
                }
                load_segment(&file, &phdr, space, frames)?;
            }
            _ => {}
        }
    }

    setup_stack(space, frames)?;
    Ok(LoadedImage {
        entry: ehdr.e_entry,
        stack_top: USER_STACK,
        file,
    })
}

/// Map the pages of one validated `PT_LOAD` segment: the file-backed
/// prefix is read in, the rest up to the page-rounded memory size is zero.
fn load_segment(
    file: &OpenFile,
    phdr: &Elf64Phdr,
    space: &mut AddressSpace,
    frames: &mut FramePool,
) -> Result<(), ExecError> {
    let writable = phdr.p_flags.contains(SegmentFlags::WRITE);
    let file_page = phdr.p_offset & !PAGE_MASK;
    let mem_page = phdr.p_vaddr & !PAGE_MASK;
    let page_offset = phdr.p_vaddr & PAGE_MASK;
    let mem_end = pg_round_up(page_offset + phdr.p_memsz).ok_or(ExecError::BadSegment)?;
    let mut read_bytes = if phdr.p_filesz > 0 { page_offset + phdr.p_filesz } else { 0 };
    let mut zero_bytes = mem_end - read_bytes;

    let mut buf = vec![0u8; page_size()];
    let mut upage = mem_page;
    let mut ofs = file_page;
    while read_bytes > 0 || zero_bytes > 0 {
        let page_read = read_bytes.min(PAGE_SIZE) as usize;
        let page_zero = page_size() - page_read;

        let frame = frames
            .allocate_zeroed()
            .ok_or(crate::memory::MapError::OutOfMemory)?;
        if page_read > 0 {
            let got = file.read_at(ofs as usize, &mut buf[..page_read]);
            if got != Ok(page_read) {
                unsafe { frames.deallocate_frame(frame) };
                return Err(match got {
                    Err(e) => e.into(),
                    Ok(_) => ExecError::ReadError,
                });
            }
            frames.write(frame, 0, &buf[..page_read]);
        }
        let page = Page::containing_address(VirtAddr::new(upage));
        if let Err(e) = space.install(page, frame, writable, frames) {
            unsafe { frames.deallocate_frame(frame) };
            return Err(e.into());
        }

        read_bytes -= page_read as u64;
        zero_bytes -= page_zero as u64;
        upage += PAGE_SIZE;
        ofs += page_read as u64;
    }
    Ok(())
}

/// Map a zeroed, writable page just below `USER_STACK`.
fn setup_stack(space: &mut AddressSpace, frames: &mut FramePool) -> Result<(), ExecError> {
    let frame = frames
        .allocate_zeroed()
        .ok_or(crate::memory::MapError::OutOfMemory)?;
    let page = Page::containing_address(VirtAddr::new(USER_STACK - PAGE_SIZE));
    if let Err(e) = space.install(page, frame, true, frames) {
        unsafe { frames.deallocate_frame(frame) };
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MapError;
    use crate::testing::{self, ElfBuilder};

    fn load_into(kernel: &Kernel, path: &str) -> (AddressSpace, Result<LoadedImage, ExecError>) {
        let mut space = kernel.new_address_space().unwrap();
        let result = load(kernel, path, &mut space);
        (space, result)
    }

    #[test]
    fn test_segments_cover_rounded_ranges_and_zero_tail() {
        let image = ElfBuilder::new(0x401000)
            .segment(0x401000, b"\x90\x90\xc3", 0x20, false)
            .segment(0x603010, b"data", 0x2000, true)
            .build();
        let (kernel, _) = testing::kernel_with(&[("prog", &image[..])]);
        let (space, result) = load_into(&kernel, "prog");
        let image = result.unwrap();
        assert_eq!(image.entry, 0x401000);
        assert_eq!(image.stack_top, USER_STACK);

        let pages: alloc::vec::Vec<u64> = space
            .user_mappings()
            .map(|m| m.page.start_address().as_u64())
            .collect();
        assert_eq!(
            pages,
            alloc::vec![0x401000, 0x603000, 0x604000, 0x605000, USER_STACK - PAGE_SIZE]
        );

        let frames = kernel.frames.lock();
        let mut buf = [0xFFu8; 8];
        space.read(&frames, 0x603010, &mut buf).unwrap();
        assert_eq!(&buf, b"data\0\0\0\0");
        let mut tail = [0xFFu8; 16];
        space.read(&frames, 0x605000 - 16, &mut tail).unwrap();
        assert_eq!(tail, [0u8; 16]);
        assert!(!space.translate(VirtAddr::new(0x401000)).unwrap().writable());
        assert!(space.translate(VirtAddr::new(0x603000)).unwrap().writable());
    }

    #[test]
    fn test_bad_headers_are_rejected() {
        let good = ElfBuilder::new(0x401000).segment(0x401000, b"x", 1, false);
        let mut bad_magic = good.clone().build();
        bad_magic[1] = b'X';
        let mut wrong_machine = good.clone().build();
        wrong_machine[18] = 0x28;
        let mut huge_phnum = good.clone().build();
        huge_phnum[56..58].copy_from_slice(&1025u16.to_le_bytes());
        let (kernel, _) = testing::kernel_with(&[
            ("magic", &bad_magic[..]),
            ("machine", &wrong_machine[..]),
            ("phnum", &huge_phnum[..]),
            ("short", &b"\x7fELF"[..]),
        ]);

        for (path, err) in [
            ("magic", ExecError::InvalidFormat),
            ("machine", ExecError::UnsupportedArch),
            ("phnum", ExecError::TooManySegments),
            ("short", ExecError::InvalidFormat),
            ("missing", ExecError::FileNotFound),
        ] {
            let (space, result) = load_into(&kernel, path);
            assert_eq!(result.unwrap_err(), err, "{}", path);
            assert_eq!(space.user_mappings().count(), 0);
            space.destroy(&mut kernel.frames.lock());
        }
    }

    #[test]
    fn test_invalid_segments_are_rejected() {
        let cases = [
            // Page zero.
            ElfBuilder::new(0x400).segment(0x400, b"x", 1, false),
            // memsz smaller than filesz.
            ElfBuilder::new(0x401000).segment(0x401000, b"xyz", 1, false),
            // Runs past the end of user space.
            ElfBuilder::new(0x401000).segment(0x7FFF_FFFF_F000, b"x", 0x2000, false),
            // Zero-sized.
            ElfBuilder::new(0x401000).segment(0x401000, b"", 0, false),
        ];
        for builder in cases {
            let image = builder.build();
            let (kernel, _) = testing::kernel_with(&[("prog", &image[..])]);
            let (_space, result) = load_into(&kernel, "prog");
            assert_eq!(result.unwrap_err(), ExecError::BadSegment);
        }
    }

    #[test]
    fn test_segment_placement_is_checked() {
        // First program header: p_offset at byte 72, p_vaddr at byte 80.
        let patched = |field: usize, value: u64| {
            let mut image = ElfBuilder::new(0x401000)
                .segment(0x401000, b"x", 1, false)
                .build();
            image[field..field + 8].copy_from_slice(&value.to_le_bytes());
            image
        };
        let misaligned = patched(72, 0x1001);
        let past_eof = patched(72, 0x10_0000);
        let wraps = patched(80, 0xFFFF_FFFF_FFFF_F000);
        assert_eq!(misaligned.len(), 0x1001);

        for image in [misaligned, past_eof, wraps] {
            let (kernel, _) = testing::kernel_with(&[("prog", &image[..])]);
            let (_space, result) = load_into(&kernel, "prog");
            assert_eq!(result.unwrap_err(), ExecError::BadSegment);
        }
    }

    #[test]
    fn test_dynamic_executables_are_rejected() {
        let image = ElfBuilder::new(0x401000)
            .segment(0x401000, b"x", 1, false)
            .raw_phdr(PT_INTERP)
            .build();
        let (kernel, _) = testing::kernel_with(&[("prog", &image[..])]);
        let (_space, result) = load_into(&kernel, "prog");
        assert_eq!(result.unwrap_err(), ExecError::DynamicLinking);
    }

    #[test]
    fn test_overlapping_segments_fail() {
        let image = ElfBuilder::new(0x401000)
            .segment(0x401000, b"a", 1, false)
            .segment(0x401800, b"b", 1, false)
            .build();
        let (kernel, _) = testing::kernel_with(&[("prog", &image[..])]);
        let (_space, result) = load_into(&kernel, "prog");
        assert_eq!(result.unwrap_err(), ExecError::Memory(MapError::AlreadyMapped));
    }

    #[test]
    fn test_running_executable_is_write_protected() {
        let image = ElfBuilder::new(0x401000).segment(0x401000, b"x", 1, false).build();
        let (kernel, _) = testing::kernel_with(&[("prog", &image[..])]);
        let (_space, result) = load_into(&kernel, "prog");
        let loaded = result.unwrap();
        let mut writer = OpenFile::open(&kernel.fs, "prog").unwrap();
        assert_eq!(writer.write(b"junk"), Ok(0));
        drop(loaded);
        assert_eq!(writer.write(b"junk"), Ok(4));
    }
}
