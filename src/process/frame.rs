use x86_64::registers::rflags::RFlags;

/// User code selector (GDT index 4, RPL 3).
pub const USER_CS: u64 = 0x23;
/// User data/stack selector (GDT index 3, RPL 3).
pub const USER_SS: u64 = 0x1B;

/// User register state saved on entry to the kernel and restored by
/// `iretq` on the way back.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntrFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub es: u64,
    pub ds: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl IntrFrame {
    /// A fresh frame that enters user mode at `entry` on stack `rsp` with
    /// interrupts enabled.
    pub fn user(entry: u64, rsp: u64) -> Self {
        IntrFrame {
            rip: entry,
            rsp,
            cs: USER_CS,
            ss: USER_SS,
            ds: USER_SS,
            es: USER_SS,
            rflags: RFlags::INTERRUPT_FLAG.bits() | 0x2,
            ..IntrFrame::default()
        }
    }

    /// System call number.
    pub fn syscall_nr(&self) -> u64 {
        self.rax
    }

    /// The `n`th system call argument (0-based).
    pub fn arg(&self, n: usize) -> u64 {
        match n {
            0 => self.rdi,
            1 => self.rsi,
            2 => self.rdx,
            3 => self.r10,
            4 => self.r8,
            _ => self.r9,
        }
    }

    pub fn set_return(&mut self, value: u64) {
        self.rax = value;
    }
}
