//! Ring 3 entry and re-entry.
//!
//! Two ways into user code: [`enter`] starts a fresh user task from an
//! `IretqFrame`, and [`return_to`] resumes a forked child from its parent's
//! saved trap frame (with the return register already patched). Both build
//! the five-word `iretq` frame on the kernel stack and fire `iretq`; the
//! CPU drops to CPL 3 and loads the user stack in one step.

use crate::task::TrapFrame;

/// User code segment selector: GDT entry 4, RPL 3.
pub const USER_CS: u64 = 0x23;
/// User data/stack segment selector: GDT entry 3, RPL 3.
pub const USER_SS: u64 = 0x1b;
/// RFLAGS for a fresh user task: IF set plus the always-one bit.
pub const USER_RFLAGS: u64 = 0x202;

/// The five words `iretq` pops, in push order.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct IretqFrame {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl IretqFrame {
    /// Frame for a brand-new ring 3 task.
    pub fn user(entry: u64, user_stack_top: u64) -> Self {
        Self {
            rip: entry,
            cs: USER_CS,
            rflags: USER_RFLAGS,
            rsp: user_stack_top,
            ss: USER_SS,
        }
    }
}

/// Drop to ring 3 for the first time.
///
/// # Safety
/// `frame` must describe a mapped, executable user RIP and a mapped user
/// stack. Never returns. Only reachable on bare metal.
#[cfg(target_os = "none")]
pub unsafe fn enter(frame: &IretqFrame) -> ! {
    unsafe {
        core::arch::asm!(
            "push {user_ss}",
            "push {user_rsp}",
            "push {user_rflags}",
            "push {user_cs}",
            "push {user_rip}",
            // Scrub scratch state so the new task starts clean
            "xor eax, eax",
            "xor ebx, ebx",
            "xor ecx, ecx",
            "xor edx, edx",
            "xor esi, esi",
            "xor edi, edi",
            "xor ebp, ebp",
            "iretq",
            user_ss = in(reg) frame.ss,
            user_rsp = in(reg) frame.rsp,
            user_rflags = in(reg) frame.rflags,
            user_cs = in(reg) frame.cs,
            user_rip = in(reg) frame.rip,
            options(noreturn)
        );
    }
}

#[cfg(not(target_os = "none"))]
pub unsafe fn enter(_frame: &IretqFrame) -> ! {
    unreachable!("ring 3 entry is only possible on bare metal");
}

/// Resume a task from a saved trap frame (the fork-child path).
///
/// Restores every general-purpose register from `frame`, then `iretq`s
/// through its rip/cs/rflags/rsp/ss tail. The child re-enters user code at
/// the exact instruction after the parent's `fork`, with rax already 0.
///
/// # Safety
/// `frame` must be a trap frame captured on this kernel's syscall path for
/// a live address space. Never returns. Only reachable on bare metal.
#[cfg(target_os = "none")]
pub unsafe fn return_to(frame: &TrapFrame) -> ! {
    unsafe {
        core::arch::asm!(
            // rdi holds the frame base; push the iretq tail first, while
            // it is still intact, then restore the GP registers (rdi last).
            "push qword ptr [rdi + 152]", // ss
            "push qword ptr [rdi + 144]", // rsp
            "push qword ptr [rdi + 136]", // rflags
            "push qword ptr [rdi + 128]", // cs
            "push qword ptr [rdi + 120]", // rip
            "mov rax, [rdi + 0]",
            "mov rbx, [rdi + 8]",
            "mov rcx, [rdi + 16]",
            "mov rdx, [rdi + 24]",
            "mov rsi, [rdi + 32]",
            "mov rbp, [rdi + 48]",
            "mov r8,  [rdi + 56]",
            "mov r9,  [rdi + 64]",
            "mov r10, [rdi + 72]",
            "mov r11, [rdi + 80]",
            "mov r12, [rdi + 88]",
            "mov r13, [rdi + 96]",
            "mov r14, [rdi + 104]",
            "mov r15, [rdi + 112]",
            "mov rdi, [rdi + 40]",
            "iretq",
            in("rdi") frame as *const TrapFrame,
            options(noreturn)
        );
    }
}

#[cfg(not(target_os = "none"))]
pub unsafe fn return_to(_frame: &TrapFrame) -> ! {
    unreachable!("ring 3 entry is only possible on bare metal");
}
