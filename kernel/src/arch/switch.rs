//! Raw context switch.
//!
//! Saves the callee-saved registers on the outgoing task's kernel stack,
//! parks its RSP in the task's save cell, loads the incoming task's RSP and
//! pops its registers. The `ret` at the end returns into whatever address
//! sits on the incoming stack: for a running task that is the point where
//! it last called this function, for a newborn task it is the entry
//! trampoline seeded by `Task::prepare_initial_stack`.
//!
//! Everything above this boundary is ordinary structured control flow;
//! this is the only place where execution jumps between stacks.

#[cfg(target_os = "none")]
core::arch::global_asm!(
    ".global __ferrox_context_switch",
    "__ferrox_context_switch:",
    // rdi = &mut outgoing.saved_rsp
    // rsi = incoming.saved_rsp
    //
    // Save callee-saved registers on the outgoing stack
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    // Park the outgoing RSP
    "mov [rdi], rsp",
    // Load the incoming RSP
    "mov rsp, rsi",
    // Restore callee-saved registers from the incoming stack
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    // Return to wherever the incoming task left off
    "ret",
);

#[cfg(target_os = "none")]
extern "C" {
    fn __ferrox_context_switch(old_rsp_ptr: *mut u64, new_rsp: u64);
}

/// Number of register slots `Task::prepare_initial_stack` must seed:
/// r15, r14, r13, r12, rbx, rbp and the return address, in pop order.
pub const SWITCH_FRAME_WORDS: usize = 7;

/// Switch kernel stacks.
///
/// Returns when some later switch restores the outgoing task.
///
/// # Safety
/// Both values must refer to valid, correctly laid-out kernel stacks and
/// preemption must be masked. On a hosted build there is no second kernel
/// stack to run on; the call is a no-op and control continues in the
/// caller, which is what the scheduler bookkeeping tests rely on.
pub unsafe fn context_switch(old_rsp_ptr: *mut u64, new_rsp: u64) {
    #[cfg(target_os = "none")]
    unsafe {
        __ferrox_context_switch(old_rsp_ptr, new_rsp);
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = (old_rsp_ptr, new_rsp);
    }
}
