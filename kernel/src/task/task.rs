//! Task control block.
//!
//! Everything the kernel needs to manage one task: identity, scheduling
//! state, the embedded queue link, the kernel stack, and the owned
//! address-space and file-table resources.

use alloc::boxed::Box;
use alloc::string::String;

use crate::memory::AddressSpace;
use crate::util::list::ListNode;

/// Task identifier; equals the task's slot in the scheduler table.
pub type Pid = u32;

/// Index into the scheduler's slot table.
pub type Slot = usize;

/// Size of the fixed task table.
pub const TASK_SLOTS: usize = 64;

/// Open-file slots per task.
pub const TASK_FILES: usize = 32;

/// Handle into the (external) system file table.
pub type FileId = u32;

/// Default priority; doubles as the time-slice length in ticks.
pub const DEFAULT_PRIORITY: u32 = 3;

// ── Scheduling state ────────────────────────────────────────────

/// The possible states of a task.
///
/// `Running` is unique: exactly one task holds it. `Died` is terminal
/// until a parent reaps the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Being set up, not yet schedulable.
    Init,
    /// In the ready queue.
    Ready,
    /// Currently on the CPU.
    Running,
    /// Blocked on a queue (mutex, buffer cache, generic).
    Blocked,
    /// In the sleep queue until its wake tick.
    Sleeping,
    /// Blocked in `waitpid`.
    Waiting,
    /// Exited or killed; slot retained until reaped.
    Died,
}

/// What a blocked task is waiting for.
///
/// Wakers match on this instead of the resource keeping a raw pointer to
/// the waiter, so one shared queue can serve many resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitChannel {
    /// A specific cache buffer (by slot) that is exclusively locked.
    BufferSlot(usize),
}

/// `waitpid` filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    /// Any child.
    Any,
    /// One specific child.
    Pid(Pid),
}

impl WaitTarget {
    pub fn matches(&self, pid: Pid) -> bool {
        match self {
            WaitTarget::Any => true,
            WaitTarget::Pid(p) => *p == pid,
        }
    }
}

// ── Saved user context ──────────────────────────────────────────

/// General-purpose registers plus the iretq tail, as saved on syscall
/// entry. `fork` copies the parent's frame, zeroes `rax` and hands it to
/// the child; `arch::usermode::return_to` restores it field by field, so
/// the layout is load-bearing.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TrapFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

// ── Kernel stack ────────────────────────────────────────────────

/// Size of each task's kernel-mode stack (32 KiB).
///
/// Large enough for nested interrupt frames, the syscall stub, and the
/// deepest kernel call chains (buffer-cache acquisition during a page-in).
pub const KERNEL_STACK_SIZE: usize = 4096 * 8;

/// Written at the low end of every kernel stack; the stack grows down
/// toward it, so an overflow tramples this word first.
const STACK_GUARD: u64 = 0x5AFE_57AC_C0DE_F00D;

/// An aligned kernel stack with an overflow guard at its base.
#[repr(C, align(16))]
pub struct KernelStack {
    guard: u64,
    _pad: u64,
    data: [u8; KERNEL_STACK_SIZE],
}

impl KernelStack {
    /// Allocate directly on the heap.
    ///
    /// Going through `alloc_zeroed` avoids materialising the 32 KiB array
    /// on the current stack first, which would itself overflow when
    /// spawning from syscall context.
    pub fn alloc() -> Box<Self> {
        let mut stack = unsafe {
            let layout = core::alloc::Layout::new::<KernelStack>();
            let ptr = alloc::alloc::alloc_zeroed(layout) as *mut KernelStack;
            if ptr.is_null() {
                panic!("failed to allocate a kernel stack");
            }
            Box::from_raw(ptr)
        };
        stack.guard = STACK_GUARD;
        stack
    }

    /// Top of the stack (stacks grow downward).
    pub fn top(&self) -> u64 {
        self.data.as_ptr() as u64 + KERNEL_STACK_SIZE as u64
    }

    #[inline]
    pub fn guard_intact(&self) -> bool {
        self.guard == STACK_GUARD
    }

    #[cfg(test)]
    pub(crate) fn corrupt_guard(&mut self) {
        self.guard = 0;
    }
}

// ── Task control block ──────────────────────────────────────────

/// Per-task kernel metadata.
///
/// Owned exclusively by the scheduler's slot table; boxed so the embedded
/// list node and the RSP save cell keep stable addresses.
pub struct Task {
    /// Unique identifier; equals the slot index.
    pub pid: Pid,
    /// Parent task.
    pub ppid: Pid,
    /// Human-readable name (e.g. "init", "kflushd").
    pub name: String,
    /// Current scheduling state.
    pub state: TaskState,
    /// Queue link. At most one queue contains a task at any time; the
    /// node's key carries the wake tick while sleeping.
    pub(crate) node: ListNode,
    /// Priority; reloads the time slice when it runs out.
    pub priority: u32,
    /// Remaining time-slice ticks.
    pub ticks: u32,
    /// Scheduler tick stamp from the last timer interrupt this task took.
    pub jiffies: u64,
    /// Saved kernel RSP; the context switch parks and reloads it here.
    pub(crate) saved_rsp: u64,
    /// This task's kernel stack.
    pub(crate) kernel_stack: Box<KernelStack>,
    /// Entry point for the first dispatch (kernel fn or user RIP).
    pub(crate) entry: u64,
    /// Top of the user stack range (user tasks only).
    pub(crate) user_stack_top: u64,
    /// Page root + VM bitmap; `None` for pure kernel tasks.
    pub addr_space: Option<AddressSpace>,
    /// Open-file table.
    pub files: [Option<FileId>; TASK_FILES],
    /// Trap frame saved on syscall entry; what a forked child replays.
    pub(crate) frame: TrapFrame,
    /// Status recorded by `exit`, collected by `waitpid`.
    pub exit_status: i32,
    /// Set while blocked in `waitpid`.
    pub wait_for: Option<WaitTarget>,
    /// Set while blocked on a specific resource.
    pub wait_on: Option<WaitChannel>,
}

impl Task {
    pub(crate) fn new(slot: Slot, ppid: Pid, name: &str, priority: u32) -> Self {
        Self {
            pid: slot as Pid,
            ppid,
            name: String::from(name),
            state: TaskState::Init,
            node: ListNode::new(slot),
            priority,
            ticks: priority.max(1),
            jiffies: 0,
            saved_rsp: 0,
            kernel_stack: KernelStack::alloc(),
            entry: 0,
            user_stack_top: 0,
            addr_space: None,
            files: [None; TASK_FILES],
            frame: TrapFrame::default(),
            exit_status: 0,
            wait_for: None,
            wait_on: None,
        }
    }

    pub(crate) fn node_ptr(&mut self) -> *mut ListNode {
        &mut self.node
    }

    /// Seed the kernel stack so the first context switch "returns" into
    /// `trampoline`.
    ///
    /// The stack is laid out as if `context_switch` had just pushed the
    /// callee-saved registers:
    ///   [top - 8]  return address (the trampoline)
    ///   [top - 16] rbp
    ///   ...
    ///   [top - 56] r15
    pub(crate) fn prepare_initial_stack(&mut self, trampoline: u64) {
        let top = self.kernel_stack.top();
        let words = crate::arch::SWITCH_FRAME_WORDS as u64;
        let sp = top - words * 8;

        // We own this stack and it is far bigger than seven words.
        unsafe {
            let ptr = sp as *mut u64;
            for i in 0..(crate::arch::SWITCH_FRAME_WORDS - 1) {
                ptr.add(i).write(0); // r15, r14, r13, r12, rbx, rbp
            }
            ptr.add(crate::arch::SWITCH_FRAME_WORDS - 1).write(trampoline);
        }

        self.saved_rsp = sp;
    }

    /// Panic if the stack has grown into the guard word.
    ///
    /// Checked on every timer tick and every switch away; corruption here
    /// means kernel memory above the stack is already gone.
    pub(crate) fn check_stack_guard(&self) {
        if !self.kernel_stack.guard_intact() {
            panic!("kernel stack overflow in task {} ({})", self.pid, self.name);
        }
    }

    /// Lowest free slot in the open-file table.
    pub fn alloc_fd(&mut self, file: FileId) -> Option<usize> {
        let fd = self.files.iter().position(|f| f.is_none())?;
        self.files[fd] = Some(file);
        Some(fd)
    }

    pub fn close_fd(&mut self, fd: usize) -> Option<FileId> {
        self.files.get_mut(fd)?.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_stack_seeds_the_trampoline() {
        let mut task = Task::new(1, 0, "seed", DEFAULT_PRIORITY);
        task.prepare_initial_stack(0xdead_beef);
        let top = task.kernel_stack.top();
        assert_eq!(task.saved_rsp, top - 7 * 8);
        let rip = unsafe { *((top - 8) as *const u64) };
        assert_eq!(rip, 0xdead_beef);
    }

    #[test]
    fn fresh_stack_guard_is_intact() {
        let task = Task::new(1, 0, "guard", DEFAULT_PRIORITY);
        task.check_stack_guard();
    }

    #[test]
    #[should_panic(expected = "stack overflow")]
    fn trampled_guard_panics() {
        let mut task = Task::new(1, 0, "guard", DEFAULT_PRIORITY);
        task.kernel_stack.corrupt_guard();
        task.check_stack_guard();
    }

    #[test]
    fn fd_table_allocates_lowest_free() {
        let mut task = Task::new(1, 0, "fds", DEFAULT_PRIORITY);
        assert_eq!(task.alloc_fd(10), Some(0));
        assert_eq!(task.alloc_fd(11), Some(1));
        assert_eq!(task.close_fd(0), Some(10));
        assert_eq!(task.alloc_fd(12), Some(0));
    }

    #[test]
    fn wait_target_matching() {
        assert!(WaitTarget::Any.matches(5));
        assert!(WaitTarget::Pid(5).matches(5));
        assert!(!WaitTarget::Pid(5).matches(6));
    }
}
