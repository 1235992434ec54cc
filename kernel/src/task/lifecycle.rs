//! Task lifecycle: spawn, fork, exit, waitpid, kill.
//!
//! Creation seeds a fresh kernel stack so that the first context switch
//! "returns" into a trampoline; which trampoline decides what kind of task
//! it becomes. Kernel tasks call their entry function directly. User tasks
//! build an address space and drop to ring 3. Forked children replay the
//! parent's saved trap frame with the return register zeroed.
//!
//! Death is two-phase: `exit`/`kill` park the task on the dead queue and
//! free what it owns, `waitpid` reaps the slot.

use alloc::boxed::Box;

use crate::arch::irq::IrqSave;
use crate::arch::usermode::{self, IretqFrame};
use crate::error::KernelError;
use crate::memory::{AddressSpace, PageProvider};
use crate::runtime;

use super::scheduler::Scheduler;
use super::task::{Pid, Slot, Task, TaskState, WaitTarget, TASK_SLOTS};

/// Pages reserved for each user stack.
pub const USER_STACK_PAGES: usize = 8;

impl Scheduler {
    // ── Creation ────────────────────────────────────────────────

    /// Create a kernel task running `entry` and make it ready.
    ///
    /// Exhausting the slot table is fatal: this kernel has no way to
    /// refuse work and keep going.
    pub fn spawn(&mut self, name: &str, entry: fn(), priority: u32) -> Pid {
        let _irq = IrqSave::masked();
        let slot = self.alloc_slot();
        let ppid = self.getpid();

        let mut task = Box::new(Task::new(slot, ppid, name, priority));
        task.entry = entry as usize as u64;
        task.prepare_initial_stack(kernel_task_trampoline as usize as u64);
        task.state = TaskState::Ready;

        log::debug!("spawn '{}' pid {} prio {}", name, slot, priority);
        self.insert_ready(slot, task);
        slot as Pid
    }

    /// Create a user task and make it ready.
    ///
    /// `entry` and `user_stack_top` are ring 3 virtual addresses. The
    /// address space itself is built lazily by the trampoline on first
    /// dispatch, in the task's own context.
    pub fn spawn_user(
        &mut self,
        name: &str,
        entry: u64,
        user_stack_top: u64,
        priority: u32,
    ) -> Pid {
        let _irq = IrqSave::masked();
        let slot = self.alloc_slot();
        let ppid = self.getpid();

        let mut task = Box::new(Task::new(slot, ppid, name, priority));
        task.entry = entry;
        task.user_stack_top = user_stack_top;
        task.prepare_initial_stack(user_task_trampoline as usize as u64);
        task.state = TaskState::Ready;

        log::debug!("spawn user '{}' pid {} entry {:#x}", name, slot, entry);
        self.insert_ready(slot, task);
        slot as Pid
    }

    /// Duplicate the current task.
    ///
    /// The child gets its own kernel stack, a deep copy of the address
    /// space, and a copy of the parent's saved trap frame with `rax`
    /// zeroed; it resumes at the exact instruction after the parent's
    /// syscall, in user mode. Returns the child's pid (the parent's own
    /// frame is untouched, so its syscall returns that pid).
    pub fn fork(&mut self, provider: &mut dyn PageProvider) -> Pid {
        let _irq = IrqSave::masked();
        let slot = self.alloc_slot();

        let (ppid, name, priority, frame, addr_space) = {
            let parent = self.current_task();
            (
                parent.pid,
                parent.name.clone(),
                parent.priority,
                parent.frame(),
                parent.addr_space.as_ref().map(|a| a.clone_with(provider)),
            )
        };

        let mut child = Box::new(Task::new(slot, ppid, &name, priority));
        child.addr_space = addr_space;
        let mut child_frame = frame;
        child_frame.rax = 0; // fork returns 0 in the child
        child.set_frame(child_frame);
        child.prepare_initial_stack(fork_child_trampoline as usize as u64);
        child.state = TaskState::Ready;

        log::debug!("fork pid {} -> child {}", ppid, slot);
        self.insert_ready(slot, child);
        slot as Pid
    }

    fn insert_ready(&mut self, slot: Slot, mut task: Box<Task>) {
        let node = task.node_ptr();
        self.slots[slot] = Some(task);
        // SAFETY: the task is boxed and now resident in the table.
        unsafe { self.ready.push_back(node) };
    }

    // ── Death ───────────────────────────────────────────────────

    /// Terminate the current task. Does not return on bare metal.
    ///
    /// Children are handed to this task's own parent, owned resources go
    /// back, the slot lingers on the dead queue until a `waitpid` reaps
    /// it. A parent already waiting for this pid (or for any child) is
    /// woken.
    pub fn exit(&mut self, status: i32, provider: &mut dyn PageProvider) {
        let _irq = IrqSave::masked();
        let me = self.current_slot();

        log::debug!("exit pid {} status {}", me, status);
        self.retire(me, status, provider);
        self.wake_waiting_parent(me);
        self.schedule();
    }

    /// Forcibly terminate `task` (default: the current task).
    ///
    /// Same bookkeeping as `exit` but imposed from outside; the victim's
    /// wait-status records that it did not choose to die.
    pub fn kill(&mut self, task: Option<Slot>, provider: &mut dyn PageProvider) {
        let _irq = IrqSave::masked();
        let slot = task.unwrap_or(self.current_slot());

        log::debug!("kill pid {}", slot);
        self.retire(slot, -1, provider);
        if slot == self.current_slot() {
            self.schedule();
        }
    }

    /// Shared tail of `exit` and `kill`: reparent the children, release
    /// the owned resources, park the task on the dead queue.
    fn retire(&mut self, slot: Slot, status: i32, provider: &mut dyn PageProvider) {
        let (pid, ppid) = {
            let t = match self.task(slot) {
                Some(t) => t,
                None => panic!("retiring an empty slot {slot}"),
            };
            (t.pid, t.ppid)
        };

        for s in 0..TASK_SLOTS {
            if s == slot {
                continue;
            }
            if let Some(t) = self.task_mut(s) {
                if t.ppid == pid {
                    t.ppid = ppid;
                }
            }
        }

        let node = {
            let t = match self.task_mut(slot) {
                Some(t) => t,
                None => panic!("retiring an empty slot {slot}"),
            };
            t.exit_status = status;
            if let Some(space) = t.addr_space.take() {
                space.release(provider);
            }
            t.files = [None; super::task::TASK_FILES];
            if t.node.is_linked() {
                // SAFETY: linked node, live list, no active list borrow.
                unsafe { crate::util::list::List::unlink(t.node_ptr()) };
            }
            t.state = TaskState::Died;
            t.node_ptr()
        };
        // SAFETY: the task stays resident until reaped.
        unsafe { self.dead.push_back(node) };
    }

    /// If the parent of `child` is blocked in `waitpid` and its filter
    /// matches, make it ready so it can reap.
    fn wake_waiting_parent(&mut self, child: Slot) {
        let (child_pid, ppid) = {
            let t = match self.task(child) {
                Some(t) => t,
                None => return,
            };
            (t.pid, t.ppid)
        };
        let parent = ppid as Slot;
        let should_wake = match self.task(parent) {
            Some(p) => {
                p.state == TaskState::Waiting
                    && p.wait_for.map(|w| w.matches(child_pid)).unwrap_or(false)
            }
            None => false,
        };
        if should_wake {
            if let Some(p) = self.task_mut(parent) {
                p.wait_for = None;
            }
            self.unblock(Some(parent));
        }
    }

    // ── Reaping ─────────────────────────────────────────────────

    /// Wait for a child matching `target` to die, reap it, and return its
    /// pid and exit status.
    ///
    /// A child that died first is reaped without blocking. A live match
    /// parks this task as `Waiting` until the child's exit wakes it. No
    /// matching child at all is the one ordinary error this module has.
    pub fn waitpid(&mut self, target: WaitTarget) -> Result<(Pid, i32), KernelError> {
        let _irq = IrqSave::masked();
        loop {
            let me = self.getpid();
            let mut dead_match: Option<Slot> = None;
            let mut live_match = false;

            for s in 0..TASK_SLOTS {
                if s == me as Slot {
                    // A task is never its own child. Slot 0 is its own
                    // parent by construction; the same cycle anywhere else
                    // means the table is corrupt.
                    let self_cycle =
                        self.task(s).map(|t| t.ppid == me).unwrap_or(false);
                    assert!(me == 0 || !self_cycle, "task {me} is its own child");
                    continue;
                }
                let Some(t) = self.task(s) else { continue };
                if t.ppid != me || !target.matches(t.pid) {
                    continue;
                }
                if t.state == TaskState::Died {
                    dead_match = Some(s);
                    break;
                }
                live_match = true;
            }

            if let Some(slot) = dead_match {
                return Ok(self.reap(slot));
            }
            if !live_match {
                return Err(KernelError::NoChild);
            }

            {
                let t = self.current_task_mut();
                t.wait_for = Some(target);
            }
            self.block(None, None, TaskState::Waiting);
            // Woken by a child's exit; rescan.
        }
    }

    /// Free a dead child's slot and collect its status.
    fn reap(&mut self, slot: Slot) -> (Pid, i32) {
        let mut task = match self.slots[slot].take() {
            Some(t) => t,
            None => panic!("reaping an empty slot {slot}"),
        };
        debug_assert_eq!(task.state, TaskState::Died);
        if task.node.is_linked() {
            // SAFETY: the dead queue and the task are both still live.
            unsafe { crate::util::list::List::unlink(task.node_ptr()) };
        }
        log::trace!("reap pid {} status {}", task.pid, task.exit_status);
        (task.pid, task.exit_status)
    }
}

impl Task {
    pub(crate) fn frame(&self) -> super::task::TrapFrame {
        self.frame
    }

    pub(crate) fn set_frame(&mut self, frame: super::task::TrapFrame) {
        self.frame = frame;
    }
}

// ── First-dispatch trampolines ──────────────────────────────────
//
// The context switch `ret`s into one of these the first time a new task is
// dispatched. They pull what they need from the global kernel cell; by the
// time any task runs, `runtime::init` has happened.

/// Entry shim for kernel tasks: enable preemption, run the entry function,
/// exit with its completion.
pub(crate) extern "C" fn kernel_task_trampoline() -> ! {
    // SAFETY: single core; we only touch the cell between mask boundaries.
    let entry = unsafe { runtime::kernel().sched.current_task().entry };
    crate::arch::irq::enable();

    // SAFETY: spawn stored a `fn()` here.
    let entry: fn() = unsafe { core::mem::transmute(entry as usize) };
    entry();

    crate::arch::irq::disable();
    // SAFETY: as above.
    unsafe {
        let k = runtime::kernel();
        let provider = k.provider.as_mut();
        k.sched.exit(0, provider);
    }
    unreachable!("exited task was rescheduled");
}

/// Entry shim for user tasks: build the address space, then drop to ring 3.
pub(crate) extern "C" fn user_task_trampoline() -> ! {
    // SAFETY: single core, preemption still masked from the switch.
    let frame = unsafe {
        let k = runtime::kernel();
        let provider = k.provider.as_mut();
        let hooks = k.sched.hooks;
        let t = k.sched.current_task_mut();

        let mut space = AddressSpace::new_user(provider);
        space.reserve_user_stack(provider, t.user_stack_top, USER_STACK_PAGES);
        (hooks.activate_root)(space.root());
        let frame = IretqFrame::user(t.entry, t.user_stack_top);
        t.addr_space = Some(space);
        frame
    };
    // SAFETY: the frame points into the freshly built address space.
    unsafe { usermode::enter(&frame) }
}

/// Entry shim for forked children: replay the parent's syscall frame.
pub(crate) extern "C" fn fork_child_trampoline() -> ! {
    // SAFETY: single core; fork stored a patched frame before readying us.
    let frame = unsafe { runtime::kernel().sched.current_task().frame() };
    // SAFETY: captured on this kernel's syscall path, address space cloned.
    unsafe { usermode::return_to(&frame) }
}
