//! The scheduler.
//!
//! One `Scheduler` owns the whole task world: the slot table and the
//! ready/blocked/sleeping/dead queues. Nothing here is a free-floating
//! global, so tests spin up as many independent schedulers as they like;
//! the bootable kernel keeps exactly one inside `runtime`.
//!
//! Dispatch is FIFO: the timer moves the running task to the back of the
//! ready queue when its slice runs out, voluntary suspension (block,
//! sleep, wait) parks it on some other queue first. Priority only decides
//! how many ticks a slice is worth.
//!
//! Every entry point masks preemption for its critical section; the
//! context switch itself happens with the mask held and the incoming task
//! re-enables preemption on its own schedule.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::arch::{self, irq::IrqSave};
use crate::memory::PageRoot;
use crate::util::list::List;

use super::task::{Pid, Slot, Task, TaskState, DEFAULT_PRIORITY, TASK_SLOTS};

/// Timer interrupt frequency, ticks per second.
pub const HZ: u64 = 100;

/// Convert a duration to timer ticks, rounding up; never zero.
pub fn ms_to_ticks(ms: u64) -> u64 {
    ((ms * HZ).div_ceil(1000)).max(1)
}

/// Hooks into the privileged-state collaborators, called on every switch.
///
/// `set_kernel_stack` feeds the incoming task's stack top to the TSS so
/// the next ring 3 -> ring 0 transition lands on the right stack;
/// `activate_root` installs a page-table root. Both default to no-ops so
/// the core runs hostside without any hardware behind it.
#[derive(Clone, Copy)]
pub struct SwitchHooks {
    pub set_kernel_stack: fn(u64),
    pub activate_root: fn(PageRoot),
}

impl Default for SwitchHooks {
    fn default() -> Self {
        fn no_stack(_: u64) {}
        fn no_root(_: PageRoot) {}
        Self {
            set_kernel_stack: no_stack,
            activate_root: no_root,
        }
    }
}

pub struct Scheduler {
    /// All tasks, indexed by pid.
    pub(crate) slots: Vec<Option<Box<Task>>>,
    pub(crate) ready: Box<List>,
    /// Generic queue for `block` callers that have no queue of their own.
    pub(crate) blocked: Box<List>,
    /// Sleepers in ascending wake-tick order.
    pub(crate) sleeping: Box<List>,
    /// Exited tasks awaiting reap.
    pub(crate) dead: Box<List>,
    pub(crate) current: Slot,
    /// Total timer ticks seen; the time base for sleep and accounting.
    pub(crate) jiffies: u64,
    pub(crate) hooks: SwitchHooks,
}

impl Scheduler {
    /// Build a scheduler whose slot 0 is the calling context.
    ///
    /// The caller (boot path or a test) becomes the running task: it
    /// already has a stack and is already executing, it just was not a
    /// task until now.
    pub fn new() -> Self {
        let mut slots: Vec<Option<Box<Task>>> = Vec::with_capacity(TASK_SLOTS);
        for _ in 0..TASK_SLOTS {
            slots.push(None);
        }

        let mut bootstrap = Box::new(Task::new(0, 0, "kernel", DEFAULT_PRIORITY));
        bootstrap.state = TaskState::Running;
        slots[0] = Some(bootstrap);

        Self {
            slots,
            ready: List::new(),
            blocked: List::new(),
            sleeping: List::new(),
            dead: List::new(),
            current: 0,
            jiffies: 0,
            hooks: SwitchHooks::default(),
        }
    }

    pub fn set_hooks(&mut self, hooks: SwitchHooks) {
        self.hooks = hooks;
    }

    // ── Accessors ───────────────────────────────────────────────

    #[inline]
    pub fn current_slot(&self) -> Slot {
        self.current
    }

    pub fn task(&self, slot: Slot) -> Option<&Task> {
        self.slots.get(slot)?.as_deref()
    }

    pub fn task_mut(&mut self, slot: Slot) -> Option<&mut Task> {
        self.slots.get_mut(slot)?.as_deref_mut()
    }

    /// The running task. Panics if the slot table is corrupt; there is
    /// always a current task.
    pub fn current_task(&self) -> &Task {
        match self.task(self.current) {
            Some(t) => t,
            None => panic!("current slot {} holds no task", self.current),
        }
    }

    pub fn current_task_mut(&mut self) -> &mut Task {
        let slot = self.current;
        match self.task_mut(slot) {
            Some(t) => t,
            None => panic!("current slot {slot} holds no task"),
        }
    }

    pub fn getpid(&self) -> Pid {
        self.current_task().pid
    }

    pub fn getppid(&self) -> Pid {
        self.current_task().ppid
    }

    #[inline]
    pub fn jiffies(&self) -> u64 {
        self.jiffies
    }

    /// Find a free slot or die: running out of task slots is fatal.
    pub(crate) fn alloc_slot(&self) -> Slot {
        match self.slots.iter().position(|s| s.is_none()) {
            Some(slot) => slot,
            None => panic!("out of task slots"),
        }
    }

    // ── Dispatch ────────────────────────────────────────────────

    /// Pick the next task and switch to it.
    ///
    /// Must run with preemption masked. If the ready queue is empty the
    /// current task simply keeps the CPU (the idle loop lives on this).
    /// An outgoing task that is not already parked on some queue is being
    /// time-sliced, not suspended, and goes to the back of the ready
    /// queue.
    pub fn schedule(&mut self) {
        debug_assert!(
            !crate::arch::irq::enabled(),
            "schedule() requires the preemption mask"
        );

        let next = {
            let Some(node) = (unsafe { self.ready.pop_front() }) else {
                return;
            };
            unsafe { (*node).owner() }
        };

        let prev = self.current;
        if next == prev {
            // The current task was sitting in its own ready queue; nothing
            // to switch.
            self.current_task_mut().state = TaskState::Running;
            return;
        }

        // Requeue the outgoing task unless it already parked itself
        // somewhere (blocked, sleeping, dead).
        let (requeue, prev_root) = {
            let t = match self.task_mut(prev) {
                Some(t) => t,
                None => panic!("current slot {prev} holds no task"),
            };
            t.check_stack_guard();
            let root = t.addr_space.as_ref().map(|a| a.root());
            if t.node.is_linked() {
                (None, root)
            } else {
                t.state = TaskState::Ready;
                (Some(t.node_ptr()), root)
            }
        };
        if let Some(node) = requeue {
            unsafe { self.ready.push_back(node) };
        }

        // Bring in the chosen task.
        let (next_rsp, next_stack_top, next_root) = {
            let t = match self.task_mut(next) {
                Some(t) => t,
                None => panic!("ready queue pointed at empty slot {next}"),
            };
            t.state = TaskState::Running;
            (
                t.saved_rsp,
                t.kernel_stack.top(),
                t.addr_space.as_ref().map(|a| a.root()),
            )
        };
        self.current = next;

        log::trace!("switch {} -> {}", prev, next);

        // Privileged state for the incoming task: ring 0 landing stack,
        // and the address-space root when it differs.
        (self.hooks.set_kernel_stack)(next_stack_top);
        if let Some(root) = next_root {
            if next_root != prev_root {
                (self.hooks.activate_root)(root);
            }
        }

        let prev_rsp_cell: *mut u64 = {
            let t = match self.task_mut(prev) {
                Some(t) => t,
                None => panic!("current slot {prev} holds no task"),
            };
            &mut t.saved_rsp
        };

        // SAFETY: both tasks are boxed and stay resident while linked into
        // the table; preemption is masked.
        unsafe { arch::context_switch(prev_rsp_cell, next_rsp) };
    }

    /// Voluntarily give up the CPU.
    pub fn yield_now(&mut self) {
        let _irq = IrqSave::masked();
        self.schedule();
    }

    // ── Blocking ────────────────────────────────────────────────

    /// Park `task` (default: the current task) on `queue` (default: the
    /// generic blocked queue) in `state`, then reschedule.
    ///
    /// The caller must have closed its race window before calling: the
    /// preemption mask, not this function, is what keeps the wake-up from
    /// slipping in between the decision to block and the enqueue.
    pub fn block(&mut self, queue: Option<&mut List>, task: Option<Slot>, state: TaskState) {
        let _irq = IrqSave::masked();
        let slot = task.unwrap_or(self.current);

        let node = {
            let t = match self.task_mut(slot) {
                Some(t) => t,
                None => panic!("blocking an empty slot {slot}"),
            };
            if t.node.is_linked() {
                // SAFETY: the node is linked, so its list and neighbours
                // are live; no list borrow is active.
                unsafe { List::unlink(t.node_ptr()) };
            }
            t.state = state;
            t.node_ptr()
        };

        match queue {
            // SAFETY: the node belongs to a boxed, resident task.
            Some(q) => unsafe { q.push_back(node) },
            None => unsafe { self.blocked.push_back(node) },
        }

        self.schedule();
    }

    /// Make `task` runnable again; with no task given, release the oldest
    /// entry of the generic blocked queue.
    ///
    /// Returns the slot that was woken, if any.
    pub fn unblock(&mut self, task: Option<Slot>) -> Option<Slot> {
        let _irq = IrqSave::masked();
        let slot = match task {
            Some(s) => s,
            None => {
                let node = unsafe { self.blocked.pop_front() }?;
                unsafe { (*node).owner() }
            }
        };

        let node = {
            let t = match self.task_mut(slot) {
                Some(t) => t,
                None => panic!("unblocking an empty slot {slot}"),
            };
            if t.node.is_linked() {
                // SAFETY: as in `block`.
                unsafe { List::unlink(t.node_ptr()) };
            }
            t.state = TaskState::Ready;
            t.wait_on = None;
            t.node_ptr()
        };
        unsafe { self.ready.push_back(node) };
        Some(slot)
    }

    /// Put the current task to sleep for at least `ms` milliseconds.
    pub fn sleep(&mut self, ms: u64) {
        let _irq = IrqSave::masked();
        let wake_tick = self.jiffies + ms_to_ticks(ms);

        let node = {
            let t = self.current_task_mut();
            debug_assert!(!t.node.is_linked(), "running task sitting in a queue");
            t.state = TaskState::Sleeping;
            t.node_ptr()
        };
        // Ascending wake-tick order, so the timer only ever looks at the
        // head of the queue.
        unsafe { self.sleeping.insert_by_key(node, wake_tick) };

        self.schedule();
    }

    // ── Timer ───────────────────────────────────────────────────

    /// Drive the scheduler from the periodic timer.
    ///
    /// Advances the tick count, wakes every sleeper whose tick has come,
    /// charges the running task one tick, and preempts it when its slice
    /// is spent.
    pub fn timer_tick(&mut self) {
        let _irq = IrqSave::masked();
        self.jiffies += 1;

        // Wake the whole due cohort, not just the head: several tasks may
        // share a wake tick.
        loop {
            let due = match self.sleeping.head() {
                // SAFETY: head nodes of a live list point at live tasks.
                Some(node) => unsafe {
                    if (*node).key() <= self.jiffies {
                        Some((*node).owner())
                    } else {
                        None
                    }
                },
                None => None,
            };
            match due {
                Some(slot) => {
                    self.unblock(Some(slot));
                }
                None => break,
            }
        }

        let jiffies = self.jiffies;
        let expired = {
            let t = self.current_task_mut();
            t.check_stack_guard();
            t.jiffies = jiffies;
            t.ticks = t.ticks.saturating_sub(1);
            if t.ticks == 0 {
                t.ticks = t.priority.max(1);
                true
            } else {
                false
            }
        };
        if expired {
            self.schedule();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the scheduler is confined to one core; all access from interrupt
// context is gated by the preemption mask, which is the only concurrency
// this kernel has. The raw list links never cross the boundary on their
// own.
unsafe impl Send for Scheduler {}
