//! Task management: the control block, the scheduler, lifecycle
//! operations, and the tick counter.

pub mod clock;
pub mod lifecycle;
pub mod scheduler;
pub mod task;

pub use scheduler::{ms_to_ticks, Scheduler, SwitchHooks, HZ};
pub use task::{
    Pid, Slot, Task, TaskState, TrapFrame, WaitChannel, WaitTarget, KERNEL_STACK_SIZE,
    TASK_SLOTS,
};
