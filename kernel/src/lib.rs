//! Ferrox kernel core.
//!
//! The concurrency substrate of a monolithic x86-64 kernel: a
//! cooperative/preemptive task scheduler, the blocking primitives built on
//! it (intrusive lists, a sleeping mutex), and the block-buffer cache that
//! puts them to work. One core, no SMP: the preemption mask is the only
//! mutual-exclusion device, and every race is closed by masking plus
//! retry, not by hardware atomics.
//!
//! The crate is a library on purpose. Paging internals, disk controllers,
//! the TSS and the console all sit behind narrow traits
//! ([`memory::PageProvider`], [`drivers::block::BlockDevice`], the
//! scheduler's switch hooks), so the whole core runs - and is tested - on
//! a plain host. The bootable kernel binary provides the real
//! implementations and calls [`runtime::init`].
//!
//! ## Layering
//!
//! ```text
//! fs::buffer      block cache: hashing, LRU-cost eviction, retry loops
//!    │
//! sync::mutex     sleeping lock, FIFO hand-off
//!    │
//! task::*         scheduler, task table, fork/exit/wait, sleep/tick
//!    │
//! util::list      intrusive list: the one queue primitive
//! arch::*         preemption mask, context switch, ring 3 entry
//! ```

#![cfg_attr(not(test), no_std)]
// Foundation APIs for the syscall and filesystem layers that plug in on
// top of this crate.
#![allow(dead_code)]

extern crate alloc;

pub mod arch;
pub mod drivers;
pub mod error;
pub mod fs;
pub mod memory;
pub mod runtime;
pub mod sync;
pub mod task;
pub mod util;

pub use error::{KernelError, Result};
pub use fs::{BufId, BufferCache};
pub use runtime::Kernel;
pub use sync::Mutex;
pub use task::{Pid, Scheduler, TaskState, WaitTarget};
