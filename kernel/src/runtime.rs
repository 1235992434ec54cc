//! The one global kernel instance.
//!
//! The core types are plain objects so tests can build as many as they
//! want, but a running kernel has exactly one of each, and the entry
//! trampolines and interrupt handlers have no way to receive them as
//! arguments. This module is that single home: a `spin::Once` cell the
//! boot path fills exactly once.
//!
//! There is deliberately no lock around the cell's contents. This kernel
//! has one core, and the preemption mask is its only critical-section
//! mechanism; a lock held across a context switch would deadlock the task
//! that gets switched in.

use alloc::boxed::Box;
use core::cell::UnsafeCell;

use spin::Once;

use crate::drivers::block::BlockDevice;
use crate::fs::{BufferCache, BUFFER_ARENA_SIZE};
use crate::memory::PageProvider;
use crate::task::Scheduler;

/// Everything the kernel owns, in dependency order.
pub struct Kernel {
    pub sched: Scheduler,
    pub cache: BufferCache,
    /// The boot disk.
    pub disk: Box<dyn BlockDevice + Send>,
    /// The memory manager.
    pub provider: Box<dyn PageProvider + Send>,
}

impl Kernel {
    pub fn new(
        disk: Box<dyn BlockDevice + Send>,
        provider: Box<dyn PageProvider + Send>,
    ) -> Self {
        Self {
            sched: Scheduler::new(),
            cache: BufferCache::new(BUFFER_ARENA_SIZE),
            disk,
            provider,
        }
    }
}

struct KernelCell(UnsafeCell<Kernel>);

// SAFETY: single core. Interrupt handlers are the only "other thread", and
// every access point masks preemption first.
unsafe impl Sync for KernelCell {}

static KERNEL: Once<KernelCell> = Once::new();

/// Install the kernel. Later calls are ignored (first boot wins).
pub fn init(kernel: Kernel) {
    KERNEL.call_once(|| KernelCell(UnsafeCell::new(kernel)));
}

/// Whether [`init`] has run.
pub fn is_initialized() -> bool {
    KERNEL.get().is_some()
}

/// The global kernel.
///
/// # Safety
/// Single core only. The caller must hold the preemption mask (or be in an
/// interrupt handler, where it is held implicitly) and must not let the
/// reference outlive the masked section. Panics before [`init`].
pub unsafe fn kernel() -> &'static mut Kernel {
    match KERNEL.get() {
        Some(cell) => unsafe { &mut *cell.0.get() },
        None => panic!("kernel runtime used before init"),
    }
}
