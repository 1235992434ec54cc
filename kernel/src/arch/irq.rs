//! The preemption mask.
//!
//! On a single core there are no spinlocks worth the name: masking the
//! timer interrupt *is* the critical section. Every multi-write mutation
//! in the kernel (queue links, reference counts, buffer claims) happens
//! between [`IrqSave::masked`] and the guard's drop.
//!
//! Masking is not reference-counted. The guard saves the flag on entry and
//! restores that exact value on drop, so nested sections compose as long
//! as every section uses the guard (or saves/restores explicitly).
//!
//! On bare metal this is the real RFLAGS.IF manipulated through the
//! `x86_64` crate. On a hosted build (unit tests) it is an emulated flag
//! with the same semantics.

#[cfg(target_os = "none")]
mod imp {
    use x86_64::instructions::interrupts;

    #[inline]
    pub fn enabled() -> bool {
        interrupts::are_enabled()
    }

    #[inline]
    pub fn enable() {
        interrupts::enable();
    }

    #[inline]
    pub fn disable() {
        interrupts::disable();
    }
}

#[cfg(all(not(target_os = "none"), not(test)))]
mod imp {
    use core::sync::atomic::{AtomicBool, Ordering};

    static FLAG: AtomicBool = AtomicBool::new(true);

    #[inline]
    pub fn enabled() -> bool {
        FLAG.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn enable() {
        FLAG.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn disable() {
        FLAG.store(false, Ordering::Relaxed);
    }
}


/// Whether the timer may currently force a reschedule.
#[inline]
pub fn enabled() -> bool {
    imp::enabled()
}

/// Allow preemption.
#[inline]
pub fn enable() {
    imp::enable()
}

/// Forbid preemption.
#[inline]
pub fn disable() {
    imp::disable()
}

/// RAII preemption-mask section.
///
/// Saves the current flag, masks, and restores the saved value on drop.
/// If the flag was already masked when the guard was taken, it stays
/// masked after the drop - exactly the save/restore discipline nested
/// critical sections need.
pub struct IrqSave {
    was_enabled: bool,
}

impl IrqSave {
    #[inline]
    pub fn masked() -> Self {
        let was_enabled = enabled();
        disable();
        Self { was_enabled }
    }
}

impl Drop for IrqSave {
    #[inline]
    fn drop(&mut self) {
        if self.was_enabled {
            enable();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_restores_previous_state() {
        enable();
        {
            let _g = IrqSave::masked();
            assert!(!enabled());
        }
        assert!(enabled());
    }

    #[test]
    fn nested_guards_stay_masked() {
        enable();
        {
            let _outer = IrqSave::masked();
            {
                let _inner = IrqSave::masked();
                assert!(!enabled());
            }
            // The inner guard restores "masked", not "enabled".
            assert!(!enabled());
        }
        assert!(enabled());
    }

    #[test]
    fn guard_over_masked_flag_keeps_it_masked() {
        disable();
        {
            let _g = IrqSave::masked();
        }
        assert!(!enabled());
        enable();
    }
}
