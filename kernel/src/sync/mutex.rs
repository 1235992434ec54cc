//! Sleeping mutex.
//!
//! Built from the two primitives below it: the intrusive list holds the
//! waiters, the preemption mask closes the race windows. A contended
//! `lock` does not spin - the caller is parked on the waiter queue and the
//! scheduler runs somebody else.
//!
//! Unlock is a direct hand-off: if anybody is waiting, ownership moves to
//! the oldest waiter without the lock ever passing through the free state.
//! That keeps the order strictly FIFO and closes the window where a third
//! task could snatch a freshly-released lock ahead of tasks that have been
//! waiting (and with it, the thundering herd).

use alloc::boxed::Box;

use crate::arch::irq::IrqSave;
use crate::task::{Scheduler, TaskState};
use crate::util::list::List;

pub struct Mutex {
    /// Held flag. Only meaningful together with the waiter queue: a free
    /// flag with waiters queued never persists past an unlock.
    locked: bool,
    waiters: Box<List>,
}

impl Mutex {
    pub fn new() -> Self {
        Self {
            locked: false,
            waiters: List::new(),
        }
    }

    /// Acquire, sleeping if the lock is held.
    ///
    /// The queue test matters as much as the flag: even if the lock were
    /// momentarily free, a caller that finds waiters queued must line up
    /// behind them, or arrival order would be violated.
    pub fn lock(&mut self, sched: &mut Scheduler) {
        let _irq = IrqSave::masked();
        if !self.locked && self.waiters.is_empty() {
            self.locked = true;
        } else {
            sched.block(Some(&mut self.waiters), None, TaskState::Blocked);
            // We return owning the lock: the unlocker handed it over
            // without clearing the flag.
        }
    }

    /// Release, handing the lock to the oldest waiter if there is one.
    pub fn unlock(&mut self, sched: &mut Scheduler) {
        let _irq = IrqSave::masked();
        // SAFETY: queued nodes belong to resident tasks.
        let oldest = unsafe { self.waiters.pop_front() };
        match oldest {
            None => self.locked = false,
            Some(node) => {
                // Ownership transfers; `locked` stays true.
                let slot = unsafe { (*node).owner() };
                sched.unblock(Some(slot));
            }
        }
    }

    /// Non-blocking state probe (the buffer cache scores eviction
    /// candidates with this).
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Number of tasks parked on this lock.
    #[inline]
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::task::DEFAULT_PRIORITY;

    fn noop_entry() {}

    #[test]
    fn uncontended_lock_unlock() {
        let mut sched = Scheduler::new();
        let mut m = Mutex::new();
        assert!(!m.is_locked());
        m.lock(&mut sched);
        assert!(m.is_locked());
        m.unlock(&mut sched);
        assert!(!m.is_locked());
    }

    #[test]
    fn contended_lock_parks_the_caller() {
        let mut sched = Scheduler::new();
        sched.spawn("other", noop_entry, DEFAULT_PRIORITY);
        let mut m = Mutex::new();

        m.lock(&mut sched); // task 0 takes it
        // Pretend to be task 1: rotate, then contend.
        sched.yield_now();
        assert_eq!(sched.current_slot(), 1);
        m.lock(&mut sched);

        assert_eq!(m.waiter_count(), 1);
        assert_eq!(sched.task(1).unwrap().state, TaskState::Blocked);
        assert_eq!(sched.current_slot(), 0);
    }

    /// Three tasks, one lock: waiters are granted strictly in the order
    /// they called `lock`.
    #[test]
    fn handoff_is_fifo() {
        let mut sched = Scheduler::new();
        sched.spawn("b", noop_entry, DEFAULT_PRIORITY);
        sched.spawn("c", noop_entry, DEFAULT_PRIORITY);
        let mut m = Mutex::new();

        // A (task 0) holds the lock.
        m.lock(&mut sched);

        // B then C contend and block, in that order.
        sched.yield_now();
        assert_eq!(sched.current_slot(), 1);
        m.lock(&mut sched);
        assert_eq!(sched.current_slot(), 2);
        m.lock(&mut sched);
        assert_eq!(sched.current_slot(), 0);
        assert_eq!(m.waiter_count(), 2);

        // A unlocks: B gets the lock, C keeps waiting, the flag never
        // went through "free".
        m.unlock(&mut sched);
        assert!(m.is_locked());
        assert_eq!(sched.task(1).unwrap().state, TaskState::Ready);
        assert_eq!(sched.task(2).unwrap().state, TaskState::Blocked);
        assert_eq!(m.waiter_count(), 1);

        // B unlocks: C's turn.
        m.unlock(&mut sched);
        assert!(m.is_locked());
        assert_eq!(sched.task(2).unwrap().state, TaskState::Ready);
        assert_eq!(m.waiter_count(), 0);

        // C unlocks: nobody left, the lock is genuinely free.
        m.unlock(&mut sched);
        assert!(!m.is_locked());
    }

    #[test]
    fn queued_waiters_bar_new_arrivals() {
        let mut sched = Scheduler::new();
        sched.spawn("b", noop_entry, DEFAULT_PRIORITY);
        let mut m = Mutex::new();

        // Force the inconsistent-looking intermediate state: free flag,
        // non-empty queue. A fresh arrival must still block.
        m.lock(&mut sched);
        sched.yield_now();
        m.lock(&mut sched); // task 1 blocks, task 0 current again
        m.locked = false; // simulate the forbidden window directly

        m.lock(&mut sched); // task 0 must queue behind task 1
        assert_eq!(m.waiter_count(), 2);
    }
}
