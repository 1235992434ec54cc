//! Synchronization primitives built on the scheduler.

pub mod mutex;

pub use mutex::Mutex;
