//! Architecture glue: the preemption mask, the raw context switch, and the
//! ring 3 entry paths. Everything else in the kernel is portable Rust.

pub mod irq;
pub mod switch;
pub mod usermode;

pub use switch::{context_switch, SWITCH_FRAME_WORDS};
