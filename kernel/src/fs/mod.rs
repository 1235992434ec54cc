//! Filesystem substrate.
//!
//! Only the buffer cache lives in the core; the on-disk filesystem is a
//! separate crate built on top of it.

pub mod buffer;

pub use buffer::{BufId, BufferCache, BLOCK_SIZE, BUFFER_ARENA_SIZE, SECTORS_PER_BLOCK};
