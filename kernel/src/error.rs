//! Kernel error types.
//!
//! Three failure categories, three behaviours:
//! resource exhaustion blocks and retries (never an error value),
//! invariant violations panic (they mean memory corruption),
//! ordinary failures come back through these types.

use core::fmt;

use crate::drivers::block::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// `waitpid` found no child matching the filter.
    NoChild,
    /// A block-device transfer failed.
    Device(DeviceError),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::NoChild => write!(f, "no matching child process"),
            KernelError::Device(e) => write!(f, "device error: {e}"),
        }
    }
}

impl From<DeviceError> for KernelError {
    fn from(e: DeviceError) -> Self {
        KernelError::Device(e)
    }
}

pub type Result<T> = core::result::Result<T, KernelError>;
