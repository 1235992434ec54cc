//! Block-device interface.
//!
//! The buffer cache talks to storage through exactly one call:
//! [`BlockDevice::request`]. The transfer is synchronous from the caller's
//! point of view; a real controller driver suspends the calling task until
//! its completion interrupt and lets the scheduler run others meanwhile.

use core::fmt;

use bitflags::bitflags;

/// Device identifier (major/minor packed by the device registry).
pub type DevId = u32;

/// Bytes per hardware sector.
pub const SECTOR_SIZE: usize = 512;

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Read,
    Write,
}

bitflags! {
    /// Modifier bits for a block request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReqFlags: u32 {
        /// Jump the controller's internal request queue.
        const URGENT = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// Sector range falls outside the device.
    OutOfRange,
    /// The transfer itself failed.
    Io,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::OutOfRange => write!(f, "sector out of range"),
            DeviceError::Io => write!(f, "transfer failed"),
        }
    }
}

pub trait BlockDevice {
    /// Transfer `sector_count` sectors between `data` and the device,
    /// starting at sector `sector_offset`.
    ///
    /// `data` must hold at least `sector_count * SECTOR_SIZE` bytes. May
    /// suspend the calling task internally; by the time it returns the
    /// transfer is complete.
    fn request(
        &mut self,
        data: &mut [u8],
        sector_count: usize,
        sector_offset: u64,
        flags: ReqFlags,
        dir: Dir,
    ) -> Result<(), DeviceError>;
}
