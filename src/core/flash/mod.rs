//! The emulated flash save part.

pub mod chip;
pub mod identity;

pub use crate::core::flash::chip::{NativeHooks, PatchInfo, SaveSystem, SystemConfig};
pub use crate::core::flash::identity::{ChipIdentity, SectorGeometry, MAX_TIMING};

/// Sector size in bytes: the erase/program granularity.
pub const SECTOR_SIZE: usize = 0x1000;

/// log2 of [`SECTOR_SIZE`].
pub const SECTOR_SHIFT: u32 = 12;

/// Byte value of erased flash cells.
pub const ERASED_BYTE: u8 = 0xFF;

/// Maker identifier reported by the emulated part.
pub const MAKER_ID: u8 = 3;

/// Device identifier reported by the emulated part.
pub const DEVICE_ID: u8 = 0;
