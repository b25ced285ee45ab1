//! GBA flash save chip emulation and runtime code patching for SD-based
//! cartridge loaders.
//!
//! A cartridge image loaded from SD keeps talking to what it believes is a
//! real flash save part: the known flash-driver builds are located by code
//! signature, their entry points are rewritten in place with trampolines,
//! and the emulated protocol (identify, erase, program, verify, read) runs
//! against a main-memory save buffer that an external flusher later writes
//! back to the card.

pub mod core;

// Re-exports for easier use.
pub use crate::core::driver::{patch_flash_save, DriverRevision, SaveTypeEntry};
pub use crate::core::flash::{ChipIdentity, NativeHooks, SaveSystem, SystemConfig};
pub use crate::core::memory::{MainMemory, MemoryError, MemoryLayout, MemoryResult};
pub use crate::core::patch::{PatchError, PatchResult};
pub use crate::core::sys::{ControlBlock, SaveState};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Convenience function: a fresh emulation session over `rom_data` with the
/// default memory layout and hook table.
pub fn create_system(rom_data: Vec<u8>) -> SaveSystem {
    SaveSystem::new(rom_data, SystemConfig::default())
}
