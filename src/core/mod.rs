//! Core of the save emulation: memory model, arbitration, the emulated
//! flash part, the patch engine and the driver-revision dispatcher.

pub mod driver;
pub mod flash;
pub mod memory;
pub mod patch;
pub mod sys;

pub use crate::core::driver::{patch_flash_save, DriverRevision, SaveTypeEntry};
pub use crate::core::flash::{ChipIdentity, SaveSystem, SystemConfig};
pub use crate::core::memory::{MainMemory, MemoryError, MemoryLayout, MemoryResult};
pub use crate::core::patch::{PatchError, PatchResult};
pub use crate::core::sys::{ControlBlock, CriticalSection, SaveState};
