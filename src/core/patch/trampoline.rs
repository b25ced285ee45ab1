//! In-place trampolines over the original driver entry points.
//!
//! Patching is destructive and stays for the rest of the session; from the
//! patch point onward the cartridge's own flash driver is never executed
//! again.

use log::debug;

use crate::core::memory::{CodeAddr, MainMemory, MemoryResult};

/// Thumb pair `ldr r2, [pc]; bx r2`, the two-word hook shape.
pub const OP_LDR_BX_R2: u32 = 0x4710_4A00;

/// Thumb pair `bx pc; nop`, mode-switch prefix of the three-word shape.
pub const OP_BX_PC_NOP: u32 = 0x0000_4778;

/// ARM `ldr pc, [pc, #-4]`, absolute load-and-branch.
pub const OP_LDR_PC: u32 = 0xE51F_F004;

/// The branch literal must sit on a word boundary: a target on a
/// half-word boundary gets a zero half-word written first and the
/// effective patch address advances by 2.
fn align_target(mem: &mut MainMemory, target: CodeAddr) -> MemoryResult<u32> {
    let mut addr = target.0;
    if addr & 2 != 0 {
        mem.write_u16(addr, 0x0000)?;
        addr += 2;
    }
    Ok(addr)
}

/// Two-word hook: redirects a Thumb entry point straight to `handler`.
pub fn patch_short_jump(mem: &mut MainMemory, target: CodeAddr, handler: u32) -> MemoryResult<()> {
    let addr = align_target(mem, target)?;
    mem.write_u32(addr, OP_LDR_BX_R2)?;
    mem.write_u32(addr + 4, handler)?;
    debug!("short hook at {:08X} -> {:08X}", target.0, handler);
    Ok(())
}

/// Three-word hook: switches to ARM state first, then branches absolutely.
pub fn patch_long_jump(mem: &mut MainMemory, target: CodeAddr, handler: u32) -> MemoryResult<()> {
    let addr = align_target(mem, target)?;
    mem.write_u32(addr, OP_BX_PC_NOP)?;
    mem.write_u32(addr + 4, OP_LDR_PC)?;
    mem.write_u32(addr + 8, handler)?;
    debug!("long hook at {:08X} -> {:08X}", target.0, handler);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::{MainMemory, MemoryLayout};

    fn mem() -> MainMemory {
        MainMemory::new(vec![0xFFu8; 0x100], MemoryLayout::default())
    }

    #[test]
    fn test_short_jump_words() {
        let mut mem = mem();
        let target = mem.rom_offset_addr(0x40);
        patch_short_jump(&mut mem, target, 0x0680_0210).unwrap();
        assert_eq!(mem.read_u32(target.0).unwrap(), OP_LDR_BX_R2);
        assert_eq!(mem.read_u32(target.0 + 4).unwrap(), 0x0680_0210);
    }

    #[test]
    fn test_short_jump_half_word_target() {
        let mut mem = mem();
        let target = mem.rom_offset_addr(0x42);
        patch_short_jump(&mut mem, target, 0x0680_0230).unwrap();
        // Zero half-word prefix, then the hook two bytes further on.
        assert_eq!(mem.read_u16(target.0).unwrap(), 0x0000);
        assert_eq!(mem.read_u32(target.0 + 2).unwrap(), OP_LDR_BX_R2);
        assert_eq!(mem.read_u32(target.0 + 6).unwrap(), 0x0680_0230);
    }

    #[test]
    fn test_long_jump_words() {
        let mut mem = mem();
        let target = mem.rom_offset_addr(0x80);
        patch_long_jump(&mut mem, target, 0x0680_0220).unwrap();
        assert_eq!(mem.read_u32(target.0).unwrap(), OP_BX_PC_NOP);
        assert_eq!(mem.read_u32(target.0 + 4).unwrap(), OP_LDR_PC);
        assert_eq!(mem.read_u32(target.0 + 8).unwrap(), 0x0680_0220);
    }

    #[test]
    fn test_long_jump_half_word_target() {
        let mut mem = mem();
        let target = mem.rom_offset_addr(0x86);
        patch_long_jump(&mut mem, target, 0x0680_0220).unwrap();
        assert_eq!(mem.read_u16(target.0).unwrap(), 0x0000);
        assert_eq!(mem.read_u32(target.0 + 2).unwrap(), OP_BX_PC_NOP);
        assert_eq!(mem.read_u32(target.0 + 10).unwrap(), 0x0680_0220);
    }

    #[test]
    fn test_unmapped_target_reports_error() {
        let mut mem = mem();
        assert!(patch_short_jump(&mut mem, CodeAddr(0xDEAD_0000), 0).is_err());
    }
}
