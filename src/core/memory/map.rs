//! Region tables and access primitives for the emulated main memory.

use log::warn;

use crate::core::memory::{MemoryError, MemoryResult, AGB_ROM_BASE, MAX_ROM_SIZE, SAVE_DATA_SIZE};

/// Address of a patchable instruction sequence in main memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeAddr(pub u32);

/// Address of a pointer-sized data slot in main memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataAddr(pub u32);

/// Memory window kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemRegion {
    /// Work RAM of the loaded cartridge (driver state lives here).
    Work,
    /// The loaded cartridge image.
    Rom,
    /// Save-data window, sole backing store for the emulated chip.
    Save,
    /// Emulator-owned window; the chip record and timing table live here.
    Vram,
}

/// Base addresses and sizes of the fixed memory windows.
#[derive(Debug, Clone)]
pub struct MemoryLayout {
    pub work_base: u32,
    pub work_size: usize,
    pub rom_base: u32,
    pub save_base: u32,
    pub vram_base: u32,
    pub vram_size: usize,
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self {
            work_base: 0x0200_0000,
            work_size: 0x4_0000,
            rom_base: 0x0204_0000,
            save_base: 0x023C_0000,
            vram_base: 0x0680_0000,
            vram_size: 0x1000,
        }
    }
}

/// The emulated main memory: four owned windows at fixed base addresses.
///
/// Word order on the emulated bus is little-endian; the byte/half/word
/// primitives below are the only place that encoding is decided.
pub struct MainMemory {
    layout: MemoryLayout,
    work: Vec<u8>,
    rom: Vec<u8>,
    save: Vec<u8>,
    vram: Vec<u8>,
}

impl MainMemory {
    pub fn new(rom_data: Vec<u8>, layout: MemoryLayout) -> Self {
        let mut rom = rom_data;
        if rom.len() > MAX_ROM_SIZE {
            warn!(
                "cartridge image truncated from {} to {} bytes",
                rom.len(),
                MAX_ROM_SIZE
            );
            rom.truncate(MAX_ROM_SIZE);
        }
        Self {
            work: vec![0; layout.work_size],
            // Fresh save window reads as erased flash.
            save: vec![0xFF; SAVE_DATA_SIZE],
            vram: vec![0; layout.vram_size],
            rom,
            layout,
        }
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    /// The loaded cartridge image.
    pub fn rom(&self) -> &[u8] {
        &self.rom
    }

    /// The save-data window.
    pub fn save(&self) -> &[u8] {
        &self.save
    }

    pub fn save_mut(&mut self) -> &mut [u8] {
        &mut self.save
    }

    /// Rebase a cartridge-bus code pointer onto the loaded image. The Thumb
    /// bit is masked off; half-word alignment is kept for the patch writer.
    pub fn rom_code_addr(&self, cart_ptr: u32) -> CodeAddr {
        CodeAddr(
            (cart_ptr & !1)
                .wrapping_sub(AGB_ROM_BASE)
                .wrapping_add(self.layout.rom_base),
        )
    }

    /// Main-memory address of a byte offset inside the image window.
    pub fn rom_offset_addr(&self, offset: usize) -> CodeAddr {
        CodeAddr(self.layout.rom_base.wrapping_add(offset as u32))
    }

    /// Window containing `addr`, with the byte offset into it. The save and
    /// emulator windows take precedence over a large image window.
    fn locate(&self, addr: u32) -> Option<(MemRegion, usize)> {
        let l = &self.layout;
        let within = |base: u32, len: usize| -> Option<usize> {
            if addr >= base && ((addr - base) as usize) < len {
                Some((addr - base) as usize)
            } else {
                None
            }
        };
        if let Some(off) = within(l.save_base, self.save.len()) {
            return Some((MemRegion::Save, off));
        }
        if let Some(off) = within(l.vram_base, self.vram.len()) {
            return Some((MemRegion::Vram, off));
        }
        if let Some(off) = within(l.work_base, self.work.len()) {
            return Some((MemRegion::Work, off));
        }
        if let Some(off) = within(l.rom_base, self.rom.len()) {
            return Some((MemRegion::Rom, off));
        }
        None
    }

    fn region_buf(&self, region: MemRegion) -> &[u8] {
        match region {
            MemRegion::Work => &self.work,
            MemRegion::Rom => &self.rom,
            MemRegion::Save => &self.save,
            MemRegion::Vram => &self.vram,
        }
    }

    fn region_buf_mut(&mut self, region: MemRegion) -> &mut [u8] {
        match region {
            MemRegion::Work => &mut self.work,
            MemRegion::Rom => &mut self.rom,
            MemRegion::Save => &mut self.save,
            MemRegion::Vram => &mut self.vram,
        }
    }

    fn bytes(&self, addr: u32, len: usize) -> MemoryResult<&[u8]> {
        let (region, offset) = self.locate(addr).ok_or(MemoryError::Unmapped)?;
        let buf = self.region_buf(region);
        if offset + len > buf.len() {
            return Err(MemoryError::OutOfRange);
        }
        Ok(&buf[offset..offset + len])
    }

    fn bytes_mut(&mut self, addr: u32, len: usize) -> MemoryResult<&mut [u8]> {
        let (region, offset) = self.locate(addr).ok_or(MemoryError::Unmapped)?;
        let buf = self.region_buf_mut(region);
        if offset + len > buf.len() {
            return Err(MemoryError::OutOfRange);
        }
        Ok(&mut buf[offset..offset + len])
    }

    pub fn read_u8(&self, addr: u32) -> MemoryResult<u8> {
        Ok(self.bytes(addr, 1)?[0])
    }

    pub fn read_u16(&self, addr: u32) -> MemoryResult<u16> {
        let b = self.bytes(addr, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&self, addr: u32) -> MemoryResult<u32> {
        let b = self.bytes(addr, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn write_u8(&mut self, addr: u32, value: u8) -> MemoryResult<()> {
        self.bytes_mut(addr, 1)?[0] = value;
        Ok(())
    }

    pub fn write_u16(&mut self, addr: u32, value: u16) -> MemoryResult<()> {
        self.bytes_mut(addr, 2)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) -> MemoryResult<()> {
        self.bytes_mut(addr, 4)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}
