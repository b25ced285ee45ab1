//! The emulated flash operations and the session state backing them.
//!
//! Once the patch engine has redirected the cartridge's driver entry
//! points, every flash access the game makes lands on one of the
//! operations below instead of on chip hardware. Erase and program work
//! on the save window inside a critical section; read and verify touch
//! nothing but the buffer and are safe with interrupts enabled.

use log::{debug, info, warn};

use crate::core::flash::identity::{write_max_timing, ChipIdentity};
use crate::core::flash::{ERASED_BYTE, SECTOR_SHIFT, SECTOR_SIZE};
use crate::core::memory::{DataAddr, MainMemory, MemoryLayout, SAVE_DATA_SIZE};
use crate::core::sys::{ControlBlock, CriticalSection, DATA_PROT_BASELINE};

/// Pointer slots inside the driver's work area. The identify handler
/// writes native handler addresses through these; the dispatcher adopts
/// them from the per-revision metadata block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchInfo {
    pub prog_sector: DataAddr,
    pub erase_chip: DataAddr,
    pub erase_sector: DataAddr,
    pub polling_sr: DataAddr,
    pub max_timing: DataAddr,
    pub flash: DataAddr,
}

/// Native addresses the trampolines and the identify handler hand to the
/// patched driver. The record and timing windows must be writable; the
/// handler addresses are only ever branched to, never dereferenced here.
#[derive(Debug, Clone, Copy)]
pub struct NativeHooks {
    pub identify: u32,
    pub read: u32,
    pub verify: u32,
    pub verify_sector: u32,
    pub prog_sector: u32,
    pub erase_chip: u32,
    pub erase_sector: u32,
    pub max_timing: u32,
    pub chip_record: u32,
}

impl NativeHooks {
    /// Default hook table inside the emulator-owned window.
    pub fn for_layout(layout: &MemoryLayout) -> Self {
        let base = layout.vram_base;
        Self {
            chip_record: base,
            max_timing: base + 0x20,
            identify: base + 0x200,
            read: base + 0x210,
            verify: base + 0x220,
            verify_sector: base + 0x230,
            prog_sector: base + 0x240,
            erase_chip: base + 0x250,
            erase_sector: base + 0x260,
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub layout: MemoryLayout,
    pub hooks: NativeHooks,
    pub baseline_permissions: u32,
}

impl Default for SystemConfig {
    fn default() -> Self {
        let layout = MemoryLayout::default();
        let hooks = NativeHooks::for_layout(&layout);
        Self {
            layout,
            hooks,
            baseline_permissions: DATA_PROT_BASELINE,
        }
    }
}

/// One emulation session: memory windows, control block and chip records,
/// built once at session start and passed by reference into every
/// operation.
pub struct SaveSystem {
    pub mem: MainMemory,
    pub ctl: ControlBlock,
    pub patch_info: PatchInfo,
    pub chip: ChipIdentity,
    hooks: NativeHooks,
}

/// Save-window offset of a sector, masked into the power-of-two window the
/// way the address decoder mirrors out-of-range sectors.
fn sector_base(sector: u16) -> usize {
    ((sector as usize) << SECTOR_SHIFT) & (SAVE_DATA_SIZE - 1)
}

impl SaveSystem {
    pub fn new(rom_data: Vec<u8>, config: SystemConfig) -> Self {
        info!(
            "flash save session: image {} bytes, save window {} bytes",
            rom_data.len(),
            SAVE_DATA_SIZE
        );
        Self {
            mem: MainMemory::new(rom_data, config.layout),
            ctl: ControlBlock::new(config.baseline_permissions),
            patch_info: PatchInfo::default(),
            chip: ChipIdentity::default(),
            hooks: config.hooks,
        }
    }

    pub fn hooks(&self) -> &NativeHooks {
        &self.hooks
    }

    /// Emulated identify. Writes the native handler addresses through the
    /// adopted pointer slots (no polling handler exists, its slot gets 0),
    /// rebuilds the identity record and timing table in the emulator
    /// window, and publishes the record address last, exactly what the
    /// driver's own identify routine would leave behind. Always succeeds.
    pub fn identify(&mut self) -> u16 {
        let hooks = self.hooks;
        self.write_slot(self.patch_info.prog_sector, hooks.prog_sector);
        self.write_slot(self.patch_info.erase_chip, hooks.erase_chip);
        self.write_slot(self.patch_info.erase_sector, hooks.erase_sector);
        self.write_slot(self.patch_info.polling_sr, 0);
        self.write_slot(self.patch_info.max_timing, hooks.max_timing);

        self.chip = ChipIdentity::emulated();
        if let Err(err) = self.chip.write_record(&mut self.mem, DataAddr(hooks.chip_record)) {
            warn!("identify: chip record window not writable: {:?}", err);
        }
        if let Err(err) = write_max_timing(&mut self.mem, DataAddr(hooks.max_timing)) {
            warn!("identify: timing window not writable: {:?}", err);
        }
        self.write_slot(self.patch_info.flash, hooks.chip_record);

        debug!(
            "identify: maker {:02X} device {:02X}, {} bytes",
            self.chip.maker_id, self.chip.device_id, self.chip.rom_size
        );
        0
    }

    fn write_slot(&mut self, slot: DataAddr, value: u32) {
        if let Err(err) = self.mem.write_u32(slot.0, value) {
            warn!(
                "identify: dropped write through unmapped slot {:08X}: {:?}",
                slot.0, err
            );
        }
    }

    /// Emulated chip erase: every byte of the save window goes to the
    /// erased value. Returns the status word the patched call site
    /// expects; the emulated part never fails.
    pub fn erase_chip(&mut self) -> u16 {
        let mut cs = CriticalSection::enter(&mut self.ctl);
        self.mem.save_mut().fill(ERASED_BYTE);
        cs.mark_save_dirty();
        drop(cs);
        info!("flash: chip erased");
        0
    }

    /// Emulated sector erase, scoped to `sector`.
    pub fn erase_sector(&mut self, sector: u16) -> u16 {
        let start = sector_base(sector);
        let mut cs = CriticalSection::enter(&mut self.ctl);
        self.mem.save_mut()[start..start + SECTOR_SIZE].fill(ERASED_BYTE);
        cs.mark_save_dirty();
        drop(cs);
        debug!("flash: sector {} erased", sector);
        0
    }

    /// Emulated sector program: copies one sector's worth of `src` into
    /// the sector region.
    pub fn program_sector(&mut self, sector: u16, src: &[u8]) -> u16 {
        let start = sector_base(sector);
        let len = src.len().min(SECTOR_SIZE);
        let mut cs = CriticalSection::enter(&mut self.ctl);
        self.mem.save_mut()[start..start + len].copy_from_slice(&src[..len]);
        cs.mark_save_dirty();
        drop(cs);
        debug!("flash: sector {} programmed ({} bytes)", sector, len);
        0
    }

    /// Compare one sector against `src`. Same return convention as
    /// [`Self::verify`].
    pub fn verify_sector(&self, sector: u16, src: &[u8]) -> u32 {
        let len = src.len().min(SECTOR_SIZE);
        self.verify(sector, &src[..len])
    }

    /// Byte compare of `src` against the save window starting at `sector`.
    /// Returns the save-relative offset of the first mismatch, or 0 on an
    /// exact match. A mismatch at offset 0 is indistinguishable from a
    /// match; the driver protocol being emulated has the same property.
    pub fn verify(&self, sector: u16, src: &[u8]) -> u32 {
        let start = sector_base(sector);
        let save = self.mem.save();
        let len = src.len().min(SAVE_DATA_SIZE - start);
        for (i, &expected) in src[..len].iter().enumerate() {
            if save[start + i] != expected {
                return (start + i) as u32;
            }
        }
        0
    }

    /// Copy save bytes at `sector`/`offset` into `dst`. No side effects,
    /// no protection switch: the window is always readable.
    pub fn read(&self, sector: u16, offset: u32, dst: &mut [u8]) {
        let start = (sector_base(sector) + offset as usize) & (SAVE_DATA_SIZE - 1);
        let save = self.mem.save();
        for (i, b) in dst.iter_mut().enumerate() {
            *b = save[(start + i) & (SAVE_DATA_SIZE - 1)];
        }
    }

    /// Save-window contents, for the external flush-to-SD collaborator.
    pub fn save_data(&self) -> &[u8] {
        self.mem.save()
    }

    /// Preload the save window (e.g. from the .sav file read off the card)
    /// and mark it clean.
    pub fn load_save_data(&mut self, data: &[u8]) {
        let len = data.len().min(SAVE_DATA_SIZE);
        self.mem.save_mut()[..len].copy_from_slice(&data[..len]);
        self.ctl.mark_clean();
        info!("flash: save window preloaded ({} bytes)", len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sys::SaveState;

    fn system() -> SaveSystem {
        SaveSystem::new(vec![0; 0x1000], SystemConfig::default())
    }

    fn sector_pattern(seed: u8) -> Vec<u8> {
        (0..SECTOR_SIZE).map(|i| (i as u8) ^ seed).collect()
    }

    #[test]
    fn test_program_then_verify_matches() {
        let mut sys = system();
        let data = sector_pattern(0x5A);
        sys.program_sector(3, &data);
        assert_eq!(sys.verify_sector(3, &data), 0);
    }

    #[test]
    fn test_erase_sector_fills_and_dirties() {
        let mut sys = system();
        sys.program_sector(2, &sector_pattern(0x11));
        sys.ctl.mark_clean();
        sys.erase_sector(2);
        assert_eq!(sys.ctl.save_state(), SaveState::Dirty);
        let mut buf = vec![0u8; SECTOR_SIZE];
        sys.read(2, 0, &mut buf);
        assert!(buf.iter().all(|&b| b == ERASED_BYTE));
    }

    #[test]
    fn test_erase_chip_then_read_all_erased() {
        let mut sys = system();
        sys.program_sector(0, &sector_pattern(0x22));
        sys.program_sector(31, &sector_pattern(0x33));
        sys.erase_chip();
        assert_eq!(sys.ctl.save_state(), SaveState::Dirty);
        let mut buf = vec![0u8; 0x100];
        sys.read(31, 0x40, &mut buf);
        assert!(buf.iter().all(|&b| b == ERASED_BYTE));
    }

    #[test]
    fn test_verify_reports_first_mismatch_offset() {
        let mut sys = system();
        let data = sector_pattern(0x77);
        sys.program_sector(2, &data);
        let mut tampered = data.clone();
        tampered[37] ^= 0xFF;
        assert_eq!(sys.verify_sector(2, &tampered), (2 << SECTOR_SHIFT) + 37);
        assert_eq!(sys.verify(2, &tampered), (2 << SECTOR_SHIFT) + 37);
    }

    #[test]
    fn test_mismatch_at_offset_zero_reads_as_match() {
        let mut sys = system();
        let data = sector_pattern(0x01);
        sys.program_sector(0, &data);
        let mut tampered = data;
        tampered[0] ^= 0xFF;
        // Offset 0 doubles as "match" and "first-byte mismatch"; the
        // emulated protocol cannot tell the two apart.
        assert_eq!(sys.verify_sector(0, &tampered), 0);
    }

    #[test]
    fn test_identify_writes_handler_addresses() {
        let mut sys = system();
        let work = sys.mem.layout().work_base;
        sys.patch_info = PatchInfo {
            prog_sector: DataAddr(work + 0x100),
            erase_chip: DataAddr(work + 0x104),
            erase_sector: DataAddr(work + 0x108),
            polling_sr: DataAddr(work + 0x10C),
            max_timing: DataAddr(work + 0x110),
            flash: DataAddr(work + 0x114),
        };
        sys.identify();

        let hooks = *sys.hooks();
        assert_eq!(sys.mem.read_u32(work + 0x100).unwrap(), hooks.prog_sector);
        assert_eq!(sys.mem.read_u32(work + 0x104).unwrap(), hooks.erase_chip);
        assert_eq!(sys.mem.read_u32(work + 0x108).unwrap(), hooks.erase_sector);
        assert_eq!(sys.mem.read_u32(work + 0x10C).unwrap(), 0);
        assert_eq!(sys.mem.read_u32(work + 0x110).unwrap(), hooks.max_timing);
        assert_eq!(sys.mem.read_u32(work + 0x114).unwrap(), hooks.chip_record);
        // The record itself is readable where the slot points.
        assert_eq!(
            sys.mem.read_u32(hooks.chip_record).unwrap(),
            SAVE_DATA_SIZE as u32
        );
    }

    #[test]
    fn test_identify_is_idempotent() {
        let mut sys = system();
        let work = sys.mem.layout().work_base;
        sys.patch_info.flash = DataAddr(work + 0x20);
        sys.identify();
        let first_chip = sys.chip;
        let first_info = sys.patch_info;
        let vram_base = sys.mem.layout().vram_base;
        let mut first_window = Vec::new();
        for i in 0..0x40 {
            first_window.push(sys.mem.read_u8(vram_base + i).unwrap());
        }

        sys.identify();
        assert_eq!(sys.chip, first_chip);
        assert_eq!(sys.patch_info, first_info);
        for (i, &b) in first_window.iter().enumerate() {
            assert_eq!(sys.mem.read_u8(vram_base + i as u32).unwrap(), b);
        }
    }

    #[test]
    fn test_interrupt_state_restored_after_mutation() {
        let mut sys = system();
        assert!(sys.ctl.irq_enabled());
        sys.erase_chip();
        assert!(sys.ctl.irq_enabled());
        assert_eq!(sys.ctl.data_permissions(), DATA_PROT_BASELINE);

        sys.ctl.set_irq_enabled(false);
        sys.program_sector(1, &sector_pattern(0x44));
        assert!(!sys.ctl.irq_enabled());
    }

    #[test]
    fn test_read_with_intra_sector_offset() {
        let mut sys = system();
        let data = sector_pattern(0x0F);
        sys.program_sector(5, &data);
        let mut buf = [0u8; 16];
        sys.read(5, 0x80, &mut buf);
        assert_eq!(&buf[..], &data[0x80..0x90]);
    }

    #[test]
    fn test_save_data_accessors() {
        let mut sys = system();
        let image: Vec<u8> = (0..SAVE_DATA_SIZE).map(|i| i as u8).collect();
        sys.load_save_data(&image);
        assert_eq!(sys.ctl.save_state(), SaveState::Clean);
        assert_eq!(sys.save_data(), &image[..]);
    }
}
