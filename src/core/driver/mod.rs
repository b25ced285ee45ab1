//! Known flash-driver revisions and the per-revision patch procedure.
//!
//! Each supported cartridge carries one of a handful of historical flash
//! driver builds. A revision is recognized by its code signatures and by
//! the layout of the pointer record inside its metadata block; the attempt
//! for one revision loads that block, adopts the pointer slots, and
//! rewrites the driver's entry points with trampolines. The caller drives
//! the trial order per detected cartridge header.

use std::io::{Read, Seek, SeekFrom};

use bitflags::bitflags;
use log::{debug, info, warn};

use crate::core::flash::{PatchInfo, SaveSystem};
use crate::core::memory::DataAddr;
use crate::core::patch::{
    find_signature, patch_long_jump, patch_short_jump, PatchError, PatchResult, Signature,
};

/// Byte length of the per-revision driver metadata block.
pub const PATCH_BLOCK_LEN: usize = 0x94;

const PATCH_BLOCK_WORDS: usize = PATCH_BLOCK_LEN / 4;

/// Pointer-slot offsets inside the metadata block.
struct PatchInfoOffsets {
    prog_sector: usize,
    erase_chip: usize,
    erase_sector: usize,
    polling_sr: usize,
    max_timing: usize,
    flash: usize,
}

// Early driver layout, shared by V120, V123 and V126.
const V120_PATCH_OFFSETS: PatchInfoOffsets = PatchInfoOffsets {
    prog_sector: 0x18,
    erase_chip: 0x1C,
    erase_sector: 0x20,
    polling_sr: 0x24,
    max_timing: 0x28,
    flash: 0x2C,
};

// The early layout also records the read and verify-sector entry points as
// cartridge-bus pointers.
const V120_OFFSET_READ: usize = 0x84;
const V120_OFFSET_VERIFY_SECTOR: usize = 0x90;

// Compact 512 Kbit V130 layout.
const COMPACT_PATCH_OFFSETS: PatchInfoOffsets = PatchInfoOffsets {
    prog_sector: 0x14,
    erase_chip: 0x18,
    erase_sector: 0x1C,
    polling_sr: 0x20,
    max_timing: 0x24,
    flash: 0x28,
};

// Entry-point signatures per driver build.
const IDENTIFY_V120_SIG: Signature = Signature([
    0x80, 0xB5, 0x82, 0xB0, 0x6F, 0x46, 0x0E, 0x48, 0x0D, 0x49, 0x0A, 0x88, 0x0D, 0x4B, 0x11,
    0x1C,
]);

const IDENTIFY_V123_SIG: Signature = Signature([
    0x10, 0xB5, 0x07, 0x4A, 0x10, 0x88, 0x07, 0x49, 0x08, 0x40, 0x03, 0x21, 0x08, 0x43, 0x10,
    0x80,
]);

const VERIFY_V126_SIG: Signature = Signature([
    0x70, 0xB5, 0xC0, 0xB0, 0x0D, 0x1C, 0x16, 0x1C, 0x00, 0x04, 0x04, 0x0C, 0x07, 0x4A, 0x10,
    0x88,
]);

const READ_COMPACT_V130_SIG: Signature = Signature([
    0xF0, 0xB5, 0xA0, 0xB0, 0x0D, 0x1C, 0x16, 0x1C, 0x1F, 0x1C, 0x03, 0x04, 0x1C, 0x0C, 0x0F,
    0x4A,
]);

const VERIFY_COMPACT_V130_SIG: Signature = Signature([
    0x70, 0xB5, 0xC0, 0xB0, 0x0D, 0x1C, 0x16, 0x1C, 0x02, 0x04, 0x14, 0x0C, 0x0E, 0x48, 0x00,
    0x68,
]);

const VERIFY_SECTOR_COMPACT_V130_SIG: Signature = Signature([
    0x30, 0xB5, 0xC0, 0xB0, 0x0D, 0x1C, 0x03, 0x04, 0x1C, 0x0C, 0x0F, 0x4A, 0x10, 0x88, 0x0F,
    0x49,
]);

bitflags! {
    /// Hooks a revision attempt has already installed. There is no
    /// rollback: when a later step fails these stay in place, and the
    /// attempt logs what it left behind.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InstalledHooks: u8 {
        const IDENTIFY = 1 << 0;
        const READ = 1 << 1;
        const VERIFY_SECTOR = 1 << 2;
        const VERIFY = 1 << 3;
    }
}

/// One entry of the save-type metadata stream: a variable-length tag
/// naming the driver build, followed by the data block. The stream is
/// positioned at the tag when an attempt starts.
#[derive(Debug, Clone)]
pub struct SaveTypeEntry {
    pub tag_length: u32,
}

/// The known flash-driver revisions. A closed set: a cartridge whose
/// driver matches none of these is left unpatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverRevision {
    V120,
    V123,
    V126,
    CompactV130,
}

impl std::fmt::Display for DriverRevision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverRevision::V120 => write!(f, "flash V120"),
            DriverRevision::V123 => write!(f, "flash V123"),
            DriverRevision::V126 => write!(f, "flash V126"),
            DriverRevision::CompactV130 => write!(f, "flash 512K V130"),
        }
    }
}

/// Skip the entry tag (rounded up to a word boundary) and read the
/// metadata block into a word-aligned buffer. Any stream failure is a
/// short read; nothing in the image has been touched yet.
fn load_patch_block<S: Read + Seek>(
    stream: &mut S,
    entry: &SaveTypeEntry,
) -> PatchResult<[u32; PATCH_BLOCK_WORDS]> {
    let skip = (i64::from(entry.tag_length) + 3) & !3;
    stream
        .seek(SeekFrom::Current(skip))
        .map_err(|_| PatchError::ShortRead)?;
    let mut block = [0u32; PATCH_BLOCK_WORDS];
    stream
        .read_exact(bytemuck::cast_slice_mut(&mut block))
        .map_err(|_| PatchError::ShortRead)?;
    Ok(block)
}

/// Word field of the block at a byte offset. The block is read raw off the
/// stream, so the word still carries the stream's little-endian order.
fn block_word(block: &[u32; PATCH_BLOCK_WORDS], offset: usize) -> u32 {
    u32::from_le(block[offset / 4])
}

impl DriverRevision {
    /// Signature of this build's identify routine. V123 and every later
    /// build ship the same identify code.
    fn identify_signature(self) -> &'static Signature {
        match self {
            DriverRevision::V120 => &IDENTIFY_V120_SIG,
            _ => &IDENTIFY_V123_SIG,
        }
    }

    fn patch_info_offsets(self) -> &'static PatchInfoOffsets {
        match self {
            DriverRevision::CompactV130 => &COMPACT_PATCH_OFFSETS,
            _ => &V120_PATCH_OFFSETS,
        }
    }

    /// Attempt the full patch set for this revision. On success every
    /// required hook is installed; on failure the error says which step
    /// stopped the attempt. Hooks installed before the failing step are
    /// not rolled back.
    pub fn attempt<S: Read + Seek>(
        self,
        sys: &mut SaveSystem,
        stream: &mut S,
        entry: &SaveTypeEntry,
    ) -> PatchResult<()> {
        let mut installed = InstalledHooks::empty();
        let result = self.attempt_inner(sys, stream, entry, &mut installed);
        match &result {
            Ok(()) => info!("{}: all hooks installed", self),
            Err(err) if installed.is_empty() => debug!("{}: attempt failed: {}", self, err),
            Err(err) => warn!(
                "{}: attempt failed after installing {:?}: {}",
                self, installed, err
            ),
        }
        result
    }

    fn attempt_inner<S: Read + Seek>(
        self,
        sys: &mut SaveSystem,
        stream: &mut S,
        entry: &SaveTypeEntry,
        installed: &mut InstalledHooks,
    ) -> PatchResult<()> {
        let block = load_patch_block(stream, entry)?;
        self.adopt_patch_info(sys, &block);
        self.patch_identify(sys, installed)?;

        let hooks = *sys.hooks();
        match self {
            DriverRevision::V120 | DriverRevision::V123 | DriverRevision::V126 => {
                // Read and verify-sector entry points come out of the block
                // as cartridge-bus pointers.
                let read_target = sys.mem.rom_code_addr(block_word(&block, V120_OFFSET_READ));
                match patch_long_jump(&mut sys.mem, read_target, hooks.read) {
                    Ok(()) => *installed |= InstalledHooks::READ,
                    Err(err) => warn!(
                        "{}: read entry {:08X} outside the image: {:?}",
                        self, read_target.0, err
                    ),
                }

                let vs_target = sys
                    .mem
                    .rom_code_addr(block_word(&block, V120_OFFSET_VERIFY_SECTOR));
                match patch_short_jump(&mut sys.mem, vs_target, hooks.verify_sector) {
                    Ok(()) => *installed |= InstalledHooks::VERIFY_SECTOR,
                    Err(err) => warn!(
                        "{}: verify-sector entry {:08X} outside the image: {:?}",
                        self, vs_target.0, err
                    ),
                }

                if self == DriverRevision::V126 {
                    // V126 adds a full-buffer verify routine of its own.
                    self.patch_scanned(sys, &VERIFY_V126_SIG, hooks.verify, false)?;
                    *installed |= InstalledHooks::VERIFY;
                }
            }
            DriverRevision::CompactV130 => {
                self.patch_scanned(sys, &READ_COMPACT_V130_SIG, hooks.read, false)?;
                *installed |= InstalledHooks::READ;
                self.patch_scanned(
                    sys,
                    &VERIFY_SECTOR_COMPACT_V130_SIG,
                    hooks.verify_sector,
                    true,
                )?;
                *installed |= InstalledHooks::VERIFY_SECTOR;
                self.patch_scanned(sys, &VERIFY_COMPACT_V130_SIG, hooks.verify, false)?;
                *installed |= InstalledHooks::VERIFY;
            }
        }
        Ok(())
    }

    fn adopt_patch_info(self, sys: &mut SaveSystem, block: &[u32; PATCH_BLOCK_WORDS]) {
        let offsets = self.patch_info_offsets();
        sys.patch_info = PatchInfo {
            prog_sector: DataAddr(block_word(block, offsets.prog_sector)),
            erase_chip: DataAddr(block_word(block, offsets.erase_chip)),
            erase_sector: DataAddr(block_word(block, offsets.erase_sector)),
            polling_sr: DataAddr(block_word(block, offsets.polling_sr)),
            max_timing: DataAddr(block_word(block, offsets.max_timing)),
            flash: DataAddr(block_word(block, offsets.flash)),
        };
        debug!("{}: pointer record adopted from metadata block", self);
    }

    /// Find the identify routine and hook it to the emulated identify.
    fn patch_identify(self, sys: &mut SaveSystem, installed: &mut InstalledHooks) -> PatchResult<()> {
        let handler = sys.hooks().identify;
        let offset = find_signature(sys.mem.rom(), self.identify_signature())
            .ok_or(PatchError::SignatureNotFound)?;
        let target = sys.mem.rom_offset_addr(offset);
        if let Err(err) = patch_short_jump(&mut sys.mem, target, handler) {
            warn!("{}: identify hook at {:08X} failed: {:?}", self, target.0, err);
        } else {
            *installed |= InstalledHooks::IDENTIFY;
        }
        Ok(())
    }

    /// Find a routine by signature and hook it, short or long shape.
    fn patch_scanned(
        self,
        sys: &mut SaveSystem,
        sig: &Signature,
        handler: u32,
        short: bool,
    ) -> PatchResult<()> {
        let offset =
            find_signature(sys.mem.rom(), sig).ok_or(PatchError::SignatureNotFound)?;
        let target = sys.mem.rom_offset_addr(offset);
        let written = if short {
            patch_short_jump(&mut sys.mem, target, handler)
        } else {
            patch_long_jump(&mut sys.mem, target, handler)
        };
        if let Err(err) = written {
            warn!("{}: hook at {:08X} failed: {:?}", self, target.0, err);
        }
        Ok(())
    }
}

/// Try each candidate revision in the caller's order and return the one
/// that patched, or `None` when the image is left unpatched. The stream is
/// rewound to its current position before every attempt.
pub fn patch_flash_save<S: Read + Seek>(
    sys: &mut SaveSystem,
    stream: &mut S,
    entry: &SaveTypeEntry,
    revisions: &[DriverRevision],
) -> Option<DriverRevision> {
    let origin = match stream.stream_position() {
        Ok(pos) => pos,
        Err(err) => {
            warn!("metadata stream position unavailable: {}", err);
            return None;
        }
    };
    for &revision in revisions {
        if stream.seek(SeekFrom::Start(origin)).is_err() {
            warn!("metadata stream rewind failed");
            return None;
        }
        match revision.attempt(sys, stream, entry) {
            Ok(()) => {
                info!("flash save patched as {}", revision);
                return Some(revision);
            }
            Err(err) => debug!("{} rejected: {}", revision, err),
        }
    }
    warn!("no known flash driver matched; image left unpatched");
    None
}
