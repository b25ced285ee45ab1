//! Process-wide control block and write-window arbitration.
//!
//! Mutating flash operations run on the same core as asynchronous interrupt
//! handlers, so each one is bracketed by a critical section: interrupts are
//! masked and the data-permission register is switched to let the save
//! window be written, then both are restored. A handler can never observe a
//! half-written save buffer or run with stale protection state.

use log::trace;

/// Data-permission register value that opens every region for writes.
pub const DATA_PROT_WRITABLE: u32 = 0x3333_3333;

/// Default baseline: PU region 3 (the save window) read-only, rest RW.
pub const DATA_PROT_BASELINE: u32 = 0x3333_1333;

/// Flush state of the save buffer, consulted by the external SD flusher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
    Clean,
    Dirty,
}

/// Process-wide control block shared with the rest of the loader.
#[derive(Debug, Clone)]
pub struct ControlBlock {
    save_state: SaveState,
    irq_enabled: bool,
    data_permissions: u32,
    baseline_permissions: u32,
}

impl ControlBlock {
    pub fn new(baseline_permissions: u32) -> Self {
        Self {
            save_state: SaveState::Clean,
            irq_enabled: true,
            data_permissions: baseline_permissions,
            baseline_permissions,
        }
    }

    pub fn save_state(&self) -> SaveState {
        self.save_state
    }

    /// Called by the flusher once the save buffer is back on the card.
    pub fn mark_clean(&mut self) {
        self.save_state = SaveState::Clean;
    }

    pub fn irq_enabled(&self) -> bool {
        self.irq_enabled
    }

    pub fn set_irq_enabled(&mut self, enabled: bool) {
        self.irq_enabled = enabled;
    }

    /// Current value of the data-permission register.
    pub fn data_permissions(&self) -> u32 {
        self.data_permissions
    }
}

impl Default for ControlBlock {
    fn default() -> Self {
        Self::new(DATA_PROT_BASELINE)
    }
}

/// Scoped critical section over the save window.
///
/// Construction masks interrupts and opens the data-permission register;
/// dropping the guard restores both unconditionally, on every exit path.
pub struct CriticalSection<'a> {
    ctl: &'a mut ControlBlock,
    saved_irq: bool,
}

impl<'a> CriticalSection<'a> {
    pub fn enter(ctl: &'a mut ControlBlock) -> Self {
        let saved_irq = ctl.irq_enabled;
        ctl.irq_enabled = false;
        ctl.data_permissions = DATA_PROT_WRITABLE;
        trace!("critical section entered (irq was {})", saved_irq);
        Self { ctl, saved_irq }
    }

    /// Flag the save buffer for write-back. Mutations happen inside the
    /// section, so the flag is raised before protection is restored.
    pub fn mark_save_dirty(&mut self) {
        self.ctl.save_state = SaveState::Dirty;
    }
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        self.ctl.data_permissions = self.ctl.baseline_permissions;
        self.ctl.irq_enabled = self.saved_irq;
        trace!("critical section left");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_critical_section_switches_and_restores() {
        let mut ctl = ControlBlock::default();
        {
            let cs = CriticalSection::enter(&mut ctl);
            assert!(!cs.ctl.irq_enabled);
            assert_eq!(cs.ctl.data_permissions, DATA_PROT_WRITABLE);
        }
        assert!(ctl.irq_enabled());
        assert_eq!(ctl.data_permissions(), DATA_PROT_BASELINE);
    }

    #[test]
    fn test_masked_irqs_stay_masked() {
        let mut ctl = ControlBlock::default();
        ctl.set_irq_enabled(false);
        {
            let _cs = CriticalSection::enter(&mut ctl);
        }
        assert!(!ctl.irq_enabled());
    }

    #[test]
    fn test_dirty_flag_through_guard() {
        let mut ctl = ControlBlock::default();
        assert_eq!(ctl.save_state(), SaveState::Clean);
        {
            let mut cs = CriticalSection::enter(&mut ctl);
            cs.mark_save_dirty();
        }
        assert_eq!(ctl.save_state(), SaveState::Dirty);
        ctl.mark_clean();
        assert_eq!(ctl.save_state(), SaveState::Clean);
    }

    #[test]
    fn test_custom_baseline_restored() {
        let mut ctl = ControlBlock::new(0x3311_1333);
        {
            let _cs = CriticalSection::enter(&mut ctl);
        }
        assert_eq!(ctl.data_permissions(), 0x3311_1333);
    }
}
