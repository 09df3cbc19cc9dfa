//! Endpoint register files.
//!
//! A context's endpoints live in one of two places:
//!
//! ```text
//!   RUNNING                          SUSPENDED / RESUMING / kernel
//!   ┌──────────────┐                 ┌──────────────┐
//!   │ tile CU regs │ ◀── TileEps     │ saved copy   │ ◀── SavedEps
//!   └──────────────┘                 └──────────────┘
//! ```
//!
//! Protocol code is written against [`EndpointRegisters`] and does not care
//! which one it is talking to.

use tessera_hal::HAL;
use tessera_kif::{EpId, EpRegs, TileId, EP_COUNT};
use tessera_kernel_core::KernelError;

use crate::hal_err;

/// Slot-granular access to one context's endpoint registers.
pub trait EndpointRegisters {
    fn read_slot(&self, ep: EpId) -> Result<EpRegs, KernelError>;
    fn write_slot(&mut self, ep: EpId, regs: EpRegs) -> Result<(), KernelError>;
}

/// Endpoint registers saved in context memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SavedEps {
    regs: [EpRegs; EP_COUNT],
}

impl SavedEps {
    pub fn new() -> Self {
        Self {
            regs: [EpRegs::INVALID; EP_COUNT],
        }
    }

    pub fn all(&self) -> &[EpRegs; EP_COUNT] {
        &self.regs
    }

    /// Replace the whole file (after reading it back from a tile).
    pub fn load(&mut self, regs: [EpRegs; EP_COUNT]) {
        self.regs = regs;
    }

    pub fn clear(&mut self) {
        self.regs = [EpRegs::INVALID; EP_COUNT];
    }
}

impl Default for SavedEps {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointRegisters for SavedEps {
    fn read_slot(&self, ep: EpId) -> Result<EpRegs, KernelError> {
        self.regs.get(ep).copied().ok_or(KernelError::InvalidArgs)
    }

    fn write_slot(&mut self, ep: EpId, regs: EpRegs) -> Result<(), KernelError> {
        let slot = self.regs.get_mut(ep).ok_or(KernelError::InvalidArgs)?;
        *slot = regs;
        Ok(())
    }
}

/// Endpoint registers of the context currently running on a tile.
pub struct TileEps<'a, H: HAL> {
    hal: &'a H,
    tile: TileId,
}

impl<'a, H: HAL> TileEps<'a, H> {
    pub fn new(hal: &'a H, tile: TileId) -> Self {
        Self { hal, tile }
    }

    /// Read all slots. Fails without partial result.
    pub fn read_all(&self) -> Result<[EpRegs; EP_COUNT], KernelError> {
        let mut regs = [EpRegs::INVALID; EP_COUNT];
        for (ep, slot) in regs.iter_mut().enumerate() {
            *slot = self.read_slot(ep)?;
        }
        Ok(regs)
    }

    /// Invalidate every slot, ignoring unreachable ones.
    pub fn clear_all(&mut self) {
        for ep in 0..EP_COUNT {
            if let Err(e) = self.hal.write_ep(self.tile, ep, EpRegs::INVALID) {
                log::warn!(target: "tcu", "tile {} ep {}: clear failed: {}", self.tile.0, ep, e);
            }
        }
    }
}

impl<H: HAL> EndpointRegisters for TileEps<'_, H> {
    fn read_slot(&self, ep: EpId) -> Result<EpRegs, KernelError> {
        self.hal.read_ep(self.tile, ep).map_err(hal_err)
    }

    fn write_slot(&mut self, ep: EpId, regs: EpRegs) -> Result<(), KernelError> {
        self.hal.write_ep(self.tile, ep, regs).map_err(hal_err)
    }
}
