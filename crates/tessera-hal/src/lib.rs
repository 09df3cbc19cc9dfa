//! Hardware Abstraction Layer trait for Tessera
//!
//! The kernel drives a tile-based manycore machine. Everything it needs from
//! the platform goes through the [`HAL`] trait so the same kernel runs on the
//! simulator (`tessera-hal-mock`) and on real tiles.
//!
//! # What the kernel needs from a platform
//!
//! - **Enumeration**: the tile list, consumed once at boot
//! - **Endpoint registers**: read/write one slot of a tile's communication unit
//! - **Tile control**: start execution at an entry point, stop a tile
//! - **Memory tiles**: bulk read/write backing MEMORY endpoints
//! - **Address spaces**: map/unmap pages for mapping capabilities
//! - **Time & debug output**

#![no_std]

extern crate alloc;

use alloc::vec::Vec;
use tessera_kif::{CtxId, EpId, EpRegs, Perm, TileId};

/// Hardware Abstraction Layer trait
///
/// Register access is per slot. Implementations must make each
/// `write_ep` call atomic for the slot it touches; the kernel never
/// configures the same tile from two threads at once.
pub trait HAL: Send + Sync + 'static {
    // === Platform Enumeration ===

    /// Describe all tiles of the platform.
    ///
    /// Called once at boot. Tile ids are dense and start at 0.
    fn tiles(&self) -> Vec<TileDesc>;

    // === Endpoint Registers ===

    /// Read the registers of endpoint `ep` on `tile`.
    ///
    /// # Returns
    /// * `Err(HalError::UnknownTile)` - No such tile
    /// * `Err(HalError::InvalidEndpoint)` - Slot index out of range
    fn read_ep(&self, tile: TileId, ep: EpId) -> Result<EpRegs, HalError>;

    /// Overwrite the registers of endpoint `ep` on `tile`.
    ///
    /// # Returns
    /// * `Err(HalError::TileUnreachable)` - Transient failure, may be retried
    fn write_ep(&self, tile: TileId, ep: EpId, regs: EpRegs) -> Result<(), HalError>;

    // === Tile Control ===

    /// Begin instruction execution on `tile` at `entry`.
    fn start_tile(&self, tile: TileId, entry: u64) -> Result<(), HalError>;

    /// Halt instruction execution on `tile`.
    fn stop_tile(&self, tile: TileId) -> Result<(), HalError>;

    // === Memory ===

    /// Read `buf.len()` bytes at `addr` of a memory tile.
    fn read_mem(&self, tile: TileId, addr: u64, buf: &mut [u8]) -> Result<(), HalError>;

    /// Write `data` at `addr` of a memory tile.
    fn write_mem(&self, tile: TileId, addr: u64, data: &[u8]) -> Result<(), HalError>;

    // === Address Spaces ===

    /// Map `pages` pages at virtual `virt` of `ctx` to physical `phys`.
    ///
    /// Platforms without virtual memory return `NotSupported`.
    fn map_pages(
        &self,
        tile: TileId,
        ctx: CtxId,
        virt: u64,
        phys: u64,
        pages: u64,
        perm: Perm,
    ) -> Result<(), HalError>;

    /// Remove `pages` pages at virtual `virt` of `ctx`.
    fn unmap_pages(&self, tile: TileId, ctx: CtxId, virt: u64, pages: u64) -> Result<(), HalError>;

    // === Time & Debug ===

    /// Monotonic time in nanoseconds
    fn now_nanos(&self) -> u64;

    /// Write a debug message to the platform's console
    fn debug_write(&self, msg: &str);
}

/// Kind of a tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileKind {
    /// General purpose core
    Compute,
    /// Fixed-function accelerator (runs contexts, no virtual memory)
    Accelerator,
    /// Memory module
    Memory,
}

/// Capabilities of one tile, as reported at boot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileDesc {
    pub id: TileId,
    pub kind: TileKind,
    /// Local memory (compute) or module size (memory), in bytes
    pub mem_size: u64,
    /// Whether the tile translates virtual addresses
    pub has_virtmem: bool,
}

impl TileDesc {
    /// Whether contexts can run on this tile.
    pub fn runs_contexts(&self) -> bool {
        matches!(self.kind, TileKind::Compute | TileKind::Accelerator)
    }

    pub fn is_memory(&self) -> bool {
        self.kind == TileKind::Memory
    }
}

/// HAL error types
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HalError {
    /// No tile with this id
    #[error("unknown tile")]
    UnknownTile,
    /// Endpoint slot index out of range
    #[error("invalid endpoint slot")]
    InvalidEndpoint,
    /// Tile did not respond; the operation may be retried
    #[error("tile unreachable")]
    TileUnreachable,
    /// Memory access outside the module
    #[error("memory access out of bounds")]
    OutOfBounds,
    /// Operation not supported on this platform or tile
    #[error("not supported")]
    NotSupported,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_kinds() {
        let mem = TileDesc {
            id: TileId(4),
            kind: TileKind::Memory,
            mem_size: 1 << 20,
            has_virtmem: false,
        };
        let accel = TileDesc {
            kind: TileKind::Accelerator,
            ..mem
        };
        assert!(mem.is_memory());
        assert!(!mem.runs_contexts());
        assert!(accel.runs_contexts());
    }
}
