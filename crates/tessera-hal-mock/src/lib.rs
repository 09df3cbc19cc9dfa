//! Simulated tile platform for testing Tessera
//!
//! `SimHal` implements the HAL trait entirely in memory: every tile has an
//! endpoint register file, compute tiles remember whether they are running
//! and which pages are mapped, memory tiles hold a byte array. Time only
//! moves when a test advances it.
//!
//! Register writes and page mappings can be made to fail per tile, to
//! exercise the kernel's rollback paths (resume, migrate).

#![no_std]
extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;
use tessera_hal::{HalError, TileDesc, TileKind, HAL};
use tessera_kif::{CtxId, EpId, EpRegs, Perm, TileId, EP_COUNT, PAGE_SIZE};

/// Default size of the simulated memory tile
pub const DEFAULT_MEM_SIZE: u64 = 1 << 20;

/// Default local memory of a compute tile
const COMPUTE_MEM_SIZE: u64 = 64 * 1024;

/// One mapped page run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimMapping {
    pub phys: u64,
    pub pages: u64,
    pub perm: Perm,
}

/// Simulated tile state
struct SimTile {
    desc: TileDesc,
    eps: [EpRegs; EP_COUNT],
    /// Backing store (memory tiles only)
    mem: Vec<u8>,
    /// Entry point while running
    running: Option<u64>,
    /// (ctx, virt) -> mapping
    mappings: BTreeMap<(CtxId, u64), SimMapping>,
    /// Remaining register writes before writes start failing
    write_budget: Option<usize>,
    /// Page mapping requests fail
    maps_fail: bool,
}

impl SimTile {
    fn new(desc: TileDesc) -> Self {
        let mem = if desc.is_memory() {
            vec![0u8; desc.mem_size as usize]
        } else {
            Vec::new()
        };
        Self {
            desc,
            eps: [EpRegs::INVALID; EP_COUNT],
            mem,
            running: None,
            mappings: BTreeMap::new(),
            write_budget: None,
            maps_fail: false,
        }
    }
}

/// Simulated platform
pub struct SimHal {
    /// Simulated time in nanoseconds
    time: AtomicU64,
    /// Captured debug messages
    debug_log: Mutex<Vec<String>>,
    tiles: Mutex<Vec<SimTile>>,
}

impl SimHal {
    /// `compute` compute tiles followed by one memory tile of `mem_size` bytes.
    pub fn new(compute: usize, mem_size: u64) -> Self {
        let mut kinds = vec![TileKind::Compute; compute];
        kinds.push(TileKind::Memory);
        Self::with_tiles(&kinds, mem_size)
    }

    /// Build a platform from an explicit list of tile kinds.
    pub fn with_tiles(kinds: &[TileKind], mem_size: u64) -> Self {
        let tiles = kinds
            .iter()
            .enumerate()
            .map(|(i, kind)| {
                SimTile::new(TileDesc {
                    id: TileId(i as u8),
                    kind: *kind,
                    mem_size: match kind {
                        TileKind::Memory => mem_size,
                        _ => COMPUTE_MEM_SIZE,
                    },
                    has_virtmem: *kind == TileKind::Compute,
                })
            })
            .collect();
        Self {
            time: AtomicU64::new(0),
            debug_log: Mutex::new(Vec::new()),
            tiles: Mutex::new(tiles),
        }
    }

    /// Advance the simulated time by the given duration
    pub fn advance_time(&self, nanos: u64) {
        self.time.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Get all captured debug messages
    pub fn get_debug_log(&self) -> Vec<String> {
        self.debug_log.lock().clone()
    }

    /// Check if a specific message was logged
    pub fn has_log_containing(&self, substr: &str) -> bool {
        self.debug_log.lock().iter().any(|msg| msg.contains(substr))
    }

    /// Entry point the tile is executing, if running.
    pub fn running_entry(&self, tile: TileId) -> Option<u64> {
        self.tiles
            .lock()
            .get(tile.0 as usize)
            .and_then(|t| t.running)
    }

    /// Raw registers of a slot, bypassing fault injection.
    pub fn peek_ep(&self, tile: TileId, ep: EpId) -> EpRegs {
        self.tiles
            .lock()
            .get(tile.0 as usize)
            .and_then(|t| t.eps.get(ep).copied())
            .unwrap_or_default()
    }

    /// Let the next `n` register writes on `tile` succeed, then fail.
    pub fn fail_ep_writes_after(&self, tile: TileId, n: usize) {
        if let Some(t) = self.tiles.lock().get_mut(tile.0 as usize) {
            t.write_budget = Some(n);
        }
    }

    /// Make every page mapping request on `tile` fail.
    pub fn fail_maps(&self, tile: TileId) {
        if let Some(t) = self.tiles.lock().get_mut(tile.0 as usize) {
            t.maps_fail = true;
        }
    }

    /// Remove all injected faults.
    pub fn clear_faults(&self) {
        for t in self.tiles.lock().iter_mut() {
            t.write_budget = None;
            t.maps_fail = false;
        }
    }

    /// Mappings installed for `ctx` on `tile`, keyed by virtual address.
    pub fn mappings(&self, tile: TileId, ctx: CtxId) -> Vec<(u64, SimMapping)> {
        self.tiles
            .lock()
            .get(tile.0 as usize)
            .map(|t| {
                t.mappings
                    .iter()
                    .filter(|((c, _), _)| *c == ctx)
                    .map(|((_, virt), m)| (*virt, *m))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn with_tile<R>(
        &self,
        tile: TileId,
        f: impl FnOnce(&mut SimTile) -> Result<R, HalError>,
    ) -> Result<R, HalError> {
        let mut tiles = self.tiles.lock();
        let t = tiles
            .get_mut(tile.0 as usize)
            .ok_or(HalError::UnknownTile)?;
        f(t)
    }
}

impl Default for SimHal {
    fn default() -> Self {
        Self::new(4, DEFAULT_MEM_SIZE)
    }
}

fn mem_range(t: &SimTile, addr: u64, len: usize) -> Result<core::ops::Range<usize>, HalError> {
    if !t.desc.is_memory() {
        return Err(HalError::NotSupported);
    }
    let start = usize::try_from(addr).map_err(|_| HalError::OutOfBounds)?;
    let end = start.checked_add(len).ok_or(HalError::OutOfBounds)?;
    if end > t.mem.len() {
        return Err(HalError::OutOfBounds);
    }
    Ok(start..end)
}

impl HAL for SimHal {
    fn tiles(&self) -> Vec<TileDesc> {
        self.tiles.lock().iter().map(|t| t.desc).collect()
    }

    fn read_ep(&self, tile: TileId, ep: EpId) -> Result<EpRegs, HalError> {
        self.with_tile(tile, |t| t.eps.get(ep).copied().ok_or(HalError::InvalidEndpoint))
    }

    fn write_ep(&self, tile: TileId, ep: EpId, regs: EpRegs) -> Result<(), HalError> {
        self.with_tile(tile, |t| {
            if let Some(budget) = t.write_budget.as_mut() {
                if *budget == 0 {
                    return Err(HalError::TileUnreachable);
                }
                *budget -= 1;
            }
            let slot = t.eps.get_mut(ep).ok_or(HalError::InvalidEndpoint)?;
            *slot = regs;
            Ok(())
        })
    }

    fn start_tile(&self, tile: TileId, entry: u64) -> Result<(), HalError> {
        self.with_tile(tile, |t| {
            if !t.desc.runs_contexts() {
                return Err(HalError::NotSupported);
            }
            t.running = Some(entry);
            Ok(())
        })
    }

    fn stop_tile(&self, tile: TileId) -> Result<(), HalError> {
        self.with_tile(tile, |t| {
            t.running = None;
            Ok(())
        })
    }

    fn read_mem(&self, tile: TileId, addr: u64, buf: &mut [u8]) -> Result<(), HalError> {
        self.with_tile(tile, |t| {
            let range = mem_range(t, addr, buf.len())?;
            buf.copy_from_slice(&t.mem[range]);
            Ok(())
        })
    }

    fn write_mem(&self, tile: TileId, addr: u64, data: &[u8]) -> Result<(), HalError> {
        self.with_tile(tile, |t| {
            let range = mem_range(t, addr, data.len())?;
            t.mem[range].copy_from_slice(data);
            Ok(())
        })
    }

    fn map_pages(
        &self,
        tile: TileId,
        ctx: CtxId,
        virt: u64,
        phys: u64,
        pages: u64,
        perm: Perm,
    ) -> Result<(), HalError> {
        self.with_tile(tile, |t| {
            if !t.desc.has_virtmem {
                return Err(HalError::NotSupported);
            }
            if t.maps_fail {
                return Err(HalError::TileUnreachable);
            }
            if virt % PAGE_SIZE != 0 || phys % PAGE_SIZE != 0 {
                return Err(HalError::OutOfBounds);
            }
            t.mappings.insert((ctx, virt), SimMapping { phys, pages, perm });
            Ok(())
        })
    }

    fn unmap_pages(&self, tile: TileId, ctx: CtxId, virt: u64, _pages: u64) -> Result<(), HalError> {
        self.with_tile(tile, |t| {
            t.mappings.remove(&(ctx, virt));
            Ok(())
        })
    }

    fn now_nanos(&self) -> u64 {
        self.time.load(Ordering::SeqCst)
    }

    fn debug_write(&self, msg: &str) {
        self.debug_log.lock().push(String::from(msg));
    }
}
