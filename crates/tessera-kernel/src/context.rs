//! Execution contexts and tiles.
//!
//! # Lifecycle
//!
//! ```text
//!             create
//!               │
//!               ▼
//!   ┌───────────────────┐  resume/start  ┌──────────┐  regs restored  ┌─────────┐
//!   │     SUSPENDED     │ ─────────────▶ │ RESUMING │ ──────────────▶ │ RUNNING │
//!   └───────────────────┘ ◀───────────── └──────────┘                 └────┬────┘
//!        ▲        │          restore failed                                │
//!        │        │                                                        │
//!        └────────┼──────────── yield / suspend / migrate ─────────────────┘
//!                 │                                                        │
//!                 ▼                          stop                          ▼
//!             ┌──────┐ ◀─────────────────────────────────────────────────────
//!             │ DEAD │
//!             └──────┘
//! ```
//!
//! A context owns two capability tables (objects and mappings), a kernel
//! memory quota, its endpoint register file while not on a tile, and the
//! ring buffers of its receive endpoints.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use serde::{Deserialize, Serialize};
use tessera_hal::TileDesc;
use tessera_kif::{CtxId, EpId, TileId, EP_COUNT, FIRST_FREE_EP, KERNEL_CTX};
use tessera_kernel_core::{CapRef, KernelError, KernelMemory, ObjId, TableId};

use crate::epfile::SavedEps;
use crate::tcu::Rings;

/// Context state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CtxState {
    /// Executing on its tile; endpoints live in the tile's registers
    Running,
    /// Off tile; endpoints saved in context memory
    Suspended,
    /// Endpoints being written back to the tile
    Resuming,
    /// Stopped; all capabilities revoked, exit code recorded
    Dead,
}

/// What configured an endpoint slot.
///
/// The slot is invalidated when the capability it was activated through is
/// revoked or the object is destroyed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Binding {
    pub obj: ObjId,
    pub via: CapRef,
}

/// An execution context.
#[derive(Debug)]
pub struct ExecutionContext {
    pub id: CtxId,
    /// Tile the context runs on (or is queued for)
    pub tile: TileId,
    pub state: CtxState,
    /// The context object representing this context
    pub obj: Option<ObjId>,
    pub obj_table: TableId,
    pub map_table: TableId,
    pub kmem: Arc<KernelMemory>,
    /// Endpoint registers while not on the tile
    pub eps: SavedEps,
    /// Receive ring contents
    pub rings: Rings,
    pub bindings: [Option<Binding>; EP_COUNT],
    /// Bit per endpoint slot in use
    ep_alloc: u32,
    /// Entry point, set on first start
    pub entry: Option<u64>,
    pub exit_code: Option<i32>,
    /// Deliveries into saved state not yet accounted for
    pub pending_forwards: u32,
    /// Contexts currently waiting for this one to exit
    pub waiters: u32,
}

impl ExecutionContext {
    pub fn new(
        id: CtxId,
        tile: TileId,
        obj_table: TableId,
        map_table: TableId,
        kmem: Arc<KernelMemory>,
    ) -> Self {
        Self {
            id,
            tile,
            state: CtxState::Suspended,
            obj: None,
            obj_table,
            map_table,
            kmem,
            eps: SavedEps::new(),
            rings: Rings::new(),
            bindings: [None; EP_COUNT],
            // standard slots are always in use
            ep_alloc: (1 << FIRST_FREE_EP) - 1,
            entry: None,
            exit_code: None,
            pending_forwards: 0,
            waiters: 0,
        }
    }

    pub fn is_kernel(&self) -> bool {
        self.id == KERNEL_CTX
    }

    /// Whether the live endpoint registers are on the tile.
    pub fn regs_on_tile(&self) -> bool {
        self.state == CtxState::Running && !self.is_kernel()
    }

    pub fn is_dead(&self) -> bool {
        self.state == CtxState::Dead
    }

    /// Fail with `ContextDead` if the context has stopped.
    pub fn check_alive(&self) -> Result<(), KernelError> {
        if self.is_dead() {
            Err(KernelError::ContextDead)
        } else {
            Ok(())
        }
    }

    /// Allocate the lowest free endpoint slot.
    pub fn alloc_ep(&mut self) -> Result<EpId, KernelError> {
        let ep = (FIRST_FREE_EP..EP_COUNT)
            .find(|ep| self.ep_alloc & (1 << ep) == 0)
            .ok_or(KernelError::NoFreeEndpoint)?;
        self.ep_alloc |= 1 << ep;
        Ok(ep)
    }

    pub fn mark_ep(&mut self, ep: EpId) {
        if ep < EP_COUNT {
            self.ep_alloc |= 1 << ep;
        }
    }

    pub fn free_ep(&mut self, ep: EpId) {
        if (FIRST_FREE_EP..EP_COUNT).contains(&ep) {
            self.ep_alloc &= !(1 << ep);
        }
    }

    pub fn ep_in_use(&self, ep: EpId) -> bool {
        ep < EP_COUNT && self.ep_alloc & (1 << ep) != 0
    }
}

/// A tile and its run queue.
#[derive(Debug)]
pub struct Tile {
    pub desc: TileDesc,
    /// Context whose registers are on the tile
    pub current: Option<CtxId>,
    /// Started contexts waiting for the tile
    pub ready: VecDeque<CtxId>,
    /// Contexts assigned to this tile
    pub assigned: usize,
}

impl Tile {
    pub fn new(desc: TileDesc) -> Self {
        Self {
            desc,
            current: None,
            ready: VecDeque::new(),
            assigned: 0,
        }
    }

    pub fn dequeue(&mut self, ctx: CtxId) {
        self.ready.retain(|c| *c != ctx);
    }
}
