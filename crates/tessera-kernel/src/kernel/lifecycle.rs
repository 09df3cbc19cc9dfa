//! Context creation, scheduling, stop and teardown.
//!
//! One context at a time owns a tile's register file. Starting or resuming
//! a context whose tile is taken queues it; the queue is served whenever the
//! tile is given up (yield, suspend, migrate, stop).
//!
//! ```text
//!   save:    tile regs ──read──▶ SavedEps     tile stopped, regs cleared
//!   restore: SavedEps ──write──▶ tile regs    tile started at entry
//! ```
//!
//! A restore that fails part way clears what it wrote and leaves the
//! context SUSPENDED with its saved registers untouched.

use alloc::sync::Arc;
use alloc::vec::Vec;

use tessera_hal::HAL;
use tessera_kif::{
    ep_sel, CapSel, CapType, CtxId, EpRegs, EpShape, Label, Perm, RecvEp, SendEp, TileId,
    DEF_REP, EP_COUNT, FIRST_FREE_EP, KERNEL_CTX, KSYS_REP, SEL_CTX, SEL_KMEM, SEL_MEM, SYSC_REP,
    SYSC_SEP,
};
use tessera_kernel_core::{CapRef, KObject, KernelError, KernelMemory, ObjId, Revoked, TableId};

use super::Kernel;
use crate::context::{CtxState, ExecutionContext};
use crate::epfile::{EndpointRegisters, TileEps};
use crate::hal_err;
use crate::thread::{Event, Outcome};

impl<H: HAL> Kernel<H> {
    // ========================================================================
    // Creation
    // ========================================================================

    /// Create a context paid by the kernel memory at `kmem`, with its
    /// capability at `dst` of the parent. `tile = None` picks the least
    /// loaded tile. The new context is SUSPENDED until started.
    pub fn create_context(
        &mut self,
        parent: CtxId,
        dst: CapSel,
        kmem: CapSel,
        tile: Option<TileId>,
    ) -> Result<(CtxId, TileId), KernelError> {
        let table = self.alive(parent)?.obj_table;
        let (kmem_cap, quota) = self.kmem_at(parent, kmem)?;
        self.spawn(table, dst, quota, kmem_cap, tile)
    }

    /// Create the root context: all kernel memory, the whole memory tile,
    /// on the first tile that runs contexts.
    pub(crate) fn create_root(&mut self) -> Result<CtxId, KernelError> {
        let ktable = self.kernel_table();
        let tile = self
            .tiles
            .values()
            .find(|t| t.desc.runs_contexts())
            .map(|t| t.desc.id)
            .ok_or(KernelError::NotSupported)?;

        let quota = KernelMemory::new_root(self.config.root_kmem);
        let ksel = self.alloc_kernel_sel();
        let kmem_cap = self
            .space
            .create(ktable, ksel, KObject::KernelMemory(quota.clone()))?;
        let csel = self.alloc_kernel_sel();
        let (root, _) = self.spawn(ktable, csel, quota, kmem_cap, Some(tile))?;

        if let Some(mem) = self.mem_tile.and_then(|t| self.tiles.get(&t)) {
            let size = mem.desc.mem_size;
            let msel = self.alloc_kernel_sel();
            let region = self.space.create(
                ktable,
                msel,
                KObject::MemoryRegion {
                    owner: KERNEL_CTX,
                    base: 0,
                    size,
                    perm: Perm::RWX,
                },
            )?;
            let root_table = self.ctx(root)?.obj_table;
            self.space.obtain(root_table, SEL_MEM, region)?;
        }

        log::info!(target: "ctx", "root context {} on tile {}", root.0, tile.0);
        Ok(root)
    }

    fn spawn(
        &mut self,
        parent_table: TableId,
        dst: CapSel,
        quota: Arc<KernelMemory>,
        kmem_cap: CapRef,
        tile: Option<TileId>,
    ) -> Result<(CtxId, TileId), KernelError> {
        let tile = self.pick_tile(tile)?;
        if !self
            .space
            .table(parent_table)
            .is_some_and(|t| t.range_unused(dst, 1))
        {
            return Err(KernelError::InvalidSelector);
        }
        let id = self.alloc_ctx_id()?;

        let obj_table = self
            .space
            .create_table(Some(id), CapType::Object, Some(quota.clone()));
        let map_table = self
            .space
            .create_table(Some(id), CapType::Mapping, Some(quota.clone()));
        let mut c = ExecutionContext::new(id, tile, obj_table, map_table, quota);
        if let Err(e) = self.init_standard_eps(&mut c) {
            let _ = self.space.remove_table(obj_table);
            let _ = self.space.remove_table(map_table);
            return Err(e);
        }
        self.contexts.insert(id, c);

        match self.populate(id, parent_table, dst, kmem_cap) {
            Ok(obj) => {
                if let Some(c) = self.contexts.get_mut(&id) {
                    c.obj = Some(obj);
                }
                if let Some(t) = self.tiles.get_mut(&tile) {
                    t.assigned += 1;
                }
                log::info!(target: "ctx", "ctx {} created on tile {}", id.0, tile.0);
                Ok((id, tile))
            }
            Err(e) => {
                self.unspawn(id, parent_table, dst);
                Err(e)
            }
        }
    }

    /// Standard endpoints: syscall send, syscall reply, default reply.
    fn init_standard_eps(&self, c: &mut ExecutionContext) -> Result<(), KernelError> {
        let cfg = &self.config;
        let sysc = SendEp::new(KERNEL_CTX, KSYS_REP, c.id.0 as Label, cfg.syscall_msg_order, 1);
        let sysr = RecvEp::new(0, cfg.reply_msg_order, cfg.reply_msg_order);
        let defr = RecvEp::new(0, cfg.def_buf_order(), cfg.def_msg_order);
        if !RecvEp::orders_valid(cfg.def_buf_order(), cfg.def_msg_order)
            || !RecvEp::orders_valid(cfg.reply_msg_order, cfg.reply_msg_order)
        {
            return Err(KernelError::InvalidArgs);
        }

        c.eps.write_slot(SYSC_SEP, EpShape::Send(sysc).to_regs())?;
        c.eps.write_slot(SYSC_REP, EpShape::Receive(sysr).to_regs())?;
        c.eps.write_slot(DEF_REP, EpShape::Receive(defr).to_regs())?;
        c.rings.install(SYSC_REP, sysr.slots());
        c.rings.install(DEF_REP, defr.slots());
        Ok(())
    }

    /// Fill the new context's table and place its capability at the parent.
    fn populate(
        &mut self,
        id: CtxId,
        parent_table: TableId,
        dst: CapSel,
        kmem_cap: CapRef,
    ) -> Result<ObjId, KernelError> {
        let table = self.ctx(id)?.obj_table;
        let root = self
            .space
            .create(parent_table, dst, KObject::Context { ctx: id })?;
        self.space.obtain(table, SEL_CTX, root)?;
        self.space.obtain(table, SEL_KMEM, kmem_cap)?;
        for ep in FIRST_FREE_EP..EP_COUNT {
            self.space
                .create(table, ep_sel(ep), KObject::Endpoint { ctx: id, ep })?;
        }
        self.space
            .get(root)
            .map(|c| c.obj)
            .ok_or(KernelError::CapabilityGone)
    }

    /// Undo a half-created context. It never ran, so its capabilities go
    /// without side effects.
    fn unspawn(&mut self, id: CtxId, parent_table: TableId, dst: CapSel) {
        let root = CapRef::new(parent_table, dst);
        let ours = self
            .space
            .get(root)
            .and_then(|c| self.space.object(c.obj))
            .is_some_and(|o| matches!(o, KObject::Context { ctx } if *ctx == id));
        if ours {
            let _ = self.space.revoke(root, true);
        }
        if let Some(c) = self.contexts.remove(&id) {
            for table in [c.obj_table, c.map_table] {
                self.space.revoke_all(table);
                let _ = self.space.remove_table(table);
            }
        }
    }

    fn pick_tile(&self, tile: Option<TileId>) -> Result<TileId, KernelError> {
        match tile {
            Some(id) => match self.tiles.get(&id) {
                Some(t) if t.desc.runs_contexts() => Ok(id),
                _ => Err(KernelError::InvalidArgs),
            },
            None => self
                .tiles
                .values()
                .filter(|t| t.desc.runs_contexts())
                .min_by_key(|t| (t.assigned, t.desc.id))
                .map(|t| t.desc.id)
                .ok_or(KernelError::NotSupported),
        }
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Start a created context at `entry`.
    pub fn start(&mut self, id: CtxId, entry: u64) -> Result<(), KernelError> {
        let c = self.alive(id)?;
        if c.entry.is_some() || c.state != CtxState::Suspended {
            return Err(KernelError::InvalidArgs);
        }
        self.ctx_mut(id)?.entry = Some(entry);
        if let Err(e) = self.schedule(id) {
            self.ctx_mut(id)?.entry = None;
            return Err(e);
        }
        Ok(())
    }

    /// Put a started, SUSPENDED context back on its tile (or in its queue).
    pub fn resume(&mut self, id: CtxId) -> Result<(), KernelError> {
        let c = self.alive(id)?;
        if c.entry.is_none() {
            return Err(KernelError::InvalidArgs);
        }
        match c.state {
            CtxState::Suspended => self.schedule(id),
            _ => Ok(()),
        }
    }

    /// Take a RUNNING context off its tile without queueing it again.
    pub fn suspend(&mut self, id: CtxId) -> Result<(), KernelError> {
        let c = self.alive(id)?;
        let tile = c.tile;
        if c.state == CtxState::Running {
            self.save(id)?;
            self.dispatch(tile);
        } else if let Some(t) = self.tiles.get_mut(&tile) {
            t.dequeue(id);
        }
        Ok(())
    }

    /// Give the tile to the next queued context; `id` goes to the back of
    /// the queue.
    pub fn yield_ctx(&mut self, id: CtxId) -> Result<(), KernelError> {
        let c = self.alive(id)?;
        if c.state != CtxState::Running {
            return Ok(());
        }
        let tile = c.tile;
        self.save(id)?;
        if let Some(t) = self.tiles.get_mut(&tile) {
            t.ready.push_back(id);
        }
        self.dispatch(tile);
        Ok(())
    }

    /// Move a context to another tile.
    ///
    /// A RUNNING context is suspended first and stays SUSPENDED afterwards;
    /// its endpoint state, including unread messages, moves with it.
    pub fn migrate(&mut self, id: CtxId, to: TileId) -> Result<(), KernelError> {
        let c = self.alive(id)?;
        let (from, map_table) = (c.tile, c.map_table);
        let dest = self
            .tiles
            .get(&to)
            .filter(|t| t.desc.runs_contexts())
            .ok_or(KernelError::InvalidArgs)?;
        let has_maps = self.space.table(map_table).is_some_and(|t| !t.is_empty());
        if has_maps && !dest.desc.has_virtmem {
            return Err(KernelError::NotSupported);
        }
        if from == to {
            return Ok(());
        }

        let was_running = self.ctx(id)?.state == CtxState::Running;
        if was_running {
            self.save(id)?;
        }
        if let Err(e) = self.remap(id, map_table, from, to) {
            // back onto the old tile as it was
            if was_running {
                if let Err(undo) = self.restore(id) {
                    log::warn!(target: "ctx", "ctx {}: restore after failed migration: {}", id.0, undo);
                    self.dispatch(from);
                }
            }
            return Err(e);
        }

        if let Some(t) = self.tiles.get_mut(&from) {
            t.dequeue(id);
            t.assigned = t.assigned.saturating_sub(1);
        }
        if let Some(t) = self.tiles.get_mut(&to) {
            t.assigned += 1;
        }
        self.ctx_mut(id)?.tile = to;
        self.dispatch(from);
        log::info!(target: "ctx", "ctx {} migrated from tile {} to tile {}", id.0, from.0, to.0);
        Ok(())
    }

    /// Map everything of `map_table` on `to`, then remove it from `from`.
    fn remap(
        &mut self,
        id: CtxId,
        map_table: TableId,
        from: TileId,
        to: TileId,
    ) -> Result<(), KernelError> {
        let maps: Vec<(u64, u64, u64, Perm)> = self
            .space
            .table(map_table)
            .map(|t| {
                t.iter()
                    .filter_map(|cap| match self.space.object(cap.obj) {
                        Some(KObject::Mapping {
                            virt,
                            phys,
                            pages,
                            perm,
                            ..
                        }) => Some((*virt, *phys, *pages, *perm)),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        for (i, &(virt, phys, pages, perm)) in maps.iter().enumerate() {
            if let Err(e) = self.hal.map_pages(to, id, virt, phys, pages, perm) {
                for &(virt, _, pages, _) in &maps[..i] {
                    let _ = self.hal.unmap_pages(to, id, virt, pages);
                }
                return Err(hal_err(e));
            }
        }
        for &(virt, _, pages, _) in &maps {
            if let Err(e) = self.hal.unmap_pages(from, id, virt, pages) {
                log::warn!(target: "ctx", "ctx {}: unmap {:#x} on tile {} failed: {:?}", id.0, virt, from.0, e);
            }
        }
        Ok(())
    }

    /// Run `id` now if its tile is free, otherwise queue it.
    fn schedule(&mut self, id: CtxId) -> Result<(), KernelError> {
        let tile = self.ctx(id)?.tile;
        let t = self.tiles.get_mut(&tile).ok_or(KernelError::InvalidArgs)?;
        if t.current.is_some() {
            if !t.ready.contains(&id) {
                t.ready.push_back(id);
            }
            log::debug!(target: "ctx", "ctx {} queued on tile {}", id.0, tile.0);
            return Ok(());
        }
        self.restore(id)
    }

    /// Hand a free tile to the first queued context that can be restored.
    fn dispatch(&mut self, tile: TileId) {
        loop {
            let Some(t) = self.tiles.get_mut(&tile) else {
                return;
            };
            if t.current.is_some() {
                return;
            }
            let Some(next) = t.ready.pop_front() else {
                return;
            };
            match self.restore(next) {
                Ok(()) => return,
                Err(e) => {
                    log::warn!(target: "ctx", "ctx {}: restore on tile {} failed: {}", next.0, tile.0, e);
                }
            }
        }
    }

    /// SUSPENDED -> RESUMING -> RUNNING.
    fn restore(&mut self, id: CtxId) -> Result<(), KernelError> {
        let c = self.ctx_mut(id)?;
        c.state = CtxState::Resuming;
        let (tile, entry, saved) = (c.tile, c.entry.unwrap_or(0), *c.eps.all());

        let mut written = 0;
        let mut result = Ok(());
        for (ep, regs) in saved.iter().enumerate() {
            if let Err(e) = self.hal.write_ep(tile, ep, *regs) {
                result = Err(e);
                break;
            }
            written += 1;
        }
        if result.is_ok() {
            result = self.hal.start_tile(tile, entry);
        }

        if let Err(e) = result {
            for ep in 0..written {
                let _ = self.hal.write_ep(tile, ep, EpRegs::INVALID);
            }
            self.ctx_mut(id)?.state = CtxState::Suspended;
            log::warn!(
                target: "ctx",
                "ctx {}: resume on tile {} failed after {} endpoints: {:?}",
                id.0,
                tile.0,
                written,
                e
            );
            return Err(hal_err(e));
        }

        self.ctx_mut(id)?.state = CtxState::Running;
        if let Some(t) = self.tiles.get_mut(&tile) {
            t.current = Some(id);
            t.dequeue(id);
        }
        log::debug!(target: "ctx", "ctx {} running on tile {}", id.0, tile.0);
        Ok(())
    }

    /// RUNNING -> SUSPENDED. Leaves the tile free.
    fn save(&mut self, id: CtxId) -> Result<(), KernelError> {
        let tile = self.ctx(id)?.tile;
        let regs = TileEps::new(&self.hal, tile).read_all()?;
        self.hal.stop_tile(tile).map_err(hal_err)?;
        TileEps::new(&self.hal, tile).clear_all();

        let c = self.ctx_mut(id)?;
        c.eps.load(regs);
        c.state = CtxState::Suspended;
        if let Some(t) = self.tiles.get_mut(&tile) {
            if t.current == Some(id) {
                t.current = None;
            }
        }
        log::debug!(target: "ctx", "ctx {} saved off tile {}", id.0, tile.0);
        Ok(())
    }

    // ========================================================================
    // Stop
    // ========================================================================

    /// Stop a context with `exit_code`. Stopping a DEAD context succeeds
    /// without effect.
    pub fn stop(&mut self, id: CtxId, exit_code: i32) -> Result<(), KernelError> {
        let c = self.ctx(id)?;
        if c.is_dead() {
            return Ok(());
        }
        if c.is_kernel() {
            return Err(KernelError::NotSupported);
        }
        let tile = c.tile;
        let (removed, destroyed) = self.teardown(id, exit_code);
        self.settle(removed, destroyed);
        self.dispatch(tile);
        Ok(())
    }

    /// Mark a context DEAD: off the tile, endpoints gone, tables revoked,
    /// waiters notified. Returns the removed capabilities and released
    /// objects whose effects still have to be applied.
    pub(crate) fn teardown(
        &mut self,
        id: CtxId,
        exit_code: i32,
    ) -> (Vec<Revoked>, Vec<(ObjId, KObject)>) {
        let Some(c) = self.contexts.get(&id) else {
            return (Vec::new(), Vec::new());
        };
        if c.is_dead() {
            return (Vec::new(), Vec::new());
        }
        let (tile, running, obj_table, map_table, bindings) =
            (c.tile, c.regs_on_tile(), c.obj_table, c.map_table, c.bindings);

        if running {
            if let Err(e) = self.hal.stop_tile(tile) {
                log::warn!(target: "ctx", "ctx {}: stop tile {} failed: {:?}", id.0, tile.0, e);
            }
            TileEps::new(&self.hal, tile).clear_all();
        }
        if let Some(t) = self.tiles.get_mut(&tile) {
            if t.current == Some(id) {
                t.current = None;
            }
            t.dequeue(id);
        }
        for (ep, b) in bindings.iter().enumerate() {
            if let Some(b) = b {
                self.unbind_rgate(b.obj, id, ep);
            }
        }

        if let Some(c) = self.contexts.get_mut(&id) {
            c.state = CtxState::Dead;
            c.exit_code = Some(exit_code);
            c.eps.clear();
            c.rings.clear();
            c.bindings = [None; EP_COUNT];
        }

        let mut removed = self.space.revoke_all(obj_table);
        removed.extend(self.space.revoke_all(map_table));

        let mut destroyed = Vec::new();
        for b in self.threads.drop_context(id) {
            for obj in b.holds {
                if let Some(KObject::Context { ctx }) = self.space.object(obj) {
                    let ctx = *ctx;
                    if let Some(c) = self.contexts.get_mut(&ctx) {
                        c.waiters = c.waiters.saturating_sub(1);
                    }
                }
                if let Some(dead) = self.space.release(obj) {
                    destroyed.push((obj, dead));
                }
            }
        }
        self.threads.notify(Event::ContextExit(id));

        log::info!(target: "ctx", "ctx {} stopped, exit code {}", id.0, exit_code);
        (removed, destroyed)
    }

    /// Forget a DEAD context whose object was destroyed.
    pub(crate) fn reap(&mut self, id: CtxId) {
        let Some(c) = self.contexts.remove(&id) else {
            return;
        };
        if let Some(t) = self.tiles.get_mut(&c.tile) {
            t.assigned = t.assigned.saturating_sub(1);
            t.dequeue(id);
        }
        for table in [c.obj_table, c.map_table] {
            if let Err(e) = self.space.remove_table(table) {
                log::warn!(target: "ctx", "ctx {}: table {} not removed: {}", id.0, table.0, e);
            }
        }
        log::debug!(target: "ctx", "ctx {} reaped", id.0);
    }

    // ========================================================================
    // Waiting
    // ========================================================================

    /// Wait for the first of the contexts at `sels` to exit.
    ///
    /// Completes with `(selector, exit code)` if one already has; otherwise
    /// blocks, holding a reference on each context object so it stays
    /// around until the wait runs again.
    pub(crate) fn ctx_wait(&mut self, caller: CtxId, sels: &[CapSel]) -> Result<Outcome, KernelError> {
        if sels.is_empty() {
            return Err(KernelError::InvalidArgs);
        }
        let mut targets = Vec::with_capacity(sels.len());
        for &sel in sels {
            let (ctx, cap) = self.resolve_ctx(caller, sel)?;
            if ctx == caller {
                return Err(KernelError::InvalidArgs);
            }
            let c = self.ctx(ctx)?;
            if let Some(code) = c.exit_code.filter(|_| c.is_dead()) {
                return Ok(Outcome::Done([sel, code as i64 as u64, 0]));
            }
            let obj = self
                .space
                .get(cap)
                .map(|c| c.obj)
                .ok_or(KernelError::CapabilityGone)?;
            targets.push((ctx, obj));
        }

        let mut holds = Vec::with_capacity(targets.len());
        let mut events = Vec::with_capacity(targets.len());
        for (ctx, obj) in targets {
            self.space.acquire(obj)?;
            holds.push(obj);
            events.push(Event::ContextExit(ctx));
            self.ctx_mut(ctx)?.waiters += 1;
        }
        Ok(Outcome::Block { events, holds })
    }
}
