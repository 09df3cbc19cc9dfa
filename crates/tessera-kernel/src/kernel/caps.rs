//! Capability exchange and revocation, and the side effects of revocation.
//!
//! `CapSpace` only edits the forest. What a removed capability meant for the
//! running system is applied here:
//!
//! - endpoints activated through a removed capability are invalidated
//! - a destroyed mapping is unmapped from its tile
//! - a destroyed context is stopped (`EXIT_KILLED`) and reaped, which
//!   revokes its tables in turn
//! - waiters on a destroyed semaphore are woken

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use tessera_hal::HAL;
use tessera_kif::{CapRngDesc, CapSel, CapType, CtxId, EpId, EXIT_KILLED, FIRST_FREE_SEL};
use tessera_kernel_core::{KObject, KernelError, ObjId, Revoked};

use super::Kernel;
use crate::context::Binding;
use crate::thread::Event;

impl<H: HAL> Kernel<H> {
    // ========================================================================
    // Exchange
    // ========================================================================

    /// Copy capabilities between the caller and the context at `ctx_sel`.
    ///
    /// With `obtain` the range `other..other + count` of the other context
    /// is cloned into `own`; otherwise `own` is delegated to `other`. Either
    /// all capabilities move or none.
    pub fn exchange(
        &mut self,
        caller: CtxId,
        ctx_sel: CapSel,
        own: CapRngDesc,
        other: CapSel,
        obtain: bool,
    ) -> Result<(), KernelError> {
        let mine = self.alive(caller)?.obj_table;
        let (peer, _) = self.resolve_ctx(caller, ctx_sel)?;
        if peer == caller {
            return Err(KernelError::InvalidArgs);
        }
        let theirs = self.alive(peer)?.obj_table;
        if own.count() == 0 {
            return Err(KernelError::InvalidArgs);
        }
        // mappings only exist together with their page tables
        if own.ty() != CapType::Object {
            return Err(KernelError::NotSupported);
        }

        if obtain {
            self.space
                .obtain_range(mine, own.start(), theirs, other, own.count())?;
        } else {
            self.space
                .obtain_range(theirs, other, mine, own.start(), own.count())?;
        }
        log::debug!(
            target: "cap",
            "ctx {} {} {} caps {} ctx {}",
            caller.0,
            if obtain { "obtains" } else { "delegates" },
            own.count(),
            if obtain { "from" } else { "to" },
            peer.0
        );
        Ok(())
    }

    // ========================================================================
    // Revoke
    // ========================================================================

    /// Revoke a range of `ctx`'s capabilities.
    ///
    /// `own = false` keeps the capabilities and removes only what was
    /// derived from them. The fixed selectors below `FIRST_FREE_SEL` are
    /// protected. Returns how many capabilities were removed.
    pub fn revoke(&mut self, ctx: CtxId, crd: CapRngDesc, own: bool) -> Result<usize, KernelError> {
        let c = self.ctx(ctx)?;
        let table = match crd.ty() {
            CapType::Object => {
                if crd.start() < FIRST_FREE_SEL {
                    return Err(KernelError::InvalidArgs);
                }
                c.obj_table
            }
            CapType::Mapping => c.map_table,
        };
        if crd.count() == 0 {
            return Err(KernelError::InvalidArgs);
        }

        let removed = self
            .space
            .revoke_range(table, crd.start(), crd.count(), own)?;
        let n = removed.len();
        self.settle(removed, Vec::new());
        Ok(n)
    }

    /// Whether revoking on behalf of `ctx` has to wait for deliveries into
    /// its saved state to complete first.
    pub(crate) fn revoke_must_wait(&self, ctx: CtxId) -> bool {
        self.contexts
            .get(&ctx)
            .is_some_and(|c| c.pending_forwards > 0)
    }

    // ========================================================================
    // Side effects
    // ========================================================================

    /// Apply the effects of removed capabilities and destroyed objects until
    /// nothing is left, then reap the contexts that were destroyed.
    pub(crate) fn settle(&mut self, removed: Vec<Revoked>, destroyed: Vec<(ObjId, KObject)>) {
        let mut removed: VecDeque<Revoked> = removed.into();
        let mut destroyed: VecDeque<(ObjId, KObject)> = destroyed.into();
        let mut reap = Vec::new();

        loop {
            if let Some(r) = removed.pop_front() {
                self.invalidate_where(|b| b.via == r.cap);
                if let Some(obj) = r.destroyed {
                    destroyed.push_back((r.obj, obj));
                }
            } else if let Some((id, obj)) = destroyed.pop_front() {
                self.invalidate_where(|b| b.obj == id);
                match obj {
                    KObject::Endpoint { ctx, ep } => self.invalidate_ep(ctx, ep),
                    KObject::Mapping {
                        ctx, virt, pages, ..
                    } => self.unmap(ctx, virt, pages),
                    KObject::Context { ctx } => {
                        let (more_removed, more_destroyed) = self.teardown(ctx, EXIT_KILLED);
                        removed.extend(more_removed);
                        destroyed.extend(more_destroyed);
                        reap.push(ctx);
                    }
                    KObject::Semaphore { .. } => self.threads.notify(Event::Semaphore(id)),
                    _ => {}
                }
            } else {
                break;
            }
        }

        for ctx in reap {
            self.reap(ctx);
        }
    }

    /// Drop kernel references taken by a parked syscall.
    pub(crate) fn release_holds(&mut self, holds: &[ObjId]) {
        let mut destroyed = Vec::new();
        for &obj in holds {
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
        if !destroyed.is_empty() {
            self.settle(Vec::new(), destroyed);
        }
    }

    fn invalidate_where(&mut self, pred: impl Fn(&Binding) -> bool) {
        let mut hits: Vec<(CtxId, EpId)> = Vec::new();
        for c in self.contexts.values() {
            for (ep, b) in c.bindings.iter().enumerate() {
                if b.as_ref().is_some_and(&pred) {
                    hits.push((c.id, ep));
                }
            }
        }
        for (ctx, ep) in hits {
            self.invalidate_ep(ctx, ep);
        }
    }

    fn unmap(&mut self, ctx: CtxId, virt: u64, pages: u64) {
        let Some(tile) = self.contexts.get(&ctx).map(|c| c.tile) else {
            return;
        };
        if let Err(e) = self.hal.unmap_pages(tile, ctx, virt, pages) {
            log::warn!(target: "cap", "ctx {}: unmap {:#x} failed: {:?}", ctx.0, virt, e);
        }
    }
}
