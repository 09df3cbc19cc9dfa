//! Object creation and endpoint activation.
//!
//! Objects are created into the caller's object table (mappings into its
//! mapping table) and paid from that table's kernel memory. Derived objects
//! are placed below the capability they were derived from:
//!
//! ```text
//!   RecvGate ──┬── SendGate        MemoryRegion ──┬── MemoryRegion (derived)
//!              └── Service                         └── Mapping
//!
//!   KernelMemory ── KernelMemory (derived quota)
//! ```
//!
//! so revoking the source destroys everything made from it.

use alloc::sync::Arc;

use tessera_hal::HAL;
use tessera_kif::{
    CapSel, CtxId, EpId, EpRegs, EpShape, Label, MemEp, Perm, RecvEp, SendEp, INVALID_SEL,
    PAGE_SIZE,
};
use tessera_kernel_core::{CapKind, CapRef, KObject, KernelError, KernelMemory, ObjId};

use super::Kernel;
use crate::context::Binding;
use crate::hal_err;
use crate::tcu;
use crate::thread::Event;

impl<H: HAL> Kernel<H> {
    // ========================================================================
    // Gates
    // ========================================================================

    /// Create a receive gate with `2^order` bytes of `2^msg_order` byte slots.
    pub fn create_rgate(
        &mut self,
        ctx: CtxId,
        dst: CapSel,
        order: u8,
        msg_order: u8,
    ) -> Result<CapRef, KernelError> {
        let table = self.alive(ctx)?.obj_table;
        if !RecvEp::orders_valid(order, msg_order) {
            return Err(KernelError::InvalidArgs);
        }
        self.space.create(
            table,
            dst,
            KObject::RecvGate {
                order,
                msg_order,
                bound: None,
            },
        )
    }

    /// Create a send gate to the receive gate at `rgate`.
    ///
    /// `credits` must be at least one and at most the number of slots of the
    /// receive gate.
    pub fn create_sgate(
        &mut self,
        ctx: CtxId,
        dst: CapSel,
        rgate: CapSel,
        label: Label,
        credits: u16,
    ) -> Result<CapRef, KernelError> {
        let table = self.alive(ctx)?.obj_table;
        let cap = self.space.lookup_kind(table, rgate, CapKind::RecvGate)?;
        let (parent, obj) = (cap.cap_ref(), cap.obj);
        let Some(KObject::RecvGate { order, msg_order, .. }) = self.space.object(obj) else {
            return Err(KernelError::CapabilityGone);
        };
        let slots = RecvEp::new(0, *order, *msg_order).slots();
        if credits == 0 || credits as usize > slots {
            return Err(KernelError::InvalidArgs);
        }
        self.space.create_child(
            table,
            dst,
            KObject::SendGate {
                rgate: obj,
                label,
                credits,
            },
            parent,
        )
    }

    /// Register a service on the receive gate at `rgate`.
    pub fn create_srv(
        &mut self,
        ctx: CtxId,
        dst: CapSel,
        rgate: CapSel,
        label: Label,
    ) -> Result<CapRef, KernelError> {
        let table = self.alive(ctx)?.obj_table;
        let cap = self.space.lookup_kind(table, rgate, CapKind::RecvGate)?;
        let (parent, obj) = (cap.cap_ref(), cap.obj);
        self.space
            .create_child(table, dst, KObject::Service { rgate: obj, label }, parent)
    }

    // ========================================================================
    // Memory
    // ========================================================================

    /// Derive a memory gate covering `[offset, offset + size)` of `src` with
    /// at most its permissions.
    pub fn derive_mgate(
        &mut self,
        ctx: CtxId,
        dst: CapSel,
        src: CapSel,
        offset: u64,
        size: u64,
        perm: Perm,
    ) -> Result<CapRef, KernelError> {
        let table = self.alive(ctx)?.obj_table;
        let cap = self.space.lookup_kind(table, src, CapKind::MemoryRegion)?;
        let parent = cap.cap_ref();
        let Some(KObject::MemoryRegion {
            owner,
            base,
            size: src_size,
            perm: src_perm,
        }) = self.space.object(cap.obj).cloned()
        else {
            return Err(KernelError::CapabilityGone);
        };

        let end = offset.checked_add(size).ok_or(KernelError::InvalidArgs)?;
        if size == 0 || end > src_size || !src_perm.contains(perm) {
            return Err(KernelError::InvalidArgs);
        }
        self.space.create_child(
            table,
            dst,
            KObject::MemoryRegion {
                owner,
                base: base + offset,
                size,
                perm,
            },
            parent,
        )
    }

    /// Map `pages` pages of the memory gate `mgate`, starting at page
    /// `first_page` of it, to virtual page `dst_page` of the caller.
    pub fn create_map(
        &mut self,
        ctx: CtxId,
        dst_page: CapSel,
        mgate: CapSel,
        first_page: u64,
        pages: u64,
        perm: Perm,
    ) -> Result<CapRef, KernelError> {
        let c = self.alive(ctx)?;
        let (obj_table, map_table, tile) = (c.obj_table, c.map_table, c.tile);
        if !self.tiles.get(&tile).is_some_and(|t| t.desc.has_virtmem) {
            return Err(KernelError::NotSupported);
        }

        let cap = self.space.lookup_kind(obj_table, mgate, CapKind::MemoryRegion)?;
        let parent = cap.cap_ref();
        let Some(KObject::MemoryRegion {
            base,
            size,
            perm: region_perm,
            ..
        }) = self.space.object(cap.obj).cloned()
        else {
            return Err(KernelError::CapabilityGone);
        };

        let last = first_page
            .checked_add(pages)
            .and_then(|p| p.checked_mul(PAGE_SIZE))
            .ok_or(KernelError::InvalidArgs)?;
        if pages == 0 || last > size || !region_perm.contains(perm) {
            return Err(KernelError::InvalidArgs);
        }
        let virt = dst_page.checked_mul(PAGE_SIZE).ok_or(KernelError::InvalidArgs)?;
        let phys = base + first_page * PAGE_SIZE;

        let r = self.space.create_child(
            map_table,
            dst_page,
            KObject::Mapping {
                ctx,
                virt,
                phys,
                pages,
                perm,
            },
            parent,
        )?;
        if let Err(e) = self.hal.map_pages(tile, ctx, virt, phys, pages, perm) {
            // nothing was mapped, so the capability goes without side effects
            let _ = self.space.revoke(r, true);
            return Err(hal_err(e));
        }
        log::debug!(
            target: "cap",
            "ctx {} maps {} pages at {:#x} -> {:#x}",
            ctx.0,
            pages,
            virt,
            phys
        );
        Ok(r)
    }

    // ========================================================================
    // Semaphores and kernel memory
    // ========================================================================

    pub fn create_sem(&mut self, ctx: CtxId, dst: CapSel, value: u32) -> Result<CapRef, KernelError> {
        let table = self.alive(ctx)?.obj_table;
        self.space.create(table, dst, KObject::Semaphore { value })
    }

    /// Split `quota` bytes off the kernel memory at `src` into a new quota.
    pub fn derive_kmem(
        &mut self,
        ctx: CtxId,
        dst: CapSel,
        src: CapSel,
        quota: usize,
    ) -> Result<CapRef, KernelError> {
        let table = self.alive(ctx)?.obj_table;
        let (parent, kmem) = self.kmem_at(ctx, src)?;
        if quota == 0 {
            return Err(KernelError::InvalidArgs);
        }
        let child = kmem.derive(quota)?;
        let r = self
            .space
            .create_child(table, dst, KObject::KernelMemory(child), parent)?;
        log::debug!(target: "cap", "ctx {} derives {} bytes of kernel memory", ctx.0, quota);
        Ok(r)
    }

    /// `(total, left)` of the kernel memory at `sel`.
    pub fn kmem_quota(&self, ctx: CtxId, sel: CapSel) -> Result<(usize, usize), KernelError> {
        let (_, kmem) = self.kmem_at(ctx, sel)?;
        Ok((kmem.total(), kmem.left()))
    }

    pub(crate) fn kmem_at(
        &self,
        ctx: CtxId,
        sel: CapSel,
    ) -> Result<(CapRef, Arc<KernelMemory>), KernelError> {
        let table = self.alive(ctx)?.obj_table;
        let cap = self.space.lookup_kind(table, sel, CapKind::KernelMemory)?;
        match self.space.object(cap.obj) {
            Some(KObject::KernelMemory(k)) => Ok((cap.cap_ref(), k.clone())),
            _ => Err(KernelError::CapabilityGone),
        }
    }

    // ========================================================================
    // Activation
    // ========================================================================

    /// Configure an endpoint from the gate at `gate`.
    ///
    /// `ep_sel` names an endpoint capability (possibly of another context);
    /// `INVALID_SEL` picks a free endpoint of the caller. A RECEIVE slot that
    /// still holds messages cannot be reconfigured (`Busy`). Returns the
    /// endpoint index.
    pub fn activate(
        &mut self,
        ctx: CtxId,
        ep_sel: CapSel,
        gate: CapSel,
        rbuf_addr: u64,
    ) -> Result<EpId, KernelError> {
        let table = self.alive(ctx)?.obj_table;
        let cap = self.space.lookup(table, gate)?;
        let binding = Binding {
            obj: cap.obj,
            via: cap.cap_ref(),
        };

        if ep_sel == INVALID_SEL {
            let ep = self.ctx_mut(ctx)?.alloc_ep()?;
            return match self.configure(ctx, ep, binding, rbuf_addr) {
                Ok(()) => Ok(ep),
                Err(e) => {
                    self.ctx_mut(ctx)?.free_ep(ep);
                    Err(e)
                }
            };
        }

        let ep_cap = self.space.lookup_kind(table, ep_sel, CapKind::Endpoint)?;
        let Some(KObject::Endpoint { ctx: target, ep }) = self.space.object(ep_cap.obj).cloned()
        else {
            return Err(KernelError::CapabilityGone);
        };
        self.configure(target, ep, binding, rbuf_addr)?;
        Ok(ep)
    }

    fn configure(
        &mut self,
        target: CtxId,
        ep: EpId,
        binding: Binding,
        rbuf_addr: u64,
    ) -> Result<(), KernelError> {
        self.alive(target)?;
        let shape = match self.space.object(binding.obj) {
            Some(KObject::SendGate {
                rgate,
                label,
                credits,
            }) => match self.space.object(*rgate) {
                Some(KObject::RecvGate {
                    msg_order,
                    bound: Some((rctx, rep)),
                    ..
                }) => EpShape::Send(SendEp::new(*rctx, *rep, *label, *msg_order, *credits)),
                _ => return Err(KernelError::EndpointInvalid),
            },
            Some(KObject::RecvGate {
                order,
                msg_order,
                bound,
            }) => {
                if bound.is_some() {
                    return Err(KernelError::InvalidArgs);
                }
                EpShape::Receive(RecvEp::new(rbuf_addr, *order, *msg_order))
            }
            Some(KObject::MemoryRegion {
                owner,
                base,
                size,
                perm,
            }) => EpShape::Memory(MemEp {
                target_ctx: *owner,
                base: *base,
                size: *size,
                perm: *perm,
            }),
            Some(_) => return Err(KernelError::NotSupported),
            None => return Err(KernelError::CapabilityGone),
        };

        if self.with_eps(target, |regs, _| tcu::has_messages(&*regs, ep))? {
            return Err(KernelError::Busy);
        }
        self.with_eps(target, |regs, rings| {
            regs.write_slot(ep, shape.to_regs())?;
            match shape {
                EpShape::Receive(r) => rings.install(ep, r.slots()),
                _ => rings.remove(ep),
            }
            Ok(())
        })?;

        let old = self.ctx(target)?.bindings[ep];
        if let Some(old) = old {
            self.unbind_rgate(old.obj, target, ep);
        }
        if let Some(KObject::RecvGate { bound, .. }) = self.space.object_mut(binding.obj) {
            *bound = Some((target, ep));
        }
        let c = self.ctx_mut(target)?;
        c.bindings[ep] = Some(binding);
        c.mark_ep(ep);

        self.threads.notify(Event::Message { ctx: target, ep });
        log::debug!(
            target: "tcu",
            "ctx {} ep {} configured as {:?}",
            target.0,
            ep,
            shape.ty()
        );
        Ok(())
    }

    /// Invalidate an endpoint slot and forget what configured it.
    ///
    /// Receivers of the context are woken so they notice.
    pub(crate) fn invalidate_ep(&mut self, ctx: CtxId, ep: EpId) {
        let Some(old) = self.contexts.get(&ctx).map(|c| c.bindings[ep]) else {
            return;
        };
        let result = self.with_eps(ctx, |regs, rings| {
            rings.remove(ep);
            regs.write_slot(ep, EpRegs::INVALID)
        });
        if let Err(e) = result {
            log::warn!(target: "tcu", "ctx {} ep {}: invalidate failed: {}", ctx.0, ep, e);
        }
        if let Some(old) = old {
            self.unbind_rgate(old.obj, ctx, ep);
        }
        if let Some(c) = self.contexts.get_mut(&ctx) {
            c.bindings[ep] = None;
            c.free_ep(ep);
        }
        self.threads.notify(Event::Message { ctx, ep });
        self.threads.wake_context(ctx);
        log::debug!(target: "tcu", "ctx {} ep {} invalidated", ctx.0, ep);
    }

    /// Clear the binding of a receive gate if it is bound at `(ctx, ep)`.
    pub(crate) fn unbind_rgate(&mut self, obj: ObjId, ctx: CtxId, ep: EpId) {
        if let Some(KObject::RecvGate { bound, .. }) = self.space.object_mut(obj) {
            if *bound == Some((ctx, ep)) {
                *bound = None;
            }
        }
    }
}
