//! Message passing and memory access on behalf of a context.
//!
//! These are the operations a context's communication unit performs. They
//! run against the context's live registers (tile or saved) through
//! `with_eps`, so the protocol is the same on and off the tile.

use core::task::Poll;

use tessera_hal::HAL;
use tessera_kif::{CapSel, CtxId, EpId, EpShape, Header, HeaderFlags, Label, Perm, TileId, KERNEL_CTX};
use tessera_kernel_core::{CapKind, KObject, KernelError};

use super::Kernel;
use crate::hal_err;
use crate::tcu::{self, Message};
use crate::thread::Event;

impl<H: HAL> Kernel<H> {
    // ========================================================================
    // Send side
    // ========================================================================

    /// Send `data` through SEND endpoint `ep` of `ctx`.
    ///
    /// Takes one credit. If the message cannot be delivered the credit is
    /// given back and nothing else changes.
    pub fn send(
        &mut self,
        ctx: CtxId,
        ep: EpId,
        data: &[u8],
        reply_label: Label,
        reply_ep: Option<EpId>,
    ) -> Result<(), KernelError> {
        let sender_tile = self.alive(ctx)?.tile;
        if let Some(rep) = reply_ep {
            if !matches!(self.ep_shape(ctx, rep)?, EpShape::Receive(_)) {
                return Err(KernelError::EndpointInvalid);
            }
        }

        let length = u16::try_from(data.len()).map_err(|_| KernelError::InvalidArgs)?;
        let sep = self.with_eps(ctx, |regs, _| tcu::take_credit(regs, ep, data.len()))?;
        let header = Header {
            flags: HeaderFlags::empty(),
            sender_tile,
            sender_ep: ep,
            reply_ep,
            length,
            sender_ctx: ctx,
            label: sep.label,
            reply_label,
        };

        if let Err(e) = self.deliver(sep.target_ctx, sep.target_ep, header, data) {
            let target = (sep.target_ctx, sep.target_ep);
            if let Err(undo) = self.with_eps(ctx, |regs, _| tcu::return_credit(regs, ep, target)) {
                log::warn!(target: "tcu", "ctx {} ep {}: credit restore failed: {}", ctx.0, ep, undo);
            }
            return Err(e);
        }

        log::debug!(
            target: "tcu",
            "ctx {} ep {} -> ctx {} ep {}: {} bytes, {} credits left",
            ctx.0,
            ep,
            sep.target_ctx.0,
            sep.target_ep,
            data.len(),
            sep.credits - 1
        );
        Ok(())
    }

    /// Write a message into a receive ring, retrying a bounded number of
    /// times while the slot is busy.
    pub(crate) fn deliver(
        &mut self,
        target: CtxId,
        ep: EpId,
        header: Header,
        data: &[u8],
    ) -> Result<(), KernelError> {
        if self.contexts.get(&target).map_or(true, |c| c.is_dead()) {
            return Err(KernelError::EndpointInvalid);
        }

        let mut tries = 0;
        loop {
            match self.with_eps(target, |regs, rings| tcu::deliver(regs, rings, ep, header, data)) {
                Err(KernelError::Busy) if tries < self.config.busy_retries => tries += 1,
                result => break result?,
            }
        }

        if let Some(c) = self.contexts.get_mut(&target) {
            if !c.regs_on_tile() && !c.is_kernel() {
                c.pending_forwards += 1;
                self.forwards.push_back(target);
            }
        }
        self.threads.notify(Event::Message { ctx: target, ep });
        Ok(())
    }

    /// Account for all forwarded deliveries. Returns how many completed.
    pub fn complete_forwards(&mut self) -> usize {
        let mut done = 0;
        while let Some(ctx) = self.forwards.pop_front() {
            done += 1;
            if let Some(c) = self.contexts.get_mut(&ctx) {
                c.pending_forwards = c.pending_forwards.saturating_sub(1);
                if c.pending_forwards == 0 {
                    self.threads.notify(Event::ForwardsDrained(ctx));
                }
            }
        }
        done
    }

    // ========================================================================
    // Receive side
    // ========================================================================

    /// Oldest unread message of `ep`, without blocking.
    pub fn fetch(&mut self, ctx: CtxId, ep: EpId) -> Result<Option<Message>, KernelError> {
        self.alive(ctx)?;
        let msg = self.with_eps(ctx, |regs, rings| tcu::fetch(regs, rings, ep))?;
        if msg.is_some() {
            self.threads.cancel_sleep(ctx, ep);
        }
        Ok(msg)
    }

    /// Receive with a checked sleep.
    ///
    /// Returns `Pending` after registering `ctx` as sleeping on `ep`; the
    /// registration happens before the final check of the ring, so a message
    /// that arrives at any point afterwards produces a wakeup. If `peer` is
    /// given and is no longer a valid SEND endpoint, fails `EndpointInvalid`.
    pub fn receive(
        &mut self,
        ctx: CtxId,
        ep: EpId,
        peer: Option<EpId>,
    ) -> Result<Poll<Message>, KernelError> {
        if let Some(msg) = self.fetch(ctx, ep)? {
            return Ok(Poll::Ready(msg));
        }
        if let Some(peer) = peer {
            if let Err(e) = self.check_peer(ctx, peer) {
                self.threads.cancel_sleep(ctx, ep);
                return Err(e);
            }
        }

        self.threads.sleep(ctx, ep);
        match self.fetch(ctx, ep)? {
            Some(msg) => Ok(Poll::Ready(msg)),
            None => Ok(Poll::Pending),
        }
    }

    /// Number of unread messages of RECEIVE endpoint `ep`.
    pub fn unread(&mut self, ctx: CtxId, ep: EpId) -> Result<u16, KernelError> {
        self.alive(ctx)?;
        self.with_eps(ctx, |regs, _| tcu::unread(&*regs, ep))
    }

    /// Context owning the endpoint named by `caller`'s capability `ep_sel`.
    pub fn endpoint_owner(&self, caller: CtxId, ep_sel: CapSel) -> Option<CtxId> {
        let table = self.ctx(caller).ok()?.obj_table;
        let cap = self
            .space
            .lookup_kind(table, ep_sel, CapKind::Endpoint)
            .ok()?;
        match self.space.object(cap.obj) {
            Some(KObject::Endpoint { ctx, .. }) => Some(*ctx),
            _ => None,
        }
    }

    fn check_peer(&mut self, ctx: CtxId, peer: EpId) -> Result<(), KernelError> {
        match self.ep_shape(ctx, peer)? {
            EpShape::Send(s) if self.contexts.get(&s.target_ctx).is_some_and(|c| !c.is_dead()) => {
                Ok(())
            }
            _ => Err(KernelError::EndpointInvalid),
        }
    }

    /// Reply to `msg` and release its slot. Returns one credit to the sender.
    pub fn reply(
        &mut self,
        ctx: CtxId,
        ep: EpId,
        data: &[u8],
        msg: &Message,
    ) -> Result<(), KernelError> {
        self.finish(ctx, ep, msg, Some(data), true)
    }

    /// Reply to `msg` without returning the sender's credit.
    pub fn reply_keep_credit(
        &mut self,
        ctx: CtxId,
        ep: EpId,
        data: &[u8],
        msg: &Message,
    ) -> Result<(), KernelError> {
        self.finish(ctx, ep, msg, Some(data), false)
    }

    /// Release the slot of `msg` without replying; the sender gets its
    /// credit back.
    ///
    /// `reply` already acknowledges, so acking a replied (or acked) message
    /// fails with `InvalidArgs`.
    pub fn ack(&mut self, ctx: CtxId, ep: EpId, msg: &Message) -> Result<(), KernelError> {
        self.finish(ctx, ep, msg, None, true)
    }

    fn finish(
        &mut self,
        ctx: CtxId,
        ep: EpId,
        msg: &Message,
        reply: Option<&[u8]>,
        grant: bool,
    ) -> Result<(), KernelError> {
        self.alive(ctx)?;
        if msg.pos.ep != ep {
            return Err(KernelError::InvalidArgs);
        }
        let header = self.with_eps(ctx, |regs, rings| tcu::check_held(regs, rings, msg.pos))?;

        match reply {
            Some(data) => {
                if header.is_reply() {
                    return Err(KernelError::InvalidArgs);
                }
                self.send_reply(ctx, ep, &header, data, grant)?;
            }
            None if grant && !header.is_reply() => {
                self.return_credit_to(ctx, ep, &header);
            }
            None => {}
        }

        self.with_eps(ctx, |regs, rings| tcu::release(regs, rings, msg.pos))?;
        Ok(())
    }

    /// Release a message slot and hand back its header, leaving the reply
    /// owed (a syscall that blocks).
    pub(crate) fn detach(&mut self, ctx: CtxId, ep: EpId, msg: &Message) -> Result<Header, KernelError> {
        if msg.pos.ep != ep {
            return Err(KernelError::InvalidArgs);
        }
        self.with_eps(ctx, |regs, rings| tcu::release(regs, rings, msg.pos))
    }

    /// Deliver a reply addressed by `orig` and return the sender's credit.
    ///
    /// A reply whose target endpoint is gone is dropped.
    pub(crate) fn send_reply(
        &mut self,
        ctx: CtxId,
        ep: EpId,
        orig: &Header,
        data: &[u8],
        grant: bool,
    ) -> Result<(), KernelError> {
        let sender_tile = self.ctx(ctx)?.tile;
        let length = u16::try_from(data.len()).map_err(|_| KernelError::InvalidArgs)?;

        if let Some(reply_ep) = orig.reply_ep {
            let mut flags = HeaderFlags::REPLY;
            if grant {
                flags |= HeaderFlags::GRANT_CREDITS;
            }
            let header = Header {
                flags,
                sender_tile,
                sender_ep: ep,
                reply_ep: None,
                length,
                sender_ctx: ctx,
                label: orig.reply_label,
                reply_label: 0,
            };
            match self.deliver(orig.sender_ctx, reply_ep, header, data) {
                Ok(()) => {}
                Err(KernelError::EndpointInvalid) => {
                    log::debug!(
                        target: "tcu",
                        "reply to ctx {} ep {} dropped: endpoint gone",
                        orig.sender_ctx.0,
                        reply_ep
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if grant {
            self.return_credit_to(ctx, ep, orig);
        }
        Ok(())
    }

    /// Give the original sender of a message received on `(ctx, ep)` its
    /// credit back. Returns whether a credit was added.
    fn return_credit_to(&mut self, ctx: CtxId, ep: EpId, orig: &Header) -> bool {
        let sender = orig.sender_ctx;
        if self.contexts.get(&sender).map_or(true, |c| c.is_dead()) {
            return false;
        }
        match self.with_eps(sender, |regs, _| tcu::return_credit(regs, orig.sender_ep, (ctx, ep))) {
            Ok(added) => added,
            Err(e) => {
                log::debug!(
                    target: "tcu",
                    "credit for ctx {} ep {} dropped: {}",
                    sender.0,
                    orig.sender_ep,
                    e
                );
                false
            }
        }
    }

    // ========================================================================
    // Memory endpoints
    // ========================================================================

    /// Read `buf.len()` bytes at `offset` through MEMORY endpoint `ep`.
    pub fn read_mem(
        &mut self,
        ctx: CtxId,
        ep: EpId,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), KernelError> {
        let (tile, addr) = self.mem_access(ctx, ep, offset, buf.len(), Perm::R)?;
        self.hal.read_mem(tile, addr, buf).map_err(hal_err)
    }

    /// Write `data` at `offset` through MEMORY endpoint `ep`.
    pub fn write_mem(
        &mut self,
        ctx: CtxId,
        ep: EpId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), KernelError> {
        let (tile, addr) = self.mem_access(ctx, ep, offset, data.len(), Perm::W)?;
        self.hal.write_mem(tile, addr, data).map_err(hal_err)
    }

    fn mem_access(
        &mut self,
        ctx: CtxId,
        ep: EpId,
        offset: u64,
        len: usize,
        need: Perm,
    ) -> Result<(TileId, u64), KernelError> {
        self.alive(ctx)?;
        let EpShape::Memory(m) = self.ep_shape(ctx, ep)? else {
            return Err(KernelError::EndpointInvalid);
        };
        if !m.perm.contains(need) {
            return Err(KernelError::NotSupported);
        }
        let end = offset
            .checked_add(len as u64)
            .ok_or(KernelError::InvalidArgs)?;
        if end > m.size {
            return Err(KernelError::InvalidArgs);
        }
        if m.target_ctx != KERNEL_CTX {
            return Err(KernelError::NotSupported);
        }
        let tile = self.mem_tile.ok_or(KernelError::NotSupported)?;
        Ok((tile, m.base + offset))
    }
}
