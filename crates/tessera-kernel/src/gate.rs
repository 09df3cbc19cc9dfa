//! Gates: the context-side view of communication capabilities.
//!
//! A gate pairs a capability selector with the endpoint it is activated on.
//! All kernel interaction goes through syscalls of the owning context, so a
//! gate can only do what its context's capabilities allow.
//!
//! ```text
//!   SendGate ──send──▶ RecvGate ──fetch──▶ handler ──reply──▶ reply gate
//!                                                    └─ack──▶ (credit back)
//! ```
//!
//! Gates activate themselves lazily on first use.

use core::task::Poll;

use tessera_hal::HAL;
use tessera_kif::{CapSel, CtxId, EpId, Label, Perm, DEF_REP, INVALID_SEL, SEL_MEM, SYSC_REP};
use tessera_kernel_core::KernelError;

use crate::syscall::Syscall;
use crate::system::{MsgHandler, System};
use crate::tcu::Message;

// ============================================================================
// Receive gates
// ============================================================================

/// A receive ring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecvGate {
    /// Context holding the capability
    ctx: CtxId,
    /// Capability selector, `INVALID_SEL` for the standard reply rings
    sel: CapSel,
    order: u8,
    msg_order: u8,
    buf_addr: u64,
    /// Where the gate is activated: (context, endpoint)
    ep: Option<(CtxId, EpId)>,
}

impl RecvGate {
    /// Create a receive gate of `2^order` bytes in `2^msg_order` byte slots.
    pub fn new<H: HAL>(
        sys: &mut System<H>,
        ctx: CtxId,
        sel: CapSel,
        order: u8,
        msg_order: u8,
    ) -> Result<Self, KernelError> {
        sys.syscall(
            ctx,
            &Syscall::CreateRgate {
                dst: sel,
                order,
                msg_order,
            },
        )?;
        Ok(Self {
            ctx,
            sel,
            order,
            msg_order,
            buf_addr: 0,
            ep: None,
        })
    }

    /// Create a receive gate in `ctx` and activate it on the endpoint
    /// capability `ep_sel`, which may belong to another context.
    pub fn new_for<H: HAL>(
        sys: &mut System<H>,
        ctx: CtxId,
        sel: CapSel,
        ep_sel: CapSel,
        order: u8,
        msg_order: u8,
    ) -> Result<Self, KernelError> {
        let mut gate = Self::new(sys, ctx, sel, order, msg_order)?;
        gate.activate_on(sys, ep_sel)?;
        Ok(gate)
    }

    /// A gate for an endpoint the kernel configured itself.
    pub fn bound(ctx: CtxId, ep: EpId) -> Self {
        Self {
            ctx,
            sel: INVALID_SEL,
            order: 0,
            msg_order: 0,
            buf_addr: 0,
            ep: Some((ctx, ep)),
        }
    }

    /// Default reply gate of `ctx`.
    pub fn def(ctx: CtxId) -> Self {
        Self::bound(ctx, DEF_REP)
    }

    /// Syscall reply gate of `ctx`.
    pub fn syscall(ctx: CtxId) -> Self {
        Self::bound(ctx, SYSC_REP)
    }

    /// Buffer address reported in the endpoint registers.
    pub fn with_buffer(mut self, addr: u64) -> Self {
        self.buf_addr = addr;
        self
    }

    pub fn ctx(&self) -> CtxId {
        self.ctx
    }

    pub fn sel(&self) -> CapSel {
        self.sel
    }

    pub fn order(&self) -> u8 {
        self.order
    }

    pub fn msg_order(&self) -> u8 {
        self.msg_order
    }

    /// Endpoint index, once activated.
    pub fn ep(&self) -> Option<EpId> {
        self.ep.map(|(_, ep)| ep)
    }

    pub(crate) fn endpoint(&self) -> Option<(CtxId, EpId)> {
        self.ep
    }

    /// Activate on a free endpoint of the owning context.
    pub fn activate<H: HAL>(&mut self, sys: &mut System<H>) -> Result<EpId, KernelError> {
        if let Some((_, ep)) = self.ep {
            return Ok(ep);
        }
        let ep = activate(sys, self.ctx, INVALID_SEL, self.sel, self.buf_addr)?;
        self.ep = Some((self.ctx, ep));
        Ok(ep)
    }

    /// Activate on the endpoint capability `ep_sel`.
    pub fn activate_on<H: HAL>(
        &mut self,
        sys: &mut System<H>,
        ep_sel: CapSel,
    ) -> Result<EpId, KernelError> {
        let ep = activate(sys, self.ctx, ep_sel, self.sel, self.buf_addr)?;
        let owner = sys
            .kernel
            .endpoint_owner(self.ctx, ep_sel)
            .unwrap_or(self.ctx);
        self.ep = Some((owner, ep));
        Ok(ep)
    }

    fn active(&self) -> Result<(CtxId, EpId), KernelError> {
        self.ep.ok_or(KernelError::EndpointInvalid)
    }

    /// Oldest unread message, without waiting.
    pub fn fetch<H: HAL>(&self, sys: &mut System<H>) -> Result<Option<Message>, KernelError> {
        let (ctx, ep) = self.active()?;
        sys.kernel.fetch(ctx, ep)
    }

    /// Receive with a checked sleep. If `peer` is given, fails
    /// `EndpointInvalid` once it can no longer deliver.
    pub fn receive<H: HAL>(
        &self,
        sys: &mut System<H>,
        peer: Option<&SendGate>,
    ) -> Result<Poll<Message>, KernelError> {
        let (ctx, ep) = self.active()?;
        let peer = match peer {
            Some(sg) => Some(sg.ep().ok_or(KernelError::EndpointInvalid)?),
            None => None,
        };
        sys.kernel.receive(ctx, ep, peer)
    }

    /// Whether an unread message is waiting.
    pub fn has_msgs<H: HAL>(&self, sys: &mut System<H>) -> Result<bool, KernelError> {
        let (ctx, ep) = self.active()?;
        Ok(sys.kernel.unread(ctx, ep)? > 0)
    }

    /// Reply to `msg`, returning the sender's credit.
    pub fn reply<H: HAL>(
        &self,
        sys: &mut System<H>,
        data: &[u8],
        msg: &Message,
    ) -> Result<(), KernelError> {
        let (ctx, ep) = self.active()?;
        sys.kernel.reply(ctx, ep, data, msg)
    }

    /// Release `msg` without replying.
    pub fn ack<H: HAL>(&self, sys: &mut System<H>, msg: &Message) -> Result<(), KernelError> {
        let (ctx, ep) = self.active()?;
        sys.kernel.ack(ctx, ep, msg)
    }

    /// Serve the gate with `handler` from now on.
    pub fn start<H: HAL>(
        &mut self,
        sys: &mut System<H>,
        handler: MsgHandler<H>,
    ) -> Result<(), KernelError> {
        self.activate(sys)?;
        sys.add_handler(self.clone(), handler);
        Ok(())
    }

    pub fn stop<H: HAL>(&self, sys: &mut System<H>) {
        if let Some((ctx, ep)) = self.ep {
            sys.remove_handler(ctx, ep);
        }
    }
}

// ============================================================================
// Send gates
// ============================================================================

/// Creation parameters of a send gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SGateArgs {
    sel: CapSel,
    label: Label,
    credits: u16,
    reply_ep: EpId,
}

impl SGateArgs {
    /// Defaults: label 0, one credit, replies to the default reply gate.
    pub fn new(sel: CapSel) -> Self {
        Self {
            sel,
            label: 0,
            credits: 1,
            reply_ep: DEF_REP,
        }
    }

    pub fn label(mut self, label: Label) -> Self {
        self.label = label;
        self
    }

    pub fn credits(mut self, credits: u16) -> Self {
        self.credits = credits;
        self
    }

    /// Receive replies on `gate` instead of the default reply gate.
    pub fn reply_gate(mut self, gate: &RecvGate) -> Self {
        if let Some(ep) = gate.ep() {
            self.reply_ep = ep;
        }
        self
    }
}

/// Permission to send to a receive gate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendGate {
    ctx: CtxId,
    sel: CapSel,
    reply_ep: EpId,
    ep: Option<EpId>,
}

impl SendGate {
    /// Create a send gate to `rgate`, which must be a capability of `ctx`.
    pub fn new<H: HAL>(
        sys: &mut System<H>,
        ctx: CtxId,
        rgate: &RecvGate,
        args: SGateArgs,
    ) -> Result<Self, KernelError> {
        sys.syscall(
            ctx,
            &Syscall::CreateSgate {
                dst: args.sel,
                rgate: rgate.sel(),
                label: args.label,
                credits: args.credits,
            },
        )?;
        Ok(Self::bind(ctx, args.sel).with_reply_ep(args.reply_ep))
    }

    /// A send gate for an existing capability (e.g. one obtained by
    /// exchange).
    pub fn bind(ctx: CtxId, sel: CapSel) -> Self {
        Self {
            ctx,
            sel,
            reply_ep: DEF_REP,
            ep: None,
        }
    }

    pub fn with_reply_ep(mut self, ep: EpId) -> Self {
        self.reply_ep = ep;
        self
    }

    pub fn sel(&self) -> CapSel {
        self.sel
    }

    pub fn ep(&self) -> Option<EpId> {
        self.ep
    }

    pub fn activate<H: HAL>(&mut self, sys: &mut System<H>) -> Result<EpId, KernelError> {
        if let Some(ep) = self.ep {
            return Ok(ep);
        }
        let ep = activate(sys, self.ctx, INVALID_SEL, self.sel, 0)?;
        self.ep = Some(ep);
        Ok(ep)
    }

    /// Activate the gate on the endpoint capability `ep_sel` (typically an
    /// endpoint of a child context).
    pub fn activate_for<H: HAL>(
        &self,
        sys: &mut System<H>,
        ep_sel: CapSel,
    ) -> Result<EpId, KernelError> {
        activate(sys, self.ctx, ep_sel, self.sel, 0)
    }

    /// Send `data`; a reply goes to the gate's reply endpoint with
    /// `reply_label`.
    pub fn send<H: HAL>(
        &mut self,
        sys: &mut System<H>,
        data: &[u8],
        reply_label: Label,
    ) -> Result<(), KernelError> {
        let ep = self.activate(sys)?;
        sys.kernel
            .send(self.ctx, ep, data, reply_label, Some(self.reply_ep))
    }

    /// Send `data` and wait for the reply while the system runs.
    ///
    /// `Pending` if no reply arrived once the system went idle.
    pub fn call<H: HAL>(
        &mut self,
        sys: &mut System<H>,
        data: &[u8],
    ) -> Result<Poll<Message>, KernelError> {
        self.send(sys, data, 0)?;
        sys.run();
        let reply = RecvGate::bound(self.ctx, self.reply_ep);
        match reply.receive(sys, Some(&*self))? {
            Poll::Ready(msg) => {
                reply.ack(sys, &msg)?;
                Ok(Poll::Ready(msg))
            }
            Poll::Pending => Ok(Poll::Pending),
        }
    }
}

// ============================================================================
// Memory gates
// ============================================================================

/// Access to a memory region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemGate {
    ctx: CtxId,
    sel: CapSel,
    ep: Option<EpId>,
}

impl MemGate {
    /// The memory capability every context gets at `SEL_MEM` (the root
    /// context's covers the whole memory tile).
    pub fn new_root(ctx: CtxId) -> Self {
        Self::bind(ctx, SEL_MEM)
    }

    pub fn bind(ctx: CtxId, sel: CapSel) -> Self {
        Self { ctx, sel, ep: None }
    }

    pub fn sel(&self) -> CapSel {
        self.sel
    }

    /// Derive a gate for `[offset, offset + size)` with `perm` at `dst`.
    pub fn derive<H: HAL>(
        &self,
        sys: &mut System<H>,
        dst: CapSel,
        offset: u64,
        size: u64,
        perm: Perm,
    ) -> Result<MemGate, KernelError> {
        sys.syscall(
            self.ctx,
            &Syscall::DeriveMgate {
                dst,
                mgate: self.sel,
                offset,
                size,
                perm,
            },
        )?;
        Ok(Self::bind(self.ctx, dst))
    }

    pub fn activate<H: HAL>(&mut self, sys: &mut System<H>) -> Result<EpId, KernelError> {
        if let Some(ep) = self.ep {
            return Ok(ep);
        }
        let ep = activate(sys, self.ctx, INVALID_SEL, self.sel, 0)?;
        self.ep = Some(ep);
        Ok(ep)
    }

    pub fn read<H: HAL>(
        &mut self,
        sys: &mut System<H>,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), KernelError> {
        let ep = self.activate(sys)?;
        sys.kernel.read_mem(self.ctx, ep, offset, buf)
    }

    pub fn write<H: HAL>(
        &mut self,
        sys: &mut System<H>,
        offset: u64,
        data: &[u8],
    ) -> Result<(), KernelError> {
        let ep = self.activate(sys)?;
        sys.kernel.write_mem(self.ctx, ep, offset, data)
    }
}

fn activate<H: HAL>(
    sys: &mut System<H>,
    ctx: CtxId,
    ep_sel: CapSel,
    gate: CapSel,
    rbuf_addr: u64,
) -> Result<EpId, KernelError> {
    let [ep, _, _] = sys.syscall(
        ctx,
        &Syscall::Activate {
            ep_sel,
            gate,
            rbuf_addr,
        },
    )?;
    Ok(ep as EpId)
}
