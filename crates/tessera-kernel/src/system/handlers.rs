//! Message handlers attached to receive gates.
//!
//! A started gate is drained on every pass of the kernel loop and each
//! message is handed to its handler, which owns replying or acking.

use tessera_hal::HAL;
use tessera_kif::{CtxId, EpId};

use super::System;
use crate::gate::RecvGate;
use crate::tcu::Message;

/// Called for each message fetched from a started gate.
pub type MsgHandler<H> = fn(&mut System<H>, &RecvGate, Message);

impl<H: HAL> System<H> {
    /// Serve `gate` with `handler`. A gate has at most one handler; starting
    /// it again replaces the handler.
    pub(crate) fn add_handler(&mut self, gate: RecvGate, handler: MsgHandler<H>) {
        self.handlers.retain(|(g, _)| g.endpoint() != gate.endpoint());
        self.handlers.push((gate, handler));
    }

    /// Stop serving the gate at `(ctx, ep)`.
    pub(crate) fn remove_handler(&mut self, ctx: CtxId, ep: EpId) {
        self.handlers.retain(|(g, _)| g.endpoint() != Some((ctx, ep)));
    }

    pub(super) fn dispatch_handlers(&mut self) -> usize {
        let mut handled = 0;
        let handlers = self.handlers.clone();
        for (gate, handler) in handlers {
            let Some((ctx, ep)) = gate.endpoint() else {
                continue;
            };
            loop {
                match self.kernel.fetch(ctx, ep) {
                    Ok(Some(msg)) => {
                        handled += 1;
                        handler(self, &gate, msg);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::debug!(target: "tcu", "handler gate ctx {} ep {} dropped: {}", ctx.0, ep, e);
                        self.remove_handler(ctx, ep);
                        break;
                    }
                }
            }
        }
        handled
    }
}
