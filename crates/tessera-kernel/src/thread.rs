//! Waiting inside the kernel.
//!
//! Two kinds of waiters:
//!
//! - **Blocked syscalls** (`CTX_WAIT`, a semaphore `DOWN` at zero, a
//!   `REVOKE` that must wait for in-flight deliveries). The request is
//!   parked with the events that can complete it and executed again when one
//!   of them fires. Its reply is sent only then.
//! - **Sleeping receivers**: a context that found its ring empty. Sleep is
//!   registered before the final emptiness check, so a message delivered in
//!   between always produces a wakeup.

use alloc::collections::{BTreeSet, VecDeque};
use alloc::vec::Vec;

use tessera_kif::{CtxId, EpId, Header};
use tessera_kernel_core::ObjId;

use crate::syscall::Syscall;

/// Something a waiter can wait for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Event {
    /// A message arrived at, or the configuration changed of, an endpoint
    Message { ctx: CtxId, ep: EpId },
    /// A context stopped
    ContextExit(CtxId),
    /// All deliveries into a context's saved state have completed
    ForwardsDrained(CtxId),
    /// A semaphore was raised or destroyed
    Semaphore(ObjId),
}

/// Result of executing a syscall.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Completed with reply words
    Done([u64; 3]),
    /// Must wait for one of `events`; `holds` are kernel references to
    /// release before it runs again
    Block { events: Vec<Event>, holds: Vec<ObjId> },
}

/// A parked syscall.
#[derive(Clone, Debug)]
pub struct Blocked {
    pub ctx: CtxId,
    /// Header of the request, addressing the reply
    pub header: Header,
    pub request: Syscall,
    pub events: Vec<Event>,
    pub holds: Vec<ObjId>,
}

/// Parked syscalls and sleeping receivers.
#[derive(Debug, Default)]
pub struct ThreadManager {
    blocked: Vec<Blocked>,
    ready: VecDeque<Blocked>,
    sleepers: BTreeSet<(CtxId, EpId)>,
    woken: BTreeSet<(CtxId, EpId)>,
}

impl ThreadManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn park(&mut self, blocked: Blocked) {
        log::debug!(
            target: "ctx",
            "ctx {} blocks in {:?} on {:?}",
            blocked.ctx.0,
            blocked.request,
            blocked.events
        );
        self.blocked.push(blocked);
    }

    /// Fire an event: parked syscalls waiting for it become ready (in park
    /// order), a receiver sleeping on the endpoint is woken.
    pub fn notify(&mut self, event: Event) {
        let mut i = 0;
        while i < self.blocked.len() {
            if self.blocked[i].events.contains(&event) {
                let b = self.blocked.remove(i);
                self.ready.push_back(b);
            } else {
                i += 1;
            }
        }
        if let Event::Message { ctx, ep } = event {
            if self.sleepers.remove(&(ctx, ep)) {
                self.woken.insert((ctx, ep));
            }
        }
    }

    /// Wake every receiver of `ctx` (its endpoint configuration changed).
    pub fn wake_context(&mut self, ctx: CtxId) {
        let hits: Vec<_> = self.sleepers.iter().filter(|(c, _)| *c == ctx).copied().collect();
        for key in hits {
            self.sleepers.remove(&key);
            self.woken.insert(key);
        }
    }

    pub fn next_ready(&mut self) -> Option<Blocked> {
        self.ready.pop_front()
    }

    /// Register the intent to sleep on `(ctx, ep)`.
    pub fn sleep(&mut self, ctx: CtxId, ep: EpId) {
        self.woken.remove(&(ctx, ep));
        self.sleepers.insert((ctx, ep));
    }

    pub fn cancel_sleep(&mut self, ctx: CtxId, ep: EpId) {
        self.sleepers.remove(&(ctx, ep));
    }

    pub fn is_sleeping(&self, ctx: CtxId, ep: EpId) -> bool {
        self.sleepers.contains(&(ctx, ep))
    }

    /// Consume a pending wakeup.
    pub fn take_wakeup(&mut self, ctx: CtxId, ep: EpId) -> bool {
        self.woken.remove(&(ctx, ep))
    }

    /// Forget everything of a stopped context. Returns its parked syscalls
    /// so their references can be released.
    pub fn drop_context(&mut self, ctx: CtxId) -> Vec<Blocked> {
        self.sleepers.retain(|(c, _)| *c != ctx);
        self.woken.retain(|(c, _)| *c != ctx);
        let mut dropped = Vec::new();
        let mut i = 0;
        while i < self.blocked.len() {
            if self.blocked[i].ctx == ctx {
                dropped.push(self.blocked.remove(i));
            } else {
                i += 1;
            }
        }
        let (mine, others): (Vec<_>, Vec<_>) = self.ready.drain(..).partition(|b| b.ctx == ctx);
        self.ready = others.into();
        dropped.extend(mine);
        dropped
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked.len() + self.ready.len()
    }

    pub fn is_blocked(&self, ctx: CtxId) -> bool {
        self.blocked.iter().chain(self.ready.iter()).any(|b| b.ctx == ctx)
    }
}
