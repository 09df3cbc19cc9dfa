//! System: the kernel, its syscall ring and the audit trail.
//!
//! Contexts reach the kernel only by message: a syscall is a request sent
//! through the context's `SYSC_SEP` to the kernel's `KSYS_REP`, answered on
//! the context's `SYSC_REP`.
//!
//! ```text
//!   context                         System                        Kernel
//!   ───────                         ──────                        ──────
//!   SYSC_SEP ──request──▶ KSYS_REP ──▶ SysLog (request)
//!                                      decode ───────────────────▶ execute
//!                                                                    │
//!              ┌──────── Done ◀──────────────────────────────────────┤
//!   SYSC_REP ◀─┤         reply, SysLog (response)                    │
//!              │                                                     │
//!              └──────── Block ◀─────────────────────────────────────┘
//!                        park; run again when an event fires
//! ```
//!
//! The caller is identified by the label the kernel put on its syscall
//! endpoint, never by anything in the request.

mod handlers;

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::vec::Vec;
use core::task::Poll;

use tessera_axiom::{EventId, SysLog};
use tessera_hal::HAL;
use tessera_kif::syscall::{bytes_to_words, name, words_to_bytes, REQUEST_WORDS};
use tessera_kif::{CtxId, KERNEL_CTX, KSYS_REP, SYSC_REP, SYSC_SEP};
use tessera_kernel_core::KernelError;

use crate::config::KernelConfig;
use crate::gate::RecvGate;
use crate::kernel::Kernel;
use crate::syscall::{Syscall, SyscallReply};
use crate::tcu::Message;
use crate::thread::{Blocked, Outcome};

pub use handlers::MsgHandler;

/// Upper bound on passes of [`System::run`].
const MAX_RUN_PASSES: usize = 1024;

/// The running system.
pub struct System<H: HAL> {
    /// Syscall audit trail
    pub syslog: SysLog,
    pub kernel: Kernel<H>,
    root: CtxId,
    /// Receive gates served by registered handlers
    handlers: Vec<(RecvGate, MsgHandler<H>)>,
    /// Request event of each parked syscall, by caller
    open: BTreeMap<CtxId, EventId>,
    boot_time: u64,
}

impl<H: HAL> System<H> {
    /// Bring up the kernel and create the root context.
    pub fn boot(hal: H, config: KernelConfig) -> Result<Self, KernelError> {
        let boot_time = hal.now_nanos();
        let mut kernel = Kernel::new(hal, config)?;
        let root = kernel.create_root()?;
        kernel
            .hal()
            .debug_write(&format!("tessera: root context {} ready", root.0));
        Ok(Self {
            syslog: SysLog::new(),
            kernel,
            root,
            handlers: Vec::new(),
            open: BTreeMap::new(),
            boot_time,
        })
    }

    /// The root context.
    pub fn root(&self) -> CtxId {
        self.root
    }

    pub fn hal(&self) -> &H {
        self.kernel.hal()
    }

    pub fn uptime_nanos(&self) -> u64 {
        self.kernel.hal().now_nanos().saturating_sub(self.boot_time)
    }

    // ========================================================================
    // Syscall transport (context side)
    // ========================================================================

    /// Send a syscall request from `ctx` without waiting for the reply.
    pub fn syscall_async(&mut self, ctx: CtxId, call: &Syscall) -> Result<(), KernelError> {
        let words = call.encode()?;
        self.kernel
            .send(ctx, SYSC_SEP, &words_to_bytes(&words), 0, Some(SYSC_REP))
    }

    /// Take the reply to `ctx`'s outstanding syscall, if it has arrived.
    pub fn poll_reply(&mut self, ctx: CtxId) -> Poll<Result<[u64; 3], KernelError>> {
        let msg = match self.kernel.fetch(ctx, SYSC_REP) {
            Ok(Some(msg)) => msg,
            Ok(None) => return Poll::Pending,
            Err(e) => return Poll::Ready(Err(e)),
        };
        if let Err(e) = self.kernel.ack(ctx, SYSC_REP, &msg) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(
            SyscallReply::from_bytes(&msg.data)
                .ok_or(KernelError::InvalidArgs)
                .and_then(SyscallReply::into_result),
        )
    }

    /// Issue a syscall and run the kernel once. `Pending` if the syscall
    /// blocked; its reply can be collected later with [`Self::poll_reply`].
    pub fn call(&mut self, ctx: CtxId, call: &Syscall) -> Poll<Result<[u64; 3], KernelError>> {
        if let Err(e) = self.syscall_async(ctx, call) {
            return Poll::Ready(Err(e));
        }
        self.run();
        self.poll_reply(ctx)
    }

    /// Issue a syscall that must complete now. A syscall that blocked
    /// reports `Busy`.
    pub fn syscall(&mut self, ctx: CtxId, call: &Syscall) -> Result<[u64; 3], KernelError> {
        match self.call(ctx, call) {
            Poll::Ready(result) => result,
            Poll::Pending => Err(KernelError::Busy),
        }
    }

    // ========================================================================
    // Kernel loop
    // ========================================================================

    /// One pass: serve the syscall ring, complete forwarded deliveries, run
    /// woken syscalls, dispatch handler messages. Returns the amount of work
    /// done.
    pub fn run_once(&mut self) -> usize {
        let mut work = 0;

        loop {
            match self.kernel.fetch(KERNEL_CTX, KSYS_REP) {
                Ok(Some(msg)) => {
                    work += 1;
                    self.handle_request(msg);
                }
                Ok(None) => break,
                Err(e) => {
                    log::error!(target: "syscall", "syscall ring unusable: {}", e);
                    break;
                }
            }
        }

        work += self.kernel.complete_forwards();

        while let Some(blocked) = self.kernel.threads.next_ready() {
            work += 1;
            self.rerun(blocked);
        }

        work + self.dispatch_handlers()
    }

    /// Run passes until nothing is left to do.
    pub fn run(&mut self) -> usize {
        let mut total = 0;
        for _ in 0..MAX_RUN_PASSES {
            let work = self.run_once();
            if work == 0 {
                break;
            }
            total += work;
        }
        total
    }

    fn handle_request(&mut self, msg: Message) {
        let caller = CtxId(msg.header.label as u16);
        let ts = self.uptime_nanos();
        let words = bytes_to_words::<REQUEST_WORDS>(&msg.data);
        let (opcode, args) = words
            .map(|w| (w[0], [w[1], w[2], w[3], w[4]]))
            .unwrap_or((u64::MAX, [0; 4]));
        let req_id = self.syslog.log_request(caller, opcode, args, ts);

        let call = match words
            .ok_or(KernelError::InvalidArgs)
            .and_then(|w| Syscall::decode(&w))
        {
            Ok(call) => call,
            Err(e) => {
                log::debug!(target: "syscall", "ctx {}: bad request {:#x}: {}", caller.0, opcode, e);
                self.respond(caller, req_id, &msg, Err(e));
                return;
            }
        };
        log::debug!(target: "syscall", "ctx {} {}", caller.0, name(opcode));

        match self.kernel.execute(caller, &call) {
            Ok(Outcome::Done(words)) => self.respond(caller, req_id, &msg, Ok(words)),
            Err(e) => self.respond(caller, req_id, &msg, Err(e)),
            Ok(Outcome::Block { events, holds }) => {
                match self.kernel.detach(KERNEL_CTX, KSYS_REP, &msg) {
                    Ok(header) => {
                        self.open.insert(caller, req_id);
                        self.kernel.threads.park(Blocked {
                            ctx: caller,
                            header,
                            request: call,
                            events,
                            holds,
                        });
                    }
                    Err(e) => {
                        self.kernel.release_holds(&holds);
                        self.respond(caller, req_id, &msg, Err(e));
                    }
                }
            }
        }
    }

    fn respond(
        &mut self,
        caller: CtxId,
        req_id: EventId,
        msg: &Message,
        result: Result<[u64; 3], KernelError>,
    ) {
        let reply = SyscallReply::from_result(result);
        if let Err(e) = self
            .kernel
            .reply(KERNEL_CTX, KSYS_REP, &reply.to_bytes(), msg)
        {
            log::warn!(target: "syscall", "ctx {}: reply failed: {}", caller.0, e);
            // the request slot must not stay occupied
            if let Err(e) = self.kernel.ack(KERNEL_CTX, KSYS_REP, msg) {
                log::warn!(target: "syscall", "ctx {}: request not released: {}", caller.0, e);
            }
        }
        let ts = self.uptime_nanos();
        self.syslog.log_response(caller, req_id, reply.code, ts);
    }

    /// Execute a woken syscall again; it replies or parks once more.
    fn rerun(&mut self, blocked: Blocked) {
        let Blocked {
            ctx,
            header,
            request,
            holds,
            ..
        } = blocked;
        self.kernel.release_holds(&holds);

        let result = match self.kernel.execute(ctx, &request) {
            Ok(Outcome::Block { events, holds }) => {
                self.kernel.threads.park(Blocked {
                    ctx,
                    header,
                    request,
                    events,
                    holds,
                });
                return;
            }
            Ok(Outcome::Done(words)) => Ok(words),
            Err(e) => Err(e),
        };

        let reply = SyscallReply::from_result(result);
        if let Err(e) = self
            .kernel
            .send_reply(KERNEL_CTX, KSYS_REP, &header, &reply.to_bytes(), true)
        {
            log::warn!(target: "syscall", "ctx {}: late reply failed: {}", ctx.0, e);
        }
        let ts = self.uptime_nanos();
        if let Some(req_id) = self.open.remove(&ctx) {
            self.syslog.log_response(ctx, req_id, reply.code, ts);
        }
    }
}
