//! Executing decoded syscalls.
//!
//! A syscall either completes (`Outcome::Done` with up to three reply
//! words), fails (an error code goes back), or blocks (`Outcome::Block`):
//!
//! | Syscall            | Reply words                 | Blocks on            |
//! |--------------------|-----------------------------|----------------------|
//! | `CreateCtx`        | context id, tile            |                      |
//! | `Activate`         | endpoint                    |                      |
//! | `CtxWait`          | selector, exit code         | any target exiting   |
//! | `Revoke`           | capabilities removed        | forwards draining    |
//! | `KmemQuota`        | total, left                 |                      |
//! | `SemCtrl` (`Down`) | value left                  | the semaphore        |
//!
//! Everything else replies with zeros.

use alloc::vec;

use tessera_hal::HAL;
use tessera_kif::{CapSel, CtxId};
use tessera_kernel_core::{CapKind, KObject, KernelError};

use super::Kernel;
use crate::syscall::{CtxOp, SemOp, Syscall};
use crate::thread::{Event, Outcome};

impl<H: HAL> Kernel<H> {
    /// Execute `call` on behalf of `caller`.
    pub fn execute(&mut self, caller: CtxId, call: &Syscall) -> Result<Outcome, KernelError> {
        self.alive(caller)?;
        let done = |a: u64, b: u64| Ok(Outcome::Done([a, b, 0]));

        match *call {
            Syscall::Noop => done(0, 0),
            Syscall::CreateSrv { dst, rgate, label } => {
                self.create_srv(caller, dst, rgate, label)?;
                done(0, 0)
            }
            Syscall::CreateSgate {
                dst,
                rgate,
                label,
                credits,
            } => {
                self.create_sgate(caller, dst, rgate, label, credits)?;
                done(0, 0)
            }
            Syscall::CreateRgate {
                dst,
                order,
                msg_order,
            } => {
                self.create_rgate(caller, dst, order, msg_order)?;
                done(0, 0)
            }
            Syscall::DeriveMgate {
                dst,
                mgate,
                offset,
                size,
                perm,
            } => {
                self.derive_mgate(caller, dst, mgate, offset, size, perm)?;
                done(0, 0)
            }
            Syscall::CreateMap {
                dst_page,
                mgate,
                first_page,
                pages,
                perm,
            } => {
                self.create_map(caller, dst_page, mgate, first_page, pages, perm)?;
                done(0, 0)
            }
            Syscall::CreateCtx { dst, kmem, tile } => {
                let (id, tile) = self.create_context(caller, dst, kmem, tile)?;
                done(id.0 as u64, tile.0 as u64)
            }
            Syscall::CreateSem { dst, value } => {
                self.create_sem(caller, dst, value)?;
                done(0, 0)
            }
            Syscall::DeriveKmem { dst, kmem, quota } => {
                self.derive_kmem(caller, dst, kmem, quota)?;
                done(0, 0)
            }
            Syscall::Activate {
                ep_sel,
                gate,
                rbuf_addr,
            } => {
                let ep = self.activate(caller, ep_sel, gate, rbuf_addr)?;
                done(ep as u64, 0)
            }
            Syscall::CtxCtrl { ctx, op } => {
                let (target, _) = self.resolve_ctx(caller, ctx)?;
                match op {
                    CtxOp::Start { entry } => self.start(target, entry)?,
                    CtxOp::Stop { exit_code } => self.stop(target, exit_code)?,
                    CtxOp::Yield => self.yield_ctx(target)?,
                    CtxOp::Suspend => self.suspend(target)?,
                    CtxOp::Resume => self.resume(target)?,
                    CtxOp::Migrate { tile } => self.migrate(target, tile)?,
                }
                done(0, 0)
            }
            Syscall::CtxWait { ref sels } => self.ctx_wait(caller, sels),
            Syscall::Exchange {
                ctx,
                own,
                other,
                obtain,
            } => {
                self.exchange(caller, ctx, own, other, obtain)?;
                done(0, 0)
            }
            Syscall::Revoke { ctx, crd, own } => {
                let (target, _) = self.resolve_ctx(caller, ctx)?;
                if self.revoke_must_wait(target) {
                    return Ok(Outcome::Block {
                        events: vec![Event::ForwardsDrained(target)],
                        holds: vec![],
                    });
                }
                let n = self.revoke(target, crd, own)?;
                done(n as u64, 0)
            }
            Syscall::KmemQuota { kmem } => {
                let (total, left) = self.kmem_quota(caller, kmem)?;
                done(total as u64, left as u64)
            }
            Syscall::SemCtrl { sem, op } => self.sem_ctrl(caller, sem, op),
        }
    }

    fn sem_ctrl(
        &mut self,
        caller: CtxId,
        sel: CapSel,
        op: SemOp,
    ) -> Result<Outcome, KernelError> {
        let table = self.alive(caller)?.obj_table;
        let obj = self.space.lookup_kind(table, sel, CapKind::Semaphore)?.obj;
        let Some(KObject::Semaphore { value }) = self.space.object_mut(obj) else {
            return Err(KernelError::CapabilityGone);
        };

        match op {
            SemOp::Up => {
                *value = value.checked_add(1).ok_or(KernelError::InvalidArgs)?;
                let left = *value;
                self.threads.notify(Event::Semaphore(obj));
                Ok(Outcome::Done([left as u64, 0, 0]))
            }
            SemOp::Down if *value > 0 => {
                *value -= 1;
                Ok(Outcome::Done([*value as u64, 0, 0]))
            }
            SemOp::Down => {
                self.space.acquire(obj)?;
                Ok(Outcome::Block {
                    events: vec![Event::Semaphore(obj)],
                    holds: vec![obj],
                })
            }
        }
    }
}
