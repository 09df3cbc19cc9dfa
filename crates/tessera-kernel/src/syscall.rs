//! Syscall definitions and types
//!
//! This module contains:
//! - The `Syscall` enum for type-safe dispatch, decoded from request words
//! - Control and semaphore sub-operations
//! - The reply format
//!
//! Opcodes and operand layouts live in `tessera_kif::syscall`.

use alloc::vec::Vec;

use tessera_kif::syscall::*;
use tessera_kif::{CapRngDesc, CapSel, Label, Perm, TileId, AUTO_TILE};
use tessera_kernel_core::KernelError;

/// Syscall request from a context
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Syscall {
    /// Round trip through the kernel (SYS_NOOP 0x00)
    Noop,
    /// Create a service on a receive gate (SYS_CREATE_SRV 0x01)
    CreateSrv {
        dst: CapSel,
        rgate: CapSel,
        label: Label,
    },
    /// Create a send gate for a receive gate (SYS_CREATE_SGATE 0x02)
    CreateSgate {
        dst: CapSel,
        rgate: CapSel,
        label: Label,
        credits: u16,
    },
    /// Create a receive gate (SYS_CREATE_RGATE 0x03)
    CreateRgate { dst: CapSel, order: u8, msg_order: u8 },
    /// Derive a memory gate from a part of another (SYS_DERIVE_MGATE 0x04)
    DeriveMgate {
        dst: CapSel,
        mgate: CapSel,
        offset: u64,
        size: u64,
        perm: Perm,
    },
    /// Map pages of a memory gate into the caller (SYS_CREATE_MAP 0x05)
    CreateMap {
        dst_page: CapSel,
        mgate: CapSel,
        first_page: u64,
        pages: u64,
        perm: Perm,
    },
    /// Create a context paying with a kernel memory cap (SYS_CREATE_CTX 0x06)
    CreateCtx {
        dst: CapSel,
        kmem: CapSel,
        tile: Option<TileId>,
    },
    /// Create a semaphore (SYS_CREATE_SEM 0x07)
    CreateSem { dst: CapSel, value: u32 },
    /// Split off a kernel memory quota (SYS_DERIVE_KMEM 0x08)
    DeriveKmem {
        dst: CapSel,
        kmem: CapSel,
        quota: usize,
    },
    /// Configure an endpoint from a gate (SYS_ACTIVATE 0x10)
    Activate {
        ep_sel: CapSel,
        gate: CapSel,
        rbuf_addr: u64,
    },
    /// Control a context (SYS_CTX_CTRL 0x20)
    CtxCtrl { ctx: CapSel, op: CtxOp },
    /// Wait for the first of up to four contexts to exit (SYS_CTX_WAIT 0x21)
    CtxWait { sels: Vec<CapSel> },
    /// Exchange a capability range with another context (SYS_EXCHANGE 0x30)
    Exchange {
        ctx: CapSel,
        own: CapRngDesc,
        other: CapSel,
        obtain: bool,
    },
    /// Revoke a capability range (SYS_REVOKE 0x31)
    Revoke {
        ctx: CapSel,
        crd: CapRngDesc,
        own: bool,
    },
    /// Query a kernel memory quota (SYS_KMEM_QUOTA 0x40)
    KmemQuota { kmem: CapSel },
    /// Semaphore up/down (SYS_SEM_CTRL 0x41)
    SemCtrl { sem: CapSel, op: SemOp },
}

/// Context control operations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CtxOp {
    Start { entry: u64 },
    Stop { exit_code: i32 },
    Yield,
    Suspend,
    Resume,
    Migrate { tile: TileId },
}

/// Semaphore operations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SemOp {
    Up,
    Down,
}

/// Maximum number of contexts one `CtxWait` can name
pub const MAX_WAIT_SELS: usize = REQUEST_WORDS - 2;

fn order(word: u64) -> Result<u8, KernelError> {
    u8::try_from(word).map_err(|_| KernelError::InvalidArgs)
}

fn perm(word: u64) -> Result<Perm, KernelError> {
    u8::try_from(word)
        .ok()
        .and_then(Perm::from_bits)
        .ok_or(KernelError::InvalidArgs)
}

fn tile(word: u64) -> Result<Option<TileId>, KernelError> {
    if word == AUTO_TILE {
        return Ok(None);
    }
    u8::try_from(word)
        .map(|t| Some(TileId(t)))
        .map_err(|_| KernelError::InvalidArgs)
}

impl Syscall {
    /// Decode request words. Unknown opcodes are `NotSupported`, malformed
    /// operands `InvalidArgs`.
    pub fn decode(words: &[u64; REQUEST_WORDS]) -> Result<Self, KernelError> {
        let [op, a, b, c, d, e] = *words;
        Ok(match op {
            SYS_NOOP => Syscall::Noop,
            SYS_CREATE_SRV => Syscall::CreateSrv {
                dst: a,
                rgate: b,
                label: c,
            },
            SYS_CREATE_SGATE => Syscall::CreateSgate {
                dst: a,
                rgate: b,
                label: c,
                credits: u16::try_from(d).map_err(|_| KernelError::InvalidArgs)?,
            },
            SYS_CREATE_RGATE => Syscall::CreateRgate {
                dst: a,
                order: order(b)?,
                msg_order: order(c)?,
            },
            SYS_DERIVE_MGATE => Syscall::DeriveMgate {
                dst: a,
                mgate: b,
                offset: c,
                size: d,
                perm: perm(e)?,
            },
            SYS_CREATE_MAP => Syscall::CreateMap {
                dst_page: a,
                mgate: b,
                first_page: c,
                pages: d,
                perm: perm(e)?,
            },
            SYS_CREATE_CTX => Syscall::CreateCtx {
                dst: a,
                kmem: b,
                tile: tile(c)?,
            },
            SYS_CREATE_SEM => Syscall::CreateSem {
                dst: a,
                value: u32::try_from(b).map_err(|_| KernelError::InvalidArgs)?,
            },
            SYS_DERIVE_KMEM => Syscall::DeriveKmem {
                dst: a,
                kmem: b,
                quota: usize::try_from(c).map_err(|_| KernelError::InvalidArgs)?,
            },
            SYS_ACTIVATE => Syscall::Activate {
                ep_sel: a,
                gate: b,
                rbuf_addr: c,
            },
            SYS_CTX_CTRL => Syscall::CtxCtrl {
                ctx: a,
                op: match b {
                    ctrl::START => CtxOp::Start { entry: c },
                    // exit codes travel sign-extended
                    ctrl::STOP => CtxOp::Stop {
                        exit_code: c as i64 as i32,
                    },
                    ctrl::YIELD => CtxOp::Yield,
                    ctrl::SUSPEND => CtxOp::Suspend,
                    ctrl::RESUME => CtxOp::Resume,
                    ctrl::MIGRATE => CtxOp::Migrate {
                        tile: tile(c)?.ok_or(KernelError::InvalidArgs)?,
                    },
                    _ => return Err(KernelError::InvalidArgs),
                },
            },
            SYS_CTX_WAIT => {
                let count = a as usize;
                if count == 0 || count > MAX_WAIT_SELS {
                    return Err(KernelError::InvalidArgs);
                }
                Syscall::CtxWait {
                    sels: [b, c, d, e][..count].to_vec(),
                }
            }
            SYS_EXCHANGE => Syscall::Exchange {
                ctx: a,
                own: CapRngDesc::from_raw(b),
                other: c,
                obtain: d != 0,
            },
            SYS_REVOKE => Syscall::Revoke {
                ctx: a,
                crd: CapRngDesc::from_raw(b),
                own: c != 0,
            },
            SYS_KMEM_QUOTA => Syscall::KmemQuota { kmem: a },
            SYS_SEM_CTRL => Syscall::SemCtrl {
                sem: a,
                op: match b {
                    sem::UP => SemOp::Up,
                    sem::DOWN => SemOp::Down,
                    _ => return Err(KernelError::InvalidArgs),
                },
            },
            _ => return Err(KernelError::NotSupported),
        })
    }

    /// Encode into request words.
    pub fn encode(&self) -> Result<[u64; REQUEST_WORDS], KernelError> {
        let crd = |c: &CapRngDesc| c.to_raw().ok_or(KernelError::InvalidArgs);
        let words = match self {
            Syscall::Noop => [SYS_NOOP, 0, 0, 0, 0, 0],
            Syscall::CreateSrv { dst, rgate, label } => [SYS_CREATE_SRV, *dst, *rgate, *label, 0, 0],
            Syscall::CreateSgate {
                dst,
                rgate,
                label,
                credits,
            } => [SYS_CREATE_SGATE, *dst, *rgate, *label, *credits as u64, 0],
            Syscall::CreateRgate {
                dst,
                order,
                msg_order,
            } => [SYS_CREATE_RGATE, *dst, *order as u64, *msg_order as u64, 0, 0],
            Syscall::DeriveMgate {
                dst,
                mgate,
                offset,
                size,
                perm,
            } => [SYS_DERIVE_MGATE, *dst, *mgate, *offset, *size, perm.bits() as u64],
            Syscall::CreateMap {
                dst_page,
                mgate,
                first_page,
                pages,
                perm,
            } => [
                SYS_CREATE_MAP,
                *dst_page,
                *mgate,
                *first_page,
                *pages,
                perm.bits() as u64,
            ],
            Syscall::CreateCtx { dst, kmem, tile } => [
                SYS_CREATE_CTX,
                *dst,
                *kmem,
                tile.map_or(AUTO_TILE, |t| t.0 as u64),
                0,
                0,
            ],
            Syscall::CreateSem { dst, value } => [SYS_CREATE_SEM, *dst, *value as u64, 0, 0, 0],
            Syscall::DeriveKmem { dst, kmem, quota } => {
                [SYS_DERIVE_KMEM, *dst, *kmem, *quota as u64, 0, 0]
            }
            Syscall::Activate {
                ep_sel,
                gate,
                rbuf_addr,
            } => [SYS_ACTIVATE, *ep_sel, *gate, *rbuf_addr, 0, 0],
            Syscall::CtxCtrl { ctx, op } => {
                let (op, arg) = match op {
                    CtxOp::Start { entry } => (ctrl::START, *entry),
                    CtxOp::Stop { exit_code } => (ctrl::STOP, *exit_code as i64 as u64),
                    CtxOp::Yield => (ctrl::YIELD, 0),
                    CtxOp::Suspend => (ctrl::SUSPEND, 0),
                    CtxOp::Resume => (ctrl::RESUME, 0),
                    CtxOp::Migrate { tile } => (ctrl::MIGRATE, tile.0 as u64),
                };
                [SYS_CTX_CTRL, *ctx, op, arg, 0, 0]
            }
            Syscall::CtxWait { sels } => {
                if sels.is_empty() || sels.len() > MAX_WAIT_SELS {
                    return Err(KernelError::InvalidArgs);
                }
                let mut w = [SYS_CTX_WAIT, sels.len() as u64, 0, 0, 0, 0];
                w[2..2 + sels.len()].copy_from_slice(sels);
                w
            }
            Syscall::Exchange {
                ctx,
                own,
                other,
                obtain,
            } => [SYS_EXCHANGE, *ctx, crd(own)?, *other, *obtain as u64, 0],
            Syscall::Revoke { ctx, crd: c, own } => [SYS_REVOKE, *ctx, crd(c)?, *own as u64, 0, 0],
            Syscall::KmemQuota { kmem } => [SYS_KMEM_QUOTA, *kmem, 0, 0, 0, 0],
            Syscall::SemCtrl { sem, op } => {
                let op = match op {
                    SemOp::Up => sem::UP,
                    SemOp::Down => sem::DOWN,
                };
                [SYS_SEM_CTRL, *sem, op, 0, 0, 0]
            }
        };
        Ok(words)
    }

    /// Opcode of this request.
    pub fn opcode(&self) -> u64 {
        match self {
            Syscall::Noop => SYS_NOOP,
            Syscall::CreateSrv { .. } => SYS_CREATE_SRV,
            Syscall::CreateSgate { .. } => SYS_CREATE_SGATE,
            Syscall::CreateRgate { .. } => SYS_CREATE_RGATE,
            Syscall::DeriveMgate { .. } => SYS_DERIVE_MGATE,
            Syscall::CreateMap { .. } => SYS_CREATE_MAP,
            Syscall::CreateCtx { .. } => SYS_CREATE_CTX,
            Syscall::CreateSem { .. } => SYS_CREATE_SEM,
            Syscall::DeriveKmem { .. } => SYS_DERIVE_KMEM,
            Syscall::Activate { .. } => SYS_ACTIVATE,
            Syscall::CtxCtrl { .. } => SYS_CTX_CTRL,
            Syscall::CtxWait { .. } => SYS_CTX_WAIT,
            Syscall::Exchange { .. } => SYS_EXCHANGE,
            Syscall::Revoke { .. } => SYS_REVOKE,
            Syscall::KmemQuota { .. } => SYS_KMEM_QUOTA,
            Syscall::SemCtrl { .. } => SYS_SEM_CTRL,
        }
    }

    /// Whether this request may block in the kernel.
    pub fn may_block(&self) -> bool {
        matches!(
            self,
            Syscall::CtxWait { .. }
                | Syscall::Revoke { .. }
                | Syscall::SemCtrl {
                    op: SemOp::Down,
                    ..
                }
        )
    }
}

/// Syscall reply: a result code and three result words.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyscallReply {
    pub code: u64,
    pub words: [u64; REPLY_WORDS - 1],
}

impl SyscallReply {
    pub fn from_result(result: Result<[u64; REPLY_WORDS - 1], KernelError>) -> Self {
        match result {
            Ok(words) => Self {
                code: tessera_kif::syscall_error::SUCCESS,
                words,
            },
            Err(e) => Self {
                code: e.code(),
                words: [0; REPLY_WORDS - 1],
            },
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        words_to_bytes(&[self.code, self.words[0], self.words[1], self.words[2]])
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let [code, a, b, c] = bytes_to_words::<REPLY_WORDS>(bytes)?;
        Some(Self {
            code,
            words: [a, b, c],
        })
    }

    /// Back to a `Result`. Unknown codes read as `InvalidArgs`.
    pub fn into_result(self) -> Result<[u64; REPLY_WORDS - 1], KernelError> {
        if self.code == tessera_kif::syscall_error::SUCCESS {
            Ok(self.words)
        } else {
            Err(KernelError::from_code(self.code).unwrap_or(KernelError::InvalidArgs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_kif::CapType;

    #[test]
    fn test_decode_ctx_ctrl() {
        let stop = Syscall::decode(&[SYS_CTX_CTRL, 0, ctrl::STOP, (-3i64) as u64, 0, 0]).unwrap();
        assert_eq!(
            stop,
            Syscall::CtxCtrl {
                ctx: 0,
                op: CtxOp::Stop { exit_code: -3 }
            }
        );
        assert_eq!(
            Syscall::decode(&[SYS_CTX_CTRL, 0, 99, 0, 0, 0]),
            Err(KernelError::InvalidArgs)
        );
        assert_eq!(
            Syscall::decode(&[SYS_CTX_CTRL, 0, ctrl::MIGRATE, AUTO_TILE, 0, 0]),
            Err(KernelError::InvalidArgs)
        );
    }

    #[test]
    fn test_decode_rejects_malformed_operands() {
        assert_eq!(
            Syscall::decode(&[0x7F, 0, 0, 0, 0, 0]),
            Err(KernelError::NotSupported)
        );
        assert_eq!(
            Syscall::decode(&[SYS_CTX_WAIT, 0, 1, 0, 0, 0]),
            Err(KernelError::InvalidArgs)
        );
        assert_eq!(
            Syscall::decode(&[SYS_CTX_WAIT, 5, 1, 2, 3, 4]),
            Err(KernelError::InvalidArgs)
        );
        assert_eq!(
            Syscall::decode(&[SYS_CREATE_SGATE, 20, 21, 0, 1 << 16, 0]),
            Err(KernelError::InvalidArgs)
        );
        assert_eq!(
            Syscall::decode(&[SYS_DERIVE_MGATE, 20, 2, 0, 4096, 0xFF]),
            Err(KernelError::InvalidArgs)
        );
    }

    #[test]
    fn test_encode_decode_samples() {
        let calls = [
            Syscall::CtxWait {
                sels: alloc::vec![20, 21],
            },
            Syscall::Revoke {
                ctx: 0,
                crd: CapRngDesc::new(CapType::Mapping, 100, 4),
                own: true,
            },
            Syscall::CreateCtx {
                dst: 30,
                kmem: 1,
                tile: None,
            },
        ];
        for call in calls {
            let words = call.encode().unwrap();
            assert_eq!(Syscall::decode(&words).unwrap(), call);
        }
    }

    #[test]
    fn test_reply_bytes() {
        let reply = SyscallReply::from_result(Err(KernelError::NoCredits));
        let back = SyscallReply::from_bytes(&reply.to_bytes()).unwrap();
        assert_eq!(back.into_result(), Err(KernelError::NoCredits));
        assert!(SyscallReply::from_bytes(&[0u8; 8]).is_none());
    }
}
