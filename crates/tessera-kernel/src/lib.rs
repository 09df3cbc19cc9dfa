//! Tessera Kernel
//!
//! Runtime half of the kernel, on top of the pure capability space in
//! `tessera-kernel-core`:
//! - Endpoint register files (on a tile or saved in context memory)
//! - The credit-based message protocol (send, fetch, reply, ack)
//! - Execution contexts and their lifecycle on tiles
//! - Syscall decoding and dispatch
//! - The user-side gate library
//!
//! # Layering
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ System<H>       boot, syscall transport, SysLog, handlers     │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Kernel<H>       contexts, tiles, endpoints, syscall execution │
//! │   ├── tcu       credit protocol over any EndpointRegisters    │
//! │   └── CapSpace  capability forest, objects, quotas            │
//! ├──────────────────────────────────────────────────────────────┤
//! │ H: HAL          endpoint registers, tile start/stop, memory   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every operation that touches an endpoint goes through
//! [`epfile::EndpointRegisters`], so the same protocol code runs against a
//! tile's live register file or against the copy saved in a suspended
//! context.

#![no_std]
extern crate alloc;

pub mod config;
pub mod context;
mod kernel;
pub mod epfile;
pub mod gate;
pub mod syscall;
pub mod system;
pub mod tcu;
pub mod thread;

pub use crate::config::KernelConfig;
pub use crate::context::{Binding, CtxState, ExecutionContext};
pub use crate::kernel::Kernel;
pub use crate::gate::{MemGate, RecvGate, SGateArgs, SendGate};
pub use crate::syscall::{CtxOp, SemOp, Syscall, SyscallReply};
pub use crate::system::{MsgHandler, System};
pub use crate::tcu::{Message, MsgPos};
pub use crate::thread::{Event, Outcome};

// Re-export the layers below
pub use tessera_axiom::{SysEvent, SysEventType, SysLog};
pub use tessera_hal::{HalError, TileDesc, TileKind, HAL};
pub use tessera_kernel_core::{
    check_all_invariants, CapKind, CapRef, CapSpace, InvariantViolation, KObject, KernelError,
    KernelMemory, ObjId, TableId,
};

/// Map a hardware error onto the kernel's error vocabulary.
pub(crate) fn hal_err(e: HalError) -> KernelError {
    match e {
        HalError::TileUnreachable => KernelError::Busy,
        HalError::NotSupported => KernelError::NotSupported,
        HalError::UnknownTile | HalError::InvalidEndpoint | HalError::OutOfBounds => {
            KernelError::InvalidArgs
        }
    }
}
