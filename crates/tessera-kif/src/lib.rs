//! Tessera Kernel Interface (KIF)
//!
//! Single source of truth for everything user code and the kernel must agree
//! on bit-for-bit:
//!
//! - identifiers (`CtxId`, `TileId`, selectors, endpoint indices)
//! - well-known endpoint slots and capability selectors
//! - syscall opcodes and their operand layout (`syscall`)
//! - syscall result codes (`syscall_error`)
//! - capability range descriptors and permission bits (`caps`)
//! - endpoint register file and message header layout (`tcu`)
//!
//! # Endpoint slots of every context
//!
//! ```text
//! ┌──────┬───────────────────────────────────────────────┐
//! │ ep 0 │ SYSC_SEP  send to the kernel's syscall ring   │
//! │ ep 1 │ SYSC_REP  receive syscall replies             │
//! │ ep 2 │ DEF_REP   default reply gate                  │
//! │ ep 3 │ FIRST_FREE_EP .. EP_COUNT  allocatable        │
//! └──────┴───────────────────────────────────────────────┘
//! ```

#![no_std]
extern crate alloc;

pub mod caps;
pub mod tcu;

pub use caps::{CapRngDesc, CapType, Perm};
pub use tcu::{EpRegs, EpShape, EpType, Header, HeaderFlags, MemEp, RecvEp, SendEp};

use serde::{Deserialize, Serialize};

/// Capability selector (index into a capability table)
pub type CapSel = u64;

/// Endpoint slot index within a context's endpoint file
pub type EpId = usize;

/// Opaque label attached to messages by the kernel
pub type Label = u64;

/// Execution context identifier (16 bit on the wire)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CtxId(pub u16);

/// Tile identifier (8 bit on the wire)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileId(pub u8);

/// The kernel's own pseudo-context. Owns the syscall receive ring.
pub const KERNEL_CTX: CtxId = CtxId(0);

/// Selector value meaning "none" / "allocate for me"
pub const INVALID_SEL: CapSel = u64::MAX;

/// Tile argument meaning "let the kernel choose"
pub const AUTO_TILE: u64 = u64::MAX;

/// Exit code reported for contexts destroyed without exiting
pub const EXIT_KILLED: i32 = -1;

// =============================================================================
// Endpoint slots
// =============================================================================

/// Number of endpoint slots per context
pub const EP_COUNT: usize = 16;
/// Syscall send endpoint
pub const SYSC_SEP: EpId = 0;
/// Syscall reply receive endpoint
pub const SYSC_REP: EpId = 1;
/// Default reply receive endpoint
pub const DEF_REP: EpId = 2;
/// First endpoint available for gate activation
pub const FIRST_FREE_EP: EpId = 3;
/// Kernel syscall receive endpoint (slot of the kernel pseudo-context)
pub const KSYS_REP: EpId = 0;

// =============================================================================
// Well-known selectors
// =============================================================================

/// Capability to the context itself
pub const SEL_CTX: CapSel = 0;
/// Capability to the context's kernel memory
pub const SEL_KMEM: CapSel = 1;
/// Root memory capability (root context only)
pub const SEL_MEM: CapSel = 2;
/// Endpoint capabilities for slots `FIRST_FREE_EP..EP_COUNT`
pub const FIRST_EP_SEL: CapSel = 3;
/// First selector free for user allocation
pub const FIRST_FREE_SEL: CapSel = FIRST_EP_SEL + (EP_COUNT - FIRST_FREE_EP) as CapSel;

/// Selector of the endpoint capability for slot `ep`.
pub const fn ep_sel(ep: EpId) -> CapSel {
    FIRST_EP_SEL + (ep - FIRST_FREE_EP) as CapSel
}

/// Size of a page for mapping capabilities
pub const PAGE_SIZE: u64 = 4096;

// =============================================================================
// Syscall operations
// =============================================================================

/// Syscall opcodes and operand layout.
///
/// A request is `REQUEST_WORDS` little-endian u64 words: the opcode followed
/// by opcode-specific operands (unused operands are zero). A reply is
/// `REPLY_WORDS` words: the result code followed by result words.
pub mod syscall {
    use alloc::vec::Vec;

    /// Number of words in a syscall request
    pub const REQUEST_WORDS: usize = 6;
    /// Number of words in a syscall reply
    pub const REPLY_WORDS: usize = 4;

    /// No operation (round trip through the kernel)
    pub const SYS_NOOP: u64 = 0x00;

    // === Object creation (0x01 - 0x0F) ===
    /// Create a service: [dst, rgate_sel, label]
    pub const SYS_CREATE_SRV: u64 = 0x01;
    /// Create a send gate: [dst, rgate_sel, label, credits]
    pub const SYS_CREATE_SGATE: u64 = 0x02;
    /// Create a receive gate: [dst, order, msg_order]
    pub const SYS_CREATE_RGATE: u64 = 0x03;
    /// Derive a memory gate: [dst, mgate_sel, offset, size, perm]
    pub const SYS_DERIVE_MGATE: u64 = 0x04;
    /// Create a mapping: [dst_page, mgate_sel, first_page, pages, perm]
    pub const SYS_CREATE_MAP: u64 = 0x05;
    /// Create an execution context: [dst, kmem_sel, tile] -> [ctx, tile]
    pub const SYS_CREATE_CTX: u64 = 0x06;
    /// Create a semaphore: [dst, value]
    pub const SYS_CREATE_SEM: u64 = 0x07;
    /// Derive kernel memory: [dst, kmem_sel, quota]
    pub const SYS_DERIVE_KMEM: u64 = 0x08;

    // === Endpoints (0x10 - 0x1F) ===
    /// Bind a gate to an endpoint: [ep_sel, gate_sel, rbuf_addr] -> [ep]
    pub const SYS_ACTIVATE: u64 = 0x10;

    // === Execution contexts (0x20 - 0x2F) ===
    /// Control a context: [ctx_sel, op, arg]
    pub const SYS_CTX_CTRL: u64 = 0x20;
    /// Wait for a context to exit: [count, sel0, sel1, sel2, sel3] -> [sel, exitcode]
    pub const SYS_CTX_WAIT: u64 = 0x21;

    // === Capabilities (0x30 - 0x3F) ===
    /// Exchange capability ranges: [ctx_sel, own_crd, other_sel, obtain]
    pub const SYS_EXCHANGE: u64 = 0x30;
    /// Revoke a capability range: [ctx_sel, crd, own]
    pub const SYS_REVOKE: u64 = 0x31;

    // === Misc (0x40 - 0x4F) ===
    /// Query kernel memory: [kmem_sel] -> [total, left]
    pub const SYS_KMEM_QUOTA: u64 = 0x40;
    /// Semaphore operation: [sem_sel, op]
    pub const SYS_SEM_CTRL: u64 = 0x41;

    /// `SYS_CTX_CTRL` operations.
    pub mod ctrl {
        /// Start execution at `arg` (entry point)
        pub const START: u64 = 0;
        /// Stop with exit code `arg`
        pub const STOP: u64 = 1;
        /// Give up the tile and rejoin its ready queue
        pub const YIELD: u64 = 2;
        /// Take the context off its tile without requeueing it
        pub const SUSPEND: u64 = 3;
        /// Put a suspended context back on its tile
        pub const RESUME: u64 = 4;
        /// Move a suspended context to tile `arg`
        pub const MIGRATE: u64 = 5;
    }

    /// `SYS_SEM_CTRL` operations.
    pub mod sem {
        /// Increment, waking one waiter
        pub const UP: u64 = 0;
        /// Decrement, blocking at zero
        pub const DOWN: u64 = 1;
    }

    /// Human-readable name of an opcode, for logs.
    pub fn name(op: u64) -> &'static str {
        match op {
            SYS_NOOP => "noop",
            SYS_CREATE_SRV => "create_srv",
            SYS_CREATE_SGATE => "create_sgate",
            SYS_CREATE_RGATE => "create_rgate",
            SYS_DERIVE_MGATE => "derive_mgate",
            SYS_CREATE_MAP => "create_map",
            SYS_CREATE_CTX => "create_ctx",
            SYS_CREATE_SEM => "create_sem",
            SYS_DERIVE_KMEM => "derive_kmem",
            SYS_ACTIVATE => "activate",
            SYS_CTX_CTRL => "ctx_ctrl",
            SYS_CTX_WAIT => "ctx_wait",
            SYS_EXCHANGE => "exchange",
            SYS_REVOKE => "revoke",
            SYS_KMEM_QUOTA => "kmem_quota",
            SYS_SEM_CTRL => "sem_ctrl",
            _ => "unknown",
        }
    }

    /// Serialize words as little-endian bytes.
    pub fn words_to_bytes(words: &[u64]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(words.len() * 8);
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        bytes
    }

    /// Parse exactly `N` little-endian words. Missing trailing bytes are an error.
    pub fn bytes_to_words<const N: usize>(bytes: &[u8]) -> Option<[u64; N]> {
        if bytes.len() < N * 8 {
            return None;
        }
        let mut words = [0u64; N];
        for (i, w) in words.iter_mut().enumerate() {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            *w = u64::from_le_bytes(raw);
        }
        Some(words)
    }
}

/// Syscall result codes carried in word 0 of every reply.
pub mod syscall_error {
    /// Operation succeeded
    pub const SUCCESS: u64 = 0;
    /// Selector outside the table or already occupied
    pub const INVALID_SELECTOR: u64 = 1;
    /// No capability at the selector
    pub const NOT_FOUND: u64 = 2;
    /// Kernel memory quota exhausted
    pub const OUT_OF_KERNEL_MEMORY: u64 = 3;
    /// All endpoint slots in use
    pub const NO_FREE_ENDPOINT: u64 = 4;
    /// Send endpoint has no credits left
    pub const NO_CREDITS: u64 = 5;
    /// Endpoint has been invalidated
    pub const ENDPOINT_INVALID: u64 = 6;
    /// Source capability was revoked
    pub const CAPABILITY_GONE: u64 = 7;
    /// Target context is dead
    pub const CONTEXT_DEAD: u64 = 8;
    /// Operation invalid for this capability or context kind
    pub const NOT_SUPPORTED: u64 = 9;
    /// Receiver ring buffer full; retry
    pub const BUSY: u64 = 10;
    /// Malformed operands
    pub const INVALID_ARGS: u64 = 11;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ep_selectors_are_contiguous() {
        assert_eq!(ep_sel(FIRST_FREE_EP), FIRST_EP_SEL);
        assert_eq!(ep_sel(EP_COUNT - 1) + 1, FIRST_FREE_SEL);
        assert!(FIRST_EP_SEL > SEL_MEM);
    }

    #[test]
    fn test_words_parse_rejects_short_input() {
        let bytes = syscall::words_to_bytes(&[1, 2]);
        assert_eq!(syscall::bytes_to_words::<2>(&bytes), Some([1, 2]));
        assert_eq!(syscall::bytes_to_words::<3>(&bytes), None);
    }

    #[test]
    fn test_syscall_names() {
        assert_eq!(syscall::name(syscall::SYS_REVOKE), "revoke");
        assert_eq!(syscall::name(0xFFFF), "unknown");
    }
}
