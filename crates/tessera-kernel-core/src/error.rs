//! Kernel error taxonomy.
//!
//! Every failed capability, endpoint or context operation surfaces as one of
//! these, and reaches the requesting context as the result code of its
//! syscall reply.

use tessera_kif::syscall_error;
use thiserror::Error;

/// Errors returned by kernel operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
pub enum KernelError {
    /// Selector outside the table, or occupied when it must be free
    #[error("invalid selector")]
    InvalidSelector,
    /// No capability at the selector
    #[error("capability not found")]
    NotFound,
    /// Kernel memory quota exhausted
    #[error("out of kernel memory")]
    OutOfKernelMemory,
    /// All endpoint slots of the context are in use
    #[error("no free endpoint")]
    NoFreeEndpoint,
    /// Send endpoint has no credits left
    #[error("no credits")]
    NoCredits,
    /// Endpoint is not configured (or no longer configured) as required
    #[error("endpoint invalid")]
    EndpointInvalid,
    /// Source capability was revoked
    #[error("capability gone")]
    CapabilityGone,
    /// Target context is dead
    #[error("context dead")]
    ContextDead,
    /// Operation invalid for this capability or context kind
    #[error("operation not supported")]
    NotSupported,
    /// Receiver ring buffer full, or tile transiently unreachable
    #[error("busy")]
    Busy,
    /// Malformed operands or protocol misuse
    #[error("invalid arguments")]
    InvalidArgs,
}

impl KernelError {
    /// Wire code of this error.
    pub fn code(self) -> u64 {
        match self {
            KernelError::InvalidSelector => syscall_error::INVALID_SELECTOR,
            KernelError::NotFound => syscall_error::NOT_FOUND,
            KernelError::OutOfKernelMemory => syscall_error::OUT_OF_KERNEL_MEMORY,
            KernelError::NoFreeEndpoint => syscall_error::NO_FREE_ENDPOINT,
            KernelError::NoCredits => syscall_error::NO_CREDITS,
            KernelError::EndpointInvalid => syscall_error::ENDPOINT_INVALID,
            KernelError::CapabilityGone => syscall_error::CAPABILITY_GONE,
            KernelError::ContextDead => syscall_error::CONTEXT_DEAD,
            KernelError::NotSupported => syscall_error::NOT_SUPPORTED,
            KernelError::Busy => syscall_error::BUSY,
            KernelError::InvalidArgs => syscall_error::INVALID_ARGS,
        }
    }

    /// Error for a wire code. `SUCCESS` and unknown codes yield `None`.
    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            syscall_error::INVALID_SELECTOR => KernelError::InvalidSelector,
            syscall_error::NOT_FOUND => KernelError::NotFound,
            syscall_error::OUT_OF_KERNEL_MEMORY => KernelError::OutOfKernelMemory,
            syscall_error::NO_FREE_ENDPOINT => KernelError::NoFreeEndpoint,
            syscall_error::NO_CREDITS => KernelError::NoCredits,
            syscall_error::ENDPOINT_INVALID => KernelError::EndpointInvalid,
            syscall_error::CAPABILITY_GONE => KernelError::CapabilityGone,
            syscall_error::CONTEXT_DEAD => KernelError::ContextDead,
            syscall_error::NOT_SUPPORTED => KernelError::NotSupported,
            syscall_error::BUSY => KernelError::Busy,
            syscall_error::INVALID_ARGS => KernelError::InvalidArgs,
            _ => return None,
        })
    }
}
