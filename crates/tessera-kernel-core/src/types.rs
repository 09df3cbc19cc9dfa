//! Core kernel types

use serde::{Deserialize, Serialize};
use tessera_kif::CapSel;

/// Kernel object identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjId(pub u64);

/// Capability table identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableId(pub u32);

/// Arena index of a capability record.
///
/// The forest links capabilities by `CapRef` instead of pointers; following a
/// link to a revoked capability is a failed lookup, never a dangling access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CapRef {
    pub table: TableId,
    pub sel: CapSel,
}

impl CapRef {
    pub fn new(table: TableId, sel: CapSel) -> Self {
        Self { table, sel }
    }
}

/// Kernel memory charged for every capability record
pub const CAP_SIZE: usize = 64;

/// Kernel memory charged for an execution context object
pub const CTX_SIZE: usize = 1024;

/// What a capability refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CapKind {
    SendGate = 1,
    RecvGate = 2,
    MemoryRegion = 3,
    Mapping = 4,
    Service = 5,
    Endpoint = 6,
    ExecutionContext = 7,
    KernelMemory = 8,
    Semaphore = 9,
}

impl CapKind {
    pub fn name(&self) -> &'static str {
        match self {
            CapKind::SendGate => "SendGate",
            CapKind::RecvGate => "RecvGate",
            CapKind::MemoryRegion => "MemoryRegion",
            CapKind::Mapping => "Mapping",
            CapKind::Service => "Service",
            CapKind::Endpoint => "Endpoint",
            CapKind::ExecutionContext => "ExecutionContext",
            CapKind::KernelMemory => "KernelMemory",
            CapKind::Semaphore => "Semaphore",
        }
    }

    /// Reference-counted kinds: every clone holds a reference.
    ///
    /// The remaining kinds are exclusive: clones are linked aliases and only
    /// the root holds the object.
    pub fn is_shared(&self) -> bool {
        !matches!(self, CapKind::Endpoint | CapKind::Mapping)
    }

    /// Kernel memory charged for the object itself, on top of `CAP_SIZE`,
    /// when its root capability is created.
    pub fn obj_size(&self) -> usize {
        match self {
            CapKind::SendGate => 32,
            CapKind::RecvGate => 64,
            CapKind::MemoryRegion => 48,
            CapKind::Mapping => 32,
            CapKind::Service => 64,
            CapKind::Endpoint => 0,
            CapKind::ExecutionContext => CTX_SIZE,
            CapKind::KernelMemory => 32,
            CapKind::Semaphore => 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_kinds() {
        assert!(!CapKind::Endpoint.is_shared());
        assert!(!CapKind::Mapping.is_shared());
        assert!(CapKind::SendGate.is_shared());
        assert!(CapKind::ExecutionContext.is_shared());
    }

    #[test]
    fn test_cap_ref_ordering_groups_by_table() {
        let a = CapRef::new(TableId(1), 99);
        let b = CapRef::new(TableId(2), 0);
        assert!(a < b);
    }
}
