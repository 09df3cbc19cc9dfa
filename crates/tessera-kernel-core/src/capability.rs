//! Capability records and per-context capability tables.
//!
//! A capability is a typed reference to a kernel object plus its position in
//! the revocation forest. Links are [`CapRef`]s into the arena of all
//! tables, kept in [`crate::space::CapSpace`].

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use tessera_kif::{CapSel, CapType, CtxId};

use crate::error::KernelError;
use crate::kmem::KernelMemory;
use crate::types::{CapKind, CapRef, ObjId, TableId};

/// Largest valid selector (capability range descriptors carry 31 bits)
pub const MAX_SEL: CapSel = tessera_kif::caps::MAX_RANGE_START;

/// One capability.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capability {
    pub sel: CapSel,
    pub table: TableId,
    pub kind: CapKind,
    pub obj: ObjId,
    /// Capability this one was obtained from; `None` for a root
    pub parent: Option<CapRef>,
    pub first_child: Option<CapRef>,
    pub next: Option<CapRef>,
    pub prev: Option<CapRef>,
    /// Kernel memory charged to the table's quota for this record
    pub charge: usize,
    /// Whether this capability keeps the object alive
    pub holds_ref: bool,
}

impl Capability {
    pub fn cap_ref(&self) -> CapRef {
        CapRef::new(self.table, self.sel)
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Capability table of one context (or of the kernel).
#[derive(Debug)]
pub struct CapTable {
    id: TableId,
    owner: Option<CtxId>,
    ty: CapType,
    kmem: Option<Arc<KernelMemory>>,
    caps: BTreeMap<CapSel, Capability>,
}

impl CapTable {
    pub fn new(
        id: TableId,
        owner: Option<CtxId>,
        ty: CapType,
        kmem: Option<Arc<KernelMemory>>,
    ) -> Self {
        Self {
            id,
            owner,
            ty,
            kmem,
            caps: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    /// Owning context; `None` for the kernel's table.
    pub fn owner(&self) -> Option<CtxId> {
        self.owner
    }

    pub fn ty(&self) -> CapType {
        self.ty
    }

    /// Quota charged for capabilities in this table (`None` = unlimited).
    pub fn kmem(&self) -> Option<&Arc<KernelMemory>> {
        self.kmem.as_ref()
    }

    /// Insert a capability at its selector.
    pub fn insert(&mut self, cap: Capability) -> Result<(), KernelError> {
        if cap.sel > MAX_SEL || self.caps.contains_key(&cap.sel) {
            return Err(KernelError::InvalidSelector);
        }
        self.caps.insert(cap.sel, cap);
        Ok(())
    }

    /// Look up a selector.
    pub fn get(&self, sel: CapSel) -> Result<&Capability, KernelError> {
        if sel > MAX_SEL {
            return Err(KernelError::InvalidSelector);
        }
        self.caps.get(&sel).ok_or(KernelError::NotFound)
    }

    pub(crate) fn get_mut(&mut self, sel: CapSel) -> Option<&mut Capability> {
        self.caps.get_mut(&sel)
    }

    pub(crate) fn remove(&mut self, sel: CapSel) -> Option<Capability> {
        self.caps.remove(&sel)
    }

    pub fn contains(&self, sel: CapSel) -> bool {
        self.caps.contains_key(&sel)
    }

    /// Whether `[start, start + count)` is valid and holds no capability.
    pub fn range_unused(&self, start: CapSel, count: u64) -> bool {
        let Some(end) = start.checked_add(count) else {
            return false;
        };
        if count > 0 && end - 1 > MAX_SEL {
            return false;
        }
        self.caps.range(start..end).next().is_none()
    }

    /// Selectors in use within `[start, end)`, ascending.
    pub fn selectors_in(&self, start: CapSel, end: CapSel) -> impl Iterator<Item = CapSel> + '_ {
        self.caps.range(start..end.max(start)).map(|(sel, _)| *sel)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.caps.values()
    }

    pub fn len(&self) -> usize {
        self.caps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }

    /// Sum of the charges of all capabilities in the table.
    pub fn charged(&self) -> usize {
        self.caps.values().map(|c| c.charge).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(sel: CapSel) -> Capability {
        Capability {
            sel,
            table: TableId(0),
            kind: CapKind::Semaphore,
            obj: ObjId(0),
            parent: None,
            first_child: None,
            next: None,
            prev: None,
            charge: 64,
            holds_ref: true,
        }
    }

    #[test]
    fn test_insert_rejects_occupied() {
        let mut t = CapTable::new(TableId(0), None, CapType::Object, None);
        t.insert(cap(5)).unwrap();
        assert_eq!(t.insert(cap(5)), Err(KernelError::InvalidSelector));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_lookup_errors() {
        let mut t = CapTable::new(TableId(0), None, CapType::Object, None);
        t.insert(cap(1)).unwrap();
        assert!(t.get(1).is_ok());
        assert_eq!(t.get(2), Err(KernelError::NotFound));
        assert_eq!(t.get(MAX_SEL + 1), Err(KernelError::InvalidSelector));
        assert_eq!(t.insert(cap(MAX_SEL + 1)), Err(KernelError::InvalidSelector));
    }

    #[test]
    fn test_range_queries() {
        let mut t = CapTable::new(TableId(0), None, CapType::Object, None);
        t.insert(cap(3)).unwrap();
        t.insert(cap(7)).unwrap();
        assert!(t.range_unused(4, 3));
        assert!(!t.range_unused(4, 4));
        assert!(!t.range_unused(u64::MAX, 2));
        let sels: alloc::vec::Vec<_> = t.selectors_in(0, 8).collect();
        assert_eq!(sels, [3, 7]);
        assert_eq!(t.charged(), 128);
    }
}
