//! Kernel objects and their reference counts.
//!
//! An object lives as long as it is referenced, either by a capability that
//! holds a reference (every clone of a shared kind, only the root of an
//! exclusive kind) or by the kernel itself (a context waiting on another
//! context's exit). The last release hands the object back to the caller,
//! which performs the hardware side of destruction.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use tessera_kif::{CtxId, EpId, Label, Perm};

use crate::error::KernelError;
use crate::kmem::KernelMemory;
use crate::types::{CapKind, ObjId};

/// Kernel object payloads.
#[derive(Clone, Debug)]
pub enum KObject {
    /// Permission to send to a receive gate
    SendGate {
        rgate: ObjId,
        label: Label,
        credits: u16,
    },
    /// A receive ring, bound to at most one endpoint
    RecvGate {
        order: u8,
        msg_order: u8,
        bound: Option<(CtxId, EpId)>,
    },
    /// A range of physical memory (`owner` is `KERNEL_CTX` for memory tiles)
    MemoryRegion {
        owner: CtxId,
        base: u64,
        size: u64,
        perm: Perm,
    },
    /// Pages mapped into a context's address space
    Mapping {
        ctx: CtxId,
        virt: u64,
        phys: u64,
        pages: u64,
        perm: Perm,
    },
    /// A service reachable through a receive gate
    Service { rgate: ObjId, label: Label },
    /// One endpoint slot of a context
    Endpoint { ctx: CtxId, ep: EpId },
    /// An execution context
    Context { ctx: CtxId },
    /// A kernel memory quota
    KernelMemory(Arc<KernelMemory>),
    /// A counting semaphore
    Semaphore { value: u32 },
}

impl KObject {
    pub fn kind(&self) -> CapKind {
        match self {
            KObject::SendGate { .. } => CapKind::SendGate,
            KObject::RecvGate { .. } => CapKind::RecvGate,
            KObject::MemoryRegion { .. } => CapKind::MemoryRegion,
            KObject::Mapping { .. } => CapKind::Mapping,
            KObject::Service { .. } => CapKind::Service,
            KObject::Endpoint { .. } => CapKind::Endpoint,
            KObject::Context { .. } => CapKind::ExecutionContext,
            KObject::KernelMemory(_) => CapKind::KernelMemory,
            KObject::Semaphore { .. } => CapKind::Semaphore,
        }
    }
}

#[derive(Debug)]
struct Entry {
    obj: KObject,
    /// References held by capabilities
    cap_refs: usize,
    /// References held by the kernel (wait registrations)
    ext_refs: usize,
}

/// All live kernel objects.
#[derive(Debug, Default)]
pub struct ObjectTable {
    entries: BTreeMap<ObjId, Entry>,
    next_id: u64,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object with no references yet.
    pub(crate) fn insert(&mut self, obj: KObject) -> ObjId {
        let id = ObjId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            Entry {
                obj,
                cap_refs: 0,
                ext_refs: 0,
            },
        );
        id
    }

    pub fn get(&self, id: ObjId) -> Option<&KObject> {
        self.entries.get(&id).map(|e| &e.obj)
    }

    pub fn get_mut(&mut self, id: ObjId) -> Option<&mut KObject> {
        self.entries.get_mut(&id).map(|e| &mut e.obj)
    }

    pub fn contains(&self, id: ObjId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn cap_refs(&self, id: ObjId) -> usize {
        self.entries.get(&id).map_or(0, |e| e.cap_refs)
    }

    pub fn ext_refs(&self, id: ObjId) -> usize {
        self.entries.get(&id).map_or(0, |e| e.ext_refs)
    }

    pub(crate) fn add_cap_ref(&mut self, id: ObjId) {
        if let Some(e) = self.entries.get_mut(&id) {
            e.cap_refs += 1;
        }
    }

    pub(crate) fn drop_cap_ref(&mut self, id: ObjId) -> Option<KObject> {
        let e = self.entries.get_mut(&id)?;
        e.cap_refs = e.cap_refs.saturating_sub(1);
        self.reap(id)
    }

    /// Take a kernel-held reference.
    pub fn acquire(&mut self, id: ObjId) -> Result<(), KernelError> {
        let e = self.entries.get_mut(&id).ok_or(KernelError::NotFound)?;
        e.ext_refs += 1;
        Ok(())
    }

    /// Drop a kernel-held reference. Returns the object if it was the last.
    pub fn release(&mut self, id: ObjId) -> Option<KObject> {
        let e = self.entries.get_mut(&id)?;
        e.ext_refs = e.ext_refs.saturating_sub(1);
        self.reap(id)
    }

    fn reap(&mut self, id: ObjId) -> Option<KObject> {
        let dead = self
            .entries
            .get(&id)
            .is_some_and(|e| e.cap_refs == 0 && e.ext_refs == 0);
        if dead {
            self.entries.remove(&id).map(|e| e.obj)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjId, &KObject)> {
        self.entries.iter().map(|(id, e)| (*id, &e.obj))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_reference_destroys() {
        let mut objs = ObjectTable::new();
        let id = objs.insert(KObject::Semaphore { value: 0 });
        objs.add_cap_ref(id);
        objs.acquire(id).unwrap();

        assert!(objs.drop_cap_ref(id).is_none());
        assert!(objs.contains(id));
        let obj = objs.release(id).unwrap();
        assert_eq!(obj.kind(), CapKind::Semaphore);
        assert!(!objs.contains(id));
    }

    #[test]
    fn test_acquire_missing_object() {
        let mut objs = ObjectTable::new();
        assert_eq!(objs.acquire(ObjId(7)), Err(KernelError::NotFound));
        assert!(objs.release(ObjId(7)).is_none());
    }

    #[test]
    fn test_ids_are_not_reused() {
        let mut objs = ObjectTable::new();
        let a = objs.insert(KObject::Semaphore { value: 1 });
        objs.add_cap_ref(a);
        objs.drop_cap_ref(a);
        let b = objs.insert(KObject::Semaphore { value: 1 });
        assert!(b > a);
    }
}
