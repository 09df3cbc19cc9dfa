//! The capability space: all tables, all objects, one revocation forest.
//!
//! # Forest layout
//!
//! ```text
//!   table A            table B            table C
//!   ┌──────┐           ┌──────┐           ┌──────┐
//!   │ s=4  │ root      │ s=9  │           │ s=2  │
//!   └──┬───┘           └──┬───┘           └──────┘
//!      │ first_child      │ first_child       ▲
//!      ▼                  ▼                   │ next/prev
//!   (B,9) ───next───▶ (C,2)               (C,5)
//! ```
//!
//! Each capability names its parent, its first child and its siblings by
//! `CapRef`. `obtain` inserts the clone as the new first child of the source;
//! `revoke` walks a subtree in post-order (children, in sibling order, before
//! the node itself) so a node is never released while a descendant still
//! names it.
//!
//! # Accounting
//!
//! Each capability charges its table's kernel memory when inserted and
//! refunds it when revoked, just before it is removed from the table.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use tessera_kif::{CapSel, CapType, CtxId};

use crate::capability::{CapTable, Capability};
use crate::error::KernelError;
use crate::kmem::KernelMemory;
use crate::object::{KObject, ObjectTable};
use crate::types::{CapKind, CapRef, ObjId, TableId, CAP_SIZE};

/// A capability removed by a revoke, with the side effects the runtime must apply.
#[derive(Clone, Debug)]
pub struct Revoked {
    pub cap: CapRef,
    /// Context owning the table the capability was in
    pub owner: Option<CtxId>,
    pub kind: CapKind,
    pub obj: ObjId,
    /// The object, if this was its last reference
    pub destroyed: Option<KObject>,
}

/// All capability tables and kernel objects.
#[derive(Debug, Default)]
pub struct CapSpace {
    tables: BTreeMap<TableId, CapTable>,
    objects: ObjectTable,
    next_table: u32,
}

impl CapSpace {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Tables
    // ========================================================================

    /// Create an empty table. `kmem = None` means capabilities are free
    /// (kernel-owned table).
    pub fn create_table(
        &mut self,
        owner: Option<CtxId>,
        ty: CapType,
        kmem: Option<Arc<KernelMemory>>,
    ) -> TableId {
        let id = TableId(self.next_table);
        self.next_table += 1;
        self.tables.insert(id, CapTable::new(id, owner, ty, kmem));
        id
    }

    /// Remove a table. Only empty tables can be removed.
    pub fn remove_table(&mut self, id: TableId) -> Result<CapTable, KernelError> {
        match self.tables.get(&id) {
            None => Err(KernelError::NotFound),
            Some(t) if !t.is_empty() => Err(KernelError::Busy),
            Some(_) => self.tables.remove(&id).ok_or(KernelError::NotFound),
        }
    }

    pub fn table(&self, id: TableId) -> Option<&CapTable> {
        self.tables.get(&id)
    }

    pub fn tables(&self) -> impl Iterator<Item = &CapTable> {
        self.tables.values()
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Look up a selector in a table.
    pub fn lookup(&self, table: TableId, sel: CapSel) -> Result<&Capability, KernelError> {
        self.tables
            .get(&table)
            .ok_or(KernelError::NotFound)?
            .get(sel)
    }

    /// Look up a capability and require a kind.
    pub fn lookup_kind(
        &self,
        table: TableId,
        sel: CapSel,
        kind: CapKind,
    ) -> Result<&Capability, KernelError> {
        let cap = self.lookup(table, sel)?;
        if cap.kind != kind {
            return Err(KernelError::NotSupported);
        }
        Ok(cap)
    }

    pub fn get(&self, r: CapRef) -> Option<&Capability> {
        self.tables.get(&r.table)?.get(r.sel).ok()
    }

    fn get_mut(&mut self, r: CapRef) -> Option<&mut Capability> {
        self.tables.get_mut(&r.table)?.get_mut(r.sel)
    }

    pub fn object(&self, id: ObjId) -> Option<&KObject> {
        self.objects.get(id)
    }

    pub fn object_mut(&mut self, id: ObjId) -> Option<&mut KObject> {
        self.objects.get_mut(id)
    }

    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    /// Take a kernel-held reference on an object.
    pub fn acquire(&mut self, id: ObjId) -> Result<(), KernelError> {
        self.objects.acquire(id)
    }

    /// Drop a kernel-held reference. Returns the object if it died.
    pub fn release(&mut self, id: ObjId) -> Option<KObject> {
        self.objects.release(id)
    }

    /// Direct children of a capability, in sibling order.
    pub fn children(&self, r: CapRef) -> Vec<CapRef> {
        let mut out = Vec::new();
        let mut next = self.get(r).and_then(|c| c.first_child);
        while let Some(child) = next {
            out.push(child);
            next = self.get(child).and_then(|c| c.next);
        }
        out
    }

    /// All descendants of a capability in revoke order (post-order).
    pub fn descendants(&self, r: CapRef) -> Vec<CapRef> {
        let mut order = self.post_order(r);
        order.pop();
        order
    }

    // ========================================================================
    // Create
    // ========================================================================

    /// Create a kernel object together with its root capability.
    ///
    /// Charges `CAP_SIZE + obj_size` on the table's quota. Nothing changes on
    /// failure.
    pub fn create(
        &mut self,
        table: TableId,
        sel: CapSel,
        obj: KObject,
    ) -> Result<CapRef, KernelError> {
        self.create_under(table, sel, obj, None)
    }

    /// Create a kernel object whose root capability is placed below `parent`,
    /// so that revoking `parent` also destroys the new object (derived
    /// memory regions, derived kernel memory).
    pub fn create_child(
        &mut self,
        table: TableId,
        sel: CapSel,
        obj: KObject,
        parent: CapRef,
    ) -> Result<CapRef, KernelError> {
        if self.get(parent).is_none() {
            return Err(KernelError::CapabilityGone);
        }
        self.create_under(table, sel, obj, Some(parent))
    }

    fn create_under(
        &mut self,
        table: TableId,
        sel: CapSel,
        obj: KObject,
        parent: Option<CapRef>,
    ) -> Result<CapRef, KernelError> {
        let kind = obj.kind();
        let charge = CAP_SIZE + kind.obj_size();
        self.check_free(table, sel)?;
        self.charge(table, charge)?;

        let id = self.objects.insert(obj);
        self.objects.add_cap_ref(id);
        let r = CapRef::new(table, sel);
        self.insert_linked(
            Capability {
                sel,
                table,
                kind,
                obj: id,
                parent: None,
                first_child: None,
                next: None,
                prev: None,
                charge,
                holds_ref: true,
            },
            parent,
        );
        log::trace!(target: "cap", "create {} {:?} obj={}", kind.name(), r, id.0);
        Ok(r)
    }

    // ========================================================================
    // Obtain
    // ========================================================================

    /// Clone `src` into `dst_table` at `dst_sel` as a new child of `src`.
    ///
    /// Charges `CAP_SIZE` on the destination table's quota. Shared kinds take
    /// a reference on the object; exclusive kinds become linked aliases.
    pub fn obtain(
        &mut self,
        dst_table: TableId,
        dst_sel: CapSel,
        src: CapRef,
    ) -> Result<CapRef, KernelError> {
        let (kind, obj) = self
            .get(src)
            .map(|c| (c.kind, c.obj))
            .ok_or(KernelError::CapabilityGone)?;
        self.check_free(dst_table, dst_sel)?;
        self.charge(dst_table, CAP_SIZE)?;
        Ok(self.clone_into(dst_table, dst_sel, src, kind, obj))
    }

    /// Clone `count` capabilities from `src_table[src_start..]` to
    /// `dst_table[dst_start..]`, all or nothing.
    ///
    /// Every source must exist (`CapabilityGone`), every destination selector
    /// must be free (`InvalidSelector`), and the whole charge is taken at once
    /// (`OutOfKernelMemory`).
    pub fn obtain_range(
        &mut self,
        dst_table: TableId,
        dst_start: CapSel,
        src_table: TableId,
        src_start: CapSel,
        count: u64,
    ) -> Result<Vec<CapRef>, KernelError> {
        let srcs = (0..count)
            .map(|i| {
                let sel = src_start.checked_add(i).ok_or(KernelError::InvalidArgs)?;
                let r = CapRef::new(src_table, sel);
                self.get(r)
                    .map(|c| (r, c.kind, c.obj))
                    .ok_or(KernelError::CapabilityGone)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let dst = self.tables.get(&dst_table).ok_or(KernelError::NotFound)?;
        if !dst.range_unused(dst_start, count) {
            return Err(KernelError::InvalidSelector);
        }
        let total = CAP_SIZE
            .checked_mul(count as usize)
            .ok_or(KernelError::OutOfKernelMemory)?;
        self.charge(dst_table, total)?;

        Ok(srcs
            .into_iter()
            .zip(dst_start..)
            .map(|((src, kind, obj), sel)| self.clone_into(dst_table, sel, src, kind, obj))
            .collect())
    }

    /// Insert a clone of `src`; selector and charge are already checked.
    fn clone_into(
        &mut self,
        dst_table: TableId,
        dst_sel: CapSel,
        src: CapRef,
        kind: CapKind,
        obj: ObjId,
    ) -> CapRef {
        let holds_ref = kind.is_shared();
        if holds_ref {
            self.objects.add_cap_ref(obj);
        }
        let r = CapRef::new(dst_table, dst_sel);
        self.insert_linked(
            Capability {
                sel: dst_sel,
                table: dst_table,
                kind,
                obj,
                parent: None,
                first_child: None,
                next: None,
                prev: None,
                charge: CAP_SIZE,
                holds_ref,
            },
            Some(src),
        );
        log::trace!(target: "cap", "obtain {} {:?} -> {:?}", kind.name(), src, r);
        r
    }

    fn check_free(&self, table: TableId, sel: CapSel) -> Result<(), KernelError> {
        let t = self.tables.get(&table).ok_or(KernelError::NotFound)?;
        if t.contains(sel) || sel > crate::capability::MAX_SEL {
            return Err(KernelError::InvalidSelector);
        }
        Ok(())
    }

    fn charge(&self, table: TableId, size: usize) -> Result<(), KernelError> {
        let t = self.tables.get(&table).ok_or(KernelError::NotFound)?;
        match t.kmem() {
            Some(km) => km.alloc(size),
            None => Ok(()),
        }
    }

    /// Insert `cap` into its table, as first child of `parent` if given.
    fn insert_linked(&mut self, mut cap: Capability, parent: Option<CapRef>) {
        let r = cap.cap_ref();
        let old_first = parent.and_then(|p| self.get(p)).and_then(|p| p.first_child);
        cap.parent = parent;
        cap.next = old_first;
        if let Some(t) = self.tables.get_mut(&r.table) {
            // selector checked free by caller
            let _ = t.insert(cap);
        }
        if let Some(first) = old_first {
            if let Some(c) = self.get_mut(first) {
                c.prev = Some(r);
            }
        }
        if let Some(p) = parent {
            if let Some(c) = self.get_mut(p) {
                c.first_child = Some(r);
            }
        }
    }

    // ========================================================================
    // Revoke
    // ========================================================================

    /// Revoke all descendants of `r` and, if `include_self`, `r` itself.
    ///
    /// With `include_self = false` the capability stays and its child link is
    /// cleared. Returns every removed capability in removal order.
    pub fn revoke(&mut self, r: CapRef, include_self: bool) -> Result<Vec<Revoked>, KernelError> {
        if self.get(r).is_none() {
            return Err(KernelError::NotFound);
        }
        let mut out = Vec::new();
        if include_self {
            self.unlink(r);
            self.revoke_subtree(r, &mut out);
        } else {
            let children = self.children(r);
            if let Some(c) = self.get_mut(r) {
                c.first_child = None;
            }
            for child in children {
                self.revoke_subtree(child, &mut out);
            }
        }
        log::debug!(
            target: "cap",
            "revoke {:?} include_self={} removed={}",
            r,
            include_self,
            out.len()
        );
        Ok(out)
    }

    /// Revoke every capability in `[start, start + count)` of `table`.
    ///
    /// `owned = true` removes the capabilities and their descendants,
    /// `owned = false` only their descendants. `NotFound` if the range is empty.
    pub fn revoke_range(
        &mut self,
        table: TableId,
        start: CapSel,
        count: u64,
        owned: bool,
    ) -> Result<Vec<Revoked>, KernelError> {
        let end = start.saturating_add(count);
        let sels: Vec<CapSel> = self
            .tables
            .get(&table)
            .ok_or(KernelError::NotFound)?
            .selectors_in(start, end)
            .collect();
        if sels.is_empty() {
            return Err(KernelError::NotFound);
        }
        let mut out = Vec::new();
        for sel in sels {
            let r = CapRef::new(table, sel);
            // may already be gone as a descendant of an earlier one
            if self.get(r).is_some() {
                out.extend(self.revoke(r, owned)?);
            }
        }
        Ok(out)
    }

    /// Revoke every capability in a table, leaving it empty.
    pub fn revoke_all(&mut self, table: TableId) -> Vec<Revoked> {
        self.revoke_range(table, 0, u64::MAX, true)
            .unwrap_or_default()
    }

    /// Detach `r` from its parent and siblings.
    fn unlink(&mut self, r: CapRef) {
        let Some((parent, prev, next)) = self.get(r).map(|c| (c.parent, c.prev, c.next)) else {
            return;
        };
        match prev {
            Some(p) => {
                if let Some(c) = self.get_mut(p) {
                    c.next = next;
                }
            }
            None => {
                if let Some(par) = parent {
                    if let Some(c) = self.get_mut(par) {
                        c.first_child = next;
                    }
                }
            }
        }
        if let Some(n) = next {
            if let Some(c) = self.get_mut(n) {
                c.prev = prev;
            }
        }
        if let Some(c) = self.get_mut(r) {
            c.parent = None;
            c.prev = None;
            c.next = None;
        }
    }

    /// `r` and its descendants in post-order, children in sibling order.
    fn post_order(&self, r: CapRef) -> Vec<CapRef> {
        let mut order = Vec::new();
        let mut stack = vec![(r, false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
                continue;
            }
            stack.push((node, true));
            for child in self.children(node).into_iter().rev() {
                stack.push((child, false));
            }
        }
        order
    }

    /// Remove an already unlinked subtree.
    fn revoke_subtree(&mut self, r: CapRef, out: &mut Vec<Revoked>) {
        for node in self.post_order(r) {
            let Some(table) = self.tables.get_mut(&node.table) else {
                continue;
            };
            let owner = table.owner();
            if let (Ok(cap), Some(km)) = (table.get(node.sel), table.kmem()) {
                km.free(cap.charge);
            }
            let Some(cap) = table.remove(node.sel) else {
                continue;
            };
            let destroyed = if cap.holds_ref {
                self.objects.drop_cap_ref(cap.obj)
            } else {
                None
            };
            out.push(Revoked {
                cap: node,
                owner,
                kind: cap.kind,
                obj: cap.obj,
                destroyed,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invariants::check_all_invariants;

    fn sem() -> KObject {
        KObject::Semaphore { value: 0 }
    }

    fn space_with(n: usize, quota: usize) -> (CapSpace, Vec<TableId>, Vec<Arc<KernelMemory>>) {
        let mut space = CapSpace::new();
        let mut tables = Vec::new();
        let mut kmems = Vec::new();
        for i in 0..n {
            let km = KernelMemory::new_root(quota);
            tables.push(space.create_table(Some(CtxId(i as u16 + 1)), CapType::Object, Some(km.clone())));
            kmems.push(km);
        }
        (space, tables, kmems)
    }

    fn assert_invariants(space: &CapSpace) {
        let violations = check_all_invariants(space);
        assert!(violations.is_empty(), "violations: {:?}", violations);
    }

    // ========================================================================
    // Create / obtain
    // ========================================================================

    #[test]
    fn test_create_charges_object_and_cap() {
        let (mut space, t, km) = space_with(1, 4096);
        let r = space.create(t[0], 5, sem()).unwrap();
        assert_eq!(km[0].consumed(), CAP_SIZE + CapKind::Semaphore.obj_size());
        assert!(space.get(r).unwrap().is_root());
        assert_eq!(space.create(t[0], 5, sem()).err(), Some(KernelError::InvalidSelector));
        assert_invariants(&space);
    }

    #[test]
    fn test_create_out_of_quota_changes_nothing() {
        let (mut space, t, km) = space_with(1, CAP_SIZE);
        assert_eq!(space.create(t[0], 1, sem()).err(), Some(KernelError::OutOfKernelMemory));
        assert_eq!(km[0].consumed(), 0);
        assert!(space.objects().is_empty());
        assert!(space.table(t[0]).unwrap().is_empty());
    }

    #[test]
    fn test_obtain_links_as_first_child() {
        let (mut space, t, km) = space_with(3, 4096);
        let root = space.create(t[0], 1, sem()).unwrap();
        let a = space.obtain(t[1], 1, root).unwrap();
        let b = space.obtain(t[2], 1, root).unwrap();

        assert_eq!(space.children(root), [b, a]);
        assert_eq!(space.get(a).unwrap().parent, Some(root));
        assert_eq!(km[1].consumed(), CAP_SIZE);
        assert_eq!(space.objects().cap_refs(space.get(root).unwrap().obj), 3);
        assert_invariants(&space);
    }

    #[test]
    fn test_obtain_exclusive_kind_is_alias() {
        let (mut space, t, _km) = space_with(2, 4096);
        let root = space
            .create(t[0], 1, KObject::Endpoint { ctx: CtxId(1), ep: 4 })
            .unwrap();
        let alias = space.obtain(t[1], 1, root).unwrap();
        let obj = space.get(root).unwrap().obj;
        assert_eq!(space.objects().cap_refs(obj), 1);
        assert!(!space.get(alias).unwrap().holds_ref);

        // revoking the alias leaves the object
        let revoked = space.revoke(alias, true).unwrap();
        assert!(revoked[0].destroyed.is_none());
        assert!(space.objects().contains(obj));
        assert_invariants(&space);
    }

    #[test]
    fn test_obtain_failures_leave_no_trace() {
        let (mut space, t, km) = space_with(2, CAP_SIZE + 32 + CAP_SIZE);
        let root = space.create(t[0], 1, sem()).unwrap();
        let tight = space.create_table(Some(CtxId(9)), CapType::Object, Some(KernelMemory::new_root(10)));

        assert_eq!(space.obtain(tight, 1, root).err(), Some(KernelError::OutOfKernelMemory));
        assert_eq!(space.obtain(t[0], 1, root).err(), Some(KernelError::InvalidSelector));
        assert_eq!(
            space.obtain(t[1], 1, CapRef::new(t[0], 77)).err(),
            Some(KernelError::CapabilityGone)
        );
        assert!(space.children(root).is_empty());
        assert_eq!(km[1].consumed(), 0);
        assert_invariants(&space);
    }

    #[test]
    fn test_obtain_range_all_or_nothing() {
        let (mut space, t, km) = space_with(2, 4096);
        space.create(t[0], 10, sem()).unwrap();
        space.create(t[0], 11, sem()).unwrap();

        // hole at 12
        assert_eq!(
            space.obtain_range(t[1], 0, t[0], 10, 3).err(),
            Some(KernelError::CapabilityGone)
        );
        assert!(space.table(t[1]).unwrap().is_empty());

        space.create(t[1], 21, sem()).unwrap();
        let before = km[1].consumed();
        assert_eq!(
            space.obtain_range(t[1], 20, t[0], 10, 2).err(),
            Some(KernelError::InvalidSelector)
        );
        assert_eq!(km[1].consumed(), before);

        let got = space.obtain_range(t[1], 0, t[0], 10, 2).unwrap();
        assert_eq!(got, [CapRef::new(t[1], 0), CapRef::new(t[1], 1)]);
        assert_invariants(&space);
    }

    // ========================================================================
    // Revoke
    // ========================================================================

    #[test]
    fn test_revoke_three_level_chain() {
        let (mut space, t, km) = space_with(3, 4096);
        let root = space.create(t[0], 1, sem()).unwrap();
        let mid = space.obtain(t[1], 2, root).unwrap();
        let leaf = space.obtain(t[2], 3, mid).unwrap();
        let obj = space.get(root).unwrap().obj;

        let revoked = space.revoke(root, true).unwrap();
        // post-order: leaf, mid, root
        let order: Vec<_> = revoked.iter().map(|r| r.cap).collect();
        assert_eq!(order, [leaf, mid, root]);
        assert!(revoked[2].destroyed.is_some());

        assert_eq!(space.lookup(t[0], 1).err(), Some(KernelError::NotFound));
        assert_eq!(space.lookup(t[1], 2).err(), Some(KernelError::NotFound));
        assert_eq!(space.lookup(t[2], 3).err(), Some(KernelError::NotFound));
        assert!(!space.objects().contains(obj));
        for k in &km {
            assert_eq!(k.consumed(), 0);
        }
        assert_invariants(&space);
    }

    #[test]
    fn test_revoke_children_before_next_sibling() {
        let (mut space, t, _km) = space_with(2, 1 << 16);
        let root = space.create(t[0], 0, sem()).unwrap();
        let a = space.obtain(t[1], 1, root).unwrap();
        let a1 = space.obtain(t[1], 2, a).unwrap();
        let b = space.obtain(t[1], 3, root).unwrap();
        let b1 = space.obtain(t[1], 4, b).unwrap();

        let order: Vec<_> = space.revoke(root, false).unwrap().iter().map(|r| r.cap).collect();
        // children of root in sibling order: b (newest first), then a
        assert_eq!(order, [b1, b, a1, a]);
        assert!(space.get(root).unwrap().first_child.is_none());
        assert_invariants(&space);
    }

    #[test]
    fn test_revoke_middle_keeps_siblings_linked() {
        let (mut space, t, _km) = space_with(2, 1 << 16);
        let root = space.create(t[0], 0, sem()).unwrap();
        let a = space.obtain(t[1], 1, root).unwrap();
        let b = space.obtain(t[1], 2, root).unwrap();
        let c = space.obtain(t[1], 3, root).unwrap();

        space.revoke(b, true).unwrap();
        assert_eq!(space.children(root), [c, a]);
        assert_eq!(space.get(a).unwrap().prev, Some(c));
        assert_invariants(&space);
    }

    #[test]
    fn test_revoke_missing_is_not_found() {
        let (mut space, t, _km) = space_with(1, 4096);
        assert_eq!(
            space.revoke(CapRef::new(t[0], 3), true).err(),
            Some(KernelError::NotFound)
        );
        assert_eq!(
            space.revoke_range(t[0], 0, 10, true).err(),
            Some(KernelError::NotFound)
        );
    }

    #[test]
    fn test_revoke_range_owned_and_unowned() {
        let (mut space, t, km) = space_with(2, 1 << 16);
        let r1 = space.create(t[0], 1, sem()).unwrap();
        let r2 = space.create(t[0], 2, sem()).unwrap();
        space.obtain(t[1], 1, r1).unwrap();
        space.obtain(t[1], 2, r2).unwrap();

        // unowned: clones go, originals stay
        let out = space.revoke_range(t[0], 1, 2, false).unwrap();
        assert_eq!(out.len(), 2);
        assert!(space.table(t[1]).unwrap().is_empty());
        assert_eq!(space.table(t[0]).unwrap().len(), 2);
        assert_eq!(km[1].consumed(), 0);

        let out = space.revoke_range(t[0], 0, 3, true).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|r| r.destroyed.is_some()));
        assert_invariants(&space);
    }

    #[test]
    fn test_revoke_range_with_nested_selectors() {
        let (mut space, t, _km) = space_with(1, 1 << 16);
        let root = space.create(t[0], 1, sem()).unwrap();
        // clone into the same table, inside the range
        space.obtain(t[0], 2, root).unwrap();
        let out = space.revoke_range(t[0], 1, 2, true).unwrap();
        assert_eq!(out.len(), 2);
        assert!(space.table(t[0]).unwrap().is_empty());
    }

    #[test]
    fn test_external_reference_outlives_caps() {
        let (mut space, t, _km) = space_with(1, 4096);
        let root = space.create(t[0], 1, sem()).unwrap();
        let obj = space.get(root).unwrap().obj;
        space.acquire(obj).unwrap();

        let out = space.revoke(root, true).unwrap();
        assert!(out[0].destroyed.is_none());
        assert!(space.object(obj).is_some());
        assert!(space.release(obj).is_some());
        assert!(space.object(obj).is_none());
    }

    #[test]
    fn test_create_child_is_revoked_with_parent() {
        let (mut space, t, _km) = space_with(1, 4096);
        let mem = KObject::MemoryRegion {
            owner: CtxId(0),
            base: 0,
            size: 4096,
            perm: tessera_kif::Perm::RW,
        };
        let root = space.create(t[0], 1, mem.clone()).unwrap();
        let sub = space.create_child(t[0], 2, mem, root).unwrap();
        assert_ne!(space.get(sub).unwrap().obj, space.get(root).unwrap().obj);

        let out = space.revoke(root, true).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|r| r.destroyed.is_some()));
        assert_invariants(&space);
    }

    #[test]
    fn test_remove_table_requires_empty() {
        let (mut space, t, _km) = space_with(1, 4096);
        space.create(t[0], 1, sem()).unwrap();
        assert_eq!(space.remove_table(t[0]).err(), Some(KernelError::Busy));
        space.revoke_all(t[0]);
        assert!(space.remove_table(t[0]).is_ok());
        assert!(space.table(t[0]).is_none());
    }

    #[test]
    fn test_random_obtain_revoke_sequences_keep_invariants() {
        // xorshift for a deterministic pseudo-random schedule
        let mut seed = 0x2545_f491_4f6c_dd1du64;
        let mut rnd = move |n: u64| {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed % n
        };

        let (mut space, t, _km) = space_with(4, 1 << 20);
        for round in 0..400u64 {
            let table = t[rnd(4) as usize];
            let sel = rnd(16);
            match rnd(3) {
                0 => {
                    let _ = space.create(table, sel, sem());
                }
                1 => {
                    let src = CapRef::new(t[rnd(4) as usize], rnd(16));
                    let _ = space.obtain(table, sel, src);
                }
                _ => {
                    let _ = space.revoke(CapRef::new(table, sel), rnd(2) == 0);
                }
            }
            let violations = check_all_invariants(&space);
            assert!(violations.is_empty(), "round {}: {:?}", round, violations);
        }
    }
}
