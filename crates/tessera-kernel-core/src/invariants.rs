//! Runtime-checkable invariants of the capability space.
//!
//! Used by unit tests after every mutation and by the kernel's debug
//! self-check.
//!
//! # Invariants
//!
//! 1. **Forest**: every link names an existing capability, sibling and
//!    parent links agree, and every parent chain ends at a root without
//!    revisiting a node
//! 2. **Quota conservation**: each kernel memory's consumption equals the
//!    charges of the capabilities in tables paying with it plus the quota
//!    derived from it
//! 3. **Object validity**: every capability names a live object of its kind,
//!    and each object's capability reference count matches the capabilities
//!    holding it

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::kmem::KernelMemory;
use crate::object::KObject;
use crate::space::CapSpace;
use crate::types::ObjId;

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

/// Check all invariants.
///
/// Returns a list of violations (empty if all invariants hold).
pub fn check_all_invariants(space: &CapSpace) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    violations.extend(check_forest(space));
    violations.extend(check_quota_conservation(space));
    violations.extend(check_object_validity(space));

    violations
}

/// Invariant 1: the capability links form a forest
fn check_forest(space: &CapSpace) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let total: usize = space.tables().map(|t| t.len()).sum();

    for table in space.tables() {
        for cap in table.iter() {
            let me = cap.cap_ref();

            if let Some(parent) = cap.parent {
                match space.get(parent) {
                    None => violations.push(InvariantViolation {
                        invariant: "forest",
                        description: alloc::format!("{:?} has dangling parent {:?}", me, parent),
                    }),
                    Some(_) if !space.children(parent).contains(&me) => {
                        violations.push(InvariantViolation {
                            invariant: "forest",
                            description: alloc::format!(
                                "{:?} not among the children of its parent {:?}",
                                me,
                                parent
                            ),
                        })
                    }
                    Some(_) => {}
                }
            }

            if let Some(next) = cap.next {
                let back = space.get(next).and_then(|n| n.prev);
                if back != Some(me) {
                    violations.push(InvariantViolation {
                        invariant: "forest",
                        description: alloc::format!(
                            "{:?}.next = {:?} but its prev is {:?}",
                            me,
                            next,
                            back
                        ),
                    });
                }
            }

            if let Some(child) = cap.first_child {
                let up = space.get(child).and_then(|c| c.parent);
                if up != Some(me) {
                    violations.push(InvariantViolation {
                        invariant: "forest",
                        description: alloc::format!(
                            "{:?}.first_child = {:?} whose parent is {:?}",
                            me,
                            child,
                            up
                        ),
                    });
                }
            }

            // parent chain must reach a root in at most `total` steps
            let mut steps = 0;
            let mut cur = cap.parent;
            while let Some(p) = cur {
                steps += 1;
                if steps > total {
                    violations.push(InvariantViolation {
                        invariant: "forest",
                        description: alloc::format!("cycle in parent chain of {:?}", me),
                    });
                    break;
                }
                cur = space.get(p).and_then(|c| c.parent);
            }
        }
    }

    violations
}

/// Invariant 2: consumed == charged capabilities + derived quota
fn check_quota_conservation(space: &CapSpace) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    let mut kmems: Vec<(Arc<KernelMemory>, usize)> = Vec::new();
    let mut account = |km: &Arc<KernelMemory>, charged: usize| {
        match kmems.iter_mut().find(|(k, _)| Arc::ptr_eq(k, km)) {
            Some((_, sum)) => *sum += charged,
            None => kmems.push((Arc::clone(km), charged)),
        }
    };

    for table in space.tables() {
        if let Some(km) = table.kmem() {
            account(km, table.charged());
        }
    }
    for (_, obj) in space.objects().iter() {
        if let KObject::KernelMemory(km) = obj {
            account(km, 0);
        }
    }

    for (km, charged) in &kmems {
        let expected = charged + km.derived();
        if km.consumed() != expected {
            violations.push(InvariantViolation {
                invariant: "quota_conservation",
                description: alloc::format!(
                    "kernel memory (total {}) consumed {} but capabilities charge {} and derived quotas {}",
                    km.total(),
                    km.consumed(),
                    charged,
                    km.derived()
                ),
            });
        }
    }

    violations
}

/// Invariant 3: capabilities name live objects, reference counts match
fn check_object_validity(space: &CapSpace) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let mut holders: BTreeMap<ObjId, usize> = BTreeMap::new();

    for table in space.tables() {
        for cap in table.iter() {
            match space.object(cap.obj) {
                None => violations.push(InvariantViolation {
                    invariant: "object_validity",
                    description: alloc::format!(
                        "{:?} references destroyed object {}",
                        cap.cap_ref(),
                        cap.obj.0
                    ),
                }),
                Some(obj) if obj.kind() != cap.kind => violations.push(InvariantViolation {
                    invariant: "object_validity",
                    description: alloc::format!(
                        "{:?} is a {} but object {} is a {}",
                        cap.cap_ref(),
                        cap.kind.name(),
                        cap.obj.0,
                        obj.kind().name()
                    ),
                }),
                Some(_) => {}
            }
            if cap.holds_ref {
                *holders.entry(cap.obj).or_insert(0) += 1;
            }
        }
    }

    for (id, _) in space.objects().iter() {
        let held = holders.get(&id).copied().unwrap_or(0);
        let counted = space.objects().cap_refs(id);
        if held != counted {
            violations.push(InvariantViolation {
                invariant: "object_validity",
                description: alloc::format!(
                    "object {} counts {} capability references, {} capabilities hold it",
                    id.0,
                    counted,
                    held
                ),
            });
        }
        if held == 0 && space.objects().ext_refs(id) == 0 {
            violations.push(InvariantViolation {
                invariant: "object_validity",
                description: alloc::format!("object {} is unreferenced but alive", id.0),
            });
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::KObject;
    use tessera_kif::{CapType, CtxId};

    #[test]
    fn test_empty_space_is_consistent() {
        let space = CapSpace::new();
        assert!(check_all_invariants(&space).is_empty());
    }

    #[test]
    fn test_derived_quota_is_accounted() {
        let mut space = CapSpace::new();
        let root = KernelMemory::new_root(1 << 16);
        let t = space.create_table(Some(CtxId(1)), CapType::Object, Some(root.clone()));
        let child = root.derive(4096).unwrap();
        space.create(t, 1, KObject::KernelMemory(child)).unwrap();
        assert!(check_all_invariants(&space).is_empty());
    }

    #[test]
    fn test_detects_untracked_charge() {
        let mut space = CapSpace::new();
        let km = KernelMemory::new_root(4096);
        let t = space.create_table(Some(CtxId(1)), CapType::Object, Some(km.clone()));
        space.create(t, 1, KObject::Semaphore { value: 1 }).unwrap();
        km.alloc(8).unwrap();
        let v = check_all_invariants(&space);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].invariant, "quota_conservation");
    }
}
