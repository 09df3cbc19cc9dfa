//! Tessera Kernel Core - capability forest and kernel memory accounting
//!
//! This crate holds the **pure, HAL-free** part of the kernel: the
//! capability tables of all contexts, the revocation forest linking them, the
//! kernel objects capabilities refer to, and kernel-memory quotas. It never
//! touches hardware; operations that have hardware consequences (endpoint
//! invalidation, context teardown) return them as [`Revoked`] records for the
//! runtime kernel to apply.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    tessera-kernel-core                      │
//! │                                                             │
//! │   ┌──────────────────┐     ┌──────────────────┐             │
//! │   │     CapSpace     │     │   ObjectTable    │             │
//! │   │  tables: arena   │────▶│  KObject + refs  │             │
//! │   │  (table, sel)    │     └──────────────────┘             │
//! │   │  parent/child/   │     ┌──────────────────┐             │
//! │   │  sibling indices │────▶│  KernelMemory    │             │
//! │   └──────────────────┘     │  atomic quota    │             │
//! │                            └──────────────────┘             │
//! │   ┌──────────────────┐                                      │
//! │   │   Invariants     │  forest, quota, refcounts            │
//! │   └──────────────────┘                                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ Vec<Revoked>
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      tessera-kernel                         │
//! │   endpoint invalidation, context teardown, HAL access       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - `types` - ids, capability kinds, object sizes
//! - `error` - the kernel error taxonomy
//! - `kmem` - kernel memory quotas
//! - `object` - kernel objects and their reference counts
//! - `capability` - capability records and per-context tables
//! - `space` - the forest: create, obtain, revoke
//! - `invariants` - runtime-checkable invariants

#![no_std]
extern crate alloc;

pub mod capability;
pub mod error;
pub mod invariants;
pub mod kmem;
pub mod object;
pub mod space;
pub mod types;

pub use capability::{CapTable, Capability, MAX_SEL};
pub use error::KernelError;
pub use invariants::{check_all_invariants, InvariantViolation};
pub use kmem::KernelMemory;
pub use object::{KObject, ObjectTable};
pub use space::{CapSpace, Revoked};
pub use types::{CapKind, CapRef, ObjId, TableId, CAP_SIZE};
