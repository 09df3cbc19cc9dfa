//! Kernel memory quotas.
//!
//! Every context pays for the kernel objects and capability records it
//! causes to exist. Quotas form a tree: deriving a quota moves bytes out of
//! the parent, dropping the derived quota moves them back.
//!
//! Charge and refund are lock-free so concurrent `obtain`/`revoke` on
//! different branches cannot lose an update.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::KernelError;

/// A kernel memory quota.
#[derive(Debug)]
pub struct KernelMemory {
    total: usize,
    left: AtomicUsize,
    /// Bytes currently handed to derived quotas
    derived: AtomicUsize,
    parent: Option<Arc<KernelMemory>>,
}

impl KernelMemory {
    /// A quota not backed by any other (the root context's).
    pub fn new_root(total: usize) -> Arc<Self> {
        Arc::new(Self {
            total,
            left: AtomicUsize::new(total),
            derived: AtomicUsize::new(0),
            parent: None,
        })
    }

    /// Split `quota` bytes off `self` into a new child quota.
    pub fn derive(self: &Arc<Self>, quota: usize) -> Result<Arc<Self>, KernelError> {
        self.alloc(quota)?;
        self.derived.fetch_add(quota, Ordering::SeqCst);
        Ok(Arc::new(Self {
            total: quota,
            left: AtomicUsize::new(quota),
            derived: AtomicUsize::new(0),
            parent: Some(Arc::clone(self)),
        }))
    }

    /// Charge `size` bytes. Fails without side effect if not enough is left.
    pub fn alloc(&self, size: usize) -> Result<(), KernelError> {
        self.left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(size))
            .map(|_| ())
            .map_err(|_| KernelError::OutOfKernelMemory)
    }

    /// Refund `size` bytes previously charged.
    pub fn free(&self, size: usize) {
        let before = self.left.fetch_add(size, Ordering::SeqCst);
        debug_assert!(before + size <= self.total, "kernel memory over-refunded");
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn left(&self) -> usize {
        self.left.load(Ordering::SeqCst)
    }

    pub fn consumed(&self) -> usize {
        self.total - self.left()
    }

    pub fn derived(&self) -> usize {
        self.derived.load(Ordering::SeqCst)
    }

    pub fn parent(&self) -> Option<&Arc<KernelMemory>> {
        self.parent.as_ref()
    }
}

impl Drop for KernelMemory {
    fn drop(&mut self) {
        if let Some(parent) = &self.parent {
            debug_assert_eq!(self.consumed(), 0, "dropping kernel memory still in use");
            parent.derived.fetch_sub(self.total, Ordering::SeqCst);
            parent.free(self.total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_free() {
        let km = KernelMemory::new_root(100);
        km.alloc(60).unwrap();
        assert_eq!(km.left(), 40);
        assert_eq!(km.alloc(41), Err(KernelError::OutOfKernelMemory));
        // failed charge changed nothing
        assert_eq!(km.left(), 40);
        km.free(60);
        assert_eq!(km.consumed(), 0);
    }

    #[test]
    fn test_derive_moves_quota() {
        let root = KernelMemory::new_root(1000);
        let child = root.derive(300).unwrap();
        assert_eq!(root.left(), 700);
        assert_eq!(root.derived(), 300);
        assert_eq!(child.total(), 300);
        assert_eq!(child.left(), 300);
        assert_eq!(root.derive(701).err(), Some(KernelError::OutOfKernelMemory));
    }

    #[test]
    fn test_drop_refunds_parent() {
        let root = KernelMemory::new_root(1000);
        let child = root.derive(400).unwrap();
        let grandchild = child.derive(100).unwrap();
        drop(grandchild);
        assert_eq!(child.left(), 400);
        drop(child);
        assert_eq!(root.left(), 1000);
        assert_eq!(root.derived(), 0);
    }
}
