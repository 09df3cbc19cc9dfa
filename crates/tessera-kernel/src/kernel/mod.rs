//! The kernel state machine.
//!
//! `Kernel<H>` owns everything: the capability space, the contexts, the
//! tiles and the waiters. Operations are split by concern:
//!
//! - [`ipc`]: send, fetch, receive, reply, ack, memory access
//! - [`gates`]: object creation and endpoint activation
//! - [`caps`]: exchange, revoke, and applying revoke side effects
//! - [`lifecycle`]: context creation, scheduling, stop and teardown
//! - [`syscall`]: executing decoded syscalls
//!
//! Every operation takes the acting context explicitly; there is no
//! "current context" inside the kernel.

mod caps;
mod gates;
mod ipc;
mod lifecycle;
mod syscall;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use tessera_hal::HAL;
use tessera_kif::{
    CapSel, CapType, CtxId, EpId, EpShape, RecvEp, TileId, FIRST_FREE_SEL, KERNEL_CTX, KSYS_REP,
};
use tessera_kernel_core::{
    check_all_invariants, CapKind, CapRef, CapSpace, InvariantViolation, KObject, KernelError,
    KernelMemory, TableId,
};

use crate::config::KernelConfig;
use crate::context::{CtxState, ExecutionContext, Tile};
use crate::epfile::{EndpointRegisters, TileEps};
use crate::tcu::Rings;
use crate::thread::ThreadManager;

/// The kernel.
pub struct Kernel<H: HAL> {
    hal: H,
    config: KernelConfig,
    space: CapSpace,
    contexts: BTreeMap<CtxId, ExecutionContext>,
    tiles: BTreeMap<TileId, Tile>,
    /// Tile backing memory capabilities
    mem_tile: Option<TileId>,
    pub(crate) threads: ThreadManager,
    /// Deliveries into saved state, one entry per message
    forwards: VecDeque<CtxId>,
    next_ctx: u16,
    /// Next free selector in the kernel's own table
    next_kernel_sel: CapSel,
}

impl<H: HAL> Kernel<H> {
    /// Enumerate tiles and set up the kernel pseudo-context with its
    /// syscall ring.
    pub fn new(hal: H, config: KernelConfig) -> Result<Self, KernelError> {
        let descs = hal.tiles();
        if !descs.iter().any(|t| t.runs_contexts()) {
            return Err(KernelError::NotSupported);
        }
        if !RecvEp::orders_valid(config.syscall_buf_order(), config.syscall_msg_order) {
            return Err(KernelError::InvalidArgs);
        }
        let mem_tile = descs.iter().find(|t| t.is_memory()).map(|t| t.id);
        let tiles = descs.into_iter().map(|d| (d.id, Tile::new(d))).collect();

        let mut space = CapSpace::new();
        let ktable = space.create_table(None, CapType::Object, None);
        let kmap = space.create_table(None, CapType::Mapping, None);

        let mut kctx =
            ExecutionContext::new(KERNEL_CTX, TileId(0), ktable, kmap, KernelMemory::new_root(0));
        kctx.state = CtxState::Running;
        let ring = RecvEp::new(0, config.syscall_buf_order(), config.syscall_msg_order);
        kctx.eps
            .write_slot(KSYS_REP, EpShape::Receive(ring).to_regs())?;
        kctx.rings.install(KSYS_REP, ring.slots());
        kctx.mark_ep(KSYS_REP);

        let mut contexts = BTreeMap::new();
        contexts.insert(KERNEL_CTX, kctx);

        hal.debug_write("tessera: kernel up");
        log::info!(
            target: "ctx",
            "kernel up: {} syscall slots, memory tile {:?}",
            ring.slots(),
            mem_tile.map(|t| t.0)
        );

        Ok(Self {
            hal,
            config,
            space,
            contexts,
            tiles,
            mem_tile,
            threads: ThreadManager::new(),
            forwards: VecDeque::new(),
            next_ctx: KERNEL_CTX.0 + 1,
            next_kernel_sel: FIRST_FREE_SEL,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn space(&self) -> &CapSpace {
        &self.space
    }

    pub fn context(&self, id: CtxId) -> Option<&ExecutionContext> {
        self.contexts.get(&id)
    }

    pub fn contexts(&self) -> impl Iterator<Item = &ExecutionContext> {
        self.contexts.values()
    }

    pub fn tile(&self, id: TileId) -> Option<&Tile> {
        self.tiles.get(&id)
    }

    pub fn tiles(&self) -> impl Iterator<Item = &Tile> {
        self.tiles.values()
    }

    pub fn mem_tile(&self) -> Option<TileId> {
        self.mem_tile
    }

    /// Table holding kernel-owned capabilities.
    pub fn kernel_table(&self) -> TableId {
        self.contexts
            .get(&KERNEL_CTX)
            .map(|k| k.obj_table)
            .unwrap_or(TableId(0))
    }

    /// Number of parked syscalls.
    pub fn blocked_syscalls(&self) -> usize {
        self.threads.blocked_count()
    }

    /// Whether a receiver sleeping on `(ctx, ep)` was woken since it slept.
    pub fn take_wakeup(&mut self, ctx: CtxId, ep: EpId) -> bool {
        self.threads.take_wakeup(ctx, ep)
    }

    /// Capability invariants plus the kernel's own bookkeeping.
    pub fn check_invariants(&self) -> Vec<InvariantViolation> {
        let mut v = check_all_invariants(&self.space);

        for tile in self.tiles.values() {
            if let Some(cur) = tile.current {
                let ok = self
                    .contexts
                    .get(&cur)
                    .is_some_and(|c| c.state == CtxState::Running && c.tile == tile.desc.id);
                if !ok {
                    v.push(InvariantViolation {
                        invariant: "scheduling",
                        description: alloc::format!(
                            "tile {} runs ctx {} which is not running there",
                            tile.desc.id.0,
                            cur.0
                        ),
                    });
                }
            }
        }
        for c in self.contexts.values() {
            if c.regs_on_tile() && self.tiles.get(&c.tile).and_then(|t| t.current) != Some(c.id) {
                v.push(InvariantViolation {
                    invariant: "scheduling",
                    description: alloc::format!("ctx {} running but not current", c.id.0),
                });
            }
        }

        for (id, obj) in self.space.objects().iter() {
            if let KObject::RecvGate {
                bound: Some((ctx, ep)),
                ..
            } = obj
            {
                let bound_here = self
                    .contexts
                    .get(ctx)
                    .and_then(|c| c.bindings.get(*ep).copied().flatten())
                    .is_some_and(|b| b.obj == id);
                if !bound_here {
                    v.push(InvariantViolation {
                        invariant: "bindings",
                        description: alloc::format!(
                            "receive gate {} claims ctx {} ep {} which does not name it",
                            id.0,
                            ctx.0,
                            ep
                        ),
                    });
                }
            }
        }

        v
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    /// A context that exists (it may be DEAD).
    pub(crate) fn ctx(&self, id: CtxId) -> Result<&ExecutionContext, KernelError> {
        self.contexts.get(&id).ok_or(KernelError::ContextDead)
    }

    pub(crate) fn ctx_mut(&mut self, id: CtxId) -> Result<&mut ExecutionContext, KernelError> {
        self.contexts.get_mut(&id).ok_or(KernelError::ContextDead)
    }

    /// A context that has not stopped.
    pub(crate) fn alive(&self, id: CtxId) -> Result<&ExecutionContext, KernelError> {
        let c = self.ctx(id)?;
        c.check_alive()?;
        Ok(c)
    }

    /// Run `f` against the live endpoint registers of `ctx`, wherever they are.
    pub(crate) fn with_eps<R>(
        &mut self,
        ctx: CtxId,
        f: impl FnOnce(&mut dyn EndpointRegisters, &mut Rings) -> Result<R, KernelError>,
    ) -> Result<R, KernelError> {
        let Kernel { hal, contexts, .. } = self;
        let c = contexts.get_mut(&ctx).ok_or(KernelError::ContextDead)?;
        if c.regs_on_tile() {
            let mut regs = TileEps::new(&*hal, c.tile);
            f(&mut regs, &mut c.rings)
        } else {
            f(&mut c.eps, &mut c.rings)
        }
    }

    /// Current shape of an endpoint slot.
    pub fn ep_shape(&mut self, ctx: CtxId, ep: EpId) -> Result<EpShape, KernelError> {
        self.with_eps(ctx, |regs, _| Ok(EpShape::from_regs(&regs.read_slot(ep)?)))
    }

    /// Resolve an execution context capability of `caller`.
    pub(crate) fn resolve_ctx(
        &self,
        caller: CtxId,
        sel: CapSel,
    ) -> Result<(CtxId, CapRef), KernelError> {
        let table = self.ctx(caller)?.obj_table;
        let cap = self.space.lookup_kind(table, sel, CapKind::ExecutionContext)?;
        match self.space.object(cap.obj) {
            Some(KObject::Context { ctx }) => Ok((*ctx, cap.cap_ref())),
            _ => Err(KernelError::CapabilityGone),
        }
    }

    /// Allocate a selector in the kernel's table.
    pub(crate) fn alloc_kernel_sel(&mut self) -> CapSel {
        let sel = self.next_kernel_sel;
        self.next_kernel_sel += 1;
        sel
    }

    pub(crate) fn alloc_ctx_id(&mut self) -> Result<CtxId, KernelError> {
        if self.contexts.len() >= self.config.max_contexts {
            return Err(KernelError::OutOfKernelMemory);
        }
        let start = self.next_ctx;
        loop {
            let id = CtxId(self.next_ctx);
            self.next_ctx = self.next_ctx.checked_add(1).unwrap_or(KERNEL_CTX.0 + 1);
            if !self.contexts.contains_key(&id) && id != KERNEL_CTX {
                return Ok(id);
            }
            if self.next_ctx == start {
                return Err(KernelError::OutOfKernelMemory);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_hal::TileKind;
    use tessera_hal_mock::{SimHal, DEFAULT_MEM_SIZE};
    use tessera_kif::{Perm, SEL_KMEM, SEL_MEM};

    fn kernel(kinds: &[TileKind], config: KernelConfig) -> (Kernel<SimHal>, CtxId) {
        let mut k = Kernel::new(SimHal::with_tiles(kinds, DEFAULT_MEM_SIZE), config).unwrap();
        let root = k.create_root().unwrap();
        (k, root)
    }

    #[test]
    fn test_new_needs_a_context_tile() {
        let hal = SimHal::with_tiles(&[TileKind::Memory], DEFAULT_MEM_SIZE);
        assert_eq!(
            Kernel::new(hal, KernelConfig::default()).err(),
            Some(KernelError::NotSupported)
        );
    }

    #[test]
    fn test_root_owns_all_memory() {
        let (k, root) = kernel(
            &[TileKind::Compute, TileKind::Memory],
            KernelConfig::default(),
        );
        let table = k.context(root).unwrap().obj_table;
        let cap = k
            .space()
            .lookup_kind(table, SEL_MEM, CapKind::MemoryRegion)
            .unwrap();
        match k.space().object(cap.obj) {
            Some(KObject::MemoryRegion { size, perm, .. }) => {
                assert_eq!(*size, DEFAULT_MEM_SIZE);
                assert_eq!(*perm, Perm::RWX);
            }
            other => panic!("unexpected object {:?}", other),
        }
        assert!(k.check_invariants().is_empty());
    }

    #[test]
    fn test_context_limit() {
        // the kernel and the root fill both slots
        let (mut k, root) = kernel(
            &[TileKind::Compute, TileKind::Memory],
            KernelConfig::default().with_max_contexts(2),
        );
        k.derive_kmem(root, 17, SEL_KMEM, 64 * 1024).unwrap();
        assert_eq!(
            k.create_context(root, 16, 17, None).err(),
            Some(KernelError::OutOfKernelMemory)
        );
        assert_eq!(k.contexts().count(), 2);
        assert!(k.check_invariants().is_empty());
    }

    #[test]
    fn test_no_mappings_without_virtual_memory() {
        let (mut k, root) = kernel(
            &[TileKind::Compute, TileKind::Accelerator, TileKind::Memory],
            KernelConfig::default(),
        );
        k.derive_kmem(root, 17, SEL_KMEM, 64 * 1024).unwrap();
        let (acc, tile) = k.create_context(root, 16, 17, Some(TileId(1))).unwrap();
        assert_eq!(tile, TileId(1));

        k.derive_mgate(root, 20, SEL_MEM, 0, 0x2000, Perm::RW).unwrap();
        assert_eq!(
            k.create_map(acc, 0x10, SEL_MEM, 0, 1, Perm::R).err(),
            Some(KernelError::NotSupported)
        );

        // a context with mappings cannot move onto the accelerator
        k.create_map(root, 0x10, 20, 0, 1, Perm::R).unwrap();
        assert_eq!(k.migrate(root, TileId(1)), Err(KernelError::NotSupported));
        assert_eq!(k.context(root).unwrap().tile, TileId(0));
        assert!(k.check_invariants().is_empty());
    }

    #[test]
    fn test_syscall_ring_belongs_to_kernel() {
        let (mut k, _) = kernel(
            &[TileKind::Compute, TileKind::Memory],
            KernelConfig::default(),
        );
        match k.ep_shape(KERNEL_CTX, KSYS_REP).unwrap() {
            EpShape::Receive(r) => assert_eq!(r.slots(), 1 << k.config().syscall_slots_order),
            other => panic!("unexpected shape {:?}", other),
        }
        assert_eq!(k.kernel_table(), k.context(KERNEL_CTX).unwrap().obj_table);
    }
}
