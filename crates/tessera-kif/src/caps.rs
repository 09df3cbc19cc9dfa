//! Capability range descriptors and permission bits.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::CapSel;

/// Which of a context's two capability tables a selector refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CapType {
    /// Object capability table
    Object = 0,
    /// Mapping capability table (selectors are virtual page numbers)
    Mapping = 1,
}

const COUNT_BITS: u32 = 32;
const START_SHIFT: u32 = 1 + COUNT_BITS;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;

/// Largest start selector a descriptor can carry.
pub const MAX_RANGE_START: CapSel = (1 << (64 - START_SHIFT)) - 1;

/// A contiguous half-open run of selectors `[start, start + count)` in one table.
///
/// Wire format (one word): `start << 33 | count << 1 | type`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapRngDesc {
    ty: CapType,
    start: CapSel,
    count: u64,
}

impl CapRngDesc {
    /// Describe `count` selectors starting at `start`.
    pub fn new(ty: CapType, start: CapSel, count: u64) -> Self {
        Self { ty, start, count }
    }

    /// Describe one object selector.
    pub fn one(start: CapSel) -> Self {
        Self::new(CapType::Object, start, 1)
    }

    pub fn ty(&self) -> CapType {
        self.ty
    }

    pub fn start(&self) -> CapSel {
        self.start
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// One past the last selector.
    pub fn end(&self) -> CapSel {
        self.start.saturating_add(self.count)
    }

    /// Whether `sel` falls inside the range.
    pub fn contains(&self, sel: CapSel) -> bool {
        sel >= self.start && sel < self.end()
    }

    /// Encode as a single syscall operand word.
    ///
    /// Returns `None` if start or count do not fit the wire format.
    pub fn to_raw(&self) -> Option<u64> {
        if self.start > MAX_RANGE_START || self.count > COUNT_MASK {
            return None;
        }
        Some((self.start << START_SHIFT) | (self.count << 1) | self.ty as u64)
    }

    /// Decode a syscall operand word.
    pub fn from_raw(raw: u64) -> Self {
        let ty = if raw & 1 == 0 {
            CapType::Object
        } else {
            CapType::Mapping
        };
        Self {
            ty,
            start: raw >> START_SHIFT,
            count: (raw >> 1) & COUNT_MASK,
        }
    }
}

bitflags! {
    /// Access permissions for memory endpoints and mappings.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Perm: u8 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
        const RW = Self::R.bits() | Self::W.bits();
        const RWX = Self::RW.bits() | Self::X.bits();
    }
}
