//! Endpoint register file and message header layout.
//!
//! Every endpoint slot is three 64-bit registers. The top two bits of word 0
//! select the shape; the remaining bits are shape specific:
//!
//! ```text
//!            word 0                                        word 1                 word 2
//! SEND     | 01 | .. | msg_order:6 @32 | max:16 @16 | credits:16 | ctx:16 @16 | ep:16 | label
//! RECEIVE  | 10 | buf_order:6 @54 | msg_order:6 @48 | unread:16 @32 | rpos:16 @16 | wpos:16
//!                                                                 | buffer address  | occupied bitmap
//! MEMORY   | 11 | size:62                                          | base address    | ctx:16 @8 | perm:8
//! ```
//!
//! Message header (24 bytes, little-endian):
//!
//! ```text
//! flags:8 | sender_tile:8 | sender_ep:8 | reply_ep:8 | length:16 | sender_ctx:16 | label:64 | reply_label:64
//! ```

use bitflags::bitflags;

use crate::{CtxId, EpId, Label, Perm, TileId};

/// One endpoint register
pub type Reg = u64;

/// Registers per endpoint slot
pub const EP_REGS: usize = 3;

/// Size of a message header in bytes
pub const HEADER_SIZE: usize = 24;

/// Maximum number of message slots in one receive ring
pub const MAX_RB_SLOTS: usize = 64;

/// Largest payload the header's 16-bit length field can describe
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Largest supported buffer or message size class (log2 bytes)
pub const MAX_ORDER: u8 = 30;

/// Header value for "no reply endpoint"
pub const NO_EP: u8 = 0xFF;

const TYPE_SHIFT: u32 = 62;
const ORDER_MASK: u64 = 0x3F;
const U16_MASK: u64 = 0xFFFF;
const SIZE_MASK: u64 = (1 << TYPE_SHIFT) - 1;

/// Register contents of one endpoint slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct EpRegs(pub [Reg; EP_REGS]);

impl EpRegs {
    /// The all-zero (invalid) slot.
    pub const INVALID: EpRegs = EpRegs([0; EP_REGS]);

    /// Shape tag of word 0.
    pub fn ty(&self) -> EpType {
        EpType::from_bits(self.0[0] >> TYPE_SHIFT)
    }

    pub fn is_invalid(&self) -> bool {
        self.ty() == EpType::Invalid
    }
}

/// Shape tag of an endpoint slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EpType {
    Invalid = 0,
    Send = 1,
    Receive = 2,
    Memory = 3,
}

impl EpType {
    fn from_bits(bits: u64) -> Self {
        match bits & 0x3 {
            1 => EpType::Send,
            2 => EpType::Receive,
            3 => EpType::Memory,
            _ => EpType::Invalid,
        }
    }

    fn tag(self) -> u64 {
        (self as u64) << TYPE_SHIFT
    }
}

/// SEND shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendEp {
    /// Label delivered with every message
    pub label: Label,
    /// Receiving context
    pub target_ctx: CtxId,
    /// Receiving endpoint within the target context
    pub target_ep: EpId,
    /// Message size class (log2 of the maximum message size incl. header)
    pub msg_order: u8,
    /// Credits currently available
    pub credits: u16,
    /// Credits configured at installation; never exceeded
    pub max_credits: u16,
}

impl SendEp {
    pub fn new(target_ctx: CtxId, target_ep: EpId, label: Label, msg_order: u8, credits: u16) -> Self {
        Self {
            label,
            target_ctx,
            target_ep,
            msg_order,
            credits,
            max_credits: credits,
        }
    }

    /// Maximum payload that fits one message.
    pub fn max_payload(&self) -> usize {
        (1usize << self.msg_order)
            .saturating_sub(HEADER_SIZE)
            .min(MAX_PAYLOAD)
    }

    fn encode(&self) -> EpRegs {
        EpRegs([
            EpType::Send.tag()
                | ((self.msg_order as u64 & ORDER_MASK) << 32)
                | ((self.max_credits as u64) << 16)
                | self.credits as u64,
            ((self.target_ctx.0 as u64) << 16) | (self.target_ep as u64 & U16_MASK),
            self.label,
        ])
    }

    fn decode(regs: &EpRegs) -> Self {
        let [w0, w1, w2] = regs.0;
        Self {
            label: w2,
            target_ctx: CtxId(((w1 >> 16) & U16_MASK) as u16),
            target_ep: (w1 & U16_MASK) as EpId,
            msg_order: ((w0 >> 32) & ORDER_MASK) as u8,
            credits: (w0 & U16_MASK) as u16,
            max_credits: ((w0 >> 16) & U16_MASK) as u16,
        }
    }
}

/// RECEIVE shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecvEp {
    /// Address of the ring buffer in the owning context's memory
    pub buf_addr: u64,
    /// Buffer size class (log2 bytes)
    pub buf_order: u8,
    /// Message slot size class (log2 bytes)
    pub msg_order: u8,
    /// Messages written but not yet fetched
    pub unread: u16,
    /// Next slot to fetch
    pub rpos: u16,
    /// Next slot to write
    pub wpos: u16,
    /// Bit per slot holding a message that was not yet acknowledged
    pub occupied: u64,
}

impl RecvEp {
    pub fn new(buf_addr: u64, buf_order: u8, msg_order: u8) -> Self {
        Self {
            buf_addr,
            buf_order,
            msg_order,
            unread: 0,
            rpos: 0,
            wpos: 0,
            occupied: 0,
        }
    }

    /// Check size classes: header fits a slot, 1..=MAX_RB_SLOTS slots.
    pub fn orders_valid(buf_order: u8, msg_order: u8) -> bool {
        buf_order <= MAX_ORDER
            && msg_order <= buf_order
            && (1usize << msg_order) >= HEADER_SIZE
            && (1usize << (buf_order - msg_order)) <= MAX_RB_SLOTS
    }

    /// Number of message slots in the ring.
    pub fn slots(&self) -> usize {
        1usize << self.buf_order.saturating_sub(self.msg_order)
    }

    /// Maximum payload that fits one slot.
    pub fn max_payload(&self) -> usize {
        (1usize << self.msg_order)
            .saturating_sub(HEADER_SIZE)
            .min(MAX_PAYLOAD)
    }

    /// Whether `slot` still holds an unacknowledged message.
    pub fn is_occupied(&self, slot: usize) -> bool {
        slot < MAX_RB_SLOTS && self.occupied & (1 << slot) != 0
    }

    fn encode(&self) -> EpRegs {
        EpRegs([
            EpType::Receive.tag()
                | ((self.buf_order as u64 & ORDER_MASK) << 54)
                | ((self.msg_order as u64 & ORDER_MASK) << 48)
                | ((self.unread as u64) << 32)
                | ((self.rpos as u64) << 16)
                | self.wpos as u64,
            self.buf_addr,
            self.occupied,
        ])
    }

    fn decode(regs: &EpRegs) -> Self {
        let [w0, w1, w2] = regs.0;
        Self {
            buf_addr: w1,
            buf_order: ((w0 >> 54) & ORDER_MASK) as u8,
            msg_order: ((w0 >> 48) & ORDER_MASK) as u8,
            unread: ((w0 >> 32) & U16_MASK) as u16,
            rpos: ((w0 >> 16) & U16_MASK) as u16,
            wpos: (w0 & U16_MASK) as u16,
            occupied: w2,
        }
    }
}

/// MEMORY shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemEp {
    /// Context whose memory is accessed (`KERNEL_CTX` for a memory tile)
    pub target_ctx: CtxId,
    pub base: u64,
    pub size: u64,
    pub perm: Perm,
}

impl MemEp {
    fn encode(&self) -> EpRegs {
        EpRegs([
            EpType::Memory.tag() | (self.size & SIZE_MASK),
            self.base,
            ((self.target_ctx.0 as u64) << 8) | self.perm.bits() as u64,
        ])
    }

    fn decode(regs: &EpRegs) -> Self {
        let [w0, w1, w2] = regs.0;
        Self {
            target_ctx: CtxId(((w2 >> 8) & U16_MASK) as u16),
            base: w1,
            size: w0 & SIZE_MASK,
            perm: Perm::from_bits_truncate((w2 & 0xFF) as u8),
        }
    }
}

/// Decoded view of an endpoint slot. A slot has exactly one shape at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EpShape {
    Invalid,
    Send(SendEp),
    Receive(RecvEp),
    Memory(MemEp),
}

impl EpShape {
    /// Decode raw registers.
    pub fn from_regs(regs: &EpRegs) -> Self {
        match regs.ty() {
            EpType::Invalid => EpShape::Invalid,
            EpType::Send => EpShape::Send(SendEp::decode(regs)),
            EpType::Receive => EpShape::Receive(RecvEp::decode(regs)),
            EpType::Memory => EpShape::Memory(MemEp::decode(regs)),
        }
    }

    /// Encode into raw registers.
    pub fn to_regs(&self) -> EpRegs {
        match self {
            EpShape::Invalid => EpRegs::INVALID,
            EpShape::Send(s) => s.encode(),
            EpShape::Receive(r) => r.encode(),
            EpShape::Memory(m) => m.encode(),
        }
    }

    pub fn ty(&self) -> EpType {
        match self {
            EpShape::Invalid => EpType::Invalid,
            EpShape::Send(_) => EpType::Send,
            EpShape::Receive(_) => EpType::Receive,
            EpShape::Memory(_) => EpType::Memory,
        }
    }
}

// =============================================================================
// Message header
// =============================================================================

bitflags! {
    /// Header flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HeaderFlags: u8 {
        /// Message is a reply
        const REPLY = 1 << 0;
        /// Reply returns a credit to the original sender
        const GRANT_CREDITS = 1 << 1;
    }
}

/// Header written in front of every message in a receive ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub flags: HeaderFlags,
    pub sender_tile: TileId,
    /// Endpoint the message was sent from (credit return target)
    pub sender_ep: EpId,
    /// Endpoint replies go to, if any
    pub reply_ep: Option<EpId>,
    /// Payload length in bytes
    pub length: u16,
    pub sender_ctx: CtxId,
    /// Label of the send endpoint
    pub label: Label,
    /// Label the receiver echoes in its reply
    pub reply_label: Label,
}

impl Header {
    pub fn is_reply(&self) -> bool {
        self.flags.contains(HeaderFlags::REPLY)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut b = [0u8; HEADER_SIZE];
        b[0] = self.flags.bits();
        b[1] = self.sender_tile.0;
        b[2] = self.sender_ep as u8;
        b[3] = self.reply_ep.map(|ep| ep as u8).unwrap_or(NO_EP);
        b[4..6].copy_from_slice(&self.length.to_le_bytes());
        b[6..8].copy_from_slice(&self.sender_ctx.0.to_le_bytes());
        b[8..16].copy_from_slice(&self.label.to_le_bytes());
        b[16..24].copy_from_slice(&self.reply_label.to_le_bytes());
        b
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < HEADER_SIZE {
            return None;
        }
        let u64_at = |off: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&b[off..off + 8]);
            u64::from_le_bytes(raw)
        };
        Some(Self {
            flags: HeaderFlags::from_bits_truncate(b[0]),
            sender_tile: TileId(b[1]),
            sender_ep: b[2] as EpId,
            reply_ep: if b[3] == NO_EP { None } else { Some(b[3] as EpId) },
            length: u16::from_le_bytes([b[4], b[5]]),
            sender_ctx: CtxId(u16::from_le_bytes([b[6], b[7]])),
            label: u64_at(8),
            reply_label: u64_at(16),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_layout_is_bit_exact() {
        let s = SendEp::new(CtxId(5), 7, 0xDEAD, 8, 2);
        let regs = EpShape::Send(s).to_regs();
        assert_eq!(regs.0[0] >> 62, 1);
        assert_eq!(regs.0[0] & 0xFFFF, 2);
        assert_eq!((regs.0[0] >> 16) & 0xFFFF, 2);
        assert_eq!((regs.0[0] >> 32) & 0x3F, 8);
        assert_eq!(regs.0[1], (5 << 16) | 7);
        assert_eq!(regs.0[2], 0xDEAD);
        assert_eq!(EpShape::from_regs(&regs), EpShape::Send(s));
    }

    #[test]
    fn test_receive_layout_keeps_ring_state() {
        let mut r = RecvEp::new(0x4000, 9, 7);
        r.unread = 2;
        r.rpos = 1;
        r.wpos = 3;
        r.occupied = 0b110;
        let regs = EpShape::Receive(r).to_regs();
        assert_eq!(regs.ty(), EpType::Receive);
        assert_eq!(regs.0[1], 0x4000);
        match EpShape::from_regs(&regs) {
            EpShape::Receive(back) => {
                assert_eq!(back, r);
                assert_eq!(back.slots(), 4);
                assert!(back.is_occupied(2));
                assert!(!back.is_occupied(0));
            }
            other => panic!("unexpected shape {:?}", other),
        }
    }

    #[test]
    fn test_memory_layout() {
        let m = MemEp {
            target_ctx: CtxId(3),
            base: 0x10_0000,
            size: 0x2000,
            perm: Perm::RW,
        };
        let regs = EpShape::Memory(m).to_regs();
        assert_eq!(regs.ty(), EpType::Memory);
        assert_eq!(regs.0[2], (3 << 8) | 3);
        assert_eq!(EpShape::from_regs(&regs), EpShape::Memory(m));
    }

    #[test]
    fn test_zeroed_slot_is_invalid() {
        assert_eq!(EpShape::from_regs(&EpRegs::INVALID), EpShape::Invalid);
        assert!(EpRegs::default().is_invalid());
    }

    #[test]
    fn test_ring_order_validation() {
        assert!(RecvEp::orders_valid(9, 7));
        // header does not fit 16 bytes
        assert!(!RecvEp::orders_valid(8, 4));
        // 128 slots
        assert!(!RecvEp::orders_valid(12, 5));
        assert!(!RecvEp::orders_valid(6, 7));
    }

    #[test]
    fn test_payload_fits_header_length() {
        let small = SendEp::new(CtxId(1), 4, 0, 8, 1);
        assert_eq!(small.max_payload(), 256 - HEADER_SIZE);

        // large slots are limited by the 16-bit length field
        assert_eq!(SendEp::new(CtxId(1), 4, 0, 17, 1).max_payload(), MAX_PAYLOAD);
        assert_eq!(RecvEp::new(0, 17, 17).max_payload(), MAX_PAYLOAD);
    }

    #[test]
    fn test_header_bytes() {
        let h = Header {
            flags: HeaderFlags::REPLY | HeaderFlags::GRANT_CREDITS,
            sender_tile: TileId(2),
            sender_ep: 4,
            reply_ep: None,
            length: 300,
            sender_ctx: CtxId(0x0102),
            label: 0x1122334455667788,
            reply_label: 9,
        };
        let b = h.to_bytes();
        assert_eq!(b[0], 3);
        assert_eq!(b[3], NO_EP);
        assert_eq!(&b[4..6], &300u16.to_le_bytes());
        assert_eq!(Header::from_bytes(&b), Some(h));
        assert_eq!(Header::from_bytes(&b[..10]), None);
    }
}
