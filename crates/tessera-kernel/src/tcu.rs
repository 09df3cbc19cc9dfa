//! The message protocol, independent of where the registers live.
//!
//! # Receive ring
//!
//! ```text
//!          rpos           wpos
//!           │               │
//!   ┌─────┬─▼───┬─────┬─────▼─┬─────┐
//!   │ ack'd│ new │ new │ free  │ ... │   occupied: slot holds a message
//!   └─────┴─────┴─────┴───────┴─────┘   unread:   written, not fetched
//! ```
//!
//! A message occupies its slot from delivery until it is replied to or
//! acknowledged. Writing into an occupied slot fails with `Busy`; the sender
//! keeps its credit in that case.
//!
//! # Credits
//!
//! A send takes one credit from the SEND endpoint. Replying to (or
//! acknowledging) a message gives it back, never beyond the count the
//! endpoint was configured with.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use tessera_kif::{CtxId, EpId, EpShape, Header, RecvEp, SendEp};
use tessera_kernel_core::KernelError;

use crate::epfile::EndpointRegisters;

/// Where a fetched message sits: endpoint, ring slot and delivery number.
///
/// The sequence number tells a stale handle (already replied or acked) from
/// a new message that reused the slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsgPos {
    pub ep: EpId,
    pub slot: usize,
    pub seq: u64,
}

/// A fetched message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub data: Vec<u8>,
    pub pos: MsgPos,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Stored {
    header: Header,
    data: Vec<u8>,
    seq: u64,
}

/// Contents of one receive ring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ring {
    slots: Vec<Option<Stored>>,
    next_seq: u64,
}

impl Ring {
    fn new(slots: usize) -> Self {
        Self {
            slots: vec![None; slots],
            next_seq: 0,
        }
    }
}

/// Ring buffers of one context, keyed by receive endpoint.
///
/// They are part of the context's memory and travel with it on migration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rings {
    rings: BTreeMap<EpId, Ring>,
}

impl Rings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an empty ring for `ep`, replacing any previous one.
    pub fn install(&mut self, ep: EpId, slots: usize) {
        self.rings.insert(ep, Ring::new(slots));
    }

    pub fn remove(&mut self, ep: EpId) {
        self.rings.remove(&ep);
    }

    pub fn clear(&mut self) {
        self.rings.clear();
    }

    pub fn contains(&self, ep: EpId) -> bool {
        self.rings.contains_key(&ep)
    }
}

fn send_shape<R: EndpointRegisters + ?Sized>(regs: &R, ep: EpId) -> Result<SendEp, KernelError> {
    match EpShape::from_regs(&regs.read_slot(ep)?) {
        EpShape::Send(s) => Ok(s),
        _ => Err(KernelError::EndpointInvalid),
    }
}

fn recv_shape<R: EndpointRegisters + ?Sized>(regs: &R, ep: EpId) -> Result<RecvEp, KernelError> {
    match EpShape::from_regs(&regs.read_slot(ep)?) {
        EpShape::Receive(r) => Ok(r),
        _ => Err(KernelError::EndpointInvalid),
    }
}

/// Take one credit for a message of `len` payload bytes.
///
/// Returns the endpoint as it was before the credit was taken.
pub fn take_credit<R: EndpointRegisters + ?Sized>(
    regs: &mut R,
    ep: EpId,
    len: usize,
) -> Result<SendEp, KernelError> {
    let mut s = send_shape(regs, ep)?;
    if len > s.max_payload() {
        return Err(KernelError::InvalidArgs);
    }
    if s.credits == 0 {
        return Err(KernelError::NoCredits);
    }
    let before = s;
    s.credits -= 1;
    regs.write_slot(ep, EpShape::Send(s).to_regs())?;
    Ok(before)
}

/// Give one credit back to the SEND endpoint `ep`, if it still points at
/// `target`. Returns whether a credit was added.
pub fn return_credit<R: EndpointRegisters + ?Sized>(
    regs: &mut R,
    ep: EpId,
    target: (CtxId, EpId),
) -> Result<bool, KernelError> {
    let mut s = send_shape(regs, ep)?;
    if (s.target_ctx, s.target_ep) != target {
        return Err(KernelError::EndpointInvalid);
    }
    if s.credits >= s.max_credits {
        return Ok(false);
    }
    s.credits += 1;
    regs.write_slot(ep, EpShape::Send(s).to_regs())?;
    Ok(true)
}

/// Write a message into the next ring slot of RECEIVE endpoint `ep`.
pub fn deliver<R: EndpointRegisters + ?Sized>(
    regs: &mut R,
    rings: &mut Rings,
    ep: EpId,
    header: Header,
    data: &[u8],
) -> Result<(), KernelError> {
    let mut r = recv_shape(regs, ep)?;
    if data.len() > r.max_payload() {
        return Err(KernelError::InvalidArgs);
    }
    let slot = r.wpos as usize;
    if r.is_occupied(slot) {
        return Err(KernelError::Busy);
    }
    let ring = rings.rings.get_mut(&ep).ok_or(KernelError::EndpointInvalid)?;
    if slot >= ring.slots.len() {
        return Err(KernelError::EndpointInvalid);
    }

    r.occupied |= 1 << slot;
    r.wpos = ((slot + 1) % r.slots()) as u16;
    r.unread += 1;
    regs.write_slot(ep, EpShape::Receive(r).to_regs())?;

    let seq = ring.next_seq;
    ring.next_seq += 1;
    ring.slots[slot] = Some(Stored {
        header,
        data: data.to_vec(),
        seq,
    });
    Ok(())
}

/// Fetch the oldest unread message of `ep`, if any. The slot stays occupied.
pub fn fetch<R: EndpointRegisters + ?Sized>(
    regs: &mut R,
    rings: &Rings,
    ep: EpId,
) -> Result<Option<Message>, KernelError> {
    let mut r = recv_shape(regs, ep)?;
    if r.unread == 0 {
        return Ok(None);
    }
    let slot = r.rpos as usize;
    let stored = rings
        .rings
        .get(&ep)
        .and_then(|ring| ring.slots.get(slot))
        .and_then(|s| s.as_ref())
        .ok_or(KernelError::EndpointInvalid)?;

    r.rpos = ((slot + 1) % r.slots()) as u16;
    r.unread -= 1;
    regs.write_slot(ep, EpShape::Receive(r).to_regs())?;

    Ok(Some(Message {
        header: stored.header,
        data: stored.data.clone(),
        pos: MsgPos {
            ep,
            slot,
            seq: stored.seq,
        },
    }))
}

/// Check that `pos` still names an occupied slot without changing anything.
pub fn check_held<R: EndpointRegisters + ?Sized>(
    regs: &R,
    rings: &Rings,
    pos: MsgPos,
) -> Result<Header, KernelError> {
    let r = recv_shape(regs, pos.ep)?;
    let stored = rings
        .rings
        .get(&pos.ep)
        .and_then(|ring| ring.slots.get(pos.slot))
        .and_then(|s| s.as_ref());
    match stored {
        Some(s) if r.is_occupied(pos.slot) && s.seq == pos.seq => Ok(s.header),
        _ => Err(KernelError::InvalidArgs),
    }
}

/// Free the slot of a fetched message. Fails with `InvalidArgs` if the
/// message was already released.
pub fn release<R: EndpointRegisters + ?Sized>(
    regs: &mut R,
    rings: &mut Rings,
    pos: MsgPos,
) -> Result<Header, KernelError> {
    let header = check_held(regs, rings, pos)?;
    let mut r = recv_shape(regs, pos.ep)?;
    r.occupied &= !(1 << pos.slot);
    regs.write_slot(pos.ep, EpShape::Receive(r).to_regs())?;
    if let Some(ring) = rings.rings.get_mut(&pos.ep) {
        ring.slots[pos.slot] = None;
    }
    Ok(header)
}

/// Messages delivered to `ep` and not yet fetched.
pub fn unread<R: EndpointRegisters + ?Sized>(regs: &R, ep: EpId) -> Result<u16, KernelError> {
    Ok(recv_shape(regs, ep)?.unread)
}

/// Whether `ep` has messages in flight: unread or unacknowledged ones on a
/// RECEIVE endpoint, replies still owed to a SEND endpoint.
pub fn has_messages<R: EndpointRegisters + ?Sized>(regs: &R, ep: EpId) -> Result<bool, KernelError> {
    match EpShape::from_regs(&regs.read_slot(ep)?) {
        EpShape::Receive(r) => Ok(r.unread > 0 || r.occupied != 0),
        EpShape::Send(s) => Ok(s.credits < s.max_credits),
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epfile::SavedEps;
    use tessera_kif::{HeaderFlags, TileId};

    const SEP: EpId = 3;
    const REP: EpId = 4;

    fn header(len: usize) -> Header {
        Header {
            flags: HeaderFlags::empty(),
            sender_tile: TileId(0),
            sender_ep: SEP,
            reply_ep: None,
            length: len as u16,
            sender_ctx: CtxId(1),
            label: 0,
            reply_label: 0,
        }
    }

    /// Send endpoint with `credits`, receive ring with `slots` slots of 64 bytes.
    fn setup(credits: u16, slots_order: u8) -> (SavedEps, Rings) {
        let mut eps = SavedEps::new();
        let mut rings = Rings::new();
        eps.write_slot(SEP, EpShape::Send(SendEp::new(CtxId(1), REP, 7, 6, credits)).to_regs())
            .unwrap();
        let r = RecvEp::new(0x1000, 6 + slots_order, 6);
        eps.write_slot(REP, EpShape::Receive(r).to_regs()).unwrap();
        rings.install(REP, r.slots());
        (eps, rings)
    }

    fn credits(eps: &SavedEps) -> u16 {
        send_shape(eps, SEP).unwrap().credits
    }

    #[test]
    fn test_credit_exhaustion() {
        let (mut eps, _) = setup(2, 2);
        take_credit(&mut eps, SEP, 8).unwrap();
        take_credit(&mut eps, SEP, 8).unwrap();
        assert_eq!(take_credit(&mut eps, SEP, 8), Err(KernelError::NoCredits));
        assert_eq!(credits(&eps), 0);
    }

    #[test]
    fn test_oversized_message_keeps_credit() {
        let (mut eps, _) = setup(1, 2);
        assert_eq!(take_credit(&mut eps, SEP, 64), Err(KernelError::InvalidArgs));
        assert_eq!(credits(&eps), 1);
    }

    #[test]
    fn test_return_credit_caps_at_max() {
        let (mut eps, _) = setup(2, 2);
        take_credit(&mut eps, SEP, 0).unwrap();
        assert_eq!(return_credit(&mut eps, SEP, (CtxId(1), REP)), Ok(true));
        assert_eq!(return_credit(&mut eps, SEP, (CtxId(1), REP)), Ok(false));
        assert_eq!(credits(&eps), 2);
        assert_eq!(
            return_credit(&mut eps, SEP, (CtxId(2), REP)),
            Err(KernelError::EndpointInvalid)
        );
    }

    #[test]
    fn test_fetch_in_arrival_order_and_wrap() {
        let (mut eps, mut rings) = setup(8, 1);
        for round in 0u8..3 {
            deliver(&mut eps, &mut rings, REP, header(1), &[round]).unwrap();
            let m = fetch(&mut eps, &rings, REP).unwrap().unwrap();
            assert_eq!(m.data, [round]);
            release(&mut eps, &mut rings, m.pos).unwrap();
        }
        assert_eq!(fetch(&mut eps, &rings, REP).unwrap(), None);
    }

    #[test]
    fn test_full_ring_is_busy() {
        let (mut eps, mut rings) = setup(8, 1);
        deliver(&mut eps, &mut rings, REP, header(0), &[]).unwrap();
        deliver(&mut eps, &mut rings, REP, header(0), &[]).unwrap();
        assert_eq!(
            deliver(&mut eps, &mut rings, REP, header(0), &[]),
            Err(KernelError::Busy)
        );
        assert_eq!(unread(&eps, REP), Ok(2));
    }

    #[test]
    fn test_fetched_but_unacked_slot_stays_occupied() {
        let (mut eps, mut rings) = setup(8, 0);
        deliver(&mut eps, &mut rings, REP, header(0), &[]).unwrap();
        let m = fetch(&mut eps, &rings, REP).unwrap().unwrap();
        assert_eq!(
            deliver(&mut eps, &mut rings, REP, header(0), &[]),
            Err(KernelError::Busy)
        );
        release(&mut eps, &mut rings, m.pos).unwrap();
        deliver(&mut eps, &mut rings, REP, header(0), &[]).unwrap();
    }

    #[test]
    fn test_double_release_is_rejected() {
        let (mut eps, mut rings) = setup(8, 0);
        deliver(&mut eps, &mut rings, REP, header(0), &[]).unwrap();
        let first = fetch(&mut eps, &rings, REP).unwrap().unwrap();
        release(&mut eps, &mut rings, first.pos).unwrap();
        assert_eq!(
            release(&mut eps, &mut rings, first.pos),
            Err(KernelError::InvalidArgs)
        );

        // the slot is reused by a new message; the old handle stays stale
        deliver(&mut eps, &mut rings, REP, header(0), &[]).unwrap();
        let second = fetch(&mut eps, &rings, REP).unwrap().unwrap();
        assert_eq!(second.pos.slot, first.pos.slot);
        assert_eq!(
            release(&mut eps, &mut rings, first.pos),
            Err(KernelError::InvalidArgs)
        );
        release(&mut eps, &mut rings, second.pos).unwrap();
    }

    #[test]
    fn test_sender_waiting_for_reply_has_messages() {
        let (mut eps, _) = setup(2, 2);
        assert_eq!(has_messages(&eps, SEP), Ok(false));
        take_credit(&mut eps, SEP, 8).unwrap();
        assert_eq!(has_messages(&eps, SEP), Ok(true));
        return_credit(&mut eps, SEP, (CtxId(1), REP)).unwrap();
        assert_eq!(has_messages(&eps, SEP), Ok(false));
    }

    #[test]
    fn test_wrong_shapes() {
        let (mut eps, mut rings) = setup(1, 0);
        assert_eq!(
            take_credit(&mut eps, REP, 0),
            Err(KernelError::EndpointInvalid)
        );
        assert_eq!(
            deliver(&mut eps, &mut rings, SEP, header(0), &[]),
            Err(KernelError::EndpointInvalid)
        );
        assert_eq!(fetch(&mut eps, &rings, 9), Err(KernelError::EndpointInvalid));
        assert_eq!(has_messages(&eps, SEP), Ok(false));
    }
}
