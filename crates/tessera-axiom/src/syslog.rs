//! Syscall audit log.
//!
//! ```text
//!   id 0  Request  ctx 1  CTX_WAIT   ──┐  open while ctx 1 is blocked
//!   id 1  Request  ctx 2  NOOP       ─┐│
//!   id 2  Response ctx 2  req 1  ok  ◀┘│
//!   id 3  Response ctx 1  req 0  ok  ◀─┘
//! ```
//!
//! Ids are assigned in order and never reused, also after old entries have
//! been dropped to stay within capacity.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};
use tessera_kif::CtxId;

/// Position of an entry in the log.
pub type EventId = u64;

/// One log entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SysEvent {
    pub id: EventId,
    /// Context that issued the syscall
    pub sender: CtxId,
    /// Nanoseconds since boot
    pub timestamp: u64,
    pub event_type: SysEventType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SysEventType {
    /// A decoded request: opcode and the first four operand words
    Request { opcode: u64, args: [u64; 4] },
    /// The reply to `request_id`; `code` 0 is success
    Response { request_id: EventId, code: u64 },
}

/// Default number of entries kept.
pub const MAX_SYSLOG_EVENTS: usize = 10000;

/// Bounded, append-only syscall log.
pub struct SysLog {
    events: Vec<SysEvent>,
    capacity: usize,
    next_id: EventId,
    /// Requests without a response, by id
    open: BTreeMap<EventId, CtxId>,
}

impl SysLog {
    pub fn new() -> Self {
        Self::with_capacity(MAX_SYSLOG_EVENTS)
    }

    /// A log keeping at most `capacity` entries (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::new(),
            capacity: capacity.max(1),
            next_id: 0,
            open: BTreeMap::new(),
        }
    }

    /// Record a request. The returned id is what its response refers to.
    pub fn log_request(
        &mut self,
        sender: CtxId,
        opcode: u64,
        args: [u64; 4],
        timestamp: u64,
    ) -> EventId {
        let id = self.append(sender, timestamp, SysEventType::Request { opcode, args });
        self.open.insert(id, sender);
        id
    }

    pub fn log_response(&mut self, sender: CtxId, request_id: EventId, code: u64, timestamp: u64) {
        self.open.remove(&request_id);
        self.append(sender, timestamp, SysEventType::Response { request_id, code });
    }

    fn append(&mut self, sender: CtxId, timestamp: u64, event_type: SysEventType) -> EventId {
        let id = self.next_id;
        self.next_id += 1;
        self.events.push(SysEvent {
            id,
            sender,
            timestamp,
            event_type,
        });
        if self.events.len() > self.capacity {
            let excess = self.events.len() - self.capacity;
            for old in self.events.drain(..excess) {
                // a dropped request can no longer be shown as open
                self.open.remove(&old.id);
            }
        }
        id
    }

    /// All kept entries, oldest first.
    pub fn events(&self) -> &[SysEvent] {
        &self.events
    }

    /// Entries with an id of at least `id`, oldest first.
    pub fn since(&self, id: EventId) -> impl Iterator<Item = &SysEvent> {
        self.events.iter().filter(move |e| e.id >= id)
    }

    /// Entries issued by `ctx`, oldest first.
    pub fn by_sender(&self, ctx: CtxId) -> impl Iterator<Item = &SysEvent> {
        self.events.iter().filter(move |e| e.sender == ctx)
    }

    /// Response code recorded for `request_id`, if it was answered.
    pub fn response_to(&self, request_id: EventId) -> Option<u64> {
        self.events.iter().find_map(|e| match e.event_type {
            SysEventType::Response { request_id: r, code } if r == request_id => Some(code),
            _ => None,
        })
    }

    /// Kept requests that were not answered yet, oldest first.
    pub fn unanswered(&self) -> Vec<&SysEvent> {
        self.events
            .iter()
            .filter(|e| self.open.contains_key(&e.id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn next_id(&self) -> EventId {
        self.next_id
    }
}

impl Default for SysLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: CtxId = CtxId(1);
    const B: CtxId = CtxId(2);

    #[test]
    fn test_response_refers_to_request() {
        let mut log = SysLog::new();
        let req = log.log_request(A, 0x31, [10, 20, 30, 40], 1000);
        log.log_response(A, req, 2, 1100);

        assert_eq!(log.len(), 2);
        assert_eq!(
            log.events()[0].event_type,
            SysEventType::Request {
                opcode: 0x31,
                args: [10, 20, 30, 40]
            }
        );
        assert_eq!(log.response_to(req), Some(2));
        assert!(log.unanswered().is_empty());
    }

    #[test]
    fn test_blocked_request_stays_open() {
        let mut log = SysLog::new();
        let wait = log.log_request(A, 0x21, [0; 4], 0);
        let noop = log.log_request(B, 0x00, [0; 4], 1);
        log.log_response(B, noop, 0, 2);

        let open = log.unanswered();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, wait);
        assert_eq!(log.response_to(wait), None);

        log.log_response(A, wait, 0, 3);
        assert!(log.unanswered().is_empty());
        assert_eq!(log.by_sender(A).count(), 2);
    }

    #[test]
    fn test_oldest_entries_are_dropped() {
        let mut log = SysLog::with_capacity(4);
        let first = log.log_request(A, 0x21, [0; 4], 0);
        for i in 0..5 {
            log.log_request(B, 0, [i, 0, 0, 0], i);
        }

        assert_eq!(log.len(), 4);
        assert_eq!(log.next_id(), 6);
        assert_eq!(log.since(0).next().map(|e| e.id), Some(2));
        // the dropped request is gone from the open set as well
        assert!(log.unanswered().iter().all(|e| e.id != first));
        assert_eq!(log.since(4).count(), 2);
    }

    #[test]
    fn test_events_serialize() {
        let mut log = SysLog::new();
        let id = log.log_request(A, 0x02, [1, 2, 3, 4], 7);
        log.log_response(A, id, 0, 8);
        let json = serde_json::to_string(log.events()).unwrap();
        assert!(json.contains("\"Request\""));
        assert!(json.contains("\"request_id\":0"));
    }
}
