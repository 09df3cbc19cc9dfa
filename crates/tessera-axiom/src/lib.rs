//! Tessera Axiom - syscall audit trail
//!
//! Every syscall the kernel processes is recorded twice: once when the
//! request is decoded and once when the reply is sent. The two entries are
//! correlated by event id. Blocked syscalls therefore show up as a request
//! whose response appears later in the log.

#![no_std]
extern crate alloc;

pub mod syslog;

pub use syslog::{EventId, SysEvent, SysEventType, SysLog, MAX_SYSLOG_EVENTS};
