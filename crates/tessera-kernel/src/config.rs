//! Kernel boot configuration.

use serde::{Deserialize, Serialize};

/// Tunables fixed at boot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Kernel memory quota handed to the root context (bytes)
    pub root_kmem: usize,
    /// Attempts at delivering into a full receive slot before giving up with `Busy`
    pub busy_retries: u32,
    /// Slot size class of the kernel's syscall ring (log2 bytes)
    pub syscall_msg_order: u8,
    /// Number of syscall ring slots (log2)
    pub syscall_slots_order: u8,
    /// Slot size class of every context's syscall reply ring (log2 bytes)
    pub reply_msg_order: u8,
    /// Slot size class of the default reply gate (log2 bytes)
    pub def_msg_order: u8,
    /// Number of default reply gate slots (log2)
    pub def_slots_order: u8,
    /// Maximum number of live contexts, the kernel's included
    pub max_contexts: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            root_kmem: 1 << 20, // 1 MiB
            busy_retries: 16,
            syscall_msg_order: 7,
            syscall_slots_order: 6,
            reply_msg_order: 6,
            def_msg_order: 8,
            def_slots_order: 2,
            max_contexts: 1024,
        }
    }
}

impl KernelConfig {
    pub fn with_root_kmem(mut self, bytes: usize) -> Self {
        self.root_kmem = bytes;
        self
    }

    pub fn with_busy_retries(mut self, retries: u32) -> Self {
        self.busy_retries = retries;
        self
    }

    pub fn with_max_contexts(mut self, max: usize) -> Self {
        self.max_contexts = max;
        self
    }

    /// Buffer size class of the syscall ring.
    pub fn syscall_buf_order(&self) -> u8 {
        self.syscall_msg_order + self.syscall_slots_order
    }

    /// Buffer size class of a default reply gate.
    pub fn def_buf_order(&self) -> u8 {
        self.def_msg_order + self.def_slots_order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_kif::syscall::{REPLY_WORDS, REQUEST_WORDS};
    use tessera_kif::tcu::HEADER_SIZE;
    use tessera_kif::RecvEp;

    #[test]
    fn test_default_rings_fit_syscall_messages() {
        let c = KernelConfig::default();
        assert!(HEADER_SIZE + REQUEST_WORDS * 8 <= 1 << c.syscall_msg_order);
        assert!(HEADER_SIZE + REPLY_WORDS * 8 <= 1 << c.reply_msg_order);
        assert!(RecvEp::orders_valid(c.syscall_buf_order(), c.syscall_msg_order));
        assert!(RecvEp::orders_valid(c.def_buf_order(), c.def_msg_order));
    }

    #[test]
    fn test_builder() {
        let c = KernelConfig::default()
            .with_root_kmem(4096)
            .with_busy_retries(1)
            .with_max_contexts(8);
        assert_eq!(c.root_kmem, 4096);
        assert_eq!(c.busy_retries, 1);
        assert_eq!(c.max_contexts, 8);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let c: KernelConfig =
            serde_json::from_str(r#"{"root_kmem": 8192, "busy_retries": 2}"#).unwrap();
        assert_eq!(c.root_kmem, 8192);
        assert_eq!(c.busy_retries, 2);
        assert_eq!(c.max_contexts, KernelConfig::default().max_contexts);
    }
}
