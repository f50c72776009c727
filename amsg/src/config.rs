//! Configuration types for the communicator.

use crate::codec::HEADER_SIZE;
use crate::error::{Error, Result};

/// Communicator configuration.
///
/// Sizes the two context rings and the receive buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommConfig {
    /// log2 of the number of send contexts.
    /// Default: 6 (64 contexts)
    pub log2_send_contexts: u32,
    /// log2 of the number of receive contexts.
    /// Default: 6 (64 contexts)
    pub log2_recv_contexts: u32,
    /// Size of every posted receive buffer; also the largest frame a core
    /// may send.
    /// Default: 8192
    pub recv_buffer_size: usize,
    /// Receives tested per `try_progress` call.
    /// Default: 16
    pub poll_budget: usize,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            log2_send_contexts: 6,
            log2_recv_contexts: 6,
            recv_buffer_size: 8192,
            poll_budget: 16,
        }
    }
}

impl CommConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set log2 of the send ring capacity.
    pub fn with_log2_send_contexts(mut self, log2: u32) -> Self {
        self.log2_send_contexts = log2;
        self
    }

    /// Set log2 of the receive ring capacity.
    pub fn with_log2_recv_contexts(mut self, log2: u32) -> Self {
        self.log2_recv_contexts = log2;
        self
    }

    /// Set the receive buffer size.
    pub fn with_recv_buffer_size(mut self, bytes: usize) -> Self {
        self.recv_buffer_size = bytes;
        self
    }

    /// Set the default poll budget.
    pub fn with_poll_budget(mut self, budget: usize) -> Self {
        self.poll_budget = budget;
        self
    }

    pub fn send_contexts(&self) -> usize {
        1 << self.log2_send_contexts
    }

    pub fn recv_contexts(&self) -> usize {
        1 << self.log2_recv_contexts
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.log2_send_contexts > 16 || self.log2_recv_contexts > 16 {
            return Err(Error::Config(format!(
                "ring capacity 2^{} / 2^{} exceeds 2^16",
                self.log2_send_contexts, self.log2_recv_contexts
            )));
        }
        if self.recv_buffer_size <= HEADER_SIZE {
            return Err(Error::Config(format!(
                "receive buffer of {} bytes cannot hold a {HEADER_SIZE}-byte header",
                self.recv_buffer_size
            )));
        }
        if self.poll_budget == 0 {
            return Err(Error::Config("poll budget must be nonzero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = CommConfig::default();
        assert_eq!(c.send_contexts(), 64);
        assert_eq!(c.recv_contexts(), 64);
        assert_eq!(c.recv_buffer_size, 8192);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn rejects_tiny_buffers() {
        let c = CommConfig::new().with_recv_buffer_size(HEADER_SIZE);
        assert!(matches!(c.validate(), Err(Error::Config(_))));
        let c = CommConfig::new().with_poll_budget(0);
        assert!(c.validate().is_err());
    }
}
