//! Forwarding counters and periodic reporting
//!
//! The forwarder owns the only instance, so plain integers suffice.

use std::time::Instant;
use tracing::info;

#[derive(Debug, Clone)]
pub struct ForwardStats {
    /// Datagrams taken off the socket (monotonic)
    pub received: u64,
    /// Publishes confirmed by the broker (monotonic)
    pub published: u64,
    /// Publishes that failed or timed out; the datagram was dropped
    pub failed: u64,
    /// Datagrams cut to the buffer size
    pub truncated: u64,
    /// Socket receive errors
    pub receive_errors: u64,
    /// Bytes published
    pub bytes: u64,
    started: Instant,
}

impl Default for ForwardStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardStats {
    pub fn new() -> Self {
        Self {
            received: 0,
            published: 0,
            failed: 0,
            truncated: 0,
            receive_errors: 0,
            bytes: 0,
            started: Instant::now(),
        }
    }

    pub fn record_received(&mut self, truncated: bool) {
        self.received += 1;
        if truncated {
            self.truncated += 1;
        }
    }

    pub fn record_published(&mut self, len: usize) {
        self.published += 1;
        self.bytes += len as u64;
    }

    pub fn record_failed(&mut self) {
        self.failed += 1;
    }

    pub fn record_receive_error(&mut self) {
        self.receive_errors += 1;
    }

    pub fn log(&self, event: &'static str) {
        info!(
            received = %self.received,
            published = %self.published,
            failed = %self.failed,
            truncated = %self.truncated,
            receive_errors = %self.receive_errors,
            bytes = %self.bytes,
            uptime_secs = %self.started.elapsed().as_secs(),
            "{}",
            event
        );
    }
}
