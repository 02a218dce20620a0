//! Transfer statistics, shared between a session thread and anyone watching it.
//! All fields are atomic so progress can be read without locking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct TransferStats {
    /// Payload length in bytes, once known.
    pub total_bytes: AtomicU64,
    /// Number of blocks in the transfer, once known.
    pub total_blocks: AtomicU64,
    /// Plaintext bytes confirmed (sender) or delivered in order (receiver).
    pub payload_bytes: AtomicU64,
    /// Blocks confirmed or delivered.
    pub blocks: AtomicU64,
    /// Raw datagram bytes read from the link.
    pub bytes_in: AtomicU64,
    /// Raw datagram bytes written to the link.
    pub bytes_out: AtomicU64,
    /// Blocks sent again after a timeout.
    pub retransmits: AtomicU64,
    /// Read deadlines that expired.
    pub timeouts: AtomicU64,
    /// DATA blocks discarded by the receiver.
    pub rejected: AtomicU64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_total(&self, bytes: u64, blocks: u64) {
        self.total_bytes.store(bytes, Ordering::Relaxed);
        self.total_blocks.store(blocks, Ordering::Relaxed);
    }

    pub fn set_progress(&self, bytes: u64, blocks: u64) {
        self.payload_bytes.store(bytes, Ordering::Relaxed);
        self.blocks.store(blocks, Ordering::Relaxed);
    }

    pub fn record_in(&self, bytes: usize) {
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_out(&self, bytes: usize) {
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_retransmits(&self, blocks: u64) {
        self.retransmits.fetch_add(blocks, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Progress as a fraction 0.0 - 1.0.
    pub fn progress(&self) -> f64 {
        let total = self.total_bytes.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let done = self.payload_bytes.load(Ordering::Relaxed);
        (done as f64 / total as f64).min(1.0)
    }

    pub fn summary(&self, elapsed: Duration) -> TransferSummary {
        let bytes = self.payload_bytes.load(Ordering::Relaxed);
        let secs = elapsed.as_secs_f64();
        let throughput_bps = if secs > 0.0 { (bytes as f64 / secs) as u64 } else { 0 };
        TransferSummary {
            bytes,
            blocks: self.blocks.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            retransmits: self.retransmits.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            elapsed,
            throughput_bps,
        }
    }
}

/// Snapshot taken when a transfer finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub bytes: u64,
    pub blocks: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub retransmits: u64,
    pub timeouts: u64,
    pub rejected: u64,
    pub elapsed: Duration,
    /// Payload bytes per second.
    pub throughput_bps: u64,
}
