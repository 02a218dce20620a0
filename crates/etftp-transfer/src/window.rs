//! Block sequencing for the sliding window.
//!
//! Both engines count blocks with an absolute `u64` sequence starting at 1;
//! only the low 16 bits travel on the wire. [`unwrap_block`] recovers the
//! absolute number by picking the candidate closest to a reference point,
//! so transfers longer than 65535 blocks keep working.

use std::collections::BTreeMap;

const WIRE_SPAN: u64 = 1 << 16;

pub fn wire_block(seq: u64) -> u16 {
    (seq & 0xFFFF) as u16
}

/// Absolute sequence number for a wire block number, nearest to `reference`.
pub fn unwrap_block(wire: u16, reference: u64) -> u64 {
    let base = (reference & !(WIRE_SPAN - 1)) | u64::from(wire);
    [base.checked_sub(WIRE_SPAN), Some(base), base.checked_add(WIRE_SPAN)]
        .into_iter()
        .flatten()
        .min_by_key(|candidate| candidate.abs_diff(reference))
        .unwrap_or(base)
}

/// Split a payload into blocks. A payload that fills its last block exactly
/// (including the empty payload) gets a trailing empty block, so the final
/// block is always shorter than `block_size`.
pub fn partition(payload: &[u8], block_size: usize) -> Vec<&[u8]> {
    let mut blocks: Vec<&[u8]> = payload.chunks(block_size).collect();
    if payload.len() % block_size == 0 {
        blocks.push(&[]);
    }
    blocks
}

/// Result of feeding an ACK to the send window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Base moved forward to `acked + 1`.
    Advanced { acked: u64 },
    /// Acknowledges nothing new.
    Stale,
    /// Names a block past the end of the transfer.
    Invalid,
}

/// Sender bookkeeping: blocks `base..next_seq` are in flight.
#[derive(Debug, Clone)]
pub struct SendWindow {
    base: u64,
    next_seq: u64,
    window_size: u64,
    total: u64,
}

impl SendWindow {
    pub fn new(total: u64, window_size: u16) -> Self {
        SendWindow {
            base: 1,
            next_seq: 1,
            window_size: u64::from(window_size.max(1)),
            total,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn in_flight(&self) -> u64 {
        self.next_seq - self.base
    }

    /// Next sequence number to transmit, if the window has room.
    pub fn take_next(&mut self) -> Option<u64> {
        if self.next_seq >= self.base + self.window_size || self.next_seq > self.total {
            return None;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        Some(seq)
    }

    /// Cumulative ACK. A late ACK for blocks rewound after a timeout still
    /// counts; the receiver had them.
    pub fn on_ack(&mut self, wire: u16) -> AckOutcome {
        let acked = unwrap_block(wire, self.base);
        if acked < self.base {
            return AckOutcome::Stale;
        }
        if acked > self.total {
            return AckOutcome::Invalid;
        }
        self.base = acked + 1;
        self.next_seq = self.next_seq.max(self.base);
        AckOutcome::Advanced { acked }
    }

    /// Go back to `base` after a timeout. Returns how many blocks will be
    /// sent again.
    pub fn rewind(&mut self) -> u64 {
        let resent = self.in_flight();
        self.next_seq = self.base;
        resent
    }

    pub fn is_complete(&self) -> bool {
        self.base > self.total
    }
}

/// Where an incoming DATA block falls relative to the receive window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Not yet held; `seq` is its absolute number.
    Open { seq: u64 },
    /// Already delivered.
    Stale,
    /// Already buffered.
    Duplicate,
    /// Beyond the window or past the final block.
    OutOfWindow,
}

/// Receiver bookkeeping: delivers blocks in order, buffers ahead-of-order
/// blocks inside the window.
#[derive(Debug)]
pub struct ReceiveWindow {
    next_expected: u64,
    window_size: u64,
    block_size: usize,
    buffered: BTreeMap<u64, Vec<u8>>,
    delivered: Vec<u8>,
    final_block: Option<u64>,
    expected_size: Option<u64>,
}

/// A block whose length contradicts the announced payload size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeViolation {
    /// Announced payload length.
    pub expected: u64,
    /// Length the payload would have with this block.
    pub actual: u64,
}

impl ReceiveWindow {
    pub fn new(window_size: u16, block_size: u16) -> Self {
        ReceiveWindow {
            next_expected: 1,
            window_size: u64::from(window_size.max(1)),
            block_size: usize::from(block_size),
            buffered: BTreeMap::new(),
            delivered: Vec::new(),
            final_block: None,
            expected_size: None,
        }
    }

    /// Bound the transfer by a known payload length. The final block number
    /// follows from it, so nothing past that block is ever buffered.
    pub fn with_expected_size(mut self, size: u64) -> Self {
        let block_size = self.block_size.max(1) as u64;
        self.final_block = Some(size / block_size + 1);
        self.expected_size = Some(size);
        self
    }

    /// Check a block's length against the announced payload size. Every
    /// block but the last must be full; the last carries the remainder.
    pub fn check_length(&self, seq: u64, len: usize) -> Result<(), SizeViolation> {
        let (Some(expected), Some(last)) = (self.expected_size, self.final_block) else {
            return Ok(());
        };
        let block_size = self.block_size as u64;
        let wanted = if seq < last {
            block_size
        } else {
            expected - (last - 1) * block_size
        };
        if len as u64 == wanted {
            return Ok(());
        }
        Err(SizeViolation {
            expected,
            actual: (seq - 1) * block_size + len as u64,
        })
    }

    pub fn slot(&self, wire: u16) -> Slot {
        let seq = unwrap_block(wire, self.next_expected);
        if seq < self.next_expected {
            return Slot::Stale;
        }
        if seq >= self.next_expected + self.window_size {
            return Slot::OutOfWindow;
        }
        if self.final_block.is_some_and(|last| seq > last) {
            return Slot::OutOfWindow;
        }
        if self.buffered.contains_key(&seq) {
            return Slot::Duplicate;
        }
        Slot::Open { seq }
    }

    /// Store a verified block. Returns whether the contiguous prefix grew.
    pub fn store(&mut self, seq: u64, block: Vec<u8>) -> bool {
        if block.len() < self.block_size {
            self.final_block = Some(self.final_block.map_or(seq, |last| last.min(seq)));
        }
        self.buffered.insert(seq, block);

        let before = self.next_expected;
        while let Some(block) = self.buffered.remove(&self.next_expected) {
            self.delivered.extend_from_slice(&block);
            self.next_expected += 1;
        }
        self.next_expected > before
    }

    /// Highest block received with no gaps before it; 0 before any data.
    pub fn last_contiguous(&self) -> u64 {
        self.next_expected - 1
    }

    pub fn buffered(&self) -> usize {
        self.buffered.len()
    }

    pub fn delivered_bytes(&self) -> u64 {
        self.delivered.len() as u64
    }

    pub fn is_complete(&self) -> bool {
        self.final_block.is_some_and(|last| self.next_expected > last)
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.delivered
    }
}
