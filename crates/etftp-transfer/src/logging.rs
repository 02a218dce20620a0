//! Structured transfer events.
//!
//! Sessions report lifecycle and per-block events through [`TransferLogger`].
//! The session key itself is never logged; only its CRC32 fingerprint.

use std::fmt;
use std::net::SocketAddr;

use crate::packet::Opcode;

#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub peer: SocketAddr,
    pub event: TransferEvent,
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Server: read request accepted for a session
    RequestReceived {
        filename: String,
        mode: String,
    },
    /// Server: payload fetched from the source
    PayloadFetched {
        bytes: usize,
    },
    /// Both: shared key derived
    KeyEstablished {
        fingerprint: u32,
    },
    /// Both: options settled
    OptionsNegotiated {
        block_size: u16,
        window_size: u16,
        transfer_size: Option<u64>,
    },
    /// Sender: OACK resent while waiting for ACK 0
    HandshakeResent {
        attempt: u32,
    },
    /// Sender: cumulative ACK moved the window
    WindowAdvanced {
        acked: u64,
        in_flight: u64,
    },
    /// Sender: timeout, window rewound to base
    WindowRewound {
        base: u64,
        blocks: u64,
    },
    /// Both: read deadline expired
    Timeout {
        consecutive: u32,
        next_wait_ms: u64,
    },
    /// Receiver: DATA block discarded
    BlockRejected {
        block: u16,
        reason: String,
    },
    /// Both: packet that has no meaning in the current state
    UnexpectedPacket {
        opcode: Opcode,
    },
    /// Both: datagram that did not decode
    MalformedPacket {
        reason: String,
    },
    /// Both: transfer complete
    TransferComplete {
        total_bytes: u64,
        blocks: u64,
        duration_ms: u64,
        retransmits: u64,
    },
    /// Both: transfer abandoned
    Aborted {
        reason: String,
    },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestReceived { filename, mode } => {
                write!(f, "request_received file={} mode={}", filename, mode)
            }
            Self::PayloadFetched { bytes } => write!(f, "payload_fetched bytes={}", bytes),
            Self::KeyEstablished { fingerprint } => {
                write!(f, "key_established fingerprint={:08x}", fingerprint)
            }
            Self::OptionsNegotiated { block_size, window_size, transfer_size } => {
                write!(f, "options_negotiated blksize={} windowsize={}", block_size, window_size)?;
                match transfer_size {
                    Some(size) => write!(f, " tsize={}", size),
                    None => Ok(()),
                }
            }
            Self::HandshakeResent { attempt } => write!(f, "handshake_resent attempt={}", attempt),
            Self::WindowAdvanced { acked, in_flight } => {
                write!(f, "window_advanced acked={} in_flight={}", acked, in_flight)
            }
            Self::WindowRewound { base, blocks } => {
                write!(f, "window_rewound base={} resend={}", base, blocks)
            }
            Self::Timeout { consecutive, next_wait_ms } => {
                write!(f, "timeout consecutive={} next_wait_ms={}", consecutive, next_wait_ms)
            }
            Self::BlockRejected { block, reason } => {
                write!(f, "block_rejected block={} reason={}", block, reason)
            }
            Self::UnexpectedPacket { opcode } => write!(f, "unexpected_packet opcode={}", opcode),
            Self::MalformedPacket { reason } => write!(f, "malformed_packet: {}", reason),
            Self::TransferComplete { total_bytes, blocks, duration_ms, retransmits } => {
                write!(
                    f,
                    "transfer_complete bytes={} blocks={} duration_ms={} retransmits={}",
                    total_bytes, blocks, duration_ms, retransmits
                )
            }
            Self::Aborted { reason } => write!(f, "aborted: {}", reason),
        }
    }
}

pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        // Lifecycle at info, per-block chatter at debug
        match &entry.event {
            TransferEvent::Aborted { .. } => {
                tracing::warn!(component = entry.component, peer = %entry.peer, "{}", entry.event);
            }
            TransferEvent::RequestReceived { .. }
            | TransferEvent::KeyEstablished { .. }
            | TransferEvent::OptionsNegotiated { .. }
            | TransferEvent::Timeout { .. }
            | TransferEvent::TransferComplete { .. } => {
                tracing::info!(component = entry.component, peer = %entry.peer, "{}", entry.event);
            }
            _ => {
                tracing::debug!(component = entry.component, peer = %entry.peer, "{}", entry.event);
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Collects events for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingLogger {
        pub(crate) entries: Mutex<Vec<TransferLog>>,
    }

    impl TransferLogger for RecordingLogger {
        fn log(&self, entry: TransferLog) {
            self.entries.lock().push(entry);
        }
    }

    impl RecordingLogger {
        pub(crate) fn events(&self) -> Vec<String> {
            self.entries.lock().iter().map(|e| e.event.to_string()).collect()
        }
    }

    #[test]
    fn display_is_key_value() {
        let event = TransferEvent::OptionsNegotiated {
            block_size: 512,
            window_size: 4,
            transfer_size: Some(10_000),
        };
        assert_eq!(event.to_string(), "options_negotiated blksize=512 windowsize=4 tsize=10000");

        let event = TransferEvent::KeyEstablished { fingerprint: 0xAB };
        assert_eq!(event.to_string(), "key_established fingerprint=000000ab");
    }
}
