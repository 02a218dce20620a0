//! Sending side of a transfer.
//!
//! The payload is sealed block by block up front. The sender then waits for
//! ACK 0 (resending the handshake packet on each timeout), fills the window,
//! and reads replies until the current wait expires. A timeout rewinds to the
//! window base and resends everything from there.

use std::time::Instant;

use etftp_crypto::{BlockCipher, CipherError};

use crate::backoff::{Backoff, RetryExhausted};
use crate::config::SessionConfig;
use crate::error::TransferError;
use crate::link::Link;
use crate::logging::TransferEvent;
use crate::packet::Packet;
use crate::session::{Incoming, Session};
use crate::stats::TransferSummary;
use crate::window::{AckOutcome, SendWindow, partition, wire_block};

/// Message sent to the peer when the retry ceiling is reached.
pub const RETRY_LIMIT_MESSAGE: &str = "transfer aborted: exceeded retry limit";

/// Encoded DATA packets for a whole payload, in sequence order.
#[derive(Debug, Clone)]
pub struct SealedPayload {
    datagrams: Vec<Vec<u8>>,
    payload_len: u64,
}

impl SealedPayload {
    pub fn blocks(&self) -> u64 {
        self.datagrams.len() as u64
    }

    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    /// DATA datagram for absolute sequence number `seq` (1-based).
    fn datagram(&self, seq: u64) -> &[u8] {
        &self.datagrams[(seq - 1) as usize]
    }
}

/// Partition and seal a payload.
pub fn prepare_blocks(
    payload: &[u8],
    block_size: u16,
    cipher: &BlockCipher,
) -> Result<SealedPayload, CipherError> {
    let blocks = partition(payload, usize::from(block_size.max(1)));
    let mut datagrams = Vec::with_capacity(blocks.len());
    for (index, block) in blocks.into_iter().enumerate() {
        let sealed = cipher.seal_block(block)?;
        let packet = Packet::Data {
            block: wire_block(index as u64 + 1),
            checksum: sealed.checksum,
            payload: sealed.sealed,
        };
        datagrams.push(packet.encode());
    }
    Ok(SealedPayload {
        datagrams,
        payload_len: payload.len() as u64,
    })
}

/// Tell the peer the retry budget is spent and turn that into the session's
/// error.
pub(crate) fn abort_exhausted<L: Link>(
    session: &Session<L>,
    exhausted: RetryExhausted,
) -> TransferError {
    let err = TransferError::from(exhausted);
    session.abort(err.error_code(), RETRY_LIMIT_MESSAGE);
    err
}

/// Drive a prepared payload to the peer. `handshake` is the packet the peer
/// answers with ACK 0 (the OACK); it is resent on each timeout until then.
pub fn run_sender<L: Link>(
    session: &mut Session<L>,
    config: &SessionConfig,
    payload: &SealedPayload,
    handshake: Option<&[u8]>,
) -> Result<TransferSummary, TransferError> {
    let start = Instant::now();
    let stats = session.stats().clone();
    stats.set_total(payload.payload_len(), payload.blocks());

    let mut backoff = Backoff::new(config.backoff());
    await_initial_ack(session, &mut backoff, handshake)?;

    let mut window = SendWindow::new(payload.blocks(), config.window_size);
    let block_size = u64::from(config.block_size);
    // Only progress or a timeout starts a new wait; stray packets do not.
    let mut deadline = Instant::now() + backoff.current();

    while !window.is_complete() {
        while let Some(seq) = window.take_next() {
            session.send_raw(payload.datagram(seq))?;
        }

        match session.recv_until(deadline)? {
            Incoming::Timeout => {
                stats.record_timeout();
                let next_wait = match backoff.on_timeout() {
                    Ok(wait) => wait,
                    Err(exhausted) => return Err(abort_exhausted(session, exhausted)),
                };
                deadline = Instant::now() + next_wait;
                session.log(TransferEvent::Timeout {
                    consecutive: backoff.timeouts(),
                    next_wait_ms: next_wait.as_millis() as u64,
                });
                let resent = window.rewind();
                stats.record_retransmits(resent);
                session.log(TransferEvent::WindowRewound {
                    base: window.base(),
                    blocks: resent,
                });
            }
            Incoming::Packet(Packet::Ack { block }) => match window.on_ack(block) {
                AckOutcome::Advanced { acked } => {
                    backoff.on_progress();
                    deadline = Instant::now() + backoff.current();
                    let confirmed = (acked * block_size).min(payload.payload_len());
                    stats.set_progress(confirmed, acked);
                    session.log(TransferEvent::WindowAdvanced {
                        acked,
                        in_flight: window.in_flight(),
                    });
                }
                AckOutcome::Stale | AckOutcome::Invalid => {}
            },
            Incoming::Packet(Packet::Error { code, message }) => {
                let err = TransferError::from_peer(code, &message);
                session.log(TransferEvent::Aborted { reason: err.to_string() });
                return Err(err);
            }
            Incoming::Packet(Packet::Terminate) => {
                session.log(TransferEvent::Aborted {
                    reason: "peer terminated".into(),
                });
                return Err(TransferError::Terminated);
            }
            Incoming::Packet(other) => {
                session.log(TransferEvent::UnexpectedPacket { opcode: other.opcode() });
            }
            Incoming::Malformed(err) => {
                session.log(TransferEvent::MalformedPacket { reason: err.to_string() });
            }
        }
    }

    stats.set_progress(payload.payload_len(), payload.blocks());
    let summary = stats.summary(start.elapsed());
    session.log(TransferEvent::TransferComplete {
        total_bytes: summary.bytes,
        blocks: summary.blocks,
        duration_ms: summary.elapsed.as_millis() as u64,
        retransmits: summary.retransmits,
    });
    Ok(summary)
}

fn await_initial_ack<L: Link>(
    session: &mut Session<L>,
    backoff: &mut Backoff,
    handshake: Option<&[u8]>,
) -> Result<(), TransferError> {
    let mut deadline = Instant::now() + backoff.current();
    loop {
        match session.recv_until(deadline)? {
            Incoming::Packet(Packet::Ack { block: 0 }) => {
                backoff.on_progress();
                return Ok(());
            }
            Incoming::Timeout => {
                session.stats().record_timeout();
                match backoff.on_timeout() {
                    Ok(wait) => deadline = Instant::now() + wait,
                    Err(exhausted) => return Err(abort_exhausted(session, exhausted)),
                }
                if let Some(packet) = handshake {
                    session.send_raw(packet)?;
                    session.log(TransferEvent::HandshakeResent {
                        attempt: backoff.timeouts(),
                    });
                }
            }
            Incoming::Packet(Packet::Error { code, message }) => {
                return Err(TransferError::from_peer(code, &message));
            }
            Incoming::Packet(Packet::Terminate) => return Err(TransferError::Terminated),
            Incoming::Packet(other) => {
                session.log(TransferEvent::UnexpectedPacket { opcode: other.opcode() });
            }
            Incoming::Malformed(err) => {
                session.log(TransferEvent::MalformedPacket { reason: err.to_string() });
            }
        }
    }
}
