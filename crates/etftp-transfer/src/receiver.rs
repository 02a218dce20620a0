//! Receiving side of a transfer.
//!
//! Sends ACK 0 to start the flow, then acknowledges the highest contiguous
//! block after every DATA packet. Blocks that fail authentication or fall
//! outside the window are dropped and the last ACK is repeated. After the
//! short final block the receiver keeps answering retransmissions for as
//! long as the sender could still be retrying a lost final ACK.

use std::time::Instant;

use etftp_crypto::BlockCipher;

use crate::backoff::Backoff;
use crate::config::SessionConfig;
use crate::error::TransferError;
use crate::link::Link;
use crate::logging::TransferEvent;
use crate::packet::{ErrorCode, Packet};
use crate::sender::abort_exhausted;
use crate::session::{Incoming, Session};
use crate::stats::TransferSummary;
use crate::window::{ReceiveWindow, Slot, wire_block};

/// Reassembled payload plus how the transfer went.
#[derive(Debug, Clone)]
pub struct Received {
    pub data: Vec<u8>,
    pub summary: TransferSummary,
}

pub fn run_receiver<L: Link>(
    session: &mut Session<L>,
    config: &SessionConfig,
    cipher: &BlockCipher,
) -> Result<Received, TransferError> {
    let start = Instant::now();
    let stats = session.stats().clone();

    let mut window = ReceiveWindow::new(config.window_size, config.block_size);
    if let Some(size) = config.transfer_size {
        stats.set_total(size, 0);
        window = window.with_expected_size(size);
    }
    let mut backoff = Backoff::new(config.backoff());
    // Consecutive blocks that failed authentication.
    let mut rejections = 0u32;

    session.send(&Packet::Ack { block: 0 })?;
    let mut deadline = Instant::now() + backoff.current();

    while !window.is_complete() {
        let ack = Packet::Ack {
            block: wire_block(window.last_contiguous()),
        };

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
                session.send(&ack)?;
            }
            Incoming::Packet(Packet::Data { block, checksum, payload }) => {
                let seq = match window.slot(block) {
                    Slot::Open { seq } => seq,
                    other => {
                        stats.record_rejected();
                        session.log(TransferEvent::BlockRejected {
                            block,
                            reason: format!("{other:?}").to_lowercase(),
                        });
                        session.send(&ack)?;
                        continue;
                    }
                };

                let plaintext = match cipher.open_block(&payload, checksum) {
                    Ok(plaintext) => plaintext,
                    Err(err) => {
                        stats.record_rejected();
                        rejections += 1;
                        session.log(TransferEvent::BlockRejected {
                            block,
                            reason: err.to_string(),
                        });
                        if rejections >= config.max_timeouts {
                            session.abort(
                                ErrorCode::Aborted,
                                "transfer aborted: repeated authentication failures",
                            );
                            return Err(err.into());
                        }
                        session.send(&ack)?;
                        continue;
                    }
                };

                if let Err(violation) = window.check_length(seq, plaintext.len()) {
                    let err = TransferError::SizeMismatch {
                        expected: violation.expected,
                        actual: violation.actual,
                    };
                    session.abort(err.error_code(), &err.to_string());
                    return Err(err);
                }

                rejections = 0;
                backoff.on_progress();
                deadline = Instant::now() + backoff.current();
                if window.store(seq, plaintext) {
                    stats.set_progress(window.delivered_bytes(), window.last_contiguous());
                }
                session.send(&Packet::Ack {
                    block: wire_block(window.last_contiguous()),
                })?;
            }
            // Our ACK 0 was lost and the server repeated its OACK.
            Incoming::Packet(Packet::OptionAck { .. }) => session.send(&ack)?,
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
                stats.record_rejected();
                session.log(TransferEvent::MalformedPacket { reason: err.to_string() });
                session.send(&ack)?;
            }
        }
    }

    let final_ack = Packet::Ack {
        block: wire_block(window.last_contiguous()),
    };
    dally(session, config, &final_ack)?;

    let data = window.into_payload();
    let summary = stats.summary(start.elapsed());
    session.log(TransferEvent::TransferComplete {
        total_bytes: summary.bytes,
        blocks: summary.blocks,
        duration_ms: summary.elapsed.as_millis() as u64,
        retransmits: summary.retransmits,
    });
    Ok(Received { data, summary })
}

/// Answer retransmitted DATA with the final ACK. The sender's next resend
/// comes at most one backoff step after the last, so each quiet period is
/// twice the step the sender is on. A rewound window arrives as one burst and
/// counts as a single step. Ends once a period passes in silence or the
/// sender would have run out of retries.
fn dally<L: Link>(
    session: &mut Session<L>,
    config: &SessionConfig,
    final_ack: &Packet,
) -> Result<(), TransferError> {
    let mut backoff = Backoff::new(config.backoff());
    let mut deadline = Instant::now() + backoff.current() * 2;
    let mut last_answer: Option<Instant> = None;
    loop {
        match session.recv_until(deadline)? {
            Incoming::Timeout => return Ok(()),
            Incoming::Packet(Packet::Data { .. }) => {
                session.send(final_ack)?;
                let new_burst =
                    last_answer.is_none_or(|at| at.elapsed() >= backoff.current() / 2);
                if new_burst && backoff.on_timeout().is_err() {
                    return Ok(());
                }
                last_answer = Some(Instant::now());
                deadline = Instant::now() + backoff.current() * 2;
            }
            _ => {}
        }
    }
}
