//! One end of a transfer: a link to a single peer plus the stats and logger
//! the engines report through.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ParseError;
use crate::link::Link;
use crate::logging::{TransferEvent, TransferLog, TransferLogger};
use crate::packet::{ErrorCode, MAX_DATAGRAM, Packet};
use crate::stats::TransferStats;

/// What one read attempt produced.
#[derive(Debug)]
pub enum Incoming {
    Packet(Packet),
    Malformed(ParseError),
    Timeout,
}

pub struct Session<L> {
    link: L,
    peer: SocketAddr,
    component: &'static str,
    stats: Arc<TransferStats>,
    logger: Arc<dyn TransferLogger>,
    buf: Vec<u8>,
}

impl<L: Link> Session<L> {
    pub fn new(
        link: L,
        peer: SocketAddr,
        component: &'static str,
        logger: Arc<dyn TransferLogger>,
    ) -> Self {
        Session {
            link,
            peer,
            component,
            stats: Arc::new(TransferStats::new()),
            logger,
            buf: vec![0u8; MAX_DATAGRAM],
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn stats(&self) -> &Arc<TransferStats> {
        &self.stats
    }

    pub fn log(&self, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: self.component,
            peer: self.peer,
            event,
        });
    }

    pub fn send(&self, packet: &Packet) -> io::Result<()> {
        self.send_raw(&packet.encode())
    }

    pub fn send_raw(&self, datagram: &[u8]) -> io::Result<()> {
        self.link.send(datagram)?;
        self.stats.record_out(datagram.len());
        Ok(())
    }

    pub fn recv(&mut self, timeout: Duration) -> io::Result<Incoming> {
        let n = match self.link.recv(&mut self.buf, timeout)? {
            Some(n) => n,
            None => return Ok(Incoming::Timeout),
        };
        self.stats.record_in(n);
        Ok(match Packet::decode(&self.buf[..n]) {
            Ok(packet) => Incoming::Packet(packet),
            Err(err) => Incoming::Malformed(err),
        })
    }

    /// Read until `deadline`. A deadline already passed is a timeout.
    pub fn recv_until(&mut self, deadline: Instant) -> io::Result<Incoming> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(Incoming::Timeout);
        }
        self.recv(remaining)
    }

    /// Tell the peer this side is giving up. A failed send is only logged;
    /// the transfer is already over.
    pub fn abort(&self, code: ErrorCode, message: &str) {
        if let Err(e) = self.send(&Packet::error(code, message)) {
            tracing::debug!(peer = %self.peer, "failed to send error packet: {}", e);
        }
        self.log(TransferEvent::Aborted {
            reason: message.to_string(),
        });
    }
}
