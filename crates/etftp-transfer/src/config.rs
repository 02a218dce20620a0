//! Per-session transfer parameters and their RRQ/OACK negotiation.

use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::error::TransferError;
use crate::options::{BLKSIZE, Options, TIMEOUT, TSIZE, WINDOWSIZE};

pub const DEFAULT_BLOCK_SIZE: u16 = 512;
pub const MIN_BLOCK_SIZE: u16 = 8;
pub const MAX_BLOCK_SIZE: u16 = 65_464;

pub const DEFAULT_WINDOW_SIZE: u16 = 4;
pub const MAX_WINDOW_SIZE: u16 = 1024;

/// Window assumed when an OACK omits `windowsize`.
const UNNEGOTIATED_WINDOW: u16 = 1;

pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Plaintext bytes per DATA block.
    pub block_size: u16,
    /// Blocks in flight before the sender waits for an ACK.
    pub window_size: u16,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_timeouts: u32,
    /// Payload length announced through `tsize`.
    pub transfer_size: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            block_size: DEFAULT_BLOCK_SIZE,
            window_size: DEFAULT_WINDOW_SIZE,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_timeouts: 5,
            transfer_size: None,
        }
    }
}

impl SessionConfig {
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            max_timeouts: self.max_timeouts,
        }
    }

    /// Options a client puts in its RRQ, key coordinates excluded.
    pub fn request_options(&self, timeout_secs: Option<u8>) -> Options {
        let mut options = Options::new();
        options.set_number(BLKSIZE, u64::from(self.block_size));
        options.set_number(WINDOWSIZE, u64::from(self.window_size));
        options.set_number(TSIZE, 0);
        if let Some(secs) = timeout_secs.filter(|s| *s > 0) {
            options.set_number(TIMEOUT, u64::from(secs));
        }
        options
    }

    /// Server side: settle the client's requested options against local
    /// limits. Returns the session parameters and the OACK option list.
    ///
    /// Out-of-range `blksize`/`windowsize` are clamped. A `timeout` outside
    /// 1..=255 is ignored and not echoed. `tsize` always reports the real
    /// payload length.
    pub fn negotiate(&self, requested: &Options, payload_len: u64) -> (SessionConfig, Options) {
        let mut session = self.clone();
        let mut oack = Options::new();

        if let Some(blksize) = requested.number(BLKSIZE) {
            session.block_size =
                blksize.clamp(u64::from(MIN_BLOCK_SIZE), u64::from(MAX_BLOCK_SIZE)) as u16;
        }
        if let Some(window) = requested.number(WINDOWSIZE) {
            session.window_size = window.clamp(1, u64::from(MAX_WINDOW_SIZE)) as u16;
        }
        if let Some(secs) = requested.number(TIMEOUT) {
            if (MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&secs) {
                session.initial_delay = Duration::from_secs(secs);
                session.max_delay = session.max_delay.max(session.initial_delay);
                oack.set_number(TIMEOUT, secs);
            }
        }
        session.transfer_size = Some(payload_len);

        oack.set_number(BLKSIZE, u64::from(session.block_size));
        oack.set_number(WINDOWSIZE, u64::from(session.window_size));
        oack.set_number(TSIZE, payload_len);
        (session, oack)
    }

    /// Client side: adopt the server's OACK. Values outside the protocol
    /// limits, or larger than what this side asked for, fail negotiation.
    pub fn accept(&self, oack: &Options) -> Result<SessionConfig, TransferError> {
        let mut session = self.clone();

        session.block_size = match oack.get(BLKSIZE) {
            None => DEFAULT_BLOCK_SIZE,
            Some(_) => {
                let min = u64::from(MIN_BLOCK_SIZE);
                bounded(oack, BLKSIZE, min, u64::from(self.block_size))? as u16
            }
        };
        session.window_size = match oack.get(WINDOWSIZE) {
            None => UNNEGOTIATED_WINDOW,
            Some(_) => bounded(oack, WINDOWSIZE, 1, u64::from(self.window_size))? as u16,
        };
        if oack.contains(TIMEOUT) {
            let secs = bounded(oack, TIMEOUT, MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS)?;
            session.initial_delay = Duration::from_secs(secs);
            session.max_delay = session.max_delay.max(session.initial_delay);
        }
        session.transfer_size = match oack.get(TSIZE) {
            None => None,
            Some(_) => Some(
                oack.number(TSIZE)
                    .ok_or_else(|| TransferError::Negotiation("tsize is not a number".into()))?,
            ),
        };

        Ok(session)
    }
}

fn bounded(options: &Options, name: &str, min: u64, max: u64) -> Result<u64, TransferError> {
    let value = options
        .number(name)
        .ok_or_else(|| TransferError::Negotiation(format!("{name} is not a number")))?;
    if value < min || value > max {
        return Err(TransferError::Negotiation(format!(
            "{name}={value} outside {min}..={max}"
        )));
    }
    Ok(value)
}
