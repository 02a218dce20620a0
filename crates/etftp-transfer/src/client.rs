//! Client side: request one payload from a server and receive it.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use etftp_crypto::{BlockCipher, KeyExchange};

use crate::backoff::Backoff;
use crate::config::SessionConfig;
use crate::error::TransferError;
use crate::link::{DropPolicy, LossyLink, client_udp_socket, is_timeout};
use crate::logging::{TracingLogger, TransferEvent, TransferLogger};
use crate::options::Options;
use crate::packet::{ErrorCode, MAX_DATAGRAM, Packet};
use crate::receiver::run_receiver;
use crate::session::Session;
use crate::stats::TransferSummary;

#[derive(Clone)]
pub struct ClientConfig {
    /// Values to request; the server may only lower them.
    pub session: SessionConfig,
    /// Per-read timeout, in seconds, to ask the server to use.
    pub timeout_option: Option<u8>,
    /// Simulated loss on outgoing ACKs, for testing recovery.
    pub drop_policy: DropPolicy,
    pub logger: Arc<dyn TransferLogger>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            session: SessionConfig::default(),
            timeout_option: None,
            drop_policy: DropPolicy::Never,
            logger: Arc::new(TracingLogger),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Download {
    pub data: Vec<u8>,
    pub summary: TransferSummary,
}

/// Fetch `identifier` from the server listening at `server`.
pub fn request_file(
    server: SocketAddr,
    identifier: &str,
    config: &ClientConfig,
) -> Result<Download, TransferError> {
    let socket = client_udp_socket(server)?;
    let exchange = KeyExchange::generate();

    let mut options = config.session.request_options(config.timeout_option);
    options.set_public_point(&exchange.public_point());
    let request = Packet::read_request(identifier, options).encode();
    socket.send_to(&request, server)?;

    let (oack, session_addr) = await_option_ack(&socket, server, &request, config)?;
    socket.connect(session_addr)?;

    let link = LossyLink::new(socket, config.drop_policy.clone());
    let mut session = Session::new(link, session_addr, "client", config.logger.clone());
    session.stats().record_out(request.len());

    let negotiated = match config.session.accept(&oack) {
        Ok(negotiated) => negotiated,
        Err(err) => {
            session.abort(ErrorCode::OptionNegotiation, &err.to_string());
            return Err(err);
        }
    };
    session.log(TransferEvent::OptionsNegotiated {
        block_size: negotiated.block_size,
        window_size: negotiated.window_size,
        transfer_size: negotiated.transfer_size,
    });

    let key = match oack
        .public_point()
        .ok_or_else(|| TransferError::Handshake("server sent no public key".into()))
        .and_then(|point| Ok(exchange.derive_key(&point?)?))
    {
        Ok(key) => key,
        Err(err) => {
            session.abort(ErrorCode::KeyExchange, &err.to_string());
            return Err(err);
        }
    };
    session.log(TransferEvent::KeyEstablished { fingerprint: key.fingerprint() });
    drop(exchange);

    let cipher = BlockCipher::new(&key);
    let received = run_receiver(&mut session, &negotiated, &cipher)?;
    Ok(Download {
        data: received.data,
        summary: received.summary,
    })
}

/// Wait for the server's OACK, resending the request with backoff. Returns
/// the OACK options and the session's source address.
fn await_option_ack(
    socket: &UdpSocket,
    server: SocketAddr,
    request: &[u8],
    config: &ClientConfig,
) -> Result<(Options, SocketAddr), TransferError> {
    let mut backoff = Backoff::new(config.session.backoff());
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        socket.set_read_timeout(Some(backoff.current().max(Duration::from_millis(1))))?;
        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if is_timeout(&e) => {
                backoff.on_timeout()?;
                tracing::debug!(
                    server = %server,
                    attempt = backoff.timeouts(),
                    "resending read request"
                );
                socket.send_to(request, server)?;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        // The session answers from a new port on the same host.
        if from.ip() != server.ip() {
            tracing::debug!(from = %from, "ignoring datagram from unexpected host");
            continue;
        }

        match Packet::decode(&buf[..n]) {
            Ok(Packet::OptionAck { options }) => return Ok((options, from)),
            Ok(Packet::Error { code, message }) => {
                return Err(TransferError::from_peer(code, &message));
            }
            Ok(Packet::Terminate) => return Err(TransferError::Terminated),
            Ok(other) => {
                tracing::debug!(from = %from, "unexpected {} before OACK", other.opcode());
            }
            Err(err) => tracing::debug!(from = %from, "malformed reply: {}", err),
        }
    }
}
