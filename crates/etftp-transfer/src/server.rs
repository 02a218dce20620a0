//! Request dispatcher and per-request sessions.
//!
//! The listening socket only ever sees the first packet of a transfer. Each
//! valid read request gets a thread and a fresh UDP socket connected to the
//! requester, so every transfer has its own transfer ID (port) and a crash
//! or stall in one session never touches the others.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use etftp_crypto::{BlockCipher, KeyExchange};
use parking_lot::Mutex;

use crate::config::SessionConfig;
use crate::error::TransferError;
use crate::link::{DropPolicy, LossyLink, connect_udp_socket, create_udp_socket, is_timeout};
use crate::logging::{TracingLogger, TransferEvent, TransferLogger};
use crate::options::Options;
use crate::packet::{ErrorCode, MAX_DATAGRAM, MODES, Packet, RequestKind};
use crate::sender::{prepare_blocks, run_sender};
use crate::session::Session;
use crate::source::PayloadSource;
use crate::stats::{TransferStats, TransferSummary};

/// Listener read timeout, so shutdown is noticed promptly.
pub const LISTEN_POLL: Duration = Duration::from_millis(100);

pub const DEFAULT_PORT: u16 = 7500;

#[derive(Clone)]
pub struct ServerConfig {
    /// Local defaults and limits for negotiation.
    pub session: SessionConfig,
    /// Simulated loss on outgoing DATA, for testing retransmission.
    pub drop_policy: DropPolicy,
    pub logger: Arc<dyn TransferLogger>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            session: SessionConfig::default(),
            drop_policy: DropPolicy::Never,
            logger: Arc::new(TracingLogger),
        }
    }
}

/// A transfer currently being served.
#[derive(Clone)]
pub struct ActiveSession {
    pub peer: SocketAddr,
    pub filename: String,
    pub stats: Arc<TransferStats>,
}

type Registry = Arc<Mutex<HashMap<u64, ActiveSession>>>;

pub struct Server {
    socket: UdpSocket,
    source: Arc<dyn PayloadSource>,
    config: Arc<ServerConfig>,
    shutdown: Arc<AtomicBool>,
    next_id: AtomicU64,
    sessions: Registry,
}

/// Stops a running [`Server::serve`] loop from another thread.
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: Arc<AtomicBool>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl Server {
    pub fn bind(
        addr: SocketAddr,
        source: impl PayloadSource + 'static,
        config: ServerConfig,
    ) -> io::Result<Self> {
        let socket = create_udp_socket(addr)?;
        socket.set_read_timeout(Some(LISTEN_POLL))?;
        Ok(Server {
            socket,
            source: Arc::new(source),
            config: Arc::new(config),
            shutdown: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(1),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn shutdown_handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    /// Snapshot of transfers in progress.
    pub fn active_sessions(&self) -> Vec<ActiveSession> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Accept requests until [`ServerHandle::shutdown`] is called. Sessions
    /// already running are left to finish on their own threads.
    pub fn serve(&self) -> io::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        tracing::info!(addr = %self.local_addr()?, "listening for read requests");

        while !self.shutdown.load(Ordering::SeqCst) {
            let (n, peer) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if is_timeout(&e) => continue,
                Err(e) => {
                    tracing::warn!("listener recv failed: {}", e);
                    continue;
                }
            };

            let datagram = &buf[..n];
            let handled =
                panic::catch_unwind(AssertUnwindSafe(|| self.handle_datagram(peer, datagram)));
            if let Err(panic) = handled {
                tracing::error!(peer = %peer, "dispatcher panicked: {}", panic_message(&*panic));
            }
        }

        tracing::info!("listener stopped");
        Ok(())
    }

    /// Classify one datagram from the listening socket and act on it.
    pub fn handle_datagram(&self, peer: SocketAddr, datagram: &[u8]) {
        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(err) => {
                tracing::debug!(peer = %peer, "malformed request: {}", err);
                self.reply(peer, ErrorCode::IllegalOperation, &format!("malformed packet: {err}"));
                return;
            }
        };

        match packet {
            Packet::Request { kind: RequestKind::Read, filename, mode, options } => {
                if !MODES.contains(&mode.as_str()) {
                    let message = format!("unsupported mode {mode}");
                    self.reply(peer, ErrorCode::IllegalOperation, &message);
                    return;
                }
                self.spawn_session(peer, ReadRequest { filename, mode, options });
            }
            Packet::Request { kind: RequestKind::Write, .. } => {
                self.reply(peer, ErrorCode::IllegalOperation, "write requests are not supported");
            }
            Packet::Data { .. } | Packet::Ack { .. } | Packet::OptionAck { .. } => {
                self.reply(peer, ErrorCode::UnknownTid, "unknown transfer id");
            }
            Packet::Error { code, message } => {
                tracing::debug!(
                    peer = %peer,
                    code,
                    "error packet on listener: {}",
                    String::from_utf8_lossy(&message)
                );
            }
            Packet::Terminate => {
                tracing::debug!(peer = %peer, "terminate on listener ignored");
            }
        }
    }

    fn reply(&self, peer: SocketAddr, code: ErrorCode, message: &str) {
        let packet = Packet::error(code, message).encode();
        if let Err(e) = self.socket.send_to(&packet, peer) {
            tracing::debug!(peer = %peer, "failed to send error reply: {}", e);
        }
    }

    fn spawn_session(&self, peer: SocketAddr, request: ReadRequest) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let local_ip = self.socket.local_addr().ok().map(|a| a.ip());
        let context = SessionContext {
            id,
            peer,
            local_ip,
            request,
            source: self.source.clone(),
            config: self.config.clone(),
            sessions: self.sessions.clone(),
        };

        let spawned = std::thread::Builder::new()
            .name(format!("etftp-session-{}", id))
            .spawn(move || run_session(context));
        if let Err(e) = spawned {
            tracing::error!(peer = %peer, "failed to spawn session thread: {}", e);
            self.reply(peer, ErrorCode::NotDefined, "server busy");
        }
    }
}

/// Bind on every interface at `port` with default settings and serve forever.
pub fn serve(port: u16, source: impl PayloadSource + 'static) -> io::Result<()> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    Server::bind(addr, source, ServerConfig::default())?.serve()
}

struct ReadRequest {
    filename: String,
    mode: String,
    options: Options,
}

struct SessionContext {
    id: u64,
    peer: SocketAddr,
    local_ip: Option<IpAddr>,
    request: ReadRequest,
    source: Arc<dyn PayloadSource>,
    config: Arc<ServerConfig>,
    sessions: Registry,
}

fn run_session(context: SessionContext) {
    let id = context.id;
    let peer = context.peer;
    let sessions = context.sessions.clone();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| serve_read_request(&context)));
    sessions.lock().remove(&id);

    match outcome {
        Ok(Ok(summary)) => {
            tracing::info!(
                session = id,
                peer = %peer,
                "transfer complete: {} bytes in {:.2}s ({} B/s), {} retransmits",
                summary.bytes,
                summary.elapsed.as_secs_f64(),
                summary.throughput_bps,
                summary.retransmits
            );
        }
        Ok(Err(e)) => tracing::warn!(session = id, peer = %peer, "transfer failed: {}", e),
        Err(panic) => {
            tracing::error!(
                session = id,
                peer = %peer,
                "session panicked: {}",
                panic_message(&*panic)
            );
        }
    }
}

fn serve_read_request(context: &SessionContext) -> Result<TransferSummary, TransferError> {
    let request = &context.request;
    let config = &context.config;

    let socket = connect_udp_socket(context.local_ip, context.peer)?;
    let link = LossyLink::new(socket, config.drop_policy.clone());
    let mut session = Session::new(link, context.peer, "server", config.logger.clone());
    session.log(TransferEvent::RequestReceived {
        filename: request.filename.clone(),
        mode: request.mode.clone(),
    });
    context.sessions.lock().insert(
        context.id,
        ActiveSession {
            peer: context.peer,
            filename: request.filename.clone(),
            stats: session.stats().clone(),
        },
    );

    let result = negotiate_and_send(&mut session, context);
    if let Err(err) = &result {
        // The engine has already told the peer about these.
        let peer_informed = matches!(
            err,
            TransferError::RetryExhausted { .. }
                | TransferError::Peer { .. }
                | TransferError::Terminated
        );
        if !peer_informed {
            session.abort(err.error_code(), &peer_message(err));
        }
    }
    result
}

fn negotiate_and_send(
    session: &mut Session<LossyLink<UdpSocket>>,
    context: &SessionContext,
) -> Result<TransferSummary, TransferError> {
    let request = &context.request;
    let config = &context.config;

    let payload = context.source.fetch(&request.filename)?;
    session.log(TransferEvent::PayloadFetched { bytes: payload.len() });

    let peer_point = request
        .options
        .public_point()
        .ok_or_else(|| TransferError::Handshake("request carries no public key".into()))??;
    let exchange = KeyExchange::generate();
    let key = exchange.derive_key(&peer_point)?;
    session.log(TransferEvent::KeyEstablished { fingerprint: key.fingerprint() });

    let (negotiated, mut oack) = config.session.negotiate(&request.options, payload.len() as u64);
    oack.set_public_point(&exchange.public_point());
    session.log(TransferEvent::OptionsNegotiated {
        block_size: negotiated.block_size,
        window_size: negotiated.window_size,
        transfer_size: negotiated.transfer_size,
    });

    let cipher = BlockCipher::new(&key);
    let sealed = prepare_blocks(&payload, negotiated.block_size, &cipher)?;
    drop(payload);

    let handshake = Packet::OptionAck { options: oack }.encode();
    session.send_raw(&handshake)?;
    run_sender(session, &negotiated, &sealed, Some(handshake.as_slice()))
}

/// Text for the ERROR packet sent when a session fails before or during
/// the transfer.
fn peer_message(err: &TransferError) -> String {
    match err {
        TransferError::NotFound(_) => "file not found".into(),
        TransferError::SourceUnavailable(_) => "payload unavailable".into(),
        other => other.to_string(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
