//! Datagram transport under a session.
//!
//! A [`Link`] is an already-connected, bidirectional datagram pipe: one peer,
//! no addressing. The real thing is a connected [`UdpSocket`]; tests use
//! [`MemoryLink`] and wrap either in [`LossyLink`] to simulate packet loss.

use std::collections::BTreeSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::packet::{ACK_SIZE, DATA_HEADER, Opcode, Packet};

/// OS socket buffer size for session sockets (4 MB).
pub const UDP_SOCKET_BUFFER: usize = 4 * 1024 * 1024;

/// Shortest read timeout handed to the OS; zero means "block forever".
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

pub trait Link {
    fn send(&self, datagram: &[u8]) -> io::Result<()>;

    /// Wait up to `timeout` for one datagram. `Ok(None)` on timeout.
    fn recv(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>>;
}

impl<L: Link + ?Sized> Link for &L {
    fn send(&self, datagram: &[u8]) -> io::Result<()> {
        (**self).send(datagram)
    }

    fn recv(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        (**self).recv(buf, timeout)
    }
}

impl Link for UdpSocket {
    fn send(&self, datagram: &[u8]) -> io::Result<()> {
        UdpSocket::send(self, datagram).map(|_| ())
    }

    fn recv(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        let timeout = timeout.max(MIN_READ_TIMEOUT);
        self.set_read_timeout(Some(timeout))?;
        match UdpSocket::recv(self, buf) {
            Ok(n) => Ok(Some(n)),
            // Windows returns TimedOut, Unix returns WouldBlock
            Err(e) if is_timeout(&e) => Ok(None),
            // ICMP port unreachable from a departed peer; treat it as silence.
            Err(e) if is_refused(&e) => {
                std::thread::sleep(timeout);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn is_refused(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset)
}

fn unspecified_for(peer: &SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// Bind a UDP socket with enlarged OS buffers. Port 0 picks an ephemeral port.
pub fn create_udp_socket(bind: SocketAddr) -> io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(false)?;
    socket.bind(&bind.into())?;
    // Best effort: some systems cap buffer sizes below what we ask for.
    let _ = socket.set_recv_buffer_size(UDP_SOCKET_BUFFER);
    let _ = socket.set_send_buffer_size(UDP_SOCKET_BUFFER);
    Ok(socket.into())
}

/// Fresh ephemeral socket connected to `peer`, bound on `local_ip` when it
/// is a concrete address.
pub fn connect_udp_socket(local_ip: Option<IpAddr>, peer: SocketAddr) -> io::Result<UdpSocket> {
    let bind = match local_ip {
        Some(ip) if !ip.is_unspecified() && ip.is_ipv4() == peer.is_ipv4() => {
            SocketAddr::new(ip, 0)
        }
        _ => unspecified_for(&peer),
    };
    let socket = create_udp_socket(bind)?;
    socket.connect(peer)?;
    Ok(socket)
}

/// Unconnected ephemeral socket able to reach `server`.
pub fn client_udp_socket(server: SocketAddr) -> io::Result<UdpSocket> {
    create_udp_socket(unspecified_for(&server))
}

/// In-process link over crossbeam channels.
pub struct MemoryLink {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl MemoryLink {
    /// Two connected ends.
    pub fn pair() -> (MemoryLink, MemoryLink) {
        let (a_tx, a_rx) = crossbeam_channel::unbounded();
        let (b_tx, b_rx) = crossbeam_channel::unbounded();
        (
            MemoryLink { tx: a_tx, rx: b_rx },
            MemoryLink { tx: b_tx, rx: a_rx },
        )
    }
}

impl Link for MemoryLink {
    fn send(&self, datagram: &[u8]) -> io::Result<()> {
        // Datagrams to a departed peer vanish, like UDP.
        let _ = self.tx.send(datagram.to_vec());
        Ok(())
    }

    fn recv(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        match self.rx.recv_timeout(timeout) {
            Ok(datagram) => {
                // Oversized datagrams are truncated, as recv(2) does.
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(Some(n))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }
}

/// Which outgoing packets a [`LossyLink`] discards.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum DropPolicy {
    #[default]
    Never,
    /// Drop each DATA packet with this probability (0.0 - 1.0).
    Rate(f64),
    /// Drop the first transmission of each listed wire block number.
    FirstTransmission(BTreeSet<u16>),
    /// Drop the first ACK sent for each listed wire block number.
    FirstAck(BTreeSet<u16>),
}

/// Wraps a link and silently discards selected outgoing DATA or ACK
/// packets. Every other packet type passes through untouched.
pub struct LossyLink<L> {
    inner: L,
    policy: DropPolicy,
    pending: Mutex<BTreeSet<u16>>,
    dropped: AtomicU64,
}

impl<L: Link> LossyLink<L> {
    pub fn new(inner: L, policy: DropPolicy) -> Self {
        let pending = match &policy {
            DropPolicy::FirstTransmission(blocks) | DropPolicy::FirstAck(blocks) => blocks.clone(),
            _ => BTreeSet::new(),
        };
        LossyLink {
            inner,
            policy,
            pending: Mutex::new(pending),
            dropped: AtomicU64::new(0),
        }
    }

    /// Packets discarded so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn get_ref(&self) -> &L {
        &self.inner
    }

    fn should_drop(&self, datagram: &[u8]) -> bool {
        let is_data = datagram.len() >= DATA_HEADER
            && Packet::peek_opcode(datagram) == Ok(Opcode::Data);
        let is_ack = datagram.len() == ACK_SIZE
            && Packet::peek_opcode(datagram) == Ok(Opcode::Ack);
        match &self.policy {
            DropPolicy::Never => false,
            DropPolicy::Rate(rate) => is_data && rand::random::<f64>() < *rate,
            DropPolicy::FirstTransmission(_) => is_data && self.take_pending(datagram),
            DropPolicy::FirstAck(_) => is_ack && self.take_pending(datagram),
        }
    }

    fn take_pending(&self, datagram: &[u8]) -> bool {
        let block = u16::from_be_bytes([datagram[2], datagram[3]]);
        self.pending.lock().remove(&block)
    }
}

impl<L: Link> Link for LossyLink<L> {
    fn send(&self, datagram: &[u8]) -> io::Result<()> {
        if self.should_drop(datagram) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        self.inner.send(datagram)
    }

    fn recv(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        self.inner.recv(buf, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(block: u16) -> Vec<u8> {
        Packet::Data { block, checksum: 0, payload: vec![0xAA; 4] }.encode()
    }

    #[test]
    fn memory_link_delivers_both_ways() {
        let (a, b) = MemoryLink::pair();
        let mut buf = [0u8; 16];

        a.send(b"ping").unwrap();
        assert_eq!(b.recv(&mut buf, Duration::from_millis(100)).unwrap(), Some(4));
        assert_eq!(&buf[..4], b"ping");

        b.send(b"pong").unwrap();
        assert_eq!(a.recv(&mut buf, Duration::from_millis(100)).unwrap(), Some(4));
    }

    #[test]
    fn memory_link_times_out() {
        let (a, _b) = MemoryLink::pair();
        let mut buf = [0u8; 16];
        assert_eq!(a.recv(&mut buf, Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn first_transmission_dropped_once() {
        let (a, b) = MemoryLink::pair();
        let lossy = LossyLink::new(a, DropPolicy::FirstTransmission([5].into_iter().collect()));
        let mut buf = [0u8; 64];

        lossy.send(&data(5)).unwrap();
        assert_eq!(b.recv(&mut buf, Duration::from_millis(10)).unwrap(), None);

        lossy.send(&data(5)).unwrap();
        assert!(b.recv(&mut buf, Duration::from_millis(100)).unwrap().is_some());

        lossy.send(&data(6)).unwrap();
        assert!(b.recv(&mut buf, Duration::from_millis(100)).unwrap().is_some());
        assert_eq!(lossy.dropped(), 1);
    }

    #[test]
    fn full_loss_spares_control_packets() {
        let (a, b) = MemoryLink::pair();
        let lossy = LossyLink::new(a, DropPolicy::Rate(1.0));
        let mut buf = [0u8; 64];

        lossy.send(&data(1)).unwrap();
        lossy.send(&Packet::Ack { block: 1 }.encode()).unwrap();
        assert_eq!(b.recv(&mut buf, Duration::from_millis(100)).unwrap(), Some(4));
        assert_eq!(Packet::decode(&buf[..4]).unwrap(), Packet::Ack { block: 1 });
        assert_eq!(lossy.dropped(), 1);
    }

    #[test]
    fn udp_link_roundtrip_and_timeout() {
        let a = create_udp_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = connect_udp_socket(None, a.local_addr().unwrap()).unwrap();
        a.connect(b.local_addr().unwrap()).unwrap();

        let mut buf = [0u8; 16];
        Link::send(&b, b"hi").unwrap();
        assert_eq!(Link::recv(&a, &mut buf, Duration::from_millis(500)).unwrap(), Some(2));
        assert_eq!(Link::recv(&a, &mut buf, Duration::from_millis(20)).unwrap(), None);
    }

    #[test]
    fn first_ack_dropped_once() {
        let (a, b) = MemoryLink::pair();
        let lossy = LossyLink::new(a, DropPolicy::FirstAck([0].into_iter().collect()));
        let mut buf = [0u8; 64];

        lossy.send(&data(0)).unwrap();
        assert!(b.recv(&mut buf, Duration::from_millis(100)).unwrap().is_some());

        lossy.send(&Packet::Ack { block: 0 }.encode()).unwrap();
        assert_eq!(b.recv(&mut buf, Duration::from_millis(10)).unwrap(), None);

        lossy.send(&Packet::Ack { block: 0 }.encode()).unwrap();
        assert_eq!(b.recv(&mut buf, Duration::from_millis(100)).unwrap(), Some(ACK_SIZE));
        assert_eq!(lossy.dropped(), 1);
    }
}
