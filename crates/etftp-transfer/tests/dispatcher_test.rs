//! Integration test: what the listening socket answers to each kind of
//! first packet, and that bad requests never disturb other sessions.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use etftp_crypto::KeyExchange;
use etftp_transfer::options::Options;
use etftp_transfer::packet::{ErrorCode, Packet};
use etftp_transfer::{
    ClientConfig, MemorySource, NullLogger, Server, ServerConfig, ServerHandle, SessionConfig,
    request_file,
};

struct TestServer {
    addr: SocketAddr,
    handle: ServerHandle,
    thread: Option<JoinHandle<std::io::Result<()>>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn session_config() -> SessionConfig {
    SessionConfig {
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        max_timeouts: 4,
        ..Default::default()
    }
}

fn start_server() -> TestServer {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let source = MemorySource::new().with_file("hello.txt", b"hello, world".to_vec());
    let config = ServerConfig {
        session: session_config(),
        logger: Arc::new(NullLogger),
        ..Default::default()
    };
    let server = Server::bind("127.0.0.1:0".parse().unwrap(), source, config).unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.shutdown_handle();
    let thread = thread::spawn(move || server.serve());
    TestServer { addr, handle, thread: Some(thread) }
}

fn raw_client() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
    socket
}

/// Send one datagram and return the reply with its source address.
fn exchange(server: SocketAddr, datagram: &[u8]) -> Option<(Packet, SocketAddr)> {
    let socket = raw_client();
    socket.send_to(datagram, server).unwrap();
    let mut buf = [0u8; 2048];
    let (n, from) = socket.recv_from(&mut buf).ok()?;
    Some((Packet::decode(&buf[..n]).unwrap(), from))
}

fn error_code(packet: &Packet) -> u16 {
    match packet {
        Packet::Error { code, .. } => *code,
        other => panic!("expected ERROR, got {other:?}"),
    }
}

fn read_request(filename: &str, mode: &str, options: Options) -> Vec<u8> {
    Packet::Request {
        kind: etftp_transfer::RequestKind::Read,
        filename: filename.into(),
        mode: mode.into(),
        options,
    }
    .encode()
}

#[test]
fn write_request_rejected() {
    let server = start_server();
    let (reply, from) = exchange(server.addr, b"\x00\x02upload.bin\x00octet\x00").unwrap();
    assert_eq!(error_code(&reply), ErrorCode::IllegalOperation.code());
    assert_eq!(from, server.addr);
}

#[test]
fn garbage_rejected() {
    let server = start_server();
    let (reply, _) = exchange(server.addr, &[0xFF, 0xFF, 0x01]).unwrap();
    assert_eq!(error_code(&reply), ErrorCode::IllegalOperation.code());

    let (reply, _) = exchange(server.addr, &[0x00]).unwrap();
    assert_eq!(error_code(&reply), ErrorCode::IllegalOperation.code());
}

#[test]
fn stray_transfer_packets_get_unknown_tid() {
    let server = start_server();
    let strays = [
        Packet::Ack { block: 3 },
        Packet::Data { block: 1, checksum: 0, payload: vec![1] },
    ];
    for packet in strays {
        let (reply, _) = exchange(server.addr, &packet.encode()).unwrap();
        assert_eq!(error_code(&reply), ErrorCode::UnknownTid.code());
    }
}

#[test]
fn error_and_terminate_are_ignored() {
    let server = start_server();
    assert!(exchange(server.addr, &Packet::error(ErrorCode::Aborted, "bye").encode()).is_none());
    assert!(exchange(server.addr, &Packet::Terminate.encode()).is_none());
}

#[test]
fn unsupported_mode_rejected() {
    let server = start_server();
    let request = read_request("hello.txt", "mail", Options::new());
    let (reply, _) = exchange(server.addr, &request).unwrap();
    assert_eq!(error_code(&reply), ErrorCode::IllegalOperation.code());
}

#[test]
fn request_without_key_fails_key_exchange() {
    let server = start_server();
    let request = read_request("hello.txt", "octet", Options::new());
    let (reply, from) = exchange(server.addr, &request).unwrap();
    assert_eq!(error_code(&reply), ErrorCode::KeyExchange.code());
    // Sessions answer from their own port.
    assert_ne!(from, server.addr);
}

#[test]
fn off_curve_key_fails_key_exchange() {
    let server = start_server();
    let mut options = Options::new();
    options.insert("keyx", "01");
    options.insert("keyy", "01");
    let (reply, _) = exchange(server.addr, &read_request("hello.txt", "octet", options)).unwrap();
    let Packet::Error { code, message } = reply else {
        panic!("expected ERROR");
    };
    assert_eq!(code, ErrorCode::KeyExchange.code());
    assert!(String::from_utf8_lossy(&message).contains("invalid public key"));
}

#[test]
fn missing_file_reported_from_session() {
    let server = start_server();
    let mut options = Options::new();
    options.set_public_point(&KeyExchange::generate().public_point());
    let (reply, _) = exchange(server.addr, &read_request("absent.txt", "octet", options)).unwrap();
    assert_eq!(error_code(&reply), ErrorCode::FileNotFound.code());
}

#[test]
fn abandoned_handshake_is_aborted() {
    let server = start_server();
    let socket = raw_client();
    let mut options = Options::new();
    options.set_public_point(&KeyExchange::generate().public_point());
    socket
        .send_to(&read_request("hello.txt", "octet", options), server.addr)
        .unwrap();

    // Never ACK the OACK: expect resends, then the abort notice.
    let mut buf = [0u8; 2048];
    let mut oacks = 0;
    loop {
        let (n, _) = socket.recv_from(&mut buf).unwrap();
        match Packet::decode(&buf[..n]).unwrap() {
            Packet::OptionAck { .. } => oacks += 1,
            Packet::Error { code, .. } => {
                assert_eq!(code, ErrorCode::Aborted.code());
                break;
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(oacks, 4);
}

#[test]
fn bad_requests_do_not_disturb_good_ones() {
    let server = start_server();
    for _ in 0..3 {
        exchange(server.addr, &[0xFF, 0xFF]);
        exchange(server.addr, &read_request("hello.txt", "octet", Options::new()));
    }

    let config = ClientConfig {
        session: session_config(),
        logger: Arc::new(NullLogger),
        ..Default::default()
    };
    let download = request_file(server.addr, "hello.txt", &config).unwrap();
    assert_eq!(download.data, b"hello, world");
}

#[test]
fn shutdown_stops_listener() {
    let mut server = start_server();
    server.handle.shutdown();
    let result = server.thread.take().unwrap().join().unwrap();
    assert!(result.is_ok());
}
