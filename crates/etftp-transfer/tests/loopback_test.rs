//! Integration test: serve payloads from a real server on localhost and
//! fetch them with the client over UDP loopback.

use std::collections::BTreeSet;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use etftp_transfer::packet::{Opcode, Packet};
use etftp_transfer::{
    ClientConfig, DropPolicy, MemorySource, NullLogger, Server, ServerConfig, ServerHandle,
    SessionConfig, TransferError, TransferLog, TransferLogger, request_file,
};
use parking_lot::Mutex;

#[derive(Default)]
struct CollectingLogger {
    events: Mutex<Vec<String>>,
}

impl TransferLogger for CollectingLogger {
    fn log(&self, entry: TransferLog) {
        self.events.lock().push(entry.event.to_string());
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn fast_session() -> SessionConfig {
    SessionConfig {
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(400),
        max_timeouts: 8,
        ..Default::default()
    }
}

fn client_config() -> ClientConfig {
    ClientConfig {
        session: fast_session(),
        timeout_option: None,
        drop_policy: DropPolicy::Never,
        logger: Arc::new(NullLogger),
    }
}

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

fn start_server(source: MemorySource, config: ServerConfig) -> TestServer {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let server = Server::bind("127.0.0.1:0".parse().unwrap(), source, config).unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.shutdown_handle();
    let thread = thread::spawn(move || server.serve());
    TestServer { addr, handle, thread: Some(thread) }
}

fn server_config() -> ServerConfig {
    ServerConfig {
        session: fast_session(),
        drop_policy: DropPolicy::Never,
        logger: Arc::new(NullLogger),
    }
}

#[test]
fn small_payload_default_block_size() {
    let payload = pattern(10_000);
    let source = MemorySource::new().with_file("small.bin", payload.clone());
    let server = start_server(source, server_config());

    let download = request_file(server.addr, "small.bin", &client_config()).unwrap();
    assert_eq!(download.data, payload);
    // 19 full blocks of 512 and a final block of 272
    assert_eq!(download.summary.blocks, 20);
    assert_eq!(download.summary.bytes, 10_000);
}

#[test]
fn exact_block_multiple_ends_with_empty_block() {
    let payload = pattern(2048);
    let source = MemorySource::new().with_file("exact.bin", payload.clone());
    let server = start_server(source, server_config());

    let download = request_file(server.addr, "exact.bin", &client_config()).unwrap();
    assert_eq!(download.data, payload);
    assert_eq!(download.summary.blocks, 5);
}

#[test]
fn empty_payload() {
    let source = MemorySource::new().with_file("empty.bin", Vec::new());
    let server = start_server(source, server_config());

    let download = request_file(server.addr, "empty.bin", &client_config()).unwrap();
    assert!(download.data.is_empty());
    assert_eq!(download.summary.blocks, 1);
}

#[test]
fn large_payload_with_negotiated_options() {
    let payload = pattern(1024 * 1024);
    let source = MemorySource::new().with_file("large.bin", payload.clone());
    let server = start_server(source, server_config());

    let mut config = client_config();
    config.session.block_size = 1428;
    config.session.window_size = 16;
    config.timeout_option = Some(1);

    let download = request_file(server.addr, "large.bin", &config).unwrap();
    assert_eq!(download.data, payload);
    assert_eq!(download.summary.blocks, (1024 * 1024 / 1428 + 1) as u64);
}

#[test]
fn dropped_block_is_retransmitted() {
    let payload = pattern(10_000);
    let logger = Arc::new(CollectingLogger::default());
    let config = ServerConfig {
        drop_policy: DropPolicy::FirstTransmission(BTreeSet::from([5])),
        logger: logger.clone(),
        ..server_config()
    };
    let source = MemorySource::new().with_file("lossy.bin", payload.clone());
    let server = start_server(source, config);

    let download = request_file(server.addr, "lossy.bin", &client_config()).unwrap();
    assert_eq!(download.data, payload);
    assert!(download.summary.rejected >= 1);

    let events = logger.events.lock().clone();
    assert!(events.iter().any(|e| e.starts_with("window_rewound base=5")));
}

#[test]
fn missing_payload_is_not_found() {
    let server = start_server(MemorySource::new(), server_config());

    let err = request_file(server.addr, "nope.bin", &client_config()).unwrap_err();
    assert!(matches!(err, TransferError::NotFound(_)), "got {err:?}");
}

#[test]
fn silent_server_exhausts_retries() {
    let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut config = client_config();
    config.session.initial_delay = Duration::from_millis(20);
    config.session.max_delay = Duration::from_millis(100);
    config.session.max_timeouts = 5;

    let err = request_file(silent.local_addr().unwrap(), "anything", &config).unwrap_err();
    assert!(matches!(err, TransferError::RetryExhausted { timeouts: 5 }), "got {err:?}");

    // The original request plus one resend per tolerated timeout.
    silent.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
    let mut buf = [0u8; 1024];
    let mut requests = 0;
    while let Ok((n, _)) = silent.recv_from(&mut buf) {
        assert_eq!(Packet::peek_opcode(&buf[..n]), Ok(Opcode::Rrq));
        requests += 1;
    }
    assert_eq!(requests, 5);
}

#[test]
fn concurrent_sessions_are_independent() {
    let mut source = MemorySource::new();
    for i in 0..4 {
        source.insert(format!("file-{i}"), pattern(20_000 + i * 1000));
    }
    let server = start_server(source, server_config());
    let addr = server.addr;

    let workers: Vec<_> = (0..4)
        .map(|i| {
            thread::spawn(move || {
                let download = request_file(addr, &format!("file-{i}"), &client_config()).unwrap();
                assert_eq!(download.data, pattern(20_000 + i * 1000));
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn lost_ack_zero_is_recovered() {
    let payload = pattern(3000);
    let source = MemorySource::new().with_file("ack0.bin", payload.clone());
    let server = start_server(source, server_config());

    let config = ClientConfig {
        drop_policy: DropPolicy::FirstAck(BTreeSet::from([0])),
        ..client_config()
    };
    let download = request_file(server.addr, "ack0.bin", &config).unwrap();
    assert_eq!(download.data, payload);
}

#[test]
fn lost_final_ack_completes_on_both_ends() {
    let payload = pattern(10_000);
    let logger = Arc::new(CollectingLogger::default());
    let logged = ServerConfig {
        logger: logger.clone(),
        ..server_config()
    };
    let source = MemorySource::new().with_file("final.bin", payload.clone());
    let server = start_server(source, logged);

    let config = ClientConfig {
        drop_policy: DropPolicy::FirstAck(BTreeSet::from([20])),
        ..client_config()
    };
    let download = request_file(server.addr, "final.bin", &config).unwrap();
    assert_eq!(download.data, payload);

    let events = logger.events.lock().clone();
    assert!(events.iter().any(|e| e.starts_with("window_rewound")), "{events:?}");
    assert!(events.iter().any(|e| e.starts_with("transfer_complete")), "{events:?}");
    assert!(!events.iter().any(|e| e.starts_with("aborted")), "{events:?}");
}
