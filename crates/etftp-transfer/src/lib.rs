//! Encrypted TFTP transfer engine.
//!
//! Read requests are served over UDP with RFC 2347 option negotiation. The
//! RRQ and OACK carry ephemeral P-256 public keys (`keyx`/`keyy`), and every
//! DATA payload is sealed with AES-256-GCM under the agreed key. Delivery is
//! a sliding window with cumulative ACKs and exponential backoff.
//!
//! Server side: [`Server`] binds a listening socket and hands each read
//! request to its own session thread and socket. Client side:
//! [`request_file`] runs the handshake and receiver against one server.

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod link;
pub mod logging;
pub mod options;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod session;
pub mod source;
pub mod stats;
pub mod window;

pub use client::{ClientConfig, Download, request_file};
pub use config::SessionConfig;
pub use error::{ParseError, TransferError};
pub use link::{DropPolicy, Link, LossyLink, MemoryLink};
pub use logging::{NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use options::Options;
pub use packet::{ErrorCode, Opcode, Packet, RequestKind};
pub use server::{Server, ServerConfig, ServerHandle, serve};
pub use source::{CachedSource, MemorySource, PayloadSource, SourceError};
pub use stats::{TransferStats, TransferSummary};
