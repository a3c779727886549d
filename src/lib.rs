//! # ssgate
//!
//! A multi-user, multi-port AEAD tunneling relay. Clients carry no cleartext
//! identity: the server finds the user whose key authenticates the first
//! sealed block of a connection or datagram, then relays the traffic to the
//! destination named inside it and accounts the bytes to that user.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Server: roster reconciliation, per-port TCP/UDP relay  │
//! ├─────────────────────────────────────────────────────────┤
//! │  Proxy: destination addresses, full-duplex relay        │
//! ├─────────────────────────────────────────────────────────┤
//! │  Transport: salted chunk streams, sealed datagrams      │
//! ├─────────────────────────────────────────────────────────┤
//! │  Crypto: AES-GCM / ChaCha20-Poly1305, HKDF-SHA1 subkeys │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Goals
//!
//! 1. **Uniform rejection**: every failed identification looks the same on the wire
//! 2. **Replay resistance**: a salt authenticates at most once
//! 3. **Live reconfiguration**: roster changes never disturb unaffected sessions

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod crypto;
pub mod error;
pub mod proxy;
pub mod transport;

#[cfg(feature = "server")]
pub mod server;

pub use error::{Error, Result};
pub use transport::MAX_PAYLOAD_SIZE;

/// Default deadline for identification plus the destination address (milliseconds)
pub const HANDSHAKE_TIMEOUT_MS: u64 = 59_000;

/// Default idle time before a UDP association is reclaimed (milliseconds)
pub const NAT_TIMEOUT_MS: u64 = 300_000;
