//! AEAD framing for stream and datagram traffic.
//!
//! Two unit shapes share the same key schedule:
//!
//! 1. **Stream**: the salt, then length-prefixed chunks, each length and each
//!    payload sealed separately with an incrementing nonce.
//!
//! 2. **Datagram**: the salt, then a single sealed payload under a zero nonce.
//!
//! ## Layout
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  ChunkReader / ChunkWriter (async I/O)        │
//! ├───────────────────────────────────────────────┤
//! │  StreamEncryptor / StreamDecryptor            │
//! ├───────────────────────────────────────────────┤
//! │  seal_packet / open_packet                    │
//! ├───────────────────────────────────────────────┤
//! │  crypto::AeadKey -> unit subkey -> Aead       │
//! └───────────────────────────────────────────────┘
//! ```

mod packet;
mod stream;

pub use packet::{open_packet, packet_len, seal_packet, seal_packet_with_salt};
pub use stream::{ChunkReader, ChunkWriter, StreamDecryptor, StreamEncryptor};

use crate::crypto::{MAX_SALT_SIZE, TAG_SIZE};

/// Largest payload carried by one stream chunk
pub const MAX_PAYLOAD_SIZE: usize = 0x3FFF;

/// Sealed length field: 2-byte big-endian length plus tag
pub const LENGTH_BLOCK_SIZE: usize = 2 + TAG_SIZE;

/// Raw bytes needed to identify any stream: largest salt plus first length block
pub const STREAM_PREFIX_SIZE: usize = MAX_SALT_SIZE + LENGTH_BLOCK_SIZE;

/// Receive buffer size for datagrams
pub const MAX_PACKET_SIZE: usize = 64 * 1024;
