//! Datagram sealing.
//!
//! Wire format of one datagram unit:
//! ```text
//! ┌──────────┬─────────────────────────────┐
//! │ Salt     │ Payload + Tag (16)          │
//! └──────────┴─────────────────────────────┘
//! ```
//!
//! Every datagram has its own salt, so the nonce is always zero.

use bytes::{BufMut, Bytes, BytesMut};

use crate::crypto::{AeadKey, Nonce, SecureRandom, TAG_SIZE};
use crate::error::{Error, Result};

/// Seal a datagram under `key` with a fresh random salt.
pub fn seal_packet(key: &AeadKey, plaintext: &[u8]) -> Result<Bytes> {
    let salt = SecureRandom::salt(key.salt_size());
    seal_packet_with_salt(key, &salt, plaintext)
}

/// Seal a datagram under `key` with the given salt.
pub fn seal_packet_with_salt(key: &AeadKey, salt: &[u8], plaintext: &[u8]) -> Result<Bytes> {
    let aead = key.unit_cipher(salt)?;
    let sealed = aead.encrypt(&Nonce::zero(), plaintext)?;

    let mut buf = BytesMut::with_capacity(salt.len() + sealed.len());
    buf.put_slice(salt);
    buf.put_slice(&sealed);
    Ok(buf.freeze())
}

/// Open a datagram sealed under `key`.
///
/// The salt is the first `key.salt_size()` bytes of `packet`.
pub fn open_packet(key: &AeadKey, packet: &[u8]) -> Result<Vec<u8>> {
    let salt_size = key.salt_size();
    if packet.len() < salt_size + TAG_SIZE {
        return Err(Error::framing(format!(
            "datagram too short: {} bytes",
            packet.len()
        )));
    }

    let (salt, sealed) = packet.split_at(salt_size);
    key.unit_cipher(salt)?.decrypt(&Nonce::zero(), sealed)
}

/// Wire size of a datagram carrying `plaintext_len` bytes under `key`.
pub fn packet_len(key: &AeadKey, plaintext_len: usize) -> usize {
    key.salt_size() + plaintext_len + TAG_SIZE
}
