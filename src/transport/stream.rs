//! Chunked AEAD stream framing.
//!
//! A stream unit is the sender's salt followed by a sequence of chunks:
//!
//! ```text
//! ┌──────────┬────────────────────────────┬──────────────────────────────┐
//! │ Salt     │ Length (2, BE) + Tag (16)  │ Payload (1..=0x3FFF) + Tag   │ ...
//! └──────────┴────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! Both the length block and the payload are sealed under the unit subkey,
//! each consuming one nonce.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::{Aead, AeadKey, Nonce, SecureRandom, TAG_SIZE};
use crate::error::{Error, Result};
use crate::transport::{LENGTH_BLOCK_SIZE, MAX_PAYLOAD_SIZE};

/// Seals plaintext into chunks under one unit cipher.
pub struct StreamEncryptor {
    aead: Aead,
    nonce: Nonce,
}

impl StreamEncryptor {
    /// Create an encryptor with a fresh nonce counter.
    pub fn new(aead: Aead) -> Self {
        Self {
            aead,
            nonce: Nonce::zero(),
        }
    }

    /// Seal `plaintext` as one or more chunks, appending them to `out`.
    ///
    /// Empty input produces no chunks.
    pub fn seal_into(&mut self, plaintext: &[u8], out: &mut BytesMut) -> Result<()> {
        for piece in plaintext.chunks(MAX_PAYLOAD_SIZE) {
            let len = (piece.len() as u16).to_be_bytes();
            let sealed_len = self.aead.encrypt(&self.nonce, &len)?;
            self.nonce.increment();

            let sealed_payload = self.aead.encrypt(&self.nonce, piece)?;
            self.nonce.increment();

            out.reserve(sealed_len.len() + sealed_payload.len());
            out.put_slice(&sealed_len);
            out.put_slice(&sealed_payload);
        }
        Ok(())
    }
}

/// Opens chunks sealed by a [`StreamEncryptor`].
pub struct StreamDecryptor {
    aead: Aead,
    nonce: Nonce,
}

impl StreamDecryptor {
    /// Create a decryptor with a fresh nonce counter.
    pub fn new(aead: Aead) -> Self {
        Self {
            aead,
            nonce: Nonce::zero(),
        }
    }

    /// Open a sealed length block and return the payload length it announces.
    pub fn open_length(&mut self, block: &[u8]) -> Result<usize> {
        if block.len() != LENGTH_BLOCK_SIZE {
            return Err(Error::framing(format!(
                "length block must be {} bytes, got {}",
                LENGTH_BLOCK_SIZE,
                block.len()
            )));
        }

        let plain = self.aead.decrypt(&self.nonce, block)?;
        self.nonce.increment();

        let len = u16::from_be_bytes([plain[0], plain[1]]) as usize;
        if len == 0 || len > MAX_PAYLOAD_SIZE {
            return Err(Error::framing(format!("invalid chunk length {}", len)));
        }
        Ok(len)
    }

    /// Open a sealed payload block.
    pub fn open_payload(&mut self, block: &[u8]) -> Result<Vec<u8>> {
        let plain = self.aead.decrypt(&self.nonce, block)?;
        self.nonce.increment();
        Ok(plain)
    }
}

/// Reads a chunked stream and yields decrypted payloads.
pub struct ChunkReader<R> {
    inner: R,
    decryptor: StreamDecryptor,
    /// Ciphertext read from `inner` but not yet consumed
    buffered: BytesMut,
    /// Payload length already announced by an opened length block
    pending_len: Option<usize>,
    /// Plaintext opened but not yet handed out
    plain: BytesMut,
    wire_bytes: u64,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    /// Create a reader positioned at the first length block.
    pub fn new(inner: R, decryptor: StreamDecryptor) -> Self {
        Self::with_prefix(inner, decryptor, BytesMut::new(), None, 0)
    }

    /// Create a reader that continues where identification left off.
    ///
    /// `buffered` holds ciphertext already pulled off the wire, `pending_len`
    /// the payload length of a length block that was already opened, and
    /// `consumed` the wire bytes spent so far (salt plus length block).
    pub fn with_prefix(
        inner: R,
        decryptor: StreamDecryptor,
        buffered: BytesMut,
        pending_len: Option<usize>,
        consumed: u64,
    ) -> Self {
        Self {
            inner,
            decryptor,
            buffered,
            pending_len,
            plain: BytesMut::new(),
            wire_bytes: consumed,
        }
    }

    /// Read the peer's salt from `inner`, then set up a reader under `key`.
    pub async fn from_salted(mut inner: R, key: &AeadKey) -> Result<Self> {
        let mut salt = vec![0u8; key.salt_size()];
        inner.read_exact(&mut salt).await?;
        let decryptor = StreamDecryptor::new(key.unit_cipher(&salt)?);
        Ok(Self::with_prefix(
            inner,
            decryptor,
            BytesMut::new(),
            None,
            salt.len() as u64,
        ))
    }

    /// Read the next piece of plaintext.
    ///
    /// Returns `Ok(None)` on a clean end of stream (EOF at a chunk boundary).
    /// EOF inside a chunk is a framing error.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        if !self.plain.is_empty() {
            return Ok(Some(self.plain.split().freeze()));
        }
        self.next_chunk().await
    }

    /// Fill `out` completely with plaintext, crossing chunk boundaries as needed.
    pub async fn read_plain_exact(&mut self, out: &mut [u8]) -> Result<()> {
        while self.plain.len() < out.len() {
            match self.next_chunk().await? {
                Some(chunk) => self.plain.extend_from_slice(&chunk),
                None => return Err(Error::framing("stream ended early")),
            }
        }
        out.copy_from_slice(&self.plain.split_to(out.len()));
        Ok(())
    }

    /// Wire bytes consumed since the last call.
    pub fn take_wire_bytes(&mut self) -> u64 {
        std::mem::take(&mut self.wire_bytes)
    }

    /// Give back the underlying reader.
    pub fn into_inner(self) -> R {
        self.inner
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let len = match self.pending_len.take() {
            Some(len) => len,
            None => {
                if !self.fill(LENGTH_BLOCK_SIZE).await? {
                    return Ok(None);
                }
                let block = self.buffered.split_to(LENGTH_BLOCK_SIZE);
                self.wire_bytes += LENGTH_BLOCK_SIZE as u64;
                self.decryptor.open_length(&block)?
            }
        };

        let sealed = len + TAG_SIZE;
        if !self.fill(sealed).await? {
            return Err(Error::framing("stream ended inside a chunk"));
        }
        let block = self.buffered.split_to(sealed);
        self.wire_bytes += sealed as u64;

        let plain = self.decryptor.open_payload(&block)?;
        Ok(Some(Bytes::from(plain)))
    }

    /// Buffer at least `n` bytes. Returns `false` on EOF with nothing buffered.
    async fn fill(&mut self, n: usize) -> Result<bool> {
        while self.buffered.len() < n {
            self.buffered.reserve(n - self.buffered.len());
            if self.inner.read_buf(&mut self.buffered).await? == 0 {
                if self.buffered.is_empty() {
                    return Ok(false);
                }
                return Err(Error::framing("stream ended inside a chunk"));
            }
        }
        Ok(true)
    }
}

/// Writes plaintext as a salted chunk stream.
pub struct ChunkWriter<W> {
    inner: W,
    encryptor: StreamEncryptor,
    /// Salt still to be sent ahead of the first chunk
    salt: Option<Vec<u8>>,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> ChunkWriter<W> {
    /// Create a writer under `key` with a fresh random salt.
    pub fn new(inner: W, key: &AeadKey) -> Result<Self> {
        Self::with_salt(inner, key, SecureRandom::salt(key.salt_size()))
    }

    /// Create a writer under `key` with the given salt.
    pub fn with_salt(inner: W, key: &AeadKey, salt: Vec<u8>) -> Result<Self> {
        let encryptor = StreamEncryptor::new(key.unit_cipher(&salt)?);
        Ok(Self {
            inner,
            encryptor,
            salt: Some(salt),
            buf: BytesMut::new(),
        })
    }

    /// The salt this writer opened (or will open) its stream with.
    pub fn salt(&self) -> Option<&[u8]> {
        self.salt.as_deref()
    }

    /// Seal and write `plaintext`. Returns the number of wire bytes written.
    pub async fn write_chunk(&mut self, plaintext: &[u8]) -> Result<usize> {
        self.buf.clear();
        if let Some(salt) = self.salt.take() {
            self.buf.put_slice(&salt);
        }
        self.encryptor.seal_into(plaintext, &mut self.buf)?;

        self.inner.write_all(&self.buf).await?;
        Ok(self.buf.len())
    }

    /// Flush and shut down the write side of the underlying stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    /// Give back the underlying writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CipherKind;

    fn key() -> AeadKey {
        AeadKey::from_secret(CipherKind::Chacha20IetfPoly1305, "stream-test")
    }

    #[tokio::test]
    async fn test_chunk_round_trip() {
        let key = key();
        let (client, server) = tokio::io::duplex(128 * 1024);

        let mut writer = ChunkWriter::new(client, &key).unwrap();
        let written = writer.write_chunk(b"hello").await.unwrap();
        assert_eq!(written, 32 + LENGTH_BLOCK_SIZE + 5 + TAG_SIZE);
        writer.write_chunk(b" world").await.unwrap();
        writer.shutdown().await.unwrap();

        let mut reader = ChunkReader::from_salted(server, &key).await.unwrap();
        assert_eq!(&reader.read_chunk().await.unwrap().unwrap()[..], b"hello");
        assert_eq!(&reader.read_chunk().await.unwrap().unwrap()[..], b" world");
        assert!(reader.read_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_large_write_is_split() {
        let key = key();
        let (client, server) = tokio::io::duplex(256 * 1024);
        let data: Vec<u8> = (0..40_000u32).map(|i| i as u8).collect();

        let mut writer = ChunkWriter::new(client, &key).unwrap();
        let written = writer.write_chunk(&data).await.unwrap();
        // 3 chunks: 16383 + 16383 + 7234
        assert_eq!(written, 32 + data.len() + 3 * (LENGTH_BLOCK_SIZE + TAG_SIZE));
        writer.shutdown().await.unwrap();

        let mut reader = ChunkReader::from_salted(server, &key).await.unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = reader.read_chunk().await.unwrap() {
            assert!(chunk.len() <= MAX_PAYLOAD_SIZE);
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, data);
        assert_eq!(reader.take_wire_bytes(), written as u64);
    }

    #[tokio::test]
    async fn test_read_plain_exact_crosses_chunks() {
        let key = key();
        let (client, server) = tokio::io::duplex(4096);

        let mut writer = ChunkWriter::new(client, &key).unwrap();
        writer.write_chunk(b"ab").await.unwrap();
        writer.write_chunk(b"cdef").await.unwrap();
        writer.shutdown().await.unwrap();

        let mut reader = ChunkReader::from_salted(server, &key).await.unwrap();
        let mut first = [0u8; 3];
        reader.read_plain_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"abc");
        assert_eq!(&reader.read_chunk().await.unwrap().unwrap()[..], b"def");
    }

    #[tokio::test]
    async fn test_wrong_key_fails_authentication() {
        let (client, server) = tokio::io::duplex(4096);

        let mut writer = ChunkWriter::new(client, &key()).unwrap();
        writer.write_chunk(b"secret").await.unwrap();

        let other = AeadKey::from_secret(CipherKind::Chacha20IetfPoly1305, "other");
        let mut reader = ChunkReader::from_salted(server, &other).await.unwrap();
        assert!(matches!(
            reader.read_chunk().await,
            Err(Error::Authentication)
        ));
    }

    #[tokio::test]
    async fn test_truncated_chunk_is_framing_error() {
        let key = key();
        let mut sealed = BytesMut::new();
        let salt = vec![7u8; 32];
        let mut encryptor = StreamEncryptor::new(key.unit_cipher(&salt).unwrap());
        encryptor.seal_into(b"truncated", &mut sealed).unwrap();

        let mut wire = salt.clone();
        wire.extend_from_slice(&sealed[..sealed.len() - 4]);

        let mut reader = ChunkReader::from_salted(&wire[..], &key).await.unwrap();
        assert!(matches!(reader.read_chunk().await, Err(Error::Framing(_))));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let key = key();
        let salt = [1u8; 32];
        let sealer = key.unit_cipher(&salt).unwrap();
        let block = sealer.encrypt(&Nonce::zero(), &[0x40, 0x00]).unwrap();

        let mut decryptor = StreamDecryptor::new(key.unit_cipher(&salt).unwrap());
        assert!(matches!(
            decryptor.open_length(&block),
            Err(Error::Framing(_))
        ));
    }
}
