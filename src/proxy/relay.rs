//! Full-duplex relay between an authenticated client stream and a target.
//!
//! The two directions run independently:
//! - client → target: chunks are opened and written raw to the target. When
//!   the client finishes, the target's write half is shut down.
//! - target → client: raw reads are sealed into chunks. When the target
//!   finishes, the client's write half is shut down.
//!
//! The session ends once both directions are done, or as soon as either one
//! fails.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::transport::{ChunkReader, ChunkWriter, MAX_PAYLOAD_SIZE};

/// Receives wire byte counts from relay activity.
pub trait TrafficHook: Send + Sync {
    /// Bytes read from the client.
    fn add_up(&self, bytes: u64);

    /// Bytes written to the client.
    fn add_down(&self, bytes: u64);
}

/// Discards all counts.
pub struct NoopTraffic;

impl TrafficHook for NoopTraffic {
    fn add_up(&self, _bytes: u64) {}
    fn add_down(&self, _bytes: u64) {}
}

/// Stop signals a session listens to.
#[derive(Clone)]
pub struct SessionSignals {
    /// Port is stopping: stop reading from the client, drain the target for
    /// at most the grace period.
    shutdown: watch::Receiver<bool>,
    /// The session's key was revoked: tear down immediately.
    revoked: watch::Receiver<bool>,
}

impl SessionSignals {
    /// Create signals from a port shutdown channel and a key revocation channel.
    pub fn new(shutdown: watch::Receiver<bool>, revoked: watch::Receiver<bool>) -> Self {
        Self { shutdown, revoked }
    }

    /// Signals that never fire.
    pub fn detached() -> Self {
        Self {
            shutdown: watch::channel(false).1,
            revoked: watch::channel(false).1,
        }
    }

    /// Whether the port has been asked to stop.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Whether the key has been revoked.
    pub fn is_revoked(&self) -> bool {
        *self.revoked.borrow()
    }

    /// Resolves once the port is asked to stop.
    pub async fn shutdown_requested(&self) {
        signalled(self.shutdown.clone()).await
    }

    /// Resolves once the key is revoked.
    pub async fn revocation(&self) {
        signalled(self.revoked.clone()).await
    }
}

/// Wait until the channel carries `true`. Never resolves if the sender is gone.
async fn signalled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Relay between a client chunk stream and a raw target stream.
///
/// # Arguments
///
/// * `client_reader` / `client_writer` - the authenticated client halves
/// * `target_reader` / `target_writer` - the outbound connection halves
/// * `hook` - receives client-side wire byte counts as they happen
/// * `signals` - port shutdown and key revocation
/// * `grace` - how long target → client may keep draining after shutdown
///
/// # Errors
///
/// A decode error or I/O error in either direction ends the whole session.
/// Revocation ends it with [`Error::Revoked`].
#[allow(clippy::too_many_arguments)]
pub async fn relay_stream<CR, CW, TR, TW>(
    client_reader: &mut ChunkReader<CR>,
    client_writer: &mut ChunkWriter<CW>,
    mut target_reader: TR,
    mut target_writer: TW,
    hook: &dyn TrafficHook,
    signals: &SessionSignals,
    grace: Duration,
) -> Result<()>
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    TR: AsyncRead + Unpin,
    TW: AsyncWrite + Unpin,
{
    let upstream = async {
        loop {
            let chunk = tokio::select! {
                chunk = client_reader.read_chunk() => chunk?,
                _ = signals.shutdown_requested() => None,
            };
            hook.add_up(client_reader.take_wire_bytes());

            match chunk {
                Some(data) => target_writer.write_all(&data).await?,
                None => break,
            }
        }
        target_writer.shutdown().await?;
        Ok::<(), Error>(())
    };

    let downstream = async {
        let mut buf = vec![0u8; MAX_PAYLOAD_SIZE];
        loop {
            let n = target_reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            let written = client_writer.write_chunk(&buf[..n]).await?;
            hook.add_down(written as u64);
        }
        client_writer.shutdown().await?;
        Ok::<(), Error>(())
    };

    let downstream = async {
        tokio::pin!(downstream);
        tokio::select! {
            res = &mut downstream => res,
            _ = signals.shutdown_requested() => {
                match tokio::time::timeout(grace, &mut downstream).await {
                    Ok(res) => res,
                    Err(_) => {
                        tracing::debug!("shutdown grace expired, closing session");
                        Ok(())
                    }
                }
            }
        }
    };

    tokio::select! {
        res = async { tokio::try_join!(upstream, downstream).map(|_| ()) } => res,
        _ = signals.revocation() => Err(Error::Revoked),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AeadKey, CipherKind};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::io::DuplexStream;

    #[derive(Default)]
    struct Counter {
        up: AtomicU64,
        down: AtomicU64,
    }

    impl TrafficHook for Counter {
        fn add_up(&self, bytes: u64) {
            self.up.fetch_add(bytes, Ordering::Relaxed);
        }
        fn add_down(&self, bytes: u64) {
            self.down.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    fn key() -> AeadKey {
        AeadKey::from_secret(CipherKind::Aes256Gcm, "relay-test")
    }

    /// Echoes everything back and closes its write side on EOF.
    fn spawn_echo(target: DuplexStream) {
        tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(target);
            let _ = tokio::io::copy(&mut r, &mut w).await;
            let _ = w.shutdown().await;
        });
    }

    struct Harness {
        client_writer: ChunkWriter<tokio::io::WriteHalf<DuplexStream>>,
        client_read: tokio::io::ReadHalf<DuplexStream>,
        server_reader: ChunkReader<tokio::io::ReadHalf<DuplexStream>>,
        server_writer: ChunkWriter<tokio::io::WriteHalf<DuplexStream>>,
    }

    /// Connect a client and server pair; the client's salt travels with `first`.
    async fn harness(key: &AeadKey, first: &[u8]) -> Harness {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        let mut client_writer = ChunkWriter::new(client_write, key).unwrap();
        client_writer.write_chunk(first).await.unwrap();

        Harness {
            client_writer,
            client_read,
            server_reader: ChunkReader::from_salted(server_read, key).await.unwrap(),
            server_writer: ChunkWriter::new(server_write, key).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_relay_echo_with_half_close() {
        let key = key();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        let mut client_writer = ChunkWriter::new(client_write, &key).unwrap();
        client_writer.write_chunk(b"ping").await.unwrap();
        client_writer.shutdown().await.unwrap();

        let (target, stub) = tokio::io::duplex(64 * 1024);
        spawn_echo(stub);
        let (target_read, target_write) = tokio::io::split(target);

        let counter = Counter::default();
        let mut server_reader = ChunkReader::from_salted(server_read, &key).await.unwrap();
        let mut server_writer = ChunkWriter::new(server_write, &key).unwrap();
        relay_stream(
            &mut server_reader,
            &mut server_writer,
            target_read,
            target_write,
            &counter,
            &SessionSignals::detached(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        let mut client_reader = ChunkReader::from_salted(client_read, &key).await.unwrap();
        assert_eq!(&client_reader.read_chunk().await.unwrap().unwrap()[..], b"ping");
        assert!(client_reader.read_chunk().await.unwrap().is_none());

        // salt is counted by the reader that consumed it
        assert_eq!(counter.up.load(Ordering::Relaxed), (18 + 4 + 16) as u64 + 32);
        assert_eq!(counter.down.load(Ordering::Relaxed), (32 + 18 + 4 + 16) as u64);
    }

    #[tokio::test]
    async fn test_shutdown_grace_bounds_session() {
        let key = key();
        let mut h = harness(&key, b"hold").await;

        // target never answers and never closes
        let (target, _stub) = tokio::io::duplex(1024);
        let (target_read, target_write) = tokio::io::split(target);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let signals = SessionSignals::new(shutdown_rx, watch::channel(false).1);

        let relay = relay_stream(
            &mut h.server_reader,
            &mut h.server_writer,
            target_read,
            target_write,
            &NoopTraffic,
            &signals,
            Duration::from_millis(100),
        );
        let stopper = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown_tx.send(true).unwrap();
        };

        let (res, _) = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(relay, stopper)
        })
        .await
        .unwrap();
        assert!(res.is_ok());
        drop(h.client_writer);
        drop(h.client_read);
    }

    #[tokio::test]
    async fn test_revocation_tears_down() {
        let key = key();
        let mut h = harness(&key, b"x").await;

        let (target, _stub) = tokio::io::duplex(1024);
        let (target_read, target_write) = tokio::io::split(target);

        let (revoke_tx, revoke_rx) = watch::channel(false);
        let signals = SessionSignals::new(watch::channel(false).1, revoke_rx);
        revoke_tx.send(true).unwrap();

        let res = relay_stream(
            &mut h.server_reader,
            &mut h.server_writer,
            target_read,
            target_write,
            &NoopTraffic,
            &signals,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(res, Err(Error::Revoked)));
        assert!(signals.is_revoked());
    }

    #[tokio::test]
    async fn test_decode_error_is_fatal() {
        let key = key();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (_client_read, mut client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        // valid salt followed by garbage
        client_write.write_all(&[3u8; 32]).await.unwrap();
        client_write.write_all(&[0xEEu8; 40]).await.unwrap();

        let (target, _stub) = tokio::io::duplex(1024);
        let (target_read, target_write) = tokio::io::split(target);

        let mut server_reader = ChunkReader::from_salted(server_read, &key).await.unwrap();
        let mut server_writer = ChunkWriter::new(server_write, &key).unwrap();
        let res = relay_stream(
            &mut server_reader,
            &mut server_writer,
            target_read,
            target_write,
            &NoopTraffic,
            &SessionSignals::detached(),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(res, Err(Error::Authentication)));
    }
}
