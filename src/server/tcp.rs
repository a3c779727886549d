//! TCP relay for one port.
//!
//! Per connection: identify the user from the first raw bytes, read the
//! destination address, connect, then relay until both directions finish.
//! Anything that fails before relaying is answered with silence: the client's
//! bytes are drained until it gives up or the handshake deadline passes.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{timeout, timeout_at, Instant};

use crate::error::{Error, Result};
use crate::proxy::{relay_stream, Address, SessionSignals};
use crate::server::cipher_table::{identify_stream, CipherTable};
use crate::server::traffic::UserTraffic;
use crate::server::SharedState;
use crate::transport::{ChunkReader, ChunkWriter, STREAM_PREFIX_SIZE};

/// Stream relay bound to one port.
pub struct TcpService {
    port: u16,
    listener: TcpListener,
    table: Arc<CipherTable>,
    shared: SharedState,
}

impl TcpService {
    /// Bind the port's listener.
    pub async fn bind(addr: SocketAddr, table: Arc<CipherTable>, shared: SharedState) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind {
            port: addr.port(),
            source,
        })?;
        let port = listener.local_addr()?.port();

        Ok(Self {
            port,
            listener,
            table,
            shared,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` changes.
    ///
    /// The listener is closed on return. Sessions already running get the same
    /// signal and wind down on their own.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let mut stop = shutdown.clone();

        loop {
            tokio::select! {
                res = self.listener.accept() => match res {
                    Ok((stream, peer_addr)) => {
                        let table = Arc::clone(&self.table);
                        let shared = self.shared.clone();
                        let shutdown = shutdown.clone();

                        tokio::spawn(async move {
                            shared.metrics.increment_connections();

                            if let Err(e) =
                                Self::handle_connection(table, &shared, stream, peer_addr, shutdown).await
                            {
                                tracing::debug!("Connection error from {}: {}", peer_addr, e);
                            }

                            shared.metrics.decrement_connections();
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Accept error on port {}: {}", self.port, e);
                    }
                },
                _ = stop.changed() => break,
            }
        }

        tracing::debug!("TCP listener on port {} stopped", self.port);
    }

    async fn handle_connection(
        table: Arc<CipherTable>,
        shared: &SharedState,
        stream: TcpStream,
        peer_addr: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        stream.set_nodelay(true)?;
        let config = &shared.config;
        let deadline = Instant::now() + config.handshake_timeout;
        let handshake_ms = config.handshake_timeout.as_millis() as u64;
        let (mut reader, writer) = stream.into_split();

        let mut prefix = [0u8; STREAM_PREFIX_SIZE];
        match timeout_at(deadline, reader.read_exact(&mut prefix)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                shared.metrics.increment_timeouts();
                return Err(Error::Timeout(handshake_ms));
            }
        }

        let hit = match identify_stream(&table, &shared.replay, &prefix, peer_addr.ip()) {
            Ok(hit) => hit,
            Err(e) => {
                let e = shared.count_rejection(e);
                drain(reader, deadline).await;
                return Err(e);
            }
        };
        shared.metrics.increment_authenticated();
        let entry = hit.entry;

        let mut client_reader = ChunkReader::with_prefix(
            reader,
            hit.decryptor,
            BytesMut::from(&prefix[hit.consumed..]),
            Some(hit.payload_len),
            hit.consumed as u64,
        );

        let target = match timeout_at(deadline, Address::read_from(&mut client_reader)).await {
            Ok(Ok(target)) => target,
            Ok(Err(e)) => {
                let e = shared.count_rejection(e);
                drain(client_reader.into_inner(), deadline).await;
                return Err(e);
            }
            Err(_) => {
                shared.metrics.increment_timeouts();
                return Err(Error::Timeout(handshake_ms));
            }
        };

        tracing::debug!("{} -> {} as {}", peer_addr, target, entry.id());

        let target_addr = shared.resolver.resolve(&target).await?;
        let outbound = timeout(config.connect_timeout, TcpStream::connect(target_addr))
            .await
            .map_err(|_| Error::Timeout(config.connect_timeout.as_millis() as u64))?
            .map_err(|e| Error::TargetUnreachable(format!("{}: {}", target, e)))?;
        outbound.set_nodelay(true)?;
        let (target_reader, target_writer) = outbound.into_split();

        let mut client_writer = ChunkWriter::new(writer, entry.key())?;
        if let Some(salt) = client_writer.salt() {
            shared.replay.record(salt);
        }

        let hook = UserTraffic::new(
            entry.id(),
            Arc::clone(&shared.traffic),
            Arc::clone(&shared.metrics),
        );
        let signals = SessionSignals::new(shutdown, entry.revocation());

        relay_stream(
            &mut client_reader,
            &mut client_writer,
            target_reader,
            target_writer,
            &hook,
            &signals,
            config.shutdown_grace,
        )
        .await
    }
}

/// Discard client bytes until EOF, an error, or `deadline`.
async fn drain(mut reader: OwnedReadHalf, deadline: Instant) {
    let _ = timeout_at(deadline, tokio::io::copy(&mut reader, &mut tokio::io::sink())).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CipherKind;
    use crate::server::resolver::StaticResolver;
    use crate::server::roster::UserKey;
    use crate::server::testing::{open_stream, tcp_echo_stub};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    async fn start(users: &[UserKey], shared: SharedState) -> (SocketAddr, watch::Sender<bool>) {
        let table = Arc::new(CipherTable::new(users));
        let service = TcpService::bind("127.0.0.1:0".parse().unwrap(), table, shared)
            .await
            .unwrap();
        let addr = service.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(service.run(rx));
        (addr, tx)
    }

    #[tokio::test]
    async fn test_ping_echo_through_named_target() {
        let echo = tcp_echo_stub().await;
        let shared = SharedState::for_tests(Arc::new(StaticResolver::new().insert("example.test", echo)));
        let users = vec![
            UserKey::new("alice", 9000, CipherKind::Aes256Gcm, "tcp-a"),
            UserKey::new("bob", 9000, CipherKind::Chacha20IetfPoly1305, "tcp-b"),
        ];
        let (server, _stop) = start(&users, shared.clone()).await;

        let target = Address::Domain("example.test".into(), 80);
        let (mut reader, mut writer) = open_stream(server, &users[1], &target, b"ping").await.unwrap();

        let mut echoed = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(5), reader.read_plain_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&echoed, b"ping");

        writer.shutdown().await.unwrap();
        let end = tokio::time::timeout(Duration::from_secs(5), reader.read_chunk())
            .await
            .unwrap()
            .unwrap();
        assert!(end.is_none());

        let snapshot = shared.metrics.snapshot();
        assert_eq!(snapshot.authenticated_sessions, 1);
        assert!(shared.traffic.get("bob").is_some());
        assert!(shared.traffic.get("alice").is_none());
    }

    #[tokio::test]
    async fn test_unknown_key_gets_silence() {
        let shared = SharedState::for_tests(Arc::new(StaticResolver::new()));
        let user = UserKey::new("alice", 9000, CipherKind::Aes128Gcm, "tcp-a");
        let (server, _stop) = start(&[user], shared.clone()).await;

        let mut stream = TcpStream::connect(server).await.unwrap();
        stream.write_all(&[0x42u8; 128]).await.unwrap();
        stream.shutdown().await.unwrap();

        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(shared.metrics.snapshot().identification_failures, 1);
    }

    #[tokio::test]
    async fn test_replayed_stream_rejected() {
        let echo = tcp_echo_stub().await;
        let shared = SharedState::for_tests(Arc::new(StaticResolver::new()));
        let user = UserKey::new("alice", 9000, CipherKind::Aes256Gcm, "tcp-a");
        let (server, _stop) = start(&[user.clone()], shared.clone()).await;

        let key = user.master_key();
        let mut first = BytesMut::new();
        Address::Socket(echo).write_to(&mut first).unwrap();
        first.extend_from_slice(b"hello");
        let mut recorded = ChunkWriter::new(Vec::new(), &key).unwrap();
        recorded.write_chunk(&first).await.unwrap();
        let recorded = recorded.into_inner();

        let mut original = TcpStream::connect(server).await.unwrap();
        original.write_all(&recorded).await.unwrap();
        let mut buf = [0u8; 1];
        tokio::time::timeout(Duration::from_secs(5), original.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();

        let mut replayed = TcpStream::connect(server).await.unwrap();
        replayed.write_all(&recorded).await.unwrap();
        replayed.shutdown().await.unwrap();
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), replayed.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(shared.metrics.snapshot().replays, 1);
    }

    #[tokio::test]
    async fn test_bad_address_after_identification_counted() {
        let shared = SharedState::for_tests(Arc::new(StaticResolver::new()));
        let user = UserKey::new("alice", 9000, CipherKind::Aes256Gcm, "tcp-a");
        let (server, _stop) = start(&[user.clone()], shared.clone()).await;

        // atyp 0x09 is not an address type
        let mut sealed = ChunkWriter::new(Vec::new(), &user.master_key()).unwrap();
        sealed.write_chunk(&[0x09, 1, 2, 3, 4, 0, 80]).await.unwrap();
        let sealed = sealed.into_inner();

        let mut stream = TcpStream::connect(server).await.unwrap();
        stream.write_all(&sealed).await.unwrap();
        stream.shutdown().await.unwrap();

        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        let snapshot = shared.metrics.snapshot();
        assert_eq!(snapshot.authenticated_sessions, 1);
        assert_eq!(snapshot.identification_failures, 1);
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let mut shared = SharedState::for_tests(Arc::new(StaticResolver::new()));
        let mut config = (*shared.config).clone();
        config.handshake_timeout = Duration::from_millis(200);
        shared.config = Arc::new(config);
        let user = UserKey::new("alice", 9000, CipherKind::Aes128Gcm, "tcp-a");
        let (server, _stop) = start(&[user], shared.clone()).await;

        let mut stream = TcpStream::connect(server).await.unwrap();
        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(shared.metrics.snapshot().timeouts, 1);
    }
}
