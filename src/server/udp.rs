//! UDP relay for one port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{timeout, MissedTickBehavior};

use crate::error::{Error, Result};
use crate::proxy::{Address, TrafficHook};
use crate::server::cipher_table::{identify_packet, CipherTable};
use crate::server::nat::{Association, NatTable};
use crate::server::traffic::UserTraffic;
use crate::server::SharedState;
use crate::transport::MAX_PACKET_SIZE;

/// Datagram relay bound to one port.
///
/// Identification happens on the receive loop. Everything that may wait on
/// the network (resolving, sending) runs in a task of its own, so one slow
/// destination never holds up other clients.
pub struct UdpService {
    port: u16,
    socket: Arc<UdpSocket>,
    table: Arc<CipherTable>,
    shared: SharedState,
    nat: NatTable,
}

/// An authenticated datagram waiting to be forwarded.
struct Forward {
    association: Arc<Association>,
    requested: Address,
    payload: Vec<u8>,
    wire_len: usize,
}

impl UdpService {
    /// Bind the port's UDP socket.
    pub async fn bind(addr: SocketAddr, table: Arc<CipherTable>, shared: SharedState) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(|source| Error::Bind {
            port: addr.port(),
            source,
        })?;
        let port = socket.local_addr()?.port();

        Ok(Self {
            port,
            socket: Arc::new(socket),
            table,
            shared,
            nat: NatTable::new(),
        })
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve datagrams until `shutdown` changes. Associations are dropped on exit.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let nat_timeout = self.shared.config.nat_timeout;
        let mut sweep = tokio::time::interval(sweep_interval(nat_timeout));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        loop {
            tokio::select! {
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((n, client_addr)) => match self.accept_datagram(&buf[..n], client_addr) {
                        Ok(forward) => {
                            let shared = self.shared.clone();
                            tokio::spawn(async move {
                                if let Err(e) = forward.send(&shared).await {
                                    tracing::debug!("Datagram from {} dropped: {}", client_addr, e);
                                }
                            });
                        }
                        Err(e) => tracing::debug!("Datagram from {} dropped: {}", client_addr, e),
                    },
                    Err(e) => tracing::debug!("UDP receive error on port {}: {}", self.port, e),
                },
                _ = sweep.tick() => {
                    let expired = self.nat.expire_idle(nat_timeout);
                    if expired > 0 {
                        self.shared.metrics.add_nat_expired(expired as u64);
                        tracing::debug!("Expired {} NAT associations on port {}", expired, self.port);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        self.nat.clear();
        tracing::debug!("UDP relay on port {} stopped", self.port);
    }

    /// Identify a datagram and find or open its association. Never waits.
    fn accept_datagram(&self, packet: &[u8], client_addr: SocketAddr) -> Result<Forward> {
        let metrics = &self.shared.metrics;
        metrics.increment_datagrams_in();

        let hit = identify_packet(&self.table, &self.shared.replay, packet, client_addr.ip())
            .map_err(|e| self.shared.count_rejection(e))?;
        metrics.increment_authenticated();

        let mut plaintext = hit.plaintext;
        let (requested, header_len) =
            Address::parse(&plaintext).map_err(|e| self.shared.count_rejection(e))?;
        let payload = plaintext.split_off(header_len);

        let association = match self.nat.get(client_addr, &hit.entry) {
            Some(association) => association,
            None => {
                let hook: Arc<dyn TrafficHook> = Arc::new(UserTraffic::new(
                    hit.entry.id(),
                    Arc::clone(&self.shared.traffic),
                    Arc::clone(metrics),
                ));
                let association = Arc::new(Association::open(
                    Arc::clone(&hit.entry),
                    client_addr,
                    Arc::clone(&self.socket),
                    hook,
                    Arc::clone(metrics),
                )?);
                self.nat.insert(Arc::clone(&association));
                metrics.increment_nat_created();
                tracing::debug!(
                    "NAT association {} as {} on port {}",
                    client_addr,
                    hit.entry.id(),
                    self.port
                );
                association
            }
        };

        Ok(Forward {
            association,
            requested,
            payload,
            wire_len: packet.len(),
        })
    }
}

impl Forward {
    /// Resolve the destination and hand the payload to the association.
    async fn send(self, shared: &SharedState) -> Result<()> {
        let connect_timeout = shared.config.connect_timeout;
        let target = timeout(connect_timeout, shared.resolver.resolve(&self.requested))
            .await
            .map_err(|_| Error::Timeout(connect_timeout.as_millis() as u64))??;

        self.association.hook().add_up(self.wire_len as u64);
        self.association
            .send(target, self.requested, &self.payload)
            .await
    }
}

fn sweep_interval(nat_timeout: Duration) -> Duration {
    (nat_timeout / 4).max(Duration::from_secs(1))
}
