//! UDP NAT associations.
//!
//! One association per (client address, cipher entry). Each owns a
//! dual-stack outbound socket and a task that seals replies from any destination and sends them
//! back to the client through the port's inbound socket.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::proxy::{Address, TrafficHook};
use crate::server::cipher_table::CipherEntry;
use crate::server::metrics::ServerMetrics;
use crate::transport::{seal_packet, MAX_PACKET_SIZE};

/// Destinations remembered per association for reply labelling.
const MAX_TARGETS: usize = 256;

type NatKey = (SocketAddr, String);
type TargetMap = Arc<Mutex<HashMap<SocketAddr, Address>>>;

/// A live client ↔ destinations flow.
pub struct Association {
    entry: Arc<CipherEntry>,
    client_addr: SocketAddr,
    outbound: Arc<UdpSocket>,
    dual_stack: bool,
    /// Resolved destination -> address the client asked for
    targets: TargetMap,
    last_activity: Arc<Mutex<Instant>>,
    hook: Arc<dyn TrafficHook>,
    task: JoinHandle<()>,
}

impl Association {
    /// Open an outbound socket for `client_addr` and start relaying replies.
    ///
    /// The outbound socket is dual-stack where the host allows it, so one
    /// association reaches IPv4 and IPv6 destinations alike.
    pub fn open(
        entry: Arc<CipherEntry>,
        client_addr: SocketAddr,
        inbound: Arc<UdpSocket>,
        hook: Arc<dyn TrafficHook>,
        metrics: Arc<ServerMetrics>,
    ) -> Result<Self> {
        let (outbound, dual_stack) = bind_outbound()?;
        let outbound = Arc::new(outbound);
        let targets: TargetMap = Arc::new(Mutex::new(HashMap::new()));
        let last_activity = Arc::new(Mutex::new(Instant::now()));

        let task = tokio::spawn(reply_loop(
            Arc::clone(&entry),
            client_addr,
            Arc::clone(&outbound),
            inbound,
            Arc::clone(&targets),
            Arc::clone(&last_activity),
            Arc::clone(&hook),
            metrics,
        ));

        Ok(Self {
            entry,
            client_addr,
            outbound,
            dual_stack,
            targets,
            last_activity,
            hook,
            task,
        })
    }

    /// Forward a client payload to `target`, remembering how it was requested.
    pub async fn send(&self, target: SocketAddr, requested: Address, payload: &[u8]) -> Result<()> {
        {
            let mut targets = self.targets.lock();
            if !targets.contains_key(&target) {
                if targets.len() >= MAX_TARGETS {
                    targets.clear();
                }
                targets.insert(target, requested);
            }
        }
        self.touch();

        let dest = match (self.dual_stack, target) {
            (true, SocketAddr::V4(v4)) => SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port()),
            _ => target,
        };
        self.outbound.send_to(payload, dest).await?;
        Ok(())
    }

    /// Entry the association was opened under.
    pub fn entry(&self) -> &Arc<CipherEntry> {
        &self.entry
    }

    /// Accounting hook of the association's user.
    pub fn hook(&self) -> &dyn TrafficHook {
        self.hook.as_ref()
    }

    /// Client the association serves.
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Time since the last datagram in either direction.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }
}

/// Bind an ephemeral outbound socket, preferring `[::]:0`.
///
/// Falls back to IPv4 only when the host has no IPv6 stack.
fn bind_outbound() -> Result<(UdpSocket, bool)> {
    let (socket, dual_stack) = match std::net::UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0)) {
        Ok(socket) => (socket, true),
        Err(_) => (std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?, false),
    };
    socket.set_nonblocking(true)?;
    Ok((UdpSocket::from_std(socket)?, dual_stack))
}

/// Undo IPv4-mapped IPv6 addresses seen on a dual-stack socket.
fn canonical(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}

impl Drop for Association {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[allow(clippy::too_many_arguments)]
async fn reply_loop(
    entry: Arc<CipherEntry>,
    client_addr: SocketAddr,
    outbound: Arc<UdpSocket>,
    inbound: Arc<UdpSocket>,
    targets: TargetMap,
    last_activity: Arc<Mutex<Instant>>,
    hook: Arc<dyn TrafficHook>,
    metrics: Arc<ServerMetrics>,
) {
    let mut revoked = entry.revocation();
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    loop {
        let (n, from) = tokio::select! {
            res = outbound.recv_from(&mut buf) => match res {
                Ok((n, from)) => (n, canonical(from)),
                Err(e) => {
                    tracing::debug!("NAT receive error for {}: {}", client_addr, e);
                    continue;
                }
            },
            res = revoked.changed() => {
                if res.is_err() || *revoked.borrow() {
                    tracing::debug!("NAT association for {} revoked", client_addr);
                    return;
                }
                continue;
            }
        };
        *last_activity.lock() = Instant::now();

        let label = targets
            .lock()
            .get(&from)
            .cloned()
            .unwrap_or(Address::Socket(from));

        let mut plaintext = BytesMut::with_capacity(label.encoded_len() + n);
        if let Err(e) = label.write_to(&mut plaintext) {
            tracing::debug!("Cannot label reply from {}: {}", from, e);
            continue;
        }
        plaintext.extend_from_slice(&buf[..n]);

        let packet = match seal_packet(entry.key(), &plaintext) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!("Cannot seal reply for {}: {}", client_addr, e);
                continue;
            }
        };

        match inbound.send_to(&packet, client_addr).await {
            Ok(sent) => {
                hook.add_down(sent as u64);
                metrics.increment_datagrams_out();
            }
            Err(e) => tracing::debug!("Reply to {} failed: {}", client_addr, e),
        }
    }
}

/// All associations of one port.
#[derive(Default)]
pub struct NatTable {
    associations: Mutex<HashMap<NatKey, Arc<Association>>>,
}

impl NatTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Association for `client_addr` under exactly `entry`.
    ///
    /// An association opened under a since-replaced entry with the same id is
    /// not returned.
    pub fn get(&self, client_addr: SocketAddr, entry: &Arc<CipherEntry>) -> Option<Arc<Association>> {
        self.associations
            .lock()
            .get(&(client_addr, entry.id().to_string()))
            .filter(|assoc| Arc::ptr_eq(&assoc.entry, entry))
            .cloned()
    }

    /// Insert an association, replacing any previous one for the same key.
    pub fn insert(&self, association: Arc<Association>) {
        let key = (association.client_addr, association.entry.id().to_string());
        self.associations.lock().insert(key, association);
    }

    /// Drop associations idle for at least `timeout`, and those whose entry
    /// was revoked. Returns how many were dropped.
    pub fn expire_idle(&self, timeout: Duration) -> usize {
        let mut associations = self.associations.lock();
        let before = associations.len();
        associations.retain(|_, assoc| assoc.idle_for() < timeout && !assoc.entry.is_revoked());
        before - associations.len()
    }

    /// Drop every association.
    pub fn clear(&self) {
        self.associations.lock().clear();
    }

    /// Number of live associations.
    pub fn len(&self) -> usize {
        self.associations.lock().len()
    }

    /// Whether there are no associations.
    pub fn is_empty(&self) -> bool {
        self.associations.lock().is_empty()
    }
}
