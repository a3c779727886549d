//! Port/key reconciliation.
//!
//! The controller exclusively owns the map of bound ports. Each pass compares
//! the desired roster with what is bound, starts and stops ports, and replaces
//! every surviving port's cipher table wholesale. Relay tasks only ever see
//! their own port's table.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::crypto::random_jitter;
use crate::error::Result;
use crate::server::cipher_table::{CipherEntry, CipherTable};
use crate::server::config::DrainPolicy;
use crate::server::roster::{roster_fingerprints, Fingerprint, RosterSource, UserKey};
use crate::server::tcp::TcpService;
use crate::server::udp::UdpService;
use crate::server::SharedState;

/// What a pass does to one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDelta {
    /// Newly required: bind it
    Start,
    /// No longer required: unbind it
    Stop,
    /// Still required: refresh its table
    Refresh,
}

impl PortDelta {
    /// Signed form: `+1`, `-1` or `0`.
    pub fn sign(self) -> i8 {
        match self {
            PortDelta::Start => 1,
            PortDelta::Stop => -1,
            PortDelta::Refresh => 0,
        }
    }
}

/// Result of comparing a roster with the bound ports.
#[derive(Debug, Default)]
pub struct ReconcilePlan {
    /// Change per affected port
    pub deltas: BTreeMap<u16, PortDelta>,
    /// Desired users of every required port, in roster order
    pub tables: BTreeMap<u16, Vec<UserKey>>,
    /// Ids ignored because an earlier roster entry used them
    pub skipped_users: Vec<String>,
}

/// Compute the per-port deltas for `roster` given the `bound` ports.
pub fn plan(roster: &[UserKey], bound: &BTreeSet<u16>) -> ReconcilePlan {
    let mut result = ReconcilePlan::default();
    let mut seen = HashSet::with_capacity(roster.len());

    for user in roster {
        if user.port == 0 || !seen.insert(user.id.as_str()) {
            result.skipped_users.push(user.id.clone());
            continue;
        }
        result.tables.entry(user.port).or_default().push(user.clone());
    }

    for port in result.tables.keys() {
        let delta = if bound.contains(port) {
            PortDelta::Refresh
        } else {
            PortDelta::Start
        };
        result.deltas.insert(*port, delta);
    }
    for port in bound {
        if !result.tables.contains_key(port) {
            result.deltas.insert(*port, PortDelta::Stop);
        }
    }

    result
}

/// Outcome of one applied pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Newly bound ports
    pub started: Vec<u16>,
    /// Ports whose listeners were closed
    pub stopped: Vec<u16>,
    /// Ports whose key set was swapped in place
    pub refreshed: Vec<u16>,
    /// Ports that could not be bound, with the reason
    pub failed: Vec<(u16, String)>,
    /// Duplicate ids left out of the pass
    pub skipped_users: Vec<String>,
}

impl ReconcileReport {
    /// Whether every port reached its desired state.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A running port: TCP listener, UDP socket, and their shared cipher table.
pub struct PortBinding {
    port: u16,
    table: Arc<CipherTable>,
    shutdown: watch::Sender<bool>,
    tcp: JoinHandle<()>,
    udp: JoinHandle<()>,
}

impl PortBinding {
    /// Bind TCP and UDP on `listen_addr:port` and start serving `users`.
    ///
    /// Nothing stays bound if either bind fails.
    pub async fn start(
        listen_addr: IpAddr,
        port: u16,
        users: &[UserKey],
        shared: SharedState,
    ) -> Result<Self> {
        let addr = SocketAddr::new(listen_addr, port);
        let table = Arc::new(CipherTable::new(users));

        let tcp = TcpService::bind(addr, Arc::clone(&table), shared.clone()).await?;
        let udp = UdpService::bind(addr, Arc::clone(&table), shared).await?;

        let (shutdown, rx) = watch::channel(false);
        Ok(Self {
            port,
            table,
            tcp: tokio::spawn(tcp.run(rx.clone())),
            udp: tokio::spawn(udp.run(rx)),
            shutdown,
        })
    }

    /// Port number.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The port's cipher table.
    pub fn table(&self) -> &Arc<CipherTable> {
        &self.table
    }

    /// Stop accepting, signal live sessions, and wait for the port to be released.
    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        let _ = self.tcp.await;
        let _ = self.udp.await;
    }
}

/// Owner of all port bindings.
pub struct Controller {
    shared: SharedState,
    bindings: BTreeMap<u16, PortBinding>,
    /// Fingerprints of the last applied roster
    observed: Option<HashMap<String, Fingerprint>>,
    /// Apply the next poll even if the roster is unchanged
    retry_pending: bool,
}

impl Controller {
    /// Create a controller with nothing bound.
    pub fn new(shared: SharedState) -> Self {
        Self {
            shared,
            bindings: BTreeMap::new(),
            observed: None,
            retry_pending: false,
        }
    }

    /// Currently bound ports.
    pub fn bound_ports(&self) -> BTreeSet<u16> {
        self.bindings.keys().copied().collect()
    }

    /// Cipher table of a bound port.
    pub fn table(&self, port: u16) -> Option<Arc<CipherTable>> {
        self.bindings.get(&port).map(|b| Arc::clone(b.table()))
    }

    /// Bring the bound ports and their tables in line with `roster`.
    pub async fn apply(&mut self, roster: &[UserKey]) -> ReconcileReport {
        let plan = plan(roster, &self.bound_ports());
        let mut report = ReconcileReport {
            skipped_users: plan.skipped_users,
            ..Default::default()
        };
        for id in &report.skipped_users {
            tracing::warn!("Skipping duplicate or portless roster entry {:?}", id);
        }

        let empty = Vec::new();
        for (port, delta) in plan.deltas {
            let users = plan.tables.get(&port).unwrap_or(&empty);
            match delta {
                PortDelta::Stop => {
                    if let Some(binding) = self.bindings.remove(&port) {
                        self.retire(binding.table().replace(&[]));
                        binding.stop().await;
                        tracing::info!("Port {} stopped", port);
                        report.stopped.push(port);
                    }
                }
                PortDelta::Start => {
                    match PortBinding::start(
                        self.shared.config.listen_addr,
                        port,
                        users,
                        self.shared.clone(),
                    )
                    .await
                    {
                        Ok(binding) => {
                            tracing::info!("Port {} started with {} keys", port, users.len());
                            self.bindings.insert(port, binding);
                            report.started.push(port);
                        }
                        Err(e) => {
                            tracing::warn!("Port {} failed to start: {}", port, e);
                            report.failed.push((port, e.to_string()));
                        }
                    }
                }
                PortDelta::Refresh => {
                    if let Some(binding) = self.bindings.get(&port) {
                        let retired = binding.table().replace(users);
                        self.retire(retired);
                        report.refreshed.push(port);
                    }
                }
            }
        }

        self.update_gauges();
        tracing::info!(
            "Reconciled: {} started, {} stopped, {} refreshed, {} failed",
            report.started.len(),
            report.stopped.len(),
            report.refreshed.len(),
            report.failed.len()
        );
        report
    }

    /// Fetch the roster and apply it if it changed.
    ///
    /// Returns `Ok(None)` when nothing changed. A fetch error leaves every
    /// port as it was.
    pub async fn poll_once(&mut self, source: &dyn RosterSource) -> Result<Option<ReconcileReport>> {
        let roster = source.fetch().await?;
        let fingerprints = roster_fingerprints(&roster);

        if !self.retry_pending && self.observed.as_ref() == Some(&fingerprints) {
            return Ok(None);
        }

        let report = self.apply(&roster).await;
        self.retry_pending = !report.is_clean();
        self.observed = Some(fingerprints);
        Ok(Some(report))
    }

    /// Poll `source` until `shutdown` changes, then stop every port.
    pub async fn run(mut self, source: Arc<dyn RosterSource>, mut shutdown: watch::Receiver<bool>) {
        let config = Arc::clone(&self.shared.config);
        let period = config.roster_poll_interval + random_jitter(config.roster_poll_jitter);
        tracing::info!("Polling roster every {:.1}s", period.as_secs_f64());
        let mut ticker = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_once(source.as_ref()).await {
                        Ok(Some(_)) => {}
                        Ok(None) => tracing::debug!("Roster unchanged"),
                        Err(e) => tracing::warn!(
                            "Roster fetch failed, keeping {} ports: {}",
                            self.bindings.len(),
                            e
                        ),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        self.stop_all().await;
    }

    /// Stop every bound port.
    pub async fn stop_all(&mut self) {
        let bindings = std::mem::take(&mut self.bindings);
        for (port, binding) in bindings {
            self.retire(binding.table().replace(&[]));
            binding.stop().await;
            tracing::info!("Port {} stopped", port);
        }
        self.update_gauges();
    }

    fn retire(&self, entries: Vec<Arc<CipherEntry>>) {
        if self.shared.config.drain_policy != DrainPolicy::Drop {
            return;
        }
        for entry in entries {
            tracing::debug!("Revoking key {} for {}", entry.fingerprint(), entry.id());
            entry.revoke();
        }
    }

    fn update_gauges(&self) {
        let keys: usize = self.bindings.values().map(|b| b.table().len()).sum();
        self.shared.metrics.set_active_ports(self.bindings.len() as u64);
        self.shared.metrics.set_loaded_keys(keys as u64);
    }
}
