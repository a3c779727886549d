//! Relay server.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                          ssgate                               │
//! │  ┌────────────────┐   poll   ┌─────────────────────────────┐  │
//! │  │ Roster source  │ ───────▶ │  Reconciliation controller  │  │
//! │  │ (file / HTTP)  │          │  owns port -> PortBinding   │  │
//! │  └────────────────┘          └──────────────┬──────────────┘  │
//! │                                             │ start/stop/     │
//! │                                             ▼ replace table   │
//! │  ┌──────────────────────────────────────────────────────────┐ │
//! │  │ PortBinding (one per port)                               │ │
//! │  │  • TCP listener ─┐                                       │ │
//! │  │  • UDP socket ───┴─▶ CipherTable (trial decryption)      │ │
//! │  │                      ReplayCache (process-wide)          │ │
//! │  └──────────────────────────────────────────────────────────┘ │
//! │                              │ wire bytes per user            │
//! │                              ▼                                │
//! │  ┌────────────────────┐ flush ┌───────────────────────────┐   │
//! │  │ TrafficAccumulator │ ────▶ │ Traffic sink (log / HTTP) │   │
//! │  └────────────────────┘       └───────────────────────────┘   │
//! └───────────────────────────────────────────────────────────────┘
//! ```

pub mod cipher_table;
mod config;
pub mod control_plane;
pub mod controller;
mod metrics;
pub mod nat;
pub mod replay;
pub mod resolver;
pub mod roster;
pub mod tcp;
pub mod traffic;
pub mod udp;

pub use cipher_table::{CipherEntry, CipherTable};
pub use config::{DrainPolicy, RosterConfig, ServerConfig, ServerConfigFile, MIN_NAT_TIMEOUT};
pub use control_plane::ControlPlaneClient;
pub use controller::{plan, Controller, PortBinding, PortDelta, ReconcilePlan, ReconcileReport};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use replay::{ReplayCache, ReplayCheck};
pub use resolver::{Resolver, StaticResolver, SystemResolver};
pub use roster::{FileRoster, MemoryRoster, RosterFile, RosterSource, UserKey, UserRecord};
pub use traffic::{LogSink, TrafficAccumulator, TrafficRecord, TrafficSink};

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{Error, Result};

/// Process-wide state handed to every port.
#[derive(Clone)]
pub struct SharedState {
    /// Validated configuration
    pub config: Arc<ServerConfig>,
    /// Salts seen by any port
    pub replay: Arc<ReplayCache>,
    /// Destination name resolution
    pub resolver: Arc<dyn Resolver>,
    /// Per-user byte counts awaiting the next flush
    pub traffic: Arc<TrafficAccumulator>,
    /// Process-wide counters
    pub metrics: Arc<ServerMetrics>,
}

impl SharedState {
    /// Count a rejected unit in the metrics and hand the error back.
    pub(crate) fn count_rejection(&self, err: Error) -> Error {
        match err {
            Error::Replay => self.metrics.increment_replays(),
            Error::Identification | Error::Framing(_) | Error::Authentication => {
                self.metrics.increment_identification_failures()
            }
            _ => {}
        }
        err
    }

    #[cfg(test)]
    pub(crate) fn for_tests(resolver: Arc<dyn Resolver>) -> Self {
        let mut config = ServerConfig::new(RosterConfig::File {
            path: "users.toml".into(),
        });
        config.listen_addr = std::net::IpAddr::from([127, 0, 0, 1]);

        Self {
            replay: Arc::new(ReplayCache::new(config.replay_history)),
            config: Arc::new(config),
            resolver,
            traffic: Arc::new(TrafficAccumulator::new()),
            metrics: Arc::new(ServerMetrics::new()),
        }
    }
}

/// Build the roster source and traffic sink a configuration names.
///
/// A file roster reports traffic to the log; the HTTP control plane serves
/// both roles.
pub fn sources_for(config: &RosterConfig) -> Result<(Arc<dyn RosterSource>, Arc<dyn TrafficSink>)> {
    match config {
        RosterConfig::File { path } => {
            let roster: Arc<dyn RosterSource> = Arc::new(FileRoster::new(path.clone()));
            let sink: Arc<dyn TrafficSink> = Arc::new(LogSink);
            Ok((roster, sink))
        }
        RosterConfig::Http {
            api_host,
            node_id,
            api_key,
        } => {
            let client = Arc::new(ControlPlaneClient::new(api_host.clone(), *node_id, api_key.clone())?);
            let roster: Arc<dyn RosterSource> = client.clone();
            let sink: Arc<dyn TrafficSink> = client;
            Ok((roster, sink))
        }
    }
}

/// Main server instance.
pub struct Server {
    config: Arc<ServerConfig>,
    resolver: Arc<dyn Resolver>,
    roster: Option<Arc<dyn RosterSource>>,
    sink: Option<Arc<dyn TrafficSink>>,
    traffic: Arc<TrafficAccumulator>,
    metrics: Arc<ServerMetrics>,
}

impl Server {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config: Arc::new(config),
            resolver: Arc::new(SystemResolver),
            roster: None,
            sink: None,
            traffic: Arc::new(TrafficAccumulator::new()),
            metrics: Arc::new(ServerMetrics::new()),
        })
    }

    /// Resolve destinations with `resolver` instead of the system resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Take the roster from `source` instead of the configured one.
    pub fn with_roster(mut self, source: Arc<dyn RosterSource>) -> Self {
        self.roster = Some(source);
        self
    }

    /// Report traffic to `sink` instead of the configured one.
    pub fn with_sink(mut self, sink: Arc<dyn TrafficSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Get server metrics.
    pub fn metrics(&self) -> Arc<ServerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Serve until `shutdown` changes: every port is stopped and pending
    /// traffic is flushed before this returns.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let (configured_roster, configured_sink) = sources_for(&self.config.roster)?;
        let roster = self.roster.unwrap_or(configured_roster);
        let sink = self.sink.unwrap_or(configured_sink);

        let shared = SharedState {
            replay: Arc::new(ReplayCache::new(self.config.replay_history)),
            config: Arc::clone(&self.config),
            resolver: self.resolver,
            traffic: Arc::clone(&self.traffic),
            metrics: Arc::clone(&self.metrics),
        };

        tracing::info!(
            "ssgate starting on {} ({:?} roster, {:?} policy)",
            self.config.listen_addr,
            self.config.roster,
            self.config.drain_policy
        );

        let flush = tokio::spawn(traffic::run_flush_loop(
            Arc::clone(&self.traffic),
            sink,
            Arc::clone(&self.metrics),
            self.config.traffic_flush_interval,
            shutdown.clone(),
        ));

        Controller::new(shared).run(roster, shutdown).await;
        let _ = flush.await;

        tracing::info!("ssgate stopped");
        Ok(())
    }
}
