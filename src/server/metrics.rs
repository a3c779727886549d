//! Server metrics collection.
//!
//! Aggregate counters only. Nothing here identifies a user; per-user byte
//! counts live in the traffic accumulator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server metrics collector.
pub struct ServerMetrics {
    /// Server start time
    start_time: Instant,
    /// Total TCP connections accepted
    total_connections: AtomicU64,
    /// Current TCP connections
    active_connections: AtomicU64,
    /// TCP sessions and UDP datagrams that identified a user
    authenticated_sessions: AtomicU64,
    /// Units no cipher entry could open
    identification_failures: AtomicU64,
    /// Units rejected for a reused salt
    replays: AtomicU64,
    /// Handshakes that ran out of time
    timeouts: AtomicU64,
    /// Bytes written to clients
    bytes_sent: AtomicU64,
    /// Bytes read from clients
    bytes_received: AtomicU64,
    /// Datagrams received from clients
    udp_datagrams_in: AtomicU64,
    /// Datagrams sent back to clients
    udp_datagrams_out: AtomicU64,
    /// NAT associations created
    nat_created: AtomicU64,
    /// NAT associations reclaimed after idling
    nat_expired: AtomicU64,
    /// Ports currently bound
    active_ports: AtomicU64,
    /// Cipher entries across all ports
    loaded_keys: AtomicU64,
}

impl ServerMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            authenticated_sessions: AtomicU64::new(0),
            identification_failures: AtomicU64::new(0),
            replays: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            udp_datagrams_in: AtomicU64::new(0),
            udp_datagrams_out: AtomicU64::new(0),
            nat_created: AtomicU64::new(0),
            nat_expired: AtomicU64::new(0),
            active_ports: AtomicU64::new(0),
            loaded_keys: AtomicU64::new(0),
        }
    }

    /// Increment total and active connections.
    pub fn increment_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections.
    pub fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Count a unit that identified a user.
    pub fn increment_authenticated(&self) {
        self.authenticated_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a unit no entry could open.
    pub fn increment_identification_failures(&self) {
        self.identification_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a replayed salt.
    pub fn increment_replays(&self) {
        self.replays.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an expired handshake.
    pub fn increment_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Add bytes to sent counter.
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Add bytes to received counter.
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Count a datagram from a client.
    pub fn increment_datagrams_in(&self) {
        self.udp_datagrams_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a reply sent to a client.
    pub fn increment_datagrams_out(&self) {
        self.udp_datagrams_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a new NAT association.
    pub fn increment_nat_created(&self) {
        self.nat_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Count associations reclaimed by a sweep.
    pub fn add_nat_expired(&self, count: u64) {
        self.nat_expired.fetch_add(count, Ordering::Relaxed);
    }

    /// Set the number of bound ports.
    pub fn set_active_ports(&self, ports: u64) {
        self.active_ports.store(ports, Ordering::Relaxed);
    }

    /// Set the number of loaded cipher entries.
    pub fn set_loaded_keys(&self, keys: u64) {
        self.loaded_keys.store(keys, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get total connections.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Get active connections.
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get authenticated sessions.
    pub fn authenticated_sessions(&self) -> u64 {
        self.authenticated_sessions.load(Ordering::Relaxed)
    }

    /// Get identification failures.
    pub fn identification_failures(&self) -> u64 {
        self.identification_failures.load(Ordering::Relaxed)
    }

    /// Get replay rejections.
    pub fn replays(&self) -> u64 {
        self.replays.load(Ordering::Relaxed)
    }

    /// Get total bytes sent.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Get total bytes received.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Get bound port count.
    pub fn active_ports(&self) -> u64 {
        self.active_ports.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            total_connections: self.total_connections(),
            active_connections: self.active_connections(),
            authenticated_sessions: self.authenticated_sessions(),
            identification_failures: self.identification_failures(),
            replays: self.replays(),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent(),
            bytes_received: self.bytes_received(),
            udp_datagrams_in: self.udp_datagrams_in.load(Ordering::Relaxed),
            udp_datagrams_out: self.udp_datagrams_out.load(Ordering::Relaxed),
            nat_created: self.nat_created.load(Ordering::Relaxed),
            nat_expired: self.nat_expired.load(Ordering::Relaxed),
            active_ports: self.active_ports(),
            loaded_keys: self.loaded_keys.load(Ordering::Relaxed),
        }
    }

    /// Format metrics as a simple text report.
    pub fn format_report(&self) -> String {
        let snapshot = self.snapshot();

        format!(
            r#"ssgate Metrics
==============
Uptime: {} seconds
Ports:  {} bound, {} keys loaded

Connections:
  Total:         {}
  Active:        {}
  Authenticated: {}

Traffic:
  Sent:     {} bytes
  Received: {} bytes

UDP:
  Datagrams In:  {}
  Datagrams Out: {}
  NAT Created:   {}
  NAT Expired:   {}

Rejections:
  Unidentified: {}
  Replayed:     {}
  Timed Out:    {}
"#,
            snapshot.uptime_secs,
            snapshot.active_ports,
            snapshot.loaded_keys,
            snapshot.total_connections,
            snapshot.active_connections,
            snapshot.authenticated_sessions,
            snapshot.bytes_sent,
            snapshot.bytes_received,
            snapshot.udp_datagrams_in,
            snapshot.udp_datagrams_out,
            snapshot.nat_created,
            snapshot.nat_expired,
            snapshot.identification_failures,
            snapshot.replays,
            snapshot.timeouts,
        )
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Seconds since start
    pub uptime_secs: u64,
    /// TCP connections accepted
    pub total_connections: u64,
    /// TCP connections open now
    pub active_connections: u64,
    /// Units that identified a user
    pub authenticated_sessions: u64,
    /// Units no entry could open
    pub identification_failures: u64,
    /// Units rejected for a reused salt
    pub replays: u64,
    /// Expired handshakes
    pub timeouts: u64,
    /// Bytes written to clients
    pub bytes_sent: u64,
    /// Bytes read from clients
    pub bytes_received: u64,
    /// Datagrams from clients
    pub udp_datagrams_in: u64,
    /// Replies to clients
    pub udp_datagrams_out: u64,
    /// NAT associations opened
    pub nat_created: u64,
    /// NAT associations reclaimed
    pub nat_expired: u64,
    /// Ports bound now
    pub active_ports: u64,
    /// Cipher entries across all ports
    pub loaded_keys: u64,
}

impl MetricsSnapshot {
    /// Share of rejected units among all identification attempts.
    pub fn rejection_rate(&self) -> f64 {
        let rejected = self.identification_failures + self.replays;
        let attempts = self.authenticated_sessions + rejected;
        if attempts == 0 {
            0.0
        } else {
            rejected as f64 / attempts as f64
        }
    }

    /// Calculate throughput in bytes per second.
    pub fn throughput_bps(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            (self.bytes_sent + self.bytes_received) as f64 / self.uptime_secs as f64
        }
    }
}
