//! Server configuration.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What happens to live sessions when their key is retired by reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainPolicy {
    /// Let sessions under the old key run until they end on their own
    #[default]
    Drain,
    /// Tear sessions under the old key down immediately
    Drop,
}

/// Where the user roster comes from.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RosterConfig {
    /// TOML file with `[[users]]` entries, re-read on every poll
    File {
        /// Users file location
        path: PathBuf,
    },
    /// HTTP control plane
    Http {
        /// Scheme and host, e.g. `https://panel.example`
        api_host: String,
        /// This node's id, sent as `n`
        node_id: u32,
        /// Shared token, sent as `t`
        api_key: String,
    },
}

impl fmt::Debug for RosterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RosterConfig::File { path } => f.debug_struct("File").field("path", path).finish(),
            RosterConfig::Http {
                api_host, node_id, ..
            } => f
                .debug_struct("Http")
                .field("api_host", api_host)
                .field("node_id", node_id)
                .finish_non_exhaustive(),
        }
    }
}

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address every port binds on
    pub listen_addr: IpAddr,
    /// Deadline for identification plus the destination address
    pub handshake_timeout: Duration,
    /// Deadline for connecting to a TCP destination
    pub connect_timeout: Duration,
    /// Idle time after which a UDP association is reclaimed
    pub nat_timeout: Duration,
    /// How long sessions may drain after their port stops
    pub shutdown_grace: Duration,
    /// Salts per replay cache generation (0 disables replay detection)
    pub replay_history: usize,
    /// Base roster poll interval
    pub roster_poll_interval: Duration,
    /// Upper bound of the random jitter added to the poll interval
    pub roster_poll_jitter: Duration,
    /// Traffic report interval
    pub traffic_flush_interval: Duration,
    /// Treatment of sessions whose key is retired
    pub drain_policy: DrainPolicy,
    /// Roster source
    pub roster: RosterConfig,
}

/// Smallest accepted NAT idle timeout.
pub const MIN_NAT_TIMEOUT: Duration = Duration::from_secs(60);

impl ServerConfig {
    /// Create a configuration with default timings for the given roster source.
    pub fn new(roster: RosterConfig) -> Self {
        Self {
            listen_addr: IpAddr::from([0, 0, 0, 0]),
            handshake_timeout: Duration::from_millis(crate::HANDSHAKE_TIMEOUT_MS),
            connect_timeout: Duration::from_secs(10),
            nat_timeout: Duration::from_millis(crate::NAT_TIMEOUT_MS),
            shutdown_grace: Duration::from_secs(5),
            replay_history: 10_000,
            roster_poll_interval: Duration::from_secs(30),
            roster_poll_jitter: Duration::from_secs(10),
            traffic_flush_interval: Duration::from_secs(300),
            drain_policy: DrainPolicy::Drain,
            roster,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("handshake_timeout", self.handshake_timeout),
            ("connect_timeout", self.connect_timeout),
            ("roster_poll_interval", self.roster_poll_interval),
            ("traffic_flush_interval", self.traffic_flush_interval),
        ];
        for (name, value) in nonzero {
            if value.is_zero() {
                return Err(Error::config(format!("{} must be greater than zero", name)));
            }
        }

        if self.nat_timeout < MIN_NAT_TIMEOUT {
            return Err(Error::config(format!(
                "nat_timeout must be at least {}s",
                MIN_NAT_TIMEOUT.as_secs()
            )));
        }

        match &self.roster {
            RosterConfig::File { path } if path.as_os_str().is_empty() => {
                Err(Error::config("roster path cannot be empty"))
            }
            RosterConfig::Http { api_host, .. } if api_host.is_empty() => {
                Err(Error::config("roster api_host cannot be empty"))
            }
            _ => Ok(()),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0".into()
}
fn default_handshake_timeout() -> u64 {
    crate::HANDSHAKE_TIMEOUT_MS / 1000
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_nat_timeout() -> u64 {
    crate::NAT_TIMEOUT_MS / 1000
}
fn default_shutdown_grace() -> u64 {
    5
}
fn default_replay_history() -> usize {
    10_000
}
fn default_poll_interval() -> u64 {
    30
}
fn default_poll_jitter() -> u64 {
    10
}
fn default_flush_interval() -> u64 {
    300
}

/// Configuration file format for serialization.
#[derive(Debug, Serialize, Deserialize)]
pub struct ServerConfigFile {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Identification plus address deadline
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Outbound connect deadline
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Idle time before a UDP association is reclaimed
    #[serde(default = "default_nat_timeout")]
    pub nat_timeout_secs: u64,
    /// Time sessions get to finish after their port stops
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// Salts per replay cache generation
    #[serde(default = "default_replay_history")]
    pub replay_history: usize,
    /// Seconds between roster polls
    #[serde(default = "default_poll_interval")]
    pub roster_poll_interval_secs: u64,
    /// Upper bound of random delay added to each poll
    #[serde(default = "default_poll_jitter")]
    pub roster_poll_jitter_secs: u64,
    /// Seconds between traffic reports
    #[serde(default = "default_flush_interval")]
    pub traffic_flush_interval_secs: u64,
    /// `"drain"` or `"drop"`
    #[serde(default)]
    pub drain_policy: DrainPolicy,
    /// Roster source
    pub roster: RosterConfig,
}

impl ServerConfigFile {
    /// Parse a TOML configuration document.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::config(format!("invalid config: {}", e)))
    }

    /// Render as a TOML document.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::config(format!("cannot render config: {}", e)))
    }

    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<ServerConfig> {
        let listen_addr = self
            .listen_addr
            .parse::<IpAddr>()
            .map_err(|e| Error::config(format!("invalid listen_addr {:?}: {}", self.listen_addr, e)))?;

        Ok(ServerConfig {
            listen_addr,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            nat_timeout: Duration::from_secs(self.nat_timeout_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            replay_history: self.replay_history,
            roster_poll_interval: Duration::from_secs(self.roster_poll_interval_secs),
            roster_poll_jitter: Duration::from_secs(self.roster_poll_jitter_secs),
            traffic_flush_interval: Duration::from_secs(self.traffic_flush_interval_secs),
            drain_policy: self.drain_policy,
            roster: self.roster.clone(),
        })
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            listen_addr: config.listen_addr.to_string(),
            handshake_timeout_secs: config.handshake_timeout.as_secs(),
            connect_timeout_secs: config.connect_timeout.as_secs(),
            nat_timeout_secs: config.nat_timeout.as_secs(),
            shutdown_grace_secs: config.shutdown_grace.as_secs(),
            replay_history: config.replay_history,
            roster_poll_interval_secs: config.roster_poll_interval.as_secs(),
            roster_poll_jitter_secs: config.roster_poll_jitter.as_secs(),
            traffic_flush_interval_secs: config.traffic_flush_interval.as_secs(),
            drain_policy: config.drain_policy,
            roster: config.roster.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_roster() -> RosterConfig {
        RosterConfig::File {
            path: PathBuf::from("users.toml"),
        }
    }

    #[test]
    fn test_defaults_validate() {
        let config = ServerConfig::new(file_roster());
        assert!(config.validate().is_ok());
        assert_eq!(config.drain_policy, DrainPolicy::Drain);
        assert_eq!(config.handshake_timeout, Duration::from_secs(59));
    }

    #[test]
    fn test_minimal_file_uses_defaults() {
        let file = ServerConfigFile::from_toml(
            r#"
            [roster]
            kind = "http"
            api_host = "https://panel.example"
            node_id = 7
            api_key = "k"
            "#,
        )
        .unwrap();

        let config = file.to_config().unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.nat_timeout, Duration::from_secs(300));
        assert_eq!(config.replay_history, 10_000);
        assert!(matches!(config.roster, RosterConfig::Http { node_id: 7, .. }));
    }

    #[test]
    fn test_config_serialization() {
        let mut config = ServerConfig::new(file_roster());
        config.drain_policy = DrainPolicy::Drop;
        config.listen_addr = "127.0.0.1".parse().unwrap();

        let text = ServerConfigFile::from_config(&config).to_toml().unwrap();
        assert!(text.contains("drain_policy = \"drop\""));

        let restored = ServerConfigFile::from_toml(&text).unwrap().to_config().unwrap();
        assert_eq!(restored.listen_addr, config.listen_addr);
        assert_eq!(restored.drain_policy, DrainPolicy::Drop);
        assert_eq!(restored.roster, config.roster);
    }

    #[test]
    fn test_validation() {
        let mut config = ServerConfig::new(file_roster());
        config.nat_timeout = Duration::from_secs(30);
        assert!(config.validate().is_err());

        let mut config = ServerConfig::new(file_roster());
        config.handshake_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let config = ServerConfig::new(RosterConfig::File {
            path: PathBuf::new(),
        });
        assert!(config.validate().is_err());

        let bad = ServerConfigFile::from_toml(
            r#"
            listen_addr = "not-an-ip"
            [roster]
            kind = "file"
            path = "users.toml"
            "#,
        )
        .unwrap();
        assert!(matches!(bad.to_config(), Err(Error::Config(_))));
    }

    #[test]
    fn test_roster_debug_hides_api_key() {
        let roster = RosterConfig::Http {
            api_host: "https://panel.example".into(),
            node_id: 1,
            api_key: "very-secret-token".into(),
        };
        assert!(!format!("{:?}", roster).contains("very-secret-token"));
    }
}
