//! Error types for the relay.

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while relaying or reconciling.
#[derive(Error, Debug)]
pub enum Error {
    /// Cryptographic primitive failed for a reason other than authentication
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Malformed salt, length field, chunk or address
    #[error("framing error: {0}")]
    Framing(String),

    /// AEAD tag did not verify under the given key
    #[error("authentication failed")]
    Authentication,

    /// No cipher entry in the port's table authenticated the unit
    #[error("no matching cipher entry")]
    Identification,

    /// Salt was already recorded by the replay cache
    #[error("replayed salt")]
    Replay,

    /// Handshake, connect or idle timeout
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Port could not be bound
    #[error("failed to bind port {port}: {source}")]
    Bind {
        /// Port that was requested
        port: u16,
        /// Underlying bind failure
        #[source]
        source: std::io::Error,
    },

    /// Roster could not be fetched or parsed
    #[error("roster fetch failed: {0}")]
    RosterFetch(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Cipher name not recognised
    #[error("unsupported cipher: {0}")]
    UnsupportedCipher(String),

    /// Cipher entry was retired while the session was live
    #[error("session revoked")]
    Revoked,

    /// Destination could not be resolved or connected
    #[error("target unreachable: {0}")]
    TargetUnreachable(String),
}

impl Error {
    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new framing error
    pub fn framing(msg: impl Into<String>) -> Self {
        Error::Framing(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new roster fetch error
    pub fn roster(msg: impl Into<String>) -> Self {
        Error::RosterFetch(msg.into())
    }

    /// Check if this error is transient and the operation may be retried
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::RosterFetch(_) | Error::Bind { .. }
        )
    }

    /// Check if this error rejects an unauthenticated peer.
    ///
    /// All of these must look identical on the wire.
    pub fn is_session_rejection(&self) -> bool {
        matches!(
            self,
            Error::Framing(_) | Error::Authentication | Error::Identification | Error::Replay
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Identification;
        assert_eq!(err.to_string(), "no matching cipher entry");

        let err = Error::Timeout(5000);
        assert_eq!(err.to_string(), "timeout after 5000ms");

        let err = Error::Bind {
            port: 9000,
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(err.to_string(), "failed to bind port 9000: in use");
    }

    #[test]
    fn test_error_classes() {
        assert!(Error::Timeout(1000).is_recoverable());
        assert!(Error::roster("down").is_recoverable());
        assert!(!Error::Replay.is_recoverable());

        assert!(Error::Replay.is_session_rejection());
        assert!(Error::Identification.is_session_rejection());
        assert!(Error::framing("short").is_session_rejection());
        assert!(!Error::Timeout(1).is_session_rejection());
    }
}
