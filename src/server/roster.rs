//! User roster: the desired set of user keys and where it comes from.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::{AeadKey, CipherKind};
use crate::error::{Error, Result};

/// One subscriber's key.
#[derive(Clone, PartialEq, Eq)]
pub struct UserKey {
    /// Unique user identifier
    pub id: String,
    /// Port the user connects to
    pub port: u16,
    /// Cipher the user's client speaks
    pub cipher: CipherKind,
    /// Shared secret
    pub secret: String,
}

impl UserKey {
    /// Create a new user key.
    pub fn new(
        id: impl Into<String>,
        port: u16,
        cipher: CipherKind,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            port,
            cipher,
            secret: secret.into(),
        }
    }

    /// Hash over every field, used to detect changes between polls.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        for field in [
            self.id.as_bytes(),
            &self.port.to_be_bytes(),
            self.cipher.name().as_bytes(),
            self.secret.as_bytes(),
        ] {
            hasher.update((field.len() as u32).to_be_bytes());
            hasher.update(field);
        }
        Fingerprint(hasher.finalize().into())
    }

    /// Derive this user's master key.
    pub fn master_key(&self) -> AeadKey {
        AeadKey::from_secret(self.cipher, &self.secret)
    }
}

impl fmt::Debug for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserKey")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("cipher", &self.cipher)
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// SHA-256 fingerprint of a [`UserKey`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Short hex form for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Full digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

/// Fingerprint per user id. Later duplicates of an id are ignored.
pub fn roster_fingerprints(users: &[UserKey]) -> HashMap<String, Fingerprint> {
    let mut prints = HashMap::with_capacity(users.len());
    for user in users {
        prints
            .entry(user.id.clone())
            .or_insert_with(|| user.fingerprint());
    }
    prints
}

/// A roster entry as served by a source, before validation.
#[derive(Clone, Serialize, Deserialize)]
pub struct UserRecord {
    /// User id
    #[serde(alias = "ID")]
    pub id: String,
    /// Port, unchecked until validation
    #[serde(alias = "Port")]
    pub port: i64,
    /// Cipher name in either spelling
    #[serde(alias = "Cipher")]
    pub cipher: String,
    /// Shared secret
    #[serde(alias = "Secret")]
    pub secret: String,
}

impl From<&UserKey> for UserRecord {
    fn from(user: &UserKey) -> Self {
        Self {
            id: user.id.clone(),
            port: user.port as i64,
            cipher: user.cipher.name().to_string(),
            secret: user.secret.clone(),
        }
    }
}

impl TryFrom<UserRecord> for UserKey {
    type Error = Error;

    fn try_from(record: UserRecord) -> Result<Self> {
        if record.id.is_empty() {
            return Err(Error::config("user id cannot be empty"));
        }
        let port = u16::try_from(record.port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| Error::config(format!("invalid port {}", record.port)))?;
        let cipher = record.cipher.parse::<CipherKind>()?;
        if record.secret.is_empty() {
            return Err(Error::config("secret cannot be empty"));
        }

        Ok(UserKey {
            id: record.id,
            port,
            cipher,
            secret: record.secret,
        })
    }
}

/// Validate records, dropping (and logging) the ones that cannot be served.
pub fn users_from_records(records: Vec<UserRecord>) -> Vec<UserKey> {
    records
        .into_iter()
        .filter_map(|record| {
            let id = record.id.clone();
            match UserKey::try_from(record) {
                Ok(user) => Some(user),
                Err(e) => {
                    tracing::warn!("Skipping roster entry {:?}: {}", id, e);
                    None
                }
            }
        })
        .collect()
}

/// Provider of the desired user roster.
#[async_trait]
pub trait RosterSource: Send + Sync {
    /// Fetch the full current roster.
    async fn fetch(&self) -> Result<Vec<UserKey>>;
}

/// Users file format: `[[users]]` tables.
#[derive(Serialize, Deserialize)]
pub struct RosterFile {
    /// Users in file order
    #[serde(default)]
    pub users: Vec<UserRecord>,
}

impl RosterFile {
    /// Build a roster file from user keys.
    pub fn from_users(users: &[UserKey]) -> Self {
        Self {
            users: users.iter().map(UserRecord::from).collect(),
        }
    }

    /// Render as a TOML document.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::config(format!("cannot render users: {}", e)))
    }
}

/// Roster read from a TOML file on every fetch.
pub struct FileRoster {
    path: PathBuf,
}

impl FileRoster {
    /// Create a file-backed roster source.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RosterSource for FileRoster {
    async fn fetch(&self) -> Result<Vec<UserKey>> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::roster(format!("{}: {}", self.path.display(), e)))?;
        let file: RosterFile = toml::from_str(&text)
            .map_err(|e| Error::roster(format!("{}: {}", self.path.display(), e)))?;
        Ok(users_from_records(file.users))
    }
}

/// In-memory roster, swapped wholesale by the owner.
#[derive(Default)]
pub struct MemoryRoster {
    users: RwLock<Vec<UserKey>>,
    failing: AtomicBool,
}

impl MemoryRoster {
    /// Create a roster holding `users`.
    pub fn new(users: Vec<UserKey>) -> Self {
        Self {
            users: RwLock::new(users),
            failing: AtomicBool::new(false),
        }
    }

    /// Replace the whole roster.
    pub fn set(&self, users: Vec<UserKey>) {
        *self.users.write() = users;
    }

    /// Make subsequent fetches fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl RosterSource for MemoryRoster {
    async fn fetch(&self) -> Result<Vec<UserKey>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::roster("roster unavailable"));
        }
        Ok(self.users.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, port: u16, secret: &str) -> UserKey {
        UserKey::new(id, port, CipherKind::Chacha20IetfPoly1305, secret)
    }

    #[test]
    fn test_fingerprint_covers_every_field() {
        let base = user("alice", 9000, "s1");
        let print = base.fingerprint();

        assert_eq!(print, user("alice", 9000, "s1").fingerprint());
        assert_ne!(print, user("alice", 9001, "s1").fingerprint());
        assert_ne!(print, user("alice", 9000, "s2").fingerprint());
        assert_ne!(print, user("bob", 9000, "s1").fingerprint());
        assert_ne!(
            print,
            UserKey::new("alice", 9000, CipherKind::Aes128Gcm, "s1").fingerprint()
        );
    }

    #[test]
    fn test_debug_hides_secret() {
        let debug = format!("{:?}", user("alice", 9000, "hunter2"));
        assert!(debug.contains("alice"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_duplicate_ids_first_wins() {
        let users = vec![user("a", 1, "first"), user("a", 2, "second")];
        let prints = roster_fingerprints(&users);
        assert_eq!(prints.len(), 1);
        assert_eq!(prints["a"], users[0].fingerprint());
    }

    #[test]
    fn test_records_accept_go_field_names() {
        let json = r#"[
            {"ID": "u1", "Port": 9000, "Cipher": "AEAD_CHACHA20_POLY1305", "Secret": "s"},
            {"id": "u2", "port": 9001, "cipher": "aes-128-gcm", "secret": "t"}
        ]"#;
        let records: Vec<UserRecord> = serde_json::from_str(json).unwrap();
        let users = users_from_records(records);

        assert_eq!(users.len(), 2);
        assert_eq!(users[0].cipher, CipherKind::Chacha20IetfPoly1305);
        assert_eq!(users[1].port, 9001);
    }

    #[test]
    fn test_invalid_records_skipped() {
        let records = vec![
            UserRecord::from(&user("ok", 9000, "s")),
            UserRecord {
                id: "bad-cipher".into(),
                port: 9000,
                cipher: "rc4-md5".into(),
                secret: "s".into(),
            },
            UserRecord {
                id: "bad-port".into(),
                port: 70000,
                cipher: "aes-256-gcm".into(),
                secret: "s".into(),
            },
            UserRecord {
                id: "zero-port".into(),
                port: 0,
                cipher: "aes-256-gcm".into(),
                secret: "s".into(),
            },
        ];

        let users = users_from_records(records);
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, "ok");
    }

    #[tokio::test]
    async fn test_file_roster_round_trip() {
        let path = std::env::temp_dir().join(format!(
            "ssgate-roster-{}-{}.toml",
            std::process::id(),
            crate::crypto::SecureRandom::u64()
        ));
        let users = vec![user("a", 9000, "s1"), user("b", 9001, "s2")];
        let text = RosterFile::from_users(&users).to_toml().unwrap();
        tokio::fs::write(&path, text).await.unwrap();

        let fetched = FileRoster::new(&path).fetch().await.unwrap();
        assert_eq!(fetched, users);

        tokio::fs::remove_file(&path).await.unwrap();
        assert!(matches!(
            FileRoster::new(&path).fetch().await,
            Err(Error::RosterFetch(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_roster_failure_toggle() {
        let roster = MemoryRoster::new(vec![user("a", 9000, "s")]);
        assert_eq!(roster.fetch().await.unwrap().len(), 1);

        roster.set_failing(true);
        assert!(roster.fetch().await.is_err());

        roster.set_failing(false);
        roster.set(vec![]);
        assert!(roster.fetch().await.unwrap().is_empty());
    }
}
