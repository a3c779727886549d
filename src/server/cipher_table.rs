//! Per-port cipher tables and trial-decryption identification.
//!
//! A port has no cleartext user identifier. The server tries each entry's key
//! against the first sealed block of an incoming unit; the entry whose key
//! authenticates it is the user.
//!
//! # Security
//!
//! Every rejection (no entry matched, salt replayed, malformed framing) is
//! reported to the caller, which must treat them identically on the wire.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::crypto::AeadKey;
use crate::error::{Error, Result};
use crate::server::replay::{ReplayCache, ReplayCheck};
use crate::server::roster::{Fingerprint, UserKey};
use crate::transport::{open_packet, StreamDecryptor, LENGTH_BLOCK_SIZE};

/// Derived key state for one user on one port.
pub struct CipherEntry {
    id: String,
    key: AeadKey,
    fingerprint: Fingerprint,
    /// Client IP of the most recent successful identification
    last_client_ip: Mutex<Option<IpAddr>>,
    revoke: watch::Sender<bool>,
}

impl CipherEntry {
    /// Derive an entry from a user key.
    pub fn new(user: &UserKey) -> Self {
        Self {
            id: user.id.clone(),
            key: user.master_key(),
            fingerprint: user.fingerprint(),
            last_client_ip: Mutex::new(None),
            revoke: watch::channel(false).0,
        }
    }

    /// User id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Master key.
    pub fn key(&self) -> &AeadKey {
        &self.key
    }

    /// Salt size of this entry's cipher.
    pub fn salt_size(&self) -> usize {
        self.key.salt_size()
    }

    /// Fingerprint of the user key this entry was derived from.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Client IP of the most recent hit.
    pub fn last_client_ip(&self) -> Option<IpAddr> {
        *self.last_client_ip.lock()
    }

    /// Subscribe to this entry's revocation.
    pub fn revocation(&self) -> watch::Receiver<bool> {
        self.revoke.subscribe()
    }

    /// Revoke the entry, tearing down sessions that listen for it.
    pub fn revoke(&self) {
        self.revoke.send_replace(true);
    }

    /// Whether the entry has been revoked.
    pub fn is_revoked(&self) -> bool {
        *self.revoke.borrow()
    }
}

impl std::fmt::Debug for CipherEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherEntry")
            .field("id", &self.id)
            .field("kind", &self.key.kind())
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Ordered entries for one port, most recently used first.
///
/// Readers take a snapshot; replacement swaps the whole list under the same
/// lock, so a snapshot is always entirely the old or entirely the new table.
#[derive(Default)]
pub struct CipherTable {
    entries: Mutex<VecDeque<Arc<CipherEntry>>>,
}

impl CipherTable {
    /// Create a table from user keys.
    pub fn new(users: &[UserKey]) -> Self {
        let table = Self::default();
        table.replace(users);
        table
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// User ids in scan order.
    pub fn ids(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.id.clone()).collect()
    }

    /// Look an entry up by user id.
    pub fn get(&self, id: &str) -> Option<Arc<CipherEntry>> {
        self.entries.lock().iter().find(|e| e.id == id).cloned()
    }

    /// Entries in scan order for a client.
    ///
    /// Entries last used from `client_ip` come first, then the rest in
    /// most-recently-used order.
    pub fn snapshot(&self, client_ip: Option<IpAddr>) -> Vec<Arc<CipherEntry>> {
        let entries = self.entries.lock();
        let Some(ip) = client_ip else {
            return entries.iter().cloned().collect();
        };

        let mut ordered = Vec::with_capacity(entries.len());
        let mut rest = Vec::new();
        for entry in entries.iter() {
            if entry.last_client_ip() == Some(ip) {
                ordered.push(Arc::clone(entry));
            } else {
                rest.push(Arc::clone(entry));
            }
        }
        ordered.extend(rest);
        ordered
    }

    /// Record a hit: remember the client and move the entry to the front.
    ///
    /// No-op on the order if the entry was replaced in the meantime.
    pub fn mark_used(&self, entry: &Arc<CipherEntry>, client_ip: IpAddr) {
        *entry.last_client_ip.lock() = Some(client_ip);

        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().position(|e| Arc::ptr_eq(e, entry)) {
            if pos != 0 {
                if let Some(hit) = entries.remove(pos) {
                    entries.push_front(hit);
                }
            }
        }
    }

    /// Replace the whole table with the entries for `users`.
    ///
    /// Entries whose user key is unchanged are carried over as-is, keeping
    /// their position and live sessions. Returns the entries that were
    /// dropped (users removed or changed). Duplicate ids keep the first.
    pub fn replace(&self, users: &[UserKey]) -> Vec<Arc<CipherEntry>> {
        let mut entries = self.entries.lock();

        let current: HashMap<&str, &Arc<CipherEntry>> =
            entries.iter().map(|e| (e.id.as_str(), e)).collect();
        let mut wanted: HashMap<&str, &UserKey> = HashMap::with_capacity(users.len());
        let mut added = Vec::new();
        for user in users {
            if wanted.contains_key(user.id.as_str()) {
                continue;
            }
            wanted.insert(user.id.as_str(), user);
            match current.get(user.id.as_str()) {
                Some(entry) if entry.fingerprint == user.fingerprint() => {}
                _ => added.push(Arc::new(CipherEntry::new(user))),
            }
        }

        let mut next = VecDeque::with_capacity(wanted.len());
        let mut retired = Vec::new();
        for entry in entries.iter() {
            let keep = wanted
                .get(entry.id.as_str())
                .map(|user| user.fingerprint() == entry.fingerprint)
                .unwrap_or(false);
            if keep {
                next.push_back(Arc::clone(entry));
            } else {
                retired.push(Arc::clone(entry));
            }
        }
        next.extend(added);

        *entries = next;
        retired
    }
}

/// A successful stream identification.
pub struct StreamMatch {
    /// Entry whose key authenticated the stream
    pub entry: Arc<CipherEntry>,
    /// Decryptor positioned after the first length block
    pub decryptor: StreamDecryptor,
    /// Payload length announced by the first length block
    pub payload_len: usize,
    /// Bytes of the prefix consumed (salt plus length block)
    pub consumed: usize,
}

/// Identify which entry sealed a stream, given its first raw bytes.
///
/// For each candidate the salt is the first `salt_size` bytes of `prefix`
/// and the first length block follows it. The winning salt is checked
/// against (and recorded in) the replay cache.
///
/// # Errors
///
/// [`Error::Identification`] if no entry authenticates, [`Error::Replay`] if
/// the salt was seen before, [`Error::Framing`] if the winning entry
/// announces an invalid chunk length.
pub fn identify_stream(
    table: &CipherTable,
    replay: &ReplayCache,
    prefix: &[u8],
    client_ip: IpAddr,
) -> Result<StreamMatch> {
    for entry in table.snapshot(Some(client_ip)) {
        let salt_size = entry.salt_size();
        let consumed = salt_size + LENGTH_BLOCK_SIZE;
        if prefix.len() < consumed {
            continue;
        }

        let salt = &prefix[..salt_size];
        let Ok(aead) = entry.key.unit_cipher(salt) else {
            continue;
        };
        let mut decryptor = StreamDecryptor::new(aead);
        let payload_len = match decryptor.open_length(&prefix[salt_size..consumed]) {
            Ok(len) => len,
            Err(Error::Authentication) => continue,
            Err(e) => return Err(e),
        };

        if replay.check_and_record(salt) == ReplayCheck::Replay {
            return Err(Error::Replay);
        }
        table.mark_used(&entry, client_ip);

        return Ok(StreamMatch {
            entry,
            decryptor,
            payload_len,
            consumed,
        });
    }

    Err(Error::Identification)
}

/// A successful datagram identification.
pub struct PacketMatch {
    /// Entry whose key authenticated the datagram
    pub entry: Arc<CipherEntry>,
    /// Decrypted payload
    pub plaintext: Vec<u8>,
}

/// Identify which entry sealed a datagram and open it.
pub fn identify_packet(
    table: &CipherTable,
    replay: &ReplayCache,
    packet: &[u8],
    client_ip: IpAddr,
) -> Result<PacketMatch> {
    for entry in table.snapshot(Some(client_ip)) {
        let plaintext = match open_packet(&entry.key, packet) {
            Ok(plaintext) => plaintext,
            Err(Error::Authentication) | Err(Error::Framing(_)) => continue,
            Err(e) => return Err(e),
        };

        if replay.check_and_record(&packet[..entry.salt_size()]) == ReplayCheck::Replay {
            return Err(Error::Replay);
        }
        table.mark_used(&entry, client_ip);

        return Ok(PacketMatch { entry, plaintext });
    }

    Err(Error::Identification)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherKind, SecureRandom};
    use crate::transport::{seal_packet, StreamEncryptor, STREAM_PREFIX_SIZE};
    use bytes::BytesMut;

    const CLIENT: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 1));

    fn users(n: usize) -> Vec<UserKey> {
        (0..n)
            .map(|i| {
                let kind = CipherKind::ALL[i % CipherKind::ALL.len()];
                UserKey::new(format!("user-{}", i), 9000, kind, format!("secret-{}", i))
            })
            .collect()
    }

    /// First bytes a client would send: salt, length block, payload block.
    fn client_prefix(user: &UserKey, payload: &[u8]) -> Vec<u8> {
        let key = user.master_key();
        let salt = SecureRandom::salt(key.salt_size());
        let mut encryptor = StreamEncryptor::new(key.unit_cipher(&salt).unwrap());
        let mut sealed = BytesMut::new();
        encryptor.seal_into(payload, &mut sealed).unwrap();

        let mut wire = salt;
        wire.extend_from_slice(&sealed);
        wire
    }

    #[test]
    fn test_identify_front_middle_end_of_50() {
        let users = users(50);
        for position in [0usize, 25, 49] {
            let table = CipherTable::new(&users);
            let replay = ReplayCache::new(1024);
            let wire = client_prefix(&users[position], b"payload after address");

            let hit = identify_stream(&table, &replay, &wire[..STREAM_PREFIX_SIZE], CLIENT).unwrap();
            assert_eq!(hit.entry.id(), users[position].id);
            assert_eq!(hit.payload_len, 21);
            assert_eq!(hit.consumed, users[position].cipher.salt_size() + LENGTH_BLOCK_SIZE);
        }
    }

    #[test]
    fn test_identify_rejects_unknown_secret() {
        let table = CipherTable::new(&users(50));
        let replay = ReplayCache::new(1024);
        let stranger = UserKey::new("x", 9000, CipherKind::Aes256Gcm, "not-in-table");
        let wire = client_prefix(&stranger, b"hello");

        assert!(matches!(
            identify_stream(&table, &replay, &wire[..STREAM_PREFIX_SIZE], CLIENT),
            Err(Error::Identification)
        ));
        assert!(replay.is_empty());
    }

    #[test]
    fn test_identify_rejects_replayed_salt() {
        let users = users(5);
        let table = CipherTable::new(&users);
        let replay = ReplayCache::new(1024);
        let wire = client_prefix(&users[3], b"hello");

        assert!(identify_stream(&table, &replay, &wire[..STREAM_PREFIX_SIZE], CLIENT).is_ok());
        assert!(matches!(
            identify_stream(&table, &replay, &wire[..STREAM_PREFIX_SIZE], CLIENT),
            Err(Error::Replay)
        ));
    }

    #[test]
    fn test_hit_moves_entry_to_front() {
        let users = users(10);
        let table = CipherTable::new(&users);
        let replay = ReplayCache::new(1024);

        let wire = client_prefix(&users[7], b"x");
        identify_stream(&table, &replay, &wire[..STREAM_PREFIX_SIZE], CLIENT).unwrap();

        assert_eq!(table.ids()[0], "user-7");
        assert_eq!(table.len(), 10);
        assert_eq!(table.get("user-7").unwrap().last_client_ip(), Some(CLIENT));
    }

    #[test]
    fn test_snapshot_prefers_client_ip() {
        let users = users(4);
        let table = CipherTable::new(&users);
        let other: IpAddr = "10.0.0.2".parse().unwrap();

        table.mark_used(&table.get("user-2").unwrap(), CLIENT);
        table.mark_used(&table.get("user-3").unwrap(), other);

        // user-3 is most recent overall, but user-2 was last used by CLIENT
        let order: Vec<String> = table
            .snapshot(Some(CLIENT))
            .iter()
            .map(|e| e.id().to_string())
            .collect();
        assert_eq!(order, vec!["user-2", "user-3", "user-0", "user-1"]);
    }

    #[test]
    fn test_replace_keeps_unchanged_entries() {
        let mut roster = users(3);
        let table = CipherTable::new(&roster);
        let before = table.get("user-0").unwrap();
        let old_one = table.get("user-1").unwrap();

        roster[1].secret = "rotated".into();
        roster.remove(2);
        roster.push(UserKey::new("user-9", 9000, CipherKind::Aes128Gcm, "new"));

        let retired = table.replace(&roster);
        let retired_ids: Vec<&str> = retired.iter().map(|e| e.id()).collect();
        assert_eq!(retired.len(), 2);
        assert!(retired_ids.contains(&"user-1"));
        assert!(retired_ids.contains(&"user-2"));

        assert!(Arc::ptr_eq(&before, &table.get("user-0").unwrap()));
        assert!(!Arc::ptr_eq(&old_one, &table.get("user-1").unwrap()));
        assert_eq!(table.len(), 3);

        // same roster again retires nothing
        assert!(table.replace(&roster).is_empty());
    }

    #[test]
    fn test_snapshot_is_whole_table() {
        let table = CipherTable::new(&users(3));
        let snapshot = table.snapshot(None);

        table.replace(&[]);
        assert_eq!(snapshot.len(), 3);
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_ids_first_wins() {
        let a = UserKey::new("dup", 9000, CipherKind::Aes256Gcm, "first");
        let b = UserKey::new("dup", 9000, CipherKind::Aes256Gcm, "second");
        let table = CipherTable::new(&[a.clone(), b]);

        assert_eq!(table.len(), 1);
        assert_eq!(table.get("dup").unwrap().fingerprint(), a.fingerprint());
    }

    #[test]
    fn test_identify_packet() {
        let users = users(50);
        let table = CipherTable::new(&users);
        let replay = ReplayCache::new(1024);

        let packet = seal_packet(&users[49].master_key(), b"datagram").unwrap();
        let hit = identify_packet(&table, &replay, &packet, CLIENT).unwrap();
        assert_eq!(hit.entry.id(), "user-49");
        assert_eq!(hit.plaintext, b"datagram");

        assert!(matches!(
            identify_packet(&table, &replay, &packet, CLIENT),
            Err(Error::Replay)
        ));

        let stranger = UserKey::new("x", 9000, CipherKind::Aes128Gcm, "nope");
        let packet = seal_packet(&stranger.master_key(), b"datagram").unwrap();
        assert!(matches!(
            identify_packet(&table, &replay, &packet, CLIENT),
            Err(Error::Identification)
        ));
    }

    #[test]
    fn test_revocation_signal() {
        let entry = CipherEntry::new(&users(1)[0]);
        let rx = entry.revocation();
        assert!(!entry.is_revoked());

        entry.revoke();
        assert!(entry.is_revoked());
        assert!(*rx.borrow());
    }
}
