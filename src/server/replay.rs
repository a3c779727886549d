//! Replay detection for unit salts.
//!
//! Salts are remembered in two generations. When the active generation
//! fills up it is retired to the archive (dropping the previous archive), so
//! memory stays bounded at `2 * capacity` salts while the most recent
//! `capacity` salts are always remembered.

use std::collections::HashSet;

use parking_lot::Mutex;

/// Result of a replay check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayCheck {
    /// First time this salt was seen; it is now recorded
    Fresh,
    /// Salt was seen before
    Replay,
}

struct Generations {
    active: HashSet<Vec<u8>>,
    archive: HashSet<Vec<u8>>,
}

/// Shared, bounded set of previously seen salts.
pub struct ReplayCache {
    capacity: usize,
    inner: Mutex<Generations>,
}

impl ReplayCache {
    /// Create a cache remembering at least `capacity` salts.
    ///
    /// A capacity of zero disables replay detection.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Generations {
                active: HashSet::with_capacity(capacity.min(4096)),
                archive: HashSet::new(),
            }),
        }
    }

    /// Check `salt` and record it, atomically.
    pub fn check_and_record(&self, salt: &[u8]) -> ReplayCheck {
        if self.capacity == 0 {
            return ReplayCheck::Fresh;
        }

        let mut gens = self.inner.lock();
        if gens.active.contains(salt) || gens.archive.contains(salt) {
            return ReplayCheck::Replay;
        }

        if gens.active.len() >= self.capacity {
            gens.archive = std::mem::take(&mut gens.active);
        }
        gens.active.insert(salt.to_vec());
        ReplayCheck::Fresh
    }

    /// Record a salt generated locally.
    ///
    /// Returns `false` if it was already present.
    pub fn record(&self, salt: &[u8]) -> bool {
        self.check_and_record(salt) == ReplayCheck::Fresh
    }

    /// Number of salts currently remembered.
    pub fn len(&self) -> usize {
        let gens = self.inner.lock();
        gens.active.len() + gens.archive.len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured generation capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
