//! Secure random number generation.
//!
//! Salts must be unpredictable: they feed subkey derivation and double as
//! replay tokens. They come straight from the operating system's entropy
//! source.

use std::time::Duration;

use rand::{CryptoRng, RngCore};
use rand_core::OsRng;

/// Cryptographically secure random number generator.
///
/// Wraps the OS-provided entropy source (e.g., /dev/urandom on Unix,
/// BCryptGenRandom on Windows).
pub struct SecureRandom;

impl SecureRandom {
    /// Fill a buffer with cryptographically secure random bytes.
    pub fn fill(dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }

    /// Generate a fixed-size array of random bytes.
    pub fn bytes<const N: usize>() -> [u8; N] {
        let mut buf = [0u8; N];
        OsRng.fill_bytes(&mut buf);
        buf
    }

    /// Generate a fresh salt of `len` bytes.
    pub fn salt(len: usize) -> Vec<u8> {
        let mut salt = vec![0u8; len];
        OsRng.fill_bytes(&mut salt);
        salt
    }

    /// Generate a random u64.
    pub fn u64() -> u64 {
        OsRng.next_u64()
    }

    /// Get an RNG instance that implements CryptoRng.
    pub fn rng() -> impl RngCore + CryptoRng {
        OsRng
    }
}

/// Pick a random duration in `[0, max)` with millisecond granularity.
pub fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(SecureRandom::u64() % max_ms)
}
