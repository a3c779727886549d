//! Cryptographic primitives for the relay.
//!
//! This module provides:
//! - The supported AEAD cipher kinds (ChaCha20-Poly1305, AES-GCM)
//! - Master key derivation from a user secret
//! - Per-unit subkey derivation (HKDF-SHA1 with the unit's salt)
//! - Secure random number generation for salts
//!
//! Secret key material is zeroized on drop.

mod aead;
pub mod kdf;
mod random;

pub use aead::{Aead, AeadKey, CipherKind, Nonce};
pub use random::{random_jitter, SecureRandom};

/// Largest key size of any supported cipher (256 bits)
pub const MAX_KEY_SIZE: usize = 32;

/// Largest salt size of any supported cipher
pub const MAX_SALT_SIZE: usize = 32;

/// Size of AEAD nonce in bytes (96 bits for every supported cipher)
pub const NONCE_SIZE: usize = 12;

/// Size of AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;
