//! Authenticated Encryption with Associated Data (AEAD).
//!
//! Every unit on the wire is sealed by one of four AEAD constructions:
//! - ChaCha20-Poly1305 (IETF variant, 96-bit nonce)
//! - AES-256-GCM, AES-192-GCM, AES-128-GCM
//!
//! All of them share a 12-byte nonce and a 16-byte tag, so framing code never
//! needs to know which one is in use.

use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::{consts::U12, Aead as AeadTrait, AeadInPlace, KeyInit};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use chacha20poly1305::ChaCha20Poly1305;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{kdf, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

type Aes192Gcm = AesGcm<Aes192, U12>;

/// Supported cipher kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherKind {
    /// ChaCha20-Poly1305 (IETF, 96-bit nonce), 32-byte key and salt
    #[serde(rename = "chacha20-ietf-poly1305", alias = "AEAD_CHACHA20_POLY1305")]
    Chacha20IetfPoly1305,
    /// AES-256-GCM, 32-byte key and salt
    #[serde(rename = "aes-256-gcm", alias = "AEAD_AES_256_GCM")]
    Aes256Gcm,
    /// AES-192-GCM, 24-byte key and salt
    #[serde(rename = "aes-192-gcm", alias = "AEAD_AES_192_GCM")]
    Aes192Gcm,
    /// AES-128-GCM, 16-byte key and salt
    #[serde(rename = "aes-128-gcm", alias = "AEAD_AES_128_GCM")]
    Aes128Gcm,
}

impl CipherKind {
    /// Every supported kind, strongest first.
    pub const ALL: [CipherKind; 4] = [
        CipherKind::Chacha20IetfPoly1305,
        CipherKind::Aes256Gcm,
        CipherKind::Aes192Gcm,
        CipherKind::Aes128Gcm,
    ];

    /// Canonical name as used in rosters and configuration.
    pub fn name(&self) -> &'static str {
        match self {
            CipherKind::Chacha20IetfPoly1305 => "chacha20-ietf-poly1305",
            CipherKind::Aes256Gcm => "aes-256-gcm",
            CipherKind::Aes192Gcm => "aes-192-gcm",
            CipherKind::Aes128Gcm => "aes-128-gcm",
        }
    }

    /// Key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherKind::Chacha20IetfPoly1305 | CipherKind::Aes256Gcm => 32,
            CipherKind::Aes192Gcm => 24,
            CipherKind::Aes128Gcm => 16,
        }
    }

    /// Salt size in bytes. Always equal to the key size.
    pub fn salt_size(&self) -> usize {
        self.key_size()
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CipherKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "chacha20-ietf-poly1305" | "AEAD_CHACHA20_POLY1305" => {
                Ok(CipherKind::Chacha20IetfPoly1305)
            }
            "aes-256-gcm" | "AEAD_AES_256_GCM" => Ok(CipherKind::Aes256Gcm),
            "aes-192-gcm" | "AEAD_AES_192_GCM" => Ok(CipherKind::Aes192Gcm),
            "aes-128-gcm" | "AEAD_AES_128_GCM" => Ok(CipherKind::Aes128Gcm),
            other => Err(Error::UnsupportedCipher(other.to_string())),
        }
    }
}

/// A master key for one user.
///
/// Derived once from the user's secret; every unit then derives its own
/// subkey from this key and the unit's salt. Zeroized when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey {
    #[zeroize(skip)]
    kind: CipherKind,
    bytes: Vec<u8>,
}

impl AeadKey {
    /// Derive the master key from a user secret.
    pub fn from_secret(kind: CipherKind, secret: &str) -> Self {
        let derived = kdf::evp_bytes_to_key(secret.as_bytes(), kind.key_size());
        Self {
            kind,
            bytes: derived.to_vec(),
        }
    }

    /// Create a master key from raw bytes.
    pub fn from_bytes(kind: CipherKind, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != kind.key_size() {
            return Err(Error::crypto(format!(
                "{} needs a {}-byte key, got {}",
                kind,
                kind.key_size(),
                bytes.len()
            )));
        }
        Ok(Self {
            kind,
            bytes: bytes.to_vec(),
        })
    }

    /// The cipher kind this key is for.
    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Salt size for units sealed under this key.
    pub fn salt_size(&self) -> usize {
        self.kind.salt_size()
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with care - this is secret key material.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Build the cipher for one unit identified by `salt`.
    pub fn unit_cipher(&self, salt: &[u8]) -> Result<Aead> {
        if salt.len() != self.salt_size() {
            return Err(Error::framing(format!(
                "salt must be {} bytes, got {}",
                self.salt_size(),
                salt.len()
            )));
        }
        let subkey = kdf::derive_subkey(&self.bytes, salt)?;
        Aead::new(self.kind, &subkey)
    }
}

impl fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AeadKey")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// A nonce (number used once) for AEAD operations.
///
/// The wire protocol uses a 96-bit little-endian counter that starts at zero
/// for every subkey and is bumped after each seal or open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// The all-zero nonce.
    pub fn zero() -> Self {
        Self([0u8; NONCE_SIZE])
    }

    /// Create a nonce from a 64-bit counter value (little-endian, low bytes).
    pub fn new(counter: u64) -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..8].copy_from_slice(&counter.to_le_bytes());
        Self(nonce)
    }

    /// Get the raw nonce bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Low 64 bits of the counter (for diagnostics).
    pub fn counter(&self) -> u64 {
        let mut low = [0u8; 8];
        low.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(low)
    }

    /// Increment the whole 96-bit counter, carrying across bytes.
    pub fn increment(&mut self) {
        for byte in self.0.iter_mut() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                return;
            }
        }
    }
}

impl From<u64> for Nonce {
    fn from(counter: u64) -> Self {
        Self::new(counter)
    }
}

enum Cipher {
    Chacha20(ChaCha20Poly1305),
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

macro_rules! with_cipher {
    ($cipher:expr, $c:ident => $body:expr) => {
        match $cipher {
            Cipher::Chacha20($c) => $body,
            Cipher::Aes128($c) => $body,
            Cipher::Aes192($c) => $body,
            Cipher::Aes256($c) => $body,
        }
    };
}

/// An AEAD cipher keyed with one unit's subkey.
pub struct Aead {
    cipher: Cipher,
}

impl Aead {
    /// Create a new AEAD instance for `kind` with the given subkey.
    pub fn new(kind: CipherKind, key: &[u8]) -> Result<Self> {
        let invalid = |_| Error::crypto(format!("invalid {} key length {}", kind, key.len()));
        let cipher = match kind {
            CipherKind::Chacha20IetfPoly1305 => {
                Cipher::Chacha20(ChaCha20Poly1305::new_from_slice(key).map_err(invalid)?)
            }
            CipherKind::Aes256Gcm => Cipher::Aes256(Aes256Gcm::new_from_slice(key).map_err(invalid)?),
            CipherKind::Aes192Gcm => Cipher::Aes192(Aes192Gcm::new_from_slice(key).map_err(invalid)?),
            CipherKind::Aes128Gcm => Cipher::Aes128(Aes128Gcm::new_from_slice(key).map_err(invalid)?),
        };
        Ok(Self { cipher })
    }

    /// Encrypt plaintext.
    ///
    /// Returns ciphertext || tag (16 bytes appended).
    pub fn encrypt(&self, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>> {
        with_cipher!(&self.cipher, c => c.encrypt(nonce.as_bytes().into(), plaintext))
            .map_err(|_| Error::crypto("encryption failed"))
    }

    /// Decrypt ciphertext with appended tag.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] if the tag does not verify (wrong
    /// key, tampered data, wrong nonce). No plaintext is released in that case.
    pub fn decrypt(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::framing(format!(
                "ciphertext shorter than tag: {} bytes",
                ciphertext.len()
            )));
        }

        with_cipher!(&self.cipher, c => c.decrypt(nonce.as_bytes().into(), ciphertext))
            .map_err(|_| Error::Authentication)
    }

    /// Encrypt in-place, appending the tag to `buffer`.
    pub fn encrypt_in_place(&self, nonce: &Nonce, buffer: &mut Vec<u8>) -> Result<()> {
        with_cipher!(&self.cipher, c => c.encrypt_in_place(nonce.as_bytes().into(), b"", buffer))
            .map_err(|_| Error::crypto("in-place encryption failed"))
    }

    /// Decrypt in-place, stripping the tag from `buffer`.
    pub fn decrypt_in_place(&self, nonce: &Nonce, buffer: &mut Vec<u8>) -> Result<()> {
        if buffer.len() < TAG_SIZE {
            return Err(Error::framing(format!(
                "ciphertext shorter than tag: {} bytes",
                buffer.len()
            )));
        }

        with_cipher!(&self.cipher, c => c.decrypt_in_place(nonce.as_bytes().into(), b"", buffer))
            .map_err(|_| Error::Authentication)
    }
}

/// Calculate the ciphertext length for a given plaintext length.
pub const fn ciphertext_len(plaintext_len: usize) -> usize {
    plaintext_len + TAG_SIZE
}
