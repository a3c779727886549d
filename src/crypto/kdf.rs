//! Key Derivation Functions.
//!
//! Two derivations are needed to interoperate with existing clients:
//!
//! 1. The per-user master key, produced from the user's secret with OpenSSL's
//!    `EVP_BytesToKey` (MD5, one iteration, no salt).
//! 2. The per-unit subkey, produced with HKDF-SHA1 using the unit's salt and
//!    the fixed info string `ss-subkey`.

use hkdf::Hkdf;
use md5::{Digest, Md5};
use sha1::Sha1;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// HKDF info string for unit subkeys.
pub const SUBKEY_INFO: &[u8] = b"ss-subkey";

const MD5_LEN: usize = 16;

/// Derive a `key_len`-byte master key from a secret.
///
/// `D1 = MD5(secret)`, `Dn = MD5(D(n-1) || secret)`, concatenated and truncated.
pub fn evp_bytes_to_key(secret: &[u8], key_len: usize) -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(Vec::with_capacity(key_len + MD5_LEN));

    while key.len() < key_len {
        let mut hasher = Md5::new();
        if key.len() >= MD5_LEN {
            hasher.update(&key[key.len() - MD5_LEN..]);
        }
        hasher.update(secret);
        key.extend_from_slice(&hasher.finalize());
    }

    key.truncate(key_len);
    key
}

/// Derive the subkey for one unit from the master key and the unit's salt.
///
/// The subkey has the same length as the master key.
pub fn derive_subkey(master: &[u8], salt: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    hkdf_sha1(salt, master, SUBKEY_INFO, master.len())
}

fn hkdf_sha1(salt: &[u8], ikm: &[u8], info: &[u8], len: usize) -> Result<Zeroizing<Vec<u8>>> {
    let prk = Hkdf::<Sha1>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new(vec![0u8; len]);
    prk.expand(info, &mut okm)
        .map_err(|_| Error::crypto("HKDF expansion failed"))?;
    Ok(okm)
}
