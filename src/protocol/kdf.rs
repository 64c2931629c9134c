//! Key derivation functions.
//!
//! Every long-term key in the protocol descends from one 128-bit master
//! shared secret, agreed over ECDH during activation and reduced with
//! [`reduce_shared_secret`]. Purpose-specific keys are then derived with a
//! fixed-index AES based KDF, so device and server can derive the same tree
//! independently:
//!
//! ```text
//!   ECDH x-coordinate (32B)
//!        │ reduce_shared_secret
//!        ▼
//!   master secret (16B)
//!        │ derive_secret_key(index)
//!        ├── 1    → possession key
//!        ├── 2    → knowledge key
//!        ├── 3    → biometry key
//!        ├── 1000 → transport key
//!        └── 2000 → vault key
//! ```

use crate::crypto::{aes_cbc_encrypt, hmac_sha256, pbkdf2_sha256, ZERO_IV};
use crate::error::Result;
use crate::protocol::constants::{PBKDF2_OTP_ITERATIONS, SIGNATURE_KEY_SIZE};

/// Reduce a 32-byte ECDH x-coordinate to a 128-bit key.
///
/// The coordinate is hashed with SHA-256 and the two digest halves are
/// XOR-folded together.
pub fn reduce_shared_secret(shared: &[u8; 32]) -> [u8; 16] {
    let digest = crate::crypto::sha256(shared);
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = digest[i] ^ digest[i + 16];
    }
    out
}

/// Derive a purpose-specific key from a 128-bit master key.
///
/// The derivation encrypts a single block holding the big-endian index with
/// AES-128-CBC, zero IV, no padding. Distinct indices yield independent keys.
pub fn derive_secret_key(master: &[u8; 16], index: u64) -> Result<[u8; 16]> {
    let mut block = [0u8; 16];
    block[8..].copy_from_slice(&index.to_be_bytes());
    let encrypted = aes_cbc_encrypt(master, &ZERO_IV, &block)?;
    let mut out = [0u8; 16];
    out.copy_from_slice(&encrypted);
    Ok(out)
}

/// HMAC based key derivation used by the end-to-end encryptors.
///
/// Returns the first 16 bytes of HMAC-SHA256 over `data` under `key`.
pub fn derive_secret_key_hmac(key: &[u8], data: &[u8]) -> [u8; 16] {
    let mac = hmac_sha256(data, key);
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac[..16]);
    out
}

/// Expand an activation OTP into a 128-bit key.
///
/// PBKDF2-HMAC-SHA256 with the short activation identifier as salt.
pub fn expand_otp_key(activation_id_short: &str, activation_otp: &str) -> [u8; 16] {
    let expanded = pbkdf2_sha256(
        activation_otp.as_bytes(),
        activation_id_short.as_bytes(),
        PBKDF2_OTP_ITERATIONS,
        SIGNATURE_KEY_SIZE,
    );
    let mut out = [0u8; 16];
    out.copy_from_slice(&expanded);
    out
}

/// Expand a user password into a 128-bit key with a per-activation salt.
pub fn derive_password_key(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 16] {
    let expanded = pbkdf2_sha256(password, salt, iterations, SIGNATURE_KEY_SIZE);
    let mut out = [0u8; 16];
    out.copy_from_slice(&expanded);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_shared_secret_folds_digest_halves() {
        let shared = [0x11u8; 32];
        let digest = crate::crypto::sha256(&shared);
        let reduced = reduce_shared_secret(&shared);
        for i in 0..16 {
            assert_eq!(reduced[i], digest[i] ^ digest[i + 16]);
        }
    }

    #[test]
    fn test_derive_secret_key_indices_are_independent() {
        let master = [0x77u8; 16];
        let k1 = derive_secret_key(&master, 1).unwrap();
        let k2 = derive_secret_key(&master, 2).unwrap();
        let k1000 = derive_secret_key(&master, 1000).unwrap();
        assert_ne!(k1, k2);
        assert_ne!(k1, k1000);
        assert_ne!(k2, k1000);
        // Deterministic for a fixed master and index.
        assert_eq!(k1, derive_secret_key(&master, 1).unwrap());
    }

    #[test]
    fn test_derive_secret_key_matches_manual_aes() {
        let master = [0x01u8; 16];
        let mut block = [0u8; 16];
        block[8..].copy_from_slice(&42u64.to_be_bytes());
        let manual = crate::crypto::aes_cbc_encrypt(&master, &crate::crypto::ZERO_IV, &block).unwrap();
        assert_eq!(derive_secret_key(&master, 42).unwrap().as_slice(), &manual[..]);
    }

    #[test]
    fn test_hmac_kdf_truncates_mac() {
        let key = [0x33u8; 16];
        let derived = derive_secret_key_hmac(&key, b"index-data");
        let full = crate::crypto::hmac_sha256(b"index-data", &key);
        assert_eq!(derived, full[..16]);
    }

    #[test]
    fn test_expand_otp_key_depends_on_both_inputs() {
        let a = expand_otp_key("SHORT-ID", "OTP-VALUE");
        assert_eq!(a, expand_otp_key("SHORT-ID", "OTP-VALUE"));
        assert_ne!(a, expand_otp_key("SHORT-ID", "OTHER-OTP"));
        assert_ne!(a, expand_otp_key("OTHER-ID", "OTP-VALUE"));
    }
}
