//! Hashing, MACs, password expansion and secure randomness.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Compute the SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute HMAC-SHA256 of `data` under `key`.
///
/// HMAC accepts keys of any length, so this cannot fail.
pub fn hmac_sha256(data: &[u8], key: &[u8]) -> [u8; 32] {
    // HMAC has no key length restriction, so new_from_slice cannot fail.
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Verify an HMAC-SHA256 tag in constant time.
pub fn hmac_sha256_verify(data: &[u8], key: &[u8], tag: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.verify_slice(tag).is_ok()
}

/// Derive `out_len` bytes from a password with PBKDF2-HMAC-SHA256.
pub fn pbkdf2_sha256(password: &[u8], salt: &[u8], iterations: u32, out_len: usize) -> Vec<u8> {
    let mut out = vec![0u8; out_len];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out);
    out
}

/// Fill a new buffer of `len` bytes from the operating system RNG.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// Generate a fresh random 128-bit key.
pub fn random_key() -> [u8; 16] {
    let mut key = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        // SHA-256("abc")
        let digest = sha256(b"abc");
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hmac_sha256_known_vector() {
        // RFC 4231, test case 2
        let mac = hmac_sha256(b"what do ya want for nothing?", b"Jefe");
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
        assert!(hmac_sha256_verify(
            b"what do ya want for nothing?",
            b"Jefe",
            &mac
        ));
        assert!(!hmac_sha256_verify(b"something else", b"Jefe", &mac));
    }

    #[test]
    fn test_pbkdf2_is_deterministic() {
        let a = pbkdf2_sha256(b"password", b"salt-salt-salt!!", 1000, 16);
        let b = pbkdf2_sha256(b"password", b"salt-salt-salt!!", 1000, 16);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);

        let c = pbkdf2_sha256(b"password2", b"salt-salt-salt!!", 1000, 16);
        assert_ne!(a, c);
    }

    #[test]
    fn test_random_bytes_are_unique() {
        let a = random_bytes(16);
        let b = random_bytes(16);
        assert_ne!(a, b);
        assert_ne!(random_key(), random_key());
    }
}
