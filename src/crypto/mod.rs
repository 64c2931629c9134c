//! Cryptographic primitives for powerauth-core.
//!
//! This module wraps the RustCrypto crates behind a small API surface so the
//! rest of the crate never touches cipher internals directly:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Crypto Primitives                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  keys.rs     P-256 keypairs                                 │
//! │              - ECDH key agreement (activation handshake)    │
//! │              - ECDSA signatures (server data validation)    │
//! │                                                             │
//! │  cipher.rs   AES-128-CBC                                    │
//! │              - PKCS#7 padded (payloads, vault, ECIES)       │
//! │              - unpadded (key wrapping, KDF, status blob)    │
//! │                                                             │
//! │  hash.rs     SHA-256, HMAC-SHA256, PBKDF2, secure random    │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All failures collapse into [`crate::Error::Encryption`]; the primitives
//! never leak *why* an operation failed.

mod cipher;
mod hash;
mod keys;

pub use cipher::{
    aes_cbc_decrypt, aes_cbc_decrypt_padded, aes_cbc_encrypt, aes_cbc_encrypt_padded,
    AES_BLOCK_SIZE, ZERO_IV,
};
pub use hash::{hmac_sha256, hmac_sha256_verify, pbkdf2_sha256, random_bytes, random_key, sha256};
pub use keys::{EcKeyPair, EcPublicKey};
