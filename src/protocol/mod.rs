//! Protocol-level building blocks shared by the session and the encryptors.
//!
//! Everything in here is pure computation over byte slices. The [`crate::session`]
//! module owns state and sequencing; this module owns the math:
//!
//! - `constants`: sizes, derivation indices, protocol version
//! - `kdf`: master secret reduction and key derivation trees
//! - `lock`: wrapping factor keys for persistence, EEK layering
//! - `signature`: data normalization and decimalized multi-factor codes

pub mod constants;
pub mod kdf;
pub mod lock;
pub mod signature;

pub use lock::{LockedSignatureKeys, PlainSignatureKeys};
pub use signature::SignatureFactor;
