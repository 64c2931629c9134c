//! # PowerAuth Core
//!
//! The client-side engine of the PowerAuth 2.0 authentication protocol:
//! device activation, multi-factor request signing, secure vault and
//! end-to-end payload encryption, with no networking of its own.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       POWERAUTH CORE MODULES                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌──────────────┐   │
//! │  │   Session   │  │  Protocol   │  │    ECIES    │  │Serialization │   │
//! │  │             │  │             │  │             │  │              │   │
//! │  │ - Activate  │  │ - KDF tree  │  │ - Encryptor │  │ - State blob │   │
//! │  │ - Sign      │  │ - Factors   │  │ - Messages  │  │ - Migration  │   │
//! │  │ - Vault     │  │ - Key locks │  │             │  │              │   │
//! │  └──────┬──────┘  └──────┬──────┘  └──────┬──────┘  └──────┬───────┘   │
//! │         │                │                │                │           │
//! │         └────────────────┴────────┬───────┴────────────────┘           │
//! │                                   │                                     │
//! │                          ┌────────▼────────┐                            │
//! │                          │     Crypto      │                            │
//! │                          │                 │                            │
//! │                          │ - P-256 ECDH    │                            │
//! │                          │ - ECDSA         │                            │
//! │                          │ - AES-128-CBC   │                            │
//! │                          │ - HMAC, PBKDF2  │                            │
//! │                          └─────────────────┘                            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`crypto`] - Cryptographic primitives (P-256, AES-CBC, HMAC, PBKDF2)
//! - [`protocol`] - Protocol constants, key derivation, factor key locking
//!   and the multi-factor signature scheme
//! - [`session`] - The activation state machine and every client operation
//! - [`ecies`] - Personalized and nonpersonalized payload encryptors
//!
//! ## Security Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SECURITY LAYERS                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Layer 1: Activation Handshake (P-256 ECDH + ECDSA)                     │
//! │  ──────────────────────────────────────────────────                     │
//! │  Device and server agree on a 128-bit master secret; server             │
//! │  responses are signed with the master server private key.               │
//! │                                                                         │
//! │  Layer 2: Factor Keys (AES key wrapping)                                │
//! │  ───────────────────────────────────────                                │
//! │  Possession, knowledge and biometry signature keys are derived          │
//! │  from the master secret and stored only in locked form, each            │
//! │  wrapped with a key the server never sees.                              │
//! │                                                                         │
//! │  Layer 3: Request Signatures (HMAC-SHA256 cascade)                      │
//! │  ─────────────────────────────────────────────────                      │
//! │  Every signed request advances a monotonic counter; signatures          │
//! │  chain the unlocked factor keys so each extra factor strictly           │
//! │  strengthens the proof.                                                 │
//! │                                                                         │
//! │  Layer 4: Payload Encryption (ECIES-style AES-CBC + HMAC)               │
//! │  ────────────────────────────────────────────────────────               │
//! │  Request and response payloads are encrypted end to end under           │
//! │  per-message keys, independent of the transport channel.                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The crate performs no I/O. Persistence, networking and secure key
//! storage belong to the embedding application; the session hands out
//! opaque state blobs and HTTP header values and takes them back.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod crypto;
pub mod ecies;
pub mod error;
pub mod protocol;
mod serialization;
pub mod session;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use ecies::{EncryptedMessage, Encryptor};
pub use error::{Error, Result};
pub use protocol::SignatureFactor;
pub use session::types::{
    ActivationState, ActivationStatus, ActivationStep1Param, ActivationStep1Result,
    ActivationStep2Param, ActivationStep2Result, HttpRequestData, HttpRequestSignature,
    SessionSetup, SignatureUnlockKeys, SignatureVerifyKey, SignedData,
};
pub use session::{Session, SharedSession};
