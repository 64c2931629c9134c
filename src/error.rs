//! Error types for powerauth-core.
//!
//! The error surface is deliberately coarse. Callers (and attackers who can
//! observe callers) learn only which of three broad things went wrong:
//!
//! - [`Error::WrongState`]: the operation is not allowed right now
//! - [`Error::WrongParam`]: the caller passed missing or malformed input
//! - [`Error::Encryption`]: a cryptographic computation or validation failed
//!
//! No variant carries payload data. A failed signature verification, a bad
//! MAC and a wrong password all collapse into [`Error::Encryption`], so the
//! error itself cannot be used as a decryption oracle.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by session and encryptor operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The operation is not allowed in the current session state.
    #[error("operation is not allowed in the current session state")]
    WrongState,

    /// A required parameter is missing or malformed.
    #[error("missing or malformed parameter")]
    WrongParam,

    /// A cryptographic computation or data validation failed.
    #[error("cryptographic operation failed")]
    Encryption,
}

impl Error {
    /// Convert error to a stable numeric code for FFI boundaries.
    ///
    /// Code `0` is reserved for success.
    pub fn code(&self) -> u32 {
        match self {
            Error::WrongState => 1,
            Error::WrongParam => 2,
            Error::Encryption => 3,
        }
    }
}
