//! Protocol-wide constants.

/// Protocol version string sent in every signature header.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Name of the HTTP header carrying a request signature.
pub const AUTHORIZATION_HEADER: &str = "X-PowerAuth-Authorization";

/// Size of all symmetric signature and transport keys, in bytes.
pub const SIGNATURE_KEY_SIZE: usize = 16;

/// Size of the activation and ECIES nonces, in bytes.
pub const ACTIVATION_NONCE_SIZE: usize = 16;

/// Size of the vault key, in bytes.
pub const VAULT_KEY_SIZE: usize = 16;

/// Number of decimal digits in one signature component and in the
/// activation fingerprint.
pub const SIGNATURE_DECIMAL_DIGITS: usize = 8;

/// PBKDF2 iteration count for expanding the user password.
pub const PBKDF2_PASSWORD_ITERATIONS: u32 = 10_000;

/// PBKDF2 iteration count for expanding the activation OTP.
pub const PBKDF2_OTP_ITERATIONS: u32 = 10_000;

/// Size of the random password salt, in bytes.
pub const PBKDF2_SALT_SIZE: usize = 16;

/// Derivation index for the possession signature key.
pub const KEY_INDEX_POSSESSION: u64 = 1;
/// Derivation index for the knowledge signature key.
pub const KEY_INDEX_KNOWLEDGE: u64 = 2;
/// Derivation index for the biometry signature key.
pub const KEY_INDEX_BIOMETRY: u64 = 3;
/// Derivation index for the transport key.
pub const KEY_INDEX_TRANSPORT: u64 = 1000;
/// Derivation index for the vault encryption key.
pub const KEY_INDEX_VAULT: u64 = 2000;

/// Application key and secret used when computing offline signatures.
pub const OFFLINE_APP_SECRET: &str = "offline";
