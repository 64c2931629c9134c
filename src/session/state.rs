//! Internal session state machine data.
//!
//! The session is a sum type over its lifecycle, so activation-in-progress
//! data and committed activation data can never coexist:
//!
//! ```text
//!   Invalid ── broken setup, every operation fails
//!   Empty ──────────► Activation1 ───────► Activation2 ───────► Activated
//!            start          validate response      complete
//!              ▲                │ failure               │ failure
//!              └────────────────┴───────────────────────┘
//! ```
//!
//! A failed handshake step destroys the transient data and falls back to
//! `Empty`; `Activated` is left only by reset or by loading other state.

use zeroize::Zeroize;

use crate::crypto::EcKeyPair;
use crate::protocol::constants::PBKDF2_SALT_SIZE;
use crate::protocol::lock::LockedSignatureKeys;

/// Transient data shared by the activation handshake steps.
pub(crate) struct ActivationData {
    /// Freshly generated device keypair.
    pub device_key: EcKeyPair,
    /// SEC1 export of the device public key, as transmitted.
    pub device_public_key: Vec<u8>,
    /// Expanded OTP key, needed again to strip the inner layer of the
    /// server public key.
    pub expanded_otp_key: [u8; 16],
    /// Filled during response validation.
    pub activation_id: String,
    /// Server public key received in the response (SEC1).
    pub server_public_key: Vec<u8>,
    /// Reduced ECDH secret between device and server keys.
    pub master_shared_secret: [u8; 16],
}

impl ActivationData {
    pub fn new(
        device_key: EcKeyPair,
        device_public_key: Vec<u8>,
        expanded_otp_key: [u8; 16],
    ) -> Self {
        Self {
            device_key,
            device_public_key,
            expanded_otp_key,
            activation_id: String::new(),
            server_public_key: Vec::new(),
            master_shared_secret: [0u8; 16],
        }
    }
}

impl Drop for ActivationData {
    fn drop(&mut self) {
        self.expanded_otp_key.zeroize();
        self.master_shared_secret.zeroize();
    }
}

/// Flags persisted alongside the activation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct PersistentFlags {
    /// The knowledge and biometry keys carry an external encryption key
    /// layer.
    pub uses_external_key: bool,
    /// The counter was advanced twice by a vault-prepare signature and the
    /// extra value is reserved for the next vault unlock.
    pub waiting_for_vault_unlock: bool,
}

/// Everything a valid activation persists between application runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PersistentData {
    /// Local signature counter, advanced by every computed signature.
    pub signature_counter: u64,
    /// Activation identifier assigned by the server.
    pub activation_id: String,
    /// Random salt for the password expansion.
    pub password_salt: Vec<u8>,
    /// Iteration count for the password expansion.
    pub password_iterations: u32,
    /// SEC1 device public key.
    pub device_public_key: Vec<u8>,
    /// SEC1 server public key for this activation.
    pub server_public_key: Vec<u8>,
    /// Device private key encrypted with the vault key.
    pub c_device_private_key: Vec<u8>,
    /// Locked signature key set.
    pub keys: LockedSignatureKeys,
    /// Persisted flags.
    pub flags: PersistentFlags,
}

impl PersistentData {
    /// Structural validation after deserialization.
    pub fn is_valid(&self) -> bool {
        !self.activation_id.is_empty()
            && self.password_salt.len() == PBKDF2_SALT_SIZE
            && self.password_iterations > 0
            && !self.device_public_key.is_empty()
            && !self.server_public_key.is_empty()
            && !self.c_device_private_key.is_empty()
            && self.keys.is_valid()
    }
}

/// The session lifecycle.
pub(crate) enum SessionState {
    /// The setup was rejected; no operation is possible.
    Invalid,
    /// No activation; a new one can be started.
    Empty,
    /// First activation step passed, waiting for the server response.
    Activation1(Box<ActivationData>),
    /// Server response validated, waiting for the key lock to complete.
    Activation2(Box<ActivationData>),
    /// Activation committed and persisted.
    Activated(PersistentData),
}

impl SessionState {
    /// Short state tag for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Invalid => "invalid",
            SessionState::Empty => "empty",
            SessionState::Activation1 { .. } => "activation1",
            SessionState::Activation2 { .. } => "activation2",
            SessionState::Activated { .. } => "activated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_persistent_data() -> PersistentData {
        PersistentData {
            signature_counter: 1,
            activation_id: "ACT-ID".into(),
            password_salt: vec![0u8; PBKDF2_SALT_SIZE],
            password_iterations: 10_000,
            device_public_key: vec![4u8; 65],
            server_public_key: vec![4u8; 65],
            c_device_private_key: vec![1u8; 48],
            keys: LockedSignatureKeys {
                possession: vec![0u8; 16],
                knowledge: vec![0u8; 16],
                biometry: None,
                transport: vec![0u8; 16],
            },
            flags: PersistentFlags::default(),
        }
    }

    #[test]
    fn test_persistent_data_validation() {
        assert!(sample_persistent_data().is_valid());

        let mut pd = sample_persistent_data();
        pd.activation_id.clear();
        assert!(!pd.is_valid());

        let mut pd = sample_persistent_data();
        pd.password_salt.truncate(8);
        assert!(!pd.is_valid());

        let mut pd = sample_persistent_data();
        pd.keys.knowledge = vec![0u8; 8];
        assert!(!pd.is_valid());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SessionState::Empty.name(), "empty");
        assert_eq!(
            SessionState::Activated(sample_persistent_data()).name(),
            "activated"
        );
    }
}
