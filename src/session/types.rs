//! Public data types exchanged between the application and the session.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::protocol::constants::AUTHORIZATION_HEADER;

// ============================================================================
// SESSION SETUP
// ============================================================================

/// Immutable configuration the session is created with.
#[derive(Clone, Debug)]
pub struct SessionSetup {
    /// Application key, distributed with the application.
    pub application_key: String,
    /// Application secret (Base64), distributed with the application.
    pub application_secret: String,
    /// Master server public key (Base64 SEC1 point) for this application.
    pub master_server_public_key: String,
    /// Opaque identifier used only to tag log lines.
    pub session_identifier: u32,
    /// Optional external encryption key protecting the knowledge and
    /// biometry factor keys.
    pub external_encryption_key: Option<[u8; 16]>,
}

impl SessionSetup {
    /// Shallow validation: all required fields are present.
    pub fn is_valid(&self) -> bool {
        !self.application_key.is_empty()
            && !self.application_secret.is_empty()
            && !self.master_server_public_key.is_empty()
    }
}

/// Caller-provided material for unlocking factor keys.
///
/// Only the keys required by the requested factors need to be present.
/// Zeroized on drop.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct SignatureUnlockKeys {
    /// 16-byte device-bound key unlocking the possession and transport keys.
    pub possession_unlock_key: Option<Vec<u8>>,
    /// User's password, unlocking the knowledge key.
    pub user_password: Option<Vec<u8>>,
    /// 16-byte biometry-bound key unlocking the biometry key.
    pub biometry_unlock_key: Option<Vec<u8>>,
}

// ============================================================================
// ACTIVATION DTOS
// ============================================================================

/// Input for the first activation step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivationStep1Param {
    /// Short activation identifier, typically typed or scanned by the user.
    pub activation_id_short: String,
    /// One-time activation password paired with the short identifier.
    pub activation_otp: String,
    /// Optional Base64 ECDSA signature of the activation code, issued by
    /// the master server key.
    pub activation_signature: Option<String>,
}

/// Output of the first activation step, sent to the server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivationStep1Result {
    /// Base64 activation nonce, used as IV for the encrypted payload.
    pub activation_nonce: String,
    /// Base64 double-encrypted device public key.
    pub c_device_public_key: String,
    /// Base64 ephemeral device public key the server needs to strip the
    /// outer encryption layer.
    pub ephemeral_public_key: String,
    /// Base64 application signature proving knowledge of the application
    /// secret.
    pub application_signature: String,
}

/// Server response to the first activation request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivationStep2Param {
    /// Activation identifier assigned by the server.
    pub activation_id: String,
    /// Base64 nonce used as IV for the encrypted server public key.
    pub ephemeral_nonce: String,
    /// Base64 ephemeral server public key (SEC1 point).
    pub ephemeral_public_key: String,
    /// Base64 double-encrypted server public key.
    pub encrypted_server_public_key: String,
    /// Base64 ECDSA signature of the response data, issued by the master
    /// server key.
    pub server_data_signature: String,
}

/// Output of the second activation step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivationStep2Result {
    /// Decimalized fingerprint of the device public key. The user compares
    /// this value with the one displayed by the server.
    pub activation_fingerprint: String,
}

// ============================================================================
// SIGNING DTOS
// ============================================================================

/// A request to be signed.
#[derive(Clone, Debug)]
pub struct HttpRequestData {
    /// HTTP method, uppercase.
    pub method: String,
    /// Stable URI identifier agreed with the server, not the raw URL.
    pub uri_id: String,
    /// Request body bytes. Empty for GET-like requests.
    pub body: Vec<u8>,
    /// When set, compute an offline signature with this pre-agreed nonce
    /// instead of generating a fresh one.
    pub offline_nonce: Option<String>,
}

impl HttpRequestData {
    /// Request data for a regular online signature.
    pub fn new(method: impl Into<String>, uri_id: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: method.into(),
            uri_id: uri_id.into(),
            body,
            offline_nonce: None,
        }
    }

    /// Request data for an offline (QR code) signature.
    pub fn for_offline_signing(
        method: impl Into<String>,
        uri_id: impl Into<String>,
        body: Vec<u8>,
        nonce_b64: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            uri_id: uri_id.into(),
            body,
            offline_nonce: Some(nonce_b64.into()),
        }
    }
}

/// A computed request signature, ready to be sent in an HTTP header.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpRequestSignature {
    /// Protocol version.
    pub version: String,
    /// Activation identifier.
    pub activation_id: String,
    /// Application key.
    pub application_key: String,
    /// Base64 nonce the signature was computed with.
    pub nonce: String,
    /// Factor combination string, e.g. `possession_knowledge`.
    pub factor: String,
    /// The decimalized signature value.
    pub signature: String,
}

impl HttpRequestSignature {
    /// Name of the HTTP header this signature belongs into.
    pub fn header_name(&self) -> &'static str {
        AUTHORIZATION_HEADER
    }

    /// Render the full value for the authorization header.
    pub fn header_value(&self) -> String {
        format!(
            "PowerAuth pa_activation_id=\"{}\", pa_application_key=\"{}\", \
             pa_nonce=\"{}\", pa_signature_type=\"{}\", pa_signature=\"{}\", \
             pa_version=\"{}\"",
            self.activation_id,
            self.application_key,
            self.nonce,
            self.factor,
            self.signature,
            self.version
        )
    }
}

// ============================================================================
// SERVER DATA
// ============================================================================

/// Which server key a signature should be verified against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureVerifyKey {
    /// The application-scoped master server key from [`SessionSetup`].
    MasterServer,
    /// The activation-scoped server key received during activation.
    Server,
}

/// Server-signed data with its ECDSA signature.
#[derive(Clone, Debug)]
pub struct SignedData {
    /// The signed bytes.
    pub data: Vec<u8>,
    /// DER-encoded ECDSA signature.
    pub signature: Vec<u8>,
    /// Key to verify against.
    pub signing_key: SignatureVerifyKey,
}

/// Activation state as reported by the server inside the status blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationState {
    /// Activation record exists but the device has not finished key exchange.
    Created,
    /// The one-time password was already consumed.
    OtpUsed,
    /// Activation is active and can sign requests.
    Active,
    /// Activation is blocked, typically after too many failed attempts.
    Blocked,
    /// Activation was removed on the server.
    Removed,
}

impl ActivationState {
    pub(crate) fn from_byte(value: u8) -> Option<ActivationState> {
        match value {
            1 => Some(ActivationState::Created),
            2 => Some(ActivationState::OtpUsed),
            3 => Some(ActivationState::Active),
            4 => Some(ActivationState::Blocked),
            5 => Some(ActivationState::Removed),
            _ => None,
        }
    }
}

/// Decoded activation status blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationStatus {
    /// Server-side activation state.
    pub state: ActivationState,
    /// Server's view of the signature counter.
    pub counter: u64,
    /// Number of failed authentication attempts in a row.
    pub fail_count: u8,
    /// Number of failed attempts after which the activation gets blocked.
    pub max_fail_count: u8,
}

// ============================================================================
// MIGRATION
// ============================================================================

/// Data recovered from a legacy persisted session that must be applied
/// after the regular deserialization.
#[derive(Clone, Copy, Debug)]
pub struct MigrationData {
    /// Signature counter value carried over from the legacy container.
    pub signature_counter: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::PROTOCOL_VERSION;

    #[test]
    fn test_session_setup_validation() {
        let setup = SessionSetup {
            application_key: "key".into(),
            application_secret: "secret".into(),
            master_server_public_key: "mpk".into(),
            session_identifier: 1,
            external_encryption_key: None,
        };
        assert!(setup.is_valid());

        let mut bad = setup.clone();
        bad.application_secret = String::new();
        assert!(!bad.is_valid());
    }

    #[test]
    fn test_signature_header_value_format() {
        let signature = HttpRequestSignature {
            version: PROTOCOL_VERSION.into(),
            activation_id: "AID".into(),
            application_key: "AKEY".into(),
            nonce: "Tk9OQ0U=".into(),
            factor: "possession_knowledge".into(),
            signature: "12345678-87654321".into(),
        };
        assert_eq!(signature.header_name(), "X-PowerAuth-Authorization");
        assert_eq!(
            signature.header_value(),
            "PowerAuth pa_activation_id=\"AID\", pa_application_key=\"AKEY\", \
             pa_nonce=\"Tk9OQ0U=\", pa_signature_type=\"possession_knowledge\", \
             pa_signature=\"12345678-87654321\", pa_version=\"2.0\""
        );
    }

    #[test]
    fn test_activation_state_from_byte() {
        assert_eq!(ActivationState::from_byte(3), Some(ActivationState::Active));
        assert_eq!(ActivationState::from_byte(0), None);
        assert_eq!(ActivationState::from_byte(6), None);
    }
}
