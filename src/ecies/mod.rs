//! End-to-end payload encryption.
//!
//! An [`Encryptor`] protects request and response payloads between the
//! device and the application server, independently of the transport
//! channel. Two flavours exist:
//!
//! ```text
//!   nonpersonalized              personalized
//!   ───────────────              ────────────
//!   no activation required       requires an established activation
//!   key: ECDH(ephemeral,         key: transport key unlocked with
//!        master server key)           the possession factor
//!   message carries:             message carries:
//!     ephemeral public key         activation identifier
//!     application key
//! ```
//!
//! Both flavours derive per-message keys from a caller-chosen session
//! index plus fresh random indices, so no two messages are encrypted or
//! authenticated under the same key.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{aes_cbc_decrypt_padded, aes_cbc_encrypt_padded, hmac_sha256, random_key};
use crate::error::{Error, Result};
use crate::protocol::kdf::derive_secret_key_hmac;

// ===== MESSAGE =====

/// One encrypted payload, as exchanged with the server.
///
/// All binary fields are Base64 encoded. `ephemeral_public_key` and
/// `application_key` are present only for nonpersonalized messages,
/// `activation_id` only for personalized ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    /// Identifier of the key agreement used to build the encryptor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_key: Option<String>,
    /// Activation identifier, personalized messages only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_id: Option<String>,
    /// Ephemeral public key, nonpersonalized messages only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ephemeral_public_key: Option<String>,
    /// Caller-chosen index identifying the encryptor's key stream.
    pub session_index: String,
    /// Fresh per-message index for the encryption key.
    pub ad_hoc_index: String,
    /// Fresh per-message index for the authentication key.
    pub mac_index: String,
    /// CBC initialization vector for this message.
    pub nonce: String,
    /// HMAC-SHA256 over the encrypted payload.
    pub mac: String,
    /// The encrypted payload itself.
    pub encrypted_data: String,
}

// ===== ENCRYPTOR =====

/// Identity material bound to an encryptor's mode.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EncryptorMode {
    /// Keyed against the master server public key, before activation.
    Nonpersonalized {
        ephemeral_public_key: String,
        application_key: String,
    },
    /// Keyed against the activation's transport key.
    Personalized { activation_id: String },
}

/// A bidirectional payload encryptor.
///
/// Created by the session, never directly. The encryptor owns a copy of
/// the negotiated base key, so it stays usable after the session moves on.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Encryptor {
    #[zeroize(skip)]
    mode: EncryptorMode,
    session_index: [u8; 16],
    /// Base key derived once from the transport key and session index.
    base_key: [u8; 16],
    #[zeroize(skip)]
    decrypt_only: bool,
}

impl Encryptor {
    pub(crate) fn nonpersonalized(
        session_index: [u8; 16],
        transport_key: [u8; 16],
        ephemeral_public_key: String,
        application_key: String,
    ) -> Self {
        Self {
            mode: EncryptorMode::Nonpersonalized {
                ephemeral_public_key,
                application_key,
            },
            session_index,
            base_key: derive_secret_key_hmac(&transport_key, &session_index),
            decrypt_only: false,
        }
    }

    pub(crate) fn personalized(
        session_index: [u8; 16],
        transport_key: [u8; 16],
        activation_id: String,
    ) -> Self {
        Self {
            mode: EncryptorMode::Personalized { activation_id },
            session_index,
            base_key: derive_secret_key_hmac(&transport_key, &session_index),
            decrypt_only: false,
        }
    }

    /// True when the encryptor was made from the master server public key.
    pub fn is_nonpersonalized(&self) -> bool {
        matches!(self.mode, EncryptorMode::Nonpersonalized { .. })
    }

    /// True when the encryptor is bound to an activation.
    pub fn is_personalized(&self) -> bool {
        matches!(self.mode, EncryptorMode::Personalized { .. })
    }

    /// Clone this encryptor into a decrypt-only copy.
    ///
    /// Useful when a response must be decrypted on another thread while
    /// the original keeps serving requests. The copy refuses to encrypt.
    pub fn copy_for_decryption(&self) -> Self {
        Self {
            mode: self.mode.clone(),
            session_index: self.session_index,
            base_key: self.base_key,
            decrypt_only: true,
        }
    }

    /// Encrypt `data` into a message ready for transport.
    ///
    /// Fails with [`Error::WrongState`] on a decrypt-only copy.
    pub fn encrypt(&self, data: &[u8]) -> Result<EncryptedMessage> {
        if self.decrypt_only {
            return Err(Error::WrongState);
        }
        let mut ad_hoc_index = random_key();
        // The two per-message indices must derive distinct keys.
        let mut mac_index = random_key();
        while mac_index == ad_hoc_index {
            mac_index = random_key();
        }
        let nonce = random_key();

        let enc_key = derive_secret_key_hmac(&self.base_key, &ad_hoc_index);
        let mac_key = derive_secret_key_hmac(&self.base_key, &mac_index);
        let encrypted_data = aes_cbc_encrypt_padded(&enc_key, &nonce, data)?;
        let mac = hmac_sha256(&encrypted_data, &mac_key);

        let mut message = EncryptedMessage {
            session_index: BASE64.encode(self.session_index),
            ad_hoc_index: BASE64.encode(ad_hoc_index),
            mac_index: BASE64.encode(mac_index),
            nonce: BASE64.encode(nonce),
            mac: BASE64.encode(mac),
            encrypted_data: BASE64.encode(&encrypted_data),
            ..EncryptedMessage::default()
        };
        match &self.mode {
            EncryptorMode::Nonpersonalized {
                ephemeral_public_key,
                application_key,
            } => {
                message.ephemeral_public_key = Some(ephemeral_public_key.clone());
                message.application_key = Some(application_key.clone());
            }
            EncryptorMode::Personalized { activation_id } => {
                message.activation_id = Some(activation_id.clone());
            }
        }
        ad_hoc_index.zeroize();
        mac_index.zeroize();
        Ok(message)
    }

    /// Authenticate and decrypt a received message.
    ///
    /// The message must carry the same session index and identity fields
    /// this encryptor was created with, otherwise [`Error::WrongParam`] is
    /// returned. A failed MAC check or a malformed payload yields
    /// [`Error::Encryption`].
    pub fn decrypt(&self, message: &EncryptedMessage) -> Result<Vec<u8>> {
        self.validate_identity(message)?;

        let session_index = decode_index(&message.session_index)?;
        if session_index != self.session_index {
            return Err(Error::WrongParam);
        }
        let ad_hoc_index = decode_index(&message.ad_hoc_index)?;
        let mac_index = decode_index(&message.mac_index)?;
        let nonce = decode_index(&message.nonce)?;
        let mac = BASE64
            .decode(&message.mac)
            .map_err(|_| Error::Encryption)?;
        let encrypted_data = BASE64
            .decode(&message.encrypted_data)
            .map_err(|_| Error::Encryption)?;

        let mac_key = derive_secret_key_hmac(&self.base_key, &mac_index);
        if !crate::crypto::hmac_sha256_verify(&encrypted_data, &mac_key, &mac) {
            return Err(Error::Encryption);
        }
        let enc_key = derive_secret_key_hmac(&self.base_key, &ad_hoc_index);
        aes_cbc_decrypt_padded(&enc_key, &nonce, &encrypted_data)
    }

    fn validate_identity(&self, message: &EncryptedMessage) -> Result<()> {
        match &self.mode {
            EncryptorMode::Nonpersonalized { application_key, .. } => {
                if message.activation_id.is_some() {
                    return Err(Error::WrongParam);
                }
                if let Some(key) = &message.application_key {
                    if key != application_key {
                        return Err(Error::WrongParam);
                    }
                }
            }
            EncryptorMode::Personalized { activation_id } => {
                if message.application_key.is_some() || message.ephemeral_public_key.is_some() {
                    return Err(Error::WrongParam);
                }
                if let Some(id) = &message.activation_id {
                    if id != activation_id {
                        return Err(Error::WrongParam);
                    }
                }
            }
        }
        Ok(())
    }
}

fn decode_index(value: &str) -> Result<[u8; 16]> {
    let bytes = BASE64.decode(value).map_err(|_| Error::Encryption)?;
    if bytes.len() != 16 {
        return Err(Error::Encryption);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nonpersonalized_encryptor() -> Encryptor {
        Encryptor::nonpersonalized(
            [0x42u8; 16],
            [0x17u8; 16],
            "RVBLRVBL".to_string(),
            "app-key".to_string(),
        )
    }

    fn personalized_encryptor() -> Encryptor {
        Encryptor::personalized([0x42u8; 16], [0x17u8; 16], "ACT-ID-123".to_string())
    }

    #[test]
    fn test_nonpersonalized_roundtrip() {
        let encryptor = nonpersonalized_encryptor();
        let message = encryptor.encrypt(b"hello over E2EE").unwrap();
        assert_eq!(message.application_key.as_deref(), Some("app-key"));
        assert_eq!(message.ephemeral_public_key.as_deref(), Some("RVBLRVBL"));
        assert!(message.activation_id.is_none());
        let plain = encryptor.decrypt(&message).unwrap();
        assert_eq!(plain, b"hello over E2EE");
    }

    #[test]
    fn test_personalized_roundtrip() {
        let encryptor = personalized_encryptor();
        let message = encryptor.encrypt(b"").unwrap();
        assert_eq!(message.activation_id.as_deref(), Some("ACT-ID-123"));
        assert!(message.application_key.is_none());
        assert!(message.ephemeral_public_key.is_none());
        assert_eq!(encryptor.decrypt(&message).unwrap(), b"");
    }

    #[test]
    fn test_messages_use_fresh_indices() {
        let encryptor = personalized_encryptor();
        let m1 = encryptor.encrypt(b"same plaintext").unwrap();
        let m2 = encryptor.encrypt(b"same plaintext").unwrap();
        assert_ne!(m1.ad_hoc_index, m2.ad_hoc_index);
        assert_ne!(m1.nonce, m2.nonce);
        assert_ne!(m1.encrypted_data, m2.encrypted_data);
    }

    #[test]
    fn test_tampered_payload_fails_mac() {
        let encryptor = personalized_encryptor();
        let mut message = encryptor.encrypt(b"payload").unwrap();
        let mut raw = BASE64.decode(&message.encrypted_data).unwrap();
        raw[0] ^= 0x01;
        message.encrypted_data = BASE64.encode(raw);
        assert_eq!(encryptor.decrypt(&message), Err(Error::Encryption));
    }

    #[test]
    fn test_wrong_session_index_is_rejected() {
        let encryptor = personalized_encryptor();
        let other = Encryptor::personalized([0x43u8; 16], [0x17u8; 16], "ACT-ID-123".to_string());
        let message = other.encrypt(b"payload").unwrap();
        assert_eq!(encryptor.decrypt(&message), Err(Error::WrongParam));
    }

    #[test]
    fn test_identity_mismatch_is_rejected() {
        let encryptor = personalized_encryptor();
        let mut message = encryptor.encrypt(b"payload").unwrap();
        message.activation_id = Some("OTHER-ID".to_string());
        assert_eq!(encryptor.decrypt(&message), Err(Error::WrongParam));

        let np = nonpersonalized_encryptor();
        let mut message = np.encrypt(b"payload").unwrap();
        message.application_key = Some("other-app".to_string());
        assert_eq!(np.decrypt(&message), Err(Error::WrongParam));
    }

    #[test]
    fn test_copy_for_decryption_refuses_to_encrypt() {
        let encryptor = nonpersonalized_encryptor();
        let message = encryptor.encrypt(b"payload").unwrap();
        let copy = encryptor.copy_for_decryption();
        assert_eq!(copy.encrypt(b"payload"), Err(Error::WrongState));
        assert_eq!(copy.decrypt(&message).unwrap(), b"payload");
    }

    #[test]
    fn test_serde_shape() {
        let encryptor = personalized_encryptor();
        let message = encryptor.encrypt(b"payload").unwrap();
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"activation_id\""));
        assert!(!json.contains("ephemeral_public_key"));
        let parsed: EncryptedMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(encryptor.decrypt(&parsed).unwrap(), b"payload");
    }
}
