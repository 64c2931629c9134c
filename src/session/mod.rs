//! The session protocol engine.
//!
//! A [`Session`] owns the whole client side of the protocol:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Session                             │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  Activation      start → validate response → complete        │
//! │                  (three-step ECDH + OTP handshake)           │
//! │                                                              │
//! │  Signing         multi-factor decimalized request signatures │
//! │                  with a strictly monotonic counter           │
//! │                                                              │
//! │  Vault           counter-bound key exchange unlocking the    │
//! │                  device private key and derived app keys     │
//! │                                                              │
//! │  Maintenance     password change, biometry add/remove,       │
//! │                  EEK management, status decoding,            │
//! │                  state save/load                             │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A `Session` takes `&mut self` and belongs to one logical owner. Wrap it
//! in [`SharedSession`] when multiple threads need the same instance.

mod shared;
pub(crate) mod state;
pub mod types;

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use zeroize::Zeroizing;

use crate::crypto::{
    aes_cbc_decrypt, aes_cbc_decrypt_padded, aes_cbc_encrypt_padded, random_bytes, sha256,
    EcKeyPair, EcPublicKey,
};
use crate::ecies::Encryptor;
use crate::error::{Error, Result};
use crate::protocol::constants::{
    ACTIVATION_NONCE_SIZE, OFFLINE_APP_SECRET, PBKDF2_PASSWORD_ITERATIONS, PBKDF2_SALT_SIZE,
    PROTOCOL_VERSION, SIGNATURE_KEY_SIZE, VAULT_KEY_SIZE,
};
use crate::protocol::kdf::{derive_secret_key, expand_otp_key, reduce_shared_secret};
use crate::protocol::lock::{
    add_eek_layer, derive_factor_keys, lock_biometry_key, lock_knowledge_key, lock_signature_keys,
    remove_eek_layer, unlock_signature_keys,
};
use crate::protocol::signature::{
    calculate_application_signature, calculate_signature, decimalize, normalize_data_for_signature,
    normalize_key_value_map, SignatureFactor,
};
use crate::crypto::ZERO_IV;
use crate::serialization::{deserialize_session_state, serialize_session_state, DataReader, LoadedState};
use state::{ActivationData, PersistentData, SessionState};
use types::{
    ActivationState, ActivationStatus, ActivationStep1Param, ActivationStep1Result,
    ActivationStep2Param, ActivationStep2Result, HttpRequestData, HttpRequestSignature,
    SessionSetup, SignatureUnlockKeys, SignatureVerifyKey, SignedData,
};

pub use shared::SharedSession;

/// Status blob layout: header, state, counter, fail counters, reserved.
const STATUS_BLOB_SIZE: usize = 32;
const STATUS_BLOB_HEADER: [u8; 4] = [0xDE, 0xC0, 0xDE, 0xD1];

/// Client-side protocol engine holding one activation.
pub struct Session {
    setup: SessionSetup,
    state: SessionState,
}

impl Session {
    /// Create a session from its setup.
    ///
    /// An invalid setup produces a permanently inoperable session; every
    /// operation on it returns [`Error::WrongState`].
    pub fn new(setup: SessionSetup) -> Self {
        let state = if setup.is_valid() {
            SessionState::Empty
        } else {
            tracing::warn!(
                "Session {}: Invalid setup, session will be inoperable",
                setup.session_identifier
            );
            SessionState::Invalid
        };
        Self { setup, state }
    }

    // ========================================================================
    // STATE PROBES
    // ========================================================================

    /// Identifier from the setup, used to tag log lines.
    pub fn session_identifier(&self) -> u32 {
        self.setup.session_identifier
    }

    /// The setup this session was created with.
    pub fn setup(&self) -> &SessionSetup {
        &self.setup
    }

    /// True unless the setup was rejected at construction.
    pub fn has_valid_setup(&self) -> bool {
        !matches!(self.state, SessionState::Invalid)
    }

    /// True when a new activation can be started.
    pub fn can_start_activation(&self) -> bool {
        matches!(self.state, SessionState::Empty)
    }

    /// True while an activation handshake is in progress.
    pub fn has_pending_activation(&self) -> bool {
        matches!(
            self.state,
            SessionState::Activation1(_) | SessionState::Activation2(_)
        )
    }

    /// True when the session holds a completed activation.
    pub fn has_valid_activation(&self) -> bool {
        matches!(self.state, SessionState::Activated(_))
    }

    /// Activation identifier, when activated.
    pub fn activation_identifier(&self) -> Option<&str> {
        match &self.state {
            SessionState::Activated(pd) => Some(&pd.activation_id),
            _ => None,
        }
    }

    /// Recompute the activation fingerprint from the persisted device
    /// public key.
    pub fn activation_fingerprint(&self) -> Option<String> {
        match &self.state {
            SessionState::Activated(pd) => {
                let public_key = EcPublicKey::from_sec1_bytes(&pd.device_public_key).ok()?;
                Some(decimalize(&sha256(&public_key.coord_x())))
            }
            _ => None,
        }
    }

    /// Drop any activation or handshake progress and return to the empty
    /// state. A session with a broken setup stays inoperable.
    pub fn reset_session(&mut self) {
        if self.has_valid_setup() {
            self.change_state(SessionState::Empty);
        }
    }

    fn change_state(&mut self, new_state: SessionState) {
        if self.state.name() != new_state.name() {
            tracing::debug!(
                "Session {}: Changing state {} -> {}",
                self.session_identifier(),
                self.state.name(),
                new_state.name()
            );
        }
        self.state = new_state;
    }

    // ========================================================================
    // PERSISTENCE
    // ========================================================================

    /// Serialize the session state into an opaque blob.
    ///
    /// A pending activation is deliberately not persisted; saving during a
    /// handshake produces an empty-state blob.
    pub fn save_session_state(&self) -> Result<Vec<u8>> {
        if !self.has_valid_setup() {
            return Err(Error::WrongState);
        }
        let pd = match &self.state {
            SessionState::Activated(pd) => Some(pd),
            _ => None,
        };
        Ok(serialize_session_state(pd))
    }

    /// Restore the session state from a blob produced by
    /// [`Session::save_session_state`], or migrate a legacy blob.
    ///
    /// On a parse failure the session falls back to the empty state.
    pub fn load_session_state(&mut self, blob: &[u8]) -> Result<()> {
        if !self.has_valid_setup() {
            return Err(Error::WrongState);
        }
        match deserialize_session_state(blob) {
            Ok(LoadedState::Empty) => {
                self.change_state(SessionState::Empty);
                Ok(())
            }
            Ok(LoadedState::Activated(pd)) => {
                self.change_state(SessionState::Activated(pd));
                Ok(())
            }
            Ok(LoadedState::Migrated(mut pd, migration)) => {
                tracing::debug!(
                    "Session {}: Migrating legacy state, counter {}",
                    self.session_identifier(),
                    migration.signature_counter
                );
                pd.signature_counter = migration.signature_counter;
                self.change_state(SessionState::Activated(pd));
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    "Session {}: Unable to restore session state",
                    self.session_identifier()
                );
                self.change_state(SessionState::Empty);
                Err(err)
            }
        }
    }

    // ========================================================================
    // ACTIVATION
    // ========================================================================

    /// First activation step: generate the device keypair and build the
    /// encrypted payload for the server.
    pub fn start_activation(
        &mut self,
        param: &ActivationStep1Param,
    ) -> Result<ActivationStep1Result> {
        if !self.has_valid_setup() || !self.can_start_activation() {
            tracing::warn!(
                "Session {}: Step 1: Called in wrong state",
                self.session_identifier()
            );
            return Err(Error::WrongState);
        }
        if param.activation_id_short.is_empty() || param.activation_otp.is_empty() {
            tracing::warn!("Session {}: Step 1: Wrong parameters", self.session_identifier());
            return Err(Error::WrongParam);
        }
        let master_public_key = EcPublicKey::from_base64(&self.setup.master_server_public_key)
            .map_err(|_| {
                tracing::warn!(
                    "Session {}: Step 1: Master server public key is invalid",
                    self.session_identifier()
                );
                Error::Encryption
            })?;
        // The activation code signature is optional. When present it proves
        // that the code was really issued by the server.
        if let Some(signature_b64) = &param.activation_signature {
            let signature = BASE64
                .decode(signature_b64)
                .map_err(|_| Error::Encryption)?;
            let signed_code = format!("{}-{}", param.activation_id_short, param.activation_otp);
            master_public_key
                .verify_ecdsa(signed_code.as_bytes(), &signature)
                .map_err(|_| {
                    tracing::warn!(
                        "Session {}: Step 1: Invalid activation code signature",
                        self.session_identifier()
                    );
                    Error::Encryption
                })?;
        }

        let device_key = EcKeyPair::generate();
        let ephemeral_key = EcKeyPair::generate();
        let device_public_key = device_key.public_key_bytes();
        let mut activation_nonce = [0u8; ACTIVATION_NONCE_SIZE];
        activation_nonce.copy_from_slice(&random_bytes(ACTIVATION_NONCE_SIZE));

        // Two encryption layers; the inner key comes from the OTP, the
        // outer from an ephemeral ECDH with the master server key. Both
        // layers reuse the activation nonce as IV.
        let otp_key = expand_otp_key(&param.activation_id_short, &param.activation_otp);
        let inner = aes_cbc_encrypt_padded(&otp_key, &activation_nonce, &device_public_key)?;
        let ephemeral_secret = reduce_shared_secret(&ephemeral_key.ecdh(&master_public_key));
        let c_device_public_key =
            aes_cbc_encrypt_padded(&ephemeral_secret, &activation_nonce, &inner)?;

        let activation_nonce_b64 = BASE64.encode(activation_nonce);
        let c_device_public_key_b64 = BASE64.encode(&c_device_public_key);
        let application_signature = calculate_application_signature(
            &param.activation_id_short,
            &activation_nonce_b64,
            &c_device_public_key_b64,
            &self.setup.application_key,
            &self.setup.application_secret,
        )?;

        let result = ActivationStep1Result {
            activation_nonce: activation_nonce_b64,
            c_device_public_key: c_device_public_key_b64,
            ephemeral_public_key: BASE64.encode(ephemeral_key.public_key_bytes()),
            application_signature,
        };
        self.change_state(SessionState::Activation1(Box::new(ActivationData::new(
            device_key,
            device_public_key,
            otp_key,
        ))));
        Ok(result)
    }

    /// Second activation step: validate and decrypt the server response.
    ///
    /// Any failure after the state check throws the handshake away and
    /// falls back to the empty state.
    pub fn validate_activation_response(
        &mut self,
        param: &ActivationStep2Param,
    ) -> Result<ActivationStep2Result> {
        if !matches!(self.state, SessionState::Activation1(_)) {
            tracing::warn!(
                "Session {}: Step 2: Called in wrong state",
                self.session_identifier()
            );
            return Err(Error::WrongState);
        }
        // A missing parameter is a caller slip, not a protocol failure.
        // The pending activation survives so the caller can retry.
        if param.activation_id.is_empty()
            || param.ephemeral_nonce.is_empty()
            || param.ephemeral_public_key.is_empty()
            || param.encrypted_server_public_key.is_empty()
            || param.server_data_signature.is_empty()
        {
            tracing::warn!(
                "Session {}: Step 2: Missing response parameter",
                self.session_identifier()
            );
            return Err(Error::WrongState);
        }
        let mut ad = match std::mem::replace(&mut self.state, SessionState::Empty) {
            SessionState::Activation1(ad) => ad,
            // Unreachable, the state was just checked.
            other => {
                self.state = other;
                return Err(Error::WrongState);
            }
        };
        match self.process_activation_response(&mut ad, param) {
            Ok(result) => {
                self.change_state(SessionState::Activation2(ad));
                Ok(result)
            }
            Err(err) => {
                tracing::warn!(
                    "Session {}: Step 2: Activation failed, resetting",
                    self.session_identifier()
                );
                Err(err)
            }
        }
    }

    fn process_activation_response(
        &self,
        ad: &mut ActivationData,
        param: &ActivationStep2Param,
    ) -> Result<ActivationStep2Result> {
        // Malformed Base64 in a server response is indistinguishable from a
        // corrupted or forged payload, so all decode failures report as an
        // encryption error.
        let ephemeral_nonce = BASE64
            .decode(&param.ephemeral_nonce)
            .map_err(|_| Error::Encryption)?;
        let c_server_public_key = BASE64
            .decode(&param.encrypted_server_public_key)
            .map_err(|_| Error::Encryption)?;
        let server_data_signature = BASE64
            .decode(&param.server_data_signature)
            .map_err(|_| Error::Encryption)?;

        // The response is authenticated with the master server key over
        // `base64(activation_id) & encrypted_server_public_key`.
        let master_public_key = EcPublicKey::from_base64(&self.setup.master_server_public_key)?;
        let signed_data = format!(
            "{}&{}",
            BASE64.encode(param.activation_id.as_bytes()),
            param.encrypted_server_public_key
        );
        master_public_key.verify_ecdsa(signed_data.as_bytes(), &server_data_signature)?;

        // Strip both encryption layers from the server public key.
        let ephemeral_public_key = EcPublicKey::from_base64(&param.ephemeral_public_key)?;
        let ephemeral_secret =
            reduce_shared_secret(&ad.device_key.ecdh(&ephemeral_public_key));
        let inner = aes_cbc_decrypt_padded(&ephemeral_secret, &ephemeral_nonce, &c_server_public_key)?;
        let server_public_key_data =
            aes_cbc_decrypt_padded(&ad.expanded_otp_key, &ephemeral_nonce, &inner)?;
        let server_public_key = EcPublicKey::from_sec1_bytes(&server_public_key_data)?;

        ad.master_shared_secret = reduce_shared_secret(&ad.device_key.ecdh(&server_public_key));
        ad.server_public_key = server_public_key_data;
        ad.activation_id = param.activation_id.clone();

        Ok(ActivationStep2Result {
            activation_fingerprint: decimalize(&sha256(
                &ad.device_key.public_key().coord_x(),
            )),
        })
    }

    /// Third activation step: derive all factor keys, lock them with the
    /// provided unlock material and commit the activation.
    pub fn complete_activation(&mut self, keys: &SignatureUnlockKeys) -> Result<()> {
        if !matches!(self.state, SessionState::Activation2(_)) {
            tracing::warn!(
                "Session {}: Step 3: Called in wrong state",
                self.session_identifier()
            );
            return Err(Error::WrongState);
        }
        // Unlock material is checked before the handshake data is consumed,
        // so the caller can retry with correct keys.
        if !valid_key_16(&keys.possession_unlock_key)
            || keys.user_password.as_ref().map_or(true, |p| p.is_empty())
            || (keys.biometry_unlock_key.is_some() && !valid_key_16(&keys.biometry_unlock_key))
        {
            tracing::warn!(
                "Session {}: Step 3: Wrong signature protection keys",
                self.session_identifier()
            );
            return Err(Error::WrongParam);
        }
        let ad = match std::mem::replace(&mut self.state, SessionState::Empty) {
            SessionState::Activation2(ad) => ad,
            other => {
                self.state = other;
                return Err(Error::WrongState);
            }
        };
        match self.build_persistent_data(&ad, keys) {
            Ok(pd) => {
                self.change_state(SessionState::Activated(pd));
                Ok(())
            }
            Err(_) => {
                tracing::warn!(
                    "Session {}: Step 3: Activation failed, resetting",
                    self.session_identifier()
                );
                Err(Error::Encryption)
            }
        }
    }

    fn build_persistent_data(
        &self,
        ad: &ActivationData,
        keys: &SignatureUnlockKeys,
    ) -> Result<PersistentData> {
        let eek = self.eek();
        let (plain_keys, vault_key) =
            derive_factor_keys(&ad.master_shared_secret, keys.biometry_unlock_key.is_some())?;
        let password_salt = random_bytes(PBKDF2_SALT_SIZE);
        let locked_keys = lock_signature_keys(
            &plain_keys,
            keys,
            eek.as_ref(),
            &password_salt,
            PBKDF2_PASSWORD_ITERATIONS,
        )?;
        let device_private_key = Zeroizing::new(ad.device_key.private_bytes());
        let c_device_private_key =
            aes_cbc_encrypt_padded(&vault_key, &ZERO_IV, &device_private_key)?;

        let pd = PersistentData {
            signature_counter: 0,
            activation_id: ad.activation_id.clone(),
            password_salt,
            password_iterations: PBKDF2_PASSWORD_ITERATIONS,
            device_public_key: ad.device_public_key.clone(),
            server_public_key: ad.server_public_key.clone(),
            c_device_private_key,
            keys: locked_keys,
            flags: state::PersistentFlags {
                uses_external_key: eek.is_some(),
                waiting_for_vault_unlock: false,
            },
        };
        if !pd.is_valid() {
            return Err(Error::Encryption);
        }
        Ok(pd)
    }

    // ========================================================================
    // SIGNING
    // ========================================================================

    /// Name of the HTTP header carrying the signature.
    pub fn http_auth_header_name(&self) -> &'static str {
        crate::protocol::constants::AUTHORIZATION_HEADER
    }

    /// Compute a multi-factor signature for an HTTP request.
    ///
    /// Advances the signature counter by one, or by two when the factor
    /// mask carries [`SignatureFactor::PREPARE_FOR_VAULT_UNLOCK`].
    pub fn sign_http_request_data(
        &mut self,
        request: &HttpRequestData,
        keys: &SignatureUnlockKeys,
        factor: SignatureFactor,
    ) -> Result<HttpRequestSignature> {
        let session_id = self.session_identifier();
        let eek = self.eek();
        let application_secret = self.setup.application_secret.clone();
        let application_key = self.setup.application_key.clone();
        let pd = match &mut self.state {
            SessionState::Activated(pd) => pd,
            _ => {
                tracing::warn!("Session {}: Sign: There's no valid activation", session_id);
                return Err(Error::WrongState);
            }
        };
        if request.method.is_empty() || request.uri_id.is_empty() {
            tracing::warn!("Session {}: Sign: Wrong request data", session_id);
            return Err(Error::WrongParam);
        }
        let factor_string = factor.to_factor_string().ok_or_else(|| {
            tracing::warn!("Session {}: Sign: Wrong signature factor", session_id);
            Error::WrongParam
        })?;
        let offline = request.offline_nonce.is_some();
        let vault_unlock = factor.contains(SignatureFactor::PREPARE_FOR_VAULT_UNLOCK);
        if vault_unlock && offline {
            tracing::warn!(
                "Session {}: Sign: Vault unlock must not be combined with an offline nonce",
                session_id
            );
            return Err(Error::WrongParam);
        }

        let nonce_b64 = match &request.offline_nonce {
            Some(nonce) => {
                if BASE64.decode(nonce).is_err() {
                    tracing::warn!("Session {}: Sign: Offline nonce is invalid", session_id);
                    return Err(Error::Encryption);
                }
                nonce.clone()
            }
            None => BASE64.encode(random_bytes(SIGNATURE_KEY_SIZE)),
        };

        // Failures while unlocking are indistinguishable from a wrong
        // password on purpose.
        let plain_keys = unlock_signature_keys(
            &pd.keys,
            keys,
            eek.as_ref(),
            pd.flags.uses_external_key,
            &pd.password_salt,
            pd.password_iterations,
            factor,
        )
        .map_err(|_| {
            tracing::warn!("Session {}: Sign: Unable to unlock signature keys", session_id);
            Error::Encryption
        })?;

        let app_secret: &str = if offline { OFFLINE_APP_SECRET } else { &application_secret };
        let data = normalize_data_for_signature(
            &request.method,
            &request.uri_id,
            &nonce_b64,
            &request.body,
            app_secret,
        );
        let mut factor_keys: Vec<[u8; 16]> = Vec::with_capacity(3);
        if factor.contains(SignatureFactor::POSSESSION) {
            factor_keys.push(plain_keys.possession.ok_or(Error::Encryption)?);
        }
        if factor.contains(SignatureFactor::KNOWLEDGE) {
            factor_keys.push(plain_keys.knowledge.ok_or(Error::Encryption)?);
        }
        if factor.contains(SignatureFactor::BIOMETRY) {
            factor_keys.push(plain_keys.biometry.ok_or(Error::Encryption)?);
        }
        let signature = calculate_signature(&factor_keys, pd.signature_counter, &data);

        pd.signature_counter += 1;
        if pd.flags.waiting_for_vault_unlock {
            // The previous vault unlock request apparently got no response.
            tracing::warn!(
                "Session {}: Sign: Session is already waiting for a vault unlock",
                session_id
            );
        }
        if vault_unlock {
            // The extra counter value is reserved for the vault key exchange.
            pd.signature_counter += 1;
            pd.flags.waiting_for_vault_unlock = true;
        } else {
            pd.flags.waiting_for_vault_unlock = false;
        }

        Ok(HttpRequestSignature {
            version: PROTOCOL_VERSION.into(),
            activation_id: pd.activation_id.clone(),
            application_key: if offline {
                OFFLINE_APP_SECRET.into()
            } else {
                application_key
            },
            nonce: nonce_b64,
            factor: factor_string,
            signature,
        })
    }

    /// Verify data signed by the server, either with the master server key
    /// or with this activation's server key.
    pub fn verify_server_signed_data(&self, data: &SignedData) -> Result<()> {
        if !self.has_valid_setup() {
            return Err(Error::WrongState);
        }
        if data.signing_key == SignatureVerifyKey::Server && !self.has_valid_activation() {
            tracing::warn!(
                "Session {}: ServerSig: There's no valid activation",
                self.session_identifier()
            );
            return Err(Error::WrongState);
        }
        if data.signature.is_empty() {
            return Err(Error::WrongParam);
        }
        let public_key = match data.signing_key {
            SignatureVerifyKey::MasterServer => {
                EcPublicKey::from_base64(&self.setup.master_server_public_key)?
            }
            SignatureVerifyKey::Server => match &self.state {
                SessionState::Activated(pd) => EcPublicKey::from_sec1_bytes(&pd.server_public_key)?,
                _ => return Err(Error::WrongState),
            },
        };
        public_key.verify_ecdsa(&data.data, &data.signature)
    }

    /// Normalize a key-value map into the byte string to be signed.
    pub fn prepare_key_value_map_for_data_signing(map: &BTreeMap<String, String>) -> Vec<u8> {
        normalize_key_value_map(map)
    }

    // ========================================================================
    // SIGNATURE KEYS MANAGEMENT
    // ========================================================================

    /// Re-wrap the knowledge key under a new password.
    ///
    /// The old password is not verified locally; the protocol has no way
    /// to distinguish a wrong password from a right one without contacting
    /// the server. Passing a wrong old password silently produces a key
    /// set that no longer signs valid requests.
    pub fn change_user_password(&mut self, old_password: &[u8], new_password: &[u8]) -> Result<()> {
        let session_id = self.session_identifier();
        let eek = self.eek();
        let pd = match &mut self.state {
            SessionState::Activated(pd) => pd,
            _ => {
                tracing::warn!(
                    "Session {}: PasswordChange: There's no valid activation",
                    session_id
                );
                return Err(Error::WrongState);
            }
        };
        if new_password.is_empty() {
            return Err(Error::Encryption);
        }
        let old_keys = SignatureUnlockKeys {
            possession_unlock_key: None,
            user_password: Some(old_password.to_vec()),
            biometry_unlock_key: None,
        };
        let plain = unlock_signature_keys(
            &pd.keys,
            &old_keys,
            eek.as_ref(),
            pd.flags.uses_external_key,
            &pd.password_salt,
            pd.password_iterations,
            SignatureFactor::KNOWLEDGE,
        )
        .map_err(|_| Error::Encryption)?;
        let knowledge = plain.knowledge.ok_or(Error::Encryption)?;

        let new_salt = random_bytes(PBKDF2_SALT_SIZE);
        let eek_for_lock = if pd.flags.uses_external_key { eek } else { None };
        let locked_knowledge = lock_knowledge_key(
            &knowledge,
            new_password,
            &new_salt,
            PBKDF2_PASSWORD_ITERATIONS,
            eek_for_lock.as_ref(),
        )
        .map_err(|_| Error::Encryption)?;

        pd.keys.knowledge = locked_knowledge;
        pd.password_salt = new_salt;
        pd.password_iterations = PBKDF2_PASSWORD_ITERATIONS;
        Ok(())
    }

    /// True when the activation still holds a biometry factor key.
    pub fn has_biometry_factor(&self) -> Result<bool> {
        match &self.state {
            SessionState::Activated(pd) => Ok(pd.keys.biometry.is_some()),
            _ => Err(Error::WrongState),
        }
    }

    /// Remove the biometry factor key. Succeeds even when the key is
    /// already absent.
    pub fn remove_biometry_factor(&mut self) -> Result<()> {
        let session_id = self.session_identifier();
        let pd = match &mut self.state {
            SessionState::Activated(pd) => pd,
            _ => {
                tracing::warn!(
                    "Session {}: RemoveBiometry: There's no valid activation",
                    session_id
                );
                return Err(Error::WrongState);
            }
        };
        if pd.keys.biometry.is_none() {
            tracing::warn!("Session {}: RemoveBiometry: The biometry key is not present", session_id);
        }
        pd.keys.biometry = None;
        pd.flags.waiting_for_vault_unlock = false;
        Ok(())
    }

    /// Re-establish the biometry factor using a vault key obtained from
    /// the server.
    ///
    /// The device private key is recovered from the vault, the whole key
    /// tree is re-derived and cross-checked, and only the biometry key is
    /// locked and stored.
    pub fn add_biometry_factor(
        &mut self,
        c_vault_key: &str,
        keys: &SignatureUnlockKeys,
    ) -> Result<()> {
        let session_id = self.session_identifier();
        if !valid_key_16(&keys.biometry_unlock_key) {
            tracing::warn!(
                "Session {}: AddBiometry: The biometry unlock key is missing",
                session_id
            );
            return Err(Error::WrongParam);
        }
        let vault_key = self.decrypt_vault_key_internal(c_vault_key, keys)?;
        let eek = self.eek();
        let pd = match &mut self.state {
            SessionState::Activated(pd) => pd,
            _ => return Err(Error::WrongState),
        };
        if pd.keys.biometry.is_some() {
            tracing::warn!(
                "Session {}: AddBiometry: There's already an existing biometry key",
                session_id
            );
        }

        let device_private_key = Zeroizing::new(aes_cbc_decrypt_padded(
            &vault_key,
            &ZERO_IV,
            &pd.c_device_private_key,
        )?);
        let device_key = EcKeyPair::from_private_bytes(&device_private_key)?;
        let server_public_key = EcPublicKey::from_sec1_bytes(&pd.server_public_key)?;
        let master_shared_secret = reduce_shared_secret(&device_key.ecdh(&server_public_key));

        let (plain_keys, derived_vault_key) = derive_factor_keys(&master_shared_secret, true)?;
        if derived_vault_key != vault_key {
            // The recovered key tree disagrees with the vault key the
            // server sent; something is badly wrong.
            tracing::warn!(
                "Session {}: AddBiometry: Derived vault key mismatch",
                session_id
            );
            return Err(Error::Encryption);
        }
        let biometry = plain_keys.biometry.ok_or(Error::Encryption)?;
        let biometry_unlock = key_16(&keys.biometry_unlock_key)?;
        let eek_for_lock = if pd.flags.uses_external_key {
            match eek {
                Some(eek) => Some(eek),
                None => return Err(Error::Encryption),
            }
        } else {
            None
        };
        pd.keys.biometry = Some(lock_biometry_key(
            &biometry,
            &biometry_unlock,
            eek_for_lock.as_ref(),
        )?);
        Ok(())
    }

    /// Derive a 16-byte unlock key from arbitrary device-bound data.
    pub fn normalize_signature_unlock_key_from_data(data: &[u8]) -> Vec<u8> {
        sha256(data)[..SIGNATURE_KEY_SIZE].to_vec()
    }

    /// Generate a fresh random 16-byte unlock key.
    pub fn generate_signature_unlock_key() -> Vec<u8> {
        random_bytes(SIGNATURE_KEY_SIZE)
    }

    // ========================================================================
    // STATUS
    // ========================================================================

    /// Decrypt and parse an activation status blob received from the
    /// server.
    pub fn decode_activation_status(
        &self,
        status_blob_b64: &str,
        keys: &SignatureUnlockKeys,
    ) -> Result<ActivationStatus> {
        let session_id = self.session_identifier();
        let eek = self.eek();
        let pd = match &self.state {
            SessionState::Activated(pd) => pd,
            _ => {
                tracing::warn!("Session {}: Status: There's no valid activation", session_id);
                return Err(Error::WrongState);
            }
        };
        if status_blob_b64.is_empty() {
            return Err(Error::WrongParam);
        }
        let plain = unlock_signature_keys(
            &pd.keys,
            keys,
            eek.as_ref(),
            pd.flags.uses_external_key,
            &pd.password_salt,
            pd.password_iterations,
            SignatureFactor::TRANSPORT,
        )
        .map_err(|_| {
            tracing::warn!("Session {}: Status: A valid possession key is required", session_id);
            Error::WrongParam
        })?;
        let transport_key = plain.transport.ok_or(Error::WrongParam)?;

        let encrypted_blob = BASE64
            .decode(status_blob_b64)
            .map_err(|_| Error::Encryption)?;
        if encrypted_blob.len() != STATUS_BLOB_SIZE {
            // Wrong size is treated as an attack on the protocol.
            return Err(Error::Encryption);
        }
        let blob = aes_cbc_decrypt(&transport_key, &ZERO_IV, &encrypted_blob)?;

        let mut reader = DataReader::new(&blob);
        let header = reader.read_raw(4)?;
        if header != STATUS_BLOB_HEADER {
            return Err(Error::Encryption);
        }
        let state_byte = reader.read_u8()?;
        let counter = reader.read_u64()?;
        let fail_count = reader.read_u8()?;
        let max_fail_count = reader.read_u8()?;
        let state = ActivationState::from_byte(state_byte).ok_or(Error::Encryption)?;
        Ok(ActivationStatus {
            state,
            counter,
            fail_count,
            max_fail_count,
        })
    }

    // ========================================================================
    // VAULT
    // ========================================================================

    /// Decrypt the vault key sent by the server and use it to derive an
    /// application-specific key at `key_index`.
    pub fn derive_cryptographic_key_from_vault_key(
        &mut self,
        c_vault_key: &str,
        keys: &SignatureUnlockKeys,
        key_index: u64,
    ) -> Result<[u8; 16]> {
        let vault_key = self.decrypt_vault_key_internal(c_vault_key, keys)?;
        derive_secret_key(&vault_key, key_index)
    }

    /// Decrypt the vault key, recover the device private key and produce a
    /// DER-encoded ECDSA signature over `data`.
    pub fn sign_data_with_device_private_key(
        &mut self,
        c_vault_key: &str,
        keys: &SignatureUnlockKeys,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let vault_key = self.decrypt_vault_key_internal(c_vault_key, keys)?;
        let pd = match &self.state {
            SessionState::Activated(pd) => pd,
            _ => return Err(Error::WrongState),
        };
        let device_private_key = Zeroizing::new(aes_cbc_decrypt_padded(
            &vault_key,
            &ZERO_IV,
            &pd.c_device_private_key,
        )?);
        let device_key = EcKeyPair::from_private_bytes(&device_private_key)?;
        Ok(device_key.sign_ecdsa(data))
    }

    /// Vault key decryption shared by every vault operation.
    ///
    /// Requires a preceding vault-prepare signature; the reserved counter
    /// value keys the decryption. The waiting flag is consumed on entry,
    /// successful or not.
    fn decrypt_vault_key_internal(
        &mut self,
        c_vault_key: &str,
        keys: &SignatureUnlockKeys,
    ) -> Result<[u8; 16]> {
        let session_id = self.session_identifier();
        let eek = self.eek();
        let pd = match &mut self.state {
            SessionState::Activated(pd) => pd,
            _ => {
                tracing::warn!("Session {}: Vault: There's no valid activation", session_id);
                return Err(Error::WrongState);
            }
        };
        if !pd.flags.waiting_for_vault_unlock {
            tracing::warn!(
                "Session {}: Vault: The session is not waiting for a vault unlock",
                session_id
            );
            return Err(Error::WrongState);
        }
        pd.flags.waiting_for_vault_unlock = false;

        if c_vault_key.is_empty() {
            return Err(Error::WrongParam);
        }
        let encrypted_vault_key = match BASE64.decode(c_vault_key) {
            Ok(data) if !data.is_empty() => data,
            // A malformed vault key is treated as an attack.
            _ => return Err(Error::Encryption),
        };
        let plain = unlock_signature_keys(
            &pd.keys,
            keys,
            eek.as_ref(),
            pd.flags.uses_external_key,
            &pd.password_salt,
            pd.password_iterations,
            SignatureFactor::TRANSPORT,
        )
        .map_err(|_| {
            tracing::warn!("Session {}: Vault: A valid possession key is required", session_id);
            Error::WrongParam
        })?;
        let transport_key = plain.transport.ok_or(Error::WrongParam)?;

        // The counter was already advanced twice by the vault-prepare
        // signature; the reserved value is the current counter minus one.
        let reserved_counter = pd
            .signature_counter
            .checked_sub(1)
            .ok_or(Error::Encryption)?;
        let vault_transport_key = derive_secret_key(&transport_key, reserved_counter)?;
        let vault_key = aes_cbc_decrypt_padded(&vault_transport_key, &ZERO_IV, &encrypted_vault_key)?;
        if vault_key.len() != VAULT_KEY_SIZE {
            return Err(Error::Encryption);
        }
        let mut out = [0u8; 16];
        out.copy_from_slice(&vault_key);
        Ok(out)
    }

    // ========================================================================
    // EXTERNAL ENCRYPTION KEY
    // ========================================================================

    /// True when the setup currently carries an EEK.
    pub fn has_external_encryption_key(&self) -> bool {
        self.eek().is_some()
    }

    /// Supply an EEK to a session that expects one but was created
    /// without it. Setting the same key again is a no-op; a different or
    /// malformed key is rejected.
    pub fn set_external_encryption_key(&mut self, eek: &[u8]) -> Result<()> {
        let session_id = self.session_identifier();
        if let Some(current) = self.eek() {
            if current.as_slice() == eek {
                return Ok(());
            }
            tracing::warn!("Session {}: EEK: Setting a different EEK is not allowed", session_id);
            return Err(Error::WrongParam);
        }
        if let SessionState::Activated(pd) = &self.state {
            if !pd.flags.uses_external_key {
                // Accepting an EEK here would make every stored key
                // undecryptable.
                tracing::warn!("Session {}: EEK: Activated session doesn't use an EEK", session_id);
                return Err(Error::WrongState);
            }
        }
        if eek.len() != SIGNATURE_KEY_SIZE {
            tracing::warn!("Session {}: EEK: Wrong size of EEK", session_id);
            return Err(Error::WrongParam);
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(eek);
        self.setup.external_encryption_key = Some(key);
        Ok(())
    }

    /// Add EEK protection to an activated session that does not use one
    /// yet. Re-wraps the stored knowledge and biometry keys in place.
    pub fn add_external_encryption_key(&mut self, eek: &[u8]) -> Result<()> {
        let session_id = self.session_identifier();
        let pd = match &mut self.state {
            SessionState::Activated(pd) => pd,
            _ => {
                tracing::warn!("Session {}: EEK: Session has no valid activation", session_id);
                return Err(Error::WrongState);
            }
        };
        if pd.flags.uses_external_key {
            tracing::warn!("Session {}: EEK: Session is already using an EEK", session_id);
            return Err(Error::WrongState);
        }
        if eek.len() != SIGNATURE_KEY_SIZE {
            tracing::warn!("Session {}: EEK: The provided key has a wrong size", session_id);
            return Err(Error::WrongParam);
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(eek);
        add_eek_layer(&mut pd.keys, &key)?;
        pd.flags.uses_external_key = true;
        self.setup.external_encryption_key = Some(key);
        Ok(())
    }

    /// Remove the EEK protection from an activated session. Requires the
    /// key to be currently known.
    pub fn remove_external_encryption_key(&mut self) -> Result<()> {
        let session_id = self.session_identifier();
        let eek = self.eek();
        let pd = match &mut self.state {
            SessionState::Activated(pd) => pd,
            _ => {
                tracing::warn!("Session {}: EEK: Session has no valid activation", session_id);
                return Err(Error::WrongState);
            }
        };
        if !pd.flags.uses_external_key {
            tracing::warn!("Session {}: EEK: Session is not using an EEK", session_id);
            return Err(Error::WrongState);
        }
        let eek = match eek {
            Some(eek) => eek,
            None => {
                tracing::warn!("Session {}: EEK: The EEK is not set", session_id);
                return Err(Error::WrongState);
            }
        };
        remove_eek_layer(&mut pd.keys, &eek)?;
        pd.flags.uses_external_key = false;
        self.setup.external_encryption_key = None;
        Ok(())
    }

    fn eek(&self) -> Option<[u8; 16]> {
        if self.has_valid_setup() {
            self.setup.external_encryption_key
        } else {
            None
        }
    }

    // ========================================================================
    // END-TO-END ENCRYPTION
    // ========================================================================

    /// Build an encryptor usable before any activation exists.
    ///
    /// The transport key comes from an ephemeral ECDH with the master
    /// server public key; the ephemeral public key travels inside every
    /// envelope.
    pub fn create_nonpersonalized_encryptor(&self, session_index: &[u8]) -> Result<Encryptor> {
        if !self.has_valid_setup() {
            return Err(Error::WrongState);
        }
        let session_index = validate_session_index(session_index)?;
        let master_public_key =
            EcPublicKey::from_base64(&self.setup.master_server_public_key).map_err(|_| {
                tracing::warn!(
                    "Session {}: E2EE-NP: Master server public key is invalid",
                    self.session_identifier()
                );
                Error::Encryption
            })?;
        let ephemeral_key = EcKeyPair::generate();
        let transport_key = reduce_shared_secret(&ephemeral_key.ecdh(&master_public_key));
        Ok(Encryptor::nonpersonalized(
            session_index,
            transport_key,
            BASE64.encode(ephemeral_key.public_key_bytes()),
            self.setup.application_key.clone(),
        ))
    }

    /// Build an encryptor bound to this activation. The transport key is
    /// unlocked with the possession key.
    pub fn create_personalized_encryptor(
        &self,
        session_index: &[u8],
        keys: &SignatureUnlockKeys,
    ) -> Result<Encryptor> {
        let session_id = self.session_identifier();
        let eek = self.eek();
        let pd = match &self.state {
            SessionState::Activated(pd) => pd,
            _ => {
                tracing::warn!("Session {}: E2EE-P: There's no valid activation", session_id);
                return Err(Error::WrongState);
            }
        };
        let session_index = validate_session_index(session_index)?;
        let plain = unlock_signature_keys(
            &pd.keys,
            keys,
            eek.as_ref(),
            pd.flags.uses_external_key,
            &pd.password_salt,
            pd.password_iterations,
            SignatureFactor::TRANSPORT,
        )
        .map_err(|_| {
            tracing::warn!("Session {}: E2EE-P: A valid possession key is required", session_id);
            Error::WrongParam
        })?;
        let transport_key = plain.transport.ok_or(Error::WrongParam)?;
        Ok(Encryptor::personalized(
            session_index,
            transport_key,
            pd.activation_id.clone(),
        ))
    }
}

fn validate_session_index(session_index: &[u8]) -> Result<[u8; 16]> {
    if session_index.len() != SIGNATURE_KEY_SIZE || session_index == ZERO_IV {
        return Err(Error::WrongParam);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(session_index);
    Ok(out)
}

fn valid_key_16(key: &Option<Vec<u8>>) -> bool {
    matches!(key, Some(k) if k.len() == SIGNATURE_KEY_SIZE)
}

fn key_16(key: &Option<Vec<u8>>) -> Result<[u8; 16]> {
    match key {
        Some(k) if k.len() == SIGNATURE_KEY_SIZE => {
            let mut out = [0u8; 16];
            out.copy_from_slice(k);
            Ok(out)
        }
        _ => Err(Error::WrongParam),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_setup() -> SessionSetup {
        SessionSetup {
            application_key: "QVBQX0tFWQ==".into(),
            application_secret: "QVBQX1NFQ1JFVA==".into(),
            master_server_public_key: "bm90LWEtcmVhbC1rZXk=".into(),
            session_identifier: 7,
            external_encryption_key: None,
        }
    }

    #[test]
    fn test_new_session_is_empty() {
        let session = Session::new(sample_setup());
        assert!(session.has_valid_setup());
        assert!(session.can_start_activation());
        assert!(!session.has_pending_activation());
        assert!(!session.has_valid_activation());
        assert_eq!(session.activation_identifier(), None);
        assert_eq!(session.activation_fingerprint(), None);
        assert_eq!(session.session_identifier(), 7);
    }

    #[test]
    fn test_invalid_setup_makes_session_inoperable() {
        let mut setup = sample_setup();
        setup.application_key = String::new();
        let mut session = Session::new(setup);
        assert!(!session.has_valid_setup());
        assert!(!session.can_start_activation());

        let param = ActivationStep1Param {
            activation_id_short: "SHORT".into(),
            activation_otp: "OTP".into(),
            activation_signature: None,
        };
        assert_eq!(session.start_activation(&param).err(), Some(Error::WrongState));
        assert_eq!(session.save_session_state().err(), Some(Error::WrongState));
        assert_eq!(session.load_session_state(&[]).err(), Some(Error::WrongState));

        // Reset does not resurrect a broken setup.
        session.reset_session();
        assert!(!session.has_valid_setup());
    }

    #[test]
    fn test_operations_require_activation() {
        let mut session = Session::new(sample_setup());
        let keys = SignatureUnlockKeys::default();

        let request = HttpRequestData::new("POST", "/pa/test", Vec::new());
        assert_eq!(
            session
                .sign_http_request_data(&request, &keys, SignatureFactor::POSSESSION)
                .err(),
            Some(Error::WrongState)
        );
        assert_eq!(
            session.change_user_password(b"old", b"new").err(),
            Some(Error::WrongState)
        );
        assert_eq!(session.has_biometry_factor().err(), Some(Error::WrongState));
        assert_eq!(session.remove_biometry_factor().err(), Some(Error::WrongState));
        assert_eq!(
            session.decode_activation_status("QUJD", &keys).err(),
            Some(Error::WrongState)
        );
        assert_eq!(
            session
                .derive_cryptographic_key_from_vault_key("QUJD", &keys, 1)
                .err(),
            Some(Error::WrongState)
        );
        assert_eq!(
            session.add_external_encryption_key(&[0u8; 16]).err(),
            Some(Error::WrongState)
        );
        assert_eq!(
            session.remove_external_encryption_key().err(),
            Some(Error::WrongState)
        );
        assert_eq!(
            session.create_personalized_encryptor(&[1u8; 16], &keys).err(),
            Some(Error::WrongState)
        );
    }

    #[test]
    fn test_step2_and_step3_require_preceding_steps() {
        let mut session = Session::new(sample_setup());
        let param = ActivationStep2Param {
            activation_id: "AID".into(),
            ephemeral_nonce: "bm9uY2U=".into(),
            ephemeral_public_key: "cHVi".into(),
            encrypted_server_public_key: "ZW5j".into(),
            server_data_signature: "c2ln".into(),
        };
        assert_eq!(
            session.validate_activation_response(&param).err(),
            Some(Error::WrongState)
        );
        assert_eq!(
            session
                .complete_activation(&SignatureUnlockKeys::default())
                .err(),
            Some(Error::WrongState)
        );
    }

    #[test]
    fn test_start_activation_validates_params() {
        let mut session = Session::new(sample_setup());
        let param = ActivationStep1Param {
            activation_id_short: String::new(),
            activation_otp: "OTP".into(),
            activation_signature: None,
        };
        assert_eq!(session.start_activation(&param).err(), Some(Error::WrongParam));
        // The bogus master key in the sample setup fails on import.
        let param = ActivationStep1Param {
            activation_id_short: "SHORT".into(),
            activation_otp: "OTP".into(),
            activation_signature: None,
        };
        assert_eq!(session.start_activation(&param).err(), Some(Error::Encryption));
        // Failures leave the session ready for another attempt.
        assert!(session.can_start_activation());
    }

    #[test]
    fn test_empty_state_roundtrip_through_blob() {
        let mut session = Session::new(sample_setup());
        let blob = session.save_session_state().unwrap();
        assert!(session.load_session_state(&blob).is_ok());
        assert!(session.can_start_activation());

        // Garbage input resets to empty and reports bad parameters.
        assert_eq!(
            session.load_session_state(b"definitely not a state"),
            Err(Error::WrongParam)
        );
        assert!(session.can_start_activation());
    }

    #[test]
    fn test_set_eek_before_activation() {
        let mut session = Session::new(sample_setup());
        assert!(!session.has_external_encryption_key());
        // Wrong size is rejected.
        assert_eq!(
            session.set_external_encryption_key(&[0, 1, 2, 3]).err(),
            Some(Error::WrongParam)
        );
        let eek = [0xEEu8; 16];
        assert!(session.set_external_encryption_key(&eek).is_ok());
        assert!(session.has_external_encryption_key());
        // Same key again is fine, a different key is not.
        assert!(session.set_external_encryption_key(&eek).is_ok());
        assert_eq!(
            session.set_external_encryption_key(&[0x11u8; 16]).err(),
            Some(Error::WrongParam)
        );
    }

    #[test]
    fn test_nonpersonalized_encryptor_session_index_validation() {
        let session = Session::new(sample_setup());
        assert_eq!(
            session.create_nonpersonalized_encryptor(&[1u8; 8]).err(),
            Some(Error::WrongParam)
        );
        assert_eq!(
            session.create_nonpersonalized_encryptor(&[0u8; 16]).err(),
            Some(Error::WrongParam)
        );
        // A valid index still fails on the bogus master key, but only at
        // the crypto stage.
        assert_eq!(
            session.create_nonpersonalized_encryptor(&[1u8; 16]).err(),
            Some(Error::Encryption)
        );
    }

    #[test]
    fn test_unlock_key_helpers() {
        let key = Session::generate_signature_unlock_key();
        assert_eq!(key.len(), SIGNATURE_KEY_SIZE);
        assert_ne!(key, Session::generate_signature_unlock_key());

        let normalized = Session::normalize_signature_unlock_key_from_data(b"device-serial-42");
        assert_eq!(normalized.len(), SIGNATURE_KEY_SIZE);
        assert_eq!(
            normalized,
            Session::normalize_signature_unlock_key_from_data(b"device-serial-42")
        );
    }

    #[test]
    fn test_key_value_map_normalization() {
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), "2 2".to_string());
        map.insert("a".to_string(), "1".to_string());
        let normalized = Session::prepare_key_value_map_for_data_signing(&map);
        assert_eq!(String::from_utf8(normalized).unwrap(), "a=1&b=2+2");
    }
}
