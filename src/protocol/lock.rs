//! Locking and unlocking of the signature key set.
//!
//! Factor keys are never persisted in plaintext. Each key is wrapped with
//! AES-128-CBC (zero IV, no padding), so a locked key stays exactly 16
//! bytes, under a factor-specific protection key:
//!
//! ```text
//!   possession  = wrap(possession_unlock_key, K_possession)
//!   transport   = wrap(possession_unlock_key, K_transport)
//!   knowledge   = wrap(EEK?, wrap(pbkdf2(password, salt), K_knowledge))
//!   biometry    = wrap(EEK?, wrap(biometry_unlock_key, K_biometry))
//! ```
//!
//! The optional external encryption key (EEK) forms the *outermost* layer of
//! the knowledge and biometry keys. That ordering is what allows adding or
//! removing the EEK later without knowing the user's password, and keeps
//! possession-only operations working while the EEK is not yet provided.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{aes_cbc_decrypt, aes_cbc_encrypt, ZERO_IV};
use crate::error::{Error, Result};
use crate::protocol::constants::{
    KEY_INDEX_BIOMETRY, KEY_INDEX_KNOWLEDGE, KEY_INDEX_POSSESSION, KEY_INDEX_TRANSPORT,
    KEY_INDEX_VAULT, SIGNATURE_KEY_SIZE,
};
use crate::protocol::kdf::{derive_password_key, derive_secret_key};
use crate::protocol::signature::SignatureFactor;
use crate::session::types::SignatureUnlockKeys;

// ============================================================================
// KEY CONTAINERS
// ============================================================================

/// Unlocked factor keys. Only the requested factors are populated.
///
/// Zeroized on drop; instances should live only for the duration of one
/// cryptographic operation.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct PlainSignatureKeys {
    /// Possession factor key.
    pub possession: Option<[u8; 16]>,
    /// Knowledge factor key.
    pub knowledge: Option<[u8; 16]>,
    /// Biometry factor key.
    pub biometry: Option<[u8; 16]>,
    /// Transport key for vault and status operations.
    pub transport: Option<[u8; 16]>,
}

/// The persisted, always-encrypted form of the signature key set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockedSignatureKeys {
    /// Possession key wrapped with the possession unlock key.
    pub possession: Vec<u8>,
    /// Knowledge key wrapped with the derived password key (and EEK).
    pub knowledge: Vec<u8>,
    /// Biometry key wrapped with the biometry unlock key (and EEK),
    /// or `None` when the activation has no biometry factor.
    pub biometry: Option<Vec<u8>>,
    /// Transport key wrapped with the possession unlock key.
    pub transport: Vec<u8>,
}

impl LockedSignatureKeys {
    /// Basic structural validation of deserialized key material.
    pub fn is_valid(&self) -> bool {
        let ok_len = |k: &Vec<u8>| k.len() == SIGNATURE_KEY_SIZE;
        ok_len(&self.possession)
            && ok_len(&self.knowledge)
            && ok_len(&self.transport)
            && self.biometry.as_ref().map_or(true, ok_len)
    }
}

/// Derive the full factor key set and the vault key from the master secret.
pub fn derive_factor_keys(master: &[u8; 16], with_biometry: bool) -> Result<(PlainSignatureKeys, [u8; 16])> {
    let keys = PlainSignatureKeys {
        possession: Some(derive_secret_key(master, KEY_INDEX_POSSESSION)?),
        knowledge: Some(derive_secret_key(master, KEY_INDEX_KNOWLEDGE)?),
        biometry: if with_biometry {
            Some(derive_secret_key(master, KEY_INDEX_BIOMETRY)?)
        } else {
            None
        },
        transport: Some(derive_secret_key(master, KEY_INDEX_TRANSPORT)?),
    };
    let vault_key = derive_secret_key(master, KEY_INDEX_VAULT)?;
    Ok((keys, vault_key))
}

// ============================================================================
// WRAP HELPERS
// ============================================================================

fn wrap(key: &[u8; 16], plain: &[u8; 16]) -> Result<Vec<u8>> {
    aes_cbc_encrypt(key, &ZERO_IV, plain)
}

fn unwrap_key(key: &[u8; 16], locked: &[u8]) -> Result<[u8; 16]> {
    if locked.len() != SIGNATURE_KEY_SIZE {
        return Err(Error::Encryption);
    }
    let plain = aes_cbc_decrypt(key, &ZERO_IV, locked)?;
    let mut out = [0u8; 16];
    out.copy_from_slice(&plain);
    Ok(out)
}

fn unlock_key_16(bytes: &Option<Vec<u8>>) -> Result<[u8; 16]> {
    match bytes {
        Some(k) if k.len() == SIGNATURE_KEY_SIZE => {
            let mut out = [0u8; 16];
            out.copy_from_slice(k);
            Ok(out)
        }
        _ => Err(Error::WrongParam),
    }
}

// ============================================================================
// LOCK / UNLOCK
// ============================================================================

/// Lock a freshly derived key set for persistence.
///
/// Requires the possession unlock key and the user password; the biometry
/// unlock key is required exactly when `plain` carries a biometry key.
/// When `eek` is provided it becomes the outermost layer of the knowledge
/// and biometry keys.
pub fn lock_signature_keys(
    plain: &PlainSignatureKeys,
    keys: &SignatureUnlockKeys,
    eek: Option<&[u8; 16]>,
    password_salt: &[u8],
    password_iterations: u32,
) -> Result<LockedSignatureKeys> {
    let possession = plain.possession.ok_or(Error::Encryption)?;
    let knowledge = plain.knowledge.ok_or(Error::Encryption)?;
    let transport = plain.transport.ok_or(Error::Encryption)?;

    let possession_unlock = unlock_key_16(&keys.possession_unlock_key)?;
    let password = match &keys.user_password {
        Some(p) if !p.is_empty() => p.as_slice(),
        _ => return Err(Error::WrongParam),
    };
    let password_key = derive_password_key(password, password_salt, password_iterations);

    let mut locked_knowledge = wrap(&password_key, &knowledge)?;
    if let Some(eek) = eek {
        locked_knowledge = wrap_vec(eek, &locked_knowledge)?;
    }

    let locked_biometry = match plain.biometry {
        Some(biometry) => {
            let biometry_unlock = unlock_key_16(&keys.biometry_unlock_key)?;
            let mut locked = wrap(&biometry_unlock, &biometry)?;
            if let Some(eek) = eek {
                locked = wrap_vec(eek, &locked)?;
            }
            Some(locked)
        }
        None => None,
    };

    Ok(LockedSignatureKeys {
        possession: wrap(&possession_unlock, &possession)?,
        knowledge: locked_knowledge,
        biometry: locked_biometry,
        transport: wrap(&possession_unlock, &transport)?,
    })
}

/// Unlock the factors selected in `factors` from the persisted key set.
///
/// Missing caller-provided unlock material is reported as
/// [`Error::WrongParam`]; everything that goes wrong inside the
/// cryptography, including a required but absent EEK, is
/// [`Error::Encryption`].
pub fn unlock_signature_keys(
    locked: &LockedSignatureKeys,
    keys: &SignatureUnlockKeys,
    eek: Option<&[u8; 16]>,
    uses_eek: bool,
    password_salt: &[u8],
    password_iterations: u32,
    factors: SignatureFactor,
) -> Result<PlainSignatureKeys> {
    let mut out = PlainSignatureKeys::default();

    if factors.contains(SignatureFactor::POSSESSION) || factors.contains(SignatureFactor::TRANSPORT)
    {
        let possession_unlock = unlock_key_16(&keys.possession_unlock_key)?;
        if factors.contains(SignatureFactor::POSSESSION) {
            out.possession = Some(unwrap_key(&possession_unlock, &locked.possession)?);
        }
        if factors.contains(SignatureFactor::TRANSPORT) {
            out.transport = Some(unwrap_key(&possession_unlock, &locked.transport)?);
        }
    }

    if factors.contains(SignatureFactor::KNOWLEDGE) {
        let password = match &keys.user_password {
            Some(p) if !p.is_empty() => p.as_slice(),
            _ => return Err(Error::WrongParam),
        };
        let password_key = derive_password_key(password, password_salt, password_iterations);
        let inner = strip_eek_layer(&locked.knowledge, eek, uses_eek)?;
        out.knowledge = Some(unwrap_key(&password_key, &inner)?);
    }

    if factors.contains(SignatureFactor::BIOMETRY) {
        let biometry_unlock = unlock_key_16(&keys.biometry_unlock_key)?;
        let stored = locked.biometry.as_ref().ok_or(Error::Encryption)?;
        let inner = strip_eek_layer(stored, eek, uses_eek)?;
        out.biometry = Some(unwrap_key(&biometry_unlock, &inner)?);
    }

    Ok(out)
}

/// Re-lock the knowledge key under a new password-derived key.
pub fn lock_knowledge_key(
    knowledge: &[u8; 16],
    password: &[u8],
    password_salt: &[u8],
    password_iterations: u32,
    eek: Option<&[u8; 16]>,
) -> Result<Vec<u8>> {
    let password_key = derive_password_key(password, password_salt, password_iterations);
    let mut locked = wrap(&password_key, knowledge)?;
    if let Some(eek) = eek {
        locked = wrap_vec(eek, &locked)?;
    }
    Ok(locked)
}

/// Lock a biometry key with the biometry unlock key (and EEK, when in use).
pub fn lock_biometry_key(
    biometry: &[u8; 16],
    biometry_unlock_key: &[u8; 16],
    eek: Option<&[u8; 16]>,
) -> Result<Vec<u8>> {
    let mut locked = wrap(biometry_unlock_key, biometry)?;
    if let Some(eek) = eek {
        locked = wrap_vec(eek, &locked)?;
    }
    Ok(locked)
}

/// Wrap the knowledge and biometry keys with a new outermost EEK layer.
///
/// Works directly on the locked forms, so neither the password nor the
/// biometry unlock key is needed.
pub fn add_eek_layer(locked: &mut LockedSignatureKeys, eek: &[u8; 16]) -> Result<()> {
    let knowledge = wrap_vec(eek, &locked.knowledge)?;
    let biometry = match &locked.biometry {
        Some(b) => Some(wrap_vec(eek, b)?),
        None => None,
    };
    locked.knowledge = knowledge;
    locked.biometry = biometry;
    Ok(())
}

/// Remove the outermost EEK layer from the knowledge and biometry keys.
pub fn remove_eek_layer(locked: &mut LockedSignatureKeys, eek: &[u8; 16]) -> Result<()> {
    let knowledge = unwrap_vec(eek, &locked.knowledge)?;
    let biometry = match &locked.biometry {
        Some(b) => Some(unwrap_vec(eek, b)?),
        None => None,
    };
    locked.knowledge = knowledge;
    locked.biometry = biometry;
    Ok(())
}

fn wrap_vec(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
    aes_cbc_encrypt(key, &ZERO_IV, data)
}

fn unwrap_vec(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
    aes_cbc_decrypt(key, &ZERO_IV, data)
}

fn strip_eek_layer(stored: &[u8], eek: Option<&[u8; 16]>, uses_eek: bool) -> Result<Vec<u8>> {
    if !uses_eek {
        return Ok(stored.to_vec());
    }
    match eek {
        Some(eek) => unwrap_vec(eek, stored),
        None => Err(Error::Encryption),
    }
}
