//! Multi-factor signature computation and data normalization.
//!
//! A request signature is an HOTP-style decimalized code with one component
//! per unlocked factor key. The components are chained, so a valid knowledge
//! component cannot be produced without also holding the possession key:
//!
//! ```text
//!   ctr_data   = 8 zero bytes ‖ counter (u64 BE)
//!   derived[i] = HMAC(ctr_data, key[i]) folded with all earlier factors
//!   component  = decimalize(HMAC(normalized_data, derived[i]))
//!   signature  = component[0] "-" component[1] "-" ...
//! ```

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::ops::BitOr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::crypto::hmac_sha256;
use crate::error::{Error, Result};

// ============================================================================
// SIGNATURE FACTORS
// ============================================================================

/// Bitmask of signature factors requested for an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignatureFactor(u32);

impl SignatureFactor {
    /// Possession factor (device-bound key).
    pub const POSSESSION: SignatureFactor = SignatureFactor(0x0001);
    /// Knowledge factor (password-protected key).
    pub const KNOWLEDGE: SignatureFactor = SignatureFactor(0x0010);
    /// Biometry factor (biometry-protected key).
    pub const BIOMETRY: SignatureFactor = SignatureFactor(0x0100);
    /// Transport key, used internally for vault and status operations.
    pub const TRANSPORT: SignatureFactor = SignatureFactor(0x1000);
    /// Modifier: advance the counter twice to reserve a vault unlock.
    pub const PREPARE_FOR_VAULT_UNLOCK: SignatureFactor = SignatureFactor(0x2000);

    /// Possession and knowledge combined.
    pub const POSSESSION_KNOWLEDGE: SignatureFactor = SignatureFactor(0x0011);
    /// Possession and biometry combined.
    pub const POSSESSION_BIOMETRY: SignatureFactor = SignatureFactor(0x0101);
    /// All three factors combined.
    pub const POSSESSION_KNOWLEDGE_BIOMETRY: SignatureFactor = SignatureFactor(0x0111);

    /// True when every factor in `other` is present in `self`.
    pub fn contains(self, other: SignatureFactor) -> bool {
        self.0 & other.0 == other.0
    }

    /// Strip modifier bits, keeping only the signature factors.
    pub fn factors_only(self) -> SignatureFactor {
        SignatureFactor(self.0 & 0x0111)
    }

    /// Canonical string for the signature header, e.g.
    /// `possession_knowledge`. Returns `None` when no factor bit is set.
    pub fn to_factor_string(self) -> Option<String> {
        let mut parts: Vec<&str> = Vec::with_capacity(3);
        if self.contains(SignatureFactor::POSSESSION) {
            parts.push("possession");
        }
        if self.contains(SignatureFactor::KNOWLEDGE) {
            parts.push("knowledge");
        }
        if self.contains(SignatureFactor::BIOMETRY) {
            parts.push("biometry");
        }
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("_"))
    }
}

impl BitOr for SignatureFactor {
    type Output = SignatureFactor;

    fn bitor(self, rhs: SignatureFactor) -> SignatureFactor {
        SignatureFactor(self.0 | rhs.0)
    }
}

// ============================================================================
// DATA NORMALIZATION
// ============================================================================

/// Build the canonical byte string signed by a request signature.
///
/// `METHOD&base64(uri_id)&nonce&base64(body)&app_secret`
pub fn normalize_data_for_signature(
    method: &str,
    uri_id: &str,
    nonce_b64: &str,
    body: &[u8],
    application_secret: &str,
) -> Vec<u8> {
    let mut out = String::new();
    // Infallible writes into a String.
    let _ = write!(
        out,
        "{}&{}&{}&{}&{}",
        method,
        BASE64.encode(uri_id.as_bytes()),
        nonce_b64,
        BASE64.encode(body),
        application_secret
    );
    out.into_bytes()
}

/// Normalize a key-value map into a deterministic byte string suitable for
/// signing. Keys are sorted, keys and values are form-urlencoded, pairs are
/// joined with `&`.
pub fn normalize_key_value_map(map: &BTreeMap<String, String>) -> Vec<u8> {
    let mut out = String::new();
    for (i, (key, value)) in map.iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        out.push_str(&form_url_encode(key));
        out.push('=');
        out.push_str(&form_url_encode(value));
    }
    out.into_bytes()
}

/// Form-style URL encoding: space becomes `+`, unreserved characters
/// (`A-Z a-z 0-9 . * _ -`) pass through, everything else is percent-encoded.
fn form_url_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b' ' => out.push('+'),
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'*' | b'_' | b'-' => {
                out.push(byte as char)
            }
            _ => {
                let _ = write!(out, "%{:02X}", byte);
            }
        }
    }
    out
}

// ============================================================================
// SIGNATURE COMPUTATION
// ============================================================================

/// Counter block mixed into each factor key derivation.
pub fn counter_data(counter: u64) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[8..].copy_from_slice(&counter.to_be_bytes());
    out
}

/// Compute the decimalized multi-factor signature over normalized `data`.
///
/// `keys` are the unlocked factor keys in possession, knowledge, biometry
/// order; only the requested factors are present.
pub fn calculate_signature(keys: &[[u8; 16]], counter: u64, data: &[u8]) -> String {
    let ctr_data = counter_data(counter);
    let mut components: Vec<String> = Vec::with_capacity(keys.len());
    for i in 0..keys.len() {
        let mut derived = hmac_sha256(&ctr_data, &keys[i]);
        // Chain in every earlier factor so components cannot be forged
        // independently.
        for j in 0..i {
            let inner = hmac_sha256(&ctr_data, &keys[j + 1]);
            derived = hmac_sha256(&derived, &inner);
        }
        let component_mac = hmac_sha256(data, &derived);
        components.push(decimalize(&component_mac));
    }
    components.join("-")
}

/// Reduce a MAC or digest to a fixed number of decimal digits.
///
/// Takes the last four bytes, masks the sign bit and reduces modulo 10^8,
/// the same dynamic truncation HOTP uses.
pub fn decimalize(mac: &[u8]) -> String {
    let off = mac.len() - 4;
    let dbc = ((u32::from(mac[off]) & 0x7F) << 24)
        | (u32::from(mac[off + 1]) << 16)
        | (u32::from(mac[off + 2]) << 8)
        | u32::from(mac[off + 3]);
    format!("{:08}", dbc % 100_000_000)
}

/// Compute the application signature sent in the first activation request.
///
/// HMAC-SHA256 over `short_id&nonce&c_device_public_key&app_key`, keyed by
/// the decoded application secret.
pub fn calculate_application_signature(
    activation_id_short: &str,
    activation_nonce_b64: &str,
    c_device_public_key_b64: &str,
    application_key: &str,
    application_secret: &str,
) -> Result<String> {
    let secret = BASE64
        .decode(application_secret)
        .map_err(|_| Error::Encryption)?;
    let data = format!(
        "{}&{}&{}&{}",
        activation_id_short, activation_nonce_b64, c_device_public_key_b64, application_key
    );
    let mac = hmac_sha256(data.as_bytes(), &secret);
    Ok(BASE64.encode(mac))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::SIGNATURE_DECIMAL_DIGITS;

    #[test]
    fn test_factor_strings() {
        assert_eq!(
            SignatureFactor::POSSESSION.to_factor_string().as_deref(),
            Some("possession")
        );
        assert_eq!(
            SignatureFactor::POSSESSION_KNOWLEDGE
                .to_factor_string()
                .as_deref(),
            Some("possession_knowledge")
        );
        assert_eq!(
            SignatureFactor::POSSESSION_KNOWLEDGE_BIOMETRY
                .to_factor_string()
                .as_deref(),
            Some("possession_knowledge_biometry")
        );
        // Modifier bits alone carry no factor.
        assert_eq!(
            SignatureFactor::PREPARE_FOR_VAULT_UNLOCK.to_factor_string(),
            None
        );
    }

    #[test]
    fn test_factor_bit_operations() {
        let combined = SignatureFactor::POSSESSION | SignatureFactor::KNOWLEDGE;
        assert_eq!(combined, SignatureFactor::POSSESSION_KNOWLEDGE);
        assert!(combined.contains(SignatureFactor::POSSESSION));
        assert!(!combined.contains(SignatureFactor::BIOMETRY));
        let with_vault = combined | SignatureFactor::PREPARE_FOR_VAULT_UNLOCK;
        assert_eq!(with_vault.factors_only(), combined);
    }

    #[test]
    fn test_normalize_data_for_signature() {
        let data = normalize_data_for_signature("POST", "/pa/token", "bm9uY2U=", b"{}", "SECRET");
        let text = String::from_utf8(data).unwrap();
        let parts: Vec<&str> = text.split('&').collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0], "POST");
        assert_eq!(parts[1], BASE64.encode(b"/pa/token"));
        assert_eq!(parts[2], "bm9uY2U=");
        assert_eq!(parts[3], BASE64.encode(b"{}"));
        assert_eq!(parts[4], "SECRET");
    }

    #[test]
    fn test_empty_body_normalizes_to_empty_component() {
        let data = normalize_data_for_signature("GET", "/pa/x", "n", b"", "S");
        let text = String::from_utf8(data).unwrap();
        assert!(text.contains("&n&&S"));
    }

    #[test]
    fn test_normalize_key_value_map() {
        let mut map = BTreeMap::new();
        map.insert("zingly".to_string(), "is da best".to_string());
        map.insert("420".to_string(), "is equal to 10*42".to_string());
        map.insert("hello".to_string(), "world".to_string());
        map.insert("hell0".to_string(), "w0rld".to_string());
        let normalized = normalize_key_value_map(&map);
        assert_eq!(
            String::from_utf8(normalized).unwrap(),
            "420=is+equal+to+10*42&hell0=w0rld&hello=world&zingly=is+da+best"
        );
    }

    #[test]
    fn test_form_url_encode_escapes_reserved_bytes() {
        assert_eq!(form_url_encode("a b"), "a+b");
        assert_eq!(form_url_encode("key=value&x"), "key%3Dvalue%26x");
        assert_eq!(form_url_encode("A-Z.a_z*9"), "A-Z.a_z*9");
        assert_eq!(form_url_encode("č"), "%C4%8D");
    }

    #[test]
    fn test_decimalize_masks_sign_bit() {
        let mut mac = [0u8; 32];
        mac[28..].copy_from_slice(&[0xFF, 0x00, 0x00, 0x00]);
        // 0x7F000000 % 10^8 == 30706432
        assert_eq!(decimalize(&mac), "30706432");
    }

    #[test]
    fn test_decimalize_pads_to_eight_digits() {
        let mac = [0u8; 32];
        assert_eq!(decimalize(&mac), "00000000");
    }

    #[test]
    fn test_signature_component_count_matches_keys() {
        let keys = [[1u8; 16], [2u8; 16], [3u8; 16]];
        let sig = calculate_signature(&keys, 7, b"data");
        let parts: Vec<&str> = sig.split('-').collect();
        assert_eq!(parts.len(), 3);
        for part in &parts {
            assert_eq!(part.len(), SIGNATURE_DECIMAL_DIGITS);
            assert!(part.chars().all(|c| c.is_ascii_digit()));
        }
        // First component is independent of later factor keys.
        let sig1 = calculate_signature(&keys[..1], 7, b"data");
        assert_eq!(sig1, parts[0]);
    }

    #[test]
    fn test_signature_changes_with_counter_and_data() {
        let keys = [[9u8; 16]];
        let a = calculate_signature(&keys, 1, b"data");
        let b = calculate_signature(&keys, 2, b"data");
        let c = calculate_signature(&keys, 1, b"tada");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, calculate_signature(&keys, 1, b"data"));
    }

    #[test]
    fn test_application_signature_requires_decodable_secret() {
        let ok = calculate_application_signature("SHORT", "bm9uY2U=", "cHVi", "APPKEY", "c2VjcmV0");
        assert!(ok.is_ok());
        let bad = calculate_application_signature("SHORT", "bm9uY2U=", "cHVi", "APPKEY", "!!!");
        assert!(bad.is_err());
    }
}
