//! NIST P-256 keypair wrappers.
//!
//! The protocol uses one curve for two jobs: ECDH key agreement during the
//! activation handshake, and ECDSA verification of server-signed data. Both
//! are exposed here through thin wrappers, so the rest of the crate deals in
//! byte slices and never in curve types.
//!
//! Public keys travel as SEC1 encoded points; signatures travel as ASN.1 DER.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};

use crate::error::{Error, Result};

/// A P-256 keypair held by this device.
///
/// The private scalar lives inside [`SecretKey`], which zeroizes itself on
/// drop.
#[derive(Clone)]
pub struct EcKeyPair {
    secret: SecretKey,
}

impl EcKeyPair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Restore a keypair from a 32-byte private scalar.
    pub fn from_private_bytes(bytes: &[u8]) -> Result<Self> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| Error::Encryption)?;
        Ok(Self { secret })
    }

    /// Export the private scalar as 32 bytes.
    ///
    /// The caller owns the copy and should zeroize it when done.
    pub fn private_bytes(&self) -> Vec<u8> {
        self.secret.to_bytes().to_vec()
    }

    /// The public half of this keypair.
    pub fn public_key(&self) -> EcPublicKey {
        EcPublicKey {
            key: self.secret.public_key(),
        }
    }

    /// Export the public key as an uncompressed SEC1 point (65 bytes).
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.secret
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    /// ECDH key agreement with `other`. Returns the 32-byte x-coordinate of
    /// the shared point.
    pub fn ecdh(&self, other: &EcPublicKey) -> [u8; 32] {
        let shared = p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), other.key.as_affine());
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        out
    }

    /// Sign `data` with ECDSA (SHA-256), returning a DER encoded signature.
    pub fn sign_ecdsa(&self, data: &[u8]) -> Vec<u8> {
        let signing_key = SigningKey::from(&self.secret);
        let signature: Signature = signing_key.sign(data);
        signature.to_der().as_bytes().to_vec()
    }
}

/// A P-256 public key belonging to a remote party.
#[derive(Clone)]
pub struct EcPublicKey {
    key: PublicKey,
}

impl EcPublicKey {
    /// Import a public key from SEC1 bytes (compressed or uncompressed).
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self> {
        let key = PublicKey::from_sec1_bytes(bytes).map_err(|_| Error::Encryption)?;
        Ok(Self { key })
    }

    /// Import a public key from a Base64 encoded SEC1 point.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64.decode(encoded).map_err(|_| Error::Encryption)?;
        Self::from_sec1_bytes(&bytes)
    }

    /// Export as an uncompressed SEC1 point (65 bytes).
    pub fn to_sec1_bytes(&self) -> Vec<u8> {
        self.key.to_encoded_point(false).as_bytes().to_vec()
    }

    /// The 32-byte affine x-coordinate, used for the activation fingerprint.
    pub fn coord_x(&self) -> [u8; 32] {
        let point = self.key.to_encoded_point(false);
        let mut out = [0u8; 32];
        // An uncompressed point always carries x; fall back to zero never
        // happens for a validly constructed key.
        if let Some(x) = point.x() {
            out.copy_from_slice(x.as_slice());
        }
        out
    }

    /// Verify a DER-encoded ECDSA signature over `data`.
    pub fn verify_ecdsa(&self, data: &[u8], signature_der: &[u8]) -> Result<()> {
        let signature = Signature::from_der(signature_der).map_err(|_| Error::Encryption)?;
        let verifying_key = VerifyingKey::from(&self.key);
        verifying_key
            .verify(data, &signature)
            .map_err(|_| Error::Encryption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_roundtrip_through_bytes() {
        let pair = EcKeyPair::generate();
        let restored = EcKeyPair::from_private_bytes(&pair.private_bytes()).unwrap();
        assert_eq!(pair.public_key_bytes(), restored.public_key_bytes());
    }

    #[test]
    fn test_public_key_roundtrip_through_sec1() {
        let pair = EcKeyPair::generate();
        let public = EcPublicKey::from_sec1_bytes(&pair.public_key_bytes()).unwrap();
        assert_eq!(public.to_sec1_bytes(), pair.public_key_bytes());
        assert_eq!(public.coord_x(), pair.public_key().coord_x());
    }

    #[test]
    fn test_ecdh_agreement_is_symmetric() {
        let alice = EcKeyPair::generate();
        let bob = EcKeyPair::generate();
        let shared_a = alice.ecdh(&bob.public_key());
        let shared_b = bob.ecdh(&alice.public_key());
        assert_eq!(shared_a, shared_b);

        let eve = EcKeyPair::generate();
        assert_ne!(alice.ecdh(&eve.public_key()), shared_a);
    }

    #[test]
    fn test_ecdsa_sign_and_verify() {
        let pair = EcKeyPair::generate();
        let signature = pair.sign_ecdsa(b"signed payload");
        let public = pair.public_key();
        assert!(public.verify_ecdsa(b"signed payload", &signature).is_ok());
        assert!(public.verify_ecdsa(b"other payload", &signature).is_err());
        assert!(public.verify_ecdsa(b"signed payload", b"not a signature").is_err());
    }

    #[test]
    fn test_invalid_inputs_are_rejected() {
        assert!(EcKeyPair::from_private_bytes(&[0u8; 32]).is_err());
        assert!(EcPublicKey::from_sec1_bytes(&[0x04, 0x01, 0x02]).is_err());
        assert!(EcPublicKey::from_base64("not-base64!!").is_err());
    }
}
