//! Mandate signing and verification.
//!
//! Two algorithms are supported and the `algorithm` field is authoritative:
//!
//! | Algorithm | Use |
//! |-----------|-----|
//! | `ECDSA-P256-SHA256` | user/merchant mandate signatures, JWT interop |
//! | `Ed25519` | A2A envelope signatures |
//!
//! Anything else is rejected, never defaulted. A signature is computed over
//! the JCS canonical bytes of the signed object with every
//! signature-carrying field removed first (see [`super::jcs::canonical_bytes`]).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use ed25519_dalek::pkcs8::DecodePublicKey as _;
use ed25519_dalek::{Signer as _, Verifier as _};
use p256::ecdsa::signature::{Signer as _, Verifier as _};
use p256::pkcs8::DecodePublicKey as _;
use serde::{Deserialize, Serialize};

use super::jcs;
use super::keys::AgentKeys;

/// Cryptographic failure modes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CryptoError {
    #[error("canonicalization failed: {reason}")]
    CanonicalizationFailed { reason: String },

    #[error("unknown signature algorithm: {algorithm}")]
    UnknownAlgorithm { algorithm: String },

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("public key could not be resolved: {key_ref}")]
    PublicKeyResolutionFailed { key_ref: String },

    #[error("malformed key material: {reason}")]
    MalformedKey { reason: String },

    #[error("malformed signature: {reason}")]
    MalformedSignature { reason: String },

    #[error("device attestation is stale: {age_seconds}s old")]
    AttestationStale { age_seconds: i64 },

    #[error("key file error at {path}: {reason}")]
    KeyFile { path: String, reason: String },

    #[error("wrong passphrase or corrupted key file: {path}")]
    BadPassphrase { path: String },
}

/// Supported signature algorithms. The wire spelling is exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    #[serde(rename = "ECDSA-P256-SHA256")]
    EcdsaP256Sha256,
    #[serde(rename = "Ed25519")]
    Ed25519,
}

impl SignatureAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EcdsaP256Sha256 => "ECDSA-P256-SHA256",
            Self::Ed25519 => "Ed25519",
        }
    }

    /// Parse the wire spelling, rejecting anything unknown.
    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        match s {
            "ECDSA-P256-SHA256" => Ok(Self::EcdsaP256Sha256),
            "Ed25519" => Ok(Self::Ed25519),
            other => Err(CryptoError::UnknownAlgorithm {
                algorithm: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detached signature over a mandate or envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    /// Signing algorithm; authoritative for verification.
    pub algorithm: SignatureAlgorithm,

    /// Base64 signature bytes: standard alphabet for mandate signatures,
    /// unpadded url-safe for A2A envelope signatures.
    pub value: String,

    /// Key reference: base64(SPKI PEM), or `<DID>#<fragment>` for keys
    /// resolved through a DID document.
    pub public_key: String,

    /// When the signature was produced (metadata only, not covered).
    pub signed_at: DateTime<Utc>,
}

/// Resolves a `Signature::public_key` reference to a PEM.
///
/// Returning `None` is a hard verification failure for the caller - a key
/// that cannot be resolved is never "trusted by default".
pub trait PublicKeyResolver {
    fn resolve_pem(&self, key_ref: &str) -> Option<String>;
}

/// Resolver for signatures that embed their key as base64(SPKI PEM).
///
/// DID-fragment references (`did:...#key-1`) are not resolvable here; the
/// A2A layer supplies a DID-backed resolver for those.
pub struct InlinePublicKeyResolver;

impl PublicKeyResolver for InlinePublicKeyResolver {
    fn resolve_pem(&self, key_ref: &str) -> Option<String> {
        if key_ref.contains('#') {
            return None;
        }
        let bytes = BASE64.decode(key_ref).ok()?;
        String::from_utf8(bytes).ok()
    }
}

/// Sign raw bytes with the key pair matching `algorithm`.
pub fn raw_sign(
    bytes: &[u8],
    keys: &AgentKeys,
    algorithm: SignatureAlgorithm,
) -> Result<Vec<u8>, CryptoError> {
    match algorithm {
        SignatureAlgorithm::EcdsaP256Sha256 => {
            let sig: p256::ecdsa::Signature = keys.ecdsa.sign(bytes);
            Ok(sig.to_bytes().to_vec())
        }
        SignatureAlgorithm::Ed25519 => Ok(keys.ed25519.sign(bytes).to_bytes().to_vec()),
    }
}

/// Verify raw bytes against a signature and an SPKI PEM public key.
pub fn raw_verify(
    bytes: &[u8],
    signature: &[u8],
    public_key_pem: &str,
    algorithm: SignatureAlgorithm,
) -> Result<(), CryptoError> {
    match algorithm {
        SignatureAlgorithm::EcdsaP256Sha256 => {
            let key = p256::ecdsa::VerifyingKey::from_public_key_pem(public_key_pem).map_err(
                |e| CryptoError::MalformedKey {
                    reason: e.to_string(),
                },
            )?;
            let sig = p256::ecdsa::Signature::from_slice(signature).map_err(|e| {
                CryptoError::MalformedSignature {
                    reason: e.to_string(),
                }
            })?;
            key.verify(bytes, &sig)
                .map_err(|_| CryptoError::InvalidSignature)
        }
        SignatureAlgorithm::Ed25519 => {
            let key = ed25519_dalek::VerifyingKey::from_public_key_pem(public_key_pem).map_err(
                |e| CryptoError::MalformedKey {
                    reason: e.to_string(),
                },
            )?;
            let sig = ed25519_dalek::Signature::from_slice(signature).map_err(|e| {
                CryptoError::MalformedSignature {
                    reason: e.to_string(),
                }
            })?;
            key.verify(bytes, &sig)
                .map_err(|_| CryptoError::InvalidSignature)
        }
    }
}

/// Sign a payload, embedding the signer's key as base64(SPKI PEM).
///
/// `exclude` lists the dotted field paths stripped before canonicalization;
/// callers pass the signed type's signature-carrying fields.
pub fn sign_payload<T: Serialize>(
    value: &T,
    exclude: &[&str],
    keys: &AgentKeys,
    algorithm: SignatureAlgorithm,
) -> Result<Signature, CryptoError> {
    let key_ref = BASE64.encode(keys.public_key_pem(algorithm)?);
    sign_payload_as(value, exclude, keys, algorithm, key_ref)
}

/// Sign a payload with a caller-supplied key reference (e.g. a DID kid).
pub fn sign_payload_as<T: Serialize>(
    value: &T,
    exclude: &[&str],
    keys: &AgentKeys,
    algorithm: SignatureAlgorithm,
    public_key_ref: String,
) -> Result<Signature, CryptoError> {
    let bytes = jcs::canonical_bytes(value, exclude)?;
    let sig = raw_sign(&bytes, keys, algorithm)?;
    Ok(Signature {
        algorithm,
        value: BASE64.encode(sig),
        public_key: public_key_ref,
        signed_at: Utc::now(),
    })
}

/// Verify a payload signature, resolving the key through `resolver`.
pub fn verify_payload<T: Serialize>(
    value: &T,
    exclude: &[&str],
    signature: &Signature,
    resolver: &dyn PublicKeyResolver,
) -> Result<(), CryptoError> {
    let pem = resolver.resolve_pem(&signature.public_key).ok_or_else(|| {
        CryptoError::PublicKeyResolutionFailed {
            key_ref: signature.public_key.clone(),
        }
    })?;

    let bytes = jcs::canonical_bytes(value, exclude)?;
    let sig_bytes =
        BASE64
            .decode(&signature.value)
            .map_err(|e| CryptoError::MalformedSignature {
                reason: e.to_string(),
            })?;

    raw_verify(&bytes, &sig_bytes, &pem, signature.algorithm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::KeyStore;
    use serde_json::json;

    fn test_keys() -> AgentKeys {
        let dir = tempfile::tempdir().unwrap();
        KeyStore::open(dir.path())
            .load_or_generate("test_agent", "pass")
            .unwrap()
    }

    #[test]
    fn test_algorithm_wire_spelling() {
        assert_eq!(
            serde_json::to_string(&SignatureAlgorithm::EcdsaP256Sha256).unwrap(),
            "\"ECDSA-P256-SHA256\""
        );
        assert_eq!(
            serde_json::to_string(&SignatureAlgorithm::Ed25519).unwrap(),
            "\"Ed25519\""
        );
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        assert!(matches!(
            SignatureAlgorithm::parse("RSA-PSS"),
            Err(CryptoError::UnknownAlgorithm { .. })
        ));
        assert!(serde_json::from_str::<SignatureAlgorithm>("\"HMAC-SHA1\"").is_err());
    }

    #[test]
    fn test_sign_and_verify_roundtrip_both_algorithms() {
        let keys = test_keys();
        let payload = json!({"intent": "running shoes", "max": "100.00"});

        for alg in [
            SignatureAlgorithm::EcdsaP256Sha256,
            SignatureAlgorithm::Ed25519,
        ] {
            let sig = sign_payload(&payload, &[], &keys, alg).unwrap();
            verify_payload(&payload, &[], &sig, &InlinePublicKeyResolver).unwrap();
        }
    }

    #[test]
    fn test_tampered_payload_fails() {
        let keys = test_keys();
        let payload = json!({"amount": "89.99"});
        let sig =
            sign_payload(&payload, &[], &keys, SignatureAlgorithm::EcdsaP256Sha256).unwrap();

        let tampered = json!({"amount": "89.98"});
        let result = verify_payload(&tampered, &[], &sig, &InlinePublicKeyResolver);
        assert!(matches!(result, Err(CryptoError::InvalidSignature)));
    }

    #[test]
    fn test_wrong_key_fails() {
        let keys_a = test_keys();
        let keys_b = test_keys();
        let payload = json!({"amount": "89.99"});

        let mut sig = sign_payload(&payload, &[], &keys_a, SignatureAlgorithm::Ed25519).unwrap();
        // Swap in another identity's public key.
        sig.public_key = BASE64.encode(
            keys_b
                .public_key_pem(SignatureAlgorithm::Ed25519)
                .unwrap(),
        );

        let result = verify_payload(&payload, &[], &sig, &InlinePublicKeyResolver);
        assert!(matches!(result, Err(CryptoError::InvalidSignature)));
    }

    #[test]
    fn test_excluded_fields_not_covered() {
        let keys = test_keys();
        let signed = json!({"body": "hello", "user_signature": null});
        let sig = sign_payload(
            &signed,
            &["user_signature"],
            &keys,
            SignatureAlgorithm::EcdsaP256Sha256,
        )
        .unwrap();

        // Mutating the excluded field does not invalidate the signature.
        let mutated = json!({"body": "hello", "user_signature": {"anything": 1}});
        verify_payload(
            &mutated,
            &["user_signature"],
            &sig,
            &InlinePublicKeyResolver,
        )
        .unwrap();
    }

    #[test]
    fn test_unresolvable_key_is_failure() {
        let keys = test_keys();
        let payload = json!({"x": 1});
        let mut sig = sign_payload(&payload, &[], &keys, SignatureAlgorithm::Ed25519).unwrap();
        sig.public_key = "did:ap2:agent:nobody#key-1".to_string();

        let result = verify_payload(&payload, &[], &sig, &InlinePublicKeyResolver);
        assert!(matches!(
            result,
            Err(CryptoError::PublicKeyResolutionFailed { .. })
        ));
    }
}
