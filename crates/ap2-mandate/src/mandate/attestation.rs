//! Device attestation: proof of live user presence on trusted hardware.
//!
//! The device signs the tuple
//! `{device_id, payment_mandate_id, challenge, timestamp, attestation_type,
//! platform}` with its own P-256 key. Binding the payment mandate id and a
//! fresh ≥256-bit challenge into the signed tuple prevents replay against a
//! different payment; the timestamp bounds how long a captured attestation
//! stays usable.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::crypto::jcs;
use crate::crypto::keys::AgentKeys;
use crate::crypto::sign::{raw_sign, raw_verify, CryptoError, SignatureAlgorithm};

/// How the user proved presence on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttestationType {
    Biometric,
    Passkey,
    Pin,
    HardwareKey,
}

/// A fresh device signature binding a payment to live user presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAttestation {
    pub device_id: String,

    pub attestation_type: AttestationType,

    /// Base64 P-256 signature over the attestation tuple.
    pub attestation_value: String,

    pub timestamp: DateTime<Utc>,

    /// base64(SPKI PEM) of the device key that produced the signature.
    pub device_public_key: String,

    /// Base64 random challenge, ≥ 256 bits.
    pub challenge: String,

    /// e.g. "iOS", "Android", "Web".
    pub platform: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
}

/// The exact tuple covered by the device signature.
#[derive(Serialize)]
struct AttestationClaims<'a> {
    device_id: &'a str,
    payment_mandate_id: &'a str,
    challenge: &'a str,
    timestamp: &'a DateTime<Utc>,
    attestation_type: AttestationType,
    platform: &'a str,
}

/// Random 256-bit challenge, base64.
pub fn generate_challenge() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

impl DeviceAttestation {
    /// Produce an attestation for `payment_mandate_id` with the device's
    /// P-256 key. The challenge is generated here; callers that received a
    /// challenge from a verifier pass it through `challenge`.
    pub fn create(
        device_id: impl Into<String>,
        payment_mandate_id: &str,
        device_keys: &AgentKeys,
        attestation_type: AttestationType,
        platform: impl Into<String>,
        challenge: Option<String>,
    ) -> Result<Self, CryptoError> {
        let device_id = device_id.into();
        let platform = platform.into();
        let challenge = challenge.unwrap_or_else(generate_challenge);
        let timestamp = Utc::now();

        let claims = AttestationClaims {
            device_id: &device_id,
            payment_mandate_id,
            challenge: &challenge,
            timestamp: &timestamp,
            attestation_type,
            platform: &platform,
        };
        let bytes = jcs::to_vec(&claims)?;
        let signature = raw_sign(&bytes, device_keys, SignatureAlgorithm::EcdsaP256Sha256)?;

        let device_public_key = BASE64.encode(
            device_keys.public_key_pem(SignatureAlgorithm::EcdsaP256Sha256)?,
        );

        Ok(Self {
            device_id,
            attestation_type,
            attestation_value: BASE64.encode(signature),
            timestamp,
            device_public_key,
            challenge,
            platform,
            os_version: None,
            app_version: None,
        })
    }

    /// Re-verify the attestation against a payment mandate id.
    ///
    /// Reconstructs the signed tuple, checks the device-key signature, and
    /// enforces timestamp freshness (`max_age`, default window 300 s at the
    /// credential provider).
    pub fn verify(
        &self,
        payment_mandate_id: &str,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), CryptoError> {
        let age = now - self.timestamp;
        if age > max_age || age < -max_age {
            return Err(CryptoError::AttestationStale {
                age_seconds: age.num_seconds(),
            });
        }

        let claims = AttestationClaims {
            device_id: &self.device_id,
            payment_mandate_id,
            challenge: &self.challenge,
            timestamp: &self.timestamp,
            attestation_type: self.attestation_type,
            platform: &self.platform,
        };
        let bytes = jcs::to_vec(&claims)?;

        let pem_bytes =
            BASE64
                .decode(&self.device_public_key)
                .map_err(|e| CryptoError::MalformedKey {
                    reason: e.to_string(),
                })?;
        let pem = String::from_utf8(pem_bytes).map_err(|e| CryptoError::MalformedKey {
            reason: e.to_string(),
        })?;

        let signature =
            BASE64
                .decode(&self.attestation_value)
                .map_err(|e| CryptoError::MalformedSignature {
                    reason: e.to_string(),
                })?;

        raw_verify(&bytes, &signature, &pem, SignatureAlgorithm::EcdsaP256Sha256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_keys() -> AgentKeys {
        AgentKeys::generate()
    }

    #[test]
    fn test_challenge_entropy_length() {
        let challenge = generate_challenge();
        let bytes = BASE64.decode(&challenge).unwrap();
        assert_eq!(bytes.len(), 32);
    }

    #[test]
    fn test_create_and_verify() {
        let keys = device_keys();
        let attestation = DeviceAttestation::create(
            "device_01",
            "payment_001",
            &keys,
            AttestationType::Passkey,
            "iOS",
            None,
        )
        .unwrap();

        attestation
            .verify("payment_001", Duration::seconds(300), Utc::now())
            .unwrap();
    }

    #[test]
    fn test_wrong_payment_id_fails() {
        let keys = device_keys();
        let attestation = DeviceAttestation::create(
            "device_01",
            "payment_001",
            &keys,
            AttestationType::Biometric,
            "Android",
            None,
        )
        .unwrap();

        let result = attestation.verify("payment_002", Duration::seconds(300), Utc::now());
        assert!(matches!(result, Err(CryptoError::InvalidSignature)));
    }

    #[test]
    fn test_stale_attestation_rejected() {
        let keys = device_keys();
        let attestation = DeviceAttestation::create(
            "device_01",
            "payment_001",
            &keys,
            AttestationType::Passkey,
            "iOS",
            None,
        )
        .unwrap();

        let later = Utc::now() + Duration::seconds(301);
        let result = attestation.verify("payment_001", Duration::seconds(300), later);
        assert!(matches!(
            result,
            Err(CryptoError::AttestationStale { .. })
        ));
    }

    #[test]
    fn test_tampered_challenge_fails() {
        let keys = device_keys();
        let mut attestation = DeviceAttestation::create(
            "device_01",
            "payment_001",
            &keys,
            AttestationType::Passkey,
            "iOS",
            None,
        )
        .unwrap();

        attestation.challenge = generate_challenge();
        let result = attestation.verify("payment_001", Duration::seconds(300), Utc::now());
        assert!(matches!(result, Err(CryptoError::InvalidSignature)));
    }

    #[test]
    fn test_attestation_type_wire_spelling() {
        assert_eq!(
            serde_json::to_string(&AttestationType::HardwareKey).unwrap(),
            "\"hardware_key\""
        );
        assert_eq!(
            serde_json::to_string(&AttestationType::Passkey).unwrap(),
            "\"passkey\""
        );
    }
}
