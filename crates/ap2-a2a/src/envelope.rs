//! The A2A wire envelope.
//!
//! Envelope signatures are Ed25519 over the JCS canonical bytes of the
//! message with `header.signature` removed; the signature `value` is
//! unpadded base64url. Mandate payloads ride inside the data part either
//! bare or wrapped as an Artifact.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use ap2_mandate::crypto::jcs;
use ap2_mandate::crypto::keys::AgentKeys;
use ap2_mandate::crypto::sign::{raw_sign, raw_verify, CryptoError, Signature, SignatureAlgorithm};

/// Envelope schema version stamped into every header.
pub const ENVELOPE_SCHEMA_VERSION: &str = "0.2";

/// Message routing and authentication header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Single-use id; doubles as the anti-replay nonce.
    pub message_id: String,

    /// Sender DID, e.g. `did:ap2:agent:shopping_agent`.
    pub sender: String,

    /// Recipient DID; enforced against the receiving service's own DID.
    pub recipient: String,

    pub timestamp: DateTime<Utc>,

    pub schema_version: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

/// One typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPart {
    /// Path-like type id, e.g. `ap2.mandates.IntentMandate`.
    #[serde(rename = "type")]
    pub data_type: String,

    pub id: String,

    pub payload: Value,
}

/// A signed agent-to-agent message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct A2aMessage {
    pub header: MessageHeader,

    #[serde(rename = "dataPart")]
    pub data_part: DataPart,
}

impl A2aMessage {
    /// Paths stripped before envelope signing/verification.
    pub const SIGNING_EXCLUSIONS: &'static [&'static str] = &["header.signature"];

    /// Build an unsigned message with a fresh `message_id`.
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        data_type: impl Into<String>,
        payload_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            header: MessageHeader {
                message_id: Uuid::new_v4().to_string(),
                sender: sender.into(),
                recipient: recipient.into(),
                timestamp: Utc::now(),
                schema_version: ENVELOPE_SCHEMA_VERSION.to_string(),
                signature: None,
            },
            data_part: DataPart {
                data_type: data_type.into(),
                id: payload_id.into(),
                payload,
            },
        }
    }

    /// Sign the envelope with the sender's Ed25519 key.
    ///
    /// The embedded key reference is the sender's DID kid
    /// (`<sender>#key-1`), so receivers resolve it through their DID
    /// resolver rather than trusting embedded material.
    pub fn sign(&mut self, keys: &AgentKeys) -> Result<(), CryptoError> {
        self.header.signature = None;
        let bytes = jcs::canonical_bytes(self, Self::SIGNING_EXCLUSIONS)?;
        let sig = raw_sign(&bytes, keys, SignatureAlgorithm::Ed25519)?;
        self.header.signature = Some(Signature {
            algorithm: SignatureAlgorithm::Ed25519,
            value: URL_SAFE_NO_PAD.encode(sig),
            public_key: format!("{}#key-1", self.header.sender),
            signed_at: Utc::now(),
        });
        Ok(())
    }

    /// Verify the envelope signature against a resolved SPKI PEM.
    pub fn verify_signature(&self, public_key_pem: &str) -> Result<(), CryptoError> {
        let signature = self
            .header
            .signature
            .as_ref()
            .ok_or(CryptoError::InvalidSignature)?;

        let sig_bytes = URL_SAFE_NO_PAD.decode(&signature.value).map_err(|e| {
            CryptoError::MalformedSignature {
                reason: e.to_string(),
            }
        })?;

        let bytes = jcs::canonical_bytes(self, Self::SIGNING_EXCLUSIONS)?;
        raw_verify(&bytes, &sig_bytes, public_key_pem, signature.algorithm)
    }
}

/// Wrapper for signed results carried inside a data part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(rename = "artifactId")]
    pub artifact_id: String,

    pub name: String,

    pub parts: Vec<ArtifactPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactPart {
    /// Always `"data"`.
    pub kind: String,

    /// Single-entry map from the payload's type id to the payload.
    pub data: serde_json::Map<String, Value>,
}

impl Artifact {
    /// Wrap one typed payload as an artifact.
    pub fn wrap(name: impl Into<String>, data_type: &str, payload: Value) -> Self {
        let mut data = serde_json::Map::new();
        data.insert(data_type.to_string(), payload);
        Self {
            artifact_id: Uuid::new_v4().to_string(),
            name: name.into(),
            parts: vec![ArtifactPart {
                kind: "data".to_string(),
                data,
            }],
        }
    }

    /// Extract the payload stored under `data_type`, if present.
    pub fn unwrap_payload(&self, data_type: &str) -> Option<&Value> {
        self.parts
            .iter()
            .find(|p| p.kind == "data")
            .and_then(|p| p.data.get(data_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys() -> AgentKeys {
        AgentKeys::generate()
    }

    fn message() -> A2aMessage {
        A2aMessage::new(
            "did:ap2:agent:shopping_agent",
            "did:ap2:agent:merchant_agent",
            crate::types::INTENT_MANDATE,
            "intent_001",
            json!({"id": "intent_001"}),
        )
    }

    #[test]
    fn test_wire_field_names() {
        let msg = message();
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("dataPart").is_some());
        assert_eq!(json["dataPart"]["type"], crate::types::INTENT_MANDATE);
        assert_eq!(json["header"]["schema_version"], ENVELOPE_SCHEMA_VERSION);
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let keys = keys();
        let mut msg = message();
        msg.sign(&keys).unwrap();

        let sig = msg.header.signature.as_ref().unwrap();
        assert_eq!(sig.algorithm, SignatureAlgorithm::Ed25519);
        assert_eq!(sig.public_key, "did:ap2:agent:shopping_agent#key-1");
        // unpadded base64url
        assert!(!sig.value.contains('='));

        let pem = keys.public_key_pem(SignatureAlgorithm::Ed25519).unwrap();
        msg.verify_signature(&pem).unwrap();
    }

    #[test]
    fn test_tampered_payload_fails_verification() {
        let keys = keys();
        let mut msg = message();
        msg.sign(&keys).unwrap();

        msg.data_part.payload = json!({"id": "intent_002"});
        let pem = keys.public_key_pem(SignatureAlgorithm::Ed25519).unwrap();
        assert!(matches!(
            msg.verify_signature(&pem),
            Err(CryptoError::InvalidSignature)
        ));
    }

    #[test]
    fn test_fresh_message_ids() {
        assert_ne!(message().header.message_id, message().header.message_id);
    }

    #[test]
    fn test_artifact_wrap_unwrap() {
        let artifact = Artifact::wrap(
            "signed_cart",
            crate::types::CART_MANDATE,
            json!({"id": "cart_001"}),
        );
        assert_eq!(artifact.parts.len(), 1);
        assert_eq!(artifact.parts[0].kind, "data");

        let payload = artifact.unwrap_payload(crate::types::CART_MANDATE).unwrap();
        assert_eq!(payload["id"], "cart_001");
        assert!(artifact.unwrap_payload("ap2.mandates.Other").is_none());
    }
}
