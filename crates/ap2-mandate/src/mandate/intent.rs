//! Intent mandate: the user's standing shopping authority.

use ap2_common::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::hash::{mandate_hash, Hashable};
use super::metadata::MandateMetadata;
use crate::crypto::sign::{CryptoError, Signature};

/// Constraints the user placed on the intent.
///
/// Everything is optional except `max_transactions`, which defaults to a
/// single purchase. Any non-trivial intent carries a `max_amount`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IntentConstraints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_amount: Option<Amount>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub brands: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchants: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub skus: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,

    /// How many payments may reference this intent. Default 1.
    #[serde(default = "default_max_transactions")]
    pub max_transactions: u32,

    #[serde(default, skip_serializing_if = "is_false")]
    pub requires_refundability: bool,
}

fn default_max_transactions() -> u32 {
    1
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// The user's signed intent to shop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentMandate {
    pub id: String,

    /// Always `"IntentMandate"`.
    #[serde(rename = "type")]
    pub mandate_type: String,

    pub version: String,

    pub user_id: String,

    /// base64(SPKI PEM) of the user's passkey public key.
    pub user_public_key: String,

    /// Free-text shopping intent, e.g. "running shoes under 100 USD".
    pub intent: String,

    pub constraints: IntentConstraints,

    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    /// Produced off-band by the user's authenticator, attached verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_signature: Option<Signature>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mandate_metadata: Option<MandateMetadata>,

    /// Opaque agent hints carried through unmodified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_signal: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_payload: Option<serde_json::Value>,
}

impl IntentMandate {
    /// Fields stripped before the user signature is computed or verified.
    ///
    /// The whole metadata block is excluded: the user's authenticator signs
    /// the intent off-band, and the agent attaches chain metadata
    /// afterwards without invalidating that signature.
    pub const SIGNING_EXCLUSIONS: &'static [&'static str] =
        &["user_signature", "mandate_metadata"];

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Compute this mandate's canonical hash and store it in the metadata.
    pub fn seal_metadata(&mut self) -> Result<(), CryptoError> {
        let hash = mandate_hash(self)?;
        if let Some(meta) = &mut self.mandate_metadata {
            meta.mandate_hash = hash;
        }
        Ok(())
    }
}

impl Hashable for IntentMandate {
    const MANDATE_TYPE: &'static str = "IntentMandate";

    fn hash_exclusions() -> &'static [&'static str] {
        &["user_signature", "mandate_metadata.mandate_hash"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ap2_common::money::amount;
    use chrono::Duration;

    fn test_intent() -> IntentMandate {
        IntentMandate {
            id: "intent_001".into(),
            mandate_type: "IntentMandate".into(),
            version: "0.1".into(),
            user_id: "user_001".into(),
            user_public_key: "cGVt".into(),
            intent: "running shoes under 100 USD".into(),
            constraints: IntentConstraints {
                max_amount: Some(amount("100.00", "USD")),
                max_transactions: 1,
                ..Default::default()
            },
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::hours(24),
            user_signature: None,
            mandate_metadata: Some(MandateMetadata::issue("did:ap2:agent:shopping_agent", None)),
            agent_signal: None,
            risk_payload: None,
        }
    }

    #[test]
    fn test_max_transactions_defaults_to_one() {
        let constraints: IntentConstraints = serde_json::from_str("{}").unwrap();
        assert_eq!(constraints.max_transactions, 1);
    }

    #[test]
    fn test_expiry_check() {
        let intent = test_intent();
        assert!(!intent.is_expired(Utc::now()));
        assert!(intent.is_expired(Utc::now() + Duration::hours(25)));
    }

    #[test]
    fn test_seal_metadata_matches_recomputed_hash() {
        let mut intent = test_intent();
        intent.seal_metadata().unwrap();

        let stored = intent.mandate_metadata.as_ref().unwrap().mandate_hash.clone();
        assert_eq!(stored, mandate_hash(&intent).unwrap());
        assert_eq!(stored.len(), 64);
    }

    #[test]
    fn test_hash_stable_across_signing() {
        let mut intent = test_intent();
        intent.seal_metadata().unwrap();
        let before = mandate_hash(&intent).unwrap();

        intent.user_signature = Some(Signature {
            algorithm: crate::crypto::sign::SignatureAlgorithm::EcdsaP256Sha256,
            value: "c2ln".into(),
            public_key: "cGVt".into(),
            signed_at: Utc::now(),
        });
        assert_eq!(mandate_hash(&intent).unwrap(), before);
    }
}
