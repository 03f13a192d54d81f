//! Payment mandate: the user's final authorization for one payment.

use ap2_common::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::attestation::DeviceAttestation;
use super::cart::CartMandate;
use super::hash::{canonical_bytes, mandate_hash, Hashable};
use super::metadata::MandateMetadata;
use crate::crypto::sign::{CryptoError, Signature};

/// Whether a live user was present when the payment was authorized.
///
/// `UserPresent` iff a fresh passkey/WebAuthn attestation was collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    UserPresent,
    UserNotPresent,
}

/// Tokenized payment instrument reference. Never carries a PAN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMethod {
    /// Instrument kind, e.g. `"card"`.
    #[serde(rename = "type")]
    pub method_type: String,

    /// Opaque credential-provider token (`tok_...`).
    pub token: String,

    pub last4: String,
    pub brand: String,
    pub expiry_month: u8,
    pub expiry_year: u16,
}

/// The user's authorization to pay for one specific cart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMandate {
    pub id: String,

    /// Always `"PaymentMandate"`.
    #[serde(rename = "type")]
    pub mandate_type: String,

    pub version: String,

    pub cart_mandate_id: String,
    pub intent_mandate_id: String,

    pub payment_method: PaymentMethod,

    /// Must equal the referenced cart's total exactly.
    pub amount: Amount,

    pub transaction_type: TransactionType,

    /// True whenever a shopping agent assembled this mandate.
    pub agent_involved: bool,

    pub payer_id: String,
    pub payee_id: String,

    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    /// Carried over from the signed cart, byte-for-byte.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_signature: Option<Signature>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_signature: Option<Signature>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_attestation: Option<DeviceAttestation>,

    /// 0..=100, stamped by the risk engine after assembly.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<u8>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fraud_indicators: Vec<String>,

    pub cart_mandate_hash: String,
    pub intent_mandate_hash: String,

    /// Opaque cart/payment coupling token (see [`user_authorization_token`]).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_authorization: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mandate_metadata: Option<MandateMetadata>,
}

impl PaymentMandate {
    /// Fields stripped before the user signature is computed or verified.
    ///
    /// The user signs the stable payment core; the attestation, risk
    /// stamping, and chain metadata are attached by the agent layer after
    /// the authenticator has already run.
    pub const SIGNING_EXCLUSIONS: &'static [&'static str] = &[
        "user_signature",
        "merchant_signature",
        "device_attestation",
        "risk_score",
        "fraud_indicators",
        "mandate_metadata",
    ];

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

impl Hashable for PaymentMandate {
    const MANDATE_TYPE: &'static str = "PaymentMandate";

    fn hash_exclusions() -> &'static [&'static str] {
        &[
            "user_signature",
            "merchant_signature",
            "device_attestation",
            "mandate_metadata.mandate_hash",
        ]
    }
}

/// The opaque binding token tying a payment to its cart:
/// `sha256(canonical(cart)) + "_" + sha256(canonical(payment core))`.
///
/// The payment side hashes the same core the user signs, minus the token
/// slot itself, so the processor can re-check the coupling without
/// re-normalizing either mandate's full JSON.
pub fn user_authorization_token(
    cart: &CartMandate,
    payment: &PaymentMandate,
) -> Result<String, CryptoError> {
    let cart_hash = mandate_hash(cart)?;

    let mut exclusions: Vec<&str> = PaymentMandate::SIGNING_EXCLUSIONS.to_vec();
    exclusions.push("user_authorization");
    let payment_bytes = canonical_bytes(payment, &exclusions)?;
    let payment_hash = hex::encode(Sha256::digest(&payment_bytes));

    Ok(format!("{cart_hash}_{payment_hash}"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mandate::cart::tests::test_cart;
    use ap2_common::money::amount;
    use chrono::Duration;

    pub(crate) fn test_payment() -> PaymentMandate {
        PaymentMandate {
            id: "payment_001".into(),
            mandate_type: "PaymentMandate".into(),
            version: "0.1".into(),
            cart_mandate_id: "cart_001".into(),
            intent_mandate_id: "intent_001".into(),
            payment_method: PaymentMethod {
                method_type: "card".into(),
                token: "tok_abc".into(),
                last4: "4242".into(),
                brand: "visa".into(),
                expiry_month: 12,
                expiry_year: 2028,
            },
            amount: amount("89.99", "USD"),
            transaction_type: TransactionType::UserPresent,
            agent_involved: true,
            payer_id: "user_001".into(),
            payee_id: "merchant_001".into(),
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::minutes(15),
            merchant_signature: None,
            user_signature: None,
            device_attestation: None,
            risk_score: None,
            fraud_indicators: Vec::new(),
            cart_mandate_hash: "11".repeat(32),
            intent_mandate_hash: "22".repeat(32),
            user_authorization: None,
            mandate_metadata: None,
        }
    }

    #[test]
    fn test_transaction_type_wire_spelling() {
        assert_eq!(
            serde_json::to_string(&TransactionType::UserPresent).unwrap(),
            "\"user_present\""
        );
        assert_eq!(
            serde_json::to_string(&TransactionType::UserNotPresent).unwrap(),
            "\"user_not_present\""
        );
    }

    #[test]
    fn test_authorization_token_shape() {
        let token = user_authorization_token(&test_cart(), &test_payment()).unwrap();
        let (cart_part, payment_part) = token.split_once('_').unwrap();
        assert_eq!(cart_part.len(), 64);
        assert_eq!(payment_part.len(), 64);
    }

    #[test]
    fn test_authorization_token_stable_under_late_fields() {
        let cart = test_cart();
        let mut payment = test_payment();
        let before = user_authorization_token(&cart, &payment).unwrap();

        // Fields attached after assembly must not change the token.
        payment.user_authorization = Some(before.clone());
        payment.risk_score = Some(42);
        payment.fraud_indicators.push("velocity".into());
        payment.mandate_metadata = Some(MandateMetadata::issue("did:ap2:agent:sa", None));

        assert_eq!(user_authorization_token(&cart, &payment).unwrap(), before);
    }

    #[test]
    fn test_authorization_token_tracks_amount() {
        let cart = test_cart();
        let mut payment = test_payment();
        let before = user_authorization_token(&cart, &payment).unwrap();

        payment.amount = amount("1.00", "USD");
        assert_ne!(user_authorization_token(&cart, &payment).unwrap(), before);
    }
}
