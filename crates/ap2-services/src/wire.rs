//! Request/response payload shapes carried inside A2A data parts and the
//! roles' plain HTTP endpoints.

use ap2_common::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ap2_mandate::{CartMandate, DeviceAttestation, IntentMandate, PaymentMandate};

/// Authorization request delivered to the payment processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub payment_mandate: PaymentMandate,
    pub cart_mandate: CartMandate,
    pub intent_mandate: IntentMandate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otp: Option<String>,
}

/// Lifecycle state of a transaction at the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Init,
    Authorizing,
    Authorized,
    Capturing,
    Captured,
    Refunding,
    Refunded,
    Failed,
}

/// Terminal answer returned to the shopping agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionResult {
    pub id: String,
    pub status: TransactionStatus,
    pub payment_mandate_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Amount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorized_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ap2_common::ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Merchant-side cart lifecycle, surfaced by `GET /cart-mandates/{id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CartStatus {
    PendingMerchantSignature,
    Signed,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartStatusResponse {
    pub status: CartStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<CartMandate>,
}

/// Metadata a credential provider exposes about a stored method. Never the
/// PAN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentMethodSummary {
    pub method_id: String,
    pub brand: String,
    pub last4: String,
    pub expiry_month: u8,
    pub expiry_year: u16,
    pub is_default: bool,
}

/// A short-lived token minted for one stored method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenGrant {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenizeRequest {
    pub user_id: String,
    pub method_id: String,
}

/// Credentials the processor redeems a token for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsEnvelope {
    pub card_brand: String,
    pub last4: String,
    pub expiry_month: u8,
    pub expiry_year: u16,
    pub holder_name: String,
    /// Random 128-bit hex in this reference implementation.
    pub cryptogram: String,
    pub token: String,
    pub provider_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationVerifyRequest {
    pub attestation: DeviceAttestation,
    pub payment_mandate_id: String,
}

/// Credential request delivered to the credential provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRequest {
    pub payment_mandate: PaymentMandate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otp: Option<String>,
}

/// Product search request/response payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductSearch {
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// One cart candidate offered by the merchant agent.
///
/// `pending` carts carry the unsigned draft; the shopping agent polls the
/// merchant until an operator signs or rejects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CartCandidate {
    Signed { cart: CartMandate },
    Pending { cart: CartMandate },
}

impl CartCandidate {
    pub fn cart(&self) -> &CartMandate {
        match self {
            Self::Signed { cart } | Self::Pending { cart } => cart,
        }
    }
}

/// Candidate list carried in an `ap2.responses.CartCandidates` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartCandidates {
    pub candidates: Vec<CartCandidate>,
}

/// Explicit cart construction request (`ap2.requests.CartRequest`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartRequest {
    pub intent_mandate: IntentMandate,
    /// Product id → quantity.
    pub items: Vec<(String, u32)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shipping_method: Option<String>,
}
