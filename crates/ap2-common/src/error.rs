//! Protocol error codes and the structured error carried across roles.
//!
//! Every externally observable failure maps to exactly one [`ErrorCode`].
//! Errors travel with a `details` map, never as free-form text alone, so a
//! counterpart service (or a test) can act on them without parsing prose.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Enumerated AP2 error codes.
///
/// Grouped by origin: signature handling, mandate structure/lifecycle, the
/// A2A envelope, payment execution, and merchant/inventory. `InternalError`
/// is the only code a service may return for faults it does not want to
/// describe to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Signature
    MissingSignature,
    InvalidSignature,
    UnknownAlgorithm,
    PublicKeyUnresolvable,

    // Mandate structure / lifecycle
    ExpiredIntent,
    ExpiredCart,
    ExpiredPayment,
    InvalidMandateChain,
    ConstraintViolation,
    InvalidAmount,
    AmountExceeded,

    // A2A envelope
    MessageReplay,
    MessageTimestampSkew,
    RecipientMismatch,
    MethodNotFound,
    InvalidRequest,

    // Payment
    InsufficientFunds,
    CardDeclined,
    ExpiredCard,
    FraudSuspected,
    ChallengeRequired,
    OtpInvalid,
    TokenExpired,

    // Inventory / merchant
    InsufficientInventory,
    MerchantUnknown,
    CartRejected,

    InternalError,
}

impl ErrorCode {
    /// Wire spelling (SCREAMING_SNAKE_CASE), e.g. `AMOUNT_EXCEEDED`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingSignature => "MISSING_SIGNATURE",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::UnknownAlgorithm => "UNKNOWN_ALGORITHM",
            Self::PublicKeyUnresolvable => "PUBLIC_KEY_UNRESOLVABLE",
            Self::ExpiredIntent => "EXPIRED_INTENT",
            Self::ExpiredCart => "EXPIRED_CART",
            Self::ExpiredPayment => "EXPIRED_PAYMENT",
            Self::InvalidMandateChain => "INVALID_MANDATE_CHAIN",
            Self::ConstraintViolation => "CONSTRAINT_VIOLATION",
            Self::InvalidAmount => "INVALID_AMOUNT",
            Self::AmountExceeded => "AMOUNT_EXCEEDED",
            Self::MessageReplay => "MESSAGE_REPLAY",
            Self::MessageTimestampSkew => "MESSAGE_TIMESTAMP_SKEW",
            Self::RecipientMismatch => "RECIPIENT_MISMATCH",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::InsufficientFunds => "INSUFFICIENT_FUNDS",
            Self::CardDeclined => "CARD_DECLINED",
            Self::ExpiredCard => "EXPIRED_CARD",
            Self::FraudSuspected => "FRAUD_SUSPECTED",
            Self::ChallengeRequired => "CHALLENGE_REQUIRED",
            Self::OtpInvalid => "OTP_INVALID",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::InsufficientInventory => "INSUFFICIENT_INVENTORY",
            Self::MerchantUnknown => "MERCHANT_UNKNOWN",
            Self::CartRejected => "CART_REJECTED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// True for codes a service reports to peers with HTTP 4xx; false only
    /// for `InternalError` (5xx).
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::InternalError)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol error: enumerated code, short human message, structured details.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{error_code}: {error_message}")]
pub struct ProtocolError {
    pub error_code: ErrorCode,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

impl ProtocolError {
    /// Create an error with an empty details map.
    pub fn new(error_code: ErrorCode, error_message: impl Into<String>) -> Self {
        Self {
            error_code,
            error_message: error_message.into(),
            details: Map::new(),
        }
    }

    /// Attach one structured detail. Values that fail to serialize are
    /// recorded as their `Debug` rendering rather than dropped.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let v = serde_json::to_value(&value).unwrap_or_else(|_| Value::String(String::new()));
        self.details.insert(key.into(), v);
        self
    }

    /// Shorthand for the common "<thing> expired" shape.
    pub fn expired(code: ErrorCode, mandate_id: &str, expires_at: &str) -> Self {
        Self::new(code, format!("mandate expired: {mandate_id}"))
            .with_detail("mandate_id", mandate_id)
            .with_detail("expires_at", expires_at)
    }
}
