//! Cart mandate: the merchant's signed offer.

use ap2_common::{Amount, ErrorCode, ProtocolError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::hash::{mandate_hash, Hashable};
use super::metadata::MandateMetadata;
use crate::crypto::sign::{CryptoError, Signature};

/// One line item in a cart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub id: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price: Amount,
    /// Must equal `unit_price × quantity` exactly.
    pub total_price: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShippingInfo {
    pub address: Address,
    /// e.g. "standard", "express", "overnight".
    pub method: String,
    pub cost: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_delivery: Option<String>,
}

/// A concrete offer drafted by the merchant agent and signed by the merchant.
///
/// Immutable after the merchant signature; the user's authorizing act is
/// signing the payment that references it, so a user cart signature is
/// optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartMandate {
    pub id: String,

    /// Always `"CartMandate"`.
    #[serde(rename = "type")]
    pub mandate_type: String,

    pub version: String,

    pub intent_mandate_id: String,

    pub items: Vec<CartItem>,

    pub subtotal: Amount,
    pub tax: Amount,
    pub shipping: ShippingInfo,
    /// Must equal `subtotal + tax + shipping.cost` exactly.
    pub total: Amount,

    pub merchant_id: String,
    pub merchant_name: String,

    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_signature: Option<Signature>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_signature: Option<Signature>,

    /// Hex SHA-256 of the referenced intent's canonical form.
    pub intent_mandate_hash: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mandate_metadata: Option<MandateMetadata>,
}

impl CartMandate {
    /// Fields stripped before a cart signature is computed or verified.
    pub const SIGNING_EXCLUSIONS: &'static [&'static str] = &[
        "merchant_signature",
        "user_signature",
        "mandate_metadata.mandate_hash",
    ];

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Check line-item and total arithmetic exactly.
    ///
    /// Verifies `total_price = unit_price × quantity` per item,
    /// `subtotal = Σ total_price`, and `total = subtotal + tax + shipping`.
    /// Currency mismatches fail here too, as `INVALID_AMOUNT`.
    pub fn verify_arithmetic(&self) -> Result<(), ProtocolError> {
        let invalid = |message: &str| {
            ProtocolError::new(ErrorCode::InvalidAmount, message)
                .with_detail("cart_mandate_id", &self.id)
        };

        let mut subtotal = Amount::zero(self.total.currency.clone());
        for item in &self.items {
            if item.quantity == 0 {
                return Err(invalid("item quantity must be positive")
                    .with_detail("item_id", &item.id));
            }
            let expected = item.unit_price.mul_quantity(item.quantity);
            if !item.total_price.eq_exact(&expected) {
                return Err(invalid("item total does not equal unit price × quantity")
                    .with_detail("item_id", &item.id)
                    .with_detail("expected", &expected)
                    .with_detail("actual", &item.total_price));
            }
            subtotal = subtotal
                .checked_add(&item.total_price)
                .map_err(|e| invalid(&e.to_string()))?;
        }

        if !subtotal.eq_exact(&self.subtotal) {
            return Err(invalid("subtotal does not equal sum of items")
                .with_detail("expected", &subtotal)
                .with_detail("actual", &self.subtotal));
        }

        let expected_total = self
            .subtotal
            .checked_add(&self.tax)
            .and_then(|t| t.checked_add(&self.shipping.cost))
            .map_err(|e| invalid(&e.to_string()))?;
        if !expected_total.eq_exact(&self.total) {
            return Err(invalid("total does not equal subtotal + tax + shipping")
                .with_detail("expected", &expected_total)
                .with_detail("actual", &self.total));
        }

        Ok(())
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

impl Hashable for CartMandate {
    const MANDATE_TYPE: &'static str = "CartMandate";

    fn hash_exclusions() -> &'static [&'static str] {
        &[
            "merchant_signature",
            "user_signature",
            "mandate_metadata.mandate_hash",
        ]
    }
}
