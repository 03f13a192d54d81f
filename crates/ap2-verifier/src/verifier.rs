//! The verifier: structural, cryptographic, temporal, and constraint checks
//! over individual mandates and the full chain.
//!
//! Checks are ordered cheap-to-expensive and fail on the first violation
//! with an enumerated error code plus structured details. `verify_chain`
//! records into the ledger only after all three mandates pass, which is
//! what makes `max_transactions` enforceable.

use std::sync::Arc;

use ap2_common::{ErrorCode, ProtocolError};
use chrono::{DateTime, Duration, Utc};

use ap2_mandate::crypto::sign::{verify_payload, CryptoError, PublicKeyResolver};
use ap2_mandate::mandate::hash::mandate_hash;
use ap2_mandate::mandate::payment::user_authorization_token;
use ap2_mandate::{CartMandate, IntentMandate, PaymentMandate};

use crate::ledger::TransactionLedger;

/// Freshness window for device attestations.
const ATTESTATION_MAX_AGE_SECONDS: i64 = 300;

/// Role-agnostic mandate verifier.
pub struct Verifier {
    resolver: Arc<dyn PublicKeyResolver + Send + Sync>,
    ledger: TransactionLedger,
}

impl Verifier {
    pub fn new(
        resolver: Arc<dyn PublicKeyResolver + Send + Sync>,
        ledger: TransactionLedger,
    ) -> Self {
        Self { resolver, ledger }
    }

    /// Verifier for fully self-contained mandates (inline public keys).
    pub fn offline(ledger: TransactionLedger) -> Self {
        Self::new(
            Arc::new(ap2_mandate::InlinePublicKeyResolver),
            ledger,
        )
    }

    pub fn ledger(&self) -> &TransactionLedger {
        &self.ledger
    }

    /// Verify an intent mandate in isolation.
    pub fn verify_intent(
        &self,
        intent: &IntentMandate,
        now: DateTime<Utc>,
    ) -> Result<(), ProtocolError> {
        let signature = intent.user_signature.as_ref().ok_or_else(|| {
            ProtocolError::new(ErrorCode::MissingSignature, "intent has no user signature")
                .with_detail("intent_mandate_id", &intent.id)
        })?;

        if signature.public_key != intent.user_public_key {
            return Err(ProtocolError::new(
                ErrorCode::InvalidSignature,
                "intent signature key does not match user_public_key",
            )
            .with_detail("intent_mandate_id", &intent.id));
        }

        verify_payload(
            intent,
            IntentMandate::SIGNING_EXCLUSIONS,
            signature,
            self.resolver.as_ref(),
        )
        .map_err(|e| signature_error(e, "intent_mandate_id", &intent.id))?;

        if intent.is_expired(now) {
            return Err(ProtocolError::expired(
                ErrorCode::ExpiredIntent,
                &intent.id,
                &intent.expires_at.to_rfc3339(),
            ));
        }

        if let Some(max_amount) = &intent.constraints.max_amount {
            if !max_amount.is_positive() {
                return Err(ProtocolError::new(
                    ErrorCode::InvalidAmount,
                    "constraints.max_amount must be positive",
                )
                .with_detail("max_amount", max_amount));
            }
        }

        self.check_metadata_hash(intent.mandate_metadata.as_ref(), mandate_hash(intent), &intent.id)?;

        Ok(())
    }

    /// Verify a cart mandate against its intent.
    pub fn verify_cart(
        &self,
        cart: &CartMandate,
        intent: &IntentMandate,
        now: DateTime<Utc>,
    ) -> Result<(), ProtocolError> {
        if cart.intent_mandate_id != intent.id {
            return Err(chain_error(
                "cart does not reference this intent",
                &cart.id,
                &intent.id,
                &cart.intent_mandate_id,
            ));
        }

        let intent_hash = mandate_hash(intent).map_err(internal_crypto)?;
        if cart.intent_mandate_hash != intent_hash {
            return Err(ProtocolError::new(
                ErrorCode::InvalidMandateChain,
                "cart's intent hash does not match the intent's canonical form",
            )
            .with_detail("cart_mandate_id", &cart.id)
            .with_detail("expected", &intent_hash)
            .with_detail("actual", &cart.intent_mandate_hash));
        }

        let merchant_signature = cart.merchant_signature.as_ref().ok_or_else(|| {
            ProtocolError::new(ErrorCode::MissingSignature, "cart has no merchant signature")
                .with_detail("cart_mandate_id", &cart.id)
        })?;
        verify_payload(
            cart,
            CartMandate::SIGNING_EXCLUSIONS,
            merchant_signature,
            self.resolver.as_ref(),
        )
        .map_err(|e| signature_error(e, "cart_mandate_id", &cart.id))?;

        // The user cart signature is optional; the authorizing act is the
        // payment signature. Verify it when supplied.
        if let Some(user_signature) = &cart.user_signature {
            verify_payload(
                cart,
                CartMandate::SIGNING_EXCLUSIONS,
                user_signature,
                self.resolver.as_ref(),
            )
            .map_err(|e| signature_error(e, "cart_mandate_id", &cart.id))?;
        }

        if cart.is_expired(now) {
            return Err(ProtocolError::expired(
                ErrorCode::ExpiredCart,
                &cart.id,
                &cart.expires_at.to_rfc3339(),
            ));
        }

        cart.verify_arithmetic()?;

        if let Some(max_amount) = &intent.constraints.max_amount {
            let over = cart.total.gt(max_amount).map_err(|e| {
                ProtocolError::new(ErrorCode::InvalidAmount, e.to_string())
                    .with_detail("cart_mandate_id", &cart.id)
            })?;
            if over {
                return Err(ProtocolError::new(
                    ErrorCode::AmountExceeded,
                    "cart total exceeds intent max_amount",
                )
                .with_detail("cart_total", &cart.total)
                .with_detail("max_amount", max_amount));
            }
        }

        if let Some(allowed) = &intent.constraints.categories {
            for item in &cart.items {
                if let Some(category) = &item.category {
                    if !allowed.contains(category) {
                        return Err(constraint_violation(
                            "item category outside intent constraints",
                            &cart.id,
                            &item.id,
                            "category",
                            category,
                        ));
                    }
                }
            }
        }

        if let Some(allowed) = &intent.constraints.brands {
            for item in &cart.items {
                if let Some(brand) = &item.brand {
                    if !allowed.contains(brand) {
                        return Err(constraint_violation(
                            "item brand outside intent constraints",
                            &cart.id,
                            &item.id,
                            "brand",
                            brand,
                        ));
                    }
                }
            }
        }

        if let Some(merchants) = &intent.constraints.merchants {
            if !merchants.contains(&cart.merchant_id) {
                return Err(ProtocolError::new(
                    ErrorCode::ConstraintViolation,
                    "merchant outside intent constraints",
                )
                .with_detail("cart_mandate_id", &cart.id)
                .with_detail("merchant_id", &cart.merchant_id));
            }
        }

        if let Some(meta) = &cart.mandate_metadata {
            if let Some(previous) = &meta.previous_mandate_hash {
                if *previous != intent_hash {
                    return Err(ProtocolError::new(
                        ErrorCode::InvalidMandateChain,
                        "cart metadata does not chain back to the intent",
                    )
                    .with_detail("cart_mandate_id", &cart.id)
                    .with_detail("expected", &intent_hash)
                    .with_detail("actual", previous));
                }
            }
        }
        self.check_metadata_hash(cart.mandate_metadata.as_ref(), mandate_hash(cart), &cart.id)?;

        Ok(())
    }

    /// Verify a payment mandate against its cart and intent.
    pub fn verify_payment(
        &self,
        payment: &PaymentMandate,
        cart: &CartMandate,
        intent: &IntentMandate,
        now: DateTime<Utc>,
    ) -> Result<(), ProtocolError> {
        let signature = payment.user_signature.as_ref().ok_or_else(|| {
            ProtocolError::new(ErrorCode::MissingSignature, "payment has no user signature")
                .with_detail("payment_mandate_id", &payment.id)
        })?;
        verify_payload(
            payment,
            PaymentMandate::SIGNING_EXCLUSIONS,
            signature,
            self.resolver.as_ref(),
        )
        .map_err(|e| signature_error(e, "payment_mandate_id", &payment.id))?;

        if payment.is_expired(now) {
            return Err(ProtocolError::expired(
                ErrorCode::ExpiredPayment,
                &payment.id,
                &payment.expires_at.to_rfc3339(),
            ));
        }

        if payment.cart_mandate_id != cart.id {
            return Err(chain_error(
                "payment does not reference this cart",
                &payment.id,
                &cart.id,
                &payment.cart_mandate_id,
            ));
        }
        if payment.intent_mandate_id != intent.id {
            return Err(chain_error(
                "payment does not reference this intent",
                &payment.id,
                &intent.id,
                &payment.intent_mandate_id,
            ));
        }

        if !payment.amount.eq_exact(&cart.total) {
            return Err(ProtocolError::new(
                ErrorCode::InvalidAmount,
                "payment amount does not equal cart total",
            )
            .with_detail("payment_amount", &payment.amount)
            .with_detail("cart_total", &cart.total));
        }

        let merchant_signature = payment.merchant_signature.as_ref().ok_or_else(|| {
            ProtocolError::new(
                ErrorCode::MissingSignature,
                "payment carries no inherited merchant signature",
            )
            .with_detail("payment_mandate_id", &payment.id)
        })?;
        if Some(merchant_signature) != cart.merchant_signature.as_ref() {
            return Err(ProtocolError::new(
                ErrorCode::InvalidSignature,
                "inherited merchant signature differs from the cart's",
            )
            .with_detail("payment_mandate_id", &payment.id));
        }

        let cart_hash = mandate_hash(cart).map_err(internal_crypto)?;
        if payment.cart_mandate_hash != cart_hash {
            return Err(ProtocolError::new(
                ErrorCode::InvalidMandateChain,
                "payment's cart hash does not match the cart's canonical form",
            )
            .with_detail("payment_mandate_id", &payment.id)
            .with_detail("expected", &cart_hash)
            .with_detail("actual", &payment.cart_mandate_hash));
        }
        let intent_hash = mandate_hash(intent).map_err(internal_crypto)?;
        if payment.intent_mandate_hash != intent_hash {
            return Err(ProtocolError::new(
                ErrorCode::InvalidMandateChain,
                "payment's intent hash does not match the intent's canonical form",
            )
            .with_detail("payment_mandate_id", &payment.id)
            .with_detail("expected", &intent_hash)
            .with_detail("actual", &payment.intent_mandate_hash));
        }

        if let Some(attestation) = &payment.device_attestation {
            attestation
                .verify(
                    &payment.id,
                    Duration::seconds(ATTESTATION_MAX_AGE_SECONDS),
                    now,
                )
                .map_err(|e| {
                    ProtocolError::new(
                        ErrorCode::InvalidSignature,
                        "device attestation failed re-verification",
                    )
                    .with_detail("payment_mandate_id", &payment.id)
                    .with_detail("reason", e.to_string())
                })?;
        }

        if let Some(token) = &payment.user_authorization {
            let expected = user_authorization_token(cart, payment).map_err(internal_crypto)?;
            if *token != expected {
                return Err(ProtocolError::new(
                    ErrorCode::InvalidMandateChain,
                    "user authorization token does not bind this cart and payment",
                )
                .with_detail("payment_mandate_id", &payment.id));
            }
        }

        // A payment already in the ledger re-verifies cleanly (challenge
        // completion re-runs the chain); only a NEW payment can exhaust the
        // budget.
        let recorded = self.ledger.payments_for_intent(&intent.id)?;
        if !recorded.iter().any(|p| p == &payment.id)
            && recorded.len() as u32 >= intent.constraints.max_transactions
        {
            return Err(ProtocolError::new(
                ErrorCode::ConstraintViolation,
                "intent max_transactions exhausted",
            )
            .with_detail("intent_mandate_id", &intent.id)
            .with_detail("max_transactions", intent.constraints.max_transactions)
            .with_detail("current_transactions", recorded.len() as u32));
        }

        Ok(())
    }

    /// Verify the full chain and, on success, record the payment in the
    /// intent ledger.
    pub fn verify_chain(
        &self,
        payment: &PaymentMandate,
        cart: &CartMandate,
        intent: &IntentMandate,
        now: DateTime<Utc>,
    ) -> Result<(), ProtocolError> {
        self.verify_intent(intent, now)?;
        self.verify_cart(cart, intent, now)?;
        self.verify_payment(payment, cart, intent, now)?;

        self.ledger
            .record(&intent.id, &payment.id, intent.constraints.max_transactions)?;
        tracing::info!(
            intent_mandate_id = %intent.id,
            cart_mandate_id = %cart.id,
            payment_mandate_id = %payment.id,
            "mandate chain verified"
        );
        Ok(())
    }

    fn check_metadata_hash(
        &self,
        metadata: Option<&ap2_mandate::MandateMetadata>,
        computed: Result<String, CryptoError>,
        mandate_id: &str,
    ) -> Result<(), ProtocolError> {
        let Some(meta) = metadata else {
            return Ok(());
        };
        if meta.mandate_hash.is_empty() {
            return Ok(());
        }
        let computed = computed.map_err(internal_crypto)?;
        if meta.mandate_hash != computed {
            return Err(ProtocolError::new(
                ErrorCode::InvalidMandateChain,
                "stored mandate_hash does not match canonical form",
            )
            .with_detail("mandate_id", mandate_id)
            .with_detail("expected", &computed)
            .with_detail("actual", &meta.mandate_hash));
        }
        Ok(())
    }
}

fn signature_error(e: CryptoError, id_key: &str, id: &str) -> ProtocolError {
    let code = match &e {
        CryptoError::PublicKeyResolutionFailed { .. } => ErrorCode::PublicKeyUnresolvable,
        CryptoError::UnknownAlgorithm { .. } => ErrorCode::UnknownAlgorithm,
        _ => ErrorCode::InvalidSignature,
    };
    ProtocolError::new(code, "signature verification failed")
        .with_detail(id_key, id)
        .with_detail("reason", e.to_string())
}

fn chain_error(message: &str, mandate_id: &str, expected: &str, actual: &str) -> ProtocolError {
    ProtocolError::new(ErrorCode::InvalidMandateChain, message)
        .with_detail("mandate_id", mandate_id)
        .with_detail("expected", expected)
        .with_detail("actual", actual)
}

fn constraint_violation(
    message: &str,
    cart_id: &str,
    item_id: &str,
    field: &str,
    value: &str,
) -> ProtocolError {
    ProtocolError::new(ErrorCode::ConstraintViolation, message)
        .with_detail("cart_mandate_id", cart_id)
        .with_detail("item_id", item_id)
        .with_detail(field, value)
}

fn internal_crypto(e: CryptoError) -> ProtocolError {
    ProtocolError::new(ErrorCode::InternalError, "canonicalization failed")
        .with_detail("reason", e.to_string())
}
