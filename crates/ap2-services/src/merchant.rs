//! The merchant: the legal seller.
//!
//! Validates unsigned carts drafted by the merchant agent, reserves
//! inventory, and signs. Signing is idempotent per cart id - the second
//! request for the same cart returns the original signed bytes, it does
//! not reserve twice. In manual-approval mode carts park as
//! `pending_merchant_signature` until an operator accepts or rejects;
//! tentative reservations are released on rejection or expiry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};

use ap2_common::{ErrorCode, ProtocolError};
use ap2_a2a::{types, Artifact, HandlerOutcome, MessageHandler};
use ap2_mandate::crypto::keys::AgentKeys;
use ap2_mandate::crypto::sign::{sign_payload, SignatureAlgorithm};
use ap2_mandate::{AuditEntry, CartMandate, Hashable as _, MandateMetadata};

use crate::http::protocol_error_response;
use crate::wire::{CartStatus, CartStatusResponse};

/// Longest cart validity window the merchant will sign.
const MAX_CART_TTL_SECONDS: i64 = 3600;

/// Outcome of a sign request.
#[derive(Debug, Clone)]
pub enum SignOutcome {
    Signed(CartMandate),
    Pending { cart_mandate_id: String },
}

enum CartRecord {
    Pending {
        cart: CartMandate,
        reserved: Vec<(String, u32)>,
    },
    Signed(CartMandate),
    Rejected,
}

struct MerchantState {
    inventory: HashMap<String, u32>,
    carts: HashMap<String, CartRecord>,
}

/// One merchant identity with its inventory commitments.
pub struct MerchantService {
    merchant_id: String,
    did: String,
    keys: Arc<AgentKeys>,
    manual_approval: bool,
    max_cart_ttl: Duration,
    state: Mutex<MerchantState>,
}

impl MerchantService {
    pub fn new(
        merchant_id: impl Into<String>,
        did: impl Into<String>,
        keys: Arc<AgentKeys>,
        manual_approval: bool,
    ) -> Self {
        Self {
            merchant_id: merchant_id.into(),
            did: did.into(),
            keys,
            manual_approval,
            max_cart_ttl: Duration::seconds(MAX_CART_TTL_SECONDS),
            state: Mutex::new(MerchantState {
                inventory: HashMap::new(),
                carts: HashMap::new(),
            }),
        }
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    pub fn merchant_id(&self) -> &str {
        &self.merchant_id
    }

    /// Register or replace stock for a product.
    pub fn stock(&self, product_id: &str, quantity: u32) {
        let mut state = self.state.lock().expect("merchant mutex poisoned");
        state.inventory.insert(product_id.to_string(), quantity);
    }

    pub fn available(&self, product_id: &str) -> u32 {
        let state = self.state.lock().expect("merchant mutex poisoned");
        state.inventory.get(product_id).copied().unwrap_or(0)
    }

    /// Validate and sign an unsigned cart (or park it for manual approval).
    ///
    /// Inventory is decremented atomically with the decision; two
    /// concurrent requests for the same cart id serialize on the state
    /// mutex and the loser sees the recorded outcome.
    pub fn sign_cart(&self, cart: CartMandate) -> Result<SignOutcome, ProtocolError> {
        let now = Utc::now();
        let mut state = self.state.lock().expect("merchant mutex poisoned");

        if let Some(record) = state.carts.get(&cart.id) {
            return match record {
                CartRecord::Signed(signed) => Ok(SignOutcome::Signed(signed.clone())),
                CartRecord::Pending { cart, .. } => Ok(SignOutcome::Pending {
                    cart_mandate_id: cart.id.clone(),
                }),
                CartRecord::Rejected => Err(ProtocolError::new(
                    ErrorCode::CartRejected,
                    "cart was rejected",
                )
                .with_detail("cart_mandate_id", &cart.id)),
            };
        }

        self.validate(&cart, now, &state)?;

        // Tentative reservation, atomic with the decision above.
        let mut reserved = Vec::new();
        for item in &cart.items {
            let stock = state
                .inventory
                .get_mut(&item.id)
                .expect("validated items exist in inventory");
            *stock -= item.quantity;
            reserved.push((item.id.clone(), item.quantity));
        }

        if self.manual_approval {
            tracing::info!(cart_mandate_id = %cart.id, "cart parked for operator approval");
            let id = cart.id.clone();
            state
                .carts
                .insert(id.clone(), CartRecord::Pending { cart, reserved });
            return Ok(SignOutcome::Pending {
                cart_mandate_id: id,
            });
        }

        let signed = self.sign_now(cart)?;
        state
            .carts
            .insert(signed.id.clone(), CartRecord::Signed(signed.clone()));
        Ok(SignOutcome::Signed(signed))
    }

    /// Operator acceptance of a pending cart.
    pub fn approve(&self, cart_mandate_id: &str) -> Result<CartMandate, ProtocolError> {
        let mut state = self.state.lock().expect("merchant mutex poisoned");
        match state.carts.remove(cart_mandate_id) {
            Some(CartRecord::Pending { cart, reserved }) => match self.sign_now(cart) {
                Ok(signed) => {
                    state
                        .carts
                        .insert(signed.id.clone(), CartRecord::Signed(signed.clone()));
                    Ok(signed)
                }
                Err(error) => {
                    // Release the reservation rather than leave it half-signed.
                    for (product_id, quantity) in reserved {
                        *state.inventory.entry(product_id).or_insert(0) += quantity;
                    }
                    state
                        .carts
                        .insert(cart_mandate_id.to_string(), CartRecord::Rejected);
                    Err(error)
                }
            },
            Some(CartRecord::Signed(signed)) => {
                state
                    .carts
                    .insert(cart_mandate_id.to_string(), CartRecord::Signed(signed.clone()));
                Ok(signed)
            }
            Some(CartRecord::Rejected) => {
                state
                    .carts
                    .insert(cart_mandate_id.to_string(), CartRecord::Rejected);
                Err(
                    ProtocolError::new(ErrorCode::CartRejected, "cart was rejected")
                        .with_detail("cart_mandate_id", cart_mandate_id),
                )
            }
            None => Err(ProtocolError::new(
                ErrorCode::InvalidRequest,
                "unknown cart mandate",
            )
            .with_detail("cart_mandate_id", cart_mandate_id)),
        }
    }

    /// Operator rejection: releases the tentative reservation.
    pub fn reject(&self, cart_mandate_id: &str) -> Result<(), ProtocolError> {
        let mut state = self.state.lock().expect("merchant mutex poisoned");
        match state.carts.remove(cart_mandate_id) {
            Some(CartRecord::Pending { reserved, .. }) => {
                for (product_id, quantity) in reserved {
                    *state.inventory.entry(product_id).or_insert(0) += quantity;
                }
                state
                    .carts
                    .insert(cart_mandate_id.to_string(), CartRecord::Rejected);
                tracing::info!(cart_mandate_id, "cart rejected, reservation released");
                Ok(())
            }
            Some(record) => {
                state.carts.insert(cart_mandate_id.to_string(), record);
                Err(ProtocolError::new(
                    ErrorCode::InvalidRequest,
                    "only pending carts can be rejected",
                )
                .with_detail("cart_mandate_id", cart_mandate_id))
            }
            None => Err(ProtocolError::new(
                ErrorCode::InvalidRequest,
                "unknown cart mandate",
            )
            .with_detail("cart_mandate_id", cart_mandate_id)),
        }
    }

    /// Ids of carts awaiting operator approval.
    pub fn pending_carts(&self) -> Vec<String> {
        let state = self.state.lock().expect("merchant mutex poisoned");
        state
            .carts
            .iter()
            .filter_map(|(id, record)| match record {
                CartRecord::Pending { .. } => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Cart lifecycle lookup for `GET /cart-mandates/{id}`.
    pub fn status(&self, cart_mandate_id: &str) -> Option<CartStatusResponse> {
        let state = self.state.lock().expect("merchant mutex poisoned");
        state.carts.get(cart_mandate_id).map(|record| match record {
            CartRecord::Pending { .. } => CartStatusResponse {
                status: CartStatus::PendingMerchantSignature,
                payload: None,
            },
            CartRecord::Signed(cart) => CartStatusResponse {
                status: CartStatus::Signed,
                payload: Some(cart.clone()),
            },
            CartRecord::Rejected => CartStatusResponse {
                status: CartStatus::Rejected,
                payload: None,
            },
        })
    }

    /// Release reservations held by pending carts that have expired.
    pub fn release_expired(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock().expect("merchant mutex poisoned");
        let expired: Vec<String> = state
            .carts
            .iter()
            .filter_map(|(id, record)| match record {
                CartRecord::Pending { cart, .. } if cart.is_expired(now) => Some(id.clone()),
                _ => None,
            })
            .collect();

        for id in expired {
            if let Some(CartRecord::Pending { reserved, .. }) = state.carts.remove(&id) {
                for (product_id, quantity) in reserved {
                    *state.inventory.entry(product_id).or_insert(0) += quantity;
                }
                state.carts.insert(id.clone(), CartRecord::Rejected);
                tracing::info!(cart_mandate_id = %id, "expired pending cart released");
            }
        }
    }

    fn validate(
        &self,
        cart: &CartMandate,
        now: DateTime<Utc>,
        state: &MerchantState,
    ) -> Result<(), ProtocolError> {
        if cart.merchant_id != self.merchant_id {
            return Err(ProtocolError::new(
                ErrorCode::MerchantUnknown,
                "cart names a different merchant",
            )
            .with_detail("expected", &self.merchant_id)
            .with_detail("actual", &cart.merchant_id));
        }

        // Aggregate per product so duplicate line items cannot slip past
        // the stock check.
        let mut requested: HashMap<&str, u32> = HashMap::new();
        for item in &cart.items {
            *requested.entry(item.id.as_str()).or_insert(0) += item.quantity;
        }
        for (product_id, quantity) in requested {
            let stock = state.inventory.get(product_id).copied().unwrap_or(0);
            if stock < quantity {
                return Err(ProtocolError::new(
                    ErrorCode::InsufficientInventory,
                    "not enough stock for item",
                )
                .with_detail("item_id", product_id)
                .with_detail("requested", quantity)
                .with_detail("available", stock));
            }
        }

        cart.verify_arithmetic()?;

        if cart.is_expired(now) {
            return Err(ProtocolError::expired(
                ErrorCode::ExpiredCart,
                &cart.id,
                &cart.expires_at.to_rfc3339(),
            ));
        }
        let ttl = cart.expires_at - cart.created_at;
        if ttl > self.max_cart_ttl {
            return Err(ProtocolError::new(
                ErrorCode::InvalidRequest,
                "cart validity window too long",
            )
            .with_detail("cart_mandate_id", &cart.id)
            .with_detail("ttl_seconds", ttl.num_seconds())
            .with_detail("max_ttl_seconds", self.max_cart_ttl.num_seconds()));
        }

        Ok(())
    }

    /// Attach chain metadata, seal, and sign.
    fn sign_now(&self, mut cart: CartMandate) -> Result<CartMandate, ProtocolError> {
        let mut metadata =
            MandateMetadata::issue(&self.did, Some(cart.intent_mandate_hash.clone()));
        metadata.record(AuditEntry {
            action: "merchant_signature".to_string(),
            signer_id: self.merchant_id.clone(),
            signed_at: Utc::now(),
            signature_algorithm: SignatureAlgorithm::EcdsaP256Sha256,
            mandate_type: CartMandate::MANDATE_TYPE.to_string(),
            inherited_from: None,
        });
        cart.mandate_metadata = Some(metadata);
        cart.seal_metadata().map_err(internal)?;

        let signature = sign_payload(
            &cart,
            CartMandate::SIGNING_EXCLUSIONS,
            &self.keys,
            SignatureAlgorithm::EcdsaP256Sha256,
        )
        .map_err(internal)?;
        cart.merchant_signature = Some(signature);

        tracing::info!(
            cart_mandate_id = %cart.id,
            total = %cart.total,
            "cart signed"
        );
        Ok(cart)
    }

    /// Register the merchant's A2A surface: sign requests.
    pub fn register_handlers(self: &Arc<Self>, handler: &mut MessageHandler) {
        let service = Arc::clone(self);
        handler.register_fn(types::CART_MANDATE, move |message| {
            let service = Arc::clone(&service);
            async move {
                let cart: CartMandate = serde_json::from_value(message.data_part.payload.clone())
                    .map_err(|e| {
                    ProtocolError::new(ErrorCode::InvalidRequest, "payload is not a cart mandate")
                        .with_detail("reason", e.to_string())
                })?;
                let cart_id = cart.id.clone();

                match service.sign_cart(cart)? {
                    SignOutcome::Signed(signed) => {
                        let artifact = Artifact::wrap(
                            "signed_cart_mandate",
                            types::CART_MANDATE,
                            serde_json::to_value(&signed).map_err(|e| {
                                ProtocolError::new(ErrorCode::InternalError, "serialization failed")
                                    .with_detail("reason", e.to_string())
                            })?,
                        );
                        Ok(HandlerOutcome::new(
                            types::SIGNED_CART_MANDATE,
                            cart_id,
                            serde_json::to_value(artifact).unwrap_or_default(),
                        ))
                    }
                    SignOutcome::Pending { cart_mandate_id } => Ok(HandlerOutcome::new(
                        types::CART_MANDATE_PENDING,
                        cart_mandate_id.clone(),
                        serde_json::json!({ "cart_mandate_id": cart_mandate_id }),
                    )),
                }
            }
        });
    }
}

fn internal(e: ap2_mandate::CryptoError) -> ProtocolError {
    ProtocolError::new(ErrorCode::InternalError, "signing failed")
        .with_detail("reason", e.to_string())
}

/// Merchant-specific HTTP routes, merged with the common A2A router.
pub fn merchant_router(service: Arc<MerchantService>) -> Router {
    Router::new()
        .route("/sign/cart", post(sign_cart_endpoint))
        .route("/cart-mandates/:id", get(cart_status_endpoint))
        .route("/cart-mandates/:id/approve", post(approve_endpoint))
        .route("/cart-mandates/:id/reject", post(reject_endpoint))
        .with_state(service)
}

async fn sign_cart_endpoint(
    State(service): State<Arc<MerchantService>>,
    Json(cart): Json<CartMandate>,
) -> Response {
    match service.sign_cart(cart) {
        Ok(SignOutcome::Signed(signed)) => Json(CartStatusResponse {
            status: CartStatus::Signed,
            payload: Some(signed),
        })
        .into_response(),
        Ok(SignOutcome::Pending { .. }) => Json(CartStatusResponse {
            status: CartStatus::PendingMerchantSignature,
            payload: None,
        })
        .into_response(),
        Err(error) => protocol_error_response(error),
    }
}

async fn cart_status_endpoint(
    State(service): State<Arc<MerchantService>>,
    Path(id): Path<String>,
) -> Response {
    match service.status(&id) {
        Some(status) => Json(status).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn approve_endpoint(
    State(service): State<Arc<MerchantService>>,
    Path(id): Path<String>,
) -> Response {
    match service.approve(&id) {
        Ok(signed) => Json(signed).into_response(),
        Err(error) => protocol_error_response(error),
    }
}

async fn reject_endpoint(
    State(service): State<Arc<MerchantService>>,
    Path(id): Path<String>,
) -> Response {
    match service.reject(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => protocol_error_response(error),
    }
}
