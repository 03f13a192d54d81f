//! The credential provider: stores payment instruments and issues tokens.
//!
//! The vault never leaks a PAN - listings expose brand/last4/expiry only,
//! and the processor sees a short-lived token plus a credentials envelope.
//! High-risk credential requests are gated behind a one-time password; the
//! threshold is configurable and must sit at or below the risk engine's
//! decline threshold (80), default 60.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::Deserialize;

use ap2_common::{ErrorCode, ProtocolError};
use ap2_a2a::{types, HandlerOutcome, MessageHandler};
use ap2_mandate::crypto::keys::AgentKeys;
use ap2_mandate::crypto::sign::verify_payload;
use ap2_mandate::{InlinePublicKeyResolver, PaymentMandate};

use crate::http::protocol_error_response;
use crate::wire::{
    AttestationVerifyRequest, CredentialRequest, CredentialsEnvelope, PaymentMethodSummary,
    TokenGrant, TokenizeRequest,
};

/// Token lifetime.
const TOKEN_TTL_MINUTES: i64 = 15;

/// Attestation freshness window.
const ATTESTATION_MAX_AGE_SECONDS: i64 = 300;

/// Demo-accepted one-time password.
const DEMO_OTP: &str = "123456";

/// A stored instrument. The PAN itself never exists in this reference
/// implementation; real deployments would hold it in an HSM-backed vault.
#[derive(Debug, Clone)]
pub struct StoredMethod {
    pub method_id: String,
    pub user_id: String,
    pub brand: String,
    pub last4: String,
    pub expiry_month: u8,
    pub expiry_year: u16,
    pub holder_name: String,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

struct TokenEntry {
    method_id: String,
    user_id: String,
    expires_at: DateTime<Utc>,
}

struct CpState {
    methods: HashMap<String, StoredMethod>,
    tokens: HashMap<String, TokenEntry>,
}

/// One credential provider identity.
pub struct CredentialProviderService {
    provider_id: String,
    did: String,
    #[allow(dead_code)]
    keys: Arc<AgentKeys>,
    high_risk_threshold: u8,
    state: Mutex<CpState>,
}

impl CredentialProviderService {
    /// `high_risk_threshold` gates OTP challenges; it must not exceed the
    /// risk engine's decline threshold (80).
    pub fn new(
        provider_id: impl Into<String>,
        did: impl Into<String>,
        keys: Arc<AgentKeys>,
        high_risk_threshold: u8,
    ) -> Self {
        assert!(
            high_risk_threshold <= 80,
            "OTP threshold must not exceed the decline threshold"
        );
        Self {
            provider_id: provider_id.into(),
            did: did.into(),
            keys,
            high_risk_threshold,
            state: Mutex::new(CpState {
                methods: HashMap::new(),
                tokens: HashMap::new(),
            }),
        }
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    /// Store an instrument for a user; returns its stable `method_id`.
    #[allow(clippy::too_many_arguments)]
    pub fn register_method(
        &self,
        user_id: &str,
        brand: &str,
        last4: &str,
        expiry_month: u8,
        expiry_year: u16,
        holder_name: &str,
        is_default: bool,
    ) -> String {
        let method_id = format!("pm_{}", random_token_bytes(16));
        let mut state = self.state.lock().expect("cp mutex poisoned");
        state.methods.insert(
            method_id.clone(),
            StoredMethod {
                method_id: method_id.clone(),
                user_id: user_id.to_string(),
                brand: brand.to_string(),
                last4: last4.to_string(),
                expiry_month,
                expiry_year,
                holder_name: holder_name.to_string(),
                is_default,
                created_at: Utc::now(),
                last_used_at: None,
            },
        );
        tracing::info!(user_id, method_id = %method_id, "payment method registered");
        method_id
    }

    /// A user's stored methods, defaults first. Never includes a PAN.
    pub fn list(&self, user_id: &str) -> Vec<PaymentMethodSummary> {
        let state = self.state.lock().expect("cp mutex poisoned");
        let mut methods: Vec<&StoredMethod> = state
            .methods
            .values()
            .filter(|m| m.user_id == user_id)
            .collect();
        methods.sort_by(|a, b| {
            b.is_default
                .cmp(&a.is_default)
                .then(a.created_at.cmp(&b.created_at))
        });
        methods
            .into_iter()
            .map(|m| PaymentMethodSummary {
                method_id: m.method_id.clone(),
                brand: m.brand.clone(),
                last4: m.last4.clone(),
                expiry_month: m.expiry_month,
                expiry_year: m.expiry_year,
                is_default: m.is_default,
            })
            .collect()
    }

    /// Mint a short-lived token for one stored method. A method may hold
    /// several live tokens at once.
    pub fn tokenize(&self, user_id: &str, method_id: &str) -> Result<TokenGrant, ProtocolError> {
        let mut state = self.state.lock().expect("cp mutex poisoned");
        let method = state.methods.get_mut(method_id).ok_or_else(|| {
            ProtocolError::new(ErrorCode::InvalidRequest, "unknown payment method")
                .with_detail("method_id", method_id)
        })?;
        if method.user_id != user_id {
            return Err(
                ProtocolError::new(ErrorCode::InvalidRequest, "method belongs to another user")
                    .with_detail("method_id", method_id),
            );
        }
        method.last_used_at = Some(Utc::now());

        let token = format!("tok_{}", random_token_bytes(32));
        let expires_at = Utc::now() + Duration::minutes(TOKEN_TTL_MINUTES);
        state.tokens.insert(
            token.clone(),
            TokenEntry {
                method_id: method_id.to_string(),
                user_id: user_id.to_string(),
                expires_at,
            },
        );
        tracing::debug!(user_id, method_id, "token minted");
        Ok(TokenGrant { token, expires_at })
    }

    /// Redeem a payment mandate for network credentials.
    ///
    /// Verifies the user signature, applies the risk gate, and resolves the
    /// token back to the stored method. The cryptogram is a random 128-bit
    /// hex stand-in for a network cryptogram.
    pub fn request_payment_credentials(
        &self,
        payment: &PaymentMandate,
        otp: Option<&str>,
    ) -> Result<CredentialsEnvelope, ProtocolError> {
        let signature = payment.user_signature.as_ref().ok_or_else(|| {
            ProtocolError::new(ErrorCode::MissingSignature, "payment has no user signature")
                .with_detail("payment_mandate_id", &payment.id)
        })?;
        verify_payload(
            payment,
            PaymentMandate::SIGNING_EXCLUSIONS,
            signature,
            &InlinePublicKeyResolver,
        )
        .map_err(|e| {
            ProtocolError::new(ErrorCode::InvalidSignature, "payment signature invalid")
                .with_detail("payment_mandate_id", &payment.id)
                .with_detail("reason", e.to_string())
        })?;

        let risk_score = payment.risk_score.unwrap_or(0);
        if risk_score >= self.high_risk_threshold {
            let Some(otp) = otp else {
                return Err(ProtocolError::new(
                    ErrorCode::ChallengeRequired,
                    "high-risk transaction requires a one-time password",
                )
                .with_detail("payment_mandate_id", &payment.id)
                .with_detail("risk_score", risk_score));
            };
            if otp != DEMO_OTP {
                return Err(ProtocolError::new(
                    ErrorCode::OtpInvalid,
                    "one-time password rejected",
                )
                .with_detail("payment_mandate_id", &payment.id));
            }
            tracing::info!(payment_mandate_id = %payment.id, risk_score, "OTP accepted");
        }

        let token = &payment.payment_method.token;
        if token.is_empty() {
            return Err(ProtocolError::new(
                ErrorCode::InvalidRequest,
                "payment method carries no token",
            )
            .with_detail("payment_mandate_id", &payment.id));
        }

        let state = self.state.lock().expect("cp mutex poisoned");
        let entry = state.tokens.get(token).ok_or_else(|| {
            ProtocolError::new(ErrorCode::InvalidRequest, "unknown payment token")
                .with_detail("payment_mandate_id", &payment.id)
        })?;
        if entry.expires_at < Utc::now() {
            return Err(ProtocolError::new(
                ErrorCode::TokenExpired,
                "payment token expired",
            )
            .with_detail("payment_mandate_id", &payment.id));
        }
        if entry.user_id != payment.payer_id {
            return Err(ProtocolError::new(
                ErrorCode::InvalidRequest,
                "token does not belong to the payer",
            )
            .with_detail("payment_mandate_id", &payment.id));
        }
        let method = state.methods.get(&entry.method_id).ok_or_else(|| {
            ProtocolError::new(ErrorCode::InternalError, "token maps to a missing method")
        })?;

        Ok(CredentialsEnvelope {
            card_brand: method.brand.clone(),
            last4: method.last4.clone(),
            expiry_month: method.expiry_month,
            expiry_year: method.expiry_year,
            holder_name: method.holder_name.clone(),
            cryptogram: random_cryptogram(),
            token: token.clone(),
            provider_id: self.provider_id.clone(),
        })
    }

    /// Re-verify a device attestation against a payment mandate id.
    pub fn verify_device_attestation(
        &self,
        request: &AttestationVerifyRequest,
    ) -> Result<(), ProtocolError> {
        request
            .attestation
            .verify(
                &request.payment_mandate_id,
                Duration::seconds(ATTESTATION_MAX_AGE_SECONDS),
                Utc::now(),
            )
            .map_err(|e| {
                ProtocolError::new(
                    ErrorCode::InvalidSignature,
                    "device attestation verification failed",
                )
                .with_detail("payment_mandate_id", &request.payment_mandate_id)
                .with_detail("reason", e.to_string())
            })
    }

    /// Drop expired tokens.
    pub fn sweep_tokens(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock().expect("cp mutex poisoned");
        state.tokens.retain(|_, entry| entry.expires_at > now);
    }

    /// Register the provider's A2A surface: credential requests.
    pub fn register_handlers(self: &Arc<Self>, handler: &mut MessageHandler) {
        let service = Arc::clone(self);
        handler.register_fn(types::PAYMENT_MANDATE, move |message| {
            let service = Arc::clone(&service);
            async move {
                let request: CredentialRequest =
                    serde_json::from_value(message.data_part.payload.clone()).map_err(|e| {
                        ProtocolError::new(
                            ErrorCode::InvalidRequest,
                            "payload is not a credential request",
                        )
                        .with_detail("reason", e.to_string())
                    })?;
                let credentials = service.request_payment_credentials(
                    &request.payment_mandate,
                    request.otp.as_deref(),
                )?;
                Ok(HandlerOutcome::new(
                    types::SIGNATURE_RESPONSE,
                    request.payment_mandate.id.clone(),
                    serde_json::to_value(&credentials).unwrap_or_default(),
                ))
            }
        });
    }
}

fn random_token_bytes(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn random_cryptogram() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Deserialize)]
struct ListQuery {
    user_id: String,
}

/// Credential-provider HTTP routes, merged with the common A2A router.
pub fn credential_provider_router(service: Arc<CredentialProviderService>) -> Router {
    Router::new()
        .route("/payment-methods", get(list_endpoint))
        .route("/payment-methods/tokenize", post(tokenize_endpoint))
        .route("/verify/attestation", post(attestation_endpoint))
        .with_state(service)
}

async fn list_endpoint(
    State(service): State<Arc<CredentialProviderService>>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<PaymentMethodSummary>> {
    Json(service.list(&query.user_id))
}

async fn tokenize_endpoint(
    State(service): State<Arc<CredentialProviderService>>,
    Json(request): Json<TokenizeRequest>,
) -> Response {
    match service.tokenize(&request.user_id, &request.method_id) {
        Ok(grant) => Json(grant).into_response(),
        Err(error) => protocol_error_response(error),
    }
}

async fn attestation_endpoint(
    State(service): State<Arc<CredentialProviderService>>,
    Json(request): Json<AttestationVerifyRequest>,
) -> Response {
    match service.verify_device_attestation(&request) {
        Ok(()) => Json(serde_json::json!({"valid": true})).into_response(),
        Err(error) => protocol_error_response(error),
    }
}
