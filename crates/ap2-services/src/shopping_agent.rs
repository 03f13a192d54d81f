//! The shopping agent: acts for the user and drives the flow.
//!
//! The agent never holds user key material. Intent and payment signatures
//! come from a [`UserAuthenticator`] seam (WebAuthn in a real deployment,
//! a local key pair in the reference), and are attached verbatim - the
//! agent cannot mint a user signature itself.
//!
//! The purchase flow surfaces structured [`ChatEvent`]s so a UI can follow
//! along: search narration, the signature request, cart options, the
//! WebAuthn challenge, payment method selection, then `done` or `error`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use uuid::Uuid;

use ap2_common::{ErrorCode, ProtocolError};
use ap2_mandate::crypto::keys::AgentKeys;
use ap2_mandate::crypto::sign::{sign_payload, Signature, SignatureAlgorithm};
use ap2_mandate::mandate::hash::mandate_hash;
use ap2_mandate::mandate::payment::user_authorization_token;
use ap2_mandate::{
    AttestationType, AuditEntry, CartMandate, DeviceAttestation, Hashable as _,
    IntentConstraints, IntentMandate, MandateMetadata, PaymentMandate, PaymentMethod,
    TransactionType,
};
use ap2_verifier::{Recommendation, RiskEngine};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::events::{emit, ChatEvent, EventSender};
use crate::wire::{
    CartCandidate, PaymentMethodSummary, PaymentRequest, TokenGrant, TransactionResult,
};

/// Payment mandate validity window.
const PAYMENT_TTL_MINUTES: i64 = 15;

/// Intent validity window.
const INTENT_TTL_HOURS: i64 = 24;

/// The user's signing device. Signatures are produced off-band and
/// attached verbatim; the reference implementation backs this with a local
/// P-256 key standing in for a platform authenticator.
pub trait UserAuthenticator: Send + Sync {
    /// base64(SPKI PEM) of the user's passkey public key.
    fn user_public_key(&self) -> Result<String, ProtocolError>;

    fn sign_intent(&self, intent: &IntentMandate) -> Result<Signature, ProtocolError>;

    fn sign_payment(&self, payment: &PaymentMandate) -> Result<Signature, ProtocolError>;

    /// Produce a device attestation for the payment. `challenge` is
    /// supplied when a verifier issued one; otherwise the device generates
    /// its own.
    fn attest(
        &self,
        payment_mandate_id: &str,
        challenge: Option<String>,
    ) -> Result<DeviceAttestation, ProtocolError>;
}

/// Reference authenticator: one local key pair per user device.
pub struct LocalAuthenticator {
    device_id: String,
    keys: AgentKeys,
}

impl LocalAuthenticator {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            keys: AgentKeys::generate(),
        }
    }
}

impl UserAuthenticator for LocalAuthenticator {
    fn user_public_key(&self) -> Result<String, ProtocolError> {
        let pem = self
            .keys
            .public_key_pem(SignatureAlgorithm::EcdsaP256Sha256)
            .map_err(crypto_internal)?;
        Ok(BASE64.encode(pem))
    }

    fn sign_intent(&self, intent: &IntentMandate) -> Result<Signature, ProtocolError> {
        sign_payload(
            intent,
            IntentMandate::SIGNING_EXCLUSIONS,
            &self.keys,
            SignatureAlgorithm::EcdsaP256Sha256,
        )
        .map_err(crypto_internal)
    }

    fn sign_payment(&self, payment: &PaymentMandate) -> Result<Signature, ProtocolError> {
        sign_payload(
            payment,
            PaymentMandate::SIGNING_EXCLUSIONS,
            &self.keys,
            SignatureAlgorithm::EcdsaP256Sha256,
        )
        .map_err(crypto_internal)
    }

    fn attest(
        &self,
        payment_mandate_id: &str,
        challenge: Option<String>,
    ) -> Result<DeviceAttestation, ProtocolError> {
        DeviceAttestation::create(
            self.device_id.clone(),
            payment_mandate_id,
            &self.keys,
            AttestationType::Passkey,
            "iOS",
            challenge,
        )
        .map_err(crypto_internal)
    }
}

fn crypto_internal(e: ap2_mandate::CryptoError) -> ProtocolError {
    ProtocolError::new(ErrorCode::InternalError, "authenticator failure")
        .with_detail("reason", e.to_string())
}

/// Seam to the merchant agent.
#[async_trait]
pub trait MerchantAgentPort: Send + Sync {
    async fn cart_candidates(
        &self,
        intent: &IntentMandate,
    ) -> Result<Vec<CartCandidate>, ProtocolError>;

    async fn submit_payment(
        &self,
        request: PaymentRequest,
    ) -> Result<TransactionResult, ProtocolError>;
}

#[async_trait]
impl MerchantAgentPort for crate::merchant_agent::MerchantAgentService {
    async fn cart_candidates(
        &self,
        intent: &IntentMandate,
    ) -> Result<Vec<CartCandidate>, ProtocolError> {
        crate::merchant_agent::MerchantAgentService::cart_candidates(self, intent).await
    }

    async fn submit_payment(
        &self,
        request: PaymentRequest,
    ) -> Result<TransactionResult, ProtocolError> {
        crate::merchant_agent::MerchantAgentService::submit_payment(self, request).await
    }
}

/// Seam to the credential provider.
#[async_trait]
pub trait CredentialProviderPort: Send + Sync {
    async fn list_methods(
        &self,
        user_id: &str,
    ) -> Result<Vec<PaymentMethodSummary>, ProtocolError>;

    async fn tokenize(&self, user_id: &str, method_id: &str)
        -> Result<TokenGrant, ProtocolError>;
}

#[async_trait]
impl CredentialProviderPort for crate::credential_provider::CredentialProviderService {
    async fn list_methods(
        &self,
        user_id: &str,
    ) -> Result<Vec<PaymentMethodSummary>, ProtocolError> {
        Ok(self.list(user_id))
    }

    async fn tokenize(
        &self,
        user_id: &str,
        method_id: &str,
    ) -> Result<TokenGrant, ProtocolError> {
        crate::credential_provider::CredentialProviderService::tokenize(self, user_id, method_id)
    }
}

/// Seam for waiting out a merchant's manual approval.
#[async_trait]
pub trait MerchantStatusPort: Send + Sync {
    /// Block until the cart is signed or rejected, or the deadline passes.
    async fn wait_for_signature(
        &self,
        cart_mandate_id: &str,
    ) -> Result<CartMandate, ProtocolError>;
}

/// In-process waiter against a co-hosted merchant.
pub struct LocalMerchantStatus {
    pub service: Arc<crate::merchant::MerchantService>,
    pub backoff: std::time::Duration,
    pub deadline: std::time::Duration,
}

#[async_trait]
impl MerchantStatusPort for LocalMerchantStatus {
    async fn wait_for_signature(
        &self,
        cart_mandate_id: &str,
    ) -> Result<CartMandate, ProtocolError> {
        let deadline = tokio::time::Instant::now() + self.deadline;
        loop {
            if let Some(status) = self.service.status(cart_mandate_id) {
                match status.status {
                    crate::wire::CartStatus::Signed => {
                        return status.payload.ok_or_else(|| {
                            ProtocolError::new(
                                ErrorCode::InternalError,
                                "signed cart missing payload",
                            )
                        });
                    }
                    crate::wire::CartStatus::Rejected => {
                        return Err(ProtocolError::new(
                            ErrorCode::CartRejected,
                            "merchant rejected the cart",
                        )
                        .with_detail("cart_mandate_id", cart_mandate_id));
                    }
                    crate::wire::CartStatus::PendingMerchantSignature => {}
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ProtocolError::new(
                    ErrorCode::ExpiredCart,
                    "timed out waiting for merchant signature",
                )
                .with_detail("cart_mandate_id", cart_mandate_id));
            }
            tokio::time::sleep(self.backoff).await;
        }
    }
}

/// Acts for the user: creates the intent, picks a cart, tokenizes,
/// attests, assembles the payment, and surfaces the result.
pub struct ShoppingAgentService {
    did: String,
    #[allow(dead_code)]
    keys: Arc<AgentKeys>,
    merchant_agent: Arc<dyn MerchantAgentPort>,
    credentials: Arc<dyn CredentialProviderPort>,
    merchant_status: Arc<dyn MerchantStatusPort>,
    risk: RiskEngine,
    /// Local view of payments per intent, feeding the risk engine.
    submitted: Mutex<HashMap<String, u32>>,
}

impl ShoppingAgentService {
    pub fn new(
        did: impl Into<String>,
        keys: Arc<AgentKeys>,
        merchant_agent: Arc<dyn MerchantAgentPort>,
        credentials: Arc<dyn CredentialProviderPort>,
        merchant_status: Arc<dyn MerchantStatusPort>,
    ) -> Self {
        Self {
            did: did.into(),
            keys,
            merchant_agent,
            credentials,
            merchant_status,
            risk: RiskEngine::new(),
            submitted: Mutex::new(HashMap::new()),
        }
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    /// Build and sign an intent mandate.
    ///
    /// The user signature comes from the authenticator; the agent only
    /// attaches chain metadata afterwards.
    pub fn create_intent(
        &self,
        authenticator: &dyn UserAuthenticator,
        user_id: &str,
        intent_text: &str,
        constraints: IntentConstraints,
    ) -> Result<IntentMandate, ProtocolError> {
        let now = Utc::now();
        let mut intent = IntentMandate {
            id: short_id("intent"),
            mandate_type: IntentMandate::MANDATE_TYPE.to_string(),
            version: "0.1".to_string(),
            user_id: user_id.to_string(),
            user_public_key: authenticator.user_public_key()?,
            intent: intent_text.to_string(),
            constraints,
            created_at: now,
            expires_at: now + Duration::hours(INTENT_TTL_HOURS),
            user_signature: None,
            mandate_metadata: None,
            agent_signal: None,
            risk_payload: None,
        };

        intent.user_signature = Some(authenticator.sign_intent(&intent)?);
        intent.mandate_metadata = Some(MandateMetadata::issue(&self.did, None));
        intent.seal_metadata().map_err(crypto_internal)?;

        tracing::info!(intent_mandate_id = %intent.id, user_id, "intent created");
        Ok(intent)
    }

    /// Drive one purchase end to end and surface the terminal result.
    pub async fn run_purchase(
        &self,
        authenticator: &dyn UserAuthenticator,
        user_id: &str,
        intent_text: &str,
        constraints: IntentConstraints,
        events: Option<&EventSender>,
        otp: Option<&str>,
    ) -> Result<TransactionResult, ProtocolError> {
        let outcome = self
            .purchase_inner(authenticator, user_id, intent_text, constraints, events, otp)
            .await;
        match &outcome {
            Ok(result) => emit(events, ChatEvent::Done {
                result: result.clone(),
            }),
            Err(error) => emit(events, ChatEvent::Error {
                error: error.clone(),
            }),
        }
        outcome
    }

    /// Submit a payment for an intent and cart already in hand. This is
    /// the path challenge completions and repeat purchases re-enter.
    pub async fn pay_for_cart(
        &self,
        authenticator: &dyn UserAuthenticator,
        user_id: &str,
        intent: &IntentMandate,
        cart: &CartMandate,
        events: Option<&EventSender>,
        otp: Option<&str>,
    ) -> Result<TransactionResult, ProtocolError> {
        // Payment method selection and tokenization.
        let methods = self.credentials.list_methods(user_id).await?;
        emit(events, ChatEvent::PaymentMethodSelection {
            methods: methods.clone(),
        });
        let method = methods.first().ok_or_else(|| {
            ProtocolError::new(ErrorCode::InvalidRequest, "user has no stored payment methods")
                .with_detail("user_id", user_id)
        })?;
        let grant = self.credentials.tokenize(user_id, &method.method_id).await?;

        let payment = self.assemble_payment(
            authenticator,
            user_id,
            intent,
            cart,
            method,
            &grant,
            events,
        )?;

        let result = self
            .merchant_agent
            .submit_payment(PaymentRequest {
                payment_mandate: payment,
                cart_mandate: cart.clone(),
                intent_mandate: intent.clone(),
                otp: otp.map(str::to_string),
            })
            .await?;

        let mut submitted = self.submitted.lock().expect("submitted mutex poisoned");
        *submitted.entry(intent.id.clone()).or_insert(0) += 1;

        Ok(result)
    }

    async fn purchase_inner(
        &self,
        authenticator: &dyn UserAuthenticator,
        user_id: &str,
        intent_text: &str,
        constraints: IntentConstraints,
        events: Option<&EventSender>,
        otp: Option<&str>,
    ) -> Result<TransactionResult, ProtocolError> {
        emit(events, ChatEvent::AgentText {
            text: format!("searching for \"{intent_text}\""),
        });
        emit(events, ChatEvent::SignatureRequest {
            mandate_type: IntentMandate::MANDATE_TYPE.to_string(),
            mandate_id: String::new(),
            payload: serde_json::json!({ "intent": intent_text }),
        });
        let intent = self.create_intent(authenticator, user_id, intent_text, constraints)?;

        let candidates = self.merchant_agent.cart_candidates(&intent).await?;
        emit(events, ChatEvent::CartOptions {
            carts: candidates.iter().map(|c| c.cart().clone()).collect(),
        });

        // Deterministic selection policy: the first candidate. The popular
        // strategy leads, so this is the best-selling in-budget cart.
        let selected = candidates.first().ok_or_else(|| {
            ProtocolError::new(ErrorCode::InvalidRequest, "merchant agent returned no candidates")
        })?;

        let cart = match selected {
            CartCandidate::Signed { cart } => cart.clone(),
            CartCandidate::Pending { cart } => {
                emit(events, ChatEvent::AgentText {
                    text: "waiting for merchant approval".to_string(),
                });
                self.merchant_status.wait_for_signature(&cart.id).await?
            }
        };

        self.pay_for_cart(authenticator, user_id, &intent, &cart, events, otp)
            .await
    }

    /// Assemble, attest, risk-score, and sign the payment mandate.
    #[allow(clippy::too_many_arguments)]
    fn assemble_payment(
        &self,
        authenticator: &dyn UserAuthenticator,
        user_id: &str,
        intent: &IntentMandate,
        cart: &CartMandate,
        method: &PaymentMethodSummary,
        grant: &TokenGrant,
        events: Option<&EventSender>,
    ) -> Result<PaymentMandate, ProtocolError> {
        let now = Utc::now();
        let cart_hash = mandate_hash(cart).map_err(crypto_internal)?;
        let intent_hash = mandate_hash(intent).map_err(crypto_internal)?;

        let mut payment = PaymentMandate {
            id: short_id("payment"),
            mandate_type: PaymentMandate::MANDATE_TYPE.to_string(),
            version: "0.1".to_string(),
            cart_mandate_id: cart.id.clone(),
            intent_mandate_id: intent.id.clone(),
            payment_method: PaymentMethod {
                method_type: "card".to_string(),
                token: grant.token.clone(),
                last4: method.last4.clone(),
                brand: method.brand.clone(),
                expiry_month: method.expiry_month,
                expiry_year: method.expiry_year,
            },
            amount: cart.total.clone(),
            transaction_type: TransactionType::UserNotPresent,
            agent_involved: true,
            payer_id: user_id.to_string(),
            payee_id: cart.merchant_id.clone(),
            created_at: now,
            expires_at: now + Duration::minutes(PAYMENT_TTL_MINUTES),
            merchant_signature: cart.merchant_signature.clone(),
            user_signature: None,
            device_attestation: None,
            risk_score: None,
            fraud_indicators: Vec::new(),
            cart_mandate_hash: cart_hash.clone(),
            intent_mandate_hash: intent_hash,
            user_authorization: None,
            mandate_metadata: None,
        };

        // Live-presence attestation. Collected before signing so the
        // transaction type it implies is part of the signed core.
        emit(events, ChatEvent::WebauthnRequest {
            payment_mandate_id: payment.id.clone(),
            challenge: ap2_mandate::mandate::attestation::generate_challenge(),
        });
        let attestation = match authenticator.attest(&payment.id, None) {
            Ok(attestation) => {
                payment.transaction_type = TransactionType::UserPresent;
                Some(attestation)
            }
            Err(error) => {
                tracing::warn!(
                    payment_mandate_id = %payment.id,
                    code = %error.error_code,
                    "no device attestation; proceeding as user_not_present"
                );
                None
            }
        };

        payment.user_authorization =
            Some(user_authorization_token(cart, &payment).map_err(crypto_internal)?);

        payment.user_signature = Some(authenticator.sign_payment(&payment)?);

        // Post-signature attachments: attestation, risk, chain metadata.
        payment.device_attestation = attestation;

        let submitted = {
            let submitted = self.submitted.lock().expect("submitted mutex poisoned");
            submitted.get(&intent.id).copied().unwrap_or(0)
        };
        let assessment = self.risk.assess(&payment, cart, intent, submitted, now)?;
        if assessment.recommendation == Recommendation::Decline {
            // Exhaustion is a chain constraint, not fraud; keep the code the
            // verifier would have used.
            let code = if assessment
                .fraud_indicators
                .iter()
                .any(|i| i == "max_transactions_exhausted")
            {
                ErrorCode::ConstraintViolation
            } else {
                ErrorCode::FraudSuspected
            };
            return Err(ProtocolError::new(code, "risk engine declined the payment")
                .with_detail("payment_mandate_id", &payment.id)
                .with_detail("risk_score", assessment.risk_score)
                .with_detail("fraud_indicators", &assessment.fraud_indicators));
        }
        payment.risk_score = Some(assessment.risk_score);
        payment.fraud_indicators = assessment.fraud_indicators;

        let mut metadata = MandateMetadata::issue(&self.did, Some(cart_hash));
        metadata.record(AuditEntry {
            action: "user_signature".to_string(),
            signer_id: user_id.to_string(),
            signed_at: now,
            signature_algorithm: SignatureAlgorithm::EcdsaP256Sha256,
            mandate_type: PaymentMandate::MANDATE_TYPE.to_string(),
            inherited_from: None,
        });
        if payment.merchant_signature.is_some() {
            metadata.record(AuditEntry {
                action: "merchant_signature".to_string(),
                signer_id: cart.merchant_id.clone(),
                signed_at: now,
                signature_algorithm: SignatureAlgorithm::EcdsaP256Sha256,
                mandate_type: PaymentMandate::MANDATE_TYPE.to_string(),
                inherited_from: Some(cart.id.clone()),
            });
        }
        payment.mandate_metadata = Some(metadata);
        payment.seal_metadata().map_err(crypto_internal)?;

        tracing::info!(
            payment_mandate_id = %payment.id,
            risk_score = payment.risk_score,
            transaction_type = ?payment.transaction_type,
            "payment mandate assembled"
        );
        Ok(payment)
    }
}

impl ShoppingAgentService {
    /// Register the agent's inbound A2A surface.
    ///
    /// The shopping agent is mostly an initiator; inbound carts, product
    /// lists, and signature responses are push-style notifications that it
    /// acknowledges and folds into the active flow.
    pub fn register_handlers(self: &Arc<Self>, handler: &mut ap2_a2a::MessageHandler) {
        use ap2_a2a::{types, HandlerOutcome};

        for data_type in [
            types::CART_MANDATE,
            types::PRODUCT_LIST,
            types::SIGNATURE_RESPONSE,
        ] {
            handler.register_fn(data_type, move |message| async move {
                if !message.data_part.payload.is_object() {
                    return Err(ProtocolError::new(
                        ErrorCode::InvalidRequest,
                        "payload must be an object",
                    )
                    .with_detail("data_type", &message.data_part.data_type));
                }
                tracing::info!(
                    data_type = %message.data_part.data_type,
                    payload_id = %message.data_part.id,
                    "inbound notification acknowledged"
                );
                Ok(HandlerOutcome::new(
                    types::ACKNOWLEDGEMENT,
                    message.data_part.id.clone(),
                    serde_json::json!({ "acknowledged": true }),
                ))
            });
        }
    }
}

fn short_id(prefix: &str) -> String {
    format!("{prefix}_{}", &Uuid::new_v4().simple().to_string()[..12])
}
