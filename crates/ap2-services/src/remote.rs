//! HTTP adapters for the cross-role seams.
//!
//! Each port trait has an in-process implementation next to its service
//! and one of these A2A/HTTP implementations; a role deployed standalone
//! wires the remote flavor with its peers' endpoints.

use async_trait::async_trait;

use ap2_common::{ErrorCode, ProtocolError};
use ap2_a2a::{types, Artifact};
use ap2_mandate::{CartMandate, IntentMandate, PaymentMandate};

use crate::client::A2aClient;
use crate::merchant::SignOutcome;
use crate::merchant_agent::{CartSigner, PaymentPort};
use crate::payment_processor::CredentialSource;
use crate::shopping_agent::{CredentialProviderPort, MerchantAgentPort, MerchantStatusPort};
use crate::wire::{
    CartCandidate, CartCandidates, CredentialRequest, CredentialsEnvelope, PaymentMethodSummary,
    PaymentRequest, TokenGrant, TokenizeRequest, TransactionResult,
};

fn decode<T: serde::de::DeserializeOwned>(
    payload: &serde_json::Value,
    what: &str,
) -> Result<T, ProtocolError> {
    serde_json::from_value(payload.clone()).map_err(|e| {
        ProtocolError::new(ErrorCode::InvalidRequest, format!("peer response is not {what}"))
            .with_detail("reason", e.to_string())
    })
}

fn encode(value: &impl serde::Serialize) -> Result<serde_json::Value, ProtocolError> {
    serde_json::to_value(value).map_err(|e| {
        ProtocolError::new(ErrorCode::InternalError, "payload serialization failed")
            .with_detail("reason", e.to_string())
    })
}

/// Remote merchant agent, as the shopping agent sees it.
pub struct HttpMerchantAgentPort {
    pub client: A2aClient,
    pub base_url: String,
    pub did: String,
}

#[async_trait]
impl MerchantAgentPort for HttpMerchantAgentPort {
    async fn cart_candidates(
        &self,
        intent: &IntentMandate,
    ) -> Result<Vec<CartCandidate>, ProtocolError> {
        let response = self
            .client
            .send(
                &self.base_url,
                &self.did,
                types::INTENT_MANDATE,
                &intent.id,
                encode(intent)?,
            )
            .await?;
        let candidates: CartCandidates = decode(&response.data_part.payload, "cart candidates")?;
        Ok(candidates.candidates)
    }

    async fn submit_payment(
        &self,
        request: PaymentRequest,
    ) -> Result<TransactionResult, ProtocolError> {
        let payment_id = request.payment_mandate.id.clone();
        let response = self
            .client
            .send(
                &self.base_url,
                &self.did,
                types::PAYMENT_MANDATE,
                &payment_id,
                encode(&request)?,
            )
            .await?;
        decode(&response.data_part.payload, "a transaction result")
    }
}

/// Remote credential provider, as the shopping agent sees it.
pub struct HttpCredentialProviderPort {
    pub client: A2aClient,
    pub base_url: String,
}

#[async_trait]
impl CredentialProviderPort for HttpCredentialProviderPort {
    async fn list_methods(
        &self,
        user_id: &str,
    ) -> Result<Vec<PaymentMethodSummary>, ProtocolError> {
        self.client
            .get_json(&format!(
                "{}/payment-methods?user_id={user_id}",
                self.base_url
            ))
            .await
    }

    async fn tokenize(
        &self,
        user_id: &str,
        method_id: &str,
    ) -> Result<TokenGrant, ProtocolError> {
        self.client
            .post_json(
                &format!("{}/payment-methods/tokenize", self.base_url),
                &TokenizeRequest {
                    user_id: user_id.to_string(),
                    method_id: method_id.to_string(),
                },
            )
            .await
    }
}

/// Remote merchant status endpoint, polled during manual approval.
pub struct HttpMerchantStatusPort {
    pub client: A2aClient,
    pub base_url: String,
}

#[async_trait]
impl MerchantStatusPort for HttpMerchantStatusPort {
    async fn wait_for_signature(
        &self,
        cart_mandate_id: &str,
    ) -> Result<CartMandate, ProtocolError> {
        let status = self
            .client
            .poll_cart_status(&self.base_url, cart_mandate_id)
            .await?;
        status.payload.ok_or_else(|| {
            ProtocolError::new(ErrorCode::InternalError, "signed cart missing payload")
                .with_detail("cart_mandate_id", cart_mandate_id)
        })
    }
}

/// Remote merchant signing surface, as the merchant agent sees it.
pub struct HttpCartSigner {
    pub client: A2aClient,
    pub base_url: String,
    pub did: String,
}

#[async_trait]
impl CartSigner for HttpCartSigner {
    async fn sign_cart(&self, cart: CartMandate) -> Result<SignOutcome, ProtocolError> {
        let cart_id = cart.id.clone();
        let response = self
            .client
            .send(
                &self.base_url,
                &self.did,
                types::CART_MANDATE,
                &cart_id,
                encode(&cart)?,
            )
            .await?;

        match response.data_part.data_type.as_str() {
            types::SIGNED_CART_MANDATE => {
                let artifact: Artifact = decode(&response.data_part.payload, "an artifact")?;
                let payload = artifact.unwrap_payload(types::CART_MANDATE).ok_or_else(|| {
                    ProtocolError::new(
                        ErrorCode::InvalidRequest,
                        "artifact does not carry a cart mandate",
                    )
                })?;
                Ok(SignOutcome::Signed(decode(payload, "a cart mandate")?))
            }
            types::CART_MANDATE_PENDING => Ok(SignOutcome::Pending {
                cart_mandate_id: cart_id,
            }),
            other => Err(ProtocolError::new(
                ErrorCode::InvalidRequest,
                "unexpected merchant response type",
            )
            .with_detail("data_type", other)),
        }
    }
}

/// Remote credential provider, as the payment processor sees it.
pub struct HttpCredentialSource {
    pub client: A2aClient,
    pub base_url: String,
    pub did: String,
}

#[async_trait]
impl CredentialSource for HttpCredentialSource {
    async fn request_credentials(
        &self,
        payment: &PaymentMandate,
        otp: Option<&str>,
    ) -> Result<CredentialsEnvelope, ProtocolError> {
        let request = CredentialRequest {
            payment_mandate: payment.clone(),
            otp: otp.map(str::to_string),
        };
        let response = self
            .client
            .send(
                &self.base_url,
                &self.did,
                types::PAYMENT_MANDATE,
                &payment.id,
                encode(&request)?,
            )
            .await?;
        decode(&response.data_part.payload, "a credentials envelope")
    }
}

/// Remote payment processor, as the merchant agent sees it.
pub struct HttpPaymentPort {
    pub client: A2aClient,
    pub base_url: String,
    pub did: String,
}

#[async_trait]
impl PaymentPort for HttpPaymentPort {
    async fn authorize(
        &self,
        request: PaymentRequest,
    ) -> Result<TransactionResult, ProtocolError> {
        let payment_id = request.payment_mandate.id.clone();
        let response = self
            .client
            .send(
                &self.base_url,
                &self.did,
                types::PAYMENT_MANDATE,
                &payment_id,
                encode(&request)?,
            )
            .await?;
        decode(&response.data_part.payload, "a transaction result")
    }
}
