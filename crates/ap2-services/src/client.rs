//! Outbound A2A client.
//!
//! Wraps reqwest with the protocol's envelope handling: build, sign, POST,
//! and turn `ap2.errors.Error` responses back into typed errors. Every
//! call carries a timeout; transient transport failures are retried with
//! jittered backoff, verifier rejections never are.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;

use ap2_common::{ErrorCode, ProtocolError};
use ap2_a2a::{types, A2aMessage};
use ap2_mandate::crypto::keys::AgentKeys;

use crate::wire::{CartStatus, CartStatusResponse};

/// Default outbound call timeout.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Overall deadline for cart-approval polling.
pub const CART_POLL_DEADLINE: Duration = Duration::from_secs(300);

/// Minimum backoff between cart-approval polls.
pub const CART_POLL_BACKOFF: Duration = Duration::from_secs(2);

const MAX_TRANSPORT_ATTEMPTS: u32 = 3;

/// A signing A2A HTTP client bound to one sender identity.
#[derive(Clone)]
pub struct A2aClient {
    did: String,
    keys: Arc<AgentKeys>,
    http: reqwest::Client,
}

impl A2aClient {
    pub fn new(did: impl Into<String>, keys: Arc<AgentKeys>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static config");
        Self {
            did: did.into(),
            keys,
            http,
        }
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    /// Send one signed envelope and return the peer's response envelope.
    ///
    /// An `ap2.errors.Error` response is converted into `Err`.
    pub async fn send(
        &self,
        endpoint_base: &str,
        recipient: &str,
        data_type: &str,
        payload_id: &str,
        payload: Value,
    ) -> Result<A2aMessage, ProtocolError> {
        let mut message = A2aMessage::new(&self.did, recipient, data_type, payload_id, payload);
        message.sign(&self.keys).map_err(|e| {
            ProtocolError::new(ErrorCode::InternalError, "failed to sign outbound envelope")
                .with_detail("reason", e.to_string())
        })?;

        let url = format!("{endpoint_base}/a2a/message");
        let response = self.post_with_retry(&url, &message).await?;

        let envelope: A2aMessage = response.json().await.map_err(|e| {
            ProtocolError::new(ErrorCode::InvalidRequest, "peer response was not an envelope")
                .with_detail("reason", e.to_string())
        })?;

        if envelope.data_part.data_type == types::ERROR {
            return Err(decode_error_payload(&envelope.data_part.payload));
        }
        Ok(envelope)
    }

    /// Poll the merchant's cart status endpoint until the cart is signed or
    /// rejected, or the deadline passes.
    pub async fn poll_cart_status(
        &self,
        merchant_base: &str,
        cart_mandate_id: &str,
    ) -> Result<CartStatusResponse, ProtocolError> {
        let url = format!("{merchant_base}/cart-mandates/{cart_mandate_id}");
        let deadline = tokio::time::Instant::now() + CART_POLL_DEADLINE;

        loop {
            let response = self.http.get(&url).send().await.map_err(transport_error)?;
            if response.status().is_success() {
                let status: CartStatusResponse =
                    response.json().await.map_err(|e| {
                        ProtocolError::new(
                            ErrorCode::InvalidRequest,
                            "cart status response malformed",
                        )
                        .with_detail("reason", e.to_string())
                    })?;
                match status.status {
                    CartStatus::Signed => return Ok(status),
                    CartStatus::Rejected => {
                        return Err(ProtocolError::new(
                            ErrorCode::CartRejected,
                            "merchant rejected the cart",
                        )
                        .with_detail("cart_mandate_id", cart_mandate_id));
                    }
                    CartStatus::PendingMerchantSignature => {}
                }
            }

            if tokio::time::Instant::now() + CART_POLL_BACKOFF > deadline {
                return Err(ProtocolError::new(
                    ErrorCode::ExpiredCart,
                    "timed out waiting for merchant signature",
                )
                .with_detail("cart_mandate_id", cart_mandate_id)
                .with_detail("deadline_seconds", CART_POLL_DEADLINE.as_secs()));
            }
            tokio::time::sleep(CART_POLL_BACKOFF).await;
        }
    }

    /// GET a JSON document from a peer's plain HTTP surface.
    pub async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, ProtocolError> {
        let response = self.http.get(url).send().await.map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(
                ProtocolError::new(ErrorCode::InvalidRequest, "peer returned an error status")
                    .with_detail("url", url)
                    .with_detail("status", response.status().as_u16()),
            );
        }
        response.json().await.map_err(|e| {
            ProtocolError::new(ErrorCode::InvalidRequest, "peer response malformed")
                .with_detail("reason", e.to_string())
        })
    }

    /// POST a JSON document to a peer's plain HTTP surface.
    pub async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &impl serde::Serialize,
    ) -> Result<T, ProtocolError> {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            // The peer may have sent a structured protocol error.
            if let Ok(err) = response.json::<ProtocolError>().await {
                return Err(err);
            }
            return Err(
                ProtocolError::new(ErrorCode::InvalidRequest, "peer returned an error status")
                    .with_detail("url", url)
                    .with_detail("status", status),
            );
        }
        response.json().await.map_err(|e| {
            ProtocolError::new(ErrorCode::InvalidRequest, "peer response malformed")
                .with_detail("reason", e.to_string())
        })
    }

    async fn post_with_retry(
        &self,
        url: &str,
        message: &A2aMessage,
    ) -> Result<reqwest::Response, ProtocolError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.http.post(url).json(message).send().await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < MAX_TRANSPORT_ATTEMPTS => {
                    tracing::warn!(url, attempt, error = %e, "A2A transport failure, retrying");
                    let jitter = rand::thread_rng().gen_range(0..250);
                    tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt) + jitter))
                        .await;
                }
                Err(e) => return Err(transport_error(e)),
            }
        }
    }
}

fn transport_error(e: reqwest::Error) -> ProtocolError {
    ProtocolError::new(ErrorCode::InternalError, "peer unreachable")
        .with_detail("reason", e.to_string())
}

/// Parse an `ap2.errors.Error` payload, tolerating unknown shapes.
pub fn decode_error_payload(payload: &Value) -> ProtocolError {
    serde_json::from_value::<ProtocolError>(payload.clone()).unwrap_or_else(|_| {
        ProtocolError::new(ErrorCode::InvalidRequest, "peer returned an unreadable error")
            .with_detail("payload", payload.clone())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> A2aClient {
        A2aClient::new(
            "did:ap2:agent:shopping_agent",
            Arc::new(AgentKeys::generate()),
        )
    }

    #[test]
    fn test_decode_structured_error() {
        let err = decode_error_payload(&json!({
            "error_code": "AMOUNT_EXCEEDED",
            "error_message": "over budget",
            "details": {"max_amount": "50.00"}
        }));
        assert_eq!(err.error_code, ErrorCode::AmountExceeded);
        assert_eq!(err.details["max_amount"], "50.00");
    }

    #[test]
    fn test_decode_garbage_error() {
        let err = decode_error_payload(&json!("boom"));
        assert_eq!(err.error_code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_send_surfaces_error_envelope() {
        let server = MockServer::start().await;
        let error_envelope = A2aMessage::new(
            "did:ap2:agent:merchant_agent",
            "did:ap2:agent:shopping_agent",
            types::ERROR,
            "e1",
            json!({"error_code": "METHOD_NOT_FOUND", "error_message": "no handler"}),
        );
        Mock::given(method("POST"))
            .and(path("/a2a/message"))
            .respond_with(ResponseTemplate::new(400).set_body_json(&error_envelope))
            .mount(&server)
            .await;

        let err = client()
            .send(
                &server.uri(),
                "did:ap2:agent:merchant_agent",
                types::INTENT_MANDATE,
                "i1",
                json!({}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code, ErrorCode::MethodNotFound);
    }

    #[tokio::test]
    async fn test_poll_sees_rejected_cart() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cart-mandates/cart_001"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "rejected"
            })))
            .mount(&server)
            .await;

        let err = client()
            .poll_cart_status(&server.uri(), "cart_001")
            .await
            .unwrap_err();
        assert_eq!(err.error_code, ErrorCode::CartRejected);
    }
}
