//! Inbound message pipeline: verify, dispatch, respond.
//!
//! Routing is a plain registry keyed by the `dataPart.type` string. Unknown
//! types fail closed with `METHOD_NOT_FOUND` - a message for a type nobody
//! registered never silently succeeds.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use ap2_common::{ErrorCode, ProtocolError};
use ap2_mandate::crypto::keys::AgentKeys;
use ap2_mandate::crypto::sign::PublicKeyResolver as _;

use crate::did::DidResolver;
use crate::envelope::A2aMessage;
use crate::nonce::{NonceManager, NonceOutcome};
use crate::types;

/// Maximum tolerated |now − header.timestamp|.
pub const MAX_TIMESTAMP_SKEW_SECONDS: i64 = 300;

/// What a typed handler produces on success.
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    pub data_type: String,
    pub payload_id: String,
    pub payload: Value,
}

impl HandlerOutcome {
    pub fn new(data_type: &str, payload_id: impl Into<String>, payload: Value) -> Self {
        Self {
            data_type: data_type.to_string(),
            payload_id: payload_id.into(),
            payload,
        }
    }
}

/// A handler for one `dataPart.type`.
#[async_trait]
pub trait TypedHandler: Send + Sync {
    async fn handle(&self, message: &A2aMessage) -> Result<HandlerOutcome, ProtocolError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TypedHandler for FnHandler<F>
where
    F: Fn(A2aMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerOutcome, ProtocolError>> + Send,
{
    async fn handle(&self, message: &A2aMessage) -> Result<HandlerOutcome, ProtocolError> {
        (self.0)(message.clone()).await
    }
}

/// Per-role A2A endpoint: owns the role's identity, verifies every inbound
/// envelope, and routes by payload type.
pub struct MessageHandler {
    did: String,
    keys: Arc<AgentKeys>,
    resolver: Arc<DidResolver>,
    nonces: Arc<NonceManager>,
    routes: HashMap<String, Box<dyn TypedHandler>>,
    max_skew: Duration,
}

impl MessageHandler {
    pub fn new(
        did: impl Into<String>,
        keys: Arc<AgentKeys>,
        resolver: Arc<DidResolver>,
        nonces: Arc<NonceManager>,
    ) -> Self {
        Self {
            did: did.into(),
            keys,
            resolver,
            nonces,
            routes: HashMap::new(),
            max_skew: Duration::seconds(MAX_TIMESTAMP_SKEW_SECONDS),
        }
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    /// Register a handler for one payload type.
    pub fn register(&mut self, data_type: &str, handler: impl TypedHandler + 'static) {
        tracing::debug!(did = %self.did, data_type, "registered A2A handler");
        self.routes.insert(data_type.to_string(), Box::new(handler));
    }

    /// Register an async closure for one payload type.
    pub fn register_fn<F, Fut>(&mut self, data_type: &str, f: F)
    where
        F: Fn(A2aMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerOutcome, ProtocolError>> + Send + 'static,
    {
        self.register(data_type, FnHandler(f));
    }

    /// Run the full verification pipeline on an inbound envelope.
    ///
    /// Order: signature → recipient → timestamp window → replay. The nonce
    /// is only consumed once everything before it passed, so a forged
    /// message cannot burn a legitimate message id.
    pub async fn verify_message(&self, message: &A2aMessage) -> Result<(), ProtocolError> {
        let signature = message.header.signature.as_ref().ok_or_else(|| {
            ProtocolError::new(ErrorCode::MissingSignature, "envelope is not signed")
                .with_detail("message_id", &message.header.message_id)
        })?;

        let pem = if signature.public_key.contains('#') {
            self.resolver.resolve_public_key(&signature.public_key).await
        } else {
            self.resolver.resolve_pem(&signature.public_key)
        }
        .ok_or_else(|| {
            ProtocolError::new(
                ErrorCode::PublicKeyUnresolvable,
                "sender public key could not be resolved",
            )
            .with_detail("key_ref", &signature.public_key)
            .with_detail("sender", &message.header.sender)
        })?;

        message.verify_signature(&pem).map_err(|e| {
            ProtocolError::new(ErrorCode::InvalidSignature, "envelope signature invalid")
                .with_detail("sender", &message.header.sender)
                .with_detail("reason", e.to_string())
        })?;

        if message.header.recipient != self.did {
            return Err(ProtocolError::new(
                ErrorCode::RecipientMismatch,
                "message addressed to a different agent",
            )
            .with_detail("expected", &self.did)
            .with_detail("actual", &message.header.recipient));
        }

        let skew = Utc::now() - message.header.timestamp;
        if skew > self.max_skew || skew < -self.max_skew {
            return Err(ProtocolError::new(
                ErrorCode::MessageTimestampSkew,
                "message timestamp outside freshness window",
            )
            .with_detail("skew_seconds", skew.num_seconds())
            .with_detail("max_skew_seconds", self.max_skew.num_seconds()));
        }

        if self.nonces.check_and_record(&message.header.message_id) == NonceOutcome::Rejected {
            return Err(ProtocolError::new(
                ErrorCode::MessageReplay,
                "message id already seen within TTL",
            )
            .with_detail("message_id", &message.header.message_id));
        }

        Ok(())
    }

    /// Verify then dispatch; always produces a response envelope.
    pub async fn handle(&self, message: A2aMessage) -> A2aMessage {
        let sender = message.header.sender.clone();

        if let Err(error) = self.verify_message(&message).await {
            tracing::warn!(
                sender = %sender,
                code = %error.error_code,
                "rejected inbound A2A message"
            );
            return self.build_error_response(&sender, &error);
        }

        let data_type = message.data_part.data_type.clone();
        let Some(handler) = self.routes.get(&data_type) else {
            let error = ProtocolError::new(
                ErrorCode::MethodNotFound,
                "no handler registered for payload type",
            )
            .with_detail("data_type", &data_type);
            return self.build_error_response(&sender, &error);
        };

        tracing::info!(sender = %sender, data_type = %data_type, "dispatching A2A message");
        match handler.handle(&message).await {
            Ok(outcome) => self
                .build_response(&sender, &outcome.data_type, &outcome.payload_id, outcome.payload, true)
                .unwrap_or_else(|error| self.build_error_response(&sender, &error)),
            Err(error) => self.build_error_response(&sender, &error),
        }
    }

    /// Build (and by default sign) an outbound envelope.
    pub fn build_response(
        &self,
        recipient: &str,
        data_type: &str,
        payload_id: &str,
        payload: Value,
        sign: bool,
    ) -> Result<A2aMessage, ProtocolError> {
        let mut message = A2aMessage::new(&self.did, recipient, data_type, payload_id, payload);
        if sign {
            message.sign(&self.keys).map_err(|e| {
                ProtocolError::new(ErrorCode::InternalError, "failed to sign response")
                    .with_detail("reason", e.to_string())
            })?;
        }
        Ok(message)
    }

    /// Build a signed `ap2.errors.Error` envelope.
    pub fn build_error_response(&self, recipient: &str, error: &ProtocolError) -> A2aMessage {
        let payload = serde_json::to_value(error).unwrap_or_else(|_| {
            serde_json::json!({
                "error_code": ErrorCode::InternalError,
                "error_message": "error serialization failed",
            })
        });
        let mut message = A2aMessage::new(
            &self.did,
            recipient,
            types::ERROR,
            Uuid::new_v4().to_string(),
            payload,
        );
        if let Err(e) = message.sign(&self.keys) {
            tracing::error!(error = %e, "failed to sign error envelope");
        }
        message
    }
}
