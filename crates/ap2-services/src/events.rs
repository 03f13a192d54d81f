//! Structured events surfaced by the shopping agent's chat stream.
//!
//! Downstream UIs consume these instead of scraping free text; the flow
//! emits them in order and always terminates with `done` or `error`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use ap2_mandate::CartMandate;

use crate::wire::{PaymentMethodSummary, TransactionResult};

/// One event on the shopping agent's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChatEvent {
    /// Narration for the user.
    AgentText { text: String },

    /// The user's authenticator must sign the attached payload off-band.
    SignatureRequest {
        mandate_type: String,
        mandate_id: String,
        payload: Value,
    },

    /// Signed cart candidates for the user to choose from.
    CartOptions { carts: Vec<CartMandate> },

    /// A device attestation is needed; the challenge rides along.
    WebauthnRequest {
        payment_mandate_id: String,
        challenge: String,
    },

    /// Stored payment methods to pick from.
    PaymentMethodSelection {
        methods: Vec<PaymentMethodSummary>,
    },

    /// Terminal success.
    Done { result: TransactionResult },

    /// Terminal failure.
    Error { error: ap2_common::ProtocolError },
}

/// Sink for flow events. A no-op sink is used when nobody is listening.
pub type EventSender = tokio::sync::mpsc::UnboundedSender<ChatEvent>;

/// Emit an event, ignoring a closed receiver.
pub fn emit(sender: Option<&EventSender>, event: ChatEvent) {
    if let Some(sender) = sender {
        let _ = sender.send(event);
    }
}
