//! Agent-to-agent messaging for AP2.
//!
//! Role services never share memory; everything crosses this envelope. A
//! message is a signed JSON object with a routing header and one typed data
//! part. The pipeline on the receiving side is always the same: verify the
//! Ed25519 envelope signature against the sender's DID-resolved key, check
//! the recipient and timestamp window, reject replayed message ids, then
//! dispatch on the `dataPart.type` string - unknown types fail closed.

pub mod did;
pub mod envelope;
pub mod handler;
pub mod nonce;

pub use did::{DidDocument, DidResolver, MerchantRecord, RegistryClient, VerificationMethod};
pub use envelope::{A2aMessage, Artifact, DataPart, MessageHeader};
pub use handler::{HandlerOutcome, MessageHandler, TypedHandler};
pub use nonce::{NonceManager, NonceOutcome};

/// Recognized `dataPart.type` identifiers.
pub mod types {
    pub const INTENT_MANDATE: &str = "ap2.mandates.IntentMandate";
    pub const CART_MANDATE: &str = "ap2.mandates.CartMandate";
    pub const PAYMENT_MANDATE: &str = "ap2.mandates.PaymentMandate";

    pub const PRODUCT_SEARCH: &str = "ap2.requests.ProductSearch";
    pub const CART_REQUEST: &str = "ap2.requests.CartRequest";
    pub const CART_SELECTION: &str = "ap2.requests.CartSelection";

    pub const PRODUCT_LIST: &str = "ap2.responses.ProductList";
    pub const CART_CANDIDATES: &str = "ap2.responses.CartCandidates";
    pub const SIGNED_CART_MANDATE: &str = "ap2.responses.SignedCartMandate";
    pub const CART_MANDATE_PENDING: &str = "ap2.responses.CartMandatePending";
    pub const SIGNATURE_RESPONSE: &str = "ap2.responses.SignatureResponse";
    pub const PAYMENT_RESULT: &str = "ap2.responses.PaymentResult";
    pub const ACKNOWLEDGEMENT: &str = "ap2.responses.Acknowledgement";

    pub const ERROR: &str = "ap2.errors.Error";
}
