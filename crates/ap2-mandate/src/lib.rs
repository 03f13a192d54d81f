//! Mandate data model and signature chain for AP2.
//!
//! The Agent Payments Protocol binds a purchase to three successive signed
//! authorizations: an `IntentMandate` (signed by the user), a `CartMandate`
//! (signed by the merchant), and a `PaymentMandate` (signed by the user,
//! inheriting the merchant signature). Later mandates reference earlier ones
//! by id *and* by SHA-256 over the canonical form, so the chain is
//! tamper-evident without any shared database.
//!
//! # Design principles
//!
//! - **Deterministic** - one canonicalizer (RFC 8785 JCS), used by every
//!   signature producer and verifier.
//! - **Offline-verifiable** - verification needs only the mandates and
//!   trusted public keys.
//! - **No floats** - money is exact decimal end to end.

pub mod crypto;
pub mod mandate;

pub use crypto::keys::{AgentKeys, KeyStore};
pub use crypto::sign::{
    sign_payload, verify_payload, CryptoError, InlinePublicKeyResolver, PublicKeyResolver,
    Signature, SignatureAlgorithm,
};
pub use mandate::attestation::{AttestationType, DeviceAttestation};
pub use mandate::cart::{Address, CartItem, CartMandate, ShippingInfo};
pub use mandate::hash::{canonical_bytes, mandate_hash, Hashable};
pub use mandate::intent::{IntentConstraints, IntentMandate};
pub use mandate::metadata::{AuditEntry, MandateMetadata};
pub use mandate::payment::{PaymentMandate, PaymentMethod, TransactionType};
