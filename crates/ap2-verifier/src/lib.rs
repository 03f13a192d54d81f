//! Role-agnostic verification for the AP2 mandate chain.
//!
//! Everything here runs offline: given the three mandates and trusted
//! public keys, every check is enumerable and deterministic. The only
//! stateful piece is the transaction ledger, which enforces an intent's
//! `max_transactions` across payments.

pub mod ledger;
pub mod risk;
pub mod verifier;

pub use ledger::TransactionLedger;
pub use risk::{Recommendation, RiskAssessment, RiskEngine};
pub use verifier::Verifier;
