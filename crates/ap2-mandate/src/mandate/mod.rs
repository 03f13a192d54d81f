//! The three mandate record types and their chain primitives.
//!
//! Mandates are independent, owned value types - no inheritance, no
//! back-references. Linkage is by id and canonical hash only, so the chain
//! graph stays a DAG and any link can be re-verified offline.

pub mod attestation;
pub mod cart;
pub mod hash;
pub mod intent;
pub mod metadata;
pub mod payment;

/// Schema version stamped into mandate metadata.
pub const SCHEMA_VERSION: &str = "0.1";
