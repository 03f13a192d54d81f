//! Mandate metadata: the chain primitive.
//!
//! Every issued mandate carries a `MandateMetadata` block holding its own
//! canonical hash, a pointer to the previous mandate's hash, a single-use
//! nonce, and an append-only audit trail of signing actions. Walking
//! `mandate_hash → previous_mandate_hash → ...` traverses the chain back to
//! the intent.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::SCHEMA_VERSION;
use crate::crypto::sign::SignatureAlgorithm;

/// One recorded signing action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// What happened, e.g. `"merchant_signature"`.
    pub action: String,
    pub signer_id: String,
    pub signed_at: DateTime<Utc>,
    pub signature_algorithm: SignatureAlgorithm,
    /// `type` of the mandate the action applied to.
    pub mandate_type: String,
    /// Set when a signature was carried over from an earlier mandate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inherited_from: Option<String>,
}

/// Chain metadata attached to every issued mandate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MandateMetadata {
    /// Hex SHA-256 of the mandate's canonical form (self-excluded).
    pub mandate_hash: String,

    pub schema_version: String,

    /// DID or id of the party that issued this mandate.
    pub issuer: String,

    pub issued_at: DateTime<Utc>,

    /// Hash of the previous mandate in the chain, absent on the intent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_mandate_hash: Option<String>,

    /// Random 128-bit hex, single-use within its TTL window.
    pub nonce: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audit_trail: Vec<AuditEntry>,
}

impl MandateMetadata {
    /// Fresh metadata with an empty hash slot; the hash is sealed in after
    /// the mandate content is complete.
    pub fn issue(issuer: impl Into<String>, previous_mandate_hash: Option<String>) -> Self {
        Self {
            mandate_hash: String::new(),
            schema_version: SCHEMA_VERSION.to_string(),
            issuer: issuer.into(),
            issued_at: Utc::now(),
            previous_mandate_hash,
            nonce: new_nonce(),
            audit_trail: Vec::new(),
        }
    }

    /// Append an audit trail entry.
    pub fn record(&mut self, entry: AuditEntry) {
        self.audit_trail.push(entry);
    }
}

/// Random 128-bit nonce, lowercase hex.
pub fn new_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
