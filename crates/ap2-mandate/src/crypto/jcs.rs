//! JSON Canonicalization Scheme (RFC 8785).
//!
//! Deterministic JSON serialization for every hash and signature in the
//! protocol. Uses `serde_jcs`, which guarantees:
//!
//! - Lexicographic key ordering
//! - No insignificant whitespace
//! - UTF-8 encoding
//! - IEEE 754 number normalization (1.0 → 1)
//!
//! Monetary values never reach the number normalizer: amounts serialize as
//! strings, so "89.99" stays byte-identical across platforms.

use serde::Serialize;

use super::sign::CryptoError;

/// Serialize a value to JCS canonical bytes.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, CryptoError> {
    serde_jcs::to_vec(value).map_err(|e| CryptoError::CanonicalizationFailed {
        reason: e.to_string(),
    })
}

/// Serialize a value to a JCS canonical string.
pub fn to_string<T: Serialize>(value: &T) -> Result<String, CryptoError> {
    serde_jcs::to_string(value).map_err(|e| CryptoError::CanonicalizationFailed {
        reason: e.to_string(),
    })
}

/// Canonical bytes of `value` with the given dotted field paths removed.
///
/// This is the single signing/hashing input builder: the same exclusion
/// list must be used when a signature or hash is produced and when it is
/// verified. A path like `mandate_metadata.mandate_hash` removes one nested
/// field; a missing path is a no-op (absent and removed are equivalent in
/// canonical form).
pub fn canonical_bytes<T: Serialize>(
    value: &T,
    exclude_fields: &[&str],
) -> Result<Vec<u8>, CryptoError> {
    let mut json =
        serde_json::to_value(value).map_err(|e| CryptoError::CanonicalizationFailed {
            reason: e.to_string(),
        })?;
    for path in exclude_fields {
        remove_path(&mut json, path);
    }
    to_vec(&json)
}

fn remove_path(value: &mut serde_json::Value, dotted: &str) {
    let mut current = value;
    let mut parts = dotted.split('.').peekable();
    while let Some(part) = parts.next() {
        let Some(obj) = current.as_object_mut() else {
            return;
        };
        if parts.peek().is_none() {
            obj.remove(part);
            return;
        }
        match obj.get_mut(part) {
            Some(next) => current = next,
            None => return,
        }
    }
}
