//! Content-addressed mandate hashing.
//!
//! `mandate_hash` is SHA-256 over the JCS canonical form with the type's
//! signature-carrying fields and `mandate_metadata.mandate_hash` itself
//! removed. The exclusion of the stored hash breaks the circularity: the
//! hash can be computed first and written into the metadata afterwards
//! without changing what it covers.

use serde::Serialize;
use sha2::{Digest, Sha256};

pub use crate::crypto::jcs::canonical_bytes;
use crate::crypto::sign::CryptoError;

/// A mandate type with a stable canonical hash.
pub trait Hashable: Serialize {
    /// Wire value of the `type` field, e.g. `"IntentMandate"`.
    const MANDATE_TYPE: &'static str;

    /// Dotted field paths excluded from the hash. Always contains the
    /// type's signature fields and `mandate_metadata.mandate_hash`.
    fn hash_exclusions() -> &'static [&'static str];
}

/// Lowercase-hex SHA-256 over the canonical form minus exclusions.
pub fn mandate_hash<T: Hashable>(mandate: &T) -> Result<String, CryptoError> {
    let bytes = canonical_bytes(mandate, T::hash_exclusions())?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Fixture {
        id: String,
        body: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_signature: Option<String>,
    }

    impl Hashable for Fixture {
        const MANDATE_TYPE: &'static str = "Fixture";
        fn hash_exclusions() -> &'static [&'static str] {
            &["user_signature", "mandate_metadata.mandate_hash"]
        }
    }

    #[test]
    fn test_hash_is_hex_sha256() {
        let h = mandate_hash(&Fixture {
            id: "m1".into(),
            body: "x".into(),
            user_signature: None,
        })
        .unwrap();
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_hash_ignores_signature() {
        let unsigned = Fixture {
            id: "m1".into(),
            body: "x".into(),
            user_signature: None,
        };
        let signed = Fixture {
            id: "m1".into(),
            body: "x".into(),
            user_signature: Some("sig".into()),
        };
        assert_eq!(mandate_hash(&unsigned).unwrap(), mandate_hash(&signed).unwrap());
    }

    #[test]
    fn test_hash_tracks_content() {
        let a = Fixture {
            id: "m1".into(),
            body: "x".into(),
            user_signature: None,
        };
        let b = Fixture {
            id: "m1".into(),
            body: "y".into(),
            user_signature: None,
        };
        assert_ne!(mandate_hash(&a).unwrap(), mandate_hash(&b).unwrap());
    }
}
