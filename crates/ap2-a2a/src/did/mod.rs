//! DID documents and resolution.
//!
//! Identities are `did:ap2:agent:<name>` / `did:ap2:merchant:<name>`.
//! Resolution is layered: in-process registry first, then the local SQLite
//! cache, then the central registry over HTTP (successful central lookups
//! are cached locally). A key that cannot be resolved is a verification
//! failure, never a trust-by-default.

mod cache;
mod document;
mod registry;
mod resolver;

pub use cache::DidCache;
pub use document::{DidDocument, VerificationMethod};
pub use registry::{MerchantRecord, RegistryClient, RegistryError};
pub use resolver::DidResolver;

/// Split a kid of the form `<DID>#<fragment>`.
pub fn split_kid(kid: &str) -> Option<(&str, &str)> {
    kid.split_once('#')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_kid() {
        let (did, fragment) = split_kid("did:ap2:agent:merchant#key-1").unwrap();
        assert_eq!(did, "did:ap2:agent:merchant");
        assert_eq!(fragment, "key-1");
        assert!(split_kid("did:ap2:agent:merchant").is_none());
    }
}
