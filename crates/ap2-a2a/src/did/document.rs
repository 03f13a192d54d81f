//! W3C-style DID documents, reduced to what AP2 verification needs.

use serde::{Deserialize, Serialize};

/// A public key published under a DID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationMethod {
    /// Kid form: `<DID>#<fragment>`.
    pub id: String,

    /// e.g. `Ed25519VerificationKey2020`, `EcdsaSecp256r1VerificationKey2019`.
    #[serde(rename = "type")]
    pub method_type: String,

    pub controller: String,

    #[serde(rename = "publicKeyPem")]
    pub public_key_pem: String,
}

/// The document a DID resolves to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DidDocument {
    pub id: String,

    #[serde(rename = "verificationMethod")]
    pub verification_method: Vec<VerificationMethod>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authentication: Vec<String>,

    #[serde(
        rename = "assertionMethod",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub assertion_method: Vec<String>,
}

impl DidDocument {
    /// Document for an agent publishing an Ed25519 envelope key (`#key-1`)
    /// and optionally a P-256 assertion key (`#key-2`).
    pub fn for_agent(did: &str, ed25519_pem: &str, p256_pem: Option<&str>) -> Self {
        let mut methods = vec![VerificationMethod {
            id: format!("{did}#key-1"),
            method_type: "Ed25519VerificationKey2020".to_string(),
            controller: did.to_string(),
            public_key_pem: ed25519_pem.to_string(),
        }];
        let mut assertion = vec!["#key-1".to_string()];

        if let Some(pem) = p256_pem {
            methods.push(VerificationMethod {
                id: format!("{did}#key-2"),
                method_type: "EcdsaSecp256r1VerificationKey2019".to_string(),
                controller: did.to_string(),
                public_key_pem: pem.to_string(),
            });
            assertion.push("#key-2".to_string());
        }

        Self {
            id: did.to_string(),
            verification_method: methods,
            authentication: vec!["#key-1".to_string()],
            assertion_method: assertion,
        }
    }

    /// Find the PEM for a kid, matching full id or `#fragment` suffix.
    pub fn public_key_pem(&self, kid: &str) -> Option<&str> {
        let fragment = kid.split_once('#').map(|(_, f)| f);
        self.verification_method
            .iter()
            .find(|vm| {
                vm.id == kid
                    || fragment
                        .map(|f| vm.id.ends_with(&format!("#{f}")))
                        .unwrap_or(false)
            })
            .map(|vm| vm.public_key_pem.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_agent_builds_both_methods() {
        let doc = DidDocument::for_agent("did:ap2:agent:sa", "ED_PEM", Some("P256_PEM"));
        assert_eq!(doc.verification_method.len(), 2);
        assert_eq!(doc.verification_method[0].id, "did:ap2:agent:sa#key-1");
        assert_eq!(doc.verification_method[1].id, "did:ap2:agent:sa#key-2");
    }

    #[test]
    fn test_lookup_by_full_kid_and_fragment() {
        let doc = DidDocument::for_agent("did:ap2:agent:sa", "ED_PEM", Some("P256_PEM"));
        assert_eq!(doc.public_key_pem("did:ap2:agent:sa#key-1"), Some("ED_PEM"));
        assert_eq!(doc.public_key_pem("anything#key-2"), Some("P256_PEM"));
        assert_eq!(doc.public_key_pem("did:ap2:agent:sa#key-9"), None);
    }

    #[test]
    fn test_wire_field_names() {
        let doc = DidDocument::for_agent("did:ap2:agent:sa", "PEM", None);
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json.get("verificationMethod").is_some());
        assert!(json["verificationMethod"][0].get("publicKeyPem").is_some());
    }
}
