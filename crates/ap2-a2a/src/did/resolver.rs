//! Layered DID resolution.

use std::collections::HashMap;
use std::sync::RwLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use ap2_mandate::crypto::sign::PublicKeyResolver;

use super::cache::DidCache;
use super::document::DidDocument;
use super::registry::RegistryClient;

/// Resolves DIDs to documents and kids to public keys.
///
/// Lookup order: in-process registry, local SQLite cache, central registry
/// over HTTP. A successful central lookup is written back to the cache.
/// The in-process map is read-dominated; updates take the writer lock.
pub struct DidResolver {
    local: RwLock<HashMap<String, DidDocument>>,
    cache: Option<DidCache>,
    central: Option<RegistryClient>,
}

impl DidResolver {
    /// Resolver backed only by the in-process registry.
    pub fn in_process() -> Self {
        Self {
            local: RwLock::new(HashMap::new()),
            cache: None,
            central: None,
        }
    }

    /// Add a local SQLite cache tier.
    pub fn with_cache(mut self, cache: DidCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Add the central registry tier.
    pub fn with_central(mut self, client: RegistryClient) -> Self {
        self.central = Some(client);
        self
    }

    /// Register a document in the in-process tier.
    pub fn register(&self, document: DidDocument) {
        let mut local = self.local.write().expect("did registry lock poisoned");
        tracing::debug!(did = %document.id, "registered DID document");
        local.insert(document.id.clone(), document);
    }

    /// Resolve a DID through all tiers.
    pub async fn resolve(&self, did: &str) -> Option<DidDocument> {
        if let Some(doc) = self.resolve_local(did) {
            return Some(doc);
        }

        if let Some(cache) = &self.cache {
            if let Ok(Some(record)) = cache.get(did) {
                return Some(record.to_did_document());
            }
        }

        if let Some(central) = &self.central {
            match central.resolve(did).await {
                Ok(Some(record)) => {
                    if let Some(cache) = &self.cache {
                        if let Err(e) = cache.upsert(&record) {
                            tracing::warn!(did, error = %e, "failed to cache central DID record");
                        }
                    }
                    return Some(record.to_did_document());
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(did, error = %e, "central DID lookup failed"),
            }
        }

        None
    }

    /// Resolve a kid (`<DID>#<fragment>`) to a PEM through all tiers.
    pub async fn resolve_public_key(&self, kid: &str) -> Option<String> {
        let (did, _) = super::split_kid(kid)?;
        let doc = self.resolve(did).await?;
        doc.public_key_pem(kid).map(str::to_string)
    }

    /// Synchronous resolution against the in-process and cache tiers only.
    pub fn resolve_public_key_local(&self, kid: &str) -> Option<String> {
        let (did, _) = super::split_kid(kid)?;

        if let Some(doc) = self.resolve_local(did) {
            return doc.public_key_pem(kid).map(str::to_string);
        }
        if let Some(cache) = &self.cache {
            if let Ok(Some(record)) = cache.get(did) {
                return record.to_did_document().public_key_pem(kid).map(str::to_string);
            }
        }
        None
    }

    fn resolve_local(&self, did: &str) -> Option<DidDocument> {
        self.local
            .read()
            .expect("did registry lock poisoned")
            .get(did)
            .cloned()
    }
}

impl PublicKeyResolver for DidResolver {
    /// Mandate-level key resolution: DID kids go through the local tiers,
    /// anything else is treated as inline base64(SPKI PEM).
    fn resolve_pem(&self, key_ref: &str) -> Option<String> {
        if key_ref.contains('#') {
            self.resolve_public_key_local(key_ref)
        } else {
            let bytes = BASE64.decode(key_ref).ok()?;
            String::from_utf8(bytes).ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::did::MerchantRecord;
    use chrono::Utc;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn doc(did: &str) -> DidDocument {
        DidDocument::for_agent(did, "ED_PEM", Some("P256_PEM"))
    }

    #[tokio::test]
    async fn test_in_process_resolution() {
        let resolver = DidResolver::in_process();
        resolver.register(doc("did:ap2:agent:sa"));

        let got = resolver.resolve("did:ap2:agent:sa").await.unwrap();
        assert_eq!(got.id, "did:ap2:agent:sa");
        assert_eq!(
            resolver
                .resolve_public_key("did:ap2:agent:sa#key-1")
                .await
                .as_deref(),
            Some("ED_PEM")
        );
    }

    #[tokio::test]
    async fn test_unknown_did_is_none() {
        let resolver = DidResolver::in_process();
        assert!(resolver.resolve("did:ap2:agent:ghost").await.is_none());
        assert!(resolver
            .resolve_public_key("did:ap2:agent:ghost#key-1")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_cache_tier_consulted() {
        let cache = DidCache::memory().unwrap();
        cache
            .upsert(&MerchantRecord {
                did: "did:ap2:merchant:zephyr".into(),
                name: "Zephyr".into(),
                endpoint: "http://localhost:9100".into(),
                public_key_pem: "CACHED_PEM".into(),
                verification_method_id: "did:ap2:merchant:zephyr#key-1".into(),
                status: "active".into(),
                trust_score: 0.5,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .unwrap();

        let resolver = DidResolver::in_process().with_cache(cache);
        assert_eq!(
            resolver
                .resolve_public_key("did:ap2:merchant:zephyr#key-1")
                .await
                .as_deref(),
            Some("CACHED_PEM")
        );
        // Sync path sees the cache too.
        assert_eq!(
            resolver
                .resolve_public_key_local("did:ap2:merchant:zephyr#key-1")
                .as_deref(),
            Some("CACHED_PEM")
        );
    }

    #[tokio::test]
    async fn test_central_lookup_populates_cache() {
        let record = MerchantRecord {
            did: "did:ap2:merchant:cloudline".into(),
            name: "Cloudline".into(),
            endpoint: "http://localhost:9100".into(),
            public_key_pem: "CENTRAL_PEM".into(),
            verification_method_id: "did:ap2:merchant:cloudline#key-1".into(),
            status: "active".into(),
            trust_score: 0.7,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&record))
            .mount(&server)
            .await;

        let cache = DidCache::memory().unwrap();
        let resolver = DidResolver::in_process()
            .with_cache(cache.clone())
            .with_central(RegistryClient::new(server.uri()));

        let got = resolver.resolve("did:ap2:merchant:cloudline").await.unwrap();
        assert_eq!(got.id, "did:ap2:merchant:cloudline");

        // Cached now - resolvable without the network tier.
        assert!(cache.get("did:ap2:merchant:cloudline").unwrap().is_some());
    }

    #[test]
    fn test_inline_key_ref_decoding() {
        let resolver = DidResolver::in_process();
        let encoded = BASE64.encode("-----BEGIN PUBLIC KEY-----");
        assert_eq!(
            resolver.resolve_pem(&encoded).as_deref(),
            Some("-----BEGIN PUBLIC KEY-----")
        );
        assert!(resolver.resolve_pem("did:ap2:agent:x#key-1").is_none());
    }
}
