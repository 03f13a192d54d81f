//! Central merchant registry client.
//!
//! Thin HTTP client over the registry's REST surface. Transient failures
//! (connect errors, 5xx) are retried up to a small bound with jittered
//! backoff; 404 means the DID simply is not registered.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::document::DidDocument;

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 200;

/// Registry/cache failure modes.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Http(String),

    #[error("registry returned status {status}")]
    Status { status: u16 },

    #[error("registry response malformed: {0}")]
    Decode(String),

    #[error("database error: {0}")]
    Database(String),
}

impl RegistryError {
    pub(crate) fn database(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// One registered merchant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MerchantRecord {
    pub did: String,
    pub name: String,
    /// Base URL of the merchant's A2A endpoint.
    pub endpoint: String,
    pub public_key_pem: String,
    pub verification_method_id: String,
    /// `active` | `suspended`.
    pub status: String,
    pub trust_score: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MerchantRecord {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let parse = |s: String| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now())
        };
        Ok(Self {
            did: row.get(0)?,
            name: row.get(1)?,
            endpoint: row.get(2)?,
            public_key_pem: row.get(3)?,
            verification_method_id: row.get(4)?,
            status: row.get(5)?,
            trust_score: row.get(6)?,
            created_at: parse(row.get::<_, String>(7)?),
            updated_at: parse(row.get::<_, String>(8)?),
        })
    }

    /// Project the record into a single-key DID document.
    pub fn to_did_document(&self) -> DidDocument {
        DidDocument {
            id: self.did.clone(),
            verification_method: vec![super::document::VerificationMethod {
                id: self.verification_method_id.clone(),
                method_type: "EcdsaSecp256r1VerificationKey2019".to_string(),
                controller: self.did.clone(),
                public_key_pem: self.public_key_pem.clone(),
            }],
            authentication: vec!["#key-1".to_string()],
            assertion_method: vec!["#key-1".to_string()],
        }
    }
}

/// HTTP client for the central registry.
#[derive(Clone)]
pub struct RegistryClient {
    base_url: String,
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client construction cannot fail with static config");
        Self {
            base_url: base_url.into(),
            http,
        }
    }

    /// Resolve one DID. `Ok(None)` means "not registered".
    pub async fn resolve(&self, did: &str) -> Result<Option<MerchantRecord>, RegistryError> {
        let url = format!("{}/registry/dids/{}", self.base_url, did);
        let response = self.get_with_retry(&url).await?;

        match response.status().as_u16() {
            404 => Ok(None),
            200 => response
                .json::<MerchantRecord>()
                .await
                .map(Some)
                .map_err(|e| RegistryError::Decode(e.to_string())),
            status => Err(RegistryError::Status { status }),
        }
    }

    /// Register or refresh a merchant record.
    pub async fn register(&self, record: &MerchantRecord) -> Result<(), RegistryError> {
        let url = format!("{}/registry/dids", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(record)
            .send()
            .await
            .map_err(|e| RegistryError::Http(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(RegistryError::Status {
                status: response.status().as_u16(),
            })
        }
    }

    /// Search merchants by name.
    pub async fn search(&self, query: &str) -> Result<Vec<MerchantRecord>, RegistryError> {
        let url = format!("{}/registry/dids", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("query", query)])
            .send()
            .await
            .map_err(|e| RegistryError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RegistryError::Status {
                status: response.status().as_u16(),
            });
        }
        response
            .json::<Vec<MerchantRecord>>()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))
    }

    async fn get_with_retry(&self, url: &str) -> Result<reqwest::Response, RegistryError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.http.get(url).send().await {
                Ok(response) if response.status().is_server_error() && attempt < MAX_ATTEMPTS => {
                    tracing::warn!(url, attempt, status = %response.status(), "registry 5xx, retrying");
                }
                Ok(response) => return Ok(response),
                Err(e) if attempt < MAX_ATTEMPTS => {
                    tracing::warn!(url, attempt, error = %e, "registry request failed, retrying");
                }
                Err(e) => return Err(RegistryError::Http(e.to_string())),
            }

            let jitter = rand::thread_rng().gen_range(0..BASE_BACKOFF_MS);
            let backoff = BASE_BACKOFF_MS * 2u64.pow(attempt - 1) + jitter;
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }
    }
}
