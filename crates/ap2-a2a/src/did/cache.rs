//! SQLite-backed merchant DID cache.
//!
//! One row per merchant; read-through for the resolver, written when a
//! central registry lookup succeeds or a merchant registers locally.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};

use super::registry::{MerchantRecord, RegistryError};

const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS merchant_dids (
    did                    TEXT PRIMARY KEY,
    name                   TEXT NOT NULL,
    endpoint               TEXT NOT NULL,
    public_key_pem         TEXT NOT NULL,
    verification_method_id TEXT NOT NULL,
    status                 TEXT NOT NULL DEFAULT 'active',
    trust_score            REAL NOT NULL DEFAULT 0,
    created_at             TEXT NOT NULL,
    updated_at             TEXT NOT NULL
);
"#;

/// Local DID cache; all access serialized through one connection.
#[derive(Clone)]
pub struct DidCache {
    conn: Arc<Mutex<Connection>>,
}

impl DidCache {
    /// Open a file-backed cache.
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        let conn = Connection::open(path).map_err(RegistryError::database)?;
        Self::from_connection(conn)
    }

    /// Create an in-memory cache (for testing).
    pub fn memory() -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory().map_err(RegistryError::database)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, RegistryError> {
        conn.execute_batch(CACHE_SCHEMA)
            .map_err(RegistryError::database)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert or refresh a record; `updated_at` is bumped on every write.
    pub fn upsert(&self, record: &MerchantRecord) -> Result<(), RegistryError> {
        let conn = self.conn.lock().expect("did cache mutex poisoned");
        conn.execute(
            "INSERT INTO merchant_dids
               (did, name, endpoint, public_key_pem, verification_method_id,
                status, trust_score, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(did) DO UPDATE SET
               name = excluded.name,
               endpoint = excluded.endpoint,
               public_key_pem = excluded.public_key_pem,
               verification_method_id = excluded.verification_method_id,
               status = excluded.status,
               trust_score = excluded.trust_score,
               updated_at = excluded.updated_at",
            rusqlite::params![
                record.did,
                record.name,
                record.endpoint,
                record.public_key_pem,
                record.verification_method_id,
                record.status,
                record.trust_score,
                record.created_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(RegistryError::database)?;
        Ok(())
    }

    /// Look up one record by DID.
    pub fn get(&self, did: &str) -> Result<Option<MerchantRecord>, RegistryError> {
        let conn = self.conn.lock().expect("did cache mutex poisoned");
        conn.query_row(
            "SELECT did, name, endpoint, public_key_pem, verification_method_id,
                    status, trust_score, created_at, updated_at
             FROM merchant_dids WHERE did = ?1",
            [did],
            MerchantRecord::from_row,
        )
        .optional()
        .map_err(RegistryError::database)
    }

    /// Case-insensitive name search, for merchant discovery.
    pub fn search(&self, query: &str) -> Result<Vec<MerchantRecord>, RegistryError> {
        let conn = self.conn.lock().expect("did cache mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT did, name, endpoint, public_key_pem, verification_method_id,
                        status, trust_score, created_at, updated_at
                 FROM merchant_dids
                 WHERE name LIKE '%' || ?1 || '%' AND status = 'active'
                 ORDER BY trust_score DESC",
            )
            .map_err(RegistryError::database)?;
        let rows = stmt
            .query_map([query], MerchantRecord::from_row)
            .map_err(RegistryError::database)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(RegistryError::database)?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(did: &str, name: &str) -> MerchantRecord {
        MerchantRecord {
            did: did.to_string(),
            name: name.to_string(),
            endpoint: "http://localhost:9100".to_string(),
            public_key_pem: "PEM".to_string(),
            verification_method_id: format!("{did}#key-1"),
            status: "active".to_string(),
            trust_score: 0.8,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let cache = DidCache::memory().unwrap();
        let rec = record("did:ap2:merchant:zephyr", "Zephyr Running");
        cache.upsert(&rec).unwrap();

        let got = cache.get("did:ap2:merchant:zephyr").unwrap().unwrap();
        assert_eq!(got.name, "Zephyr Running");
        assert_eq!(got.trust_score, 0.8);
    }

    #[test]
    fn test_get_missing_is_none() {
        let cache = DidCache::memory().unwrap();
        assert!(cache.get("did:ap2:merchant:ghost").unwrap().is_none());
    }

    #[test]
    fn test_upsert_refreshes_existing() {
        let cache = DidCache::memory().unwrap();
        let mut rec = record("did:ap2:merchant:zephyr", "Zephyr Running");
        cache.upsert(&rec).unwrap();

        rec.endpoint = "http://localhost:9200".to_string();
        cache.upsert(&rec).unwrap();

        let got = cache.get("did:ap2:merchant:zephyr").unwrap().unwrap();
        assert_eq!(got.endpoint, "http://localhost:9200");
    }

    #[test]
    fn test_search_by_name() {
        let cache = DidCache::memory().unwrap();
        cache.upsert(&record("did:ap2:merchant:a", "Zephyr Running")).unwrap();
        cache.upsert(&record("did:ap2:merchant:b", "Cloudline Shoes")).unwrap();

        let hits = cache.search("zephyr").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].did, "did:ap2:merchant:a");
    }
}
