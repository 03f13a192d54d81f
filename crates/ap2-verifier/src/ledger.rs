//! SQLite-backed intent → payment ledger.
//!
//! One row per recorded payment. Recording is atomic and idempotent: the
//! `max_transactions` bound is re-checked inside the same transaction that
//! inserts, so two concurrent recordings against a nearly-exhausted intent
//! cannot both land.

use std::path::Path;
use std::sync::{Arc, Mutex};

use ap2_common::{ErrorCode, ProtocolError};
use chrono::Utc;
use rusqlite::Connection;

const LEDGER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS intent_payments (
    payment_mandate_id TEXT PRIMARY KEY,
    intent_mandate_id  TEXT NOT NULL,
    recorded_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_intent_payments_intent
    ON intent_payments(intent_mandate_id);
"#;

/// Durable record of which payments consumed which intents.
#[derive(Clone)]
pub struct TransactionLedger {
    conn: Arc<Mutex<Connection>>,
}

impl TransactionLedger {
    /// Open a file-backed ledger.
    pub fn open(path: &Path) -> Result<Self, ProtocolError> {
        let conn = Connection::open(path).map_err(db_error)?;
        Self::from_connection(conn)
    }

    /// Create an in-memory ledger (for testing).
    pub fn memory() -> Result<Self, ProtocolError> {
        let conn = Connection::open_in_memory().map_err(db_error)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, ProtocolError> {
        conn.execute_batch(LEDGER_SCHEMA).map_err(db_error)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Payments recorded against an intent.
    pub fn transaction_count(&self, intent_mandate_id: &str) -> Result<u32, ProtocolError> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        conn.query_row(
            "SELECT COUNT(*) FROM intent_payments WHERE intent_mandate_id = ?1",
            [intent_mandate_id],
            |row| row.get(0),
        )
        .map_err(db_error)
    }

    /// Payment ids recorded against an intent, oldest first.
    pub fn payments_for_intent(
        &self,
        intent_mandate_id: &str,
    ) -> Result<Vec<String>, ProtocolError> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT payment_mandate_id FROM intent_payments
                 WHERE intent_mandate_id = ?1 ORDER BY recorded_at",
            )
            .map_err(db_error)?;
        let rows = stmt
            .query_map([intent_mandate_id], |row| row.get(0))
            .map_err(db_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_error)?;
        Ok(rows)
    }

    /// Record a payment against an intent, enforcing `max_transactions`.
    ///
    /// Idempotent on `payment_mandate_id`: re-recording the same payment is
    /// a no-op, not a second consumption. The `(n+1)`-th distinct payment
    /// fails with `CONSTRAINT_VIOLATION`.
    pub fn record(
        &self,
        intent_mandate_id: &str,
        payment_mandate_id: &str,
        max_transactions: u32,
    ) -> Result<(), ProtocolError> {
        let mut conn = self.conn.lock().expect("ledger mutex poisoned");
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(db_error)?;

        let already: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM intent_payments WHERE payment_mandate_id = ?1)",
                [payment_mandate_id],
                |row| row.get(0),
            )
            .map_err(db_error)?;
        if already {
            return Ok(());
        }

        let count: u32 = tx
            .query_row(
                "SELECT COUNT(*) FROM intent_payments WHERE intent_mandate_id = ?1",
                [intent_mandate_id],
                |row| row.get(0),
            )
            .map_err(db_error)?;

        if count >= max_transactions {
            return Err(ProtocolError::new(
                ErrorCode::ConstraintViolation,
                "intent max_transactions exhausted",
            )
            .with_detail("intent_mandate_id", intent_mandate_id)
            .with_detail("max_transactions", max_transactions)
            .with_detail("current_transactions", count));
        }

        tx.execute(
            "INSERT INTO intent_payments (payment_mandate_id, intent_mandate_id, recorded_at)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![payment_mandate_id, intent_mandate_id, Utc::now().to_rfc3339()],
        )
        .map_err(db_error)?;

        tx.commit().map_err(db_error)?;
        tracing::info!(
            intent_mandate_id,
            payment_mandate_id,
            used = count + 1,
            max_transactions,
            "recorded transaction"
        );
        Ok(())
    }
}

fn db_error(e: rusqlite::Error) -> ProtocolError {
    ProtocolError::new(ErrorCode::InternalError, "ledger database error")
        .with_detail("reason", e.to_string())
}
