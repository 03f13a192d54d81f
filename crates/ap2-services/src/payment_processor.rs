//! The payment processor: validates the chain, obtains credentials, and
//! runs the authorization state machine.
//!
//! ```text
//! INIT → AUTHORIZING → AUTHORIZED → CAPTURING → CAPTURED → (REFUNDING →) REFUNDED
//!             │                          │
//!             └────────── FAILED ────────┘
//! ```
//!
//! Every transition is keyed on the transaction id and idempotent: a
//! duplicated capture or refund returns the recorded result instead of
//! acting twice. A failed verifier check is never retried.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use ap2_common::{Amount, ErrorCode, ProtocolError};
use ap2_a2a::{types, HandlerOutcome, MessageHandler};
use ap2_mandate::crypto::keys::AgentKeys;
use ap2_mandate::PaymentMandate;
use ap2_verifier::Verifier;

use crate::credential_provider::CredentialProviderService;
use crate::merchant_agent::PaymentPort;
use crate::wire::{CredentialsEnvelope, PaymentRequest, TransactionResult, TransactionStatus};

/// Seam to the credential provider (in-process or A2A/HTTP).
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn request_credentials(
        &self,
        payment: &PaymentMandate,
        otp: Option<&str>,
    ) -> Result<CredentialsEnvelope, ProtocolError>;
}

/// In-process source wrapping a co-hosted credential provider.
pub struct LocalCredentialSource(pub Arc<CredentialProviderService>);

#[async_trait]
impl CredentialSource for LocalCredentialSource {
    async fn request_credentials(
        &self,
        payment: &PaymentMandate,
        otp: Option<&str>,
    ) -> Result<CredentialsEnvelope, ProtocolError> {
        self.0.request_payment_credentials(payment, otp)
    }
}

/// Deterministic authorization failure injection by card last4.
fn failure_for_last4(last4: &str) -> Option<(ErrorCode, &'static str)> {
    match last4 {
        "0001" => Some((ErrorCode::InsufficientFunds, "insufficient funds")),
        "0002" => Some((ErrorCode::CardDeclined, "card declined by issuer")),
        "0003" => Some((ErrorCode::ExpiredCard, "card expired")),
        "0005" => Some((ErrorCode::FraudSuspected, "transaction blocked as suspected fraud")),
        _ => None,
    }
}

const TRANSACTION_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS transactions (
    id                 TEXT PRIMARY KEY,
    payment_mandate_id TEXT NOT NULL,
    intent_mandate_id  TEXT NOT NULL,
    cart_mandate_id    TEXT NOT NULL,
    payer_id           TEXT NOT NULL,
    payee_id           TEXT NOT NULL,
    status             TEXT NOT NULL,
    amount_value       TEXT NOT NULL,
    amount_currency    TEXT NOT NULL,
    risk_score         INTEGER,
    device_attested    INTEGER NOT NULL DEFAULT 0,
    authorized_at      TEXT,
    captured_at        TEXT,
    receipt_url        TEXT,
    error_code         TEXT,
    error_message      TEXT,
    created_at         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transactions_intent ON transactions(intent_mandate_id);
CREATE INDEX IF NOT EXISTS idx_transactions_payer ON transactions(payer_id);
CREATE INDEX IF NOT EXISTS idx_transactions_payee ON transactions(payee_id);
CREATE INDEX IF NOT EXISTS idx_transactions_status ON transactions(status);
"#;

/// One persisted transaction.
#[derive(Debug, Clone)]
pub struct TransactionRow {
    pub id: String,
    pub payment_mandate_id: String,
    pub intent_mandate_id: String,
    pub cart_mandate_id: String,
    pub payer_id: String,
    pub payee_id: String,
    pub status: TransactionStatus,
    pub amount: Amount,
    pub risk_score: Option<u8>,
    pub device_attested: bool,
    pub authorized_at: Option<DateTime<Utc>>,
    pub captured_at: Option<DateTime<Utc>>,
    pub receipt_url: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
}

impl TransactionRow {
    pub fn to_result(&self) -> TransactionResult {
        TransactionResult {
            id: self.id.clone(),
            status: self.status,
            payment_mandate_id: self.payment_mandate_id.clone(),
            amount: Some(self.amount.clone()),
            authorized_at: self.authorized_at,
            captured_at: self.captured_at,
            receipt_url: self.receipt_url.clone(),
            error_code: self.error_code,
            error_message: self.error_message.clone(),
        }
    }
}

/// Counts by lifecycle state, for audit summaries.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TransactionStats {
    pub total: u32,
    pub authorized: u32,
    pub captured: u32,
    pub refunded: u32,
    pub failed: u32,
}

/// SQLite-backed transaction store.
#[derive(Clone)]
pub struct TransactionStore {
    conn: Arc<Mutex<Connection>>,
}

impl TransactionStore {
    pub fn open(path: &Path) -> Result<Self, ProtocolError> {
        let conn = Connection::open(path).map_err(db_error)?;
        Self::from_connection(conn)
    }

    pub fn memory() -> Result<Self, ProtocolError> {
        let conn = Connection::open_in_memory().map_err(db_error)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, ProtocolError> {
        conn.execute_batch(TRANSACTION_SCHEMA).map_err(db_error)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn insert(&self, row: &TransactionRow) -> Result<(), ProtocolError> {
        let conn = self.conn.lock().expect("transaction store mutex poisoned");
        conn.execute(
            "INSERT INTO transactions
               (id, payment_mandate_id, intent_mandate_id, cart_mandate_id, payer_id, payee_id,
                status, amount_value, amount_currency, risk_score, device_attested,
                authorized_at, captured_at, receipt_url, error_code, error_message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            rusqlite::params![
                row.id,
                row.payment_mandate_id,
                row.intent_mandate_id,
                row.cart_mandate_id,
                row.payer_id,
                row.payee_id,
                status_str(row.status),
                row.amount.value.to_string(),
                row.amount.currency,
                row.risk_score,
                row.device_attested as i32,
                row.authorized_at.map(|t| t.to_rfc3339()),
                row.captured_at.map(|t| t.to_rfc3339()),
                row.receipt_url,
                row.error_code.map(|c| c.as_str()),
                row.error_message,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(db_error)?;
        Ok(())
    }

    fn update_status(
        &self,
        id: &str,
        status: TransactionStatus,
        captured_at: Option<DateTime<Utc>>,
        receipt_url: Option<&str>,
    ) -> Result<(), ProtocolError> {
        let conn = self.conn.lock().expect("transaction store mutex poisoned");
        conn.execute(
            "UPDATE transactions
             SET status = ?2,
                 captured_at = COALESCE(?3, captured_at),
                 receipt_url = COALESCE(?4, receipt_url)
             WHERE id = ?1",
            rusqlite::params![
                id,
                status_str(status),
                captured_at.map(|t| t.to_rfc3339()),
                receipt_url,
            ],
        )
        .map_err(db_error)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<TransactionRow>, ProtocolError> {
        let conn = self.conn.lock().expect("transaction store mutex poisoned");
        conn.query_row(
            &format!("{SELECT_ROW} WHERE id = ?1"),
            [id],
            row_from_sql,
        )
        .optional()
        .map_err(db_error)
    }

    pub fn by_intent(&self, intent_mandate_id: &str) -> Result<Vec<TransactionRow>, ProtocolError> {
        self.query_many(&format!("{SELECT_ROW} WHERE intent_mandate_id = ?1"), intent_mandate_id)
    }

    pub fn by_payer(&self, payer_id: &str) -> Result<Vec<TransactionRow>, ProtocolError> {
        self.query_many(&format!("{SELECT_ROW} WHERE payer_id = ?1"), payer_id)
    }

    pub fn by_payee(&self, payee_id: &str) -> Result<Vec<TransactionRow>, ProtocolError> {
        self.query_many(&format!("{SELECT_ROW} WHERE payee_id = ?1"), payee_id)
    }

    pub fn by_status(&self, status: TransactionStatus) -> Result<Vec<TransactionRow>, ProtocolError> {
        self.query_many(&format!("{SELECT_ROW} WHERE status = ?1"), status_str(status))
    }

    pub fn stats(&self) -> Result<TransactionStats, ProtocolError> {
        let conn = self.conn.lock().expect("transaction store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM transactions GROUP BY status")
            .map_err(db_error)?;
        let mut stats = TransactionStats::default();
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
            })
            .map_err(db_error)?;
        for row in rows {
            let (status, count) = row.map_err(db_error)?;
            stats.total += count;
            match status.as_str() {
                "AUTHORIZED" => stats.authorized += count,
                "CAPTURED" => stats.captured += count,
                "REFUNDED" => stats.refunded += count,
                "FAILED" => stats.failed += count,
                _ => {}
            }
        }
        Ok(stats)
    }

    fn query_many(&self, sql: &str, param: &str) -> Result<Vec<TransactionRow>, ProtocolError> {
        let conn = self.conn.lock().expect("transaction store mutex poisoned");
        let mut stmt = conn.prepare(sql).map_err(db_error)?;
        let rows = stmt
            .query_map([param], row_from_sql)
            .map_err(db_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_error)?;
        Ok(rows)
    }
}

const SELECT_ROW: &str = "SELECT id, payment_mandate_id, intent_mandate_id, cart_mandate_id,
        payer_id, payee_id, status, amount_value, amount_currency, risk_score, device_attested,
        authorized_at, captured_at, receipt_url, error_code, error_message
 FROM transactions";

fn row_from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransactionRow> {
    let status: String = row.get(6)?;
    let value: String = row.get(7)?;
    let currency: String = row.get(8)?;
    let error_code: Option<String> = row.get(14)?;
    let parse_time = |s: Option<String>| {
        s.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|t| t.with_timezone(&Utc))
        })
    };
    Ok(TransactionRow {
        id: row.get(0)?,
        payment_mandate_id: row.get(1)?,
        intent_mandate_id: row.get(2)?,
        cart_mandate_id: row.get(3)?,
        payer_id: row.get(4)?,
        payee_id: row.get(5)?,
        status: status_from_str(&status),
        amount: Amount::new(value.parse().unwrap_or_default(), currency),
        risk_score: row.get(9)?,
        device_attested: row.get::<_, i32>(10)? != 0,
        authorized_at: parse_time(row.get(11)?),
        captured_at: parse_time(row.get(12)?),
        receipt_url: row.get(13)?,
        error_code: error_code.and_then(|c| {
            serde_json::from_value(serde_json::Value::String(c)).ok()
        }),
        error_message: row.get(15)?,
    })
}

fn status_str(status: TransactionStatus) -> &'static str {
    match status {
        TransactionStatus::Init => "INIT",
        TransactionStatus::Authorizing => "AUTHORIZING",
        TransactionStatus::Authorized => "AUTHORIZED",
        TransactionStatus::Capturing => "CAPTURING",
        TransactionStatus::Captured => "CAPTURED",
        TransactionStatus::Refunding => "REFUNDING",
        TransactionStatus::Refunded => "REFUNDED",
        TransactionStatus::Failed => "FAILED",
    }
}

fn status_from_str(s: &str) -> TransactionStatus {
    match s {
        "AUTHORIZING" => TransactionStatus::Authorizing,
        "AUTHORIZED" => TransactionStatus::Authorized,
        "CAPTURING" => TransactionStatus::Capturing,
        "CAPTURED" => TransactionStatus::Captured,
        "REFUNDING" => TransactionStatus::Refunding,
        "REFUNDED" => TransactionStatus::Refunded,
        "FAILED" => TransactionStatus::Failed,
        _ => TransactionStatus::Init,
    }
}

fn db_error(e: rusqlite::Error) -> ProtocolError {
    ProtocolError::new(ErrorCode::InternalError, "transaction store error")
        .with_detail("reason", e.to_string())
}

struct PendingChallenge {
    request: PaymentRequest,
    risk_score: u8,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

/// One payment processor identity.
pub struct PaymentProcessorService {
    #[allow(dead_code)]
    processor_id: String,
    did: String,
    #[allow(dead_code)]
    keys: Arc<AgentKeys>,
    verifier: Verifier,
    credentials: Arc<dyn CredentialSource>,
    store: TransactionStore,
    pending: Mutex<HashMap<String, PendingChallenge>>,
}

impl PaymentProcessorService {
    pub fn new(
        processor_id: impl Into<String>,
        did: impl Into<String>,
        keys: Arc<AgentKeys>,
        verifier: Verifier,
        credentials: Arc<dyn CredentialSource>,
        store: TransactionStore,
    ) -> Self {
        Self {
            processor_id: processor_id.into(),
            did: did.into(),
            keys,
            verifier,
            credentials,
            store,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    pub fn store(&self) -> &TransactionStore {
        &self.store
    }

    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    /// Authorize a payment.
    ///
    /// Verifies the full chain, obtains credentials from the provider, and
    /// simulates the network authorization. A high-risk payment without an
    /// OTP parks as a pending challenge and surfaces `CHALLENGE_REQUIRED`
    /// with the fresh transaction id.
    pub async fn authorize(
        &self,
        request: PaymentRequest,
    ) -> Result<TransactionResult, ProtocolError> {
        self.verifier.verify_chain(
            &request.payment_mandate,
            &request.cart_mandate,
            &request.intent_mandate,
            Utc::now(),
        )?;

        let credentials = match self
            .credentials
            .request_credentials(&request.payment_mandate, request.otp.as_deref())
            .await
        {
            Ok(credentials) => credentials,
            Err(error) if error.error_code == ErrorCode::ChallengeRequired => {
                let transaction_id = new_transaction_id();
                let risk_score = request.payment_mandate.risk_score.unwrap_or(0);
                tracing::info!(
                    transaction_id = %transaction_id,
                    risk_score,
                    "high-risk payment parked pending OTP"
                );
                self.pending.lock().expect("pending mutex poisoned").insert(
                    transaction_id.clone(),
                    PendingChallenge {
                        request: PaymentRequest { otp: None, ..request },
                        risk_score,
                        created_at: Utc::now(),
                    },
                );
                return Err(ProtocolError::new(
                    ErrorCode::ChallengeRequired,
                    "additional authentication required",
                )
                .with_detail("transaction_id", transaction_id)
                .with_detail("risk_score", risk_score));
            }
            Err(error) => return Err(error),
        };

        let transaction_id = new_transaction_id();
        let payment = &request.payment_mandate;
        let mut row = TransactionRow {
            id: transaction_id.clone(),
            payment_mandate_id: payment.id.clone(),
            intent_mandate_id: payment.intent_mandate_id.clone(),
            cart_mandate_id: payment.cart_mandate_id.clone(),
            payer_id: payment.payer_id.clone(),
            payee_id: payment.payee_id.clone(),
            status: TransactionStatus::Authorizing,
            amount: payment.amount.clone(),
            risk_score: payment.risk_score,
            device_attested: payment.device_attestation.is_some(),
            authorized_at: None,
            captured_at: None,
            receipt_url: None,
            error_code: None,
            error_message: None,
        };

        match failure_for_last4(&credentials.last4) {
            Some((code, message)) => {
                row.status = TransactionStatus::Failed;
                row.error_code = Some(code);
                row.error_message = Some(message.to_string());
                self.store.insert(&row)?;
                tracing::warn!(
                    transaction_id = %transaction_id,
                    code = %code,
                    "authorization declined by network"
                );
            }
            None => {
                row.status = TransactionStatus::Authorized;
                row.authorized_at = Some(Utc::now());
                self.store.insert(&row)?;
                tracing::info!(
                    transaction_id = %transaction_id,
                    amount = %row.amount,
                    "authorization approved"
                );
            }
        }

        Ok(row.to_result())
    }

    /// Complete a pending OTP challenge.
    ///
    /// Re-runs the stored authorization with the supplied OTP. On an
    /// invalid OTP the challenge stays pending so the user can retry.
    pub async fn complete_challenge(
        &self,
        transaction_id: &str,
        otp: &str,
    ) -> Result<TransactionResult, ProtocolError> {
        let request = {
            let pending = self.pending.lock().expect("pending mutex poisoned");
            let challenge = pending.get(transaction_id).ok_or_else(|| {
                ProtocolError::new(ErrorCode::InvalidRequest, "no pending challenge")
                    .with_detail("transaction_id", transaction_id)
            })?;
            tracing::info!(
                transaction_id,
                risk_score = challenge.risk_score,
                "completing OTP challenge"
            );
            PaymentRequest {
                otp: Some(otp.to_string()),
                ..challenge.request.clone()
            }
        };

        let result = self.authorize(request).await?;
        self.pending
            .lock()
            .expect("pending mutex poisoned")
            .remove(transaction_id);
        Ok(result)
    }

    /// Capture an authorized transaction. Idempotent.
    pub fn capture(&self, transaction_id: &str) -> Result<TransactionResult, ProtocolError> {
        let row = self.require(transaction_id)?;
        match row.status {
            TransactionStatus::Captured => Ok(row.to_result()),
            TransactionStatus::Authorized => {
                let captured_at = Utc::now();
                let receipt_url =
                    format!("https://receipts.ap2.example/{transaction_id}.pdf");
                self.store.update_status(
                    transaction_id,
                    TransactionStatus::Captured,
                    Some(captured_at),
                    Some(&receipt_url),
                )?;
                tracing::info!(transaction_id, "transaction captured");
                self.require(transaction_id).map(|r| r.to_result())
            }
            status => Err(invalid_transition(transaction_id, status, "capture")),
        }
    }

    /// Refund a captured transaction, full amount when omitted. Idempotent.
    pub fn refund(
        &self,
        transaction_id: &str,
        amount: Option<Amount>,
    ) -> Result<TransactionResult, ProtocolError> {
        let row = self.require(transaction_id)?;
        match row.status {
            TransactionStatus::Refunded => Ok(row.to_result()),
            TransactionStatus::Captured => {
                if let Some(refund) = &amount {
                    let over = refund.gt(&row.amount).map_err(|e| {
                        ProtocolError::new(ErrorCode::InvalidAmount, e.to_string())
                    })?;
                    if over {
                        return Err(ProtocolError::new(
                            ErrorCode::InvalidAmount,
                            "refund exceeds captured amount",
                        )
                        .with_detail("transaction_id", transaction_id)
                        .with_detail("refund", refund)
                        .with_detail("captured", &row.amount));
                    }
                }
                self.store
                    .update_status(transaction_id, TransactionStatus::Refunded, None, None)?;
                tracing::info!(transaction_id, "transaction refunded");
                self.require(transaction_id).map(|r| r.to_result())
            }
            status => Err(invalid_transition(transaction_id, status, "refund")),
        }
    }

    fn require(&self, transaction_id: &str) -> Result<TransactionRow, ProtocolError> {
        self.store.get(transaction_id)?.ok_or_else(|| {
            ProtocolError::new(ErrorCode::InvalidRequest, "unknown transaction")
                .with_detail("transaction_id", transaction_id)
        })
    }

    /// Register the processor's A2A surface: authorization requests.
    pub fn register_handlers(self: &Arc<Self>, handler: &mut MessageHandler) {
        let service = Arc::clone(self);
        handler.register_fn(types::PAYMENT_MANDATE, move |message| {
            let service = Arc::clone(&service);
            async move {
                let request: PaymentRequest =
                    serde_json::from_value(message.data_part.payload.clone()).map_err(|e| {
                        ProtocolError::new(
                            ErrorCode::InvalidRequest,
                            "payload is not a payment request",
                        )
                        .with_detail("reason", e.to_string())
                    })?;
                let payment_id = request.payment_mandate.id.clone();
                let result = service.authorize(request).await?;
                Ok(HandlerOutcome::new(
                    types::PAYMENT_RESULT,
                    payment_id,
                    serde_json::to_value(&result).unwrap_or_default(),
                ))
            }
        });
    }
}

#[async_trait]
impl PaymentPort for PaymentProcessorService {
    async fn authorize(&self, request: PaymentRequest) -> Result<TransactionResult, ProtocolError> {
        PaymentProcessorService::authorize(self, request).await
    }
}

fn new_transaction_id() -> String {
    format!("txn_{}", &Uuid::new_v4().simple().to_string()[..12])
}

fn invalid_transition(
    transaction_id: &str,
    status: TransactionStatus,
    action: &str,
) -> ProtocolError {
    ProtocolError::new(
        ErrorCode::InvalidRequest,
        format!("transaction not eligible for {action}"),
    )
    .with_detail("transaction_id", transaction_id)
    .with_detail("status", status)
}
