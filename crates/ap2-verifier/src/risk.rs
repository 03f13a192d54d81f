//! Weighted-factor risk assessment for payment mandates.
//!
//! Eight factors, each scored in its own band, combined as a weighted mean
//! and clamped to 0..=100. Reference weights (tuned from the card-network
//! defaults; amount carries the most):
//!
//! | Factor | Range | Weight |
//! |--------|-------|--------|
//! | amount_risk | 0-80 | 2.5 |
//! | constraint_risk | 0-50 | 2.0 |
//! | agent_risk | 0-5 | 0.5 |
//! | transaction_type_risk | 0-15 | 1.0 |
//! | payment_method_risk | 0-25 | 1.2 |
//! | pattern_risk | 0-30 | 1.3 |
//! | shipping_risk | 0-20 | 0.8 |
//! | temporal_risk | 0-15 | 0.7 |
//!
//! Thresholds: `<30` approve, `<80` review, `≥80` decline. An intent whose
//! transaction budget is already exhausted short-circuits to decline.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use ap2_common::{ErrorCode, ProtocolError};
use chrono::{DateTime, Datelike, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use ap2_mandate::{CartMandate, IntentMandate, PaymentMandate, TransactionType};

const APPROVE_BELOW: u8 = 30;
const DECLINE_AT: u8 = 80;

/// What the engine recommends doing with the payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Approve,
    Review,
    Decline,
}

/// The full assessment attached to a payment before authorization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// 0 = lowest risk, 100 = highest.
    pub risk_score: u8,
    pub fraud_indicators: Vec<String>,
    pub risk_factors: BTreeMap<String, u32>,
    pub recommendation: Recommendation,
}

struct HistoryEntry {
    at: DateTime<Utc>,
    amount: Decimal,
}

/// Stateful risk engine; history is per payer, retained 30 days.
pub struct RiskEngine {
    history: Mutex<HashMap<String, Vec<HistoryEntry>>>,
}

impl RiskEngine {
    pub fn new() -> Self {
        Self {
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Assess one payment against its chain and the payer's history.
    ///
    /// `transaction_count` is the number of payments already recorded for
    /// the intent; at or past the budget the recommendation is a decline
    /// regardless of the factor scores. An expired intent is an error, not
    /// a score.
    pub fn assess(
        &self,
        payment: &PaymentMandate,
        cart: &CartMandate,
        intent: &IntentMandate,
        transaction_count: u32,
        now: DateTime<Utc>,
    ) -> Result<RiskAssessment, ProtocolError> {
        if intent.is_expired(now) {
            return Err(ProtocolError::expired(
                ErrorCode::ExpiredIntent,
                &intent.id,
                &intent.expires_at.to_rfc3339(),
            ));
        }

        let mut factors = BTreeMap::new();
        let mut indicators = Vec::new();

        let amount_risk = self.amount_risk(payment, intent);
        if amount_risk > 30 {
            indicators.push("high_transaction_amount".to_string());
        }
        factors.insert("amount_risk".to_string(), amount_risk);

        let constraint_risk = self.constraint_risk(payment, intent);
        if constraint_risk > 0 {
            indicators.push("intent_constraint_violation".to_string());
        }
        factors.insert("constraint_risk".to_string(), constraint_risk);

        let agent_risk = if payment.agent_involved { 5 } else { 0 };
        factors.insert("agent_risk".to_string(), agent_risk);

        let transaction_type_risk = match payment.transaction_type {
            TransactionType::UserNotPresent => {
                indicators.push("card_not_present_transaction".to_string());
                15
            }
            TransactionType::UserPresent => 5,
        };
        factors.insert("transaction_type_risk".to_string(), transaction_type_risk);

        let payment_method_risk = self.payment_method_risk(payment, now);
        if payment_method_risk > 20 {
            indicators.push("payment_method_risk".to_string());
        }
        factors.insert("payment_method_risk".to_string(), payment_method_risk);

        let pattern_risk = self.pattern_risk(&payment.payer_id, &payment.amount.value, now);
        if pattern_risk >= 30 {
            indicators.push("unusual_transaction_pattern".to_string());
        }
        factors.insert("pattern_risk".to_string(), pattern_risk);

        let shipping_risk = self.shipping_risk(cart);
        if shipping_risk > 15 {
            indicators.push("shipping_address_risk".to_string());
        }
        factors.insert("shipping_risk".to_string(), shipping_risk);

        let temporal_risk = self.temporal_risk(intent.created_at, payment.created_at);
        if temporal_risk >= 10 {
            indicators.push("suspicious_timing".to_string());
        }
        factors.insert("temporal_risk".to_string(), temporal_risk);

        let risk_score = weighted_score(&factors);

        let recommendation = if transaction_count >= intent.constraints.max_transactions {
            indicators.push("max_transactions_exhausted".to_string());
            Recommendation::Decline
        } else if risk_score < APPROVE_BELOW {
            Recommendation::Approve
        } else if risk_score < DECLINE_AT {
            Recommendation::Review
        } else {
            Recommendation::Decline
        };

        self.record(&payment.payer_id, &payment.amount.value, now);

        Ok(RiskAssessment {
            risk_score,
            fraud_indicators: indicators,
            risk_factors: factors,
            recommendation,
        })
    }

    /// Absolute-amount bands plus proximity to the intent's ceiling. 0-80.
    fn amount_risk(&self, payment: &PaymentMandate, intent: &IntentMandate) -> u32 {
        let value = payment.amount.value;
        let mut risk: u32 = if value >= Decimal::from(10_000) {
            60
        } else if value >= Decimal::from(5_000) {
            45
        } else if value >= Decimal::from(1_000) {
            35
        } else if value >= Decimal::from(500) {
            25
        } else if value >= Decimal::from(100) {
            10
        } else if value >= Decimal::from(50) {
            5
        } else {
            0
        };

        if let Some(max_amount) = &intent.constraints.max_amount {
            if max_amount.value > Decimal::ZERO && max_amount.currency == payment.amount.currency {
                let ratio = value / max_amount.value;
                if ratio >= Decimal::new(95, 2) {
                    risk += 10;
                } else if ratio >= Decimal::new(80, 2) {
                    risk += 5;
                }
            }
        }

        risk.min(80)
    }

    /// 0 when compliant, 50 on any hard violation. 0-50.
    fn constraint_risk(&self, payment: &PaymentMandate, intent: &IntentMandate) -> u32 {
        let Some(max_amount) = &intent.constraints.max_amount else {
            return 0;
        };
        if payment.amount.currency != max_amount.currency {
            return 50;
        }
        if payment.amount.value > max_amount.value {
            return 50;
        }
        0
    }

    /// Near-expiry or missing tokenization. 0-25.
    fn payment_method_risk(&self, payment: &PaymentMandate, now: DateTime<Utc>) -> u32 {
        let mut risk: u32 = 0;
        let method = &payment.payment_method;

        if method.method_type == "card" {
            let months_until_expiry = (i32::from(method.expiry_year) - now.year()) * 12
                + (i32::from(method.expiry_month) - now.month() as i32);
            if months_until_expiry < 0 {
                risk += 50;
            } else if months_until_expiry <= 3 {
                risk += 10;
            }
            if method.token.is_empty() {
                risk += 15;
            }
        }

        risk.min(25)
    }

    /// New payer, velocity, amount spikes. 0-30.
    fn pattern_risk(&self, payer_id: &str, value: &Decimal, now: DateTime<Utc>) -> u32 {
        let history = self.history.lock().expect("risk history mutex poisoned");
        let Some(entries) = history.get(payer_id) else {
            return 15; // first transaction for this payer
        };
        if entries.is_empty() {
            return 15;
        }

        let mut risk: u32 = 0;
        let recent = entries
            .iter()
            .filter(|e| now - e.at < Duration::hours(24))
            .count();
        if recent >= 5 {
            risk += 30; // card-testing velocity
        } else if recent >= 3 {
            risk += 15;
        }

        let window: Vec<&HistoryEntry> = entries.iter().rev().take(5).collect();
        let sum: Decimal = window.iter().map(|e| e.amount).sum();
        let avg = sum / Decimal::from(window.len() as u64);
        if avg > Decimal::ZERO && *value > avg * Decimal::from(3) {
            risk += 15;
        }

        risk.min(30)
    }

    /// PO-box heuristic plus rushed shipping. 0-20.
    fn shipping_risk(&self, cart: &CartMandate) -> u32 {
        let mut risk: u32 = 0;
        let street = &cart.shipping.address.street;
        if street.contains("P.O.") || street.contains("PO Box") {
            risk += 15;
        }
        if cart.shipping.method == "express" || cart.shipping.method == "overnight" {
            risk += 5;
        }
        risk.min(20)
    }

    /// Intent-to-payment elapsed time: bots are too fast, abandoned carts
    /// too slow. 0-15.
    fn temporal_risk(&self, intent_created: DateTime<Utc>, payment_created: DateTime<Utc>) -> u32 {
        let elapsed = (payment_created - intent_created).num_seconds();
        if elapsed < 5 {
            15
        } else if elapsed < 30 {
            10
        } else if elapsed > 3600 {
            5
        } else {
            0
        }
    }

    fn record(&self, payer_id: &str, value: &Decimal, now: DateTime<Utc>) {
        let mut history = self.history.lock().expect("risk history mutex poisoned");
        let entries = history.entry(payer_id.to_string()).or_default();
        entries.push(HistoryEntry {
            at: now,
            amount: *value,
        });
        entries.retain(|e| now - e.at < Duration::days(30));
    }
}

impl Default for RiskEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn weighted_score(factors: &BTreeMap<String, u32>) -> u8 {
    let weights: &[(&str, f64)] = &[
        ("amount_risk", 2.5),
        ("constraint_risk", 2.0),
        ("agent_risk", 0.5),
        ("transaction_type_risk", 1.0),
        ("payment_method_risk", 1.2),
        ("pattern_risk", 1.3),
        ("shipping_risk", 0.8),
        ("temporal_risk", 0.7),
    ];

    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;
    for (name, weight) in weights {
        if let Some(score) = factors.get(*name) {
            weighted_sum += f64::from(*score) * weight;
            total_weight += weight;
        }
    }
    if total_weight == 0.0 {
        return 0;
    }
    (weighted_sum / total_weight).round().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use ap2_common::money::amount;
    use ap2_mandate::{
        Address, CartItem, IntentConstraints, PaymentMethod, ShippingInfo,
    };

    fn intent(max_amount: &str) -> IntentMandate {
        IntentMandate {
            id: "intent_001".into(),
            mandate_type: "IntentMandate".into(),
            version: "0.1".into(),
            user_id: "user_001".into(),
            user_public_key: "cGVt".into(),
            intent: "running shoes".into(),
            constraints: IntentConstraints {
                max_amount: Some(amount(max_amount, "USD")),
                max_transactions: 1,
                ..Default::default()
            },
            created_at: Utc::now() - Duration::minutes(5),
            expires_at: Utc::now() + Duration::hours(24),
            user_signature: None,
            mandate_metadata: None,
            agent_signal: None,
            risk_payload: None,
        }
    }

    fn cart(total: &str) -> CartMandate {
        CartMandate {
            id: "cart_001".into(),
            mandate_type: "CartMandate".into(),
            version: "0.1".into(),
            intent_mandate_id: "intent_001".into(),
            items: vec![CartItem {
                id: "prod_001".into(),
                name: "Trail Runner".into(),
                quantity: 1,
                unit_price: amount(total, "USD"),
                total_price: amount(total, "USD"),
                category: None,
                brand: None,
                sku: None,
            }],
            subtotal: amount(total, "USD"),
            tax: amount("0.00", "USD"),
            shipping: ShippingInfo {
                address: Address {
                    street: "123 Main St".into(),
                    city: "SF".into(),
                    state: "CA".into(),
                    postal_code: "94105".into(),
                    country: "US".into(),
                },
                method: "standard".into(),
                cost: amount("0.00", "USD"),
                estimated_delivery: None,
            },
            total: amount(total, "USD"),
            merchant_id: "merchant_001".into(),
            merchant_name: "Zephyr".into(),
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::minutes(30),
            merchant_signature: None,
            user_signature: None,
            intent_mandate_hash: "00".repeat(32),
            mandate_metadata: None,
        }
    }

    fn payment(value: &str) -> PaymentMandate {
        PaymentMandate {
            id: "payment_001".into(),
            mandate_type: "PaymentMandate".into(),
            version: "0.1".into(),
            cart_mandate_id: "cart_001".into(),
            intent_mandate_id: "intent_001".into(),
            payment_method: PaymentMethod {
                method_type: "card".into(),
                token: "tok_abc".into(),
                last4: "4242".into(),
                brand: "visa".into(),
                expiry_month: 12,
                expiry_year: 2030,
            },
            amount: amount(value, "USD"),
            transaction_type: TransactionType::UserPresent,
            agent_involved: true,
            payer_id: "user_001".into(),
            payee_id: "merchant_001".into(),
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::minutes(15),
            merchant_signature: None,
            user_signature: None,
            device_attestation: None,
            risk_score: None,
            fraud_indicators: Vec::new(),
            cart_mandate_hash: "11".repeat(32),
            intent_mandate_hash: "22".repeat(32),
            user_authorization: None,
            mandate_metadata: None,
        }
    }

    // === Score bands ===

    #[test]
    fn test_small_user_present_purchase_approves() {
        let engine = RiskEngine::new();
        // Seed history so the new-payer factor doesn't fire.
        engine.record("user_001", &Decimal::from(20), Utc::now() - Duration::days(2));

        let result = engine
            .assess(&payment("25.00"), &cart("25.00"), &intent("100.00"), 0, Utc::now())
            .unwrap();
        assert!(result.risk_score < 30, "score was {}", result.risk_score);
        assert_eq!(result.recommendation, Recommendation::Approve);
    }

    #[test]
    fn test_constraint_violation_flagged() {
        let engine = RiskEngine::new();
        let result = engine
            .assess(&payment("150.00"), &cart("150.00"), &intent("100.00"), 0, Utc::now())
            .unwrap();
        assert!(result
            .fraud_indicators
            .contains(&"intent_constraint_violation".to_string()));
        assert_eq!(result.risk_factors["constraint_risk"], 50);
        // A lone violation raises the score but the weighted mean alone
        // does not decline; the verifier is what hard-rejects it.
        assert!(result.risk_score >= 15);
    }

    #[test]
    fn test_currency_mismatch_is_constraint_violation() {
        let engine = RiskEngine::new();
        let mut p = payment("50.00");
        p.amount = amount("50.00", "EUR");
        let result = engine
            .assess(&p, &cart("50.00"), &intent("100.00"), 0, Utc::now())
            .unwrap();
        assert_eq!(result.risk_factors["constraint_risk"], 50);
    }

    #[test]
    fn test_exhausted_intent_short_circuits_to_decline() {
        let engine = RiskEngine::new();
        let result = engine
            .assess(&payment("25.00"), &cart("25.00"), &intent("100.00"), 1, Utc::now())
            .unwrap();
        assert_eq!(result.recommendation, Recommendation::Decline);
        assert!(result
            .fraud_indicators
            .contains(&"max_transactions_exhausted".to_string()));
    }

    #[test]
    fn test_expired_intent_is_error() {
        let engine = RiskEngine::new();
        let mut i = intent("100.00");
        i.expires_at = Utc::now() - Duration::seconds(1);
        let err = engine
            .assess(&payment("25.00"), &cart("25.00"), &i, 0, Utc::now())
            .unwrap_err();
        assert_eq!(err.error_code, ErrorCode::ExpiredIntent);
    }

    // === Individual factors ===

    #[test]
    fn test_card_not_present_raises_risk() {
        let engine = RiskEngine::new();
        let mut p = payment("25.00");
        p.transaction_type = TransactionType::UserNotPresent;
        let result = engine
            .assess(&p, &cart("25.00"), &intent("100.00"), 0, Utc::now())
            .unwrap();
        assert_eq!(result.risk_factors["transaction_type_risk"], 15);
        assert!(result
            .fraud_indicators
            .contains(&"card_not_present_transaction".to_string()));
    }

    #[test]
    fn test_expired_card_caps_payment_method_risk() {
        let engine = RiskEngine::new();
        let mut p = payment("25.00");
        p.payment_method.expiry_year = 2020;
        let result = engine
            .assess(&p, &cart("25.00"), &intent("100.00"), 0, Utc::now())
            .unwrap();
        assert_eq!(result.risk_factors["payment_method_risk"], 25);
    }

    #[test]
    fn test_missing_token_raises_payment_method_risk() {
        let engine = RiskEngine::new();
        let mut p = payment("25.00");
        p.payment_method.token = String::new();
        let result = engine
            .assess(&p, &cart("25.00"), &intent("100.00"), 0, Utc::now())
            .unwrap();
        assert!(result.risk_factors["payment_method_risk"] >= 15);
    }

    #[test]
    fn test_po_box_and_express_shipping() {
        let engine = RiskEngine::new();
        let mut c = cart("25.00");
        c.shipping.address.street = "PO Box 42".into();
        c.shipping.method = "express".into();
        let result = engine
            .assess(&payment("25.00"), &c, &intent("100.00"), 0, Utc::now())
            .unwrap();
        assert_eq!(result.risk_factors["shipping_risk"], 20);
        assert!(result
            .fraud_indicators
            .contains(&"shipping_address_risk".to_string()));
    }

    #[test]
    fn test_instant_payment_is_suspicious() {
        let engine = RiskEngine::new();
        let mut i = intent("100.00");
        i.created_at = Utc::now();
        let mut p = payment("25.00");
        p.created_at = i.created_at + Duration::seconds(2);
        let result = engine.assess(&p, &cart("25.00"), &i, 0, Utc::now()).unwrap();
        assert_eq!(result.risk_factors["temporal_risk"], 15);
        assert!(result
            .fraud_indicators
            .contains(&"suspicious_timing".to_string()));
    }

    #[test]
    fn test_velocity_raises_pattern_risk() {
        let engine = RiskEngine::new();
        let now = Utc::now();
        for _ in 0..5 {
            engine.record("user_001", &Decimal::from(20), now - Duration::hours(1));
        }

        let result = engine
            .assess(&payment("25.00"), &cart("25.00"), &intent("100.00"), 0, now)
            .unwrap();
        assert_eq!(result.risk_factors["pattern_risk"], 30);
        assert!(result
            .fraud_indicators
            .contains(&"unusual_transaction_pattern".to_string()));
    }

    #[test]
    fn test_new_payer_has_baseline_pattern_risk() {
        let engine = RiskEngine::new();
        let result = engine
            .assess(&payment("25.00"), &cart("25.00"), &intent("100.00"), 0, Utc::now())
            .unwrap();
        assert_eq!(result.risk_factors["pattern_risk"], 15);
    }

    #[test]
    fn test_amount_bands_monotonic() {
        let engine = RiskEngine::new();
        let mut previous = 0;
        for value in ["10.00", "60.00", "150.00", "600.00", "1500.00", "6000.00", "15000.00"] {
            let i = intent("20000.00");
            let result = engine
                .assess(&payment(value), &cart(value), &i, 0, Utc::now())
                .unwrap();
            let band = result.risk_factors["amount_risk"];
            assert!(band >= previous, "band for {value} regressed");
            previous = band;
        }
    }

    #[test]
    fn test_score_is_clamped() {
        let engine = RiskEngine::new();
        // Worst case everything: huge amount, violation, CNP, expired card,
        // PO box, instant.
        let mut i = intent("100.00");
        i.created_at = Utc::now();
        let mut p = payment("15000.00");
        p.transaction_type = TransactionType::UserNotPresent;
        p.payment_method.expiry_year = 2020;
        p.payment_method.token = String::new();
        p.created_at = i.created_at + Duration::seconds(1);
        let mut c = cart("15000.00");
        c.shipping.address.street = "PO Box 1".into();

        let result = engine.assess(&p, &c, &i, 0, Utc::now()).unwrap();
        assert!(result.risk_score <= 100);
        assert!(result.risk_score >= 30);
    }
}
