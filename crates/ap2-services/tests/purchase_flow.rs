//! End-to-end purchase flows across all five roles, wired in-process.
//!
//! The in-process adapters cross exactly the same seams the HTTP adapters
//! do, so these cover the canonical SA → MA → M → PP ordering, the OTP
//! challenge loop, deterministic card failures, and budget exhaustion.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use ap2_common::money::amount;
use ap2_common::ErrorCode;
use ap2_mandate::crypto::keys::AgentKeys;
use ap2_mandate::mandate::hash::mandate_hash;
use ap2_mandate::mandate::payment::user_authorization_token;
use ap2_mandate::{
    IntentConstraints, IntentMandate, PaymentMandate, PaymentMethod, TransactionType,
};
use ap2_services::credential_provider::CredentialProviderService;
use ap2_services::events::ChatEvent;
use ap2_services::merchant::MerchantService;
use ap2_services::merchant_agent::{LocalCartSigner, MerchantAgentService};
use ap2_services::payment_processor::{LocalCredentialSource, PaymentProcessorService, TransactionStore};
use ap2_services::shopping_agent::{
    LocalAuthenticator, LocalMerchantStatus, ShoppingAgentService, UserAuthenticator,
};
use ap2_services::wire::{CartCandidate, PaymentRequest, TransactionStatus};
use ap2_services::ProductCatalog;
use ap2_verifier::{TransactionLedger, Verifier};

struct Stack {
    sa: ShoppingAgentService,
    auth: LocalAuthenticator,
    merchant: Arc<MerchantService>,
    cp: Arc<CredentialProviderService>,
    pp: Arc<PaymentProcessorService>,
    ma: Arc<MerchantAgentService>,
}

fn stack(card_last4: &str, manual_approval: bool) -> Stack {
    let merchant = Arc::new(MerchantService::new(
        "merchant_001",
        "did:ap2:merchant:zephyr",
        Arc::new(AgentKeys::generate()),
        manual_approval,
    ));
    for product in ProductCatalog::seeded().all() {
        merchant.stock(&product.id, 10);
    }

    let cp = Arc::new(CredentialProviderService::new(
        "cp_001",
        "did:ap2:agent:credential_provider",
        Arc::new(AgentKeys::generate()),
        60,
    ));
    cp.register_method("user_001", "visa", card_last4, 12, 2030, "Demo User", true);

    let pp = Arc::new(PaymentProcessorService::new(
        "pp_001",
        "did:ap2:agent:payment_processor",
        Arc::new(AgentKeys::generate()),
        Verifier::offline(TransactionLedger::memory().unwrap()),
        Arc::new(LocalCredentialSource(Arc::clone(&cp))),
        TransactionStore::memory().unwrap(),
    ));

    let ma = Arc::new(MerchantAgentService::new(
        "did:ap2:agent:merchant_agent",
        "merchant_001",
        "Zephyr Running",
        ProductCatalog::seeded(),
        Arc::new(LocalCartSigner(Arc::clone(&merchant))),
        Arc::clone(&pp) as Arc<dyn ap2_services::merchant_agent::PaymentPort>,
        "0".parse().unwrap(),
        amount("0.00", "USD"),
    ));

    let sa = ShoppingAgentService::new(
        "did:ap2:agent:shopping_agent",
        Arc::new(AgentKeys::generate()),
        Arc::clone(&ma) as Arc<dyn ap2_services::shopping_agent::MerchantAgentPort>,
        Arc::clone(&cp) as Arc<dyn ap2_services::shopping_agent::CredentialProviderPort>,
        Arc::new(LocalMerchantStatus {
            service: Arc::clone(&merchant),
            backoff: StdDuration::from_millis(20),
            deadline: StdDuration::from_secs(2),
        }),
    );

    Stack {
        sa,
        auth: LocalAuthenticator::new("device_01"),
        merchant,
        cp,
        pp,
        ma,
    }
}

fn shoe_constraints(max_amount: &str, max_transactions: u32) -> IntentConstraints {
    IntentConstraints {
        max_amount: Some(amount(max_amount, "USD")),
        categories: Some(vec!["shoes".into()]),
        max_transactions,
        ..Default::default()
    }
}

// === S1: happy path ===

#[tokio::test]
async fn test_happy_path_authorize_capture_and_exhaust() {
    let stack = stack("4242", false);

    let intent = stack
        .sa
        .create_intent(
            &stack.auth,
            "user_001",
            "buy running shoes under 100 USD",
            shoe_constraints("100.00", 1),
        )
        .unwrap();

    let candidates = stack.ma.cart_candidates(&intent).await.unwrap();
    let CartCandidate::Signed { cart } = &candidates[0] else {
        panic!("expected signed candidate");
    };
    assert!(cart.total.eq_exact(&amount("89.99", "USD")));

    let result = stack
        .sa
        .pay_for_cart(&stack.auth, "user_001", &intent, cart, None, None)
        .await
        .unwrap();
    assert_eq!(result.status, TransactionStatus::Authorized);

    // Risk stayed low: user present, small amount, in budget.
    let row = stack.pp.store().get(&result.id).unwrap().unwrap();
    assert!(row.risk_score.unwrap() < 30);
    assert!(row.device_attested);

    let captured = stack.pp.capture(&result.id).unwrap();
    assert_eq!(captured.status, TransactionStatus::Captured);
    assert!(captured.receipt_url.unwrap().contains(&result.id));
    assert!(captured.captured_at.is_some());

    // Exactly one payment is in the ledger for this intent.
    assert_eq!(
        stack
            .pp
            .verifier()
            .ledger()
            .transaction_count(&intent.id)
            .unwrap(),
        1
    );

    // A second payment against the same single-use intent is refused.
    let err = stack
        .sa
        .pay_for_cart(&stack.auth, "user_001", &intent, cart, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.error_code, ErrorCode::ConstraintViolation);
}

#[tokio::test]
async fn test_full_run_purchase_emits_events() {
    let stack = stack("4242", false);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let result = stack
        .sa
        .run_purchase(
            &stack.auth,
            "user_001",
            "buy running shoes under 100 USD",
            shoe_constraints("100.00", 1),
            Some(&tx),
            None,
        )
        .await
        .unwrap();
    assert_eq!(result.status, TransactionStatus::Authorized);

    drop(tx);
    let mut kinds = Vec::new();
    while let Some(event) = rx.recv().await {
        kinds.push(match event {
            ChatEvent::AgentText { .. } => "agent_text",
            ChatEvent::SignatureRequest { .. } => "signature_request",
            ChatEvent::CartOptions { .. } => "cart_options",
            ChatEvent::WebauthnRequest { .. } => "webauthn_request",
            ChatEvent::PaymentMethodSelection { .. } => "payment_method_selection",
            ChatEvent::Done { .. } => "done",
            ChatEvent::Error { .. } => "error",
        });
    }
    for expected in [
        "agent_text",
        "signature_request",
        "cart_options",
        "payment_method_selection",
        "webauthn_request",
        "done",
    ] {
        assert!(kinds.contains(&expected), "missing event {expected}");
    }
    assert_eq!(*kinds.last().unwrap(), "done");
}

// === S4: deterministic card failure ===

#[tokio::test]
async fn test_failure_card_records_failed_transaction() {
    let stack = stack("0001", false);

    let result = stack
        .sa
        .run_purchase(
            &stack.auth,
            "user_001",
            "buy running shoes under 100 USD",
            shoe_constraints("100.00", 1),
            None,
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.status, TransactionStatus::Failed);
    assert_eq!(result.error_code, Some(ErrorCode::InsufficientFunds));

    // The ledger recorded a FAILED row; capture is impossible.
    let row = stack.pp.store().get(&result.id).unwrap().unwrap();
    assert_eq!(row.status, TransactionStatus::Failed);
    let err = stack.pp.capture(&result.id).unwrap_err();
    assert_eq!(err.error_code, ErrorCode::InvalidRequest);
}

// === S5: high-risk OTP challenge ===

/// Build a fully signed payment with a forced risk score, bypassing the
/// shopping agent's own risk engine.
fn forced_risk_payment(
    stack: &Stack,
    intent: &IntentMandate,
    cart: &ap2_mandate::CartMandate,
    token: &str,
    risk_score: u8,
) -> PaymentMandate {
    let mut payment = PaymentMandate {
        id: "payment_forced".into(),
        mandate_type: "PaymentMandate".into(),
        version: "0.1".into(),
        cart_mandate_id: cart.id.clone(),
        intent_mandate_id: intent.id.clone(),
        payment_method: PaymentMethod {
            method_type: "card".into(),
            token: token.into(),
            last4: "4242".into(),
            brand: "visa".into(),
            expiry_month: 12,
            expiry_year: 2030,
        },
        amount: cart.total.clone(),
        transaction_type: TransactionType::UserPresent,
        agent_involved: true,
        payer_id: "user_001".into(),
        payee_id: cart.merchant_id.clone(),
        created_at: Utc::now(),
        expires_at: Utc::now() + Duration::minutes(15),
        merchant_signature: cart.merchant_signature.clone(),
        user_signature: None,
        device_attestation: None,
        risk_score: None,
        fraud_indicators: Vec::new(),
        cart_mandate_hash: mandate_hash(cart).unwrap(),
        intent_mandate_hash: mandate_hash(intent).unwrap(),
        user_authorization: None,
        mandate_metadata: None,
    };
    payment.user_authorization = Some(user_authorization_token(cart, &payment).unwrap());
    payment.user_signature = Some(stack.auth.sign_payment(&payment).unwrap());
    payment.risk_score = Some(risk_score);
    payment
}

#[tokio::test]
async fn test_high_risk_otp_challenge_roundtrip() {
    let stack = stack("4242", false);

    let intent = stack
        .sa
        .create_intent(
            &stack.auth,
            "user_001",
            "buy running shoes under 100 USD",
            shoe_constraints("100.00", 1),
        )
        .unwrap();
    let candidates = stack.ma.cart_candidates(&intent).await.unwrap();
    let CartCandidate::Signed { cart } = &candidates[0] else {
        panic!("expected signed candidate");
    };

    let methods = stack.cp.list("user_001");
    let grant = stack.cp.tokenize("user_001", &methods[0].method_id).unwrap();
    let payment = forced_risk_payment(&stack, &intent, cart, &grant.token, 75);

    // First attempt: challenge required, with a fresh transaction id.
    let err = stack
        .pp
        .authorize(PaymentRequest {
            payment_mandate: payment.clone(),
            cart_mandate: cart.clone(),
            intent_mandate: intent.clone(),
            otp: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.error_code, ErrorCode::ChallengeRequired);
    let transaction_id = err.details["transaction_id"].as_str().unwrap().to_string();

    // Wrong OTP keeps the challenge open.
    let err = stack
        .pp
        .complete_challenge(&transaction_id, "000000")
        .await
        .unwrap_err();
    assert_eq!(err.error_code, ErrorCode::OtpInvalid);

    // Demo OTP completes the authorization.
    let result = stack
        .pp
        .complete_challenge(&transaction_id, "123456")
        .await
        .unwrap();
    assert_eq!(result.status, TransactionStatus::Authorized);

    // The challenge is consumed.
    let err = stack
        .pp
        .complete_challenge(&transaction_id, "123456")
        .await
        .unwrap_err();
    assert_eq!(err.error_code, ErrorCode::InvalidRequest);
}

// === Manual approval ===

#[tokio::test]
async fn test_manual_approval_polling() {
    let stack = stack("4242", true);
    let merchant = Arc::clone(&stack.merchant);

    // Operator approves whatever parks, shortly after it appears.
    let operator = tokio::spawn(async move {
        for _ in 0..50 {
            for cart_id in merchant.pending_carts() {
                let _ = merchant.approve(&cart_id);
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
    });

    let result = stack
        .sa
        .run_purchase(
            &stack.auth,
            "user_001",
            "buy running shoes under 100 USD",
            shoe_constraints("100.00", 1),
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(result.status, TransactionStatus::Authorized);
    operator.abort();
}

#[tokio::test]
async fn test_manual_rejection_terminates_flow() {
    let stack = stack("4242", true);
    let merchant = Arc::clone(&stack.merchant);

    let operator = tokio::spawn(async move {
        for _ in 0..50 {
            for cart_id in merchant.pending_carts() {
                let _ = merchant.reject(&cart_id);
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
    });

    let err = stack
        .sa
        .run_purchase(
            &stack.auth,
            "user_001",
            "buy running shoes under 100 USD",
            shoe_constraints("100.00", 1),
            None,
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code, ErrorCode::CartRejected);
    operator.abort();
}

// === Refunds ===

#[tokio::test]
async fn test_capture_then_refund_idempotent() {
    let stack = stack("4242", false);

    let result = stack
        .sa
        .run_purchase(
            &stack.auth,
            "user_001",
            "buy running shoes under 100 USD",
            shoe_constraints("100.00", 1),
            None,
            None,
        )
        .await
        .unwrap();

    // Refund before capture is invalid.
    let err = stack.pp.refund(&result.id, None).unwrap_err();
    assert_eq!(err.error_code, ErrorCode::InvalidRequest);

    stack.pp.capture(&result.id).unwrap();
    // Capture twice returns the same result.
    let again = stack.pp.capture(&result.id).unwrap();
    assert_eq!(again.status, TransactionStatus::Captured);

    // Over-refund is rejected while the transaction is still captured.
    let err = stack
        .pp
        .refund(&result.id, Some(amount("999.99", "USD")))
        .unwrap_err();
    assert_eq!(err.error_code, ErrorCode::InvalidAmount);

    let refunded = stack.pp.refund(&result.id, None).unwrap();
    assert_eq!(refunded.status, TransactionStatus::Refunded);
    let again = stack.pp.refund(&result.id, None).unwrap();
    assert_eq!(again.status, TransactionStatus::Refunded);
}
