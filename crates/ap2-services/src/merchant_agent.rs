//! The merchant agent: drafts cart candidates from merchant inventory.
//!
//! Candidate generation is deterministic and repeatable. Up to three
//! strategies run over the products matching the intent:
//!
//! - *popular*: the first 3 by the catalog's ranking key
//! - *budget*: the 3 cheapest
//! - *premium*: the 2 most expensive
//!
//! Each strategy aggregates into one cart with quantity 1 per item,
//! skipping any product that would push the running total past the
//! intent's `max_amount`. Empty strategies are omitted. Candidate signing
//! fans out in parallel; individual failures are logged and dropped as
//! long as at least one candidate survives.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use ap2_common::{Amount, ErrorCode, ProtocolError};
use ap2_a2a::{types, HandlerOutcome, MessageHandler};
use ap2_mandate::crypto::keys::AgentKeys;
use ap2_mandate::mandate::hash::mandate_hash;
use ap2_mandate::{Address, CartItem, CartMandate, IntentMandate, ShippingInfo};

use crate::catalog::{Product, ProductCatalog};
use crate::merchant::SignOutcome;
use crate::wire::{CartCandidate, CartCandidates, CartRequest, PaymentRequest, TransactionResult};

/// How long a drafted cart stays valid.
const CART_TTL_MINUTES: i64 = 30;

/// Seam to the merchant's signing surface (in-process or A2A/HTTP).
#[async_trait]
pub trait CartSigner: Send + Sync {
    async fn sign_cart(&self, cart: CartMandate) -> Result<SignOutcome, ProtocolError>;
}

/// In-process signer wrapping a co-hosted merchant service.
pub struct LocalCartSigner(pub Arc<crate::merchant::MerchantService>);

#[async_trait]
impl CartSigner for LocalCartSigner {
    async fn sign_cart(&self, cart: CartMandate) -> Result<SignOutcome, ProtocolError> {
        self.0.sign_cart(cart)
    }
}

/// Seam to the payment processor's authorization surface.
#[async_trait]
pub trait PaymentPort: Send + Sync {
    async fn authorize(&self, request: PaymentRequest) -> Result<TransactionResult, ProtocolError>;
}

/// Acts for one merchant: searches inventory, drafts carts, relays
/// payments.
pub struct MerchantAgentService {
    did: String,
    merchant_id: String,
    merchant_name: String,
    catalog: ProductCatalog,
    signer: Arc<dyn CartSigner>,
    payments: Arc<dyn PaymentPort>,
    tax_rate: Decimal,
    shipping_cost: Amount,
    shipping_address: Address,
}

impl MerchantAgentService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        did: impl Into<String>,
        merchant_id: impl Into<String>,
        merchant_name: impl Into<String>,
        catalog: ProductCatalog,
        signer: Arc<dyn CartSigner>,
        payments: Arc<dyn PaymentPort>,
        tax_rate: Decimal,
        shipping_cost: Amount,
    ) -> Self {
        Self {
            did: did.into(),
            merchant_id: merchant_id.into(),
            merchant_name: merchant_name.into(),
            catalog,
            signer,
            payments,
            tax_rate,
            shipping_cost,
            shipping_address: Address {
                street: "123 Main St".into(),
                city: "San Francisco".into(),
                state: "CA".into(),
                postal_code: "94105".into(),
                country: "US".into(),
            },
        }
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    pub fn catalog(&self) -> &ProductCatalog {
        &self.catalog
    }

    /// Produce signed cart candidates for an intent.
    pub async fn cart_candidates(
        &self,
        intent: &IntentMandate,
    ) -> Result<Vec<CartCandidate>, ProtocolError> {
        if intent.is_expired(Utc::now()) {
            return Err(ProtocolError::expired(
                ErrorCode::ExpiredIntent,
                &intent.id,
                &intent.expires_at.to_rfc3339(),
            ));
        }

        let drafts = self.draft_candidates(intent)?;
        if drafts.is_empty() {
            return Err(ProtocolError::new(
                ErrorCode::InvalidRequest,
                "no products match the intent",
            )
            .with_detail("intent_mandate_id", &intent.id));
        }

        // Fan out to the merchant; drop individual failures.
        let signings = drafts.into_iter().map(|cart| {
            let signer = Arc::clone(&self.signer);
            async move {
                let cart_id = cart.id.clone();
                match signer.sign_cart(cart.clone()).await {
                    Ok(SignOutcome::Signed(signed)) => Some(CartCandidate::Signed { cart: signed }),
                    Ok(SignOutcome::Pending { .. }) => Some(CartCandidate::Pending { cart }),
                    Err(error) => {
                        tracing::warn!(
                            cart_mandate_id = %cart_id,
                            code = %error.error_code,
                            "candidate dropped: merchant refused to sign"
                        );
                        None
                    }
                }
            }
        });
        let candidates: Vec<CartCandidate> = futures::future::join_all(signings)
            .await
            .into_iter()
            .flatten()
            .collect();

        if candidates.is_empty() {
            return Err(ProtocolError::new(
                ErrorCode::CartRejected,
                "merchant signed none of the candidates",
            )
            .with_detail("intent_mandate_id", &intent.id));
        }
        Ok(candidates)
    }

    /// Build one cart for an explicit item list.
    pub async fn build_cart(
        &self,
        request: &CartRequest,
    ) -> Result<CartCandidate, ProtocolError> {
        let mut items = Vec::new();
        for (product_id, quantity) in &request.items {
            let product = self.catalog.get(product_id).ok_or_else(|| {
                ProtocolError::new(ErrorCode::InvalidRequest, "unknown product")
                    .with_detail("product_id", product_id)
            })?;
            items.push(self.cart_item(product, *quantity));
        }

        let cart = self.assemble_cart(
            &request.intent_mandate,
            items,
            request.shipping_method.as_deref().unwrap_or("standard"),
        )?;

        match self.signer.sign_cart(cart.clone()).await? {
            SignOutcome::Signed(signed) => Ok(CartCandidate::Signed { cart: signed }),
            SignOutcome::Pending { .. } => Ok(CartCandidate::Pending { cart }),
        }
    }

    /// Relay a payment request to the processor.
    pub async fn submit_payment(
        &self,
        request: PaymentRequest,
    ) -> Result<TransactionResult, ProtocolError> {
        self.payments.authorize(request).await
    }

    /// The three strategy drafts, unsigned.
    fn draft_candidates(
        &self,
        intent: &IntentMandate,
    ) -> Result<Vec<CartMandate>, ProtocolError> {
        let matching = self.catalog.search(&intent.intent, &intent.constraints);
        if matching.is_empty() {
            return Ok(Vec::new());
        }

        let mut popular = matching.clone();
        popular.sort_by(|a, b| b.popularity.cmp(&a.popularity));
        let popular: Vec<&Product> = popular.into_iter().take(3).collect();

        let mut budget = matching.clone();
        budget.sort_by(|a, b| a.price.value.cmp(&b.price.value));
        let budget: Vec<&Product> = budget.into_iter().take(3).collect();

        let mut premium = matching;
        premium.sort_by(|a, b| b.price.value.cmp(&a.price.value));
        let premium: Vec<&Product> = premium.into_iter().take(2).collect();

        let mut drafts = Vec::new();
        for strategy in [popular, budget, premium] {
            let items = self.within_budget(&strategy, intent);
            if items.is_empty() {
                continue;
            }
            let cart = self.assemble_cart(intent, items, "standard")?;
            drafts.push(cart);
        }
        Ok(drafts)
    }

    /// Take strategy products in order, skipping any that would push the
    /// running total past the intent's budget.
    fn within_budget(&self, products: &[&Product], intent: &IntentMandate) -> Vec<CartItem> {
        let mut items = Vec::new();
        let mut running = Decimal::ZERO;
        for product in products {
            if let Some(max) = &intent.constraints.max_amount {
                if running + product.price.value > max.value {
                    continue;
                }
            }
            running += product.price.value;
            items.push(self.cart_item(product, 1));
        }
        items
    }

    fn cart_item(&self, product: &Product, quantity: u32) -> CartItem {
        CartItem {
            id: product.id.clone(),
            name: product.name.clone(),
            quantity,
            unit_price: product.price.clone(),
            total_price: product.price.mul_quantity(quantity),
            category: Some(product.category.clone()),
            brand: Some(product.brand.clone()),
            sku: product.sku.clone(),
        }
    }

    fn assemble_cart(
        &self,
        intent: &IntentMandate,
        items: Vec<CartItem>,
        shipping_method: &str,
    ) -> Result<CartMandate, ProtocolError> {
        let currency = items
            .first()
            .map(|i| i.unit_price.currency.clone())
            .unwrap_or_else(|| "USD".to_string());

        let mut subtotal = Amount::zero(currency.clone());
        for item in &items {
            subtotal = subtotal.checked_add(&item.total_price).map_err(|e| {
                ProtocolError::new(ErrorCode::InvalidAmount, e.to_string())
            })?;
        }
        let tax = subtotal.mul_rate_rounded(self.tax_rate);
        let shipping_cost = self.shipping_cost.clone();
        let total = subtotal
            .checked_add(&tax)
            .and_then(|t| t.checked_add(&shipping_cost))
            .map_err(|e| ProtocolError::new(ErrorCode::InvalidAmount, e.to_string()))?;

        let now = Utc::now();
        Ok(CartMandate {
            id: format!("cart_{}", &Uuid::new_v4().simple().to_string()[..12]),
            mandate_type: "CartMandate".into(),
            version: "0.1".into(),
            intent_mandate_id: intent.id.clone(),
            items,
            subtotal,
            tax,
            shipping: ShippingInfo {
                address: self.shipping_address.clone(),
                method: shipping_method.to_string(),
                cost: shipping_cost,
                estimated_delivery: Some((now + Duration::days(7)).format("%Y-%m-%d").to_string()),
            },
            total,
            merchant_id: self.merchant_id.clone(),
            merchant_name: self.merchant_name.clone(),
            created_at: now,
            expires_at: now + Duration::minutes(CART_TTL_MINUTES),
            merchant_signature: None,
            user_signature: None,
            intent_mandate_hash: mandate_hash(intent).map_err(|e| {
                ProtocolError::new(ErrorCode::InternalError, "canonicalization failed")
                    .with_detail("reason", e.to_string())
            })?,
            mandate_metadata: None,
        })
    }

    /// Register the merchant agent's A2A surface.
    pub fn register_handlers(self: &Arc<Self>, handler: &mut MessageHandler) {
        let service = Arc::clone(self);
        handler.register_fn(types::INTENT_MANDATE, move |message| {
            let service = Arc::clone(&service);
            async move {
                let intent: IntentMandate =
                    parse_payload(&message.data_part.payload, "intent mandate")?;
                let candidates = service.cart_candidates(&intent).await?;
                Ok(HandlerOutcome::new(
                    types::CART_CANDIDATES,
                    intent.id,
                    serde_json::to_value(CartCandidates { candidates }).unwrap_or_default(),
                ))
            }
        });

        let service = Arc::clone(self);
        handler.register_fn(types::PRODUCT_SEARCH, move |message| {
            let service = Arc::clone(&service);
            async move {
                let search: crate::wire::ProductSearch =
                    parse_payload(&message.data_part.payload, "product search")?;
                let constraints = ap2_mandate::IntentConstraints::default();
                let hits: Vec<&Product> = service
                    .catalog
                    .search(&search.query, &constraints)
                    .into_iter()
                    .take(search.limit.unwrap_or(10))
                    .collect();
                Ok(HandlerOutcome::new(
                    types::PRODUCT_LIST,
                    message.data_part.id.clone(),
                    serde_json::json!({ "products": hits }),
                ))
            }
        });

        let service = Arc::clone(self);
        handler.register_fn(types::CART_REQUEST, move |message| {
            let service = Arc::clone(&service);
            async move {
                let request: CartRequest =
                    parse_payload(&message.data_part.payload, "cart request")?;
                let candidate = service.build_cart(&request).await?;
                let (data_type, cart) = match &candidate {
                    CartCandidate::Signed { cart } => (types::SIGNED_CART_MANDATE, cart),
                    CartCandidate::Pending { cart } => (types::CART_MANDATE_PENDING, cart),
                };
                Ok(HandlerOutcome::new(
                    data_type,
                    cart.id.clone(),
                    serde_json::to_value(&candidate).unwrap_or_default(),
                ))
            }
        });

        let service = Arc::clone(self);
        handler.register_fn(types::CART_SELECTION, move |message| {
            let _service = Arc::clone(&service);
            async move {
                // Selection is informational; the binding act is the payment.
                Ok(HandlerOutcome::new(
                    types::ACKNOWLEDGEMENT,
                    message.data_part.id.clone(),
                    serde_json::json!({ "acknowledged": true }),
                ))
            }
        });

        let service = Arc::clone(self);
        handler.register_fn(types::PAYMENT_MANDATE, move |message| {
            let service = Arc::clone(&service);
            async move {
                let request: PaymentRequest =
                    parse_payload(&message.data_part.payload, "payment request")?;
                let payment_id = request.payment_mandate.id.clone();
                let result = service.submit_payment(request).await?;
                Ok(HandlerOutcome::new(
                    types::PAYMENT_RESULT,
                    payment_id,
                    serde_json::to_value(&result).unwrap_or_default(),
                ))
            }
        });
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    payload: &serde_json::Value,
    what: &str,
) -> Result<T, ProtocolError> {
    serde_json::from_value(payload.clone()).map_err(|e| {
        ProtocolError::new(ErrorCode::InvalidRequest, format!("payload is not a {what}"))
            .with_detail("reason", e.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merchant::MerchantService;
    use ap2_common::money::amount;
    use ap2_mandate::{IntentConstraints, MandateMetadata};

    struct NoPayments;

    #[async_trait]
    impl PaymentPort for NoPayments {
        async fn authorize(
            &self,
            _request: PaymentRequest,
        ) -> Result<TransactionResult, ProtocolError> {
            Err(ProtocolError::new(
                ErrorCode::InternalError,
                "not wired in this test",
            ))
        }
    }

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
                categories: Some(vec!["shoes".into()]),
                max_transactions: 1,
                ..Default::default()
            },
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::hours(24),
            user_signature: None,
            mandate_metadata: Some(MandateMetadata::issue("did:ap2:agent:sa", None)),
            agent_signal: None,
            risk_payload: None,
        }
    }

    fn agent(manual: bool, tax_rate: &str) -> (Arc<MerchantAgentService>, Arc<MerchantService>) {
        let merchant = Arc::new(MerchantService::new(
            "merchant_001",
            "did:ap2:merchant:zephyr",
            Arc::new(AgentKeys::generate()),
            manual,
        ));
        for product in ProductCatalog::seeded().all() {
            merchant.stock(&product.id, 10);
        }
        let agent = Arc::new(MerchantAgentService::new(
            "did:ap2:agent:merchant_agent",
            "merchant_001",
            "Zephyr Running",
            ProductCatalog::seeded(),
            Arc::new(LocalCartSigner(Arc::clone(&merchant))),
            Arc::new(NoPayments),
            tax_rate.parse().unwrap(),
            amount("0.00", "USD"),
        ));
        (agent, merchant)
    }

    #[tokio::test]
    async fn test_candidates_are_signed_and_within_budget() {
        let (agent, _) = agent(false, "0");
        let candidates = agent.cart_candidates(&intent("100.00")).await.unwrap();

        assert!(!candidates.is_empty());
        assert!(candidates.len() <= 3);
        for candidate in &candidates {
            let CartCandidate::Signed { cart } = candidate else {
                panic!("expected signed candidates in auto mode");
            };
            assert!(cart.merchant_signature.is_some());
            assert!(!cart.total.gt(&amount("100.00", "USD")).unwrap());
            cart.verify_arithmetic().unwrap();
        }
    }

    #[tokio::test]
    async fn test_first_candidate_is_popular_strategy() {
        let (agent, _) = agent(false, "0");
        let candidates = agent.cart_candidates(&intent("100.00")).await.unwrap();

        // Popular leads with the best-selling in-budget shoe at 89.99.
        let first = candidates[0].cart();
        assert_eq!(first.items[0].id, "prod_001");
        assert!(first.total.eq_exact(&amount("89.99", "USD")));
    }

    #[tokio::test]
    async fn test_candidates_deterministic() {
        let (agent, _) = agent(false, "0");
        let a = agent.cart_candidates(&intent("100.00")).await.unwrap();
        let b = agent.cart_candidates(&intent("100.00")).await.unwrap();

        let items = |cs: &[CartCandidate]| -> Vec<Vec<String>> {
            cs.iter()
                .map(|c| c.cart().items.iter().map(|i| i.id.clone()).collect())
                .collect()
        };
        assert_eq!(items(&a), items(&b));
    }

    #[tokio::test]
    async fn test_no_matching_products_is_error() {
        let (agent, _) = agent(false, "0");
        let mut i = intent("100.00");
        i.constraints.brands = Some(vec!["Nonexistent".into()]);
        let err = agent.cart_candidates(&i).await.unwrap_err();
        assert_eq!(err.error_code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_expired_intent_rejected() {
        let (agent, _) = agent(false, "0");
        let mut i = intent("100.00");
        i.expires_at = Utc::now() - Duration::seconds(1);
        let err = agent.cart_candidates(&i).await.unwrap_err();
        assert_eq!(err.error_code, ErrorCode::ExpiredIntent);
    }

    #[tokio::test]
    async fn test_manual_merchant_yields_pending_candidates() {
        let (agent, _) = agent(true, "0");
        let candidates = agent.cart_candidates(&intent("100.00")).await.unwrap();
        assert!(candidates
            .iter()
            .all(|c| matches!(c, CartCandidate::Pending { .. })));
    }

    #[tokio::test]
    async fn test_tax_applied_half_up() {
        let (agent, _) = agent(false, "0.0825");
        let request = CartRequest {
            intent_mandate: intent("200.00"),
            items: vec![("prod_001".into(), 1)],
            shipping_method: None,
        };
        let candidate = agent.build_cart(&request).await.unwrap();
        let cart = candidate.cart();
        // 89.99 * 0.0825 = 7.424175 -> 7.42
        assert!(cart.tax.eq_exact(&amount("7.42", "USD")));
        assert!(cart.total.eq_exact(&amount("97.41", "USD")));
        cart.verify_arithmetic().unwrap();
    }
}
