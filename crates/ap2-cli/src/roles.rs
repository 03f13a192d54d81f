//! Role wiring: keys, DID resolution, handlers, routers.
//!
//! Each role loads (or generates) its key pairs from the shared key
//! directory, publishes its DID document into the in-process registry,
//! and picks up every peer whose public keys are present in the same
//! directory - the reference deployment shares one `keys/` volume, a
//! central registry covers the distributed case.

use std::sync::Arc;

use anyhow::Context as _;

use ap2_a2a::did::{DidCache, DidDocument, DidResolver, RegistryClient};
use ap2_a2a::{MessageHandler, NonceManager};
use ap2_common::money::amount;
use ap2_mandate::crypto::keys::{AgentKeys, KeyStore};
use ap2_mandate::crypto::sign::SignatureAlgorithm;
use ap2_mandate::IntentConstraints;
use ap2_services::card::AgentCard;
use ap2_services::client::A2aClient;
use ap2_services::credential_provider::{credential_provider_router, CredentialProviderService};
use ap2_services::http::{a2a_router, serve, A2aState};
use ap2_services::merchant::{merchant_router, MerchantService};
use ap2_services::merchant_agent::MerchantAgentService;
use ap2_services::payment_processor::{PaymentProcessorService, TransactionStore};
use ap2_services::remote::{
    HttpCartSigner, HttpCredentialProviderPort, HttpCredentialSource, HttpMerchantAgentPort,
    HttpMerchantStatusPort, HttpPaymentPort,
};
use ap2_services::shopping_agent::{LocalAuthenticator, ShoppingAgentService};
use ap2_services::ProductCatalog;
use ap2_verifier::{TransactionLedger, Verifier};

use crate::args::{Cli, CommonOpts, Role};

/// Key-file names of the five reference roles.
const KNOWN_AGENTS: &[(&str, &str)] = &[
    ("shopping_agent", "did:ap2:agent:shopping_agent"),
    ("merchant_agent", "did:ap2:agent:merchant_agent"),
    ("merchant", "did:ap2:merchant:main"),
    ("credential_provider", "did:ap2:agent:credential_provider"),
    ("payment_processor", "did:ap2:agent:payment_processor"),
];

pub async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.role {
        Role::Merchant {
            common,
            manual_approval,
        } => run_merchant(common, manual_approval).await,
        Role::MerchantAgent {
            common,
            merchant_url,
            processor_url,
            tax_rate,
        } => run_merchant_agent(common, merchant_url, processor_url, tax_rate).await,
        Role::CredentialProvider {
            common,
            otp_threshold,
            demo_card_last4,
        } => run_credential_provider(common, otp_threshold, demo_card_last4).await,
        Role::PaymentProcessor {
            common,
            credential_provider_url,
        } => run_payment_processor(common, credential_provider_url).await,
        Role::ShoppingAgent {
            common,
            merchant_agent_url,
            merchant_url,
            credential_provider_url,
            intent,
            max_amount,
            otp,
        } => {
            run_shopping_agent(
                common,
                merchant_agent_url,
                merchant_url,
                credential_provider_url,
                intent,
                max_amount,
                otp,
            )
            .await
        }
    }
}

struct Identity {
    did: String,
    keys: Arc<AgentKeys>,
    resolver: Arc<DidResolver>,
}

/// Load this role's keys and build a resolver that already knows every
/// peer present in the shared key directory.
fn identity(common: &CommonOpts, key_name: &str, did: &str) -> anyhow::Result<Identity> {
    let store = KeyStore::open(&common.keys_dir);
    let keys = Arc::new(
        store
            .load_or_generate(key_name, &common.passphrase)
            .with_context(|| format!("loading keys for {key_name}"))?,
    );

    std::fs::create_dir_all(&common.data_dir).context("creating data dir")?;
    let cache = DidCache::open(&common.data_dir.join("did_cache.db"))
        .map_err(|e| anyhow::anyhow!("opening DID cache: {e}"))?;

    let mut resolver = DidResolver::in_process().with_cache(cache);
    if let Some(url) = &common.registry_url {
        resolver = resolver.with_central(RegistryClient::new(url.clone()));
    }

    for (peer_name, peer_did) in KNOWN_AGENTS {
        let ed = store.load_public_pem(peer_name, SignatureAlgorithm::Ed25519);
        let p256 = store.load_public_pem(peer_name, SignatureAlgorithm::EcdsaP256Sha256);
        if let Ok(ed_pem) = ed {
            resolver.register(DidDocument::for_agent(peer_did, &ed_pem, p256.ok().as_deref()));
        }
    }

    Ok(Identity {
        did: did.to_string(),
        keys,
        resolver: Arc::new(resolver),
    })
}

fn handler_for(identity: &Identity) -> MessageHandler {
    MessageHandler::new(
        identity.did.clone(),
        Arc::clone(&identity.keys),
        Arc::clone(&identity.resolver),
        Arc::new(NonceManager::default()),
    )
}

async fn run_merchant(common: CommonOpts, manual_approval: bool) -> anyhow::Result<()> {
    let identity = identity(&common, "merchant", "did:ap2:merchant:main")?;
    let merchant = Arc::new(MerchantService::new(
        "merchant_001",
        identity.did.clone(),
        Arc::clone(&identity.keys),
        manual_approval,
    ));
    for product in ProductCatalog::seeded().all() {
        merchant.stock(&product.id, 25);
    }

    // Expired pending carts release their reservations on a slow sweep.
    let sweeper = Arc::clone(&merchant);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            sweeper.release_expired(chrono::Utc::now());
        }
    });

    let mut handler = handler_for(&identity);
    merchant.register_handlers(&mut handler);

    let card = AgentCard::new("ap2-merchant", "AP2 reference merchant", &["merchant"]);
    let router = a2a_router(A2aState {
        handler: Arc::new(handler),
        card: Arc::new(card),
    })
    .merge(merchant_router(merchant));

    serve(router, common.listen).await.context("merchant server")
}

async fn run_merchant_agent(
    common: CommonOpts,
    merchant_url: String,
    processor_url: String,
    tax_rate: rust_decimal::Decimal,
) -> anyhow::Result<()> {
    let identity = identity(&common, "merchant_agent", "did:ap2:agent:merchant_agent")?;
    let client = A2aClient::new(identity.did.clone(), Arc::clone(&identity.keys));

    let agent = Arc::new(MerchantAgentService::new(
        identity.did.clone(),
        "merchant_001",
        "Zephyr Running",
        ProductCatalog::seeded(),
        Arc::new(HttpCartSigner {
            client: client.clone(),
            base_url: merchant_url,
            did: "did:ap2:merchant:main".to_string(),
        }),
        Arc::new(HttpPaymentPort {
            client,
            base_url: processor_url,
            did: "did:ap2:agent:payment_processor".to_string(),
        }),
        tax_rate,
        amount("0.00", "USD"),
    ));

    let mut handler = handler_for(&identity);
    agent.register_handlers(&mut handler);

    let card = AgentCard::new(
        "ap2-merchant-agent",
        "AP2 reference merchant agent",
        &["merchant_agent"],
    );
    let router = a2a_router(A2aState {
        handler: Arc::new(handler),
        card: Arc::new(card),
    });

    serve(router, common.listen)
        .await
        .context("merchant agent server")
}

async fn run_credential_provider(
    common: CommonOpts,
    otp_threshold: u8,
    demo_card_last4: String,
) -> anyhow::Result<()> {
    let identity = identity(
        &common,
        "credential_provider",
        "did:ap2:agent:credential_provider",
    )?;
    let provider = Arc::new(CredentialProviderService::new(
        "cp_001",
        identity.did.clone(),
        Arc::clone(&identity.keys),
        otp_threshold,
    ));
    provider.register_method("user_001", "visa", &demo_card_last4, 12, 2030, "Demo User", true);

    let sweeper = Arc::clone(&provider);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            sweeper.sweep_tokens(chrono::Utc::now());
        }
    });

    let mut handler = handler_for(&identity);
    provider.register_handlers(&mut handler);

    let card = AgentCard::new(
        "ap2-credential-provider",
        "AP2 reference credential provider",
        &["credential_provider"],
    );
    let router = a2a_router(A2aState {
        handler: Arc::new(handler),
        card: Arc::new(card),
    })
    .merge(credential_provider_router(provider));

    serve(router, common.listen)
        .await
        .context("credential provider server")
}

async fn run_payment_processor(
    common: CommonOpts,
    credential_provider_url: String,
) -> anyhow::Result<()> {
    let identity = identity(
        &common,
        "payment_processor",
        "did:ap2:agent:payment_processor",
    )?;
    let client = A2aClient::new(identity.did.clone(), Arc::clone(&identity.keys));

    let ledger = TransactionLedger::open(&common.data_dir.join("ledger.db"))
        .map_err(|e| anyhow::anyhow!("opening ledger: {e}"))?;
    let store = TransactionStore::open(&common.data_dir.join("transactions.db"))
        .map_err(|e| anyhow::anyhow!("opening transaction store: {e}"))?;

    let processor = Arc::new(PaymentProcessorService::new(
        "pp_001",
        identity.did.clone(),
        Arc::clone(&identity.keys),
        Verifier::offline(ledger),
        Arc::new(HttpCredentialSource {
            client,
            base_url: credential_provider_url,
            did: "did:ap2:agent:credential_provider".to_string(),
        }),
        store,
    ));

    let mut handler = handler_for(&identity);
    processor.register_handlers(&mut handler);

    let card = AgentCard::new(
        "ap2-payment-processor",
        "AP2 reference payment processor",
        &["payment_processor"],
    );
    let router = a2a_router(A2aState {
        handler: Arc::new(handler),
        card: Arc::new(card),
    });

    serve(router, common.listen)
        .await
        .context("payment processor server")
}

#[allow(clippy::too_many_arguments)]
async fn run_shopping_agent(
    common: CommonOpts,
    merchant_agent_url: String,
    merchant_url: String,
    credential_provider_url: String,
    intent: String,
    max_amount: rust_decimal::Decimal,
    otp: Option<String>,
) -> anyhow::Result<()> {
    let identity = identity(&common, "shopping_agent", "did:ap2:agent:shopping_agent")?;
    let client = A2aClient::new(identity.did.clone(), Arc::clone(&identity.keys));

    let agent = ShoppingAgentService::new(
        identity.did.clone(),
        Arc::clone(&identity.keys),
        Arc::new(HttpMerchantAgentPort {
            client: client.clone(),
            base_url: merchant_agent_url,
            did: "did:ap2:agent:merchant_agent".to_string(),
        }),
        Arc::new(HttpCredentialProviderPort {
            client: client.clone(),
            base_url: credential_provider_url,
        }),
        Arc::new(HttpMerchantStatusPort {
            client,
            base_url: merchant_url,
        }),
    );

    let authenticator = LocalAuthenticator::new("device_cli");
    let constraints = IntentConstraints {
        max_amount: Some(ap2_common::Amount::new(max_amount, "USD")),
        max_transactions: 1,
        ..Default::default()
    };

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(error = %e, "unprintable event"),
            }
        }
    });

    let result = agent
        .run_purchase(&authenticator, "user_001", &intent, constraints, Some(&tx), otp.as_deref())
        .await;
    drop(tx);
    let _ = printer.await;

    match result {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(error) => anyhow::bail!("purchase failed: {error}"),
    }
}
