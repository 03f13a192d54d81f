//! Command-line surface for `ap2d`.
//!
//! One subcommand per role. Everything is overridable from the
//! environment so a docker-compose of five roles only differs in env.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ap2d", about = "AP2 reference role services", version)]
pub struct Cli {
    #[command(subcommand)]
    pub role: Role,
}

/// Options shared by every role service.
#[derive(Args, Clone)]
pub struct CommonOpts {
    /// Listen address.
    #[arg(long, env = "AP2_LISTEN", default_value = "127.0.0.1:0")]
    pub listen: SocketAddr,

    /// Directory holding the agents' key files.
    #[arg(long, env = "AP2_KEYS_DIR", default_value = "./keys")]
    pub keys_dir: PathBuf,

    /// Passphrase protecting private keys at rest.
    #[arg(long, env = "AP2_PASSPHRASE", default_value = "ap2-dev-passphrase")]
    pub passphrase: String,

    /// Directory for databases (ledger, DID cache, transactions).
    #[arg(long, env = "AP2_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Central DID registry base URL, if one is deployed.
    #[arg(long, env = "AP2_REGISTRY_URL")]
    pub registry_url: Option<String>,
}

#[derive(Subcommand)]
pub enum Role {
    /// Run the merchant service.
    Merchant {
        #[command(flatten)]
        common: CommonOpts,

        /// Defer signing until an operator approves each cart.
        #[arg(long, env = "AP2_MANUAL_APPROVAL")]
        manual_approval: bool,
    },

    /// Run the merchant agent.
    MerchantAgent {
        #[command(flatten)]
        common: CommonOpts,

        /// Merchant service base URL.
        #[arg(long, env = "AP2_MERCHANT_URL", default_value = "http://127.0.0.1:9101")]
        merchant_url: String,

        /// Payment processor base URL.
        #[arg(long, env = "AP2_PROCESSOR_URL", default_value = "http://127.0.0.1:9104")]
        processor_url: String,

        /// Sales tax rate applied to drafted carts (e.g. 0.0825).
        #[arg(long, env = "AP2_TAX_RATE", default_value = "0")]
        tax_rate: rust_decimal::Decimal,
    },

    /// Run the credential provider.
    CredentialProvider {
        #[command(flatten)]
        common: CommonOpts,

        /// OTP threshold; must not exceed the risk decline threshold (80).
        #[arg(long, env = "AP2_OTP_THRESHOLD", default_value_t = 60)]
        otp_threshold: u8,

        /// Seed a demo card with this last4 for user_001.
        #[arg(long, env = "AP2_DEMO_CARD_LAST4", default_value = "4242")]
        demo_card_last4: String,
    },

    /// Run the payment processor.
    PaymentProcessor {
        #[command(flatten)]
        common: CommonOpts,

        /// Credential provider base URL.
        #[arg(long, env = "AP2_CREDENTIAL_PROVIDER_URL", default_value = "http://127.0.0.1:9103")]
        credential_provider_url: String,
    },

    /// Drive one reference purchase against running peers.
    ShoppingAgent {
        #[command(flatten)]
        common: CommonOpts,

        /// Merchant agent base URL.
        #[arg(long, env = "AP2_MERCHANT_AGENT_URL", default_value = "http://127.0.0.1:9102")]
        merchant_agent_url: String,

        /// Merchant service base URL (cart status polling).
        #[arg(long, env = "AP2_MERCHANT_URL", default_value = "http://127.0.0.1:9101")]
        merchant_url: String,

        /// Credential provider base URL.
        #[arg(long, env = "AP2_CREDENTIAL_PROVIDER_URL", default_value = "http://127.0.0.1:9103")]
        credential_provider_url: String,

        /// Free-text shopping intent.
        #[arg(long, default_value = "buy running shoes under 100 USD")]
        intent: String,

        /// Budget ceiling in USD.
        #[arg(long, default_value = "100.00")]
        max_amount: rust_decimal::Decimal,

        /// One-time password to attach, for high-risk retries.
        #[arg(long)]
        otp: Option<String>,
    },
}
