//! The five AP2 role services.
//!
//! Each role is an independent HTTP service built from the same pieces: an
//! identity (DID + key pairs), an A2A [`MessageHandler`] mounted at
//! `POST /a2a/message`, a health endpoint, and an agent card under
//! `/.well-known/`. Roles talk to each other only through signed A2A
//! envelopes; the in-process adapters used by the reference flow and the
//! tests go through exactly the same handler pipeline.
//!
//! [`MessageHandler`]: ap2_a2a::MessageHandler

pub mod card;
pub mod catalog;
pub mod client;
pub mod credential_provider;
pub mod events;
pub mod http;
pub mod merchant;
pub mod merchant_agent;
pub mod payment_processor;
pub mod remote;
pub mod shopping_agent;
pub mod wire;

pub use card::AgentCard;
pub use catalog::{Product, ProductCatalog};
pub use credential_provider::CredentialProviderService;
pub use merchant::MerchantService;
pub use merchant_agent::MerchantAgentService;
pub use payment_processor::PaymentProcessorService;
pub use shopping_agent::ShoppingAgentService;
